//! End-to-end flows through the real component wiring: memory ledger →
//! reconciliation loop → store → coordinator/query.
//!
//! The suite covers the full two-bidder settlement scenario, duplicate
//! delivery, journal-backed restart and the in-flight slot release on
//! confirmation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use sg_common::{Address, ListingKey, TicketTier};
use tokio::time::sleep;

use auction_service::coordinator::{ActionError, BidCoordinator, BidError};
use auction_service::journal::EventJournal;
use auction_service::ledger::memory::MemoryLedger;
use auction_service::ledger::{
    Cursor, EventBatch, EventId, LedgerError, LedgerEvent, LedgerEventKind, LedgerReader,
};
use auction_service::lifecycle::{AuctionStatus, Lifecycle, LifecycleRules};
use auction_service::query::{AuctionFilter, QueryFacade};
use auction_service::reconcile::{self, ReconcileOptions};
use auction_service::store::MarketStore;

fn addr(n: u8) -> Address {
    Address::new([n; 20])
}

fn key() -> ListingKey {
    ListingKey::new(addr(9), 1u64)
}

fn fast_options() -> ReconcileOptions {
    ReconcileOptions {
        poll_interval: Duration::from_millis(10),
        poll_timeout: Duration::from_millis(200),
        backoff_floor: Duration::from_millis(5),
        backoff_ceiling: Duration::from_millis(20),
    }
}

/// Rules with the anti-snipe extension disabled, so short-lived test
/// auctions reach their end time on schedule.
fn no_extension_rules() -> LifecycleRules {
    LifecycleRules {
        soft_close_window: ChronoDuration::zero(),
        extension_increment: ChronoDuration::seconds(300),
        max_extension_count: 0,
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn coordinator(store: &Arc<MarketStore>, ledger: &Arc<MemoryLedger>) -> Arc<BidCoordinator> {
    Arc::new(BidCoordinator::new(
        Arc::clone(store),
        Arc::clone(ledger) as Arc<dyn auction_service::ledger::TxSubmitter>,
        Duration::from_secs(1),
        Duration::from_secs(5),
    ))
}

#[tokio::test]
async fn end_to_end_two_bidder_settlement() {
    let ledger = Arc::new(MemoryLedger::with_auto_confirm_bids());
    let store = Arc::new(MarketStore::new(Lifecycle::new(no_extension_rules()), 1024));
    let coordinator = coordinator(&store, &ledger);
    let query = QueryFacade::new(Arc::clone(&store));

    let now = Utc::now();
    ledger.set_now(now);
    let end_time = now + ChronoDuration::seconds(3);

    ledger.push(LedgerEventKind::FundsDeposited {
        account: addr(2),
        event: addr(9),
        amount: 1_000,
    });
    ledger.push(LedgerEventKind::FundsDeposited {
        account: addr(3),
        event: addr(9),
        amount: 1_000,
    });
    ledger.push(LedgerEventKind::AuctionCreated {
        key: key(),
        seller: addr(1),
        starting_price: 10,
        reserve_price: 50,
        min_bid_increment: 5,
        start_time: now - ChronoDuration::seconds(1),
        end_time,
        tier: Some(TicketTier::Vip),
    });

    let loop_handle = reconcile::spawn(
        Arc::clone(&ledger) as Arc<dyn LedgerReader>,
        Arc::clone(&store),
        None,
        fast_options(),
    );
    wait_until(|| store.snapshot().auction(&key()).is_some()).await;

    // Two bids from different bidders, each confirmed through the loop.
    coordinator.submit_bid(key(), addr(2), 60).await.unwrap();
    wait_until(|| store.snapshot().auction(&key()).is_some_and(|a| a.highest_bid == 60)).await;

    coordinator.submit_bid(key(), addr(3), 70).await.unwrap();
    wait_until(|| store.snapshot().auction(&key()).is_some_and(|a| a.highest_bid == 70)).await;

    // The outbid first bidder got their stake back immediately.
    {
        let snapshot = store.snapshot();
        let outbid = snapshot.balance(addr(2), addr(9)).unwrap();
        assert_eq!((outbid.available, outbid.locked), (1_000, 0));
    }

    // Let the auction elapse, then settle it.
    sleep(Duration::from_millis(3_300)).await;
    coordinator.request_settle(addr(1), key()).await.unwrap();
    let settle_requests: Vec<_> = ledger
        .submissions()
        .into_iter()
        .filter(|tx| tx.method == "settleAuction")
        .collect();
    assert_eq!(settle_requests.len(), 1);

    // The contract settles and the events flow back through the mirror.
    ledger.set_now(Utc::now());
    ledger.push(LedgerEventKind::AuctionSettled {
        key: key(),
        winner: Some(addr(3)),
        amount: 70,
    });
    ledger.push(LedgerEventKind::OwnershipTransferred {
        key: key(),
        from: addr(1),
        to: addr(3),
    });
    wait_until(|| {
        store
            .snapshot()
            .auction(&key())
            .is_some_and(|a| a.status == AuctionStatus::Settled)
    })
    .await;

    let snapshot = store.snapshot();
    let auction = snapshot.auction(&key()).unwrap();
    assert_eq!(auction.highest_bidder, Some(addr(3)));
    assert_eq!(auction.highest_bid, 70);
    assert_eq!(auction.reserve_met, Some(true));
    assert_eq!(snapshot.owner(&key()), Some(addr(3)));

    let winner = snapshot.balance(addr(3), addr(9)).unwrap();
    assert_eq!((winner.available, winner.locked), (930, 0));
    let seller = snapshot.balance(addr(1), addr(9)).unwrap();
    assert_eq!(seller.profits, 70);

    // A replayed settle event is a no-op: no duplicate payout.
    ledger.push(LedgerEventKind::AuctionSettled {
        key: key(),
        winner: Some(addr(3)),
        amount: 70,
    });
    sleep(Duration::from_millis(100)).await;
    let snapshot = store.snapshot();
    assert_eq!(snapshot.balance(addr(1), addr(9)).unwrap().profits, 70);

    // And a settle request on the settled auction submits nothing further.
    coordinator.request_settle(addr(1), key()).await.unwrap();
    assert_eq!(
        ledger
            .submissions()
            .into_iter()
            .filter(|tx| tx.method == "settleAuction")
            .count(),
        1
    );

    // The settled auction no longer shows up as active.
    assert!(query.list_active(&AuctionFilter::default(), Utc::now()).is_empty());

    loop_handle.shutdown().await;
}

/// Reader that re-delivers the same batch on every poll, simulating a
/// reorg-safe feed that refuses to advance.
struct RepeatingReader {
    events: Vec<LedgerEvent>,
    next: Cursor,
}

#[async_trait::async_trait]
impl LedgerReader for RepeatingReader {
    async fn poll(&self, _since: Cursor) -> Result<EventBatch, LedgerError> {
        Ok(EventBatch {
            events: self.events.clone(),
            next: self.next,
        })
    }
}

#[tokio::test]
async fn repeated_delivery_is_absorbed_idempotently() {
    let now = Utc::now();
    let deposit = |block: u64, amount: u128| LedgerEvent {
        id: EventId::new(block, 0),
        at: now,
        kind: LedgerEventKind::FundsDeposited {
            account: addr(2),
            event: addr(9),
            amount,
        },
    };
    let reader = Arc::new(RepeatingReader {
        events: vec![deposit(1, 100), deposit(2, 50)],
        next: Cursor::after(EventId::new(2, 0)),
    });

    let store = Arc::new(MarketStore::new(Lifecycle::default(), 1024));
    let handle = reconcile::spawn(reader, Arc::clone(&store), None, fast_options());

    wait_until(|| store.snapshot().balance(addr(2), addr(9)).is_some()).await;
    // Many polls later the totals are still counted exactly once.
    sleep(Duration::from_millis(200)).await;
    let snapshot = store.snapshot();
    let balance = snapshot.balance(addr(2), addr(9)).unwrap();
    assert_eq!(balance.total_deposited, 150);
    assert_eq!(balance.available, 150);

    handle.shutdown().await;
}

#[tokio::test]
async fn restart_restores_the_mirror_from_the_journal() {
    let path = std::env::temp_dir().join(format!("sg-it-journal-{}", uuid::Uuid::new_v4()));
    let ledger = Arc::new(MemoryLedger::new());
    let now = Utc::now();
    ledger.set_now(now);

    ledger.push(LedgerEventKind::FundsDeposited {
        account: addr(2),
        event: addr(9),
        amount: 500,
    });
    ledger.push(LedgerEventKind::AuctionCreated {
        key: key(),
        seller: addr(1),
        starting_price: 10,
        reserve_price: 0,
        min_bid_increment: 5,
        start_time: now,
        end_time: now + ChronoDuration::hours(1),
        tier: None,
    });

    // First run: mirror the ledger, journalling as we go.
    {
        let journal = Arc::new(EventJournal::open(&path).unwrap());
        let store = Arc::new(MarketStore::new(Lifecycle::default(), 1024));
        let handle = reconcile::spawn(
            Arc::clone(&ledger) as Arc<dyn LedgerReader>,
            Arc::clone(&store),
            Some(journal),
            fast_options(),
        );
        wait_until(|| store.snapshot().auction(&key()).is_some()).await;
        handle.shutdown().await;
    }

    // Second run: the mirror comes back from the journal alone…
    let journal = Arc::new(EventJournal::open(&path).unwrap());
    let store = Arc::new(MarketStore::new(Lifecycle::default(), 1024));
    let replayed = journal.restore(&store).unwrap();
    assert_eq!(replayed, 2);
    assert_eq!(store.cursor(), Cursor::after(EventId::new(2, 0)));
    assert!(store.snapshot().auction(&key()).is_some());

    // …and reconciliation resumes from the persisted cursor.
    ledger.push(LedgerEventKind::BidPlaced {
        key: key(),
        bidder: addr(2),
        amount: 60,
    });
    let handle = reconcile::spawn(
        Arc::clone(&ledger) as Arc<dyn LedgerReader>,
        Arc::clone(&store),
        Some(journal),
        fast_options(),
    );
    wait_until(|| store.snapshot().auction(&key()).is_some_and(|a| a.highest_bid == 60)).await;
    handle.shutdown().await;

    let _ = std::fs::remove_dir_all(path);
}

#[tokio::test]
async fn confirmed_bid_frees_the_in_flight_slot() {
    let ledger = Arc::new(MemoryLedger::with_auto_confirm_bids());
    let store = Arc::new(MarketStore::new(Lifecycle::default(), 1024));
    let coordinator = coordinator(&store, &ledger);

    let now = Utc::now();
    ledger.set_now(now);
    ledger.push(LedgerEventKind::FundsDeposited {
        account: addr(2),
        event: addr(9),
        amount: 1_000,
    });
    ledger.push(LedgerEventKind::AuctionCreated {
        key: key(),
        seller: addr(1),
        starting_price: 10,
        reserve_price: 0,
        min_bid_increment: 5,
        start_time: now,
        end_time: now + ChronoDuration::hours(1),
        tier: None,
    });

    let handle = reconcile::spawn(
        Arc::clone(&ledger) as Arc<dyn LedgerReader>,
        Arc::clone(&store),
        None,
        fast_options(),
    );
    wait_until(|| store.snapshot().auction(&key()).is_some()).await;

    coordinator.submit_bid(key(), addr(2), 60).await.unwrap();
    wait_until(|| store.snapshot().auction(&key()).is_some_and(|a| a.highest_bid == 60)).await;

    // Once the confirmation reaches the store, the watcher frees the slot
    // and the same bidder can raise.
    let mut raised = false;
    for _ in 0..100 {
        match coordinator.submit_bid(key(), addr(2), 70).await {
            Ok(_) => {
                raised = true;
                break;
            }
            Err(BidError::BidInFlight) => sleep(Duration::from_millis(10)).await,
            Err(other) => panic!("unexpected rejection: {other}"),
        }
    }
    assert!(raised, "in-flight slot was never released");

    handle.shutdown().await;
}

#[tokio::test]
async fn cancel_before_any_bid_flows_through() {
    let ledger = Arc::new(MemoryLedger::new());
    let store = Arc::new(MarketStore::new(Lifecycle::default(), 1024));
    let coordinator = coordinator(&store, &ledger);

    let now = Utc::now();
    ledger.set_now(now);
    ledger.push(LedgerEventKind::AuctionCreated {
        key: key(),
        seller: addr(1),
        starting_price: 10,
        reserve_price: 0,
        min_bid_increment: 5,
        start_time: now,
        end_time: now + ChronoDuration::hours(1),
        tier: None,
    });

    let handle = reconcile::spawn(
        Arc::clone(&ledger) as Arc<dyn LedgerReader>,
        Arc::clone(&store),
        None,
        fast_options(),
    );
    wait_until(|| store.snapshot().auction(&key()).is_some()).await;

    coordinator.request_cancel(addr(1), key()).await.unwrap();
    ledger.push(LedgerEventKind::AuctionCancelled { key: key() });
    wait_until(|| {
        store
            .snapshot()
            .auction(&key())
            .is_some_and(|a| a.status == AuctionStatus::Cancelled)
    })
    .await;

    // Terminal: another cancel is a quiet no-op.
    assert!(matches!(
        coordinator.request_cancel(addr(1), key()).await,
        Ok(())
    ));
    let cancel_count = ledger
        .submissions()
        .into_iter()
        .filter(|tx| tx.method == "cancelListing")
        .count();
    assert_eq!(cancel_count, 1);

    handle.shutdown().await;

    // ActionError surface sanity: cancelling a missing listing reports so.
    let missing = ListingKey::new(addr(8), 3u64);
    assert!(matches!(
        coordinator.request_cancel(addr(1), missing).await,
        Err(ActionError::NotFound)
    ));
}
