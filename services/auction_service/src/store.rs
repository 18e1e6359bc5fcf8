//! Listing & auction store: the authoritative off-chain mirror.
//!
//! Built by replaying [`LedgerEvent`]s in ledger order. The reconciliation
//! loop is the **only writer**; every reader (query façade, bid coordinator)
//! takes an [`Arc`] snapshot of the last committed state, so a reader can
//! never observe a half-applied event.
//!
//! Apply semantics:
//! * idempotent: each event id is recorded and duplicates are skipped, so
//!   reorg-safe re-polling never double-counts a bid or a deposit;
//! * atomic: an event either applies fully or not at all (the mutation runs
//!   on a copy that is swapped in only on success);
//! * non-fatal: malformed events and mirror/ledger divergences are reported
//!   to the caller for logging and skipped; one bad event must never halt
//!   reconciliation or corrupt the records.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sg_common::{Address, Amount, ListingKey, TicketTier};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

use crate::ledger::{Cursor, EventId, LedgerEvent, LedgerEventKind};
use crate::lifecycle::{Auction, AuctionStatus, Lifecycle, LifecycleError, SettleOutcome};

/// Capacity of the applied-events broadcast bus. Slow subscribers observe a
/// lag error and resynchronise from a fresh snapshot.
const EVENT_BUS_CAPACITY: usize = 256;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingStatus {
    Active,
    Sold,
    Cancelled,
}

/// A fixed-price listing. Auctions are tracked as [`Auction`] records.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Listing {
    pub key: ListingKey,
    pub seller: Address,
    pub price: Amount,
    pub status: ListingStatus,
    pub tier: Option<TicketTier>,
    pub listed_at: DateTime<Utc>,
}

/// Off-chain mirror of the marketplace escrow for one (account, event) pair.
///
/// Invariant: `available + locked <= total_deposited - total_withdrawn`;
/// escrow accounting never goes negative.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserBalance {
    pub total_deposited: Amount,
    pub available: Amount,
    pub locked: Amount,
    pub total_withdrawn: Amount,
    /// Cumulative sale proceeds credited to this account.
    pub profits: Amount,
}

impl UserBalance {
    fn invariant_holds(&self) -> bool {
        let ceiling = match self.total_deposited.checked_sub(self.total_withdrawn) {
            Some(v) => v,
            None => return false,
        };
        self.available.checked_add(self.locked).is_some_and(|held| held <= ceiling)
    }
}

/// The record currently occupying a listing key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "saleType", rename_all = "camelCase")]
pub enum MarketItem {
    FixedPrice(Listing),
    Auction(Auction),
}

impl MarketItem {
    /// Whether this record still occupies the key. An elapsed-but-unsettled
    /// auction still does: only terminal records free the key for relisting.
    fn occupies_key(&self) -> bool {
        match self {
            MarketItem::FixedPrice(l) => l.status == ListingStatus::Active,
            MarketItem::Auction(a) => !a.status.is_terminal(),
        }
    }
}

/// One committed, immutable version of the mirror. Readers hold snapshots of
/// this; the reconciliation loop swaps in a new version per applied event.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MarketState {
    items: HashMap<ListingKey, MarketItem>,
    balances: HashMap<(Address, Address), UserBalance>,
    owners: HashMap<ListingKey, Address>,
    applied: BTreeSet<EventId>,
    cursor: Cursor,
}

impl MarketState {
    pub fn item(&self, key: &ListingKey) -> Option<&MarketItem> {
        self.items.get(key)
    }

    pub fn auction(&self, key: &ListingKey) -> Option<&Auction> {
        match self.items.get(key) {
            Some(MarketItem::Auction(a)) => Some(a),
            _ => None,
        }
    }

    pub fn listing(&self, key: &ListingKey) -> Option<&Listing> {
        match self.items.get(key) {
            Some(MarketItem::FixedPrice(l)) => Some(l),
            _ => None,
        }
    }

    pub fn auctions(&self) -> impl Iterator<Item = &Auction> {
        self.items.values().filter_map(|item| match item {
            MarketItem::Auction(a) => Some(a),
            _ => None,
        })
    }

    pub fn balance(&self, account: Address, event: Address) -> Option<&UserBalance> {
        self.balances.get(&(account, event))
    }

    pub fn owner(&self, key: &ListingKey) -> Option<Address> {
        self.owners.get(key).copied()
    }

    pub fn holdings(&self, owner: Address) -> impl Iterator<Item = ListingKey> + '_ {
        self.owners
            .iter()
            .filter(move |(_, o)| **o == owner)
            .map(|(k, _)| *k)
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    fn key_occupied(&self, key: &ListingKey) -> bool {
        self.items.get(key).is_some_and(MarketItem::occupies_key)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The event id was seen before; state is unchanged.
    Duplicate,
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The event shape does not make sense on its own.
    #[error("malformed event: {0}")]
    Malformed(String),

    /// The event contradicts the mirrored state: ledger/store divergence
    /// needing operator attention. The event is skipped, the loop continues.
    #[error("store inconsistent: {0}")]
    Inconsistent(String),
}

impl From<LifecycleError> for StoreError {
    fn from(err: LifecycleError) -> Self {
        StoreError::Inconsistent(err.to_string())
    }
}

/// Shared, single-writer store handle.
pub struct MarketStore {
    state: RwLock<Arc<MarketState>>,
    lifecycle: Lifecycle,
    events_tx: broadcast::Sender<LedgerEvent>,
    /// Applied event ids older than this many blocks behind the cursor are
    /// pruned; re-polls never reach further back than the reorg depth.
    dedup_horizon_blocks: u64,
}

impl MarketStore {
    pub fn new(lifecycle: Lifecycle, dedup_horizon_blocks: u64) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            state: RwLock::new(Arc::new(MarketState::default())),
            lifecycle,
            events_tx,
            dedup_horizon_blocks,
        }
    }

    /// Resume from a persisted cursor (events at or before it are treated as
    /// already applied).
    pub fn with_cursor(lifecycle: Lifecycle, cursor: Cursor, dedup_horizon_blocks: u64) -> Self {
        let store = Self::new(lifecycle, dedup_horizon_blocks);
        Arc::make_mut(&mut *store.state.write()).cursor = cursor;
        store
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// The last committed version of the mirror. Cheap: clones an `Arc`.
    pub fn snapshot(&self) -> Arc<MarketState> {
        self.state.read().clone()
    }

    /// Subscribe to the stream of applied events.
    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events_tx.subscribe()
    }

    pub fn cursor(&self) -> Cursor {
        self.state.read().cursor
    }

    /// Record the resume position after a fully processed batch and prune
    /// the dedup set below the reorg horizon.
    pub fn advance_cursor(&self, next: Cursor) {
        let mut guard = self.state.write();
        let state = Arc::make_mut(&mut *guard);
        state.cursor = next;
        if let Some(last) = next.0 {
            let floor = last.block_number.saturating_sub(self.dedup_horizon_blocks);
            state.applied.retain(|id| id.block_number >= floor);
        }
    }

    /// Apply a single ledger event. Idempotent: a previously seen event id
    /// returns [`ApplyOutcome::Duplicate`] and leaves the state untouched.
    pub fn apply(&self, event: &LedgerEvent) -> Result<ApplyOutcome, StoreError> {
        let mut guard = self.state.write();

        if guard.applied.contains(&event.id) || guard.cursor.covers(event.id) {
            debug!(id = %event.id, "skipping duplicate ledger event");
            return Ok(ApplyOutcome::Duplicate);
        }

        // Mutate a copy; swap it in only when the whole event applied. A
        // failed event therefore leaves the committed state untouched.
        let mut next = (**guard).clone();
        self.apply_kind(&mut next, event)?;
        next.applied.insert(event.id);
        *guard = Arc::new(next);
        drop(guard);

        let _ = self.events_tx.send(event.clone());
        Ok(ApplyOutcome::Applied)
    }

    fn apply_kind(&self, state: &mut MarketState, event: &LedgerEvent) -> Result<(), StoreError> {
        match &event.kind {
            LedgerEventKind::ListingCreated {
                key,
                seller,
                price,
                tier,
            } => {
                if state.key_occupied(key) {
                    return Err(StoreError::Inconsistent(format!(
                        "active listing already exists for {key}"
                    )));
                }
                state.items.insert(
                    *key,
                    MarketItem::FixedPrice(Listing {
                        key: *key,
                        seller: *seller,
                        price: *price,
                        status: ListingStatus::Active,
                        tier: *tier,
                        listed_at: event.at,
                    }),
                );
                Ok(())
            }

            LedgerEventKind::AuctionCreated {
                key,
                seller,
                starting_price,
                reserve_price,
                min_bid_increment,
                start_time,
                end_time,
                tier,
            } => {
                if end_time <= start_time {
                    return Err(StoreError::Malformed(format!(
                        "auction window for {key} is empty ({start_time} .. {end_time})"
                    )));
                }
                if state.key_occupied(key) {
                    return Err(StoreError::Inconsistent(format!(
                        "active listing already exists for {key}"
                    )));
                }
                state.items.insert(
                    *key,
                    MarketItem::Auction(Auction {
                        key: *key,
                        seller: *seller,
                        starting_price: *starting_price,
                        reserve_price: *reserve_price,
                        min_bid_increment: *min_bid_increment,
                        start_time: *start_time,
                        end_time: *end_time,
                        status: AuctionStatus::Active,
                        highest_bid: 0,
                        highest_bidder: None,
                        extension_count: 0,
                        reserve_met: None,
                        tier: *tier,
                        created_at: event.at,
                    }),
                );
                Ok(())
            }

            LedgerEventKind::BidPlaced {
                key,
                bidder,
                amount,
            } => self.apply_bid(state, *key, *bidder, *amount, event.at),

            LedgerEventKind::AuctionSettled {
                key,
                winner,
                amount,
            } => self.apply_settle(state, *key, *winner, *amount, event.at),

            LedgerEventKind::AuctionCancelled { key } => {
                let auction = auction_mut(state, key)?;
                self.lifecycle.cancel(auction)?;
                Ok(())
            }

            LedgerEventKind::OwnershipTransferred { key, from, to } => {
                self.apply_transfer(state, *key, *from, *to)
            }

            LedgerEventKind::FundsDeposited {
                account,
                event: event_contract,
                amount,
            } => {
                let balance = state.balances.entry((*account, *event_contract)).or_default();
                balance.total_deposited = balance.total_deposited.saturating_add(*amount);
                balance.available = balance.available.saturating_add(*amount);
                check_balance(balance, account)
            }

            LedgerEventKind::FundsWithdrawn {
                account,
                event: event_contract,
                amount,
            } => {
                let balance = state.balances.entry((*account, *event_contract)).or_default();
                balance.available = balance.available.checked_sub(*amount).ok_or_else(|| {
                    StoreError::Inconsistent(format!(
                        "withdrawal of {amount} exceeds available balance of {account}"
                    ))
                })?;
                balance.total_withdrawn = balance.total_withdrawn.saturating_add(*amount);
                check_balance(balance, account)
            }
        }
    }

    fn apply_bid(
        &self,
        state: &mut MarketState,
        key: ListingKey,
        bidder: Address,
        amount: Amount,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let event_contract = key.event;
        let auction = auction_mut(state, &key)?;
        if auction.status.is_terminal() {
            return Err(StoreError::Inconsistent(format!(
                "bid on {} auction {key}",
                status_name(auction.status)
            )));
        }
        if amount <= auction.highest_bid {
            return Err(StoreError::Inconsistent(format!(
                "highest bid for {key} would not increase ({amount} <= {})",
                auction.highest_bid
            )));
        }

        let previous = auction
            .highest_bidder
            .map(|leader| (leader, auction.highest_bid));
        self.lifecycle.apply_bid(auction, bidder, amount, at);

        // Escrow moves mirror the contract: the new leader's stake is locked
        // (delta-only when raising an own bid) and any outbid leader is
        // released back to `available`.
        match previous {
            Some((leader, prev_amount)) if leader == bidder => {
                let delta = amount - prev_amount;
                lock_funds(state, bidder, event_contract, delta)?;
            }
            Some((leader, prev_amount)) => {
                lock_funds(state, bidder, event_contract, amount)?;
                unlock_funds(state, leader, event_contract, prev_amount)?;
            }
            None => lock_funds(state, bidder, event_contract, amount)?,
        }
        Ok(())
    }

    fn apply_settle(
        &self,
        state: &mut MarketState,
        key: ListingKey,
        winner: Option<Address>,
        amount: Amount,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let event_contract = key.event;
        let auction = auction_mut(state, &key)?;
        if auction.status == AuctionStatus::Settled {
            // A replayed settle is a no-op, not an error.
            return Ok(());
        }
        let seller = auction.seller;
        let leader = auction.highest_bidder.map(|l| (l, auction.highest_bid));

        let outcome = self.lifecycle.settle(auction, at)?;
        match outcome {
            SettleOutcome::Sold {
                winner: recorded,
                amount: recorded_amount,
            } => {
                if winner != Some(recorded) || amount != recorded_amount {
                    return Err(StoreError::Inconsistent(format!(
                        "settlement payload for {key} disagrees with mirror \
                         (ledger: {winner:?}/{amount}, mirror: {recorded}/{recorded_amount})"
                    )));
                }
                // The winner's locked stake becomes the seller's proceeds.
                spend_locked(state, recorded, event_contract, recorded_amount)?;
                let proceeds = state.balances.entry((seller, event_contract)).or_default();
                proceeds.profits = proceeds.profits.saturating_add(recorded_amount);
                Ok(())
            }
            SettleOutcome::ReserveNotMet => {
                if let Some((leader, stake)) = leader {
                    unlock_funds(state, leader, event_contract, stake)?;
                }
                Ok(())
            }
            SettleOutcome::NoOp => Ok(()),
        }
    }

    fn apply_transfer(
        &self,
        state: &mut MarketState,
        key: ListingKey,
        from: Address,
        to: Address,
    ) -> Result<(), StoreError> {
        // A transfer of a live fixed-price listing by its seller is a sale.
        if let Some(MarketItem::FixedPrice(listing)) = state.items.get_mut(&key) {
            if listing.status == ListingStatus::Active && listing.seller == from {
                listing.status = ListingStatus::Sold;
                let price = listing.price;
                let seller = listing.seller;
                let balance = state.balances.entry((to, key.event)).or_default();
                balance.available = balance.available.checked_sub(price).ok_or_else(|| {
                    StoreError::Inconsistent(format!(
                        "purchase of {key} exceeds available balance of {to}"
                    ))
                })?;
                let proceeds = state.balances.entry((seller, key.event)).or_default();
                proceeds.profits = proceeds.profits.saturating_add(price);
            }
        }
        state.owners.insert(key, to);
        Ok(())
    }
}

fn auction_mut<'a>(
    state: &'a mut MarketState,
    key: &ListingKey,
) -> Result<&'a mut Auction, StoreError> {
    match state.items.get_mut(key) {
        Some(MarketItem::Auction(a)) => Ok(a),
        Some(MarketItem::FixedPrice(_)) => Err(StoreError::Inconsistent(format!(
            "auction event for fixed-price listing {key}"
        ))),
        None => Err(StoreError::Inconsistent(format!(
            "auction event for unknown listing {key}"
        ))),
    }
}

fn status_name(status: AuctionStatus) -> &'static str {
    match status {
        AuctionStatus::Active => "active",
        AuctionStatus::Ended => "ended",
        AuctionStatus::Settled => "settled",
        AuctionStatus::Cancelled => "cancelled",
    }
}

fn lock_funds(
    state: &mut MarketState,
    account: Address,
    event: Address,
    amount: Amount,
) -> Result<(), StoreError> {
    let balance = state.balances.entry((account, event)).or_default();
    balance.available = balance.available.checked_sub(amount).ok_or_else(|| {
        StoreError::Inconsistent(format!(
            "locking {amount} exceeds available balance of {account}"
        ))
    })?;
    balance.locked = balance.locked.saturating_add(amount);
    check_balance(balance, &account)
}

fn unlock_funds(
    state: &mut MarketState,
    account: Address,
    event: Address,
    amount: Amount,
) -> Result<(), StoreError> {
    let balance = state.balances.entry((account, event)).or_default();
    balance.locked = balance.locked.checked_sub(amount).ok_or_else(|| {
        StoreError::Inconsistent(format!(
            "unlocking {amount} exceeds locked balance of {account}"
        ))
    })?;
    balance.available = balance.available.saturating_add(amount);
    check_balance(balance, &account)
}

fn spend_locked(
    state: &mut MarketState,
    account: Address,
    event: Address,
    amount: Amount,
) -> Result<(), StoreError> {
    let balance = state.balances.entry((account, event)).or_default();
    balance.locked = balance.locked.checked_sub(amount).ok_or_else(|| {
        StoreError::Inconsistent(format!(
            "spending {amount} exceeds locked balance of {account}"
        ))
    })?;
    check_balance(balance, &account)
}

fn check_balance(balance: &UserBalance, account: &Address) -> Result<(), StoreError> {
    if balance.invariant_holds() {
        Ok(())
    } else {
        Err(StoreError::Inconsistent(format!(
            "escrow invariant violated for {account}: {balance:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::EventId;
    use chrono::Duration;

    fn addr(n: u8) -> Address {
        Address::new([n; 20])
    }

    fn t0() -> DateTime<Utc> {
        "2026-03-01T12:00:00Z".parse().unwrap()
    }

    fn ev(block: u64, at: DateTime<Utc>, kind: LedgerEventKind) -> LedgerEvent {
        LedgerEvent {
            id: EventId::new(block, 0),
            at,
            kind,
        }
    }

    fn store() -> MarketStore {
        MarketStore::new(Lifecycle::default(), 1024)
    }

    fn key() -> ListingKey {
        ListingKey::new(addr(9), 1u64)
    }

    fn auction_created(block: u64) -> LedgerEvent {
        ev(
            block,
            t0(),
            LedgerEventKind::AuctionCreated {
                key: key(),
                seller: addr(1),
                starting_price: 50,
                reserve_price: 50,
                min_bid_increment: 5,
                start_time: t0(),
                end_time: t0() + Duration::seconds(3600),
                tier: Some(TicketTier::Vip),
            },
        )
    }

    fn deposit(block: u64, account: Address, amount: Amount) -> LedgerEvent {
        ev(
            block,
            t0(),
            LedgerEventKind::FundsDeposited {
                account,
                event: addr(9),
                amount,
            },
        )
    }

    fn bid(block: u64, at: DateTime<Utc>, bidder: Address, amount: Amount) -> LedgerEvent {
        ev(
            block,
            at,
            LedgerEventKind::BidPlaced {
                key: key(),
                bidder,
                amount,
            },
        )
    }

    #[test]
    fn idempotent_replay_leaves_state_identical() {
        let store = store();
        let events = vec![
            deposit(1, addr(2), 100),
            auction_created(2),
            bid(3, t0() + Duration::seconds(10), addr(2), 60),
        ];
        for e in &events {
            assert_eq!(store.apply(e).unwrap(), ApplyOutcome::Applied);
        }
        let before = store.snapshot();

        for e in &events {
            assert_eq!(store.apply(e).unwrap(), ApplyOutcome::Duplicate);
        }
        let after = store.snapshot();
        assert_eq!(*before, *after);
    }

    #[test]
    fn cursor_covered_events_are_duplicates_even_after_pruning() {
        let store = store();
        store.apply(&deposit(1, addr(2), 100)).unwrap();
        store.advance_cursor(Cursor::after(EventId::new(5000, 0)));

        // The dedup set was pruned, but the cursor still rejects the replay.
        assert_eq!(
            store.apply(&deposit(1, addr(2), 100)).unwrap(),
            ApplyOutcome::Duplicate
        );
    }

    #[test]
    fn monotonic_highest_bid_is_enforced() {
        let store = store();
        store.apply(&deposit(1, addr(2), 100)).unwrap();
        store.apply(&deposit(2, addr(3), 100)).unwrap();
        store.apply(&auction_created(3)).unwrap();
        store
            .apply(&bid(4, t0() + Duration::seconds(10), addr(2), 70))
            .unwrap();

        let before = store.snapshot();
        let err = store
            .apply(&bid(5, t0() + Duration::seconds(20), addr(3), 70))
            .unwrap_err();
        assert!(matches!(err, StoreError::Inconsistent(_)));

        // The offending event must not have touched the committed state.
        assert_eq!(*before, *store.snapshot());
    }

    #[test]
    fn outbid_leader_is_refunded() {
        let store = store();
        store.apply(&deposit(1, addr(2), 100)).unwrap();
        store.apply(&deposit(2, addr(3), 100)).unwrap();
        store.apply(&auction_created(3)).unwrap();
        store
            .apply(&bid(4, t0() + Duration::seconds(10), addr(2), 60))
            .unwrap();
        store
            .apply(&bid(5, t0() + Duration::seconds(20), addr(3), 70))
            .unwrap();

        let snap = store.snapshot();
        let outbid = snap.balance(addr(2), addr(9)).unwrap();
        assert_eq!(outbid.available, 100);
        assert_eq!(outbid.locked, 0);

        let leader = snap.balance(addr(3), addr(9)).unwrap();
        assert_eq!(leader.available, 30);
        assert_eq!(leader.locked, 70);
    }

    #[test]
    fn raising_own_bid_locks_only_the_delta() {
        let store = store();
        store.apply(&deposit(1, addr(2), 100)).unwrap();
        store.apply(&auction_created(2)).unwrap();
        store
            .apply(&bid(3, t0() + Duration::seconds(10), addr(2), 60))
            .unwrap();
        store
            .apply(&bid(4, t0() + Duration::seconds(20), addr(2), 80))
            .unwrap();

        let snap = store.snapshot();
        let balance = snap.balance(addr(2), addr(9)).unwrap();
        assert_eq!(balance.locked, 80);
        assert_eq!(balance.available, 20);
    }

    #[test]
    fn bid_without_deposit_is_a_divergence() {
        let store = store();
        store.apply(&auction_created(1)).unwrap();
        let err = store
            .apply(&bid(2, t0() + Duration::seconds(10), addr(2), 60))
            .unwrap_err();
        assert!(matches!(err, StoreError::Inconsistent(_)));
        assert_eq!(store.snapshot().auction(&key()).unwrap().highest_bid, 0);
    }

    #[test]
    fn settlement_pays_seller_and_spends_winner_stake() {
        let store = store();
        store.apply(&deposit(1, addr(2), 100)).unwrap();
        store.apply(&auction_created(2)).unwrap();
        store
            .apply(&bid(3, t0() + Duration::seconds(10), addr(2), 70))
            .unwrap();

        let settle_at = t0() + Duration::seconds(3601);
        store
            .apply(&ev(
                4,
                settle_at,
                LedgerEventKind::AuctionSettled {
                    key: key(),
                    winner: Some(addr(2)),
                    amount: 70,
                },
            ))
            .unwrap();

        let snap = store.snapshot();
        let auction = snap.auction(&key()).unwrap();
        assert_eq!(auction.status, AuctionStatus::Settled);
        assert_eq!(auction.reserve_met, Some(true));

        let winner = snap.balance(addr(2), addr(9)).unwrap();
        assert_eq!(winner.locked, 0);
        assert_eq!(winner.available, 30);

        let seller = snap.balance(addr(1), addr(9)).unwrap();
        assert_eq!(seller.profits, 70);
    }

    #[test]
    fn settlement_payload_mismatch_is_a_divergence() {
        let store = store();
        store.apply(&deposit(1, addr(2), 100)).unwrap();
        store.apply(&auction_created(2)).unwrap();
        store
            .apply(&bid(3, t0() + Duration::seconds(10), addr(2), 70))
            .unwrap();

        let before = store.snapshot();
        let err = store
            .apply(&ev(
                4,
                t0() + Duration::seconds(3601),
                LedgerEventKind::AuctionSettled {
                    key: key(),
                    winner: Some(addr(3)),
                    amount: 70,
                },
            ))
            .unwrap_err();
        assert!(matches!(err, StoreError::Inconsistent(_)));
        assert_eq!(*before, *store.snapshot());
    }

    #[test]
    fn reserve_not_met_refunds_the_leader() {
        let store = store();
        store.apply(&deposit(1, addr(2), 100)).unwrap();
        store
            .apply(&ev(
                2,
                t0(),
                LedgerEventKind::AuctionCreated {
                    key: key(),
                    seller: addr(1),
                    starting_price: 10,
                    reserve_price: 90,
                    min_bid_increment: 5,
                    start_time: t0(),
                    end_time: t0() + Duration::seconds(60),
                    tier: None,
                },
            ))
            .unwrap();
        store
            .apply(&bid(3, t0() + Duration::seconds(10), addr(2), 40))
            .unwrap();
        store
            .apply(&ev(
                4,
                t0() + Duration::seconds(61),
                LedgerEventKind::AuctionSettled {
                    key: key(),
                    winner: None,
                    amount: 0,
                },
            ))
            .unwrap();

        let snap = store.snapshot();
        let auction = snap.auction(&key()).unwrap();
        assert_eq!(auction.status, AuctionStatus::Settled);
        assert_eq!(auction.reserve_met, Some(false));

        let bidder = snap.balance(addr(2), addr(9)).unwrap();
        assert_eq!(bidder.available, 100);
        assert_eq!(bidder.locked, 0);
    }

    #[test]
    fn double_active_listing_is_rejected() {
        let store = store();
        store.apply(&auction_created(1)).unwrap();
        let err = store
            .apply(&ev(
                2,
                t0(),
                LedgerEventKind::ListingCreated {
                    key: key(),
                    seller: addr(1),
                    price: 10,
                    tier: None,
                },
            ))
            .unwrap_err();
        assert!(matches!(err, StoreError::Inconsistent(_)));
    }

    #[test]
    fn fixed_price_sale_via_ownership_transfer() {
        let store = store();
        store.apply(&deposit(1, addr(3), 100)).unwrap();
        store
            .apply(&ev(
                2,
                t0(),
                LedgerEventKind::ListingCreated {
                    key: key(),
                    seller: addr(1),
                    price: 40,
                    tier: None,
                },
            ))
            .unwrap();
        store
            .apply(&ev(
                3,
                t0() + Duration::seconds(5),
                LedgerEventKind::OwnershipTransferred {
                    key: key(),
                    from: addr(1),
                    to: addr(3),
                },
            ))
            .unwrap();

        let snap = store.snapshot();
        assert_eq!(snap.listing(&key()).unwrap().status, ListingStatus::Sold);
        assert_eq!(snap.owner(&key()), Some(addr(3)));
        assert_eq!(snap.balance(addr(3), addr(9)).unwrap().available, 60);
        assert_eq!(snap.balance(addr(1), addr(9)).unwrap().profits, 40);
    }

    #[test]
    fn overdraw_withdrawal_is_a_divergence() {
        let store = store();
        store.apply(&deposit(1, addr(2), 50)).unwrap();
        let err = store
            .apply(&ev(
                2,
                t0(),
                LedgerEventKind::FundsWithdrawn {
                    account: addr(2),
                    event: addr(9),
                    amount: 80,
                },
            ))
            .unwrap_err();
        assert!(matches!(err, StoreError::Inconsistent(_)));
        assert_eq!(store.snapshot().balance(addr(2), addr(9)).unwrap().available, 50);
    }

    #[test]
    fn cancellation_with_bids_is_a_divergence() {
        let store = store();
        store.apply(&deposit(1, addr(2), 100)).unwrap();
        store.apply(&auction_created(2)).unwrap();
        store
            .apply(&bid(3, t0() + Duration::seconds(10), addr(2), 60))
            .unwrap();

        let err = store
            .apply(&ev(4, t0(), LedgerEventKind::AuctionCancelled { key: key() }))
            .unwrap_err();
        assert!(matches!(err, StoreError::Inconsistent(_)));
    }
}
