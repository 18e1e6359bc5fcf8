//! Bid coordinator: gates bid submissions before they reach the ledger.
//!
//! Every submission is validated against the latest store snapshot (fail
//! fast, in order: auction exists and is active → not expired → increment
//! rule → available escrow balance), so bids doomed to fail never cost a
//! network round-trip.
//!
//! The one hard concurrency guarantee lives here: **at most one in-flight
//! bid per (auction, bidder)**. A slot in the in-flight map is taken with
//! insert-if-absent semantics before validation and held until the
//! submission resolves: the matching `BidPlaced` event lands in the store,
//! the wallet rejects the request, or the confirmation window elapses. A
//! second concurrent submission for the same pair is rejected with
//! [`BidError::BidInFlight`].
//!
//! A submit timeout releases the slot into an *unresolved* marker rather
//! than dropping it: the next submission for the pair first re-checks the
//! mirrored ledger state so a retry cannot silently race a still-pending
//! prior submission.
//!
//! Accepting a bid only constructs the `placeBid` transaction request and
//! hands it to the wallet layer; funds move exclusively when the resulting
//! ledger event is replayed through the store. Callers must treat `Accepted`
//! as "submitted", not "settled".

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sg_common::{Address, Amount, ListingKey};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::ledger::{LedgerError, LedgerEventKind, TxRequest, TxSubmitter};
use crate::lifecycle::{AuctionStatus, LifecycleError};
use crate::store::{MarketState, MarketStore};

type FlightKey = (ListingKey, Address);

#[derive(Copy, Clone, Debug)]
enum FlightState {
    /// A submission for this pair is on the wire or awaiting confirmation.
    Submitting,
    /// A prior submission timed out without resolving; the next attempt
    /// must re-check the mirror before proceeding.
    Unresolved { amount: Amount },
}

/// User-facing validation and submission failures. All variants are
/// recoverable by the caller adjusting input and resubmitting.
#[derive(Debug, Error)]
pub enum BidError {
    #[error("auction not found")]
    AuctionNotFound,

    #[error("auction is not active")]
    AuctionNotActive,

    #[error("auction has expired")]
    AuctionExpired,

    #[error("bid too low: minimum acceptable bid is {required}")]
    BidTooLow { required: Amount },

    #[error("insufficient available balance: need {required}, have {available}")]
    InsufficientBalance { required: Amount, available: Amount },

    #[error("a bid from this account on this auction is already in flight")]
    BidInFlight,

    #[error("ledger submission failed: {0}")]
    Submit(#[from] LedgerError),
}

impl From<LifecycleError> for BidError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::AuctionExpired => BidError::AuctionExpired,
            LifecycleError::BidTooLow { required } => BidError::BidTooLow { required },
            _ => BidError::AuctionNotActive,
        }
    }
}

/// Failures for the non-bid marketplace actions the coordinator relays.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("listing not found")]
    NotFound,

    #[error("an active listing already exists for this item")]
    AlreadyListed,

    #[error("auction has not ended yet")]
    NotEnded,

    #[error("auction already has bids and cannot be cancelled")]
    AuctionHasBids,

    #[error("only the seller can cancel a listing")]
    NotSeller,

    #[error("auction duration must be between 1 hour and 30 days")]
    InvalidDuration,

    #[error("ledger submission failed: {0}")]
    Submit(#[from] LedgerError),
}

/// Receipt for an accepted submission. "Accepted" means handed to the wallet
/// layer, not confirmed: wait for the bid to appear in the store.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BidTicket {
    pub submission_id: Uuid,
    pub key: ListingKey,
    pub bidder: Address,
    pub amount: Amount,
    pub submitted_at: DateTime<Utc>,
}

pub struct BidCoordinator {
    store: Arc<MarketStore>,
    submitter: Arc<dyn TxSubmitter>,
    in_flight: Arc<Mutex<HashMap<FlightKey, FlightState>>>,
    submit_timeout: Duration,
    /// How long an accepted submission may wait for its `BidPlaced` event
    /// before the slot degrades to *unresolved*.
    confirm_timeout: Duration,
}

impl BidCoordinator {
    pub fn new(
        store: Arc<MarketStore>,
        submitter: Arc<dyn TxSubmitter>,
        submit_timeout: Duration,
        confirm_timeout: Duration,
    ) -> Self {
        Self {
            store,
            submitter,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            submit_timeout,
            confirm_timeout,
        }
    }

    /// Validate and forward a bid. See the module docs for the guarantees.
    #[instrument(skip_all, fields(key = %key, bidder = %bidder, amount))]
    pub async fn submit_bid(
        &self,
        key: ListingKey,
        bidder: Address,
        amount: Amount,
    ) -> Result<BidTicket, BidError> {
        self.acquire_slot(key, bidder)?;

        let now = Utc::now();
        if let Err(err) = self.validate(&self.store.snapshot(), key, bidder, amount, now) {
            self.release_slot(key, bidder);
            return Err(err);
        }

        // Subscribe before submitting so the confirmation watcher cannot
        // miss an event applied between submit and subscribe.
        let confirmations = self.store.subscribe();
        let request = TxRequest::place_bid(bidder, key, amount);

        match timeout(self.submit_timeout, self.submitter.submit(request)).await {
            Ok(Ok(())) => {
                self.spawn_confirm_watch(confirmations, key, bidder, amount);
                Ok(BidTicket {
                    submission_id: Uuid::new_v4(),
                    key,
                    bidder,
                    amount,
                    submitted_at: now,
                })
            }
            Ok(Err(err)) => {
                // The wallet rejected the request outright; the slot frees.
                self.release_slot(key, bidder);
                Err(BidError::Submit(err))
            }
            Err(_elapsed) => {
                // The submission may still be live on-chain. Keep the pair
                // guarded until the next attempt re-checks the mirror.
                self.mark_unresolved(key, bidder, amount);
                Err(BidError::Submit(LedgerError::Timeout))
            }
        }
    }

    fn validate(
        &self,
        snapshot: &MarketState,
        key: ListingKey,
        bidder: Address,
        amount: Amount,
        now: DateTime<Utc>,
    ) -> Result<(), BidError> {
        let auction = snapshot.auction(&key).ok_or(BidError::AuctionNotFound)?;
        self.store.lifecycle().validate_bid(auction, amount, now)?;

        // When the bidder already leads, only the raise must be covered.
        let required = if auction.highest_bidder == Some(bidder) {
            amount.saturating_sub(auction.highest_bid)
        } else {
            amount
        };
        let available = snapshot
            .balance(bidder, key.event)
            .map(|b| b.available)
            .unwrap_or(0);
        if available < required {
            return Err(BidError::InsufficientBalance {
                required,
                available,
            });
        }
        Ok(())
    }

    fn acquire_slot(&self, key: ListingKey, bidder: Address) -> Result<(), BidError> {
        let mut map = self.in_flight.lock();
        match map.get(&(key, bidder)) {
            Some(FlightState::Submitting) => Err(BidError::BidInFlight),
            Some(FlightState::Unresolved { amount: prior }) => {
                // Re-check the mirrored ledger state before permitting the
                // retry. The reader interface is poll-only, so the freshest
                // view of the ledger we can consult is the store snapshot.
                let snapshot = self.store.snapshot();
                let landed = snapshot.auction(&key).is_some_and(|a| {
                    a.highest_bidder == Some(bidder) && a.highest_bid >= *prior
                });
                if landed {
                    debug!(key = %key, bidder = %bidder, "prior bid confirmed; slot reopened");
                } else {
                    warn!(
                        key = %key,
                        bidder = %bidder,
                        prior,
                        "retrying bid whose prior submission never resolved"
                    );
                }
                map.insert((key, bidder), FlightState::Submitting);
                Ok(())
            }
            None => {
                map.insert((key, bidder), FlightState::Submitting);
                Ok(())
            }
        }
    }

    fn release_slot(&self, key: ListingKey, bidder: Address) {
        self.in_flight.lock().remove(&(key, bidder));
    }

    fn mark_unresolved(&self, key: ListingKey, bidder: Address, amount: Amount) {
        let mut map = self.in_flight.lock();
        if let Some(state @ FlightState::Submitting) = map.get_mut(&(key, bidder)) {
            *state = FlightState::Unresolved { amount };
        }
    }

    /// Watch the store's applied-event stream for the matching `BidPlaced`;
    /// free the slot on confirmation, degrade it to *unresolved* otherwise.
    fn spawn_confirm_watch(
        &self,
        mut confirmations: tokio::sync::broadcast::Receiver<crate::ledger::LedgerEvent>,
        key: ListingKey,
        bidder: Address,
        amount: Amount,
    ) {
        let in_flight = Arc::clone(&self.in_flight);
        let store = Arc::clone(&self.store);
        let confirm_timeout = self.confirm_timeout;

        tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + confirm_timeout;
            loop {
                let confirmed = match timeout_at(deadline, confirmations.recv()).await {
                    Some(Ok(event)) => matches!(
                        event.kind,
                        LedgerEventKind::BidPlaced {
                            key: k,
                            bidder: b,
                            amount: a,
                        } if k == key && b == bidder && a >= amount
                    ),
                    // Lagged or closed: fall back to the snapshot.
                    Some(Err(_)) => store.snapshot().auction(&key).is_some_and(|a| {
                        a.highest_bidder == Some(bidder) && a.highest_bid >= amount
                    }),
                    None => {
                        debug!(key = %key, bidder = %bidder, "bid confirmation window elapsed");
                        let mut map = in_flight.lock();
                        if let Some(state @ FlightState::Submitting) = map.get_mut(&(key, bidder)) {
                            *state = FlightState::Unresolved { amount };
                        }
                        return;
                    }
                };

                if confirmed {
                    in_flight.lock().remove(&(key, bidder));
                    return;
                }
            }
        });
    }

    /// Relay a settle request for an ended auction. A terminal auction is a
    /// no-op (safe retry) and submits nothing.
    #[instrument(skip_all, fields(key = %key, from = %from))]
    pub async fn request_settle(&self, from: Address, key: ListingKey) -> Result<(), ActionError> {
        let snapshot = self.store.snapshot();
        let auction = snapshot.auction(&key).ok_or(ActionError::NotFound)?;
        match self.store.lifecycle().effective_status(auction, Utc::now()) {
            AuctionStatus::Active => Err(ActionError::NotEnded),
            AuctionStatus::Settled | AuctionStatus::Cancelled => Ok(()),
            AuctionStatus::Ended => {
                self.submitter
                    .submit(TxRequest::settle_auction(from, key))
                    .await?;
                Ok(())
            }
        }
    }

    /// Relay a cancel request. Only the seller may cancel, and only while no
    /// bid has been placed; terminal auctions are a no-op.
    #[instrument(skip_all, fields(key = %key, from = %from))]
    pub async fn request_cancel(&self, from: Address, key: ListingKey) -> Result<(), ActionError> {
        let snapshot = self.store.snapshot();
        let auction = snapshot.auction(&key).ok_or(ActionError::NotFound)?;
        if auction.status.is_terminal() {
            return Ok(());
        }
        if auction.seller != from {
            return Err(ActionError::NotSeller);
        }
        if auction.highest_bidder.is_some() {
            return Err(ActionError::AuctionHasBids);
        }
        self.submitter
            .submit(TxRequest::cancel_listing(from, key))
            .await?;
        Ok(())
    }

    /// Relay a fixed-price listing request for an unoccupied key.
    #[instrument(skip_all, fields(key = %key, from = %from))]
    pub async fn request_fixed_listing(
        &self,
        from: Address,
        key: ListingKey,
        price: Amount,
    ) -> Result<(), ActionError> {
        self.ensure_unlisted(&key)?;
        self.submitter
            .submit(TxRequest::list_item_fixed_price(from, key, price))
            .await?;
        Ok(())
    }

    /// Relay an auction creation request for an unoccupied key.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip_all, fields(key = %key, from = %from))]
    pub async fn request_auction(
        &self,
        from: Address,
        key: ListingKey,
        starting_price: Amount,
        reserve_price: Amount,
        duration_seconds: u64,
        min_bid_increment: Amount,
    ) -> Result<(), ActionError> {
        if !(3_600..=2_592_000).contains(&duration_seconds) {
            return Err(ActionError::InvalidDuration);
        }
        self.ensure_unlisted(&key)?;
        self.submitter
            .submit(TxRequest::create_auction(
                from,
                key,
                starting_price,
                reserve_price,
                duration_seconds,
                min_bid_increment,
            ))
            .await?;
        Ok(())
    }

    fn ensure_unlisted(&self, key: &ListingKey) -> Result<(), ActionError> {
        let snapshot = self.store.snapshot();
        let occupied = match snapshot.item(key) {
            Some(crate::store::MarketItem::FixedPrice(l)) => {
                l.status == crate::store::ListingStatus::Active
            }
            Some(crate::store::MarketItem::Auction(a)) => !a.status.is_terminal(),
            None => false,
        };
        if occupied {
            Err(ActionError::AlreadyListed)
        } else {
            Ok(())
        }
    }
}

/// `timeout` pinned to an absolute deadline; `None` on elapse.
async fn timeout_at<F: std::future::Future>(
    deadline: tokio::time::Instant,
    future: F,
) -> Option<F::Output> {
    tokio::time::timeout_at(deadline, future).await.ok()
}
