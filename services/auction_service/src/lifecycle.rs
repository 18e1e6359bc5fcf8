//! Per-auction lifecycle state machine.
//!
//! The machine is **deterministic**: every decision takes an explicit
//! `now: DateTime<Utc>`, so the store's reconciliation path and the bid
//! coordinator's validation path compute identical transitions from the same
//! ledger facts, and tests drive the clock directly.
//!
//! ```text
//! Created ──► Active ──(valid bid, soft-close extension)──► Active
//!               │ now >= end_time (lazy, derived on read)
//!               ▼
//!             Ended ──settle()──► Settled   (reserve met → sale;
//!               │                            else "reserve not met")
//!               │
//! Active|Ended ─cancel(), no bids─► Cancelled
//! ```
//!
//! Settled and Cancelled are terminal. Settle/cancel on a terminal auction
//! is a no-op returning the current state, so retries are always safe.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sg_common::{Address, Amount, ListingKey, TicketTier};
use thiserror::Error;

/// Anti-snipe and extension parameters, shared by every auction the service
/// tracks. Per-auction parameters (reserve, increment) live on [`Auction`].
#[derive(Debug, Clone)]
pub struct LifecycleRules {
    /// A bid landing closer than this to the end time triggers an extension.
    pub soft_close_window: Duration,
    /// The extended end time is `bid time + extension_increment`.
    pub extension_increment: Duration,
    /// Extensions applied after this count are suppressed; the bid itself is
    /// still accepted.
    pub max_extension_count: u32,
}

impl Default for LifecycleRules {
    fn default() -> Self {
        Self {
            soft_close_window: Duration::seconds(300),
            extension_increment: Duration::seconds(300),
            max_extension_count: 3,
        }
    }
}

/// Logical auction states. `Ended` is never stored; it is derived lazily
/// from `end_time` whenever the auction is read.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuctionStatus {
    Active,
    Ended,
    Settled,
    Cancelled,
}

impl AuctionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, AuctionStatus::Settled | AuctionStatus::Cancelled)
    }
}

/// The mirrored state of a single auction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Auction {
    pub key: ListingKey,
    pub seller: Address,
    pub starting_price: Amount,
    /// 0 = no reserve.
    pub reserve_price: Amount,
    pub min_bid_increment: Amount,
    pub start_time: DateTime<Utc>,
    /// Only ever increases (soft-close extensions), never decreases.
    pub end_time: DateTime<Utc>,
    pub status: AuctionStatus,
    /// Monotonically non-decreasing over the auction's lifetime.
    pub highest_bid: Amount,
    pub highest_bidder: Option<Address>,
    pub extension_count: u32,
    /// Set at settlement; `None` while the auction is live.
    pub reserve_met: Option<bool>,
    pub tier: Option<TicketTier>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("auction is not active")]
    AuctionNotActive,

    #[error("auction has expired")]
    AuctionExpired,

    #[error("bid too low: minimum acceptable bid is {required}")]
    BidTooLow { required: Amount },

    #[error("auction already has bids and cannot be cancelled")]
    AuctionHasBids,

    #[error("auction has not ended yet")]
    NotEnded,
}

/// Result of a settle action.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SettleOutcome {
    /// Reserve met: ownership transfer and payout are due to the winner.
    Sold { winner: Address, amount: Amount },
    /// Ended with no qualifying bid; the auction still settles.
    ReserveNotMet,
    /// The auction was already in a terminal state; nothing changed.
    NoOp,
}

/// Result of a cancel action.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// The auction was already in a terminal state; nothing changed.
    NoOp,
}

/// The engine: [`LifecycleRules`] plus the transition functions.
#[derive(Debug, Clone, Default)]
pub struct Lifecycle {
    rules: LifecycleRules,
}

impl Lifecycle {
    pub fn new(rules: LifecycleRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &LifecycleRules {
        &self.rules
    }

    /// The logical status at `now`, deriving `Ended` for elapsed auctions.
    pub fn effective_status(&self, auction: &Auction, now: DateTime<Utc>) -> AuctionStatus {
        match auction.status {
            AuctionStatus::Active if now >= auction.end_time => AuctionStatus::Ended,
            other => other,
        }
    }

    /// The smallest amount a new bid must reach. The first bid must meet the
    /// starting price; later bids must clear the increment over the current
    /// highest. A zero increment still requires strictly greater bids, so
    /// ties are impossible by construction.
    pub fn minimum_bid(&self, auction: &Auction) -> Amount {
        if auction.highest_bidder.is_none() {
            auction.starting_price
        } else {
            auction
                .highest_bid
                .saturating_add(auction.min_bid_increment.max(1))
        }
    }

    /// Check whether `amount` is admissible at `now`. Does not mutate.
    pub fn validate_bid(
        &self,
        auction: &Auction,
        amount: Amount,
        now: DateTime<Utc>,
    ) -> Result<(), LifecycleError> {
        if auction.status.is_terminal() || now < auction.start_time {
            return Err(LifecycleError::AuctionNotActive);
        }
        if now >= auction.end_time {
            return Err(LifecycleError::AuctionExpired);
        }

        let required = self.minimum_bid(auction);
        if amount < required {
            return Err(LifecycleError::BidTooLow { required });
        }
        Ok(())
    }

    /// Record a validated bid, applying the soft-close extension when the
    /// bid lands inside the window and the extension cap is not exhausted.
    /// Returns whether the end time was extended.
    pub fn apply_bid(
        &self,
        auction: &mut Auction,
        bidder: Address,
        amount: Amount,
        now: DateTime<Utc>,
    ) -> bool {
        auction.highest_bid = amount;
        auction.highest_bidder = Some(bidder);

        let in_window = auction.end_time - now < self.rules.soft_close_window;
        if in_window && auction.extension_count < self.rules.max_extension_count {
            auction.end_time = now + self.rules.extension_increment;
            auction.extension_count += 1;
            return true;
        }
        false
    }

    /// Drive an ended auction to `Settled`. Idempotent: a terminal auction
    /// is returned unchanged with [`SettleOutcome::NoOp`].
    pub fn settle(
        &self,
        auction: &mut Auction,
        now: DateTime<Utc>,
    ) -> Result<SettleOutcome, LifecycleError> {
        if auction.status.is_terminal() {
            return Ok(SettleOutcome::NoOp);
        }
        if now < auction.end_time {
            return Err(LifecycleError::NotEnded);
        }

        auction.status = AuctionStatus::Settled;
        match auction.highest_bidder {
            Some(winner) if auction.highest_bid >= auction.reserve_price => {
                auction.reserve_met = Some(true);
                Ok(SettleOutcome::Sold {
                    winner,
                    amount: auction.highest_bid,
                })
            }
            _ => {
                auction.reserve_met = Some(false);
                Ok(SettleOutcome::ReserveNotMet)
            }
        }
    }

    /// Cancel an auction that has received no bids. Idempotent on terminal
    /// states; rejected with [`LifecycleError::AuctionHasBids`] otherwise.
    pub fn cancel(&self, auction: &mut Auction) -> Result<CancelOutcome, LifecycleError> {
        if auction.status.is_terminal() {
            return Ok(CancelOutcome::NoOp);
        }
        if auction.highest_bidder.is_some() {
            return Err(LifecycleError::AuctionHasBids);
        }
        auction.status = AuctionStatus::Cancelled;
        Ok(CancelOutcome::Cancelled)
    }
}
