//! Ledger ingress/egress boundary.
//!
//! Ingress is a pull-based feed of ledger facts ([`LedgerEvent`]) ordered by
//! (block number, log index). [`LedgerReader::poll`] is idempotent for a
//! repeated cursor: re-polling the same position yields the same events, so
//! the reconciliation loop can retry freely without double-applying.
//!
//! Egress is a [`TxRequest`] (method name, ordered argument list and value
//! to attach) handed to the external wallet layer through [`TxSubmitter`].
//! The service never signs or broadcasts; confirmation always arrives by the
//! resulting event being replayed back through the store.

pub mod http;
pub mod memory;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sg_common::{Address, Amount, BlockNumber, ListingKey, TicketTier};
use thiserror::Error;

/// Position of a single event in the ledger. Total order: block number
/// first, then log index within the block.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct EventId {
    pub block_number: BlockNumber,
    pub log_index: u32,
}

impl EventId {
    pub fn new(block_number: BlockNumber, log_index: u32) -> Self {
        Self {
            block_number,
            log_index,
        }
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.block_number, self.log_index)
    }
}

/// Reconciliation position: the id of the last event already applied, or the
/// ledger origin. A poll at cursor `c` returns only events strictly after
/// `c`, so the cursor never advances on failure.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(pub Option<EventId>);

impl Cursor {
    /// The position before the first ledger event.
    pub fn origin() -> Self {
        Self(None)
    }

    /// The position immediately after `id`.
    pub fn after(id: EventId) -> Self {
        Self(Some(id))
    }

    /// Whether an event at `id` lies at or before this cursor (i.e. has
    /// already been consumed).
    pub fn covers(&self, id: EventId) -> bool {
        matches!(self.0, Some(last) if id <= last)
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(id) => id.fmt(f),
            None => f.write_str("origin"),
        }
    }
}

/// A single fact read from the ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEvent {
    #[serde(flatten)]
    pub id: EventId,
    /// Block timestamp the event was committed at.
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: LedgerEventKind,
}

/// Event payloads, matching the marketplace contract surface field-for-field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum LedgerEventKind {
    #[serde(rename_all = "camelCase")]
    ListingCreated {
        key: ListingKey,
        seller: Address,
        price: Amount,
        #[serde(default)]
        tier: Option<TicketTier>,
    },
    #[serde(rename_all = "camelCase")]
    AuctionCreated {
        key: ListingKey,
        seller: Address,
        starting_price: Amount,
        /// 0 = no reserve.
        reserve_price: Amount,
        min_bid_increment: Amount,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        #[serde(default)]
        tier: Option<TicketTier>,
    },
    #[serde(rename_all = "camelCase")]
    BidPlaced {
        key: ListingKey,
        bidder: Address,
        amount: Amount,
    },
    #[serde(rename_all = "camelCase")]
    AuctionSettled {
        key: ListingKey,
        winner: Option<Address>,
        amount: Amount,
    },
    #[serde(rename_all = "camelCase")]
    AuctionCancelled { key: ListingKey },
    #[serde(rename_all = "camelCase")]
    OwnershipTransferred {
        key: ListingKey,
        from: Address,
        to: Address,
    },
    #[serde(rename_all = "camelCase")]
    FundsDeposited {
        account: Address,
        event: Address,
        amount: Amount,
    },
    #[serde(rename_all = "camelCase")]
    FundsWithdrawn {
        account: Address,
        event: Address,
        amount: Amount,
    },
}

impl LedgerEventKind {
    /// The listing key this event concerns, when it concerns one.
    pub fn key(&self) -> Option<ListingKey> {
        use LedgerEventKind::*;
        match self {
            ListingCreated { key, .. }
            | AuctionCreated { key, .. }
            | BidPlaced { key, .. }
            | AuctionSettled { key, .. }
            | AuctionCancelled { key }
            | OwnershipTransferred { key, .. } => Some(*key),
            FundsDeposited { .. } | FundsWithdrawn { .. } => None,
        }
    }
}

/// One poll's worth of events plus the position to resume from.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EventBatch {
    pub events: Vec<LedgerEvent>,
    pub next: Cursor,
}

/// Errors surfaced by the ledger boundary. All variants are transient from
/// the reconciliation loop's point of view and are retried with backoff.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    #[error("ledger call timed out")]
    Timeout,

    #[error("failed to decode ledger payload: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Pull-based feed of ledger facts.
#[async_trait::async_trait]
pub trait LedgerReader: Send + Sync + 'static {
    /// Return the events strictly after `since`, in ledger order, together
    /// with the cursor to resume from. Safe to call repeatedly with the same
    /// cursor.
    async fn poll(&self, since: Cursor) -> Result<EventBatch, LedgerError>;
}

/// A transaction argument. The wallet layer encodes these positionally.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum TxArg {
    Address(Address),
    Uint(u128),
}

/// A transaction-request payload handed to the external wallet layer.
///
/// `from` names the account the wallet should sign with; the service itself
/// never signs or broadcasts.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TxRequest {
    pub method: &'static str,
    pub from: Address,
    pub args: Vec<TxArg>,
    /// Native value to attach, in the smallest currency unit.
    pub value: Amount,
}

impl TxRequest {
    pub fn list_item_fixed_price(from: Address, key: ListingKey, price: Amount) -> Self {
        Self {
            method: "listItemFixedPrice",
            from,
            args: vec![
                TxArg::Address(key.event),
                TxArg::Uint(key.token.0.into()),
                TxArg::Uint(price),
            ],
            value: 0,
        }
    }

    pub fn create_auction(
        from: Address,
        key: ListingKey,
        starting_price: Amount,
        reserve_price: Amount,
        duration_seconds: u64,
        min_bid_increment: Amount,
    ) -> Self {
        Self {
            method: "createAuction",
            from,
            args: vec![
                TxArg::Address(key.event),
                TxArg::Uint(key.token.0.into()),
                TxArg::Uint(starting_price),
                TxArg::Uint(reserve_price),
                TxArg::Uint(duration_seconds.into()),
                TxArg::Uint(min_bid_increment),
            ],
            value: 0,
        }
    }

    /// Bids are funded from the bidder's marketplace escrow, so no value is
    /// attached.
    pub fn place_bid(from: Address, key: ListingKey, amount: Amount) -> Self {
        Self {
            method: "placeBid",
            from,
            args: vec![
                TxArg::Address(key.event),
                TxArg::Uint(key.token.0.into()),
                TxArg::Uint(amount),
            ],
            value: 0,
        }
    }

    pub fn settle_auction(from: Address, key: ListingKey) -> Self {
        Self {
            method: "settleAuction",
            from,
            args: vec![TxArg::Address(key.event), TxArg::Uint(key.token.0.into())],
            value: 0,
        }
    }

    pub fn cancel_listing(from: Address, key: ListingKey) -> Self {
        Self {
            method: "cancelListing",
            from,
            args: vec![TxArg::Address(key.event), TxArg::Uint(key.token.0.into())],
            value: 0,
        }
    }
}

/// The external transaction-signing/submission collaborator (wallet layer).
#[async_trait::async_trait]
pub trait TxSubmitter: Send + Sync + 'static {
    /// Hand a transaction request to the wallet for signing and broadcast.
    /// `Ok` means the request was accepted for broadcast, not that it was
    /// mined; confirmation arrives through the event feed.
    async fn submit(&self, request: TxRequest) -> Result<(), LedgerError>;
}
