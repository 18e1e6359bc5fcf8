//! In-memory, scripted ledger.
//!
//! Implements both [`LedgerReader`] and [`TxSubmitter`] over a plain event
//! log guarded by a mutex. Meant for tests and local development, *not*
//! production: tests append facts with [`MemoryLedger::push`], drive time
//! with [`MemoryLedger::set_now`], and (optionally) let submitted bids mint
//! their own `BidPlaced` events so the submit → poll → apply loop closes
//! in-process.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use sg_common::{ListingKey, TokenId};

use super::{
    Cursor, EventBatch, EventId, LedgerError, LedgerEvent, LedgerEventKind, LedgerReader, TxArg,
    TxRequest, TxSubmitter,
};

pub struct MemoryLedger {
    inner: Mutex<Inner>,
}

struct Inner {
    log: Vec<LedgerEvent>,
    next_block: u64,
    now: DateTime<Utc>,
    submitted: Vec<TxRequest>,
    auto_confirm_bids: bool,
    fail_next_polls: u32,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                log: Vec::new(),
                next_block: 1,
                now: Utc::now(),
                submitted: Vec::new(),
                auto_confirm_bids: false,
                fail_next_polls: 0,
            }),
        }
    }

    /// Submitted `placeBid` requests immediately become `BidPlaced` events.
    pub fn with_auto_confirm_bids() -> Self {
        let ledger = Self::new();
        ledger.inner.lock().auto_confirm_bids = true;
        ledger
    }

    /// Append a fact at the current ledger time. Each push lands in its own
    /// block; use [`MemoryLedger::push_at`] to script log indexes explicitly.
    pub fn push(&self, kind: LedgerEventKind) -> EventId {
        let mut inner = self.inner.lock();
        let id = EventId::new(inner.next_block, 0);
        inner.next_block += 1;
        let at = inner.now;
        inner.log.push(LedgerEvent { id, at, kind });
        id
    }

    /// Append a fact with an explicit position and timestamp.
    pub fn push_at(&self, id: EventId, at: DateTime<Utc>, kind: LedgerEventKind) {
        let mut inner = self.inner.lock();
        inner.next_block = inner.next_block.max(id.block_number + 1);
        inner.log.push(LedgerEvent { id, at, kind });
    }

    pub fn set_now(&self, now: DateTime<Utc>) {
        self.inner.lock().now = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut inner = self.inner.lock();
        inner.now = inner.now + by;
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.lock().now
    }

    /// Every transaction request handed to the submitter so far.
    pub fn submissions(&self) -> Vec<TxRequest> {
        self.inner.lock().submitted.clone()
    }

    /// Make the next `n` polls fail with `Unavailable`, for backoff tests.
    pub fn fail_next_polls(&self, n: u32) {
        self.inner.lock().fail_next_polls = n;
    }

    fn mint_bid(inner: &mut Inner, request: &TxRequest) {
        let (event, token, amount) = match request.args.as_slice() {
            [TxArg::Address(event), TxArg::Uint(token), TxArg::Uint(amount)] => {
                (*event, *token, *amount)
            }
            _ => return,
        };
        let id = EventId::new(inner.next_block, 0);
        inner.next_block += 1;
        let at = inner.now;
        inner.log.push(LedgerEvent {
            id,
            at,
            kind: LedgerEventKind::BidPlaced {
                key: ListingKey::new(event, TokenId(token as u64)),
                bidder: request.from,
                amount,
            },
        });
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl LedgerReader for MemoryLedger {
    async fn poll(&self, since: Cursor) -> Result<EventBatch, LedgerError> {
        let mut inner = self.inner.lock();
        if inner.fail_next_polls > 0 {
            inner.fail_next_polls -= 1;
            return Err(LedgerError::Unavailable("scripted failure".into()));
        }

        let mut events: Vec<LedgerEvent> = inner
            .log
            .iter()
            .filter(|ev| !since.covers(ev.id))
            .cloned()
            .collect();
        events.sort_by_key(|ev| ev.id);

        let next = events.last().map(|ev| Cursor::after(ev.id)).unwrap_or(since);
        Ok(EventBatch { events, next })
    }
}

#[async_trait::async_trait]
impl TxSubmitter for MemoryLedger {
    async fn submit(&self, request: TxRequest) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock();
        if inner.auto_confirm_bids && request.method == "placeBid" {
            Self::mint_bid(&mut inner, &request);
        }
        inner.submitted.push(request);
        Ok(())
    }
}
