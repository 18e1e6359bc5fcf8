//! Durable reconciliation journal.
//!
//! The store is an in-memory mirror, so restarts rebuild it by replaying an
//! append-only log of every applied ledger event, persisted in sled next to
//! the resume cursor. Replay is local and fast; once the journal has been
//! replayed the reconciliation loop resumes from the persisted cursor
//! instead of re-reading the whole ledger.

use std::path::Path;

use thiserror::Error;
use tracing::{debug, warn};

use crate::ledger::{Cursor, LedgerEvent};
use crate::store::{ApplyOutcome, MarketStore};

const CURSOR_KEY: &[u8] = b"cursor";

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("journal codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

pub struct EventJournal {
    db: sled::Db,
    events: sled::Tree,
    meta: sled::Tree,
}

impl EventJournal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, JournalError> {
        let db = sled::open(path)?;
        let events = db.open_tree("events")?;
        let meta = db.open_tree("meta")?;
        Ok(Self { db, events, meta })
    }

    /// Append an applied event. Keys are (block, log index) big-endian so a
    /// plain scan replays in ledger order. Durability is deferred to the
    /// batch-level [`EventJournal::save_cursor`] flush.
    pub fn append(&self, event: &LedgerEvent) -> Result<(), JournalError> {
        let mut key = [0u8; 12];
        key[..8].copy_from_slice(&event.id.block_number.to_be_bytes());
        key[8..].copy_from_slice(&event.id.log_index.to_be_bytes());
        self.events.insert(key, serde_json::to_vec(event)?)?;
        Ok(())
    }

    /// Persist the resume position and flush the log. The cursor must never
    /// point past an event missing from the log, so both land in one flush.
    pub fn save_cursor(&self, cursor: Cursor) -> Result<(), JournalError> {
        self.meta.insert(CURSOR_KEY, serde_json::to_vec(&cursor)?)?;
        self.db.flush()?;
        debug!(%cursor, "persisted reconciliation cursor");
        Ok(())
    }

    /// The persisted resume position, or the ledger origin on first start.
    pub fn load_cursor(&self) -> Result<Cursor, JournalError> {
        match self.meta.get(CURSOR_KEY)? {
            Some(raw) => Ok(serde_json::from_slice(&raw)?),
            None => Ok(Cursor::origin()),
        }
    }

    /// Rebuild `store` from the journal: replay every logged event in order
    /// and advance the store to the persisted cursor. Returns the number of
    /// events applied. Undecodable entries are skipped with a warning; a
    /// damaged journal degrades to a longer ledger re-read, not a crash.
    pub fn restore(&self, store: &MarketStore) -> Result<u64, JournalError> {
        let mut applied = 0u64;
        for entry in self.events.iter() {
            let (_key, raw) = entry?;
            let event: LedgerEvent = match serde_json::from_slice(&raw) {
                Ok(event) => event,
                Err(err) => {
                    warn!(%err, "skipping undecodable journal entry");
                    continue;
                }
            };
            match store.apply(&event) {
                Ok(ApplyOutcome::Applied) => applied += 1,
                Ok(ApplyOutcome::Duplicate) => {}
                Err(err) => warn!(id = %event.id, %err, "journal replay skipped an event"),
            }
        }
        store.advance_cursor(self.load_cursor()?);
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{EventId, LedgerEventKind};
    use crate::lifecycle::Lifecycle;
    use chrono::Utc;
    use sg_common::Address;

    fn addr(n: u8) -> Address {
        Address::new([n; 20])
    }

    fn temp_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("sg-journal-{}", uuid::Uuid::new_v4()))
    }

    fn deposit(block: u64, amount: u128) -> LedgerEvent {
        LedgerEvent {
            id: EventId::new(block, 0),
            at: Utc::now(),
            kind: LedgerEventKind::FundsDeposited {
                account: addr(2),
                event: addr(9),
                amount,
            },
        }
    }

    #[test]
    fn fresh_journal_starts_at_origin() {
        let path = temp_path();
        let journal = EventJournal::open(&path).unwrap();
        assert_eq!(journal.load_cursor().unwrap(), Cursor::origin());
        drop(journal);
        let _ = std::fs::remove_dir_all(path);
    }

    #[test]
    fn restore_rebuilds_state_and_cursor_across_reopen() {
        let path = temp_path();
        {
            let journal = EventJournal::open(&path).unwrap();
            journal.append(&deposit(1, 100)).unwrap();
            journal.append(&deposit(2, 50)).unwrap();
            journal
                .save_cursor(Cursor::after(EventId::new(2, 0)))
                .unwrap();
        }

        let journal = EventJournal::open(&path).unwrap();
        let store = MarketStore::new(Lifecycle::default(), 1024);
        let applied = journal.restore(&store).unwrap();
        assert_eq!(applied, 2);
        assert_eq!(store.cursor(), Cursor::after(EventId::new(2, 0)));

        let snapshot = store.snapshot();
        let balance = snapshot.balance(addr(2), addr(9)).unwrap();
        assert_eq!(balance.total_deposited, 150);

        drop(journal);
        let _ = std::fs::remove_dir_all(path);
    }

    #[test]
    fn replay_is_ordered_by_event_id() {
        let path = temp_path();
        let journal = EventJournal::open(&path).unwrap();
        // Appended out of order; the key encoding restores ledger order.
        journal.append(&deposit(300, 1)).unwrap();
        journal.append(&deposit(2, 1)).unwrap();
        journal.append(&deposit(45, 1)).unwrap();
        journal
            .save_cursor(Cursor::after(EventId::new(300, 0)))
            .unwrap();

        let blocks: Vec<u64> = journal
            .events
            .iter()
            .map(|entry| {
                let (_k, raw) = entry.unwrap();
                serde_json::from_slice::<LedgerEvent>(&raw)
                    .unwrap()
                    .id
                    .block_number
            })
            .collect();
        assert_eq!(blocks, vec![2, 45, 300]);

        drop(journal);
        let _ = std::fs::remove_dir_all(path);
    }
}
