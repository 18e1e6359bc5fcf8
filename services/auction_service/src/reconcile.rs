//! The reconciliation loop: replays ledger events into the store.
//!
//! This background task is the **only writer** of the [`MarketStore`]. Each
//! iteration polls the ledger from the current cursor, sorts the batch into
//! ledger order (the transport need not preserve it), applies the events one
//! by one, then advances and persists the cursor.
//!
//! Failure discipline:
//! * poll errors and timeouts retry with jittered exponential backoff and
//!   **never advance the cursor**; no partial progress is recorded;
//! * a malformed event or a ledger/store divergence is logged and skipped;
//!   one bad event never halts reconciliation or blocks subsequent events.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::journal::EventJournal;
use crate::ledger::LedgerReader;
use crate::store::{ApplyOutcome, MarketStore, StoreError};

#[derive(Clone, Debug)]
pub struct ReconcileOptions {
    /// Pause between successful polls.
    pub poll_interval: Duration,
    /// Deadline for a single poll call.
    pub poll_timeout: Duration,
    /// First retry delay after a failure.
    pub backoff_floor: Duration,
    /// Retry delays cap here.
    pub backoff_ceiling: Duration,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            poll_timeout: Duration::from_secs(10),
            backoff_floor: Duration::from_millis(500),
            backoff_ceiling: Duration::from_secs(60),
        }
    }
}

/// Handle to a running reconciliation task.
pub struct ReconcileHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl ReconcileHandle {
    /// Request a graceful stop and wait for the loop to finish its current
    /// iteration.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.task.await;
    }
}

/// Spawn the loop on the Tokio runtime.
pub fn spawn(
    reader: Arc<dyn LedgerReader>,
    store: Arc<MarketStore>,
    journal: Option<Arc<EventJournal>>,
    options: ReconcileOptions,
) -> ReconcileHandle {
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

    let task = tokio::spawn(async move {
        let mut backoff = options.backoff_floor;
        info!(cursor = %store.cursor(), "reconciliation loop started");

        loop {
            let cursor = store.cursor();
            let pause = match timeout(options.poll_timeout, reader.poll(cursor)).await {
                Ok(Ok(mut batch)) => {
                    backoff = options.backoff_floor;
                    batch.events.sort_by_key(|ev| ev.id);

                    for event in &batch.events {
                        match store.apply(event) {
                            Ok(ApplyOutcome::Applied) => {
                                if let Some(journal) = &journal {
                                    if let Err(err) = journal.append(event) {
                                        error!(id = %event.id, %err, "failed to journal event");
                                    }
                                }
                            }
                            Ok(ApplyOutcome::Duplicate) => {
                                debug!(id = %event.id, "duplicate event skipped")
                            }
                            Err(StoreError::Malformed(msg)) => {
                                warn!(id = %event.id, %msg, "malformed ledger event skipped")
                            }
                            Err(StoreError::Inconsistent(msg)) => {
                                // Divergence needs operator attention, not a
                                // crash: alert loudly and keep reconciling.
                                error!(id = %event.id, %msg, "ledger/store divergence; event skipped")
                            }
                        }
                    }

                    store.advance_cursor(batch.next);
                    if let Some(journal) = &journal {
                        if let Err(err) = journal.save_cursor(batch.next) {
                            error!(%err, "failed to persist reconciliation cursor");
                        }
                    }
                    options.poll_interval
                }
                Ok(Err(err)) => {
                    warn!(%err, retry_in = ?backoff, "ledger poll failed; cursor not advanced");
                    next_backoff(&mut backoff, options.backoff_ceiling)
                }
                Err(_elapsed) => {
                    warn!(retry_in = ?backoff, "ledger poll timed out; cursor not advanced");
                    next_backoff(&mut backoff, options.backoff_ceiling)
                }
            };

            select! {
                _ = sleep(pause) => {}
                _ = shutdown_rx.recv() => {
                    info!(cursor = %store.cursor(), "reconciliation loop stopped");
                    break;
                }
            }
        }
    });

    ReconcileHandle { shutdown_tx, task }
}

/// Return the current delay with jitter and double the stored one.
fn next_backoff(backoff: &mut Duration, ceiling: Duration) -> Duration {
    let current = *backoff;
    *backoff = (*backoff * 2).min(ceiling);

    let jitter_ceiling = (current.as_millis() as u64 / 4).max(1);
    current + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ceiling))
}
