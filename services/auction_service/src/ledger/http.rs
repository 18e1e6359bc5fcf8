//! HTTP ledger client.
//!
//! Talks to a chain indexer that exposes the marketplace event feed as plain
//! JSON records (the shape of [`LedgerEvent`]) and relays transaction
//! requests to the wallet bridge. No contract address or ABI knowledge lives
//! here; the indexer owns decoding, this client owns transport.

use std::time::Duration;

use tracing::{debug, instrument};

use super::{Cursor, EventBatch, LedgerError, LedgerReader, TxRequest, TxSubmitter};

pub struct HttpLedger {
    client: reqwest::Client,
    base: String,
}

impl HttpLedger {
    /// `base` is the indexer root, e.g. `http://127.0.0.1:8645`.
    pub fn new(base: impl Into<String>, timeout: Duration) -> Result<Self, LedgerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("stagegate-auctiond")
            .build()
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            base: base.into().trim_end_matches('/').to_owned(),
        })
    }

    fn map_err(err: reqwest::Error) -> LedgerError {
        if err.is_timeout() {
            LedgerError::Timeout
        } else {
            LedgerError::Unavailable(err.to_string())
        }
    }
}

#[async_trait::async_trait]
impl LedgerReader for HttpLedger {
    #[instrument(skip(self), fields(cursor = %since))]
    async fn poll(&self, since: Cursor) -> Result<EventBatch, LedgerError> {
        let mut request = self.client.get(format!("{}/events", self.base));
        if let Some(id) = since.0 {
            request = request.query(&[
                ("afterBlock", id.block_number.to_string()),
                ("afterLog", id.log_index.to_string()),
            ]);
        }

        let response = request
            .send()
            .await
            .map_err(Self::map_err)?
            .error_for_status()
            .map_err(Self::map_err)?;

        let batch: EventBatch = response.json().await.map_err(Self::map_err)?;
        debug!(events = batch.events.len(), next = %batch.next, "polled ledger feed");
        Ok(batch)
    }
}

#[async_trait::async_trait]
impl TxSubmitter for HttpLedger {
    #[instrument(skip(self, request), fields(method = request.method, from = %request.from))]
    async fn submit(&self, request: TxRequest) -> Result<(), LedgerError> {
        self.client
            .post(format!("{}/submit", self.base))
            .json(&request)
            .send()
            .await
            .map_err(Self::map_err)?
            .error_for_status()
            .map_err(Self::map_err)?;

        Ok(())
    }
}
