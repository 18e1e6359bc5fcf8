//! Service entry point: wire the mirror, the reconciliation loop and the
//! HTTP façade together, then serve until interrupted.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use auction_service::{
    config,
    coordinator::BidCoordinator,
    journal::EventJournal,
    ledger::{http::HttpLedger, LedgerReader, TxSubmitter},
    lifecycle::Lifecycle,
    query::QueryFacade,
    reconcile,
    rest_api::{self, AppState},
    store::MarketStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::args().nth(1);
    let cfg = config::init(config_path.as_deref().map(std::path::Path::new))
        .context("failed to load configuration")?;
    info!(
        service = %cfg.service.name,
        instance = %cfg.service.instance_id,
        ledger = %cfg.ledger.endpoint,
        "starting auction coordination service"
    );

    let store = Arc::new(MarketStore::new(
        Lifecycle::new(cfg.lifecycle_rules()),
        cfg.ledger.dedup_horizon_blocks,
    ));

    // Rebuild the mirror from the local journal before touching the ledger.
    let journal = if cfg.journal.enabled {
        let journal = Arc::new(
            EventJournal::open(&cfg.journal.path).context("failed to open event journal")?,
        );
        let replayed = journal.restore(&store).context("journal replay failed")?;
        info!(replayed, cursor = %store.cursor(), "journal replay complete");
        Some(journal)
    } else {
        None
    };

    let ledger = Arc::new(
        HttpLedger::new(cfg.ledger.endpoint.clone(), cfg.ledger.poll_timeout)
            .context("failed to build ledger client")?,
    );
    let reader: Arc<dyn LedgerReader> = ledger.clone();
    let submitter: Arc<dyn TxSubmitter> = ledger;

    let coordinator = Arc::new(BidCoordinator::new(
        Arc::clone(&store),
        submitter,
        cfg.ledger.submit_timeout,
        cfg.ledger.confirm_timeout,
    ));
    let query = Arc::new(QueryFacade::new(Arc::clone(&store)));

    let reconciler = reconcile::spawn(reader, Arc::clone(&store), journal, cfg.reconcile_options());

    let addr = SocketAddr::new(cfg.api.host, cfg.api.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "HTTP façade listening");

    let app = rest_api::router(AppState {
        store,
        query,
        coordinator,
    });
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("shutting down");
    if tokio::time::timeout(cfg.service.shutdown_timeout, reconciler.shutdown())
        .await
        .is_err()
    {
        tracing::warn!("reconciliation loop did not stop within the shutdown timeout");
    }
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
