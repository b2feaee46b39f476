// =============================================================================
// Ingestor -- exchange feed to candle table and market data stream
// =============================================================================
//
// Maintains the Binance kline subscription for the configured symbol set,
// persists every closed candle idempotently, republishes it on the stream and
// exposes /health for liveness probes.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use regime_engine::config::Settings;
use regime_engine::ingest::{health, ExchangeIngestor, Heartbeat};
use regime_engine::storage::{self, CandleStore};
use regime_engine::stream::StreamProducer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("starting ingestor service");

    let settings = Settings::from_env();
    info!(
        symbols = ?settings.watch_symbols,
        interval = %settings.kline_interval,
        stream = %settings.redis_stream_key,
        "ingestor configuration loaded"
    );

    // ── 2. Infrastructure (fatal at boot when unreachable) ───────────────
    let pool = storage::connect_pool(&settings.database_url).await?;
    let store = CandleStore::new(pool);
    store.migrate().await?;

    let producer = StreamProducer::connect(
        &settings.redis_url,
        &settings.redis_stream_key,
        settings.redis_stream_max_len,
    )
    .await?;

    // ── 3. Shared state & shutdown wiring ────────────────────────────────
    let heartbeat = Arc::new(Heartbeat::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── 4. Health server ─────────────────────────────────────────────────
    let mut health_handle = tokio::spawn(health::serve(
        settings.health_check_port,
        heartbeat.clone(),
        Duration::from_secs(settings.liveness_threshold_seconds),
        shutdown_rx.clone(),
    ));

    // ── 5. WebSocket connector ───────────────────────────────────────────
    let mut ingestor = ExchangeIngestor::new(
        settings.exchange_ws_url(),
        store,
        producer,
        heartbeat,
        shutdown_rx,
    );
    let mut ingest_handle = tokio::spawn(async move { ingestor.run().await });

    info!("ingestor running, press Ctrl+C to stop");

    // ── 6. Run until signal or unexpected task exit ──────────────────────
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            warn!("shutdown signal received, stopping gracefully");
            let _ = shutdown_tx.send(true);
        }
        result = &mut ingest_handle => {
            result??;
            anyhow::bail!("ingest loop exited unexpectedly");
        }
        result = &mut health_handle => {
            result??;
            anyhow::bail!("health server exited unexpectedly");
        }
    }

    ingest_handle.await??;
    health_handle.await??;

    info!("ingestor shut down complete");
    Ok(())
}
