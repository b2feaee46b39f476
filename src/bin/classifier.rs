// =============================================================================
// Classifier -- stream consumer producing regime results
// =============================================================================
//
// Owns a named consumer in the `quant_group` consumer group on the market
// data stream. Every delivered candle is classified against its trailing
// history window and the result lands in `regime:{symbol}:{timeframe}`.
// =============================================================================

use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use regime_engine::classifier::{ClassifierWorker, RegimeClassifier};
use regime_engine::config::Settings;
use regime_engine::regime_store::RegimeStore;
use regime_engine::storage::{self, CandleStore, ModelRegistry};
use regime_engine::stream::StreamConsumer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("starting classifier service");

    let settings = Settings::from_env();
    info!(
        mode = %settings.mode,
        group = %settings.consumer_group,
        consumer = %settings.consumer_name,
        "classifier configuration loaded"
    );

    // ── 2. Infrastructure (fatal at boot when unreachable) ───────────────
    let pool = storage::connect_pool(&settings.database_url).await?;
    let store = CandleStore::new(pool.clone());
    let registry = ModelRegistry::new(pool);

    let consumer = StreamConsumer::connect(
        &settings.redis_url,
        &settings.redis_stream_key,
        &settings.consumer_group,
        &settings.consumer_name,
    )
    .await?;

    let regime_store = RegimeStore::connect(&settings.redis_url, settings.result_ttl_seconds).await?;

    // ── 3. Worker ────────────────────────────────────────────────────────
    let classifier = RegimeClassifier::new(
        settings.mode,
        settings.volatility_threshold,
        settings.trend_threshold,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut worker = ClassifierWorker::new(
        consumer,
        store,
        registry,
        regime_store,
        classifier,
        settings.history_window,
        shutdown_rx,
    );
    let mut worker_handle = tokio::spawn(async move { worker.run().await });

    info!("classifier running, press Ctrl+C to stop");

    // ── 4. Run until signal or unexpected task exit ──────────────────────
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            warn!("shutdown signal received, stopping gracefully");
            let _ = shutdown_tx.send(true);
        }
        result = &mut worker_handle => {
            result??;
            anyhow::bail!("worker loop exited unexpectedly");
        }
    }

    worker_handle.await??;

    info!("classifier shut down complete");
    Ok(())
}
