// =============================================================================
// Trainer -- weekly k-means refit over the candle history
// =============================================================================
//
// Runs one training pass at startup so a fresh deployment has a model, then
// refits every Sunday at 00:00 UTC and atomically promotes the result in the
// model registry.
// =============================================================================

use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use regime_engine::config::Settings;
use regime_engine::storage::{self, CandleStore, ModelRegistry};
use regime_engine::trainer::Trainer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("starting trainer service");

    let settings = Settings::from_env();
    info!(
        lookback_days = settings.lookback_days,
        k = settings.kmeans_clusters,
        seed = settings.kmeans_seed,
        "trainer configuration loaded"
    );

    // ── 2. Infrastructure (fatal at boot when unreachable) ───────────────
    let pool = storage::connect_pool(&settings.database_url).await?;
    let store = CandleStore::new(pool.clone());
    let registry = ModelRegistry::new(pool);
    registry.migrate().await?;

    // ── 3. Scheduled training loop ───────────────────────────────────────
    let trainer = Trainer::new(
        store,
        registry,
        settings.lookback_days,
        settings.kmeans_clusters,
        settings.kmeans_seed,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut trainer_handle = tokio::spawn(async move { trainer.run_scheduled(shutdown_rx).await });

    info!("trainer running, press Ctrl+C to stop");

    // ── 4. Run until signal or unexpected task exit ──────────────────────
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            warn!("shutdown signal received, stopping gracefully");
            let _ = shutdown_tx.send(true);
        }
        result = &mut trainer_handle => {
            result??;
            anyhow::bail!("training loop exited unexpectedly");
        }
    }

    trainer_handle.await??;

    info!("trainer shut down complete");
    Ok(())
}
