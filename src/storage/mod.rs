// =============================================================================
// Storage -- TimescaleDB/Postgres persistence
// =============================================================================
//
// Two stores share one sqlx connection pool:
//
//   * `CandleStore`    -- append-only `raw_candles` hypertable
//   * `ModelRegistry`  -- `model_registry` with a single active model row
//
// Every query acquires a connection from the pool and releases it; the only
// cross-statement transaction in the system is the registry's promotion.

pub mod candles;
pub mod registry;

pub use candles::CandleStore;
pub use registry::{ModelRecord, ModelRegistry};

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Open a connection pool against `database_url`.
///
/// An `sslmode` query parameter on the URL (`require`, `verify-ca`,
/// `verify-full`, `disable`) is parsed and honored by the driver.
pub async fn connect_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")
}
