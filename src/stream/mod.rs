// =============================================================================
// Stream -- Redis stream transport for closed candles
// =============================================================================
//
// The ingestor appends candles to the `market_data_feed` stream (bounded with
// `MAXLEN ~`); the classifier worker owns a named consumer in a consumer
// group on the same stream. Both sides speak the wire format defined here:
// a flat field-value map with string values, with a `payload` single-field
// JSON form accepted on the consumer side for compatibility.

pub mod consumer;
pub mod producer;

pub use consumer::{StreamConsumer, StreamEntry};
pub use producer::StreamProducer;

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;

/// Open a managed Redis connection and verify it with `PING`.
///
/// The connection manager transparently reconnects on broken connections, so
/// per-call failures surface as errors rather than poisoned clients.
pub async fn connect_manager(redis_url: &str) -> Result<ConnectionManager> {
    let client = redis::Client::open(redis_url).context("invalid Redis URL")?;
    let mut manager = ConnectionManager::new(client)
        .await
        .context("failed to connect to Redis")?;

    redis::cmd("PING")
        .query_async::<_, String>(&mut manager)
        .await
        .context("Redis did not answer PING")?;

    Ok(manager)
}
