// =============================================================================
// Regime result store -- the KV contract shared with the HTTP gateway
// =============================================================================
//
// Keys:  regime:{canonical_symbol}:{timeframe}
// Value: `RegimeResult` JSON
// TTL:   3600 s by default; each write replaces the prior value.
//
// The classifier worker is the only writer. The gateway reads the value
// verbatim through `get` and surfaces a missing key as 404 ("no regime
// available"); that read glue lives here so the contract has a single home.
// =============================================================================

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;

use crate::types::RegimeResult;

/// Build the KV key for a `(symbol, timeframe)` pair.
pub fn regime_key(symbol: &str, timeframe: &str) -> String {
    format!("regime:{symbol}:{timeframe}")
}

/// Read/write handle for regime results.
pub struct RegimeStore {
    connection: ConnectionManager,
    ttl_seconds: u64,
}

impl RegimeStore {
    pub async fn connect(redis_url: &str, ttl_seconds: u64) -> Result<Self> {
        let connection = crate::stream::connect_manager(redis_url).await?;
        Ok(Self {
            connection,
            ttl_seconds,
        })
    }

    /// Overwrite the result for its `(symbol, timeframe)` key with a fresh TTL.
    pub async fn save(&mut self, result: &RegimeResult, timeframe: &str) -> Result<()> {
        let key = regime_key(&result.symbol, timeframe);
        let value = serde_json::to_string(result).context("failed to serialize regime result")?;

        let _: () = self
            .connection
            .set_ex(&key, &value, self.ttl_seconds)
            .await
            .with_context(|| format!("failed to SET {key}"))?;

        debug!(key = %key, label = %result.regime_label, "regime result saved");
        Ok(())
    }

    /// Fetch the raw JSON for a `(symbol, timeframe)` pair. `None` means no
    /// regime is currently available (expired or never written).
    pub async fn get(&mut self, symbol: &str, timeframe: &str) -> Result<Option<String>> {
        let key = regime_key(symbol, timeframe);
        self.connection
            .get(&key)
            .await
            .with_context(|| format!("failed to GET {key}"))
    }
}
