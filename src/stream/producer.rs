// =============================================================================
// Stream producer -- XADD with approximate MAXLEN trimming
// =============================================================================

use anyhow::{Context, Result};
use chrono::SecondsFormat;
use redis::aio::ConnectionManager;
use redis::streams::StreamMaxlen;
use redis::AsyncCommands;
use tracing::debug;

use crate::types::Candle;

/// Publishes canonical candles onto the market data stream.
pub struct StreamProducer {
    connection: ConnectionManager,
    stream_key: String,
    max_len: usize,
}

impl StreamProducer {
    /// Connect to Redis and verify the connection before the first publish.
    pub async fn connect(redis_url: &str, stream_key: &str, max_len: usize) -> Result<Self> {
        let connection = super::connect_manager(redis_url).await?;
        Ok(Self {
            connection,
            stream_key: stream_key.to_string(),
            max_len,
        })
    }

    /// Append one candle to the stream.
    ///
    /// The stream is trimmed approximately to `max_len` on every append, so a
    /// lagging consumer bounds memory at the cost of dropped oldest entries.
    pub async fn publish_candle(&mut self, candle: &Candle) -> Result<()> {
        let fields = candle_to_fields(candle);

        let _id: String = self
            .connection
            .xadd_maxlen(
                &self.stream_key,
                StreamMaxlen::Approx(self.max_len),
                "*",
                &fields,
            )
            .await
            .context("failed to XADD candle to stream")?;

        debug!(
            stream = %self.stream_key,
            symbol = %candle.symbol,
            ts = %candle.timestamp,
            "candle published"
        );
        Ok(())
    }
}

/// Render a candle as the stream's flat field-value map (all string values).
pub fn candle_to_fields(candle: &Candle) -> Vec<(String, String)> {
    vec![
        ("event_type".into(), candle.event_type.clone()),
        ("symbol".into(), candle.symbol.clone()),
        ("exchange".into(), candle.exchange.clone()),
        (
            "timestamp".into(),
            candle.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
        ),
        ("open".into(), candle.open.to_string()),
        ("high".into(), candle.high.to_string()),
        ("low".into(), candle.low.to_string()),
        ("close".into(), candle.close.to_string()),
        ("volume".into(), candle.volume.to_string()),
        ("timeframe".into(), candle.timeframe.clone()),
    ]
}
