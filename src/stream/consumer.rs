// =============================================================================
// Stream consumer -- consumer-group reader for the candle feed
// =============================================================================
//
// Protocol:
//   * startup: XGROUP CREATE <stream> <group> 0 MKSTREAM (BUSYGROUP ignored)
//   * loop:    XREADGROUP GROUP <group> <consumer> COUNT 1 BLOCK 1000
//              STREAMS <stream> >
//   * success: XACK after the entry was fully processed
//
// Entries that fail processing are deliberately left un-acked; the group's
// pending-entries list redelivers them after a restart.
// =============================================================================

use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use chrono::DateTime;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tracing::info;

use crate::types::Candle;

/// Block timeout per XREADGROUP call. Short enough that shutdown checks run
/// at least once a second.
const BLOCK_MILLIS: usize = 1000;

/// One delivered stream entry: its id plus decoded field map.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

/// A named consumer inside a consumer group.
pub struct StreamConsumer {
    connection: ConnectionManager,
    stream_key: String,
    group: String,
    consumer: String,
}

impl StreamConsumer {
    pub async fn connect(
        redis_url: &str,
        stream_key: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Self> {
        let connection = super::connect_manager(redis_url).await?;
        Ok(Self {
            connection,
            stream_key: stream_key.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
        })
    }

    /// Create the consumer group (with the stream, if needed) starting from
    /// id `0`. An already-existing group is not an error; anything else is
    /// fatal at boot.
    pub async fn ensure_group(&mut self) -> Result<()> {
        let created: redis::RedisResult<String> = self
            .connection
            .xgroup_create_mkstream(&self.stream_key, &self.group, "0")
            .await;

        match created {
            Ok(_) => {
                info!(stream = %self.stream_key, group = %self.group, "consumer group created");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                info!(stream = %self.stream_key, group = %self.group, "consumer group already exists");
                Ok(())
            }
            Err(e) => Err(e).context("failed to create consumer group"),
        }
    }

    /// Read the next batch of new entries (at most one), blocking up to one
    /// second. Returns an empty vec on timeout.
    pub async fn read_next(&mut self) -> Result<Vec<StreamEntry>> {
        let options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(1)
            .block(BLOCK_MILLIS);

        let reply: StreamReadReply = self
            .connection
            .xread_options(&[&self.stream_key], &[">"], &options)
            .await
            .context("XREADGROUP failed")?;

        let mut entries = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                let mut fields = HashMap::new();
                for (name, value) in id.map {
                    let text: String = redis::from_redis_value(&value)
                        .with_context(|| format!("non-string stream field {name}"))?;
                    fields.insert(name, text);
                }
                entries.push(StreamEntry { id: id.id, fields });
            }
        }
        Ok(entries)
    }

    /// Acknowledge a fully processed entry.
    pub async fn ack(&mut self, entry_id: &str) -> Result<()> {
        let _n: i64 = self
            .connection
            .xack(&self.stream_key, &self.group, &[entry_id])
            .await
            .context("XACK failed")?;
        Ok(())
    }
}

// =============================================================================
// Entry parsing
// =============================================================================

/// Decode a candle from a stream entry's field map.
///
/// Two serializations coexist on the stream and both must be accepted:
/// a flat field map (`symbol`, `open`, ... as string values) and a single
/// `payload` field carrying the candle JSON-encoded.
pub fn parse_candle_entry(fields: &HashMap<String, String>) -> Result<Candle> {
    if let Some(payload) = fields.get("payload") {
        return serde_json::from_str(payload).context("invalid payload JSON");
    }

    let text = |key: &str| -> Result<&str> {
        fields
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| anyhow!("missing stream field {key}"))
    };
    let number = |key: &str| -> Result<f64> {
        text(key)?
            .parse::<f64>()
            .with_context(|| format!("stream field {key} is not a number"))
    };

    let timestamp = DateTime::parse_from_rfc3339(text("timestamp")?)
        .context("stream field timestamp is not ISO-8601")?
        .with_timezone(&chrono::Utc);

    Ok(Candle {
        event_type: fields
            .get("event_type")
            .cloned()
            .unwrap_or_else(|| "candle_close".to_string()),
        symbol: text("symbol")?.to_string(),
        exchange: fields
            .get("exchange")
            .cloned()
            .unwrap_or_else(|| "BINANCE".to_string()),
        timestamp,
        open: number("open")?,
        high: number("high")?,
        low: number("low")?,
        close: number("close")?,
        volume: number("volume")?,
        timeframe: fields
            .get("timeframe")
            .cloned()
            .unwrap_or_else(|| "1h".to_string()),
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn flat_fields() -> HashMap<String, String> {
        [
            ("event_type", "candle_close"),
            ("symbol", "BTC-USD"),
            ("exchange", "BINANCE"),
            ("timestamp", "2023-10-27T10:00:00Z"),
            ("open", "30000"),
            ("high", "30100"),
            ("low", "29900"),
            ("close", "30050"),
            ("volume", "100.5"),
            ("timeframe", "1h"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn parses_flat_field_map() {
        let candle = parse_candle_entry(&flat_fields()).unwrap();
        assert_eq!(candle.symbol, "BTC-USD");
        assert_eq!(candle.close, 30050.0);
        assert_eq!(candle.volume, 100.5);
        assert_eq!(candle.timestamp.to_rfc3339(), "2023-10-27T10:00:00+00:00");
    }

    #[test]
    fn parses_payload_json_form() {
        let payload = serde_json::json!({
            "symbol": "BTC-USD",
            "timestamp": "2023-10-27T10:00:00Z",
            "open": 30000.0,
            "high": 30100.0,
            "low": 29900.0,
            "close": 30050.0,
            "volume": 100.0
        })
        .to_string();
        let mut fields = HashMap::new();
        fields.insert("payload".to_string(), payload);

        let candle = parse_candle_entry(&fields).unwrap();
        assert_eq!(candle.symbol, "BTC-USD");
        assert_eq!(candle.close, 30050.0);
        // Defaults fill the omitted fields.
        assert_eq!(candle.exchange, "BINANCE");
        assert_eq!(candle.timeframe, "1h");
    }

    #[test]
    fn flat_map_missing_symbol_is_an_error() {
        let mut fields = flat_fields();
        fields.remove("symbol");
        assert!(parse_candle_entry(&fields).is_err());
    }

    #[test]
    fn flat_map_bad_number_is_an_error() {
        let mut fields = flat_fields();
        fields.insert("close".to_string(), "not-a-number".to_string());
        assert!(parse_candle_entry(&fields).is_err());
    }

    #[test]
    fn malformed_payload_is_an_error() {
        let mut fields = HashMap::new();
        fields.insert("payload".to_string(), "{not json".to_string());
        assert!(parse_candle_entry(&fields).is_err());
    }

    #[test]
    fn producer_fields_roundtrip_through_consumer() {
        use crate::stream::producer::candle_to_fields;
        use chrono::{TimeZone, Utc};

        let candle = Candle {
            event_type: "candle_close".into(),
            symbol: "ETH-USD".into(),
            exchange: "BINANCE".into(),
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap(),
            open: 3400.25,
            high: 3420.0,
            low: 3390.5,
            close: 3411.75,
            volume: 88.125,
            timeframe: "1h".into(),
        };
        let fields: HashMap<String, String> = candle_to_fields(&candle).into_iter().collect();
        let parsed = parse_candle_entry(&fields).unwrap();
        assert_eq!(parsed, candle);
    }
}
