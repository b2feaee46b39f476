// =============================================================================
// Exchange connector -- Binance kline WebSocket client
// =============================================================================
//
// Consumes the combined kline stream and actions only closed candles
// (`k.x == true`). Each closed candle is:
//
//   1. parsed into a canonical `Candle` (symbol normalized, ms epoch -> UTC)
//   2. inserted into `raw_candles` (conflict on the unique key is a no-op)
//   3. published onto the market data stream
//   4. counted as a heartbeat for the liveness endpoint
//
// A DB failure skips the publish for that message; the next closed candle for
// the same key re-inserts idempotently. A publish failure is logged and the
// loop moves on; the database stays authoritative.
//
// Reconnection: exponential backoff 1 s doubling to a 60 s cap, reset to 1 s
// by any successfully handled message. Shutdown interrupts both the socket
// read and the backoff sleep.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use futures_util::StreamExt;
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::ingest::health::Heartbeat;
use crate::storage::CandleStore;
use crate::stream::StreamProducer;
use crate::types::{normalize_symbol, Candle};

const INITIAL_BACKOFF_SECS: u64 = 1;
const MAX_BACKOFF_SECS: u64 = 60;

/// Long-lived WebSocket ingestor for one exchange connection.
pub struct ExchangeIngestor {
    url: String,
    store: CandleStore,
    producer: StreamProducer,
    heartbeat: Arc<Heartbeat>,
    shutdown: watch::Receiver<bool>,
}

impl ExchangeIngestor {
    pub fn new(
        url: String,
        store: CandleStore,
        producer: StreamProducer,
        heartbeat: Arc<Heartbeat>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            url,
            store,
            producer,
            heartbeat,
            shutdown,
        }
    }

    /// Consume the exchange feed until shutdown is signalled.
    ///
    /// Connection and read errors never escape; they trigger the backoff and
    /// a reconnect.
    pub async fn run(&mut self) -> Result<()> {
        let mut backoff_secs = INITIAL_BACKOFF_SECS;

        while !*self.shutdown.borrow() {
            match self.consume_connection(&mut backoff_secs).await {
                Ok(()) => break, // clean shutdown
                Err(e) => {
                    error!(error = %e, "WebSocket connection error");
                    info!(seconds = backoff_secs, "reconnecting after backoff");

                    let sleep = tokio::time::sleep(Duration::from_secs(backoff_secs));
                    tokio::select! {
                        _ = sleep => {}
                        _ = self.shutdown.changed() => break,
                    }
                    backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                }
            }
        }

        info!("ingestor stopped");
        Ok(())
    }

    /// One connection lifetime: connect, then read until shutdown or error.
    ///
    /// Returns `Ok(())` only on cooperative shutdown; any socket failure is an
    /// error so the caller can back off and reconnect.
    async fn consume_connection(&mut self, backoff_secs: &mut u64) -> Result<()> {
        info!(url = %self.url, "connecting to exchange WebSocket");
        let (ws_stream, _response) = connect_async(&self.url)
            .await
            .context("failed to connect to exchange WebSocket")?;
        info!("exchange WebSocket connected");

        let (_write, mut read) = ws_stream.split();

        loop {
            let frame = tokio::select! {
                _ = self.shutdown.changed() => {
                    info!("shutdown signal received, closing WebSocket");
                    return Ok(());
                }
                frame = read.next() => frame,
            };

            match frame {
                Some(Ok(Message::Text(text))) => {
                    self.handle_message(&text).await;
                    // Any successfully read message resets the backoff.
                    *backoff_secs = INITIAL_BACKOFF_SECS;
                }
                Some(Ok(_)) => {
                    // Ping/Pong/Binary frames; tungstenite answers pings
                    // automatically.
                }
                Some(Err(e)) => {
                    return Err(e).context("WebSocket read error");
                }
                None => {
                    anyhow::bail!("WebSocket stream ended");
                }
            }
        }
    }

    /// Process one text frame. Never fails: parse errors are dropped with a
    /// log line, persistence errors abort only this message.
    async fn handle_message(&mut self, text: &str) {
        let candle = match parse_closed_candle(text) {
            Ok(Some(candle)) => candle,
            Ok(None) => return, // open candle or non-kline frame
            Err(e) => {
                warn!(error = %e, "failed to parse exchange frame");
                return;
            }
        };

        if !candle.is_well_formed() {
            warn!(symbol = %candle.symbol, ts = %candle.timestamp, "malformed candle dropped");
            return;
        }

        // DB first; if this fails the candle is not published so the stream
        // never gets ahead of the table.
        if let Err(e) = self.store.insert_candle(&candle).await {
            error!(error = %e, symbol = %candle.symbol, "failed to persist candle, skipping publish");
            return;
        }

        if let Err(e) = self.producer.publish_candle(&candle).await {
            error!(error = %e, symbol = %candle.symbol, "failed to publish candle to stream");
        }

        self.heartbeat.beat();
        debug!(symbol = %candle.symbol, ts = %candle.timestamp, close = candle.close, "closed candle processed");
    }
}

// =============================================================================
// Frame parsing
// =============================================================================

/// Extract a closed candle from an exchange frame.
///
/// Accepts both the combined-stream envelope (`{"stream": ..., "data": {...}}`)
/// and the direct single-stream payload. Returns `Ok(None)` for frames without
/// a kline object and for candles that are still open (`k.x == false`).
pub fn parse_closed_candle(text: &str) -> Result<Option<Candle>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("frame is not valid JSON")?;

    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    let Some(kline) = data.get("k") else {
        return Ok(None);
    };

    if !kline["x"].as_bool().unwrap_or(false) {
        return Ok(None);
    }

    let raw_symbol = kline["s"]
        .as_str()
        .context("kline has no symbol")?
        .to_uppercase();
    let symbol = normalize_symbol(&raw_symbol);

    let timeframe = kline["i"]
        .as_str()
        .context("kline has no interval")?
        .to_string();

    let open_ms = kline["t"].as_i64().context("kline has no open time")?;
    let timestamp = ms_to_utc(open_ms).context("kline open time is out of range")?;

    Ok(Some(Candle {
        event_type: "candle_close".to_string(),
        symbol,
        exchange: "BINANCE".to_string(),
        timestamp,
        open: numeric_field(kline, "o")?,
        high: numeric_field(kline, "h")?,
        low: numeric_field(kline, "l")?,
        close: numeric_field(kline, "c")?,
        volume: numeric_field(kline, "v")?,
        timeframe,
    }))
}

/// Milliseconds since epoch to UTC.
fn ms_to_utc(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// Read a price/volume entry from the kline object.
///
/// The exchange quotes these as JSON strings (`"34000.00"`); a bare number is
/// accepted too. Anything else, including an unparseable string or a missing
/// key, is an error.
fn numeric_field(kline: &serde_json::Value, key: &str) -> Result<f64> {
    let entry = &kline[key];
    entry
        .as_str()
        .map(|s| s.parse::<f64>().ok())
        .unwrap_or_else(|| entry.as_f64())
        .with_context(|| format!("kline entry {key} is missing or not numeric"))
}
