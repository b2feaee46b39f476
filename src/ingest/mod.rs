// =============================================================================
// Ingest -- exchange WebSocket intake
// =============================================================================
//
// The ingestor keeps a persistent kline subscription against the exchange,
// extracts closed candles, persists them idempotently, republishes them on the
// market data stream and reports liveness over HTTP.

pub mod connector;
pub mod health;

pub use connector::{parse_closed_candle, ExchangeIngestor};
pub use health::Heartbeat;
