// =============================================================================
// Shared types used across the regime-engine services
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Candle
// =============================================================================

fn default_event_type() -> String {
    "candle_close".to_string()
}

fn default_timeframe() -> String {
    "1h".to_string()
}

fn default_exchange() -> String {
    "BINANCE".to_string()
}

/// A single closed OHLCV candle in canonical form.
///
/// Identity is `(exchange, symbol, timeframe, timestamp)` where `timestamp` is
/// the open of the interval in UTC. This is the exact shape published to the
/// `market_data_feed` stream and stored in `raw_candles`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    #[serde(default = "default_event_type")]
    pub event_type: String,
    pub symbol: String,
    #[serde(default = "default_exchange")]
    pub exchange: String,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default = "default_timeframe")]
    pub timeframe: String,
}

impl Candle {
    /// Basic shape validation: `low <= open,close <= high` and `volume >= 0`.
    ///
    /// Exchange frames that violate this are corrupt and must not reach the
    /// database or the stream.
    pub fn is_well_formed(&self) -> bool {
        self.low <= self.open
            && self.low <= self.close
            && self.open <= self.high
            && self.close <= self.high
            && self.low <= self.high
            && self.volume >= 0.0
            && [self.open, self.high, self.low, self.close, self.volume]
                .iter()
                .all(|v| v.is_finite())
    }
}

// =============================================================================
// Symbol normalization
// =============================================================================

/// Exchange quote suffixes mapped to their canonical quote currency.
///
/// Kept as a table rather than a string replace so that new quote assets can
/// be added without risking mid-symbol matches (`BUSDUSDT` must become
/// `BUSD-USD`, not `B-USD-USD`).
const QUOTE_SUFFIXES: &[(&str, &str)] = &[("USDT", "USD")];

/// Normalize an exchange symbol to canonical form.
///
/// `BTCUSDT` becomes `BTC-USD`. Symbols with an unrecognized quote suffix are
/// passed through unchanged.
pub fn normalize_symbol(raw: &str) -> String {
    for (suffix, quote) in QUOTE_SUFFIXES {
        if raw.len() > suffix.len() {
            if let Some(base) = raw.strip_suffix(suffix) {
                return format!("{base}-{quote}");
            }
        }
    }
    raw.to_string()
}

// =============================================================================
// Classifier mode
// =============================================================================

/// Which classification path the worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassifierMode {
    RuleBased,
    MlClustering,
}

impl Default for ClassifierMode {
    fn default() -> Self {
        Self::RuleBased
    }
}

impl ClassifierMode {
    /// Parse the `MODE` environment value. Unknown values fall back to
    /// `RuleBased` so a typo never silently enables the ML path.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_uppercase().as_str() {
            "ML_CLUSTERING" => Self::MlClustering,
            _ => Self::RuleBased,
        }
    }
}

impl std::fmt::Display for ClassifierMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RuleBased => write!(f, "RULE_BASED"),
            Self::MlClustering => write!(f, "ML_CLUSTERING"),
        }
    }
}

// =============================================================================
// Model parameters
// =============================================================================

/// Everything the worker needs to reproduce the trainer's standardize +
/// nearest-centroid decision, persisted as JSONB in `model_registry`.
///
/// `feature_cols` is the source of truth for feature-vector ordering; the
/// worker composes its input from this list at classification time so trainer
/// and worker cannot drift.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    pub feature_cols: Vec<String>,
    pub scaler_mean: Vec<f64>,
    pub scaler_scale: Vec<f64>,
    /// k x d cluster centers in standardized feature space.
    pub centroids: Vec<Vec<f64>>,
    /// Centroid index -> regime name. Indices missing here render as
    /// `CLUSTER_{i}` downstream.
    pub labels: BTreeMap<usize, String>,
}

// =============================================================================
// Regime result
// =============================================================================

/// Diagnostic metrics attached to every regime result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeMetrics {
    pub trend_score: f64,
    pub volatility: f64,
    #[serde(default)]
    pub additional_metrics: BTreeMap<String, f64>,
}

/// The classification output written to `regime:{symbol}:{timeframe}`.
///
/// `regime_id` is `None` for rule-based output. `confidence` is a ranking
/// score in [0, 1], not a probability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeResult {
    pub symbol: String,
    pub regime_label: String,
    pub regime_id: Option<i32>,
    pub confidence: f64,
    pub metrics: RegimeMetrics,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_candle() -> Candle {
        Candle {
            event_type: "candle_close".into(),
            symbol: "BTC-USD".into(),
            exchange: "BINANCE".into(),
            timestamp: Utc.with_ymd_and_hms(2023, 10, 27, 12, 0, 0).unwrap(),
            open: 34000.0,
            high: 34100.0,
            low: 33900.0,
            close: 34050.0,
            volume: 105.5,
            timeframe: "1h".into(),
        }
    }

    // ---- normalize_symbol ------------------------------------------------

    #[test]
    fn normalize_usdt_pairs() {
        assert_eq!(normalize_symbol("BTCUSDT"), "BTC-USD");
        assert_eq!(normalize_symbol("ETHUSDT"), "ETH-USD");
        assert_eq!(normalize_symbol("SOLUSDT"), "SOL-USD");
    }

    #[test]
    fn normalize_busd_edge_case() {
        // Only the trailing suffix is replaced.
        assert_eq!(normalize_symbol("BUSDUSDT"), "BUSD-USD");
    }

    #[test]
    fn normalize_unknown_suffix_passthrough() {
        assert_eq!(normalize_symbol("BTCEUR"), "BTCEUR");
        assert_eq!(normalize_symbol("BTC-USD"), "BTC-USD");
    }

    #[test]
    fn normalize_bare_suffix_passthrough() {
        // "USDT" alone has no base asset; leave it untouched.
        assert_eq!(normalize_symbol("USDT"), "USDT");
    }

    // ---- Candle ----------------------------------------------------------

    #[test]
    fn well_formed_candle_accepted() {
        assert!(sample_candle().is_well_formed());
    }

    #[test]
    fn low_above_high_rejected() {
        let mut c = sample_candle();
        c.low = 35000.0;
        assert!(!c.is_well_formed());
    }

    #[test]
    fn negative_volume_rejected() {
        let mut c = sample_candle();
        c.volume = -1.0;
        assert!(!c.is_well_formed());
    }

    #[test]
    fn nan_price_rejected() {
        let mut c = sample_candle();
        c.close = f64::NAN;
        assert!(!c.is_well_formed());
    }

    #[test]
    fn candle_json_timestamp_is_iso8601() {
        let json = serde_json::to_value(sample_candle()).unwrap();
        let ts = json["timestamp"].as_str().unwrap();
        assert!(ts.starts_with("2023-10-27T12:00:00"));
    }

    #[test]
    fn candle_deserializes_without_optional_fields() {
        // Stream consumers must accept payloads that omit event_type,
        // exchange and timeframe.
        let json = r#"{
            "symbol": "BTC-USD",
            "timestamp": "2023-10-27T10:00:00Z",
            "open": 30000.0,
            "high": 30100.0,
            "low": 29900.0,
            "close": 30050.0,
            "volume": 100.0
        }"#;
        let c: Candle = serde_json::from_str(json).unwrap();
        assert_eq!(c.event_type, "candle_close");
        assert_eq!(c.exchange, "BINANCE");
        assert_eq!(c.timeframe, "1h");
        assert_eq!(c.close, 30050.0);
    }

    // ---- ClassifierMode --------------------------------------------------

    #[test]
    fn mode_parsing() {
        assert_eq!(ClassifierMode::parse("ML_CLUSTERING"), ClassifierMode::MlClustering);
        assert_eq!(ClassifierMode::parse("ml_clustering"), ClassifierMode::MlClustering);
        assert_eq!(ClassifierMode::parse("RULE_BASED"), ClassifierMode::RuleBased);
        assert_eq!(ClassifierMode::parse("bogus"), ClassifierMode::RuleBased);
    }

    // ---- ModelParameters -------------------------------------------------

    #[test]
    fn model_parameters_label_keys_roundtrip() {
        // JSONB object keys are strings; integer-keyed maps must survive.
        let mut labels = BTreeMap::new();
        labels.insert(0usize, "PANIC".to_string());
        labels.insert(3usize, "BULL".to_string());
        let params = ModelParameters {
            feature_cols: vec!["log_return".into(), "volatility".into(), "rsi".into()],
            scaler_mean: vec![0.0, 0.0, 50.0],
            scaler_scale: vec![1.0, 1.0, 10.0],
            centroids: vec![vec![0.0, 0.0, 0.0], vec![1.0, 1.0, 1.0]],
            labels,
        };
        let json = serde_json::to_string(&params).unwrap();
        assert!(json.contains("\"0\":\"PANIC\""));
        let back: ModelParameters = serde_json::from_str(&json).unwrap();
        assert_eq!(back, params);
    }
}
