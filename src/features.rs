// =============================================================================
// Feature library -- technical features for the regime classifier
// =============================================================================
//
// Pure functions from an ordered candle sequence to a feature frame aligned by
// timestamp. Both the classifier worker and the trainer call into this module
// so that online and batch features can never drift.
//
//   log_return = ln(close_t / close_{t-1})
//   volatility = sample stddev of log_return over a 24-candle window
//   sma        = mean of close over a 50-candle window
//   sma_slope  = sma_t - sma_{t-1}
//   rsi        = 100 - 100 / (1 + RS),  RS = mean(gain, 14) / mean(loss, 14)
//                (RSI is 100 when the mean loss is zero)
//
// Rows inside the warm-up prefix of each rolling window carry NaN; consumers
// decide whether a NaN row is an error or simply "not enough history yet".
// =============================================================================

use chrono::{DateTime, Utc};

use crate::types::Candle;

/// Rolling window for the volatility estimate (hourly candles: one day).
pub const VOLATILITY_WINDOW: usize = 24;
/// Rolling window for the simple moving average.
pub const SMA_WINDOW: usize = 50;
/// Rolling window for the RSI gain/loss means.
pub const RSI_WINDOW: usize = 14;

// =============================================================================
// Feature row
// =============================================================================

/// One feature vector, aligned to the candle that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub timestamp: DateTime<Utc>,
    pub log_return: f64,
    pub volatility: f64,
    pub sma: f64,
    pub sma_slope: f64,
    pub rsi: f64,
}

impl FeatureRow {
    /// Look a feature up by its registry column name.
    ///
    /// The ML path composes its input vector from the model record's
    /// `feature_cols` list, so column access has to be by name rather than by
    /// struct field.
    pub fn value(&self, column: &str) -> Option<f64> {
        match column {
            "log_return" => Some(self.log_return),
            "volatility" => Some(self.volatility),
            "sma" => Some(self.sma),
            "sma_slope" => Some(self.sma_slope),
            "rsi" => Some(self.rsi),
            _ => None,
        }
    }

    /// True when any of the named columns is NaN or unknown.
    pub fn has_nan(&self, columns: &[String]) -> bool {
        columns
            .iter()
            .any(|c| self.value(c).map_or(true, f64::is_nan))
    }
}

// =============================================================================
// Feature computation
// =============================================================================

/// Compute the feature frame for an ordered candle sequence.
///
/// Input is expected sorted by time; unsorted input is sorted first (stable,
/// by timestamp). Output has exactly one row per input candle, in time order.
pub fn compute_features(candles: &[Candle]) -> Vec<FeatureRow> {
    if candles.is_empty() {
        return Vec::new();
    }

    let sorted: Vec<&Candle>;
    let ordered: &[&Candle] = if candles.windows(2).all(|w| w[0].timestamp <= w[1].timestamp) {
        sorted = candles.iter().collect();
        &sorted
    } else {
        let mut v: Vec<&Candle> = candles.iter().collect();
        v.sort_by_key(|c| c.timestamp);
        sorted = v;
        &sorted
    };

    let closes: Vec<f64> = ordered.iter().map(|c| c.close).collect();

    let log_returns = log_returns(&closes);
    let volatility = rolling_std(&log_returns, VOLATILITY_WINDOW);
    let sma = rolling_mean(&closes, SMA_WINDOW);
    let sma_slope = diff(&sma);
    let rsi = rsi_series(&closes, RSI_WINDOW);

    ordered
        .iter()
        .enumerate()
        .map(|(i, c)| FeatureRow {
            timestamp: c.timestamp,
            log_return: log_returns[i],
            volatility: volatility[i],
            sma: sma[i],
            sma_slope: sma_slope[i],
            rsi: rsi[i],
        })
        .collect()
}

/// `ln(close_t / close_{t-1})`, NaN at index 0.
fn log_returns(closes: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(closes.len());
    out.push(f64::NAN);
    for w in closes.windows(2) {
        out.push((w[1] / w[0]).ln());
    }
    out
}

/// First difference, NaN at index 0. NaN inputs propagate.
fn diff(values: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(values.len());
    out.push(f64::NAN);
    for w in values.windows(2) {
        out.push(w[1] - w[0]);
    }
    out
}

/// Rolling mean over a fixed window.
///
/// A full window of non-NaN values is required; otherwise the output is NaN.
fn rolling_mean(values: &[f64], window: usize) -> Vec<f64> {
    rolling(values, window, |slice| {
        slice.iter().sum::<f64>() / slice.len() as f64
    })
}

/// Rolling sample standard deviation (ddof = 1) over a fixed window.
fn rolling_std(values: &[f64], window: usize) -> Vec<f64> {
    rolling(values, window, |slice| {
        let n = slice.len() as f64;
        let mean = slice.iter().sum::<f64>() / n;
        let var = slice.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
        var.sqrt()
    })
}

fn rolling(values: &[f64], window: usize, f: impl Fn(&[f64]) -> f64) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if window == 0 {
        return out;
    }
    for i in 0..values.len() {
        if i + 1 < window {
            continue;
        }
        let slice = &values[i + 1 - window..=i];
        if slice.iter().any(|v| v.is_nan()) {
            continue;
        }
        out[i] = f(slice);
    }
    out
}

/// RSI over rolling means of gains and losses.
///
/// # Edge cases
/// - Warm-up prefix (first `window` candles) is NaN.
/// - Zero mean loss (only gains in the window) yields RSI = 100.
/// - Output values always lie in [0, 100].
fn rsi_series(closes: &[f64], window: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; closes.len()];
    if closes.len() < window + 1 {
        return out;
    }

    // Price deltas, aligned so deltas[i] = close[i] - close[i-1].
    let mut gains = vec![f64::NAN; closes.len()];
    let mut losses = vec![f64::NAN; closes.len()];
    for i in 1..closes.len() {
        let delta = closes[i] - closes[i - 1];
        gains[i] = if delta > 0.0 { delta } else { 0.0 };
        losses[i] = if delta < 0.0 { -delta } else { 0.0 };
    }

    let avg_gain = rolling_mean(&gains, window);
    let avg_loss = rolling_mean(&losses, window);

    for i in 0..closes.len() {
        let (gain, loss) = (avg_gain[i], avg_loss[i]);
        if gain.is_nan() || loss.is_nan() {
            continue;
        }
        out[i] = if loss == 0.0 {
            100.0
        } else {
            let rs = gain / loss;
            100.0 - 100.0 / (1.0 + rs)
        };
    }
    out
}
