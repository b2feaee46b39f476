// =============================================================================
// Regime classification engine
// =============================================================================
//
// Two paths produce a `RegimeResult` from the latest feature row:
//
//   * Rule-based: direction from the SMA slope against the trend threshold,
//     volatility bucket against the volatility threshold. Labels look like
//     `BULL_HIGH_VOL`; confidence is fixed at 1.0 and `regime_id` is null.
//
//   * ML: standardize the feature vector with the model's scaler (a zero
//     scale component is treated as 1), take the Euclidean-nearest centroid
//     `j`, and report `labels[j]` (`CLUSTER_{j}` when unlabeled) with
//     confidence `1 / (1 + distance)`.
//
// The ML path falls back to the rule path whenever no usable model is
// supplied; insufficient feature history produces no result at all.
// =============================================================================

use anyhow::{bail, Result};
use chrono::Utc;
use ndarray::Array1;
use std::collections::BTreeMap;
use tracing::warn;

use crate::features::{compute_features, FeatureRow};
use crate::types::{Candle, ClassifierMode, ModelParameters, RegimeMetrics, RegimeResult};

/// Pure classification logic; all I/O stays in the worker.
pub struct RegimeClassifier {
    mode: ClassifierMode,
    volatility_threshold: f64,
    trend_threshold: f64,
}

impl RegimeClassifier {
    pub fn new(mode: ClassifierMode, volatility_threshold: f64, trend_threshold: f64) -> Self {
        Self {
            mode,
            volatility_threshold,
            trend_threshold,
        }
    }

    pub fn mode(&self) -> ClassifierMode {
        self.mode
    }

    /// Classify the market state at the end of `candles`.
    ///
    /// Returns `None` when the window is too short to produce the required
    /// features (warm-up NaN); the caller acks and waits for a later candle.
    /// `model` is only consulted in ML mode.
    pub fn classify(
        &self,
        candles: &[Candle],
        model: Option<&ModelParameters>,
    ) -> Option<RegimeResult> {
        if candles.is_empty() {
            return None;
        }

        let frame = compute_features(candles);
        let state = frame.last()?;
        let symbol = &candles.last()?.symbol;

        if state.volatility.is_nan() {
            return None;
        }

        match self.mode {
            ClassifierMode::RuleBased => Some(self.rule_classify(state, symbol)),
            ClassifierMode::MlClustering => {
                let Some(params) = model else {
                    warn!(symbol = %symbol, "no active model, falling back to rule-based classification");
                    return Some(self.rule_classify(state, symbol));
                };

                if state.has_nan(&params.feature_cols) {
                    // The model needs columns the window cannot provide yet.
                    return None;
                }

                match self.ml_classify(state, params, symbol) {
                    Ok(result) => Some(result),
                    Err(e) => {
                        warn!(symbol = %symbol, error = %e, "ML classification failed, falling back to rule-based");
                        Some(self.rule_classify(state, symbol))
                    }
                }
            }
        }
    }

    /// Threshold rules over the latest feature row.
    fn rule_classify(&self, state: &FeatureRow, symbol: &str) -> RegimeResult {
        let trend = state.sma_slope;

        // NaN compares false on both sides, which lands on SIDEWAYS.
        let direction = if trend > self.trend_threshold {
            "BULL"
        } else if trend < -self.trend_threshold {
            "BEAR"
        } else {
            "SIDEWAYS"
        };

        let vol_label = if state.volatility > self.volatility_threshold {
            "HIGH_VOL"
        } else {
            "LOW_VOL"
        };

        RegimeResult {
            symbol: symbol.to_string(),
            regime_label: format!("{direction}_{vol_label}"),
            regime_id: None,
            confidence: 1.0,
            metrics: metrics_from(state),
            updated_at: Utc::now(),
        }
    }

    /// Nearest-centroid match in the model's standardized feature space.
    fn ml_classify(
        &self,
        state: &FeatureRow,
        params: &ModelParameters,
        symbol: &str,
    ) -> Result<RegimeResult> {
        if params.centroids.is_empty() {
            bail!("model has no centroids");
        }

        let dims = params.feature_cols.len();
        if params.scaler_mean.len() != dims || params.scaler_scale.len() != dims {
            bail!(
                "scaler shape mismatch: {} feature columns vs {}/{} scaler entries",
                dims,
                params.scaler_mean.len(),
                params.scaler_scale.len()
            );
        }

        // Compose the vector in the order the registry dictates.
        let mut raw = Vec::with_capacity(dims);
        for col in &params.feature_cols {
            match state.value(col) {
                Some(v) => raw.push(v),
                None => bail!("model references unknown feature column {col}"),
            }
        }

        let x = Array1::from(raw);
        let mean = Array1::from(params.scaler_mean.clone());
        let scale = Array1::from_iter(
            params
                .scaler_scale
                .iter()
                .map(|&s| if s == 0.0 { 1.0 } else { s }),
        );
        let z = (&x - &mean) / &scale;

        let mut nearest: Option<(usize, f64)> = None;
        for (index, centroid) in params.centroids.iter().enumerate() {
            if centroid.len() != dims {
                bail!("centroid {index} has {} dims, expected {dims}", centroid.len());
            }
            let c = Array1::from(centroid.clone());
            let distance = (&z - &c).mapv(|v| v * v).sum().sqrt();
            if nearest.map_or(true, |(_, best)| distance < best) {
                nearest = Some((index, distance));
            }
        }

        let (index, distance) = nearest.expect("centroids checked non-empty");
        let label = params
            .labels
            .get(&index)
            .cloned()
            .unwrap_or_else(|| format!("CLUSTER_{index}"));

        Ok(RegimeResult {
            symbol: symbol.to_string(),
            regime_label: label,
            regime_id: Some(index as i32),
            confidence: 1.0 / (1.0 + distance),
            metrics: metrics_from(state),
            updated_at: Utc::now(),
        })
    }
}

/// Diagnostic metrics for a result; NaN features render as 0 so the JSON
/// stays numeric.
fn metrics_from(state: &FeatureRow) -> RegimeMetrics {
    let finite = |v: f64| if v.is_nan() { 0.0 } else { v };
    let mut additional = BTreeMap::new();
    additional.insert("rsi".to_string(), finite(state.rsi));

    RegimeMetrics {
        trend_score: finite(state.sma_slope),
        volatility: finite(state.volatility),
        additional_metrics: additional,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn feature_row(volatility: f64, sma_slope: f64, rsi: f64) -> FeatureRow {
        FeatureRow {
            timestamp: Utc.with_ymd_and_hms(2023, 10, 27, 12, 0, 0).unwrap(),
            log_return: 0.001,
            volatility,
            sma: 34000.0,
            sma_slope,
            rsi,
        }
    }

    fn rule_engine() -> RegimeClassifier {
        RegimeClassifier::new(ClassifierMode::RuleBased, 0.02, 0.0)
    }

    fn window(closes: &[f64]) -> Vec<Candle> {
        let base = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Candle {
                event_type: "candle_close".into(),
                symbol: "BTC-USD".into(),
                exchange: "BINANCE".into(),
                timestamp: base + chrono::Duration::hours(i as i64),
                open: close,
                high: close + 1.0,
                low: close - 1.0,
                close,
                volume: 10.0,
                timeframe: "1h".into(),
            })
            .collect()
    }

    fn noisy_closes(n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| 100.0 + i as f64 * 0.5 + if i % 2 == 0 { 1.0 } else { -1.0 })
            .collect()
    }

    // ---- rule path --------------------------------------------------------

    #[test]
    fn bull_high_vol() {
        let engine = rule_engine();
        let result = engine.rule_classify(&feature_row(0.05, 0.8, 60.0), "BTC-USD");
        assert_eq!(result.regime_label, "BULL_HIGH_VOL");
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.regime_id, None);
        assert_eq!(result.metrics.trend_score, 0.8);
        assert_eq!(result.metrics.volatility, 0.05);
        assert_eq!(result.metrics.additional_metrics["rsi"], 60.0);
    }

    #[test]
    fn bear_low_vol() {
        let engine = rule_engine();
        let result = engine.rule_classify(&feature_row(0.01, -0.5, 40.0), "BTC-USD");
        assert_eq!(result.regime_label, "BEAR_LOW_VOL");
    }

    #[test]
    fn zero_slope_is_sideways() {
        let engine = rule_engine();
        let result = engine.rule_classify(&feature_row(0.05, 0.0, 50.0), "BTC-USD");
        assert_eq!(result.regime_label, "SIDEWAYS_HIGH_VOL");
    }

    #[test]
    fn nan_slope_is_sideways_with_zero_trend_score() {
        let engine = rule_engine();
        let result = engine.rule_classify(&feature_row(0.01, f64::NAN, 50.0), "BTC-USD");
        assert_eq!(result.regime_label, "SIDEWAYS_LOW_VOL");
        assert_eq!(result.metrics.trend_score, 0.0);
    }

    #[test]
    fn rule_labels_match_contract() {
        let engine = rule_engine();
        for (vol, slope) in [(0.05, 0.8), (0.05, -0.8), (0.01, 0.0), (0.01, 0.8)] {
            let label = engine.rule_classify(&feature_row(vol, slope, 50.0), "X").regime_label;
            let (direction, vol_part) = label.split_once('_').unwrap();
            assert!(matches!(direction, "BULL" | "BEAR" | "SIDEWAYS"), "{label}");
            assert!(matches!(vol_part, "HIGH_VOL" | "LOW_VOL"), "{label}");
        }
    }

    // ---- ML path ----------------------------------------------------------

    fn two_cluster_model() -> ModelParameters {
        let mut labels = BTreeMap::new();
        labels.insert(0, "CALM".to_string());
        labels.insert(1, "PANIC".to_string());
        ModelParameters {
            feature_cols: vec!["volatility".into(), "sma_slope".into(), "rsi".into()],
            scaler_mean: vec![0.0, 0.0, 0.0],
            scaler_scale: vec![1.0, 1.0, 1.0],
            centroids: vec![vec![0.0, 0.0, 50.0], vec![1.0, 1.0, 80.0]],
            labels,
        }
    }

    #[test]
    fn nearest_centroid_wins() {
        let engine = RegimeClassifier::new(ClassifierMode::MlClustering, 0.02, 0.0);
        let state = feature_row(0.9, 0.9, 75.0);
        let result = engine.ml_classify(&state, &two_cluster_model(), "BTC-USD").unwrap();

        assert_eq!(result.regime_label, "PANIC");
        assert_eq!(result.regime_id, Some(1));

        let expected_distance = (0.1f64.powi(2) + 0.1f64.powi(2) + 5.0f64.powi(2)).sqrt();
        let expected_confidence = 1.0 / (1.0 + expected_distance);
        assert!((result.confidence - expected_confidence).abs() < 1e-12);
    }

    #[test]
    fn missing_label_falls_back_to_cluster_name() {
        let engine = RegimeClassifier::new(ClassifierMode::MlClustering, 0.02, 0.0);
        let mut params = two_cluster_model();
        params.labels.remove(&1);
        let result = engine
            .ml_classify(&feature_row(0.9, 0.9, 75.0), &params, "BTC-USD")
            .unwrap();
        assert_eq!(result.regime_label, "CLUSTER_1");
    }

    #[test]
    fn zero_scale_component_is_identity() {
        let engine = RegimeClassifier::new(ClassifierMode::MlClustering, 0.02, 0.0);
        let mut params = two_cluster_model();
        params.scaler_scale = vec![0.0, 0.0, 0.0];
        // With scale treated as 1 and zero mean, standardization is identity.
        let result = engine
            .ml_classify(&feature_row(0.9, 0.9, 75.0), &params, "BTC-USD")
            .unwrap();
        assert_eq!(result.regime_id, Some(1));
    }

    #[test]
    fn centroid_shape_mismatch_is_an_error() {
        let engine = RegimeClassifier::new(ClassifierMode::MlClustering, 0.02, 0.0);
        let mut params = two_cluster_model();
        params.centroids[1] = vec![1.0, 1.0];
        assert!(engine
            .ml_classify(&feature_row(0.9, 0.9, 75.0), &params, "BTC-USD")
            .is_err());
    }

    // ---- classify (end-to-end over candle windows) ------------------------

    #[test]
    fn short_window_yields_no_result() {
        let engine = rule_engine();
        // Fewer than the volatility warm-up: no classification.
        assert!(engine.classify(&window(&noisy_closes(10)), None).is_none());
    }

    #[test]
    fn long_window_classifies() {
        let engine = rule_engine();
        let result = engine.classify(&window(&noisy_closes(120)), None).unwrap();
        assert!(result.regime_label.ends_with("_VOL"));
        assert_eq!(result.symbol, "BTC-USD");
    }

    #[test]
    fn ml_mode_without_model_falls_back_to_rules() {
        let engine = RegimeClassifier::new(ClassifierMode::MlClustering, 0.02, 0.0);
        let result = engine.classify(&window(&noisy_closes(120)), None).unwrap();
        // Rule-path output: no cluster id, confidence pinned to 1.0.
        assert_eq!(result.regime_id, None);
        assert_eq!(result.confidence, 1.0);
        assert!(result.regime_label.ends_with("_VOL"));
    }

    #[test]
    fn ml_mode_with_model_classifies_against_centroids() {
        let engine = RegimeClassifier::new(ClassifierMode::MlClustering, 0.02, 0.0);
        let result = engine
            .classify(&window(&noisy_closes(120)), Some(&two_cluster_model()))
            .unwrap();
        assert!(result.regime_id.is_some());
        assert!(result.confidence > 0.0 && result.confidence <= 1.0);
    }
}
