// =============================================================================
// Training job -- historical fetch, fit, auto-label, promote
// =============================================================================
//
// Pipeline per run:
//
//   1. fetch raw candles with time >= now - lookback
//   2. per symbol, compute the shared feature frame and drop NaN rows
//   3. standardize (log_return, volatility, rsi)
//   4. fit seeded k-means, best of 10 restarts
//   5. auto-label centroids (PANIC / BULL / REGIME_{i})
//   6. promote into the registry in one transaction
//
// Empty input or an empty post-feature matrix aborts the run without touching
// the registry; a failed promotion rolls back, so the previously active model
// stays in force either way.
// =============================================================================

use anyhow::Result;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Utc};
use ndarray::Array2;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::features::compute_features;
use crate::storage::{CandleStore, ModelRegistry};
use crate::trainer::kmeans::fit_kmeans;
use crate::trainer::labeling::auto_label_centroids;
use crate::trainer::scaler::StandardScaler;
use crate::types::{Candle, ModelParameters};

/// Canonical training feature order; persisted with every model so the
/// classifier worker aligns its vector from the registry, never from code.
pub const TRAIN_FEATURE_COLS: [&str; 3] = ["log_return", "volatility", "rsi"];

/// Restart count for the k-means fit.
const N_INIT: usize = 10;

/// What a single training run did.
#[derive(Debug, PartialEq, Eq)]
pub enum TrainOutcome {
    Promoted { model_id: i32, rows: usize },
    Skipped(&'static str),
}

pub struct Trainer {
    store: CandleStore,
    registry: ModelRegistry,
    lookback_days: i64,
    k: usize,
    seed: u64,
}

impl Trainer {
    pub fn new(
        store: CandleStore,
        registry: ModelRegistry,
        lookback_days: i64,
        k: usize,
        seed: u64,
    ) -> Self {
        Self {
            store,
            registry,
            lookback_days,
            k,
            seed,
        }
    }

    /// Execute one full training run.
    pub async fn run_once(&self) -> Result<TrainOutcome> {
        info!(lookback_days = self.lookback_days, k = self.k, "starting training run");

        let cutoff = Utc::now() - ChronoDuration::days(self.lookback_days);
        let candles = self.store.candles_since(cutoff).await?;
        if candles.is_empty() {
            warn!("no candles in lookback window, aborting training run");
            return Ok(TrainOutcome::Skipped("no candles"));
        }
        info!(rows = candles.len(), "fetched historical candles");

        let matrix = build_feature_matrix(&candles);
        if matrix.nrows() == 0 {
            warn!("feature frame is empty after dropping warm-up rows, aborting");
            return Ok(TrainOutcome::Skipped("no feature rows"));
        }
        if matrix.nrows() < self.k {
            warn!(
                rows = matrix.nrows(),
                k = self.k,
                "fewer feature rows than clusters, aborting"
            );
            return Ok(TrainOutcome::Skipped("fewer rows than clusters"));
        }

        let scaler = StandardScaler::fit(&matrix)?;
        let standardized = scaler.transform(&matrix);

        let fit = fit_kmeans(&standardized, self.k, N_INIT, self.seed)?;
        let labels = auto_label_centroids(&fit.centroids, &scaler);
        info!(labels = ?labels, inertia = fit.inertia, "clusters labeled");

        let parameters = ModelParameters {
            feature_cols: TRAIN_FEATURE_COLS.iter().map(|s| s.to_string()).collect(),
            scaler_mean: scaler.mean.to_vec(),
            scaler_scale: scaler.scale.to_vec(),
            centroids: fit
                .centroids
                .outer_iter()
                .map(|row| row.to_vec())
                .collect(),
            labels,
        };

        let model_id = self.registry.promote("KMeans", &parameters).await?;

        Ok(TrainOutcome::Promoted {
            model_id,
            rows: matrix.nrows(),
        })
    }

    /// Run once immediately (so a fresh deployment has a model), then every
    /// Sunday at 00:00 UTC until shutdown.
    ///
    /// Individual run failures are logged and do not stop the schedule; the
    /// previously active model simply stays in force.
    pub async fn run_scheduled(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if let Err(e) = self.run_once().await {
            error!(error = %e, "initial training run failed");
        }

        loop {
            let next = next_sunday_midnight(Utc::now());
            info!(next_run = %next, "next training run scheduled");
            let wait = (next - Utc::now()).to_std().unwrap_or_default();

            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "scheduled training run failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        info!("trainer stopped");
        Ok(())
    }
}

// =============================================================================
// Feature matrix
// =============================================================================

/// Build the (n x 3) training matrix from raw candles.
///
/// Candles are grouped per symbol so one symbol's prices never leak into
/// another's rolling windows; rows with any NaN among the training columns
/// are dropped.
pub fn build_feature_matrix(candles: &[Candle]) -> Array2<f64> {
    let mut groups: std::collections::BTreeMap<String, Vec<Candle>> =
        std::collections::BTreeMap::new();
    for candle in candles {
        groups
            .entry(candle.symbol.clone())
            .or_default()
            .push(candle.clone());
    }

    let mut flat: Vec<f64> = Vec::new();
    let mut rows = 0usize;
    for group in groups.values() {
        for feature in compute_features(group) {
            let row = [feature.log_return, feature.volatility, feature.rsi];
            if row.iter().any(|v| v.is_nan()) {
                continue;
            }
            flat.extend_from_slice(&row);
            rows += 1;
        }
    }

    Array2::from_shape_vec((rows, TRAIN_FEATURE_COLS.len()), flat)
        .expect("row count tracks pushed elements")
}

// =============================================================================
// Scheduling
// =============================================================================

/// First Sunday 00:00 UTC strictly after `after`.
pub fn next_sunday_midnight(after: DateTime<Utc>) -> DateTime<Utc> {
    let date = after.date_naive();
    let days_ahead = (7 - date.weekday().num_days_from_sunday()) % 7;
    let candidate_date = date + ChronoDuration::days(i64::from(days_ahead));
    let candidate = Utc.from_utc_datetime(
        &candidate_date
            .and_hms_opt(0, 0, 0)
            .expect("midnight is always valid"),
    );

    if candidate <= after {
        candidate + ChronoDuration::days(7)
    } else {
        candidate
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn candle(symbol: &str, hours: i64, close: f64) -> Candle {
        let base = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        Candle {
            event_type: "candle_close".into(),
            symbol: symbol.into(),
            exchange: "BINANCE".into(),
            timestamp: base + Duration::hours(hours),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 10.0,
            timeframe: "1h".into(),
        }
    }

    fn series(symbol: &str, n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let close = 100.0 + i as f64 * 0.3 + if i % 2 == 0 { 0.5 } else { -0.5 };
                candle(symbol, i as i64, close)
            })
            .collect()
    }

    // ---- feature matrix ---------------------------------------------------

    #[test]
    fn matrix_drops_warmup_rows_per_symbol() {
        let mut candles = series("BTC-USD", 100);
        candles.extend(series("ETH-USD", 100));
        let matrix = build_feature_matrix(&candles);

        // The training columns need the volatility warm-up (24 rows) per
        // symbol: 76 usable rows each.
        assert_eq!(matrix.nrows(), 2 * (100 - 24));
        assert_eq!(matrix.ncols(), 3);
        assert!(matrix.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn matrix_is_empty_for_short_series() {
        let candles = series("BTC-USD", 20);
        assert_eq!(build_feature_matrix(&candles).nrows(), 0);
    }

    #[test]
    fn symbols_do_not_leak_into_each_other() {
        // A huge price gap between symbols would show up as an outlier log
        // return if the groups were concatenated naively.
        let mut candles = series("AAA-USD", 60);
        let shifted: Vec<Candle> = series("BBB-USD", 60)
            .into_iter()
            .map(|mut c| {
                c.open += 100_000.0;
                c.high += 100_000.0;
                c.low += 100_000.0;
                c.close += 100_000.0;
                c
            })
            .collect();
        candles.extend(shifted);

        let matrix = build_feature_matrix(&candles);
        // Hourly drift of ~0.3 on a 100k base: every |log_return| is tiny.
        assert!(matrix.column(0).iter().all(|r| r.abs() < 0.05));
    }

    // ---- scheduling -------------------------------------------------------

    #[test]
    fn next_run_from_midweek() {
        // 2023-10-25 is a Wednesday.
        let after = Utc.with_ymd_and_hms(2023, 10, 25, 15, 30, 0).unwrap();
        let next = next_sunday_midnight(after);
        assert_eq!(next, Utc.with_ymd_and_hms(2023, 10, 29, 0, 0, 0).unwrap());
    }

    #[test]
    fn next_run_from_sunday_midnight_is_a_week_later() {
        // 2023-10-29 is a Sunday.
        let after = Utc.with_ymd_and_hms(2023, 10, 29, 0, 0, 0).unwrap();
        let next = next_sunday_midnight(after);
        assert_eq!(next, Utc.with_ymd_and_hms(2023, 11, 5, 0, 0, 0).unwrap());
    }

    #[test]
    fn next_run_from_sunday_morning_is_next_sunday() {
        let after = Utc.with_ymd_and_hms(2023, 10, 29, 10, 0, 0).unwrap();
        let next = next_sunday_midnight(after);
        assert_eq!(next, Utc.with_ymd_and_hms(2023, 11, 5, 0, 0, 0).unwrap());
    }
}
