// =============================================================================
// Raw candle store -- append-only OHLCV history
// =============================================================================
//
// `raw_candles` is time-partitioned (hypertable) when the TimescaleDB
// extension is present; on plain Postgres the table works unpartitioned and
// the hypertable call is skipped with a warning.
//
// Inserts are idempotent: the unique key `(time, symbol, exchange, timeframe)`
// plus `ON CONFLICT DO NOTHING` makes duplicate frames and retries safe.
// =============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tracing::{debug, warn};

use crate::types::Candle;

/// Database row shape for `raw_candles`.
#[derive(Debug, FromRow)]
struct CandleRow {
    time: DateTime<Utc>,
    symbol: String,
    exchange: String,
    timeframe: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

impl From<CandleRow> for Candle {
    fn from(row: CandleRow) -> Self {
        Candle {
            event_type: "candle_close".to_string(),
            symbol: row.symbol,
            exchange: row.exchange,
            timestamp: row.time,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume,
            timeframe: row.timeframe,
        }
    }
}

/// Store for reading and writing `raw_candles`.
#[derive(Clone)]
pub struct CandleStore {
    pool: PgPool,
}

impl CandleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Ensure the table and its unique constraint exist, then try to convert
    /// it into a hypertable.
    ///
    /// Idempotent: safe to run on every startup, before the first insert.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS raw_candles (
                time        TIMESTAMPTZ       NOT NULL,
                symbol      TEXT              NOT NULL,
                exchange    TEXT              NOT NULL,
                timeframe   TEXT              NOT NULL,
                open        DOUBLE PRECISION  NOT NULL,
                high        DOUBLE PRECISION  NOT NULL,
                low         DOUBLE PRECISION  NOT NULL,
                close       DOUBLE PRECISION  NOT NULL,
                volume      DOUBLE PRECISION  NOT NULL,
                UNIQUE (time, symbol, exchange, timeframe)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create raw_candles table")?;

        // TimescaleDB-specific; plain Postgres rejects this and that is fine.
        let hypertable = sqlx::query(
            "SELECT create_hypertable('raw_candles', 'time', if_not_exists => TRUE)",
        )
        .execute(&self.pool)
        .await;

        if let Err(e) = hypertable {
            warn!(error = %e, "could not create hypertable (extension missing or already converted)");
        }

        Ok(())
    }

    /// Insert a candle, ignoring conflicts on the unique key.
    ///
    /// Returns `true` when a row was actually written, `false` when the candle
    /// already existed (duplicate frame or replay).
    pub async fn insert_candle(&self, candle: &Candle) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO raw_candles (time, symbol, exchange, timeframe, open, high, low, close, volume)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (time, symbol, exchange, timeframe) DO NOTHING
            "#,
        )
        .bind(candle.timestamp)
        .bind(&candle.symbol)
        .bind(&candle.exchange)
        .bind(&candle.timeframe)
        .bind(candle.open)
        .bind(candle.high)
        .bind(candle.low)
        .bind(candle.close)
        .bind(candle.volume)
        .execute(&self.pool)
        .await
        .context("failed to insert candle")?;

        let inserted = result.rows_affected() > 0;
        if !inserted {
            debug!(symbol = %candle.symbol, ts = %candle.timestamp, "duplicate candle ignored");
        }
        Ok(inserted)
    }

    /// Fetch the most recent `limit` candles for `(symbol, timeframe)`,
    /// returned oldest-first.
    pub async fn recent_candles(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let rows: Vec<CandleRow> = sqlx::query_as(
            r#"
            SELECT time, symbol, exchange, timeframe, open, high, low, close, volume
            FROM raw_candles
            WHERE symbol = $1 AND timeframe = $2
            ORDER BY time DESC
            LIMIT $3
            "#,
        )
        .bind(symbol)
        .bind(timeframe)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch recent candles")?;

        // Newest-first from the index scan; callers want chronological order.
        Ok(rows.into_iter().rev().map(Candle::from).collect())
    }

    /// Fetch all candles with `time >= cutoff`, ordered by symbol then time.
    ///
    /// The trainer groups the result per symbol before computing features.
    pub async fn candles_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Candle>> {
        let rows: Vec<CandleRow> = sqlx::query_as(
            r#"
            SELECT time, symbol, exchange, timeframe, open, high, low, close, volume
            FROM raw_candles
            WHERE time >= $1
            ORDER BY symbol ASC, time ASC
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch historical candles")?;

        Ok(rows.into_iter().map(Candle::from).collect())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn row_conversion_preserves_identity() {
        let row = CandleRow {
            time: Utc.with_ymd_and_hms(2023, 10, 27, 12, 0, 0).unwrap(),
            symbol: "BTC-USD".into(),
            exchange: "BINANCE".into(),
            timeframe: "1h".into(),
            open: 34000.0,
            high: 34100.0,
            low: 33900.0,
            close: 34050.0,
            volume: 105.5,
        };
        let candle = Candle::from(row);
        assert_eq!(candle.symbol, "BTC-USD");
        assert_eq!(candle.exchange, "BINANCE");
        assert_eq!(candle.timeframe, "1h");
        assert_eq!(candle.event_type, "candle_close");
        assert_eq!(candle.timestamp.to_rfc3339(), "2023-10-27T12:00:00+00:00");
        assert_eq!(candle.volume, 105.5);
    }
}
