// =============================================================================
// Classifier worker -- consumer-group loop over the candle feed
// =============================================================================
//
// For each delivered candle the worker:
//
//   1. fetches the trailing history window for `(symbol, timeframe)` from the
//      candle table, oldest-first
//   2. merges the incoming candle (the DB row wins when timestamps collide,
//      which also absorbs duplicate stream deliveries)
//   3. classifies the merged window and writes the result to
//      `regime:{symbol}:{timeframe}`
//   4. acks the stream entry
//
// A processing failure leaves the entry pending so the group redelivers it; a
// window that is still warming up produces no result but is acked, since the
// candle itself is already persisted.
// =============================================================================

use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::classifier::engine::RegimeClassifier;
use crate::regime_store::RegimeStore;
use crate::storage::{CandleStore, ModelRegistry};
use crate::stream::consumer::parse_candle_entry;
use crate::stream::StreamConsumer;
use crate::types::{Candle, ClassifierMode};

/// Pause after a transient stream error before retrying the read loop.
const READ_RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct ClassifierWorker {
    consumer: StreamConsumer,
    store: CandleStore,
    registry: ModelRegistry,
    regime_store: RegimeStore,
    classifier: RegimeClassifier,
    history_window: usize,
    shutdown: watch::Receiver<bool>,
}

impl ClassifierWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        consumer: StreamConsumer,
        store: CandleStore,
        registry: ModelRegistry,
        regime_store: RegimeStore,
        classifier: RegimeClassifier,
        history_window: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            consumer,
            store,
            registry,
            regime_store,
            classifier,
            history_window,
            shutdown,
        }
    }

    /// Consume the stream until shutdown. The consumer group is created (or
    /// confirmed) first; failure there is fatal for the process.
    pub async fn run(&mut self) -> Result<()> {
        self.consumer.ensure_group().await?;
        info!("classifier worker listening");

        while !*self.shutdown.borrow() {
            let entries = tokio::select! {
                _ = self.shutdown.changed() => break,
                read = self.consumer.read_next() => match read {
                    Ok(entries) => entries,
                    Err(e) => {
                        error!(error = %e, "stream read failed, retrying");
                        tokio::time::sleep(READ_RETRY_DELAY).await;
                        continue;
                    }
                },
            };

            for entry in entries {
                // The in-flight entry is always completed, even during
                // shutdown; it is bounded and short.
                match self.handle_entry(&entry.id, &entry.fields).await {
                    Ok(()) => {
                        if let Err(e) = self.consumer.ack(&entry.id).await {
                            error!(entry = %entry.id, error = %e, "failed to ack entry");
                        }
                    }
                    Err(e) => {
                        // Left pending on purpose: the group redelivers it
                        // after recovery.
                        error!(entry = %entry.id, error = %e, "failed to process entry, leaving pending");
                    }
                }
            }
        }

        info!("classifier worker stopped");
        Ok(())
    }

    async fn handle_entry(
        &mut self,
        entry_id: &str,
        fields: &std::collections::HashMap<String, String>,
    ) -> Result<()> {
        let candle = parse_candle_entry(fields)?;
        info!(entry = %entry_id, symbol = %candle.symbol, ts = %candle.timestamp, "processing candle");
        self.process_candle(&candle).await
    }

    /// Classify one candle against its merged history window.
    async fn process_candle(&mut self, candle: &Candle) -> Result<()> {
        let history = self
            .store
            .recent_candles(&candle.symbol, &candle.timeframe, self.history_window)
            .await?;
        let window = merge_window(history, candle);

        // The registry record is loaded per classification so a freshly
        // promoted model takes effect without a restart. A load failure is a
        // fallback, not a processing error.
        let model = if self.classifier.mode() == ClassifierMode::MlClustering {
            match self.registry.active_model().await {
                Ok(record) => record,
                Err(e) => {
                    warn!(error = %e, "failed to load active model");
                    None
                }
            }
        } else {
            None
        };

        match self
            .classifier
            .classify(&window, model.as_ref().map(|m| &m.parameters))
        {
            Some(result) => {
                info!(symbol = %candle.symbol, label = %result.regime_label, "candle classified");
                self.regime_store.save(&result, &candle.timeframe).await?;
            }
            None => {
                warn!(symbol = %candle.symbol, ts = %candle.timestamp, "insufficient history, no regime written");
            }
        }

        Ok(())
    }
}

// =============================================================================
// History merge
// =============================================================================

/// Merge the incoming candle into its DB history window.
///
/// The history is oldest-first. When the last stored row carries the incoming
/// candle's timestamp the stored row is authoritative (the candle was already
/// persisted by the ingestor before it was published); otherwise the incoming
/// candle extends the window.
pub fn merge_window(history: Vec<Candle>, incoming: &Candle) -> Vec<Candle> {
    let mut window = history;
    match window.last() {
        Some(last) if last.timestamp == incoming.timestamp => {}
        _ => window.push(incoming.clone()),
    }
    window
}
