// =============================================================================
// Classifier -- regime assignment for incoming candles
// =============================================================================
//
// `engine` holds the pure decision logic (rule thresholds and nearest-centroid
// matching); `worker` owns the consumer-group loop, the history merge against
// the candle table and the result write.

pub mod engine;
pub mod worker;

pub use engine::RegimeClassifier;
pub use worker::{merge_window, ClassifierWorker};
