// =============================================================================
// Trainer -- periodic k-means refit and model promotion
// =============================================================================
//
// Pure numerics live in `scaler`, `kmeans` and `labeling`; `job` wires them to
// the candle table and the model registry and owns the weekly schedule.

pub mod job;
pub mod kmeans;
pub mod labeling;
pub mod scaler;

pub use job::{Trainer, TrainOutcome};
pub use kmeans::{fit_kmeans, KMeansFit};
pub use labeling::auto_label_centroids;
pub use scaler::StandardScaler;
