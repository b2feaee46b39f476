// =============================================================================
// Centroid auto-labeling -- economic names for discovered clusters
// =============================================================================
//
// The trainer's feature order is (log_return, volatility, rsi), so in
// standardized space component 0 is the return and component 1 the
// volatility. Labeling is deterministic:
//
//   PANIC  -> the centroid maximizing z_vol - z_ret (high volatility paired
//             with negative return)
//   BULL   -> among the rest, the centroid with the highest return after
//             mapping back to the original feature space
//   others -> REGIME_{i}
// =============================================================================

use std::collections::BTreeMap;

use ndarray::Array2;

use crate::trainer::scaler::StandardScaler;

/// Assign regime names to the rows of `centroids` (standardized space).
///
/// With fewer than two feature dimensions there is no volatility component to
/// rank on; every cluster keeps its generic name.
pub fn auto_label_centroids(
    centroids: &Array2<f64>,
    scaler: &StandardScaler,
) -> BTreeMap<usize, String> {
    let k = centroids.nrows();
    let mut labels = BTreeMap::new();

    if centroids.ncols() < 2 {
        for i in 0..k {
            labels.insert(i, format!("REGIME_{i}"));
        }
        return labels;
    }

    let mut remaining: Vec<usize> = (0..k).collect();

    // PANIC: highest volatility combined with the most negative return.
    let panic = remaining
        .iter()
        .copied()
        .max_by(|&a, &b| {
            let score = |i: usize| centroids[[i, 1]] - centroids[[i, 0]];
            score(a)
                .partial_cmp(&score(b))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .expect("k is at least 1");
    labels.insert(panic, "PANIC".to_string());
    remaining.retain(|&i| i != panic);

    // BULL: highest raw return among the remaining clusters.
    if let Some(bull) = remaining.iter().copied().max_by(|&a, &b| {
        let raw_return = |i: usize| {
            let row: Vec<f64> = centroids.row(i).to_vec();
            scaler.inverse_transform_row(&row)[0]
        };
        raw_return(a)
            .partial_cmp(&raw_return(b))
            .unwrap_or(std::cmp::Ordering::Equal)
    }) {
        labels.insert(bull, "BULL".to_string());
        remaining.retain(|&i| i != bull);
    }

    for i in remaining {
        labels.insert(i, format!("REGIME_{i}"));
    }
    labels
}
