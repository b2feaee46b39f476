// =============================================================================
// K-means -- Lloyd's algorithm with k-means++ seeding
// =============================================================================
//
// Deterministic by construction: all randomness flows from one seeded RNG, so
// a given (data, k, n_init, seed) always yields the same model. The best of
// `n_init` restarts (lowest inertia) wins, mirroring the batch behavior the
// registry consumers were tuned against.
// =============================================================================

use anyhow::{ensure, Result};
use ndarray::{Array2, ArrayView1, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const MAX_ITERATIONS: usize = 300;
/// Convergence threshold on the total squared centroid shift per iteration.
const SHIFT_TOLERANCE: f64 = 1e-8;

/// Result of a k-means fit.
#[derive(Debug, Clone)]
pub struct KMeansFit {
    /// k x d cluster centers.
    pub centroids: Array2<f64>,
    /// Cluster index per input row.
    pub labels: Vec<usize>,
    /// Sum of squared distances of samples to their nearest centroid.
    pub inertia: f64,
}

/// Fit k-means on `data` (rows are samples) with `n_init` seeded restarts.
pub fn fit_kmeans(data: &Array2<f64>, k: usize, n_init: usize, seed: u64) -> Result<KMeansFit> {
    ensure!(k > 0, "k must be positive");
    ensure!(n_init > 0, "n_init must be positive");
    ensure!(
        data.nrows() >= k,
        "need at least k={k} samples, got {}",
        data.nrows()
    );

    let mut rng = StdRng::seed_from_u64(seed);
    let mut best: Option<KMeansFit> = None;

    for _ in 0..n_init {
        let centroids = kmeans_pp_init(data, k, &mut rng);
        let fit = lloyd(data, centroids);
        if best.as_ref().map_or(true, |b| fit.inertia < b.inertia) {
            best = Some(fit);
        }
    }

    Ok(best.expect("n_init checked positive"))
}

/// k-means++ seeding: the first center is uniform, each further center is
/// drawn with probability proportional to its squared distance from the
/// nearest already-chosen center.
fn kmeans_pp_init(data: &Array2<f64>, k: usize, rng: &mut StdRng) -> Array2<f64> {
    let n = data.nrows();
    let mut chosen: Vec<usize> = Vec::with_capacity(k);

    let first = rng.gen_range(0..n);
    chosen.push(first);

    let mut min_sq_dist: Vec<f64> = (0..n)
        .map(|i| sq_dist(data.row(i), data.row(first)))
        .collect();

    while chosen.len() < k {
        let total: f64 = min_sq_dist.iter().sum();
        let next = if total > 0.0 {
            // Weighted draw over the squared-distance mass.
            let mut target = rng.gen::<f64>() * total;
            let mut picked = n - 1;
            for (i, &d) in min_sq_dist.iter().enumerate() {
                target -= d;
                if target <= 0.0 {
                    picked = i;
                    break;
                }
            }
            picked
        } else {
            // All remaining mass is zero (duplicate points); pick uniformly.
            rng.gen_range(0..n)
        };

        chosen.push(next);
        for i in 0..n {
            let d = sq_dist(data.row(i), data.row(next));
            if d < min_sq_dist[i] {
                min_sq_dist[i] = d;
            }
        }
    }

    let mut centroids = Array2::zeros((k, data.ncols()));
    for (c, &row) in chosen.iter().enumerate() {
        centroids.row_mut(c).assign(&data.row(row));
    }
    centroids
}

/// Standard Lloyd iterations from the given starting centroids.
fn lloyd(data: &Array2<f64>, mut centroids: Array2<f64>) -> KMeansFit {
    let n = data.nrows();
    let k = centroids.nrows();
    let mut labels = vec![0usize; n];

    for _ in 0..MAX_ITERATIONS {
        // Assignment step.
        for i in 0..n {
            labels[i] = nearest_centroid(data.row(i), &centroids).0;
        }

        // Update step.
        let mut sums = Array2::<f64>::zeros(centroids.raw_dim());
        let mut counts = vec![0usize; k];
        for i in 0..n {
            let c = labels[i];
            let mut row = sums.row_mut(c);
            row += &data.row(i);
            counts[c] += 1;
        }

        let mut new_centroids = centroids.clone();
        for c in 0..k {
            if counts[c] > 0 {
                new_centroids
                    .row_mut(c)
                    .assign(&(&sums.row(c) / counts[c] as f64));
            } else {
                // Empty cluster: reseed from the sample farthest from its
                // current centroid so the cluster count stays at k.
                let farthest = (0..n)
                    .max_by(|&a, &b| {
                        let da = sq_dist(data.row(a), centroids.row(labels[a]));
                        let db = sq_dist(data.row(b), centroids.row(labels[b]));
                        da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .expect("data checked non-empty");
                new_centroids.row_mut(c).assign(&data.row(farthest));
            }
        }

        let shift: f64 = (&new_centroids - &centroids)
            .mapv(|v| v * v)
            .sum_axis(Axis(1))
            .sum();
        centroids = new_centroids;

        if shift < SHIFT_TOLERANCE {
            break;
        }
    }

    // Final assignment and inertia against the converged centroids.
    let mut inertia = 0.0;
    for i in 0..n {
        let (label, d2) = nearest_centroid(data.row(i), &centroids);
        labels[i] = label;
        inertia += d2;
    }

    KMeansFit {
        centroids,
        labels,
        inertia,
    }
}

/// Index of the nearest centroid and the squared distance to it.
fn nearest_centroid(point: ArrayView1<f64>, centroids: &Array2<f64>) -> (usize, f64) {
    let mut best = (0usize, f64::INFINITY);
    for (c, centroid) in centroids.outer_iter().enumerate() {
        let d = sq_dist(point, centroid);
        if d < best.1 {
            best = (c, d);
        }
    }
    best
}

fn sq_dist(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    /// Two tight blobs around (0, 0) and (10, 10).
    fn two_blobs() -> Array2<f64> {
        let mut rows: Vec<[f64; 2]> = Vec::new();
        for i in 0..20 {
            let jitter = (i % 5) as f64 * 0.01;
            rows.push([jitter, -jitter]);
            rows.push([10.0 + jitter, 10.0 - jitter]);
        }
        let flat: Vec<f64> = rows.iter().flatten().copied().collect();
        Array2::from_shape_vec((rows.len(), 2), flat).unwrap()
    }

    #[test]
    fn separates_two_blobs() {
        let data = two_blobs();
        let fit = fit_kmeans(&data, 2, 10, 42).unwrap();

        assert_eq!(fit.centroids.nrows(), 2);
        assert_eq!(fit.labels.len(), data.nrows());

        // Rows alternate blob membership; all even rows must share a label
        // and differ from all odd rows.
        let even_label = fit.labels[0];
        let odd_label = fit.labels[1];
        assert_ne!(even_label, odd_label);
        for (i, &label) in fit.labels.iter().enumerate() {
            let expected = if i % 2 == 0 { even_label } else { odd_label };
            assert_eq!(label, expected, "row {i}");
        }

        // One centroid near each blob center.
        let mut near_origin = false;
        let mut near_ten = false;
        for centroid in fit.centroids.outer_iter() {
            if centroid[0].abs() < 1.0 {
                near_origin = true;
            }
            if (centroid[0] - 10.0).abs() < 1.0 {
                near_ten = true;
            }
        }
        assert!(near_origin && near_ten);
    }

    #[test]
    fn same_seed_is_deterministic() {
        let data = two_blobs();
        let a = fit_kmeans(&data, 3, 10, 42).unwrap();
        let b = fit_kmeans(&data, 3, 10, 42).unwrap();
        assert_eq!(a.labels, b.labels);
        assert_eq!(a.inertia.to_bits(), b.inertia.to_bits());
        for (x, y) in a.centroids.iter().zip(b.centroids.iter()) {
            assert_eq!(x.to_bits(), y.to_bits());
        }
    }

    #[test]
    fn inertia_is_tiny_for_exact_clusters() {
        // Four identical points per cluster location: inertia ~ 0.
        let flat = vec![
            0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, //
            5.0, 5.0, 5.0, 5.0, 5.0, 5.0, 5.0, 5.0,
        ];
        let data = Array2::from_shape_vec((8, 2), flat).unwrap();
        let fit = fit_kmeans(&data, 2, 10, 42).unwrap();
        assert!(fit.inertia < 1e-12);
    }

    #[test]
    fn labels_are_within_k() {
        let data = two_blobs();
        let fit = fit_kmeans(&data, 4, 10, 7).unwrap();
        assert!(fit.labels.iter().all(|&l| l < 4));
    }

    #[test]
    fn too_few_samples_is_an_error() {
        let data = Array2::from_shape_vec((2, 2), vec![0.0, 0.0, 1.0, 1.0]).unwrap();
        assert!(fit_kmeans(&data, 3, 10, 42).is_err());
    }

    #[test]
    fn zero_k_is_an_error() {
        let data = two_blobs();
        assert!(fit_kmeans(&data, 0, 10, 42).is_err());
    }
}
