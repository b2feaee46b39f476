// =============================================================================
// Standard scaler -- per-feature mean/std standardization
// =============================================================================
//
// Fit on the training matrix, persisted with the model, and replayed by the
// classifier worker at inference time. The std is the population standard
// deviation; a zero-variance feature stores a scale of 1 so that
// standardization degenerates to centering instead of dividing by zero.
// =============================================================================

use anyhow::{ensure, Result};
use ndarray::{Array1, Array2, Axis};

#[derive(Debug, Clone)]
pub struct StandardScaler {
    pub mean: Array1<f64>,
    pub scale: Array1<f64>,
}

impl StandardScaler {
    /// Fit mean and scale on the columns of `data` (rows are samples).
    pub fn fit(data: &Array2<f64>) -> Result<Self> {
        ensure!(data.nrows() > 0, "cannot fit scaler on an empty matrix");

        let mean = data
            .mean_axis(Axis(0))
            .expect("nrows checked non-zero");

        let n = data.nrows() as f64;
        let mut scale = Array1::zeros(data.ncols());
        for (j, column) in data.axis_iter(Axis(1)).enumerate() {
            let m = mean[j];
            let var = column.iter().map(|v| (v - m).powi(2)).sum::<f64>() / n;
            let std = var.sqrt();
            scale[j] = if std == 0.0 { 1.0 } else { std };
        }

        Ok(Self { mean, scale })
    }

    /// Standardize every row of `data`.
    pub fn transform(&self, data: &Array2<f64>) -> Array2<f64> {
        (data - &self.mean) / &self.scale
    }

    /// Map one standardized vector back to the original feature space.
    pub fn inverse_transform_row(&self, z: &[f64]) -> Vec<f64> {
        z.iter()
            .zip(self.mean.iter().zip(self.scale.iter()))
            .map(|(&zv, (&m, &s))| zv * s + m)
            .collect()
    }
}
