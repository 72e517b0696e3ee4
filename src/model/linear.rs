//! Multi-output ridge regression over the price window.

use anyhow::{anyhow, bail, Context, Result};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{ModelTrainer, Predictor, TrainingRow};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearModel {
    pub input_size: usize,
    pub output_size: usize,
    /// Row-major `(input_size + 1) x output_size`; the last row is the bias.
    pub weights: Vec<f64>,
    pub trained_on: usize,
}

impl LinearModel {
    /// Least squares with an L2 penalty: `W = (XᵀX + λI)⁻¹ XᵀY`.
    pub fn fit(rows: &[TrainingRow], ridge: f64) -> Result<Self> {
        let first = rows.first().ok_or_else(|| anyhow!("empty training set"))?;
        let input_size = first.x.len();
        let output_size = first.y.len();
        if input_size == 0 || output_size == 0 {
            bail!("training rows must have non-empty x and y");
        }
        if let Some(bad) = rows
            .iter()
            .position(|r| r.x.len() != input_size || r.y.len() != output_size)
        {
            bail!("training row {bad} has inconsistent dimensions");
        }

        let n = rows.len();
        let cols = input_size + 1;
        let x = DMatrix::from_fn(n, cols, |r, c| {
            if c == input_size {
                1.0
            } else {
                rows[r].x[c]
            }
        });
        let y = DMatrix::from_fn(n, output_size, |r, c| rows[r].y[c]);

        let xt = x.transpose();
        let gram = &xt * &x + DMatrix::<f64>::identity(cols, cols) * ridge.max(1e-9);
        let rhs = &xt * &y;
        let solved = gram
            .cholesky()
            .context("normal equations are not positive definite")?
            .solve(&rhs);

        let mut weights = Vec::with_capacity(cols * output_size);
        for r in 0..cols {
            for c in 0..output_size {
                weights.push(solved[(r, c)]);
            }
        }

        Ok(Self {
            input_size,
            output_size,
            weights,
            trained_on: n,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("serialize linear model")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let model: Self = serde_json::from_slice(bytes).context("decode linear model")?;
        if model.weights.len() != (model.input_size + 1) * model.output_size {
            bail!(
                "weight count {} does not match {}x{}",
                model.weights.len(),
                model.input_size + 1,
                model.output_size
            );
        }
        Ok(model)
    }
}

impl Predictor for LinearModel {
    fn predict(&self, input: &[f64]) -> Result<Vec<f64>> {
        if input.len() != self.input_size {
            bail!(
                "expected {} inputs, got {}",
                self.input_size,
                input.len()
            );
        }
        let out = (0..self.output_size)
            .map(|c| {
                let bias = self.weights[self.input_size * self.output_size + c];
                input
                    .iter()
                    .enumerate()
                    .fold(bias, |acc, (r, v)| acc + v * self.weights[r * self.output_size + c])
            })
            .collect();
        Ok(out)
    }
}

/// Trains `LinearModel`s; the ridge factor keeps tiny or flat datasets solvable.
#[derive(Debug, Clone)]
pub struct LinearTrainer {
    pub ridge: f64,
}

impl Default for LinearTrainer {
    fn default() -> Self {
        Self { ridge: 1e-4 }
    }
}

impl ModelTrainer for LinearTrainer {
    fn train(&self, rows: &[TrainingRow]) -> Result<Vec<u8>> {
        LinearModel::fit(rows, self.ridge)?.to_bytes()
    }

    fn load(&self, bytes: &[u8]) -> Result<Arc<dyn Predictor>> {
        Ok(Arc::new(LinearModel::from_bytes(bytes)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shifted_rows(n: usize) -> Vec<TrainingRow> {
        // Exactly linear targets: the window mean and the last price plus a step.
        (0..n)
            .map(|i| {
                let x: Vec<f64> = (0..4)
                    .map(|k| 1.0 + ((i * (k + 1)) as f64 * 0.37).sin() * 0.1)
                    .collect();
                let y = vec![x.iter().sum::<f64>() / 4.0, x[3] + 0.01];
                TrainingRow { x, y }
            })
            .collect()
    }

    #[test]
    fn test_fit_recovers_linear_relation() {
        let rows = shifted_rows(64);
        let model = LinearModel::fit(&rows, 1e-9).unwrap();
        let out = model.predict(&rows[5].x).unwrap();
        for (got, want) in out.iter().zip(&rows[5].y) {
            assert!((got - want).abs() < 1e-4, "got {got}, want {want}");
        }
    }

    #[test]
    fn test_bytes_roundtrip_predicts_the_same() {
        let rows = shifted_rows(16);
        let trainer = LinearTrainer::default();
        let bytes = trainer.train(&rows).unwrap();
        let restored = trainer.load(&bytes).unwrap();
        let direct = LinearModel::from_bytes(&bytes).unwrap();
        assert_eq!(
            restored.predict(&rows[0].x).unwrap(),
            direct.predict(&rows[0].x).unwrap()
        );
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(LinearModel::fit(&[], 1.0).is_err());
        let rows = vec![
            TrainingRow { x: vec![1.0, 2.0], y: vec![1.0] },
            TrainingRow { x: vec![1.0], y: vec![1.0] },
        ];
        assert!(LinearModel::fit(&rows, 1.0).is_err());

        let model = LinearModel::fit(&shifted_rows(8), 1e-3).unwrap();
        assert!(model.predict(&[1.0]).is_err());
        assert!(LinearModel::from_bytes(b"{}").is_err());
    }
}
