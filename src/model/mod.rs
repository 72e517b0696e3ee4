//! Forecast models.
//!
//! The pipeline only sees `Predictor`. Training goes through `ModelTrainer`, which
//! hands back serialized bytes so the worker boundary stays explicit.

pub mod linear;
pub mod store;
pub mod trainer;

use anyhow::Result;
use std::sync::Arc;

use crate::{config::InstrumentDescriptor, models::Trade};

pub use linear::{LinearModel, LinearTrainer};
pub use store::{ModelRegistry, ModelStore};
pub use trainer::{TrainError, TrainReport, TrainingSupervisor};

/// Black-box inference: normalized window in, normalized horizon out.
pub trait Predictor: Send + Sync {
    fn predict(&self, input: &[f64]) -> Result<Vec<f64>>;
}

/// Builds a model from a dataset and restores models from their byte form.
pub trait ModelTrainer: Send + Sync {
    fn train(&self, rows: &[TrainingRow]) -> Result<Vec<u8>>;
    fn load(&self, bytes: &[u8]) -> Result<Arc<dyn Predictor>>;
}

/// One supervised example: `x` window followed by `y` horizon, both normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingRow {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
}

/// Chunk a trade stream into blocks of `2 * window`; the first half is the input,
/// the second half the target. A trailing partial block is dropped.
pub fn build_dataset(
    trades: &[Trade],
    window: usize,
    descriptor: &InstrumentDescriptor,
) -> Vec<TrainingRow> {
    if window == 0 {
        return Vec::new();
    }
    trades
        .chunks_exact(window * 2)
        .map(|block| {
            let (x, y) = block.split_at(window);
            TrainingRow {
                x: x.iter().map(|t| descriptor.normalize(t.price)).collect(),
                y: y.iter().map(|t| descriptor.normalize(t.price)).collect(),
            }
        })
        .collect()
}
