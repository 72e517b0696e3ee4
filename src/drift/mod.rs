//! Drift forecasting: predict a window, schedule the forecast, score it when it matures.

pub mod constant;
pub mod engine;
pub mod performance;

pub use constant::ConstantPredictionCache;
pub use engine::{reduce_tail, DriftEngine, DriftUpdate, Forecast};
pub use performance::{PerformanceStats, PerformanceTracker, RatingCounts};
