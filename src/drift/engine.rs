//! Drift forecasts for one instrument: creation from the window, deferred resolution
//! against later trades, and performance accounting.

use anyhow::{bail, Result};
use std::collections::VecDeque;
use tracing::{debug, warn};

use super::performance::{PerformanceStats, PerformanceTracker};
use crate::{
    config::{DriftConfig, InstrumentDescriptor},
    model::Predictor,
    models::{DriftRecord, PerformanceSample, Trade},
};

/// A de-normalized forecast anchored at the trade that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Forecast {
    pub anchor_timestamp: i64,
    pub anchor_price: f64,
    /// Step `i` (0-based) lands at `anchor + (i + 1) * step_secs`.
    pub curve: Vec<f64>,
    pub future_value: f64,
    pub target_timestamp: i64,
}

impl Forecast {
    pub fn predicted_drift(&self) -> f64 {
        self.future_value - self.anchor_price
    }
}

/// Mean of the last `S = ceil(len * tail_fraction)` points (at least one) and the
/// timestamp of the tail's midpoint step.
pub fn reduce_tail(curve: &[f64], anchor: i64, step_secs: f64, tail_fraction: f64) -> Option<(f64, i64)> {
    let horizon = curve.len();
    if horizon == 0 {
        return None;
    }
    let tail = ((horizon as f64 * tail_fraction).ceil() as usize).clamp(1, horizon);
    let future_value = curve[horizon - tail..].iter().sum::<f64>() / tail as f64;

    let first_step = (horizon - tail + 1) as f64;
    let midpoint_step = (first_step + horizon as f64) / 2.0;
    let target = anchor + (step_secs * midpoint_step).round() as i64;
    Some((future_value, target))
}

/// Everything one trade changed
#[derive(Debug, Default)]
pub struct DriftUpdate {
    pub resolved: Vec<(DriftRecord, PerformanceSample)>,
    pub forecast: Option<Forecast>,
    pub created: Option<DriftRecord>,
}

pub struct DriftEngine {
    descriptor: InstrumentDescriptor,
    config: DriftConfig,
    /// Creation order; oldest first
    records: VecDeque<DriftRecord>,
    performance: PerformanceTracker,
}

impl DriftEngine {
    pub fn new(descriptor: InstrumentDescriptor, config: DriftConfig) -> Self {
        let performance = PerformanceTracker::new(config.performance_history);
        Self {
            descriptor,
            config,
            records: VecDeque::new(),
            performance,
        }
    }

    pub fn instrument(&self) -> &str {
        &self.descriptor.symbol
    }

    /// Resolve matured forecasts, then try to create a new one.
    ///
    /// Never fails: predictor errors are logged and mean "no forecast this tick".
    pub fn on_trade(&mut self, trade: &Trade, window: &[Trade], predictor: Option<&dyn Predictor>) -> DriftUpdate {
        let resolved = self.resolve_matured(trade);

        let forecast = match predictor {
            Some(predictor) => match self.forecast(trade, window, predictor) {
                Ok(forecast) => forecast,
                Err(e) => {
                    warn!(instrument = %self.descriptor.symbol, error = %e, "prediction failed");
                    None
                }
            },
            None => None,
        };

        let created = forecast.as_ref().map(|f| {
            let record = DriftRecord::pending(
                self.descriptor.symbol.clone(),
                trade,
                f.future_value,
                f.target_timestamp,
            );
            debug!(
                instrument = %self.descriptor.symbol,
                drift = record.predicted_drift,
                target = record.target_timestamp,
                "drift created"
            );
            self.insert(record.clone());
            record
        });

        DriftUpdate {
            resolved,
            forecast,
            created,
        }
    }

    /// Run the predictor over a full window. `Ok(None)` when the window is short.
    pub fn forecast(&self, trade: &Trade, window: &[Trade], predictor: &dyn Predictor) -> Result<Option<Forecast>> {
        if window.len() < self.config.window_size {
            return Ok(None);
        }
        let start = window.len() - self.config.window_size;
        let input: Vec<f64> = window[start..]
            .iter()
            .map(|t| self.descriptor.normalize(t.price))
            .collect();

        let output = predictor.predict(&input)?;
        let curve: Vec<f64> = output.iter().map(|v| self.descriptor.denormalize(*v)).collect();
        if curve.iter().any(|v| !v.is_finite()) {
            bail!("predictor returned non-finite values");
        }

        let Some((future_value, target_timestamp)) = reduce_tail(
            &curve,
            trade.timestamp,
            self.config.step_secs,
            self.config.tail_fraction,
        ) else {
            bail!("predictor returned an empty horizon");
        };

        Ok(Some(Forecast {
            anchor_timestamp: trade.timestamp,
            anchor_price: trade.price,
            curve,
            future_value,
            target_timestamp,
        }))
    }

    /// Resolve every pending record whose target is at or before the trade, in
    /// ascending target order.
    pub fn resolve_matured(&mut self, trade: &Trade) -> Vec<(DriftRecord, PerformanceSample)> {
        let mut matured: Vec<usize> = self
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_pending() && r.target_timestamp <= trade.timestamp)
            .map(|(i, _)| i)
            .collect();
        // Stable: equal targets keep creation order.
        matured.sort_by_key(|i| self.records[*i].target_timestamp);

        let mut out = Vec::with_capacity(matured.len());
        for i in matured {
            let record = &mut self.records[i];
            if !record.resolve(trade) {
                continue;
            }
            let sample = self.performance.record(record);
            debug!(
                instrument = %record.instrument,
                predicted = record.predicted_drift,
                realized = ?record.realized_drift,
                rating = record.rating.as_str(),
                "drift resolved"
            );
            out.push((record.clone(), sample));
        }
        out
    }

    fn insert(&mut self, record: DriftRecord) {
        self.records.push_back(record);
        while self.records.len() > self.config.max_records.max(1) {
            match self.records.iter().position(|r| !r.is_pending()) {
                Some(i) => {
                    self.records.remove(i);
                }
                None => {
                    self.records.pop_front();
                }
            }
        }
    }

    pub fn records(&self) -> Vec<DriftRecord> {
        self.records.iter().cloned().collect()
    }

    pub fn pending_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_pending()).count()
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn performance_history(&self) -> Vec<PerformanceSample> {
        self.performance.history()
    }

    pub fn performance_stats(&self) -> PerformanceStats {
        self.performance.stats()
    }

    pub fn reset_performance(&mut self) {
        self.performance.reset();
    }
}
