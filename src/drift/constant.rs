//! Frozen snapshots of the forecast curve, taken at most once per refresh interval.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

use crate::{config::ConstantConfig, models::ConstantPrediction, stream::RingBuffer};

struct Snapshots {
    taken_at: Option<DateTime<Utc>>,
    points: RingBuffer<ConstantPrediction>,
}

pub struct ConstantPredictionCache {
    refresh_interval: Duration,
    capacity: usize,
    step_secs: f64,
    instruments: Mutex<HashMap<String, Snapshots>>,
}

impl ConstantPredictionCache {
    pub fn new(config: &ConstantConfig, step_secs: f64) -> Self {
        Self {
            refresh_interval: Duration::seconds(config.refresh_interval_secs as i64),
            capacity: config.capacity.max(1),
            step_secs,
            instruments: Mutex::new(HashMap::new()),
        }
    }

    pub fn maybe_snapshot(&self, instrument: &str, curve: &[f64], anchor: i64) -> Option<Vec<ConstantPrediction>> {
        self.maybe_snapshot_at(instrument, curve, anchor, Utc::now())
    }

    /// Step `i` (1-based) of the curve lands at `anchor + i * step_secs`.
    /// Returns the new points, or `None` while the last snapshot is still fresh.
    pub fn maybe_snapshot_at(
        &self,
        instrument: &str,
        curve: &[f64],
        anchor: i64,
        now: DateTime<Utc>,
    ) -> Option<Vec<ConstantPrediction>> {
        if curve.is_empty() {
            return None;
        }
        let mut instruments = self.instruments.lock();
        let entry = instruments
            .entry(instrument.to_string())
            .or_insert_with(|| Snapshots {
                taken_at: None,
                points: RingBuffer::new(self.capacity),
            });

        if let Some(taken_at) = entry.taken_at {
            if now - taken_at < self.refresh_interval {
                return None;
            }
        }
        entry.taken_at = Some(now);

        let points: Vec<ConstantPrediction> = curve
            .iter()
            .enumerate()
            .map(|(i, price)| ConstantPrediction {
                timestamp: anchor + (self.step_secs * (i + 1) as f64).round() as i64,
                price: *price,
            })
            .collect();
        for point in &points {
            entry.points.push(*point);
        }
        Some(points)
    }

    pub fn latest(&self, instrument: &str) -> Vec<ConstantPrediction> {
        self.instruments
            .lock()
            .get(instrument)
            .map(|s| s.points.to_vec())
            .unwrap_or_default()
    }
}
