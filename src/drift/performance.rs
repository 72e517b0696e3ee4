//! Forecast-quality accounting per instrument.
//!
//! No position is ever held: the totals compare what the forecasts promised with what
//! the market delivered, with bad calls counted against both.

use serde::Serialize;

use crate::{
    models::{DriftRating, DriftRecord, PerformanceSample},
    stream::RingBuffer,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RatingCounts {
    pub good: u64,
    pub ok: u64,
    pub bad: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceStats {
    pub expected_performance: f64,
    pub realized_performance: f64,
    pub resolved: u64,
    pub ratings: RatingCounts,
}

pub struct PerformanceTracker {
    expected: f64,
    realized: f64,
    ratings: RatingCounts,
    history: RingBuffer<PerformanceSample>,
}

impl PerformanceTracker {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            expected: 0.0,
            realized: 0.0,
            ratings: RatingCounts::default(),
            history: RingBuffer::new(history_capacity),
        }
    }

    /// Fold a freshly resolved record into the totals and return the new sample.
    pub fn record(&mut self, record: &DriftRecord) -> PerformanceSample {
        let realized = record.realized_drift.unwrap_or(0.0);
        let sign = match record.rating {
            DriftRating::Bad => -1.0,
            _ => 1.0,
        };
        self.expected += sign * record.predicted_drift.abs();
        self.realized += sign * realized.abs();

        match record.rating {
            DriftRating::Good => self.ratings.good += 1,
            DriftRating::Ok => self.ratings.ok += 1,
            DriftRating::Bad => self.ratings.bad += 1,
            DriftRating::Unset => {}
        }

        let sample = PerformanceSample {
            timestamp: record.resolved_at.unwrap_or(record.target_timestamp),
            cumulative_expected: self.expected,
            cumulative_realized: self.realized,
        };
        self.history.push(sample);
        sample
    }

    pub fn history(&self) -> Vec<PerformanceSample> {
        self.history.to_vec()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn stats(&self) -> PerformanceStats {
        PerformanceStats {
            expected_performance: self.expected,
            realized_performance: self.realized,
            resolved: self.ratings.good + self.ratings.ok + self.ratings.bad,
            ratings: self.ratings,
        }
    }

    pub fn reset(&mut self) {
        self.expected = 0.0;
        self.realized = 0.0;
        self.ratings = RatingCounts::default();
        self.history.clear();
    }
}
