//! Per-instrument sliding windows of the most recent trades.

use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};

use crate::models::Trade;

/// Fixed-capacity FIFO that evicts the oldest element when full.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    buffer: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    /// Push, returning the evicted element if the buffer was full.
    pub fn push(&mut self, value: T) -> Option<T> {
        if self.capacity == 0 {
            return Some(value);
        }
        let evicted = if self.buffer.len() >= self.capacity {
            self.buffer.pop_front()
        } else {
            None
        };
        self.buffer.push_back(value);
        evicted
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.capacity > 0 && self.buffer.len() >= self.capacity
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.buffer.iter()
    }
}

impl<T: Clone> RingBuffer<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.buffer.iter().cloned().collect()
    }

    /// The newest `n` elements, oldest first.
    pub fn last_n(&self, n: usize) -> Vec<T> {
        let skip = self.buffer.len().saturating_sub(n);
        self.buffer.iter().skip(skip).cloned().collect()
    }
}

/// One window per instrument, all with the same capacity (W).
pub struct SlidingWindowBuffer {
    windows: RwLock<HashMap<String, RingBuffer<Trade>>>,
    capacity: usize,
}

impl SlidingWindowBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    pub fn append(&self, instrument: &str, trade: Trade) {
        let mut windows = self.windows.write();
        windows
            .entry(instrument.to_string())
            .or_insert_with(|| RingBuffer::new(self.capacity))
            .push(trade);
    }

    /// Seed the window from history so it is usable before W live trades arrive.
    pub fn prefill(&self, instrument: &str, trades: impl IntoIterator<Item = Trade>) {
        let mut windows = self.windows.write();
        let window = windows
            .entry(instrument.to_string())
            .or_insert_with(|| RingBuffer::new(self.capacity));
        for trade in trades {
            window.push(trade);
        }
    }

    /// Up to W trades, oldest first.
    pub fn get(&self, instrument: &str) -> Vec<Trade> {
        self.windows
            .read()
            .get(instrument)
            .map(RingBuffer::to_vec)
            .unwrap_or_default()
    }

    pub fn is_full(&self, instrument: &str) -> bool {
        self.windows
            .read()
            .get(instrument)
            .is_some_and(RingBuffer::is_full)
    }

    pub fn len(&self, instrument: &str) -> usize {
        self.windows.read().get(instrument).map_or(0, RingBuffer::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TradeSide;

    fn trade(ts: i64) -> Trade {
        Trade::new("ltceur", TradeSide::Sell, 50.0 + ts as f64, 1.0, ts)
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let mut ring = RingBuffer::new(3);
        assert_eq!(ring.push(1), None);
        ring.push(2);
        ring.push(3);
        assert_eq!(ring.push(4), Some(1));
        assert_eq!(ring.to_vec(), vec![2, 3, 4]);
        assert_eq!(ring.last_n(2), vec![3, 4]);
        assert_eq!(ring.last_n(10), vec![2, 3, 4]);
    }

    #[test]
    fn test_zero_capacity_ring_stays_empty() {
        let mut ring = RingBuffer::new(0);
        assert_eq!(ring.push(7), Some(7));
        assert!(ring.is_empty());
        assert!(!ring.is_full());
    }

    #[test]
    fn test_window_keeps_last_w_in_order() {
        let windows = SlidingWindowBuffer::new(10);
        for ts in 0..13 {
            windows.append("ltceur", trade(ts));
            assert!(windows.len("ltceur") <= 10);
        }
        let stamps: Vec<i64> = windows.get("ltceur").iter().map(|t| t.timestamp).collect();
        assert_eq!(stamps, (3..13).collect::<Vec<_>>());
        assert!(windows.is_full("ltceur"));
    }

    #[test]
    fn test_windows_are_independent() {
        let windows = SlidingWindowBuffer::new(2);
        windows.prefill("ltceur", vec![trade(1), trade(2)]);
        windows.append("btceur", trade(3));
        assert!(windows.is_full("ltceur"));
        assert!(!windows.is_full("btceur"));
        assert!(!windows.is_full("xrpeur"));
        assert!(windows.get("xrpeur").is_empty());
    }
}
