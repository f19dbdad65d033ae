//! Bounded time-indexed price history.
//!
//! Single writer (the price feed task), many readers (spike detector,
//! chart endpoints). Timestamps are non-decreasing by construction.

use std::collections::VecDeque;

use crate::types::PricePoint;

#[derive(Debug)]
pub struct PriceHistory {
    points: VecDeque<PricePoint>,
    capacity: usize,
}

impl PriceHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            points: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    /// Append a sample, evicting exactly the oldest when full.
    /// Out-of-order timestamps are clamped to the last sample's time.
    pub fn append(&mut self, ts_ms: i64, price: f64) {
        let ts_ms = match self.points.back() {
            Some(last) if ts_ms < last.ts_ms => last.ts_ms,
            _ => ts_ms,
        };
        if self.points.len() == self.capacity {
            self.points.pop_front();
        }
        self.points.push_back(PricePoint { ts_ms, price });
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn last(&self) -> Option<PricePoint> {
        self.points.back().copied()
    }

    /// Most recent sample with `ts <= target_ts`, or None when history
    /// does not reach that far back.
    pub fn price_at_or_before(&self, target_ts_ms: i64) -> Option<PricePoint> {
        // partition_point gives the count of samples with ts <= target.
        let idx = self.points.partition_point(|p| p.ts_ms <= target_ts_ms);
        if idx == 0 {
            None
        } else {
            self.points.get(idx - 1).copied()
        }
    }

    /// Samples with `from_ts <= ts <= to_ts`, oldest first.
    pub fn samples_in_range(
        &self,
        from_ts_ms: i64,
        to_ts_ms: i64,
    ) -> impl Iterator<Item = PricePoint> + '_ {
        let start = self.points.partition_point(|p| p.ts_ms < from_ts_ms);
        let end = self.points.partition_point(|p| p.ts_ms <= to_ts_ms);
        self.points.range(start..end).copied()
    }

    /// Up to the `n` most recent samples, oldest first.
    pub fn recent(&self, n: usize) -> Vec<PricePoint> {
        let skip = self.points.len().saturating_sub(n);
        self.points.iter().skip(skip).copied().collect()
    }
}
