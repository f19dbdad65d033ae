//! Bounded per-bot activity feed.

use std::collections::VecDeque;

use crate::types::{Activity, ActivityKind};

/// Newest-first ring of the most recent activities.
#[derive(Debug)]
pub struct ActivityLog {
    entries: VecDeque<Activity>,
    max_size: usize,
}

impl ActivityLog {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_size.min(64)),
            max_size: max_size.max(1),
        }
    }

    /// Append an entry, pruning the oldest past capacity.
    pub fn add(&mut self, activity: Activity) {
        if self.entries.len() == self.max_size {
            self.entries.pop_back();
        }
        self.entries.push_front(activity);
    }

    /// Up to `limit` newest entries, optionally filtered by kind.
    pub fn list(&self, limit: usize, kind: Option<ActivityKind>) -> Vec<Activity> {
        self.entries
            .iter()
            .filter(|a| kind.map_or(true, |k| a.kind == k))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ActivityDetails;

    fn act(kind: ActivityKind, msg: &str) -> Activity {
        Activity::new("b1", kind, msg, ActivityDetails::None {})
    }

    #[test]
    fn test_ring_prunes_oldest() {
        let mut log = ActivityLog::new(3);
        for i in 0..5 {
            log.add(act(ActivityKind::System, &format!("m{i}")));
        }
        assert_eq!(log.len(), 3);
        let all = log.list(10, None);
        assert_eq!(all[0].message, "m4");
        assert_eq!(all[2].message, "m2");
    }

    #[test]
    fn test_kind_filter_and_limit() {
        let mut log = ActivityLog::new(10);
        log.add(act(ActivityKind::Spike, "s1"));
        log.add(act(ActivityKind::Order, "o1"));
        log.add(act(ActivityKind::Spike, "s2"));

        let spikes = log.list(10, Some(ActivityKind::Spike));
        assert_eq!(spikes.len(), 2);
        assert_eq!(spikes[0].message, "s2");

        assert_eq!(log.list(1, None).len(), 1);
    }
}
