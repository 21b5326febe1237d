//! Bounded memory of the item ids a stream has already emitted.

use std::collections::{HashSet, VecDeque};

use serde::Serialize;

/// Ids remembered per stream when no limit is configured.
pub const DEFAULT_TRACKED_IDS: usize = 10_000;

/// How an item compares with what the stream has already emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sighting {
    New,
    Duplicate,
    MissingId,
}

/// Duplicate-tracking counters, reported by the collector status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TrackingStats {
    pub tracked_ids: usize,
    pub capacity: usize,
    pub new_total: u64,
    pub duplicates_total: u64,
    pub missing_ids_total: u64,
}

/// Set of seen ids with FIFO eviction once `capacity` is reached.
///
/// An evicted id counts as new again if it reappears.
#[derive(Debug, Clone)]
pub struct SeenIds {
    ids: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
    stats: TrackingStats,
}

impl Default for SeenIds {
    fn default() -> Self {
        Self::new(DEFAULT_TRACKED_IDS)
    }
}

impl SeenIds {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity,
            stats: TrackingStats {
                capacity,
                ..TrackingStats::default()
            },
        }
    }

    /// Record one item by id and classify it.
    pub fn observe(&mut self, id: Option<&str>) -> Sighting {
        let Some(id) = id else {
            self.stats.missing_ids_total += 1;
            return Sighting::MissingId;
        };
        if self.ids.contains(id) {
            self.stats.duplicates_total += 1;
            return Sighting::Duplicate;
        }

        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.ids.insert(id.to_string());
        self.order.push_back(id.to_string());
        self.stats.new_total += 1;
        Sighting::New
    }

    /// Forget every id. Returns how many were tracked; totals are kept.
    pub fn clear(&mut self) -> usize {
        let forgotten = self.ids.len();
        self.ids.clear();
        self.order.clear();
        forgotten
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn stats(&self) -> TrackingStats {
        TrackingStats {
            tracked_ids: self.ids.len(),
            ..self.stats
        }
    }
}
