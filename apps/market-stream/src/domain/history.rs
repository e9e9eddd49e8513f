//! Bounded tick history.

use std::collections::VecDeque;

use super::tick::PriceTick;

/// Per-symbol ring buffer of ticks with FIFO eviction.
///
/// The length never exceeds the capacity given at construction.
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    capacity: usize,
    entries: VecDeque<PriceTick>,
}

impl HistoryBuffer {
    /// Create an empty buffer. A capacity of zero is treated as one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    /// Append a tick, evicting the oldest entry when full.
    pub fn push(&mut self, tick: PriceTick) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(tick);
    }

    /// Up to `limit` most recent ticks, oldest first.
    #[must_use]
    pub fn latest(&self, limit: usize) -> Vec<PriceTick> {
        let skip = self.entries.len().saturating_sub(limit);
        self.entries.iter().skip(skip).cloned().collect()
    }

    /// Most recent tick, if any.
    #[must_use]
    pub fn last(&self) -> Option<&PriceTick> {
        self.entries.back()
    }

    /// Number of stored ticks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the buffer holds no ticks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of retained ticks.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}
