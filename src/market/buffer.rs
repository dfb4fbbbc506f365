use crate::market::types::Candle;
use std::collections::VecDeque;

/// Bounded FIFO between dispatch and the flush tick. Overflow evicts the oldest entry.
#[derive(Debug)]
pub struct IngestBuffer {
    items: VecDeque<Candle>,
    capacity: usize,
    dropped: u64,
}

impl IngestBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Returns `true` when an older entry had to be evicted to make room.
    pub fn push(&mut self, candle: Candle) -> bool {
        let evicted = if self.items.len() >= self.capacity {
            self.items.pop_front();
            self.dropped = self.dropped.saturating_add(1);
            true
        } else {
            false
        };
        self.items.push_back(candle);
        evicted
    }

    pub fn drain_all(&mut self) -> Vec<Candle> {
        self.items.drain(..).collect()
    }

    /// Counts losses that happened upstream of the buffer, e.g. channel lag.
    pub fn record_external_drops(&mut self, count: u64) {
        self.dropped = self.dropped.saturating_add(count);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
