use crate::token::{NON_ADDRESS, StreamId};
use std::collections::HashMap;

/// Last address written to each stream. Streams never written report
/// `NON_ADDRESS`.
#[derive(Debug, Clone, Default)]
pub struct StreamTailTracker {
    tails: HashMap<StreamId, u64>,
}

impl StreamTailTracker {
    pub fn tail(&self, stream_id: &StreamId) -> u64 {
        self.tails.get(stream_id).copied().unwrap_or(NON_ADDRESS)
    }

    /// Moves the tail of `stream_id` to `address`, returning the previous tail
    /// (the backpointer for the write at `address`).
    pub fn record(&mut self, stream_id: StreamId, address: u64) -> u64 {
        let tail = self.tails.entry(stream_id).or_insert(NON_ADDRESS);
        let previous = *tail;
        *tail = previous.max(address);
        previous
    }

    pub fn snapshot<'a>(
        &self,
        stream_ids: impl IntoIterator<Item = &'a StreamId>,
    ) -> HashMap<StreamId, u64> {
        stream_ids
            .into_iter()
            .map(|id| (*id, self.tail(id)))
            .collect()
    }

    pub fn reset(&mut self, tails: HashMap<StreamId, u64>) {
        self.tails = tails;
    }

    pub fn len(&self) -> usize {
        self.tails.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tails.is_empty()
    }
}
