//! Bounded scrollback history.

use std::collections::VecDeque;

/// Ordered output chunks bounded by a total byte budget.
///
/// After every push the buffer holds at most `budget` bytes, unless a single
/// chunk larger than the budget is all that remains. The most recent chunk is
/// never discarded.
#[derive(Debug, Clone)]
pub struct ScrollbackBuffer {
    chunks: VecDeque<Vec<u8>>,
    total: usize,
    budget: usize,
}

impl ScrollbackBuffer {
    /// Creates an empty buffer with the given byte budget.
    pub fn new(budget: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            total: 0,
            budget,
        }
    }

    /// Appends a chunk and drops the oldest chunks until the budget holds.
    pub fn push(&mut self, chunk: Vec<u8>) {
        if chunk.is_empty() {
            return;
        }
        self.total += chunk.len();
        self.chunks.push_back(chunk);

        while self.chunks.len() > 1 && self.total > self.budget {
            if let Some(dropped) = self.chunks.pop_front() {
                self.total -= dropped.len();
            }
        }
    }

    /// Returns the whole history as one contiguous byte vector.
    pub fn concat(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }

    /// Total buffered bytes.
    pub fn total_bytes(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.total = 0;
    }
}
