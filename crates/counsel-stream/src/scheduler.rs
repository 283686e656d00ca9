//! Paces application of streamed fragments to the render buffer.
//!
//! Fragments are queued as they arrive and drained a few at a time on each
//! frame tick, so a burst from the network turns into several small buffer
//! updates instead of one large one.

use std::collections::VecDeque;

/// Single-consumer FIFO of pending text with a frame-tick drain.
///
/// `tick_scheduled` is the re-entrancy guard: it is set by the first
/// `add_chunk` after the queue went idle and cleared by the tick that empties
/// the queue, so at most one drain tick is ever outstanding.
#[derive(Debug)]
pub struct ChunkScheduler {
    queue: VecDeque<String>,
    chunk_size: usize,
    batch_size: usize,
    tick_scheduled: bool,
}

impl ChunkScheduler {
    pub fn new(chunk_size: usize, batch_size: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            chunk_size: chunk_size.max(1),
            batch_size: batch_size.max(1),
            tick_scheduled: false,
        }
    }

    /// Queues `text`, split into `chunk_size`-character pieces.
    ///
    /// Never blocks; the text is applied by later `tick` calls.
    pub fn add_chunk(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if text.chars().count() <= self.chunk_size {
            self.queue.push_back(text.to_string());
        } else {
            let mut start = 0;
            for (count, (idx, _)) in text.char_indices().enumerate() {
                if count > 0 && count % self.chunk_size == 0 {
                    self.queue.push_back(text[start..idx].to_string());
                    start = idx;
                }
            }
            self.queue.push_back(text[start..].to_string());
        }
        self.tick_scheduled = true;
    }

    /// True while a drain tick is owed.
    pub fn tick_scheduled(&self) -> bool {
        self.tick_scheduled
    }

    /// Pops up to `batch_size` pieces and returns them concatenated.
    ///
    /// Returns `None` when nothing was queued. Unschedules itself once the
    /// queue is empty.
    pub fn tick(&mut self) -> Option<String> {
        let take = self.batch_size.min(self.queue.len());
        let batch = if take == 0 {
            None
        } else {
            Some(self.queue.drain(..take).collect::<String>())
        };
        self.tick_scheduled = !self.queue.is_empty();
        batch
    }

    /// Pieces waiting to be applied.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drops everything queued and cancels the outstanding tick.
    ///
    /// Returns how many pieces were discarded.
    pub fn halt(&mut self) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        self.tick_scheduled = false;
        dropped
    }
}
