//! Bounded FIFO of decoded blocks
//!
//! One per track. The decode worker is the only producer and the mixer the
//! only consumer; both access it under the worker's state lock, so the queue
//! itself does no synchronization.

use mixdown_common::AudioBlock;
use std::collections::VecDeque;

#[derive(Debug)]
pub struct BlockQueue {
    blocks: VecDeque<AudioBlock>,
    capacity: usize,
}

impl BlockQueue {
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be > 0");
        Self {
            blocks: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a block, handing it back if the queue is full
    pub fn push(&mut self, block: AudioBlock) -> Result<(), AudioBlock> {
        if self.is_full() {
            return Err(block);
        }
        self.blocks.push_back(block);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<AudioBlock> {
        self.blocks.pop_front()
    }

    /// Drop everything queued; returns how many blocks were dropped
    pub fn clear(&mut self) -> usize {
        let dropped = self.blocks.len();
        self.blocks.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.blocks.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
