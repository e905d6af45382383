//! Growable ring buffer that turns out-of-order completions back into
//! strictly sequential output.
//!
//! Items are stored at `index % capacity`. When an item lands too far ahead
//! of the write cursor the ring doubles (up to `cap`) and existing entries are
//! rehashed. An item that still does not fit once the ring is at `cap` is a
//! hard failure rather than a wait.

use crate::error::{StreamError, StreamResult};

/// Smallest ring the pipelines start with.
pub const MIN_WINDOW: usize = 4;

pub(crate) struct ReorderWindow<T> {
    slots: Vec<Option<(u64, T)>>,
    next: u64,
    cap: usize,
    buffered: usize,
}

impl<T> ReorderWindow<T> {
    /// Ring of `clamp(initial, MIN_WINDOW, cap)` slots that may grow to `cap`.
    pub fn new(initial: usize, cap: usize) -> Self {
        let cap = cap.max(MIN_WINDOW);
        let size = initial.clamp(MIN_WINDOW, cap);
        Self {
            slots: empty_slots(size),
            next: 0,
            cap,
            buffered: 0,
        }
    }

    /// Index the next `pop_ready` will return.
    pub fn next_index(&self) -> u64 {
        self.next
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn buffered(&self) -> usize {
        self.buffered
    }

    /// Park `item` under `index`.
    pub fn push(&mut self, index: u64, item: T) -> StreamResult<()> {
        if index < self.next {
            return Err(StreamError::DuplicateChunk {
                index,
                next: self.next,
            });
        }
        let distance = index - self.next;
        while distance >= self.slots.len() as u64 && self.slots.len() < self.cap {
            self.grow();
        }
        if distance >= self.slots.len() as u64 {
            return Err(StreamError::WindowExceeded {
                index,
                distance,
                cap: self.cap,
            });
        }

        let slot = (index % self.slots.len() as u64) as usize;
        if let Some((occupant, _)) = &self.slots[slot] {
            let occupant = *occupant;
            if occupant == index {
                return Err(StreamError::DuplicateChunk {
                    index,
                    next: self.next,
                });
            }
            return Err(StreamError::SlotCollision {
                slot,
                index,
                occupant,
            });
        }
        self.slots[slot] = Some((index, item));
        self.buffered += 1;
        Ok(())
    }

    /// Take the item at the write cursor, if it has arrived, and advance.
    pub fn pop_ready(&mut self) -> Option<T> {
        let slot = (self.next % self.slots.len() as u64) as usize;
        match self.slots[slot].take() {
            Some((index, item)) if index == self.next => {
                self.next += 1;
                self.buffered -= 1;
                Some(item)
            }
            other => {
                self.slots[slot] = other;
                None
            }
        }
    }

    /// Fail if anything is still parked once input is exhausted.
    pub fn finish(&self) -> StreamResult<()> {
        if self.buffered > 0 {
            return Err(StreamError::MissingChunks {
                next: self.next,
                buffered: self.buffered,
            });
        }
        Ok(())
    }

    fn grow(&mut self) {
        let size = self.slots.len().saturating_mul(2).min(self.cap);
        let old = std::mem::replace(&mut self.slots, empty_slots(size));
        for (index, item) in old.into_iter().flatten() {
            // Entries span less than the old size, so they stay distinct.
            let slot = (index % size as u64) as usize;
            self.slots[slot] = Some((index, item));
        }
        tracing::trace!(window = size, next = self.next, "reorder window grown");
    }
}

fn empty_slots<T>(size: usize) -> Vec<Option<(u64, T)>> {
    std::iter::repeat_with(|| None).take(size).collect()
}
