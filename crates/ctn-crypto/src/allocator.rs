//! Underlying byte-buffer allocators that a [`BufferScope`](crate::BufferScope)
//! rents from and releases back to.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Source of byte buffers.
///
/// `rent` must return a buffer whose `len()` is at least `min_len`; every
/// buffer handed out is given back through `release` at most once.
pub trait BufferAllocator: Send + Sync {
    fn rent(&self, min_len: usize) -> Vec<u8>;
    fn release(&self, buf: Vec<u8>);
}

/// Fresh, exact-size, zero-filled allocations. Released buffers are dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl BufferAllocator for HeapAllocator {
    fn rent(&self, min_len: usize) -> Vec<u8> {
        vec![0u8; min_len]
    }

    fn release(&self, buf: Vec<u8>) {
        drop(buf);
    }
}

/// Process-wide pool of reusable buffers bucketed by power-of-two size class.
///
/// Each class keeps at most `per_class` idle buffers; anything beyond that,
/// or any buffer whose length is not a class size, goes back to the heap.
pub struct SharedBufferPool {
    classes: Mutex<HashMap<usize, Vec<Vec<u8>>>>,
    per_class: usize,
}

impl SharedBufferPool {
    pub fn new(per_class: usize) -> Arc<Self> {
        Arc::new(Self {
            classes: Mutex::new(HashMap::new()),
            per_class,
        })
    }

    /// Number of idle buffers currently retained across all classes.
    pub fn idle(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<usize, Vec<Vec<u8>>>> {
        self.classes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BufferAllocator for SharedBufferPool {
    fn rent(&self, min_len: usize) -> Vec<u8> {
        let class = min_len.max(1).next_power_of_two();
        self.lock()
            .get_mut(&class)
            .and_then(Vec::pop)
            .unwrap_or_else(|| vec![0u8; class])
    }

    fn release(&self, buf: Vec<u8>) {
        let class = buf.len();
        if class == 0 || !class.is_power_of_two() {
            return;
        }
        let mut classes = self.lock();
        let idle = classes.entry(class).or_default();
        if idle.len() < self.per_class {
            idle.push(buf);
        }
    }
}

impl std::fmt::Debug for SharedBufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBufferPool")
            .field("per_class", &self.per_class)
            .field("idle", &self.idle())
            .finish()
    }
}
