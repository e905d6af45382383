//! Bounded, run-scoped buffer pool.
//!
//! A [`BufferScope`] sits between one pipeline run and a [`BufferAllocator`].
//! It hands out [`PooledBuffer`] guards, enforces a hard cap on outstanding
//! buffers and bytes, and guarantees that every buffer it ever obtained from
//! the allocator is zeroed and released back exactly once:
//!
//! - while the scope is live, dropping a guard parks its buffer on the free
//!   list for reuse;
//! - [`BufferScope::dispose`] zeroes and releases every parked buffer;
//! - a guard dropped after disposal zeroes and releases its own buffer.
//!
//! The disposed flag is flipped and observed under the state lock, so a
//! buffer is either drained by `dispose` or released by its guard, never both.

use std::collections::{HashMap, HashSet};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use zeroize::Zeroize;

use crate::allocator::BufferAllocator;
use crate::error::{StreamError, StreamResult};

/// Admission limits for one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeLimits {
    pub max_count: usize,
    pub max_bytes: u64,
}

impl ScopeLimits {
    /// Limits that admit the worst case a pipeline run can have in flight:
    /// one buffer in the producer, `4 * threads` per channel, two per worker,
    /// a full reorder window and one in the consumer.
    pub fn for_run(threads: usize, window_cap: usize, buffer_len: usize) -> Self {
        let max_count = threads
            .saturating_mul(10)
            .saturating_add(window_cap)
            .saturating_add(2);
        let per_buffer = buffer_len.max(1).checked_next_power_of_two().unwrap_or(usize::MAX) as u64;
        Self {
            max_count,
            max_bytes: (max_count as u64).saturating_mul(per_buffer),
        }
    }
}

#[derive(Default)]
struct ScopeState {
    next_id: u64,
    free: Vec<(u64, Vec<u8>)>,
    active: HashMap<u64, usize>,
    active_bytes: u64,
    /// Count slots reserved by `rent` while it allocates outside the lock.
    pending: usize,
}

struct ScopeInner {
    allocator: Arc<dyn BufferAllocator>,
    limits: ScopeLimits,
    state: Mutex<ScopeState>,
    disposed: AtomicBool,
}

impl ScopeInner {
    fn lock(&self) -> MutexGuard<'_, ScopeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn give_back(&self, id: u64, data: Vec<u8>) {
        let mut data = data;
        let mut state = self.lock();
        if state.active.remove(&id).is_some() {
            state.active_bytes = state.active_bytes.saturating_sub(data.len() as u64);
        }
        if self.disposed.load(Ordering::Acquire) {
            drop(state);
            data.as_mut_slice().zeroize();
            self.allocator.release(data);
        } else {
            state.free.push((id, data));
        }
    }
}

/// Run-scoped pool; see the module docs.
pub struct BufferScope {
    inner: Arc<ScopeInner>,
}

impl BufferScope {
    pub fn new(allocator: Arc<dyn BufferAllocator>, limits: ScopeLimits) -> StreamResult<Self> {
        if limits.max_count == 0 || limits.max_bytes == 0 {
            return Err(StreamError::InvalidArgument(
                "buffer scope limits must be positive".into(),
            ));
        }
        Ok(Self {
            inner: Arc::new(ScopeInner {
                allocator,
                limits,
                state: Mutex::new(ScopeState::default()),
                disposed: AtomicBool::new(false),
            }),
        })
    }

    pub fn limits(&self) -> ScopeLimits {
        self.inner.limits
    }

    /// Rent a buffer of at least `min_len` bytes.
    ///
    /// A parked buffer large enough is preferred (smallest fit) as long as
    /// it keeps the scope within its byte limit; otherwise a fresh one comes
    /// from the allocator. If admitting that one would exceed either limit
    /// the call fails with [`StreamError::ResourceLimit`] and the fresh
    /// buffer goes straight back to the allocator.
    pub fn rent(&self, min_len: usize) -> StreamResult<PooledBuffer> {
        if min_len == 0 {
            return Err(StreamError::InvalidBufferLength);
        }
        let limits = self.inner.limits;

        {
            let mut state = self.inner.lock();
            if self.inner.disposed.load(Ordering::Acquire) {
                return Err(StreamError::ScopeDisposed);
            }
            let count = state.active.len() + state.pending + 1;
            if count > limits.max_count {
                return Err(limit_error(&state, count, state.active_bytes, limits));
            }

            let best = state
                .free
                .iter()
                .enumerate()
                .filter(|(_, (_, data))| data.len() >= min_len)
                .min_by_key(|(_, (_, data))| data.len())
                .map(|(pos, _)| pos);
            // A parked buffer that would break the byte budget is skipped in
            // favour of a fresh exact-size allocation.
            let reusable = best.filter(|&pos| {
                state.active_bytes + state.free[pos].1.len() as u64 <= limits.max_bytes
            });
            if let Some(pos) = reusable {
                let bytes = state.active_bytes + state.free[pos].1.len() as u64;
                let (id, data) = state.free.swap_remove(pos);
                state.active.insert(id, data.len());
                state.active_bytes = bytes;
                return Ok(self.guard(id, data, min_len));
            }
            state.pending += 1;
        }

        let data = self.inner.allocator.rent(min_len);

        let mut state = self.inner.lock();
        state.pending -= 1;
        let bytes = state.active_bytes + data.len() as u64;
        if self.inner.disposed.load(Ordering::Acquire) || bytes > limits.max_bytes {
            let err = if self.inner.disposed.load(Ordering::Acquire) {
                StreamError::ScopeDisposed
            } else {
                limit_error(&state, state.active.len() + 1, bytes, limits)
            };
            drop(state);
            self.inner.allocator.release(data);
            return Err(err);
        }
        let id = state.next_id;
        state.next_id += 1;
        state.active.insert(id, data.len());
        state.active_bytes = bytes;
        Ok(self.guard(id, data, min_len))
    }

    /// Hand a buffer back explicitly. Equivalent to dropping the guard, but
    /// reports when the scope is already gone (the buffer is still released).
    pub fn recycle(&self, buf: PooledBuffer) -> StreamResult<()> {
        let disposed = self.is_disposed();
        drop(buf);
        if disposed {
            return Err(StreamError::ScopeDisposed);
        }
        Ok(())
    }

    /// Tear the scope down. Zeroes and releases every parked buffer exactly
    /// once and returns how many were released; buffers still held by guards
    /// are released when those guards drop. Later calls are no-ops.
    pub fn dispose(&self) -> usize {
        let parked = {
            let mut state = self.inner.lock();
            if self.inner.disposed.swap(true, Ordering::AcqRel) {
                return 0;
            }
            std::mem::take(&mut state.free)
        };

        let mut seen = HashSet::with_capacity(parked.len());
        let mut released = 0;
        for (id, mut data) in parked {
            if !seen.insert(id) {
                continue;
            }
            data.as_mut_slice().zeroize();
            self.inner.allocator.release(data);
            released += 1;
        }
        tracing::trace!(released, "buffer scope disposed");
        released
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().active.len()
    }

    pub fn active_bytes(&self) -> u64 {
        self.inner.lock().active_bytes
    }

    pub fn free_count(&self) -> usize {
        self.inner.lock().free.len()
    }

    fn guard(&self, id: u64, data: Vec<u8>, len: usize) -> PooledBuffer {
        PooledBuffer {
            id,
            data,
            len,
            scope: Arc::clone(&self.inner),
        }
    }
}

impl Drop for BufferScope {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for BufferScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("BufferScope")
            .field("limits", &self.inner.limits)
            .field("active", &state.active.len())
            .field("active_bytes", &state.active_bytes)
            .field("free", &state.free.len())
            .field("disposed", &self.inner.disposed.load(Ordering::Relaxed))
            .finish()
    }
}

fn limit_error(state: &ScopeState, count: usize, bytes: u64, limits: ScopeLimits) -> StreamError {
    tracing::debug!(
        active = state.active.len(),
        active_bytes = state.active_bytes,
        "buffer scope limit hit"
    );
    StreamError::ResourceLimit {
        count,
        bytes,
        max_count: limits.max_count,
        max_bytes: limits.max_bytes,
    }
}

/// A buffer rented from a [`BufferScope`]. Dereferences to its valid
/// region (`len` bytes); the backing allocation may be larger.
pub struct PooledBuffer {
    id: u64,
    data: Vec<u8>,
    len: usize,
    scope: Arc<ScopeInner>,
}

impl PooledBuffer {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Size of the backing allocation.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Set the valid region, clamped to the backing allocation.
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.data.len());
    }

    /// The whole backing allocation, for filling before `set_len`.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        self.scope.give_back(self.id, data);
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("id", &self.id)
            .field("len", &self.len)
            .field("capacity", &self.data.len())
            .finish()
    }
}
