// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Global byte budget for edge buffers.
//!
//! Responsibilities:
//! - Grants fixed-capacity buffers against one byte budget and blocks callers when it is exhausted.
//! - Serves blocked callers in arrival order, so a large request cannot be starved by small ones.
//! - Evicts sealed chunks to the buffer store before blocking, and restores them on demand.
//!
//! Key exported interfaces:
//! - Types: `BufferPool`, `Buffer`, `SpilledBuffer`, `Evictable`, `EvictOutcome`, `BufferPoolConfig`, `BufferPoolStats`.
//!
//! Every granted byte is returned when its `Buffer` drops; there is no explicit release call.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::Duration;

use crate::common::config;
use crate::common::error::{EngineError, EngineResult};
use crate::exec::spill::{BufferStore, SpillHandle};
use crate::runtime::mem_tracker::{MemTracker, process_mem_tracker};
use crate::vanilla_logging::{debug, trace};

const EVICTABLE_PRUNE_EVERY: u64 = 1024;

#[derive(Clone, Debug)]
pub struct BufferPoolConfig {
    pub budget_bytes: usize,
    pub buffer_size_bytes: usize,
    pub free_list_capacity: usize,
    /// How often a blocked acquirer wakes up to re-check cancellation and retry eviction.
    pub acquire_poll: Duration,
}

impl BufferPoolConfig {
    pub fn from_app_config() -> Self {
        Self {
            budget_bytes: config::buffer_pool_budget_bytes(),
            buffer_size_bytes: config::buffer_size_bytes(),
            free_list_capacity: config::buffer_free_list_capacity(),
            acquire_poll: Duration::from_millis(config::acquire_poll_ms().max(1)),
        }
    }
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 256 * 1024 * 1024,
            buffer_size_bytes: 256 * 1024,
            free_list_capacity: 16,
            acquire_poll: Duration::from_millis(50),
        }
    }
}

/// Result of asking a registered chunk to give up its pool bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictOutcome {
    /// Bytes were written to the store and returned to the pool.
    Evicted(usize),
    /// The chunk is in use right now; ask again later.
    Busy,
    /// Nothing resident any more; forget the registration.
    Gone,
}

/// A pool-resident payload that can move itself to the buffer store.
pub trait Evictable: Send + Sync {
    fn try_evict(&self, pool: &BufferPool) -> EngineResult<EvictOutcome>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferPoolStats {
    pub budget_bytes: usize,
    pub outstanding_bytes: usize,
    pub peak_bytes: i64,
    pub acquisitions: u64,
    pub blocked_acquisitions: u64,
    pub spills: u64,
    pub spilled_bytes: u64,
    pub restores: u64,
    pub evictions: u64,
}

/// Blocked acquirers as seen by the graph executor's stall check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PoolWaiters {
    pub(crate) parked: usize,
    /// Request size of the waiter served next.
    pub(crate) head_request: Option<usize>,
    /// Grants plus releases so far; unchanged means the pool made no progress.
    pub(crate) progress: u64,
}

struct PoolState {
    used: usize,
    next_ticket: u64,
    /// (ticket, requested bytes) in arrival order.
    waiting: VecDeque<(u64, usize)>,
    progress: u64,
    cancelled: Option<String>,
}

struct PoolShared {
    config: BufferPoolConfig,
    state: Mutex<PoolState>,
    cv: Condvar,
    free_list: Mutex<Vec<Vec<u8>>>,
    evictable: Mutex<VecDeque<Weak<dyn Evictable>>>,
    store: Option<Arc<BufferStore>>,
    tracker: Arc<MemTracker>,
    registrations: AtomicU64,
    acquisitions: AtomicU64,
    blocked_acquisitions: AtomicU64,
    spills: AtomicU64,
    spilled_bytes: AtomicU64,
    restores: AtomicU64,
    evictions: AtomicU64,
}

impl PoolShared {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self, capacity: usize, mut data: Vec<u8>) {
        if capacity == self.config.buffer_size_bytes {
            let mut free = self.free_list.lock().unwrap_or_else(|e| e.into_inner());
            if free.len() < self.config.free_list_capacity {
                data.clear();
                free.push(data);
            }
        }
        let mut st = self.lock_state();
        st.used -= capacity;
        st.progress += 1;
        self.tracker.release(capacity as i64);
        drop(st);
        self.cv.notify_all();
    }

    fn take_allocation(&self, capacity: usize) -> Vec<u8> {
        if capacity == self.config.buffer_size_bytes {
            let mut free = self.free_list.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(data) = free.pop() {
                return data;
            }
        }
        Vec::with_capacity(capacity)
    }
}

/// Handle to the shared buffer pool. Cloning is cheap.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolShared>,
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("budget_bytes", &self.inner.config.budget_bytes)
            .field("outstanding_bytes", &self.outstanding_bytes())
            .field("spill", &self.inner.store.is_some())
            .field("tracker", &self.inner.tracker.label())
            .finish()
    }
}

impl BufferPool {
    pub fn new(config: BufferPoolConfig, store: Option<Arc<BufferStore>>) -> Self {
        let tracker = MemTracker::new_child("buffer_pool", &process_mem_tracker());
        Self::with_tracker(config, store, tracker)
    }

    pub fn with_tracker(
        config: BufferPoolConfig,
        store: Option<Arc<BufferStore>>,
        tracker: Arc<MemTracker>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolShared {
                config,
                state: Mutex::new(PoolState {
                    used: 0,
                    next_ticket: 0,
                    waiting: VecDeque::new(),
                    progress: 0,
                    cancelled: None,
                }),
                cv: Condvar::new(),
                free_list: Mutex::new(Vec::new()),
                evictable: Mutex::new(VecDeque::new()),
                store,
                tracker,
                registrations: AtomicU64::new(0),
                acquisitions: AtomicU64::new(0),
                blocked_acquisitions: AtomicU64::new(0),
                spills: AtomicU64::new(0),
                spilled_bytes: AtomicU64::new(0),
                restores: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
            }),
        }
    }

    pub fn budget(&self) -> usize {
        self.inner.config.budget_bytes
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.config.buffer_size_bytes
    }

    pub fn outstanding_bytes(&self) -> usize {
        self.inner.lock_state().used
    }

    /// Acquire a standard-size buffer.
    pub fn acquire_default(&self) -> EngineResult<Buffer> {
        self.acquire(self.inner.config.buffer_size_bytes)
    }

    /// Block until `size` bytes fit under the budget, then grant them.
    pub fn acquire(&self, size: usize) -> EngineResult<Buffer> {
        let budget = self.inner.config.budget_bytes;
        if size > budget {
            return Err(EngineError::BudgetExceeded {
                requested: size,
                budget,
            });
        }
        let ticket = {
            let mut st = self.inner.lock_state();
            if let Some(reason) = &st.cancelled {
                return Err(EngineError::cancelled(reason.clone()));
            }
            if st.waiting.is_empty() && st.used + size <= budget {
                st.used += size;
                st.progress += 1;
                drop(st);
                return Ok(self.grant(size));
            }
            let ticket = st.next_ticket;
            st.next_ticket += 1;
            st.waiting.push_back((ticket, size));
            ticket
        };
        self.inner
            .blocked_acquisitions
            .fetch_add(1, Ordering::Relaxed);
        trace!("buffer pool acquire blocked: size={} ticket={}", size, ticket);

        loop {
            let deficit = {
                let st = self.inner.lock_state();
                (st.used + size).saturating_sub(budget)
            };
            if deficit > 0
                && let Err(err) = self.evict(deficit)
            {
                self.abandon_ticket(ticket);
                return Err(err);
            }

            let mut st = self.inner.lock_state();
            loop {
                if let Some(reason) = &st.cancelled {
                    let reason = reason.clone();
                    st.waiting.retain(|(t, _)| *t != ticket);
                    drop(st);
                    self.inner.cv.notify_all();
                    return Err(EngineError::cancelled(reason));
                }
                if st.waiting.front().is_some_and(|(t, _)| *t == ticket)
                    && st.used + size <= budget
                {
                    st.waiting.pop_front();
                    st.used += size;
                    st.progress += 1;
                    drop(st);
                    // The next waiter in line may fit as well.
                    self.inner.cv.notify_all();
                    return Ok(self.grant(size));
                }
                let (guard, timeout) = self
                    .inner
                    .cv
                    .wait_timeout(st, self.inner.config.acquire_poll)
                    .unwrap_or_else(|e| e.into_inner());
                st = guard;
                if timeout.timed_out() {
                    break;
                }
            }
        }
    }

    /// Grant `size` bytes only if that is possible without waiting.
    pub fn try_acquire(&self, size: usize) -> Option<Buffer> {
        let mut st = self.inner.lock_state();
        if st.cancelled.is_some()
            || !st.waiting.is_empty()
            || st.used + size > self.inner.config.budget_bytes
        {
            return None;
        }
        st.used += size;
        st.progress += 1;
        drop(st);
        Some(self.grant(size))
    }

    /// Persist a buffer's bytes to the store.
    ///
    /// The buffer stays with the caller, who drops it once the copy is safe;
    /// on failure the bytes are still intact in memory.
    pub fn spill(&self, buffer: &Buffer) -> EngineResult<SpilledBuffer> {
        let store = self
            .inner
            .store
            .as_ref()
            .ok_or_else(|| EngineError::graph("buffer spill requested but spilling is disabled"))?;
        let handle = store.store(buffer.as_slice())?;
        self.inner.spills.fetch_add(1, Ordering::Relaxed);
        self.inner
            .spilled_bytes
            .fetch_add(handle.len() as u64, Ordering::Relaxed);
        Ok(SpilledBuffer {
            handle,
            capacity: buffer.capacity(),
        })
    }

    /// Re-acquire pool space (blocking as needed) and reload a spilled buffer.
    pub fn restore(&self, spilled: &SpilledBuffer) -> EngineResult<Buffer> {
        let store = self
            .inner
            .store
            .as_ref()
            .ok_or_else(|| EngineError::graph("buffer restore requested but spilling is disabled"))?;
        let mut buffer = self.acquire(spilled.capacity)?;
        store.load(&spilled.handle, &mut buffer.data)?;
        self.inner.restores.fetch_add(1, Ordering::Relaxed);
        Ok(buffer)
    }

    /// Offer a chunk to the evictor. Ignored when spilling is disabled.
    pub fn register_evictable(&self, chunk: Weak<dyn Evictable>) {
        if self.inner.store.is_none() {
            return;
        }
        let mut list = self
            .inner
            .evictable
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        list.push_back(chunk);
        let count = self.inner.registrations.fetch_add(1, Ordering::Relaxed) + 1;
        if count.is_multiple_of(EVICTABLE_PRUNE_EVERY) {
            list.retain(|w| w.strong_count() > 0);
        }
    }

    /// Fail current and future acquirers. Releasing keeps working.
    pub fn cancel(&self, reason: impl Into<String>) {
        let mut st = self.inner.lock_state();
        if st.cancelled.is_none() {
            st.cancelled = Some(reason.into());
        }
        drop(st);
        self.inner.cv.notify_all();
    }

    pub(crate) fn waiters(&self) -> PoolWaiters {
        let st = self.inner.lock_state();
        PoolWaiters {
            parked: st.waiting.len(),
            head_request: st.waiting.front().map(|(_, size)| *size),
            progress: st.progress,
        }
    }

    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            budget_bytes: self.inner.config.budget_bytes,
            outstanding_bytes: self.outstanding_bytes(),
            peak_bytes: self.inner.tracker.peak(),
            acquisitions: self.inner.acquisitions.load(Ordering::Relaxed),
            blocked_acquisitions: self.inner.blocked_acquisitions.load(Ordering::Relaxed),
            spills: self.inner.spills.load(Ordering::Relaxed),
            spilled_bytes: self.inner.spilled_bytes.load(Ordering::Relaxed),
            restores: self.inner.restores.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
        }
    }

    fn grant(&self, capacity: usize) -> Buffer {
        self.inner.tracker.consume(capacity as i64);
        self.inner.acquisitions.fetch_add(1, Ordering::Relaxed);
        Buffer {
            data: self.inner.take_allocation(capacity),
            capacity,
            pool: Arc::clone(&self.inner),
        }
    }

    fn abandon_ticket(&self, ticket: u64) {
        let mut st = self.inner.lock_state();
        st.waiting.retain(|(t, _)| *t != ticket);
        drop(st);
        self.inner.cv.notify_all();
    }

    /// Spill registered chunks until `target` bytes were freed or none is left.
    fn evict(&self, target: usize) -> EngineResult<usize> {
        if self.inner.store.is_none() {
            return Ok(0);
        }
        let mut freed = 0usize;
        let mut budget_of_attempts = {
            let list = self
                .inner
                .evictable
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            list.len()
        };
        while freed < target && budget_of_attempts > 0 {
            budget_of_attempts -= 1;
            let candidate = {
                let mut list = self
                    .inner
                    .evictable
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                list.pop_front()
            };
            let Some(weak) = candidate else {
                break;
            };
            let Some(chunk) = weak.upgrade() else {
                continue;
            };
            let outcome = match chunk.try_evict(self) {
                Ok(outcome) => outcome,
                Err(err) => {
                    // The chunk kept its bytes; it stays a candidate.
                    let mut list = self
                        .inner
                        .evictable
                        .lock()
                        .unwrap_or_else(|e| e.into_inner());
                    list.push_back(weak);
                    return Err(err);
                }
            };
            match outcome {
                EvictOutcome::Evicted(bytes) => {
                    freed += bytes;
                    self.inner.evictions.fetch_add(1, Ordering::Relaxed);
                }
                EvictOutcome::Busy => {
                    let mut list = self
                        .inner
                        .evictable
                        .lock()
                        .unwrap_or_else(|e| e.into_inner());
                    list.push_back(weak);
                }
                EvictOutcome::Gone => {}
            }
        }
        if freed > 0 {
            debug!(
                "buffer pool evicted {} bytes (target {} bytes)",
                freed, target
            );
        }
        Ok(freed)
    }
}

/// Pool-owned, fixed-capacity byte region.
pub struct Buffer {
    data: Vec<u8>,
    capacity: usize,
    pool: Arc<PoolShared>,
}

impl Buffer {
    /// Bytes charged against the pool budget.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Append `bytes` if they fit; returns false and leaves the buffer untouched otherwise.
    pub fn append(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.remaining() {
            return false;
        }
        self.data.extend_from_slice(bytes);
        true
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.data.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        self.pool.release(self.capacity, data);
    }
}

/// A buffer that lives in the buffer store instead of the pool.
#[derive(Debug)]
pub struct SpilledBuffer {
    handle: SpillHandle,
    capacity: usize,
}

impl SpilledBuffer {
    pub fn len(&self) -> usize {
        self.handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handle.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
