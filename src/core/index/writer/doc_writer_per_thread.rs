// Copyright 2019 Zhizhesihai (Beijing) Technology Limited.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// See the License for the specific language governing permissions and
// limitations under the License.

use error::Result;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, TryLockError};

/// The per-thread in-memory structure accumulating documents and deletes
/// before they are written to a new segment.
///
/// How documents are analyzed and how the segment is encoded is up to the
/// implementation, flush control only looks at the reported counters.
pub trait IndexingBuffer: Send {
    type Segment: Send;

    /// Approximate number of bytes held by this buffer.
    fn bytes_used(&self) -> u64;

    fn num_docs_in_ram(&self) -> u32;

    fn num_delete_terms(&self) -> u32;

    /// Writes all buffered content as the segment named `segment_name`.
    fn flush(&mut self, segment_name: &str) -> Result<Self::Segment>;

    /// Discards all buffered content after an aborting failure.
    fn abort(&mut self) {}
}

/// `DocumentsWriterPerThreadPool` controls `ThreadState` instances
/// and their thread assignments during indexing. Each `ThreadState` holds
/// a reference to an `IndexingBuffer` that is once a `ThreadState` is
/// obtained from the pool exclusively used for indexing a single document
/// by the obtaining thread. Each indexing thread must obtain such a
/// `ThreadState` to make progress.
///
/// States are created lazily up to `max_thread_states`; once all of them are
/// checked out `get_and_lock` blocks until one is released.
pub struct DocumentsWriterPerThreadPool<B: IndexingBuffer> {
    inner: Mutex<DWPTPoolInner<B>>,
    cond: Condvar,
    max_thread_states: usize,
}

struct DWPTPoolInner<B: IndexingBuffer> {
    thread_states: Vec<Arc<ThreadState<B>>>,
    // valid thread_state index in `self.thread_states`
    free_list: Vec<usize>,
}

impl<B: IndexingBuffer> DocumentsWriterPerThreadPool<B> {
    pub fn new(max_thread_states: usize) -> Self {
        debug_assert!(max_thread_states > 0);
        let inner = DWPTPoolInner {
            thread_states: Vec::with_capacity(max_thread_states),
            free_list: Vec::with_capacity(max_thread_states),
        };
        DocumentsWriterPerThreadPool {
            inner: Mutex::new(inner),
            cond: Condvar::new(),
            max_thread_states,
        }
    }

    pub fn max_thread_states(&self) -> usize {
        self.max_thread_states
    }

    /// Returns the active number of `ThreadState` instances.
    pub fn active_thread_state_count(&self) -> Result<usize> {
        Ok(self.inner.lock()?.thread_states.len())
    }

    /// Point in time snapshot of all created `ThreadState`s, checked out or
    /// not.
    pub fn all_active(&self) -> Result<Vec<Arc<ThreadState<B>>>> {
        Ok(self.inner.lock()?.thread_states.clone())
    }

    /// Number of `ThreadState`s currently checked out by indexing threads.
    pub fn num_checked_out(&self) -> Result<usize> {
        let guard = self.inner.lock()?;
        Ok(guard.thread_states.len() - guard.free_list.len())
    }

    /// Hands out an idle `ThreadState`, lazily creating a new one while the
    /// pool is below its maximum size. Blocks if all states are in use.
    pub fn get_and_lock(&self) -> Result<Arc<ThreadState<B>>> {
        let mut guard = self.inner.lock()?;
        loop {
            if let Some(idx) = guard.free_list.pop() {
                return Ok(Arc::clone(&guard.thread_states[idx]));
            }
            if guard.thread_states.len() < self.max_thread_states {
                let idx = guard.thread_states.len();
                let thread_state = Arc::new(ThreadState::new(idx));
                guard.thread_states.push(Arc::clone(&thread_state));
                trace!("DWPTP - created thread state {}", idx);
                return Ok(thread_state);
            }
            guard = self.cond.wait(guard)?;
        }
    }

    pub fn release(&self, state: Arc<ThreadState<B>>) -> Result<()> {
        let mut guard = self.inner.lock()?;
        debug_assert!(Arc::ptr_eq(&guard.thread_states[state.index], &state));
        debug_assert!(!guard.free_list.contains(&state.index));
        guard.free_list.push(state.index);
        // In case any thread is waiting, wake one of them up since we just
        // released a thread state
        self.cond.notify_one();
        Ok(())
    }
}

/// `ThreadState` references and guards an `IndexingBuffer` instance that is
/// used during indexing to build an in-memory segment. `ThreadState` also
/// holds all flush related per-thread data controlled by
/// `DocumentsWriterFlushControl`.
///
/// The buffer itself is only reachable through `#lock()`. The cached
/// counters are written by `DocumentsWriterFlushControl` while it holds its
/// own lock, which lets the flush policy compare states without touching the
/// buffers of other threads.
pub struct ThreadState<B: IndexingBuffer> {
    buffer: Mutex<Option<B>>,
    // write access guarded by DocumentsWriterFlushControl
    flush_pending: AtomicBool,
    // write access guarded by DocumentsWriterFlushControl
    bytes_used: AtomicU64,
    num_docs_in_ram: AtomicU32,
    num_delete_terms: AtomicU32,
    // index in DocumentsWriterPerThreadPool
    index: usize,
}

impl<B: IndexingBuffer> ThreadState<B> {
    fn new(index: usize) -> Self {
        ThreadState {
            buffer: Mutex::new(None),
            flush_pending: AtomicBool::new(false),
            bytes_used: AtomicU64::new(0),
            num_docs_in_ram: AtomicU32::new(0),
            num_delete_terms: AtomicU32::new(0),
            index,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn lock(&self) -> Result<MutexGuard<Option<B>>> {
        Ok(self.buffer.lock()?)
    }

    /// Returns `None` if another thread currently holds this state's buffer.
    pub fn try_lock(&self) -> Option<MutexGuard<Option<B>>> {
        match self.buffer.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::WouldBlock) => None,
            Err(TryLockError::Poisoned(_)) => {
                warn!("DWPTP - thread state {} is poisoned", self.index);
                None
            }
        }
    }

    pub fn flush_pending(&self) -> bool {
        self.flush_pending.load(Ordering::Acquire)
    }

    pub fn bytes_used(&self) -> u64 {
        self.bytes_used.load(Ordering::Acquire)
    }

    pub fn num_docs_in_ram(&self) -> u32 {
        self.num_docs_in_ram.load(Ordering::Acquire)
    }

    pub fn num_delete_terms(&self) -> u32 {
        self.num_delete_terms.load(Ordering::Acquire)
    }

    /// True if this state holds buffered content that is not yet selected
    /// for flushing.
    pub fn is_active(&self) -> bool {
        !self.flush_pending() && self.has_content()
    }

    pub(crate) fn has_content(&self) -> bool {
        self.num_docs_in_ram() > 0 || self.num_delete_terms() > 0 || self.bytes_used() > 0
    }

    pub(crate) fn set_flush_pending(&self, pending: bool) {
        self.flush_pending.store(pending, Ordering::Release);
    }

    /// Refreshes the cached counters from `buffer` and returns the bytes delta.
    pub(crate) fn commit_bytes(&self, buffer: &B) -> i64 {
        let bytes = buffer.bytes_used();
        let old = self.bytes_used.swap(bytes, Ordering::AcqRel);
        self.commit_counts(buffer);
        bytes as i64 - old as i64
    }

    pub(crate) fn commit_counts(&self, buffer: &B) {
        self.num_docs_in_ram
            .store(buffer.num_docs_in_ram(), Ordering::Release);
        self.num_delete_terms
            .store(buffer.num_delete_terms(), Ordering::Release);
    }

    /// Clears the cached counters and pending flag, returning the previous
    /// cached bytes.
    pub(crate) fn reset(&self) -> u64 {
        self.flush_pending.store(false, Ordering::Release);
        self.num_docs_in_ram.store(0, Ordering::Release);
        self.num_delete_terms.store(0, Ordering::Release);
        self.bytes_used.swap(0, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::index::writer::tests::MockBuffer;

    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_lazy_creation_and_reuse() {
        let pool: DocumentsWriterPerThreadPool<MockBuffer> = DocumentsWriterPerThreadPool::new(4);
        assert_eq!(pool.active_thread_state_count().unwrap(), 0);

        let s1 = pool.get_and_lock().unwrap();
        let s2 = pool.get_and_lock().unwrap();
        assert_ne!(s1.index(), s2.index());
        assert_eq!(pool.active_thread_state_count().unwrap(), 2);
        assert_eq!(pool.num_checked_out().unwrap(), 2);

        let idx = s1.index();
        pool.release(s1).unwrap();
        let s3 = pool.get_and_lock().unwrap();
        assert_eq!(s3.index(), idx);
        assert_eq!(pool.active_thread_state_count().unwrap(), 2);

        pool.release(s2).unwrap();
        pool.release(s3).unwrap();
        assert_eq!(pool.num_checked_out().unwrap(), 0);
        assert_eq!(pool.all_active().unwrap().len(), 2);
    }

    #[test]
    fn test_get_and_lock_blocks_at_capacity() {
        let pool = Arc::new(DocumentsWriterPerThreadPool::<MockBuffer>::new(1));
        let held = pool.get_and_lock().unwrap();
        let acquired = Arc::new(AtomicUsize::new(0));

        let handle = {
            let pool = Arc::clone(&pool);
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                let state = pool.get_and_lock().unwrap();
                acquired.fetch_add(1, Ordering::SeqCst);
                pool.release(state).unwrap();
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert_eq!(acquired.load(Ordering::SeqCst), 0);
        pool.release(held).unwrap();
        handle.join().unwrap();
        assert_eq!(acquired.load(Ordering::SeqCst), 1);
        assert_eq!(pool.active_thread_state_count().unwrap(), 1);
    }

    #[test]
    fn test_cached_counters() {
        let pool: DocumentsWriterPerThreadPool<MockBuffer> = DocumentsWriterPerThreadPool::new(1);
        let state = pool.get_and_lock().unwrap();
        assert!(!state.is_active());

        let mut buffer = MockBuffer::default();
        buffer.add_doc(100);
        assert_eq!(state.commit_bytes(&buffer), 100);
        buffer.add_doc(50);
        buffer.delete_term();
        assert_eq!(state.commit_bytes(&buffer), 50);
        assert_eq!(state.bytes_used(), 150);
        assert_eq!(state.num_docs_in_ram(), 2);
        assert_eq!(state.num_delete_terms(), 1);
        assert!(state.is_active());

        state.set_flush_pending(true);
        assert!(!state.is_active());
        assert_eq!(state.reset(), 150);
        assert!(!state.flush_pending());
        assert!(!state.has_content());
    }
}
