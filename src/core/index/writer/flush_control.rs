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

use core::index::writer::{
    DocumentsWriterPerThreadPool, DocumentsWriterStallControl, FlushPolicy, IndexWriterConfig,
    IndexingBuffer, ThreadState,
};
use error::ErrorKind::IllegalState;
use error::Result;

use std::cmp::max;
use std::collections::{HashMap, VecDeque};
use std::mem;
use std::sync::{Arc, Condvar, Mutex};

/// This class controls buffer flushing during indexing. It tracks the memory
/// consumption per `ThreadState` and uses a configured `FlushPolicy` to
/// decide if a buffer must flush.
///
/// In addition to the `FlushPolicy` the flush control might set certain
/// buffers as flush pending iff a buffer exceeds the
/// `IndexWriterConfig#per_thread_hard_limit_mb` to prevent address space
/// exhaustion.
///
/// All accounting happens under a single lock:
///
/// - `active_bytes` is the sum of the cached bytes of all states that are not
///   flush pending.
/// - `flush_bytes` is the sum of the cached bytes of all pending states plus
///   the bytes of every buffer that was checked out and is not yet released
///   via `#do_after_flush`.
///
/// A buffer handed out by `#next_pending_flush` (or returned from one of the
/// `on_*` methods) must always be passed back to `#do_after_flush`, even if
/// flushing it failed, otherwise its bytes stay in `flush_bytes` forever.
pub struct DocumentsWriterFlushControl<B: IndexingBuffer> {
    lock: Mutex<FlushControlState<B>>,
    cond: Condvar,
    hard_max_bytes_per_dwpt: u64,
    stall_ratio: usize,
    stall_control: DocumentsWriterStallControl,
    per_thread_pool: DocumentsWriterPerThreadPool<B>,
    flush_policy: Arc<dyn FlushPolicy<B>>,
    config: Arc<IndexWriterConfig>,
}

/// Accounting guarded by the flush control lock.
struct FlushControlState<B: IndexingBuffer> {
    active_bytes: u64,
    flush_bytes: u64,
    // states marked pending whose buffer is not checked out yet
    num_pending_states: usize,
    peak_active_bytes: u64,
    peak_flush_bytes: u64,
    peak_net_bytes: u64,
    peak_delta: u64,
    flush_queue: VecDeque<FlushingBuffer<B>>,
    // key is segment_name of the checked out buffer
    flushing_writers: HashMap<String, u64>,
    segment_counter: u64,
    full_flush: bool,
    closed: bool,
}

/// Point in time copy of the flush control accounting.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlushControlStats {
    pub active_bytes: u64,
    pub flush_bytes: u64,
    /// buffers marked for flushing and not yet released by `do_after_flush`
    pub num_pending: usize,
    pub num_flushing: usize,
    pub num_queued_flushes: usize,
    pub peak_active_bytes: u64,
    pub peak_flush_bytes: u64,
    pub peak_net_bytes: u64,
    pub peak_delta: u64,
}

/// A buffer checked out of its `ThreadState` for flushing. Its bytes stay
/// accounted as flush bytes until it is passed to
/// `DocumentsWriterFlushControl#do_after_flush`.
pub struct FlushingBuffer<B: IndexingBuffer> {
    segment_name: String,
    bytes: u64,
    num_docs: u32,
    buffer: B,
}

impl<B: IndexingBuffer> FlushingBuffer<B> {
    pub fn segment_name(&self) -> &str {
        &self.segment_name
    }

    /// Bytes accounted for this buffer at checkout.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn num_docs(&self) -> u32 {
        self.num_docs
    }

    pub fn buffer(&self) -> &B {
        &self.buffer
    }

    pub fn flush(&mut self) -> Result<B::Segment> {
        self.buffer.flush(&self.segment_name)
    }

    pub fn abort(&mut self) {
        self.buffer.abort();
    }
}

/// The view of `DocumentsWriterFlushControl` a `FlushPolicy` works on. It
/// only exists while the flush control lock is held.
pub struct LockedFlushControl<'a, B: IndexingBuffer + 'a> {
    state: &'a mut FlushControlState<B>,
    pool: &'a DocumentsWriterPerThreadPool<B>,
}

impl<'a, B: IndexingBuffer> LockedFlushControl<'a, B> {
    pub fn active_bytes(&self) -> u64 {
        self.state.active_bytes
    }

    pub fn flush_bytes(&self) -> u64 {
        self.state.flush_bytes
    }

    pub fn num_pending(&self) -> usize {
        self.state.num_pending()
    }

    pub fn per_thread_pool(&self) -> &DocumentsWriterPerThreadPool<B> {
        self.pool
    }

    pub fn set_flush_pending(&mut self, per_thread: &ThreadState<B>) {
        self.state.set_flush_pending(per_thread)
    }
}

fn add_bytes(total: &mut u64, delta: i64, name: &str) {
    if delta >= 0 {
        *total += delta as u64;
    } else {
        sub_bytes(total, (-delta) as u64, name);
    }
}

fn sub_bytes(total: &mut u64, bytes: u64, name: &str) {
    assert!(
        *total >= bytes,
        "FC - {} underflow: {} - {}",
        name,
        *total,
        bytes
    );
    *total -= bytes;
}

// segment names are "_" + base 36 counter
fn segment_name(counter: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut n = counter;
    let mut buf = Vec::new();
    loop {
        buf.push(DIGITS[(n % 36) as usize]);
        n /= 36;
        if n == 0 {
            break;
        }
    }
    buf.push(b'_');
    buf.reverse();
    String::from_utf8(buf).unwrap_or_default()
}

impl<B: IndexingBuffer> FlushControlState<B> {
    fn new() -> Self {
        FlushControlState {
            active_bytes: 0,
            flush_bytes: 0,
            num_pending_states: 0,
            peak_active_bytes: 0,
            peak_flush_bytes: 0,
            peak_net_bytes: 0,
            peak_delta: 0,
            flush_queue: VecDeque::new(),
            flushing_writers: HashMap::new(),
            segment_counter: 0,
            full_flush: false,
            closed: false,
        }
    }

    fn commit_per_thread_bytes(&mut self, per_thread: &ThreadState<B>, buffer: &B) {
        let delta = per_thread.commit_bytes(buffer);
        // We need to differentiate here if we are pending since set_flush_pending
        // moves the per_thread memory to the flush_bytes and we could be set to
        // pending during a delete
        if per_thread.flush_pending() {
            add_bytes(&mut self.flush_bytes, delta, "flush_bytes");
        } else {
            add_bytes(&mut self.active_bytes, delta, "active_bytes");
        }
        self.update_peaks(delta.abs() as u64);
    }

    fn update_peaks(&mut self, delta: u64) {
        self.peak_active_bytes = max(self.peak_active_bytes, self.active_bytes);
        self.peak_flush_bytes = max(self.peak_flush_bytes, self.flush_bytes);
        self.peak_net_bytes = max(self.peak_net_bytes, self.flush_bytes + self.active_bytes);
        self.peak_delta = max(self.peak_delta, delta);
    }

    fn set_flush_pending(&mut self, per_thread: &ThreadState<B>) {
        assert!(
            !per_thread.flush_pending(),
            "FC - thread state {} is already flush pending",
            per_thread.index()
        );
        if per_thread.has_content() {
            // write access synced
            per_thread.set_flush_pending(true);
            let bytes = per_thread.bytes_used();
            sub_bytes(&mut self.active_bytes, bytes, "active_bytes");
            self.flush_bytes += bytes;
            self.num_pending_states += 1;
            self.update_peaks(0);
            trace!(
                "FC - thread state {} pending with {} bytes",
                per_thread.index(),
                bytes
            );
        }
        // don't assert on content since we could hit an abort
        // while selecting that buffer for flushing
    }

    fn next_segment_name(&mut self) -> String {
        let name = segment_name(self.segment_counter);
        self.segment_counter += 1;
        name
    }

    fn try_checkout_for_flush(
        &mut self,
        per_thread: &ThreadState<B>,
        buffer: &mut Option<B>,
    ) -> Option<FlushingBuffer<B>> {
        if per_thread.flush_pending() {
            self.internal_try_checkout_for_flush(per_thread, buffer)
        } else {
            None
        }
    }

    fn internal_try_checkout_for_flush(
        &mut self,
        per_thread: &ThreadState<B>,
        buffer: &mut Option<B>,
    ) -> Option<FlushingBuffer<B>> {
        debug_assert!(per_thread.flush_pending());
        // We are pending so all memory is already moved to flush_bytes
        let num_docs = per_thread.num_docs_in_ram();
        let bytes = per_thread.reset();
        self.num_pending_states -= 1;
        match buffer.take() {
            Some(buffer) => {
                let segment_name = self.next_segment_name();
                debug_assert!(!self.flushing_writers.contains_key(&segment_name));
                self.flushing_writers.insert(segment_name.clone(), bytes);
                debug!(
                    "FC - checkout thread state {} for flush as {}: num_docs={} bytes={}",
                    per_thread.index(),
                    &segment_name,
                    num_docs,
                    bytes
                );
                Some(FlushingBuffer {
                    segment_name,
                    bytes,
                    num_docs,
                    buffer,
                })
            }
            None => {
                warn!(
                    "FC - pending thread state {} has no buffer",
                    per_thread.index()
                );
                sub_bytes(&mut self.flush_bytes, bytes, "flush_bytes");
                None
            }
        }
    }

    fn release_flushing(&mut self, segment_name: &str, bytes: u64) {
        let recorded = self.flushing_writers.remove(segment_name);
        assert_eq!(
            recorded,
            Some(bytes),
            "FC - segment {} was not checked out for flush",
            segment_name
        );
        sub_bytes(&mut self.flush_bytes, bytes, "flush_bytes");
    }

    // pending until do_after_flush, whether checked out or not
    fn num_pending(&self) -> usize {
        self.num_pending_states + self.flushing_writers.len()
    }

    fn stats(&self) -> FlushControlStats {
        FlushControlStats {
            active_bytes: self.active_bytes,
            flush_bytes: self.flush_bytes,
            num_pending: self.num_pending(),
            num_flushing: self.flushing_writers.len(),
            num_queued_flushes: self.flush_queue.len(),
            peak_active_bytes: self.peak_active_bytes,
            peak_flush_bytes: self.peak_flush_bytes,
            peak_net_bytes: self.peak_net_bytes,
            peak_delta: self.peak_delta,
        }
    }
}

impl<B: IndexingBuffer> DocumentsWriterFlushControl<B> {
    pub fn new(config: Arc<IndexWriterConfig>, flush_policy: Arc<dyn FlushPolicy<B>>) -> Self {
        DocumentsWriterFlushControl {
            lock: Mutex::new(FlushControlState::new()),
            cond: Condvar::new(),
            hard_max_bytes_per_dwpt: config.per_thread_hard_limit(),
            stall_ratio: config.stall_ratio,
            stall_control: DocumentsWriterStallControl::new(),
            per_thread_pool: DocumentsWriterPerThreadPool::new(config.max_thread_states),
            flush_policy,
            config,
        }
    }

    pub fn config(&self) -> &IndexWriterConfig {
        &self.config
    }

    pub fn per_thread_pool(&self) -> &DocumentsWriterPerThreadPool<B> {
        &self.per_thread_pool
    }

    pub fn stall_control(&self) -> &DocumentsWriterStallControl {
        &self.stall_control
    }

    pub fn all_active_thread_states(&self) -> Result<Vec<Arc<ThreadState<B>>>> {
        self.per_thread_pool.all_active()
    }

    /// Called after a document was added to `per_thread`'s buffer. Returns
    /// the buffer if it must be flushed now; the caller owns the flush.
    pub fn on_insert(
        &self,
        per_thread: &ThreadState<B>,
        buffer: &mut Option<B>,
    ) -> Result<Option<FlushingBuffer<B>>> {
        self.do_after_document(per_thread, buffer, false)
    }

    /// Same as `#on_insert` for a document that replaced documents matching a
    /// delete term.
    pub fn on_update(
        &self,
        per_thread: &ThreadState<B>,
        buffer: &mut Option<B>,
    ) -> Result<Option<FlushingBuffer<B>>> {
        self.do_after_document(per_thread, buffer, true)
    }

    fn do_after_document(
        &self,
        per_thread: &ThreadState<B>,
        buffer: &mut Option<B>,
        is_update: bool,
    ) -> Result<Option<FlushingBuffer<B>>> {
        let mut guard = self.lock.lock()?;
        let res = self.process_after_document(&mut guard, per_thread, buffer, is_update)?;
        self.update_stall_state(&guard)?;
        debug_assert!(self.assert_memory(&guard));
        Ok(res)
    }

    fn process_after_document(
        &self,
        state: &mut FlushControlState<B>,
        per_thread: &ThreadState<B>,
        buffer: &mut Option<B>,
        is_update: bool,
    ) -> Result<Option<FlushingBuffer<B>>> {
        match buffer.as_ref() {
            Some(b) => state.commit_per_thread_bytes(per_thread, b),
            None => bail!(IllegalState(format!(
                "thread state {} has no buffer",
                per_thread.index()
            ))),
        }
        if !per_thread.flush_pending() {
            {
                let mut control = LockedFlushControl {
                    state: &mut *state,
                    pool: &self.per_thread_pool,
                };
                if is_update {
                    self.flush_policy.on_update(&mut control, per_thread);
                } else {
                    self.flush_policy.on_insert(&mut control, per_thread);
                }
            }

            if !per_thread.flush_pending() && per_thread.bytes_used() > self.hard_max_bytes_per_dwpt
            {
                // Safety check to prevent a single buffer exceeding its RAM limit.
                warn!(
                    "FC - thread state {} exceeds hard limit: {} bytes",
                    per_thread.index(),
                    per_thread.bytes_used()
                );
                state.set_flush_pending(per_thread);
            }
        }
        Ok(state.try_checkout_for_flush(per_thread, buffer))
    }

    /// Called after a delete was buffered in `per_thread`'s buffer. Deletes
    /// are not expected to change the buffer size noticeably, only the cached
    /// document and delete counts are refreshed.
    pub fn on_delete(
        &self,
        per_thread: &ThreadState<B>,
        buffer: &mut Option<B>,
    ) -> Result<Option<FlushingBuffer<B>>> {
        let mut guard = self.lock.lock()?;
        let res = {
            let state = &mut *guard;
            match buffer.as_ref() {
                Some(b) => per_thread.commit_counts(b),
                None => bail!(IllegalState(format!(
                    "thread state {} has no buffer",
                    per_thread.index()
                ))),
            }
            if !per_thread.flush_pending() {
                let mut control = LockedFlushControl {
                    state: &mut *state,
                    pool: &self.per_thread_pool,
                };
                self.flush_policy.on_delete(&mut control, per_thread);
            }
            state.try_checkout_for_flush(per_thread, buffer)
        };
        self.update_stall_state(&guard)?;
        debug_assert!(self.assert_memory(&guard));
        Ok(res)
    }

    /// Marks `per_thread` flush pending outside of a policy decision.
    pub fn set_flush_pending(&self, per_thread: &ThreadState<B>) -> Result<()> {
        let mut guard = self.lock.lock()?;
        guard.set_flush_pending(per_thread);
        self.update_stall_state(&guard)?;
        debug_assert!(self.assert_memory(&guard));
        Ok(())
    }

    /// Drops `per_thread`'s buffer after an aborting failure and removes its
    /// bytes from the accounting.
    pub fn do_on_abort(&self, per_thread: &ThreadState<B>, buffer: &mut Option<B>) -> Result<()> {
        let mut guard = self.lock.lock()?;
        {
            let state = &mut *guard;
            let pending = per_thread.flush_pending();
            let bytes = per_thread.reset();
            if pending {
                sub_bytes(&mut state.flush_bytes, bytes, "flush_bytes");
                state.num_pending_states -= 1;
            } else {
                sub_bytes(&mut state.active_bytes, bytes, "active_bytes");
            }
            // Take it out of the loop this buffer is stale
            if let Some(mut b) = buffer.take() {
                b.abort();
            }
        }
        self.update_stall_state(&guard)?;
        debug_assert!(self.assert_memory(&guard));
        Ok(())
    }

    /// Obtains a `ThreadState` for indexing. A state that was marked pending
    /// while it was idle is checked out into the flush queue first, so the
    /// caller never writes into a pending buffer.
    pub fn obtain_and_lock(&self) -> Result<Arc<ThreadState<B>>> {
        let per_thread = self.per_thread_pool.get_and_lock()?;
        if per_thread.flush_pending() {
            let res = self.checkout_into_queue(&per_thread);
            if let Err(e) = res {
                self.per_thread_pool.release(per_thread)?;
                return Err(e);
            }
        }
        Ok(per_thread)
    }

    fn checkout_into_queue(&self, per_thread: &ThreadState<B>) -> Result<()> {
        let mut buffer = per_thread.lock()?;
        let mut guard = self.lock.lock()?;
        if let Some(flushing) = guard.try_checkout_for_flush(per_thread, &mut buffer) {
            guard.flush_queue.push_back(flushing);
        }
        self.update_stall_state(&guard)?;
        Ok(())
    }

    /// Hands out the next buffer to flush, either a queued one or one of the
    /// pending `ThreadState`s that is not currently held by an indexing
    /// thread. Each pending buffer is handed out exactly once.
    pub fn next_pending_flush(&self) -> Result<Option<FlushingBuffer<B>>> {
        let mut guard = self.lock.lock()?;
        if let Some(flushing) = guard.flush_queue.pop_front() {
            self.update_stall_state(&guard)?;
            return Ok(Some(flushing));
        }

        // don't check if we are doing a full flush
        if guard.num_pending_states > 0 && !guard.full_flush {
            for next in self.per_thread_pool.all_active()? {
                if !next.flush_pending() {
                    continue;
                }
                // the holding thread checks it out itself after its document
                if let Some(mut buffer) = next.try_lock() {
                    if let Some(flushing) = guard.try_checkout_for_flush(&next, &mut buffer) {
                        self.update_stall_state(&guard)?;
                        debug_assert!(self.assert_memory(&guard));
                        return Ok(Some(flushing));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Releases the accounting of a flushed buffer. Must be called exactly
    /// once for every checked out buffer, whether its flush succeeded or not.
    pub fn do_after_flush(&self, flushing: FlushingBuffer<B>) -> Result<()> {
        let mut guard = self.lock.lock()?;
        guard.release_flushing(&flushing.segment_name, flushing.bytes);
        debug!(
            "FC - released {} with {} bytes",
            &flushing.segment_name, flushing.bytes
        );
        self.update_stall_state(&guard)?;
        debug_assert!(self.assert_memory(&guard));
        self.cond.notify_all();
        Ok(())
    }

    /// Aborts all buffers queued for flushing and releases their accounting.
    /// Returns the number of discarded documents.
    pub fn abort_pending_flushes(&self) -> Result<u32> {
        let mut guard = self.lock.lock()?;
        let flush_queue = mem::replace(&mut guard.flush_queue, VecDeque::new());
        let mut num_docs = 0;
        for mut flushing in flush_queue {
            num_docs += flushing.num_docs;
            flushing.abort();
            guard.release_flushing(&flushing.segment_name, flushing.bytes);
        }
        self.update_stall_state(&guard)?;
        self.cond.notify_all();
        Ok(num_docs)
    }

    /// Blocks until every checked out buffer was released.
    pub fn wait_for_flush(&self) -> Result<()> {
        let mut l = self.lock.lock()?;
        while !l.flushing_writers.is_empty() {
            l = self.cond.wait(l)?;
        }
        Ok(())
    }

    /// Checks out every buffer holding documents or deletes into the flush
    /// queue. While the full flush runs `#next_pending_flush` only hands out
    /// queued buffers.
    pub fn mark_for_full_flush(&self) -> Result<()> {
        {
            let mut guard = self.lock.lock()?;
            debug_assert!(!guard.full_flush);
            guard.full_flush = true;
        }

        for next in self.per_thread_pool.all_active()? {
            let mut buffer = next.lock()?;
            if buffer.is_none() {
                continue;
            }
            self.add_flushable_state(&next, &mut buffer)?;
        }

        let guard = self.lock.lock()?;
        self.update_stall_state(&guard)?;
        debug_assert!(self.assert_memory(&guard));
        debug!(
            "FC - full flush marked, {} buffers queued",
            guard.flush_queue.len()
        );
        Ok(())
    }

    fn add_flushable_state(&self, per_thread: &ThreadState<B>, buffer: &mut Option<B>) -> Result<()> {
        let mut guard = self.lock.lock()?;
        let state = &mut *guard;
        let has_content = buffer
            .as_ref()
            .map_or(false, |b| b.num_docs_in_ram() > 0 || b.num_delete_terms() > 0);
        if has_content {
            if let Some(b) = buffer.as_ref() {
                // the last operation might have been a delete
                state.commit_per_thread_bytes(per_thread, b);
            }
            if !per_thread.flush_pending() {
                state.set_flush_pending(per_thread);
            }
            if let Some(flushing) = state.internal_try_checkout_for_flush(per_thread, buffer) {
                state.flush_queue.push_back(flushing);
            }
        } else {
            // make this state inactive
            let pending = per_thread.flush_pending();
            let bytes = per_thread.reset();
            if pending {
                sub_bytes(&mut state.flush_bytes, bytes, "flush_bytes");
                state.num_pending_states -= 1;
            } else {
                sub_bytes(&mut state.active_bytes, bytes, "active_bytes");
            }
            buffer.take();
        }
        Ok(())
    }

    pub fn is_full_flush(&self) -> Result<bool> {
        Ok(self.lock.lock()?.full_flush)
    }

    pub fn finish_full_flush(&self) -> Result<()> {
        let mut guard = self.lock.lock()?;
        debug_assert!(guard.full_flush);
        // buffers queued after the drain are handed out by next_pending_flush
        guard.full_flush = false;
        self.update_stall_state(&guard)?;
        Ok(())
    }

    pub fn abort_full_flushes(&self) -> Result<u32> {
        let num_docs = self.abort_pending_flushes()?;
        self.lock.lock()?.full_flush = false;
        Ok(num_docs)
    }

    /// set by DW to signal that indexing is over; releases all stalled
    /// threads.
    pub fn set_closed(&self) -> Result<()> {
        let mut guard = self.lock.lock()?;
        guard.closed = true;
        self.update_stall_state(&guard)?;
        Ok(())
    }

    pub fn is_closed(&self) -> Result<bool> {
        Ok(self.lock.lock()?.closed)
    }

    // we block indexing threads if pending and flushing buffers pile up
    // because flushing is slower than indexing
    fn update_stall_state(&self, state: &FlushControlState<B>) -> Result<bool> {
        let num_flushing = state.num_pending();
        let num_active = self
            .per_thread_pool
            .all_active()?
            .iter()
            .filter(|s| s.is_active())
            .count();
        let stall = !state.closed && num_flushing > self.stall_ratio * max(num_active, 1);
        self.stall_control.update_stalled(stall)?;
        Ok(stall)
    }

    pub fn any_stalled_threads(&self) -> bool {
        self.stall_control.any_stalled_threads()
    }

    /// This method will block if too many buffers are currently flushing
    pub fn wait_if_stalled(&self) -> Result<()> {
        self.stall_control.wait_if_stalled()
    }

    pub fn num_queued_flushes(&self) -> Result<usize> {
        Ok(self.lock.lock()?.flush_queue.len())
    }

    pub fn active_bytes(&self) -> Result<u64> {
        Ok(self.lock.lock()?.active_bytes)
    }

    pub fn flush_bytes(&self) -> Result<u64> {
        Ok(self.lock.lock()?.flush_bytes)
    }

    /// Number of buffers marked for flushing that were not yet released via
    /// `#do_after_flush`, checked out or not.
    pub fn num_pending(&self) -> Result<usize> {
        Ok(self.lock.lock()?.num_pending())
    }

    pub fn stats(&self) -> Result<FlushControlStats> {
        Ok(self.lock.lock()?.stats())
    }

    /// Recomputes `active_bytes`, `flush_bytes` and the pending count from the
    /// `ThreadState`s and the checked out buffers and compares them with the
    /// maintained aggregates.
    pub fn verify_accounting(&self) -> Result<()> {
        let guard = self.lock.lock()?;
        self.check_accounting(&guard)
    }

    fn check_accounting(&self, state: &FlushControlState<B>) -> Result<()> {
        let mut active = 0u64;
        let mut pending = 0u64;
        let mut num_pending = 0usize;
        for s in self.per_thread_pool.all_active()? {
            if s.flush_pending() {
                pending += s.bytes_used();
                num_pending += 1;
            } else {
                active += s.bytes_used();
            }
        }
        let flushing: u64 = state.flushing_writers.values().sum();
        if active != state.active_bytes {
            bail!(IllegalState(format!(
                "active_bytes is {} but thread states hold {}",
                state.active_bytes, active
            )));
        }
        if pending + flushing != state.flush_bytes {
            bail!(IllegalState(format!(
                "flush_bytes is {} but pending states hold {} and flushing buffers {}",
                state.flush_bytes, pending, flushing
            )));
        }
        if num_pending != state.num_pending_states {
            bail!(IllegalState(format!(
                "{} thread states counted pending but {} are marked",
                state.num_pending_states, num_pending
            )));
        }
        Ok(())
    }

    // only for asserts
    fn assert_memory(&self, state: &FlushControlState<B>) -> bool {
        match self.check_accounting(state) {
            Ok(()) => true,
            Err(e) => {
                error!("FC - {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::index::writer::tests::MockBuffer;
    use core::index::writer::FlushByRamOrCountsPolicy;

    use rand::{thread_rng, Rng};

    fn new_control(conf: IndexWriterConfig) -> DocumentsWriterFlushControl<MockBuffer> {
        let conf = Arc::new(conf);
        let policy = Arc::new(FlushByRamOrCountsPolicy::new(Arc::clone(&conf)));
        DocumentsWriterFlushControl::new(conf, policy)
    }

    fn insert(
        control: &DocumentsWriterFlushControl<MockBuffer>,
        state: &ThreadState<MockBuffer>,
        size: u64,
    ) -> Option<FlushingBuffer<MockBuffer>> {
        let mut buffer = state.lock().unwrap();
        if buffer.is_none() {
            *buffer = Some(MockBuffer::default());
        }
        buffer.as_mut().unwrap().add_doc(size);
        control.on_insert(state, &mut buffer).unwrap()
    }

    /// Never triggers on its own, tests decide what gets flushed.
    struct ManualPolicy;

    impl FlushPolicy<MockBuffer> for ManualPolicy {
        fn on_delete(
            &self,
            _control: &mut LockedFlushControl<MockBuffer>,
            _state: &ThreadState<MockBuffer>,
        ) {
        }

        fn on_insert(
            &self,
            _control: &mut LockedFlushControl<MockBuffer>,
            _state: &ThreadState<MockBuffer>,
        ) {
        }
    }

    fn manual_control(max_thread_states: usize) -> DocumentsWriterFlushControl<MockBuffer> {
        let conf = Arc::new(IndexWriterConfig {
            max_thread_states,
            ..IndexWriterConfig::default()
        });
        DocumentsWriterFlushControl::new(conf, Arc::new(ManualPolicy))
    }

    #[test]
    fn test_segment_name() {
        assert_eq!(segment_name(0), "_0");
        assert_eq!(segment_name(35), "_z");
        assert_eq!(segment_name(36), "_10");
    }

    #[test]
    fn test_pending_and_after_flush_accounting() {
        let control = manual_control(2);
        let s1 = control.obtain_and_lock().unwrap();
        let s2 = control.obtain_and_lock().unwrap();
        assert!(insert(&control, &s1, 100).is_none());
        assert!(insert(&control, &s2, 40).is_none());
        assert!(insert(&control, &s1, 20).is_none());

        let stats = control.stats().unwrap();
        assert_eq!(stats.active_bytes, 160);
        assert_eq!(stats.flush_bytes, 0);
        assert_eq!(stats.peak_active_bytes, 160);
        assert_eq!(stats.peak_delta, 100);

        control.set_flush_pending(&s1).unwrap();
        let stats = control.stats().unwrap();
        assert_eq!(stats.active_bytes, 40);
        assert_eq!(stats.flush_bytes, 120);
        assert_eq!(stats.num_pending, 1);
        assert_eq!(control.num_pending().unwrap(), 1);
        control.verify_accounting().unwrap();

        // s1 is held by this thread, nobody else can check it out
        control.per_thread_pool().release(s2).unwrap();
        {
            let _held = s1.lock().unwrap();
            assert!(control.next_pending_flush().unwrap().is_none());
        }
        let flushing = control.next_pending_flush().unwrap().unwrap();
        assert!(control.next_pending_flush().unwrap().is_none());
        assert_eq!(flushing.bytes(), 120);
        assert_eq!(flushing.num_docs(), 2);
        assert!(!s1.flush_pending());
        assert_eq!(s1.bytes_used(), 0);
        assert!(s1.lock().unwrap().is_none());

        // still pending until the flush is acknowledged
        let stats = control.stats().unwrap();
        assert_eq!(stats.num_pending, 1);
        assert_eq!(control.num_pending().unwrap(), 1);
        assert_eq!(stats.num_flushing, 1);
        assert_eq!(stats.flush_bytes, 120);
        control.verify_accounting().unwrap();

        control.do_after_flush(flushing).unwrap();
        let stats = control.stats().unwrap();
        assert_eq!(stats.num_pending, 0);
        assert_eq!(stats.flush_bytes, 0);
        assert_eq!(stats.active_bytes, 40);
        assert_eq!(stats.num_flushing, 0);
        assert_eq!(stats.peak_net_bytes, 160);
        control.verify_accounting().unwrap();
        control.per_thread_pool().release(s1).unwrap();
    }

    #[test]
    #[should_panic(expected = "already flush pending")]
    fn test_double_pending_panics() {
        let control = manual_control(1);
        let state = control.obtain_and_lock().unwrap();
        insert(&control, &state, 10);
        control.set_flush_pending(&state).unwrap();
        control.set_flush_pending(&state).unwrap();
    }

    #[test]
    fn test_pending_state_is_checked_out_by_its_owner() {
        let control = manual_control(1);
        let state = control.obtain_and_lock().unwrap();
        insert(&control, &state, 10);
        control.set_flush_pending(&state).unwrap();
        // the next document of the owner goes to flush_bytes and hands the buffer out
        let flushing = insert(&control, &state, 5).unwrap();
        assert_eq!(flushing.bytes(), 15);
        assert_eq!(control.flush_bytes().unwrap(), 15);
        assert_eq!(control.active_bytes().unwrap(), 0);
        control.do_after_flush(flushing).unwrap();
        assert_eq!(control.flush_bytes().unwrap(), 0);
        control.per_thread_pool().release(state).unwrap();
    }

    #[test]
    fn test_obtain_pending_state_queues_its_buffer() {
        let control = manual_control(1);
        let state = control.obtain_and_lock().unwrap();
        insert(&control, &state, 30);
        control.set_flush_pending(&state).unwrap();
        control.per_thread_pool().release(state).unwrap();

        let state = control.obtain_and_lock().unwrap();
        assert!(!state.flush_pending());
        assert!(state.lock().unwrap().is_none());
        assert_eq!(control.num_queued_flushes().unwrap(), 1);
        let flushing = control.next_pending_flush().unwrap().unwrap();
        assert_eq!(flushing.bytes(), 30);
        control.do_after_flush(flushing).unwrap();
        control.per_thread_pool().release(state).unwrap();
        assert_eq!(control.stats().unwrap(), FlushControlStats {
            peak_active_bytes: 30,
            peak_flush_bytes: 30,
            peak_net_bytes: 30,
            peak_delta: 30,
            ..FlushControlStats::default()
        });
    }

    #[test]
    fn test_pending_until_flush_acknowledged() {
        let control = new_control(IndexWriterConfig {
            ram_buffer_size_mb: None,
            max_buffered_docs: Some(2),
            max_thread_states: 1,
            ..IndexWriterConfig::default()
        });
        let state = control.obtain_and_lock().unwrap();
        assert!(insert(&control, &state, 10).is_none());
        assert_eq!(control.num_pending().unwrap(), 0);
        let flushing = insert(&control, &state, 10).unwrap();

        // the state is reused right away, the flush is still in flight
        assert!(!state.flush_pending());
        assert_eq!(control.num_pending().unwrap(), 1);
        assert_eq!(control.flush_bytes().unwrap(), 20);
        assert!(insert(&control, &state, 5).is_none());
        assert_eq!(control.num_pending().unwrap(), 1);

        control.do_after_flush(flushing).unwrap();
        assert_eq!(control.num_pending().unwrap(), 0);
        assert_eq!(control.flush_bytes().unwrap(), 0);
        assert_eq!(control.active_bytes().unwrap(), 5);
        control.verify_accounting().unwrap();
        control.per_thread_pool().release(state).unwrap();
    }

    #[test]
    fn test_hard_limit() {
        let control = new_control(IndexWriterConfig {
            ram_buffer_size_mb: Some(1024.0),
            per_thread_hard_limit_mb: 1,
            max_thread_states: 1,
            ..IndexWriterConfig::default()
        });
        let state = control.obtain_and_lock().unwrap();
        assert!(insert(&control, &state, 1024 * 1024).is_none());
        let flushing = insert(&control, &state, 1).unwrap();
        assert_eq!(flushing.bytes(), 1024 * 1024 + 1);
        control.do_after_flush(flushing).unwrap();
        control.per_thread_pool().release(state).unwrap();
    }

    #[test]
    fn test_abort_releases_accounting() {
        let control = manual_control(2);
        let s1 = control.obtain_and_lock().unwrap();
        let s2 = control.obtain_and_lock().unwrap();
        insert(&control, &s1, 50);
        insert(&control, &s2, 70);
        control.set_flush_pending(&s2).unwrap();

        for s in &[&s1, &s2] {
            let mut buffer = s.lock().unwrap();
            control.do_on_abort(s, &mut buffer).unwrap();
            assert!(buffer.is_none());
        }
        let stats = control.stats().unwrap();
        assert_eq!(stats.active_bytes, 0);
        assert_eq!(stats.flush_bytes, 0);
        assert_eq!(stats.num_pending, 0);
        control.verify_accounting().unwrap();
    }

    #[test]
    fn test_full_flush() {
        let control = manual_control(3);
        let states: Vec<_> = (0..3).map(|_| control.obtain_and_lock().unwrap()).collect();
        insert(&control, &states[0], 10);
        insert(&control, &states[1], 20);
        // third state has an empty buffer
        *states[2].lock().unwrap() = Some(MockBuffer::default());
        control.set_flush_pending(&states[1]).unwrap();
        for s in states {
            control.per_thread_pool().release(s).unwrap();
        }

        control.mark_for_full_flush().unwrap();
        assert!(control.is_full_flush().unwrap());
        assert_eq!(control.num_queued_flushes().unwrap(), 2);
        let stats = control.stats().unwrap();
        assert_eq!(stats.num_pending, 2);
        assert_eq!(stats.num_flushing, 2);
        assert_eq!(stats.active_bytes, 0);
        assert_eq!(stats.flush_bytes, 30);

        let mut total = 0;
        while let Some(flushing) = control.next_pending_flush().unwrap() {
            total += flushing.bytes();
            control.do_after_flush(flushing).unwrap();
        }
        assert_eq!(total, 30);
        control.wait_for_flush().unwrap();
        control.finish_full_flush().unwrap();
        assert!(!control.is_full_flush().unwrap());
        assert_eq!(control.flush_bytes().unwrap(), 0);
        for s in control.all_active_thread_states().unwrap() {
            assert!(s.lock().unwrap().is_none());
        }
    }

    #[test]
    fn test_abort_full_flush() {
        let control = manual_control(2);
        let state = control.obtain_and_lock().unwrap();
        insert(&control, &state, 10);
        insert(&control, &state, 10);
        control.per_thread_pool().release(state).unwrap();

        control.mark_for_full_flush().unwrap();
        assert_eq!(control.abort_full_flushes().unwrap(), 2);
        assert!(!control.is_full_flush().unwrap());
        assert_eq!(control.stats().unwrap().flush_bytes, 0);
        control.wait_for_flush().unwrap();
    }

    #[test]
    fn test_stall_and_close() {
        let control = manual_control(4);
        let states: Vec<_> = (0..4).map(|_| control.obtain_and_lock().unwrap()).collect();
        for s in &states {
            insert(&control, s, 10);
        }
        let mut flushing = vec![];
        for s in &states[..3] {
            control.set_flush_pending(s).unwrap();
            flushing.push(insert(&control, s, 1).unwrap());
        }
        // 3 flushing vs one active state
        assert!(control.any_stalled_threads());
        assert!(control.stall_control().was_stalled().unwrap());

        control.do_after_flush(flushing.pop().unwrap()).unwrap();
        assert!(!control.any_stalled_threads());

        control.set_flush_pending(&states[3]).unwrap();
        // 3 pending or flushing, no active state
        assert!(control.any_stalled_threads());
        control.set_closed().unwrap();
        assert!(!control.any_stalled_threads());
        for f in flushing {
            control.do_after_flush(f).unwrap();
        }
        assert!(!control.any_stalled_threads());
    }

    #[test]
    fn test_random_accounting() {
        let control = manual_control(4);
        let mut rng = thread_rng();
        let states: Vec<_> = (0..4).map(|_| control.obtain_and_lock().unwrap()).collect();
        let mut in_flight = vec![];
        let mut peak = 0;

        for _ in 0..500 {
            let state = &states[rng.gen_range(0..states.len())];
            match rng.gen_range(0..10) {
                0 => {
                    if !state.flush_pending() && state.has_content() {
                        control.set_flush_pending(state).unwrap();
                    }
                }
                1 => {
                    if !in_flight.is_empty() {
                        let idx = rng.gen_range(0..in_flight.len());
                        control.do_after_flush(in_flight.swap_remove(idx)).unwrap();
                    }
                }
                _ => {
                    if let Some(f) = insert(&control, state, rng.gen_range(1..1000)) {
                        in_flight.push(f);
                    }
                }
            }
            let stats = control.stats().unwrap();
            assert!(stats.peak_active_bytes >= stats.active_bytes);
            assert!(stats.peak_active_bytes >= peak);
            peak = stats.peak_active_bytes;
            control.verify_accounting().unwrap();
        }

        for f in in_flight {
            control.do_after_flush(f).unwrap();
        }
        for s in states {
            control.per_thread_pool().release(s).unwrap();
        }
        while let Some(f) = control.next_pending_flush().unwrap() {
            control.do_after_flush(f).unwrap();
        }
        let stats = control.stats().unwrap();
        assert_eq!(stats.flush_bytes, 0);
        assert_eq!(stats.num_pending, 0);
        let buffered: u64 = control
            .all_active_thread_states()
            .unwrap()
            .iter()
            .map(|s| s.bytes_used())
            .sum();
        assert_eq!(stats.active_bytes, buffered);
    }
}
