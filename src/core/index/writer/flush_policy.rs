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

use core::index::writer::{IndexWriterConfig, IndexingBuffer, LockedFlushControl, ThreadState};

use std::sync::Arc;

/// `FlushPolicy` controls when segments are flushed from a RAM resident
/// internal data-structure to durable storage.
///
/// Segments are traditionally flushed by:
/// - RAM consumption - configured via `IndexWriterConfig#ram_buffer_size_mb`
/// - Number of RAM resident documents - configured via
///   `IndexWriterConfig#max_buffered_docs`
/// - Number of buffered delete terms - configured via
///   `IndexWriterConfig#max_buffered_delete_terms`
///
/// `DocumentsWriterFlushControl` consults the provided `FlushPolicy` to
/// control the flushing process. The policy is informed for each added or
/// updated document as well as for each delete term. Based on the information
/// provided via `ThreadState` and `LockedFlushControl`, the `FlushPolicy`
/// decides if a buffer needs flushing and marks it as flush-pending via
/// `LockedFlushControl#set_flush_pending`.
///
/// Implementations must not block and must not do any I/O, all methods are
/// called while the flush control lock is held.
pub trait FlushPolicy<B: IndexingBuffer>: Send + Sync {
    /// Called for each batch of delete terms buffered in the given
    /// `ThreadState`'s buffer, and after the document of an update.
    ///
    /// Note: This method is called synchronized on the given
    /// `DocumentsWriterFlushControl` and it is guaranteed that the calling
    /// thread holds the lock on the given `ThreadState`
    fn on_delete(&self, control: &mut LockedFlushControl<B>, state: &ThreadState<B>);

    /// Called for each document update on the given `ThreadState`'s buffer.
    ///
    /// Note: This method is called  synchronized on the given
    /// `DocumentsWriterFlushControl` and it is guaranteed that the calling
    /// thread holds the lock on the given `ThreadState`
    fn on_update(&self, control: &mut LockedFlushControl<B>, state: &ThreadState<B>) {
        self.on_insert(control, state);
        self.on_delete(control, state);
    }

    /// Called for each document addition on the given `ThreadState`s buffer.
    ///
    /// Note: This method is synchronized by the given
    /// `DocumentsWriterFlushControl` and it is guaranteed that the calling
    /// thread holds the lock on the given `ThreadState`
    fn on_insert(&self, control: &mut LockedFlushControl<B>, state: &ThreadState<B>);

    /// Returns the current most RAM consuming non-pending `ThreadState` with
    /// at least one buffered document.
    ///
    /// @Return: the largest non pending state
    ///          None: if the given state is the largest
    fn find_largest_non_pending_writer(
        &self,
        control: &LockedFlushControl<B>,
        per_thread_state: &ThreadState<B>,
    ) -> Option<Arc<ThreadState<B>>> {
        debug_assert!(!per_thread_state.flush_pending());
        let mut max_ram_so_far = per_thread_state.bytes_used();
        let states = match control.per_thread_pool().all_active() {
            Ok(states) => states,
            Err(e) => {
                warn!("FP - failed to list thread states: {:?}", e);
                return None;
            }
        };

        let mut count = 0;
        let mut largest = None;
        for next in states {
            if next.flush_pending() || next.num_docs_in_ram() == 0 {
                continue;
            }
            count += 1;
            let next_ram = next.bytes_used();
            if next_ram > max_ram_so_far {
                max_ram_so_far = next_ram;
                largest = Some(next);
            }
        }

        debug!("FP - {} in-use non-flushing threads states.", count);
        largest
    }
}

/// Default `FlushPolicy` implementation that flushes new segments based on
/// RAM used, document count and delete term count depending on the
/// `IndexWriterConfig`.
///
/// - `#on_delete` - flushes the `ThreadState`'s buffer once it holds
///   `max_buffered_delete_terms` delete terms, iff enabled.
/// - `#on_insert` - flushes either on the number of documents per buffer or
///   on the global active memory consumption in the current indexing session
///   iff `max_buffered_docs` or `ram_buffer_size_mb` is enabled respectively.
///   The document count trigger wins if both apply.
/// - `#on_update` - calls `#on_insert` and `#on_delete` in order.
///
/// If `ram_buffer_size_mb` is enabled, the largest ram consuming buffer in the
/// whole pool will be marked as pending iff the global active RAM
/// consumption is >= the configured max RAM buffer. That buffer is not
/// necessarily the one of the inserting thread.
pub struct FlushByRamOrCountsPolicy {
    index_write_config: Arc<IndexWriterConfig>,
}

impl FlushByRamOrCountsPolicy {
    pub fn new(index_write_config: Arc<IndexWriterConfig>) -> Self {
        FlushByRamOrCountsPolicy { index_write_config }
    }

    fn mark_largest_writer_pending<B: IndexingBuffer>(
        &self,
        control: &mut LockedFlushControl<B>,
        per_thread_state: &ThreadState<B>,
    ) {
        if let Some(largest) = self.find_largest_non_pending_writer(control, per_thread_state) {
            control.set_flush_pending(&largest);
        } else {
            control.set_flush_pending(per_thread_state);
        }
    }
}

impl<B: IndexingBuffer> FlushPolicy<B> for FlushByRamOrCountsPolicy {
    fn on_delete(&self, control: &mut LockedFlushControl<B>, state: &ThreadState<B>) {
        if !state.flush_pending()
            && self.index_write_config.flush_on_delete_terms()
            && state.num_delete_terms() >= self.index_write_config.max_buffered_delete_terms()
        {
            // flush this state by num del terms
            debug!(
                "FP - flush thread state {} by delete terms: {}",
                state.index(),
                state.num_delete_terms()
            );
            control.set_flush_pending(state);
        }
    }

    fn on_insert(&self, control: &mut LockedFlushControl<B>, state: &ThreadState<B>) {
        if state.flush_pending() {
            return;
        }
        if self.index_write_config.flush_on_doc_count()
            && state.num_docs_in_ram() >= self.index_write_config.max_buffered_docs()
        {
            // Flush this state by num docs
            control.set_flush_pending(state);
        } else if self.index_write_config.flush_on_ram() {
            let limit = self.index_write_config.ram_buffer_size();
            if control.active_bytes() >= limit {
                debug!(
                    "FP - trigger flush: active_bytes={}, flush_bytes={} vs limit={}",
                    control.active_bytes(),
                    control.flush_bytes(),
                    limit
                );
                self.mark_largest_writer_pending(control, state);
            }
        }
    }
}
