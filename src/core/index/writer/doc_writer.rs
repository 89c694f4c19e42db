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
    DocumentsWriterFlushControl, FlushByRamOrCountsPolicy, FlushPolicy, FlushingBuffer,
    IndexWriterConfig, IndexingBuffer, ThreadState,
};
use error::{ErrorKind::AlreadyClosed, Result};

use crossbeam::queue::SegQueue;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Creates the buffer of a `ThreadState` the first time it is used after
/// creation or after a flush.
pub type BufferFactory<B> = Box<dyn Fn() -> B + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum UpdateKind {
    Insert,
    Update,
    Delete,
}

///
// This class accepts multiple added documents and buffers them in
// per-thread `IndexingBuffer`s.
//
// Threads:
//
// Multiple threads are allowed into add_document at once. Each thread
// obtains a ThreadState from the pool, mutates its buffer without any
// global synchronization and then reports the new buffer size to
// DocumentsWriterFlushControl, which decides with the FlushPolicy whether a
// buffer must be flushed.
//
// Flushing happens on the indexing threads: a thread that gets a buffer
// handed out flushes it after releasing its ThreadState and then helps out
// with any other pending flush. If flushing can not keep up with indexing,
// incoming threads are stalled in pre_update until the flushes catch up.
//
// Exceptions:
//
// An error returned while mutating a buffer is treated as aborting: the
// buffer and all documents added to it since the last flush are discarded.
// A failed flush is never retried, its documents are lost and the error is
// returned to the thread that performed the flush.
//
pub struct DocumentsWriter<B: IndexingBuffer> {
    closed: AtomicBool,
    num_docs_in_ram: AtomicU32,
    num_flushed_docs: AtomicU64,
    num_flushes: AtomicU64,
    flush_control: DocumentsWriterFlushControl<B>,
    buffer_factory: BufferFactory<B>,
    flushed_segments: SegQueue<B::Segment>,
    // flush_all_threads is a two stage operation, one at a time
    full_flush_lock: Mutex<()>,
}

impl<B: IndexingBuffer> DocumentsWriter<B> {
    pub fn new(config: IndexWriterConfig, buffer_factory: BufferFactory<B>) -> Result<Self> {
        let config = Arc::new(config);
        let flush_policy = Arc::new(FlushByRamOrCountsPolicy::new(Arc::clone(&config)));
        Self::create(config, flush_policy, buffer_factory)
    }

    pub fn with_flush_policy(
        config: IndexWriterConfig,
        flush_policy: Arc<dyn FlushPolicy<B>>,
        buffer_factory: BufferFactory<B>,
    ) -> Result<Self> {
        Self::create(Arc::new(config), flush_policy, buffer_factory)
    }

    fn create(
        config: Arc<IndexWriterConfig>,
        flush_policy: Arc<dyn FlushPolicy<B>>,
        buffer_factory: BufferFactory<B>,
    ) -> Result<Self> {
        config.validate()?;
        debug!("DW - new writer with {:?}", &config);
        Ok(DocumentsWriter {
            closed: AtomicBool::new(false),
            num_docs_in_ram: AtomicU32::new(0),
            num_flushed_docs: AtomicU64::new(0),
            num_flushes: AtomicU64::new(0),
            flush_control: DocumentsWriterFlushControl::new(config, flush_policy),
            buffer_factory,
            flushed_segments: SegQueue::new(),
            full_flush_lock: Mutex::new(()),
        })
    }

    pub fn flush_control(&self) -> &DocumentsWriterFlushControl<B> {
        &self.flush_control
    }

    pub fn config(&self) -> &IndexWriterConfig {
        self.flush_control.config()
    }

    /// Adds a document by applying `f` to a per-thread buffer. Returns true
    /// if this thread flushed any buffer while doing so.
    pub fn add_document<F>(&self, f: F) -> Result<bool>
    where
        F: FnOnce(&mut B) -> Result<()>,
    {
        self.update(UpdateKind::Insert, f)
    }

    /// Like `#add_document` for a document that also deletes the documents
    /// matching a term.
    pub fn update_document<F>(&self, f: F) -> Result<bool>
    where
        F: FnOnce(&mut B) -> Result<()>,
    {
        self.update(UpdateKind::Update, f)
    }

    /// Buffers delete terms by applying `f` to a per-thread buffer.
    pub fn delete_terms<F>(&self, f: F) -> Result<bool>
    where
        F: FnOnce(&mut B) -> Result<()>,
    {
        self.update(UpdateKind::Delete, f)
    }

    fn update<F>(&self, kind: UpdateKind, f: F) -> Result<bool>
    where
        F: FnOnce(&mut B) -> Result<()>,
    {
        let mut has_flushed = self.pre_update()?;

        let per_thread = self.flush_control.obtain_and_lock()?;
        let res = self.do_update(&per_thread, kind, f);
        let released = self.flush_control.per_thread_pool().release(per_thread);

        has_flushed |= self.finish_update(res, released)?;
        Ok(has_flushed)
    }

    // a checked out buffer must reach do_after_flush even if the release failed
    fn finish_update(
        &self,
        res: Result<Option<FlushingBuffer<B>>>,
        released: Result<()>,
    ) -> Result<bool> {
        let has_flushed = self.post_update(res?);
        released?;
        has_flushed
    }

    fn do_update<F>(
        &self,
        per_thread: &ThreadState<B>,
        kind: UpdateKind,
        f: F,
    ) -> Result<Option<FlushingBuffer<B>>>
    where
        F: FnOnce(&mut B) -> Result<()>,
    {
        let mut buffer = per_thread.lock()?;
        // This must happen after we've pulled the ThreadState because close
        // does not wait for ThreadStates in use
        self.ensure_open()?;

        let (docs_before, res, docs_after) = {
            let buffer_factory = &self.buffer_factory;
            let b = buffer.get_or_insert_with(|| buffer_factory());
            let docs_before = b.num_docs_in_ram();
            let res = f(b);
            (docs_before, res, b.num_docs_in_ram())
        };

        if let Err(e) = res {
            warn!(
                "DW - aborting thread state {} with {} docs: {:?}",
                per_thread.index(),
                docs_before,
                e
            );
            self.flush_control.do_on_abort(per_thread, &mut buffer)?;
            self.subtract_flushed_num_docs(docs_before);
            return Err(e);
        }
        debug_assert!(docs_after >= docs_before);
        self.num_docs_in_ram
            .fetch_add(docs_after - docs_before, Ordering::AcqRel);

        match kind {
            UpdateKind::Insert => self.flush_control.on_insert(per_thread, &mut buffer),
            UpdateKind::Update => self.flush_control.on_update(per_thread, &mut buffer),
            UpdateKind::Delete => self.flush_control.on_delete(per_thread, &mut buffer),
        }
    }

    fn pre_update(&self) -> Result<bool> {
        self.ensure_open()?;
        let mut has_flushed = false;
        if self.flush_control.any_stalled_threads() || self.flush_control.num_queued_flushes()? > 0
        {
            // Help out flushing any queued buffers so we block indexing threads less.
            debug!("DW - help out flushing before indexing");
            loop {
                while let Some(flushing) = self.flush_control.next_pending_flush()? {
                    has_flushed = true;
                    self.do_flush(flushing)?;
                }
                // block if stalled
                self.flush_control.wait_if_stalled()?;
                // still queued buffers try help flushing
                if self.flush_control.num_queued_flushes()? == 0 {
                    break;
                }
            }
        }
        Ok(has_flushed)
    }

    fn post_update(&self, flushing: Option<FlushingBuffer<B>>) -> Result<bool> {
        let flushing = match flushing {
            Some(f) => Some(f),
            None => self.flush_control.next_pending_flush()?,
        };
        match flushing {
            Some(f) => {
                self.do_flush(f)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            bail!(AlreadyClosed("this DocumentsWriter is closed".into()));
        }
        Ok(())
    }

    // flushes the given buffer and then any other pending one
    fn do_flush(&self, mut flushing: FlushingBuffer<B>) -> Result<()> {
        loop {
            let res = self.flush_buffer(&mut flushing);
            // release the accounting no matter if the flush failed
            self.flush_control.do_after_flush(flushing)?;
            res?;

            match self.flush_control.next_pending_flush()? {
                Some(next) => flushing = next,
                None => break,
            }
        }
        Ok(())
    }

    fn flush_buffer(&self, flushing: &mut FlushingBuffer<B>) -> Result<()> {
        let num_docs = flushing.num_docs();
        let res = flushing.flush();
        self.subtract_flushed_num_docs(num_docs);
        match res {
            Ok(segment) => {
                self.num_flushed_docs
                    .fetch_add(u64::from(num_docs), Ordering::AcqRel);
                self.num_flushes.fetch_add(1, Ordering::AcqRel);
                self.flushed_segments.push(segment);
                debug!(
                    "DW - flushed {}: num_docs={} bytes={}",
                    flushing.segment_name(),
                    num_docs,
                    flushing.bytes()
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    "DW - flush of {} failed, dropping {} docs: {:?}",
                    flushing.segment_name(),
                    num_docs,
                    e
                );
                Err(e)
            }
        }
    }

    fn subtract_flushed_num_docs(&self, num_flushed: u32) {
        debug_assert!(self.num_docs_in_ram.load(Ordering::Acquire) >= num_flushed);
        self.num_docs_in_ram
            .fetch_sub(num_flushed, Ordering::AcqRel);
    }

    /// Flushes every buffer holding documents or deletes. Returns true if
    /// anything was flushed.
    ///
    /// A failed flush aborts the remaining queued buffers of this full flush
    /// and returns the error.
    pub fn flush_all_threads(&self) -> Result<bool> {
        let _l = self.full_flush_lock.lock()?;
        debug!("DW - start full flush");

        self.flush_control.mark_for_full_flush()?;
        let res = self.help_flush_queued();
        match res {
            Ok(anything_flushed) => {
                // If a concurrent flush is still in flight wait for it
                self.flush_control.wait_for_flush()?;
                self.flush_control.finish_full_flush()?;
                debug!(
                    "DW - finish full flush, anything_flushed={}",
                    anything_flushed
                );
                Ok(anything_flushed)
            }
            Err(e) => {
                let aborted = self.flush_control.abort_full_flushes()?;
                self.subtract_flushed_num_docs(aborted);
                self.flush_control.wait_for_flush()?;
                warn!("DW - full flush failed, aborted {} docs", aborted);
                Err(e)
            }
        }
    }

    fn help_flush_queued(&self) -> Result<bool> {
        let mut anything_flushed = false;
        while let Some(flushing) = self.flush_control.next_pending_flush()? {
            anything_flushed = true;
            self.do_flush(flushing)?;
        }
        Ok(anything_flushed)
    }

    /// Discards all buffered documents and all buffers queued for flushing.
    /// Returns how many documents were aborted.
    pub fn abort(&self) -> Result<u32> {
        let _l = self.full_flush_lock.lock()?;
        debug!("DW - start to abort");

        let mut aborted_doc_count = 0;
        for per_thread in self.flush_control.all_active_thread_states()? {
            let mut buffer = per_thread.lock()?;
            if let Some(b) = buffer.as_ref() {
                aborted_doc_count += b.num_docs_in_ram();
            }
            self.flush_control.do_on_abort(&per_thread, &mut buffer)?;
        }
        aborted_doc_count += self.flush_control.abort_pending_flushes()?;
        self.subtract_flushed_num_docs(aborted_doc_count);
        self.flush_control.wait_for_flush()?;
        debug!("DW - done abort, aborted {} docs", aborted_doc_count);
        Ok(aborted_doc_count)
    }

    /// Rejects further updates and releases every stalled thread.
    pub fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.flush_control.set_closed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Documents added so far that were not aborted or lost in a failed
    /// flush, buffered or flushed.
    pub fn num_docs(&self) -> u64 {
        self.num_flushed_docs.load(Ordering::Acquire) + u64::from(self.num_docs_in_ram())
    }

    pub fn num_docs_in_ram(&self) -> u32 {
        self.num_docs_in_ram.load(Ordering::Acquire)
    }

    pub fn num_flushed_docs(&self) -> u64 {
        self.num_flushed_docs.load(Ordering::Acquire)
    }

    pub fn num_flushes(&self) -> u64 {
        self.num_flushes.load(Ordering::Acquire)
    }

    pub fn any_changes(&self) -> Result<bool> {
        Ok(self.num_docs_in_ram() > 0
            || self.flush_control.num_queued_flushes()? > 0
            || self.flush_control.flush_bytes()? > 0)
    }

    /// Drains the segments produced by successful flushes so far.
    pub fn take_flushed_segments(&self) -> Vec<B::Segment> {
        let mut segments = Vec::with_capacity(self.flushed_segments.len());
        while let Some(segment) = self.flushed_segments.pop() {
            segments.push(segment);
        }
        segments
    }
}

impl<B: IndexingBuffer> Drop for DocumentsWriter<B> {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
        if let Err(e) = self.flush_control.set_closed() {
            warn!("DW - close on drop failed: {:?}", e);
        }
    }
}
