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

#[cfg(any(test, debug_assertions))]
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
#[cfg(any(test, debug_assertions))]
use std::thread::{self, ThreadId};

/// Controls the health status of a `DocumentsWriter` sessions. This class
/// used to block incoming indexing threads if flushing significantly slower than
/// indexing to ensure the `DocumentsWriter`s healthiness. If flushing is
/// significantly slower than indexing the net memory used within a
/// `DocumentsWriter` session can increase very quickly and easily exceed the
/// available memory.
///
/// To prevent that this class blocks incoming threads from indexing once
/// `stall_ratio` x number of active `ThreadState`s is exceeded by the
/// number of pending and flushing buffers. Once flushing catches up threads
/// are released and can continue indexing.
pub struct DocumentsWriterStallControl {
    lock: Mutex<StallState>,
    cond: Condvar,
    stalled: AtomicBool,
}

#[derive(Default)]
struct StallState {
    num_waiting: u32,
    was_stalled: bool,
    // only with assert
    #[cfg(any(test, debug_assertions))]
    waiting: HashSet<ThreadId>,
}

impl Default for DocumentsWriterStallControl {
    fn default() -> Self {
        DocumentsWriterStallControl {
            lock: Mutex::new(StallState::default()),
            cond: Condvar::new(),
            stalled: AtomicBool::new(false),
        }
    }
}

impl DocumentsWriterStallControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the stalled flag status and release all threads waiting on
    /// `#wait_if_stalled()` so they can re-check.
    pub fn update_stalled(&self, stalled: bool) -> Result<()> {
        let mut l = self.lock.lock()?;
        if self.stalled.swap(stalled, Ordering::SeqCst) != stalled {
            debug!("SC - stalled: {}", stalled);
        }
        if stalled {
            l.was_stalled = true;
        }
        self.cond.notify_all();
        Ok(())
    }

    /// Blocks if documents writing is currently in a stalled state.
    ///
    /// Waits at most for one wake up: callers re-enter this check before
    /// every document, so a thread that is released while the writer is
    /// still stalled simply stalls again on its next document.
    pub fn wait_if_stalled(&self) -> Result<()> {
        if self.stalled.load(Ordering::SeqCst) {
            let mut l = self.lock.lock()?;
            if self.stalled.load(Ordering::SeqCst) {
                // don't loop here, higher level logic will re-stall!
                self.inc_waiters(&mut l);
                let mut l = self.cond.wait(l)?;
                self.decr_waiters(&mut l);
            }
        }
        Ok(())
    }

    pub fn any_stalled_threads(&self) -> bool {
        self.stalled.load(Ordering::SeqCst)
    }

    fn inc_waiters(&self, state: &mut StallState) {
        state.num_waiting += 1;
        #[cfg(any(test, debug_assertions))]
        {
            let inserted = state.waiting.insert(thread::current().id());
            debug_assert!(inserted);
        }
    }

    fn decr_waiters(&self, state: &mut StallState) {
        debug_assert!(state.num_waiting > 0);
        #[cfg(any(test, debug_assertions))]
        {
            let removed = state.waiting.remove(&thread::current().id());
            debug_assert!(removed);
        }
        state.num_waiting -= 1;
    }

    pub fn has_blocked(&self) -> Result<bool> {
        Ok(self.lock.lock()?.num_waiting > 0)
    }

    pub fn num_waiting(&self) -> Result<u32> {
        Ok(self.lock.lock()?.num_waiting)
    }

    pub fn is_healthy(&self) -> bool {
        !self.stalled.load(Ordering::SeqCst)
    }

    #[cfg(any(test, debug_assertions))]
    pub fn is_thread_queued(&self, t: &ThreadId) -> Result<bool> {
        Ok(self.lock.lock()?.waiting.contains(t))
    }

    pub fn was_stalled(&self) -> Result<bool> {
        Ok(self.lock.lock()?.was_stalled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::mpsc;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn wait_until<F: Fn() -> bool>(f: F) {
        let start = Instant::now();
        while !f() {
            assert!(start.elapsed() < Duration::from_secs(10), "timed out");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_healthy_never_blocks() {
        let ctrl = DocumentsWriterStallControl::new();
        assert!(ctrl.is_healthy());
        ctrl.wait_if_stalled().unwrap();
        ctrl.update_stalled(false).unwrap();
        ctrl.wait_if_stalled().unwrap();
        assert!(!ctrl.has_blocked().unwrap());
        assert!(!ctrl.was_stalled().unwrap());
    }

    #[test]
    fn test_stalled_threads_are_released() {
        let ctrl = Arc::new(DocumentsWriterStallControl::new());
        ctrl.update_stalled(true).unwrap();
        assert!(ctrl.any_stalled_threads());
        assert!(ctrl.was_stalled().unwrap());

        let (tx, rx) = mpsc::channel();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ctrl = Arc::clone(&ctrl);
                let tx = tx.clone();
                thread::spawn(move || {
                    tx.send(thread::current().id()).unwrap();
                    ctrl.wait_if_stalled().unwrap();
                })
            })
            .collect();
        let ids: Vec<ThreadId> = (0..4).map(|_| rx.recv().unwrap()).collect();

        wait_until(|| ctrl.num_waiting().unwrap() == 4);
        assert!(ctrl.has_blocked().unwrap());
        for id in &ids {
            assert!(ctrl.is_thread_queued(id).unwrap());
        }

        ctrl.update_stalled(false).unwrap();
        for h in handles {
            h.join().unwrap();
        }
        assert!(!ctrl.has_blocked().unwrap());
        assert!(ctrl.is_healthy());
        // the flag only records history
        assert!(ctrl.was_stalled().unwrap());
        for id in &ids {
            assert!(!ctrl.is_thread_queued(id).unwrap());
        }
    }

    #[test]
    fn test_wait_only_once() {
        let ctrl = Arc::new(DocumentsWriterStallControl::new());
        ctrl.update_stalled(true).unwrap();

        let waiter = {
            let ctrl = Arc::clone(&ctrl);
            thread::spawn(move || ctrl.wait_if_stalled().unwrap())
        };
        wait_until(|| ctrl.has_blocked().unwrap());

        // still stalled, but each update wakes every waiter for a re-check
        ctrl.update_stalled(true).unwrap();
        waiter.join().unwrap();
        assert!(ctrl.any_stalled_threads());
        assert!(!ctrl.has_blocked().unwrap());
    }
}
