//! FIFO buffer between the push transport and the cache handlers.
//!
//! Events are buffered while the cache layer is not ready (connection being
//! established or re-established) and drained strictly in arrival order once it
//! is. A failing handler is logged and skipped; it never blocks the events
//! behind it.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

use super::{EventHandler, InboundEvent};

struct QueuedEvent {
    event: InboundEvent,
    handler: Arc<dyn EventHandler>,
}

/// Queue statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub processed: u64,
    pub failed: u64,
    pub discarded: u64,
}

/// The event queue
pub struct EventQueue {
    buffer: Mutex<VecDeque<QueuedEvent>>,
    /// Set while the transport is connected
    ready: AtomicBool,
    /// Set while a drain pass is running
    draining: AtomicBool,
    processed: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            buffer: Mutex::new(VecDeque::new()),
            ready: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    /// Append `event` to the tail; drains immediately when ready
    pub fn enqueue(&self, event: InboundEvent, handler: Arc<dyn EventHandler>) {
        debug!("Queued {} (#{})", event.name(), event.arrival_sequence);
        self.buffer.lock().push_back(QueuedEvent { event, handler });

        if self.is_ready() {
            self.drain();
        }
    }

    /// Process every queued event in enqueue order.
    ///
    /// Returns the number of events handled by this call. A call made while
    /// another drain pass is running returns 0; the running pass picks up
    /// anything enqueued in the meantime.
    pub fn drain(&self) -> usize {
        let mut handled = 0;

        loop {
            if self
                .draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return handled;
            }

            loop {
                let next = self.buffer.lock().pop_front();
                let Some(queued) = next else { break };
                self.dispatch(queued);
                handled += 1;
            }

            self.draining.store(false, Ordering::Release);

            // Something may have been enqueued between the last pop and
            // releasing the flag
            if self.buffer.lock().is_empty() {
                return handled;
            }
        }
    }

    fn dispatch(&self, queued: QueuedEvent) {
        let QueuedEvent { event, handler } = queued;
        let result = catch_unwind(AssertUnwindSafe(|| handler.handle(&event)));

        match result {
            Ok(Ok(())) => {
                self.processed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                error!("Handler for {} (#{}) failed: {}", event.name(), event.arrival_sequence, e);
            }
            Err(_) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                error!("Handler for {} (#{}) panicked", event.name(), event.arrival_sequence);
            }
        }
    }

    /// Mark the cache layer ready (connected) or not
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Discard every queued event; returns how many were dropped
    pub fn clear(&self) -> usize {
        let dropped = {
            let mut buffer = self.buffer.lock();
            let n = buffer.len();
            buffer.clear();
            n
        };
        if dropped > 0 {
            debug!("Discarded {} queued events", dropped);
        }
        self.discarded.fetch_add(dropped as u64, Ordering::Relaxed);
        dropped
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pending: self.len(),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}
