//! Invalidation coalescing.
//!
//! Event storms (ten "comment liked" pushes in one second) must not cause ten
//! refetches. A `CoalescingWindow` collects staleness signals for a fixed short
//! window and then flushes every distinct key exactly once.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{CacheKey, CacheStore};

type FlushFn<K> = dyn Fn(Vec<K>) + Send + Sync;

/// Keys accumulated during the open window
struct PendingInvalidation<K> {
    /// Distinct keys in first-marked order
    keys: Vec<K>,
    seen: HashSet<K>,
    /// Identifier of the open window (0 = no window open)
    window_id: u64,
    timer: Option<JoinHandle<()>>,
}

struct WindowInner<K> {
    window: Duration,
    pending: Mutex<PendingInvalidation<K>>,
    flush: Box<FlushFn<K>>,
    next_window: AtomicU64,
    flushes: AtomicU64,
}

/// Generic coalescing window keyed by `K`.
///
/// Must be used from within a tokio runtime: the first `mark_stale` of a
/// window spawns its timer.
pub struct CoalescingWindow<K> {
    inner: Arc<WindowInner<K>>,
}

impl<K> Clone for CoalescingWindow<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> CoalescingWindow<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Create a window of length `window` that hands each batch to `flush`
    pub fn new<F>(window: Duration, flush: F) -> Self
    where
        F: Fn(Vec<K>) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(WindowInner {
                window,
                pending: Mutex::new(PendingInvalidation {
                    keys: Vec::new(),
                    seen: HashSet::new(),
                    window_id: 0,
                    timer: None,
                }),
                flush: Box::new(flush),
                next_window: AtomicU64::new(1),
                flushes: AtomicU64::new(0),
            }),
        }
    }

    /// Add `key` to the open window, opening one if none is running
    pub fn mark_stale(&self, key: K) {
        let mut pending = self.inner.pending.lock();

        if pending.seen.insert(key.clone()) {
            pending.keys.push(key);
        }

        if pending.timer.is_none() {
            let window_id = self.inner.next_window.fetch_add(1, Ordering::Relaxed);
            pending.window_id = window_id;

            let inner = self.inner.clone();
            pending.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(inner.window).await;
                Self::fire(&inner, Some(window_id));
            }));
        }
    }

    /// Flush the open window immediately
    pub fn flush_now(&self) {
        Self::fire(&self.inner, None);
    }

    /// Drop pending keys without flushing
    pub fn cancel(&self) {
        let mut pending = self.inner.pending.lock();
        if let Some(timer) = pending.timer.take() {
            timer.abort();
        }
        pending.keys.clear();
        pending.seen.clear();
        pending.window_id = 0;
    }

    /// Number of distinct keys waiting in the open window
    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().keys.len()
    }

    /// Number of non-empty batches flushed so far
    pub fn flush_count(&self) -> u64 {
        self.inner.flushes.load(Ordering::Relaxed)
    }

    fn fire(inner: &Arc<WindowInner<K>>, window_id: Option<u64>) {
        let batch = {
            let mut pending = inner.pending.lock();
            if let Some(id) = window_id {
                // Timer of a window that was already flushed or cancelled
                if pending.window_id != id {
                    return;
                }
            } else if let Some(timer) = pending.timer.as_ref() {
                timer.abort();
            }
            pending.timer = None;
            pending.window_id = 0;
            pending.seen.clear();
            std::mem::take(&mut pending.keys)
        };

        if batch.is_empty() {
            return;
        }
        inner.flushes.fetch_add(1, Ordering::Relaxed);
        (inner.flush)(batch);
    }
}

/// Coalescing window that refetches stale cache keys
#[derive(Clone)]
pub struct Invalidator {
    window: CoalescingWindow<CacheKey>,
}

impl Invalidator {
    pub fn new(store: Arc<CacheStore>, window: Duration) -> Self {
        let window = CoalescingWindow::new(window, move |keys: Vec<CacheKey>| {
            debug!("Flushing {} stale keys", keys.len());
            for key in keys {
                let store = store.clone();
                tokio::spawn(async move {
                    if let Err(e) = store.refetch(&key).await {
                        warn!("Refetch of {} failed: {}", key, e);
                    }
                });
            }
        });
        Self { window }
    }

    pub fn mark_stale(&self, key: CacheKey) {
        self.window.mark_stale(key);
    }

    pub fn mark_all_stale(&self, keys: impl IntoIterator<Item = CacheKey>) {
        for key in keys {
            self.window.mark_stale(key);
        }
    }

    pub fn flush_now(&self) {
        self.window.flush_now();
    }

    pub fn cancel(&self) {
        self.window.cancel();
    }

    pub fn pending_len(&self) -> usize {
        self.window.pending_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording_window(window: Duration) -> (CoalescingWindow<&'static str>, Arc<Mutex<Vec<Vec<&'static str>>>>) {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = batches.clone();
        let window = CoalescingWindow::new(window, move |keys| sink.lock().push(keys));
        (window, batches)
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_marks_flush_once() {
        let (window, batches) = recording_window(Duration::from_millis(300));

        for _ in 0..10 {
            window.mark_stale("comments");
        }
        assert_eq!(window.pending_len(), 1);

        tokio::time::sleep(Duration::from_millis(350)).await;

        assert_eq!(*batches.lock(), vec![vec!["comments"]]);
        assert_eq!(window.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_keys_flush_once_each() {
        let (window, batches) = recording_window(Duration::from_millis(300));

        window.mark_stale("k1");
        window.mark_stale("k2");
        window.mark_stale("k1");

        tokio::time::sleep(Duration::from_millis(350)).await;

        assert_eq!(*batches.lock(), vec![vec!["k1", "k2"]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_burst_opens_new_window() {
        let (window, batches) = recording_window(Duration::from_millis(300));

        window.mark_stale("k1");
        tokio::time::sleep(Duration::from_millis(350)).await;
        window.mark_stale("k1");
        tokio::time::sleep(Duration::from_millis(350)).await;

        assert_eq!(batches.lock().len(), 2);
        assert_eq!(window.flush_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_flushes_before_window_ends() {
        let (window, batches) = recording_window(Duration::from_millis(300));

        window.mark_stale("k1");
        tokio::time::sleep(Duration::from_millis(100)).await;
        window.mark_stale("k2");
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(batches.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*batches.lock(), vec![vec!["k1", "k2"]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_now_and_stale_timer() {
        let (window, batches) = recording_window(Duration::from_millis(300));

        window.mark_stale("k1");
        window.flush_now();
        assert_eq!(batches.lock().len(), 1);

        // The aborted timer must not flush again
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(batches.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drops_pending() {
        let (window, batches) = recording_window(Duration::from_millis(300));

        window.mark_stale("k1");
        window.cancel();
        tokio::time::sleep(Duration::from_millis(350)).await;

        assert!(batches.lock().is_empty());
        assert_eq!(window.pending_len(), 0);
    }
}
