//! Addressable store of query results.
//!
//! The store exclusively owns every cached entry. All writes are whole-entry
//! rewrites performed under one write guard (read, transform, write), so a
//! reader never observes a half-applied transform, and multi-key writes land
//! together.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::{CacheEntry, CacheKey, PagedList};
use crate::source::{DataSource, FetchResult};

/// Pre-write values of the keys a multi-key write rewrote
pub type Snapshot = HashMap<CacheKey, CacheEntry>;

/// Capacity of the change notification channel
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// What a refetch did to the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefetchOutcome {
    /// The entry was replaced with fresh server state
    Replaced,
    /// A newer refetch of the same key started first; this result was dropped
    Superseded,
    /// Nothing is cached under the key, so there was nothing to refresh
    Skipped,
}

/// The cache store
pub struct CacheStore {
    /// Cached entries
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    /// Server data layer
    source: Arc<dyn DataSource>,
    /// Latest refetch ticket per key
    in_flight: DashMap<CacheKey, u64>,
    /// Ticket counter for refetches
    next_ticket: AtomicU64,
    /// Number of requests issued to the data source
    fetches: AtomicU64,
    /// Change notifications (key written or removed)
    changes: broadcast::Sender<CacheKey>,
}

impl CacheStore {
    /// Create an empty store backed by `source`
    pub fn new(source: Arc<dyn DataSource>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            entries: RwLock::new(HashMap::new()),
            source,
            in_flight: DashMap::new(),
            next_ticket: AtomicU64::new(1),
            fetches: AtomicU64::new(0),
            changes,
        }
    }

    /// Subscribe to change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<CacheKey> {
        self.changes.subscribe()
    }

    fn notify(&self, key: &CacheKey) {
        let _ = self.changes.send(key.clone());
    }

    /// Current value at `key`
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries.read().get(key).cloned()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Scalar value at `key`, if it holds one
    pub fn scalar(&self, key: &CacheKey) -> Option<i64> {
        self.entries.read().get(key).and_then(CacheEntry::as_scalar)
    }

    /// Paged value at `key`, if it holds one
    pub fn paged(&self, key: &CacheKey) -> Option<PagedList> {
        self.entries.read().get(key).and_then(|e| e.as_paged().cloned())
    }

    /// All cached keys
    pub fn keys(&self) -> Vec<CacheKey> {
        self.entries.read().keys().cloned().collect()
    }

    /// Keys holding paginated lists
    pub fn paged_keys(&self) -> Vec<CacheKey> {
        self.entries
            .read()
            .iter()
            .filter(|(_, entry)| entry.is_paged())
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Overwrite the entry at `key`
    pub fn set(&self, key: CacheKey, entry: CacheEntry) {
        self.entries.write().insert(key.clone(), entry);
        self.notify(&key);
    }

    /// Remove the entry at `key`
    pub fn remove(&self, key: &CacheKey) -> Option<CacheEntry> {
        let removed = self.entries.write().remove(key);
        if removed.is_some() {
            self.notify(key);
        }
        removed
    }

    /// Drop every entry
    pub fn clear(&self) {
        let keys: Vec<CacheKey> = {
            let mut entries = self.entries.write();
            let keys = entries.keys().cloned().collect();
            entries.clear();
            keys
        };
        for key in &keys {
            self.notify(key);
        }
    }

    /// Read-transform-write of one key. Absent keys are left absent.
    ///
    /// Returns `true` if an entry was rewritten.
    pub fn update<F>(&self, key: &CacheKey, transform: F) -> bool
    where
        F: FnOnce(&CacheEntry) -> CacheEntry,
    {
        let written = {
            let mut entries = self.entries.write();
            match entries.get(key) {
                Some(current) => {
                    let next = transform(current);
                    entries.insert(key.clone(), next);
                    true
                }
                None => false,
            }
        };
        if written {
            self.notify(key);
        }
        written
    }

    /// Read-transform-write of several keys under a single write guard.
    ///
    /// Absent keys are skipped. Returns the pre-transform value of every key
    /// that was rewritten.
    pub fn update_many<F>(&self, keys: &[CacheKey], mut transform: F) -> Snapshot
    where
        F: FnMut(&CacheKey, &CacheEntry) -> CacheEntry,
    {
        let mut snapshot = Snapshot::with_capacity(keys.len());
        {
            let mut entries = self.entries.write();
            for key in keys {
                if snapshot.contains_key(key) {
                    continue;
                }
                if let Some(current) = entries.get(key).cloned() {
                    let next = transform(key, &current);
                    entries.insert(key.clone(), next);
                    snapshot.insert(key.clone(), current);
                }
            }
        }
        for key in snapshot.keys() {
            self.notify(key);
        }
        snapshot
    }

    /// Restore every key in `snapshot` to its recorded value, all at once
    pub fn restore(&self, snapshot: &Snapshot) {
        {
            let mut entries = self.entries.write();
            for (key, previous) in snapshot {
                entries.insert(key.clone(), previous.clone());
            }
        }
        for key in snapshot.keys() {
            self.notify(key);
        }
    }

    /// Fetch the first page of a paginated resource and cache it
    pub async fn load_paged(&self, key: &CacheKey) -> FetchResult<()> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let page = self.source.fetch_page(key, None).await?;
        self.set(key.clone(), PagedList::from_pages(vec![page]).dedupe().into());
        Ok(())
    }

    /// Fetch a scalar resource and cache it
    pub async fn load_scalar(&self, key: &CacheKey) -> FetchResult<()> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let value = self.source.fetch_scalar(key).await?;
        self.set(key.clone(), CacheEntry::Scalar(value));
        Ok(())
    }

    /// Append the next page of a paginated entry.
    ///
    /// Returns `false` when the entry is absent or has no further pages.
    pub async fn fetch_next_page(&self, key: &CacheKey) -> FetchResult<bool> {
        let cursor = match self.paged(key) {
            Some(list) => match list.last_cursor() {
                Some(cursor) => cursor.to_string(),
                None => return Ok(false),
            },
            None => return Ok(false),
        };

        self.fetches.fetch_add(1, Ordering::Relaxed);
        let page = self.source.fetch_page(key, Some(&cursor)).await?;

        let appended = self.update(key, move |entry| match entry {
            CacheEntry::Paged(list) => {
                let mut list = list.clone();
                list.pages.push(page);
                CacheEntry::Paged(list.dedupe())
            }
            other => other.clone(),
        });
        Ok(appended)
    }

    /// Re-fetch `key` from the data source and replace the cached entry.
    ///
    /// Paginated entries re-fetch as many pages as are currently loaded. If a
    /// newer refetch of the same key starts before this one finishes, this
    /// result is discarded.
    pub async fn refetch(&self, key: &CacheKey) -> FetchResult<RefetchOutcome> {
        let current = match self.get(key) {
            Some(entry) => entry,
            None => return Ok(RefetchOutcome::Skipped),
        };

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        self.in_flight.insert(key.clone(), ticket);

        let fetched = self.fetch_like(key, &current).await;

        let latest = self
            .in_flight
            .remove_if(key, |_, latest| *latest == ticket)
            .is_some();

        let fresh = fetched?;
        if !latest {
            debug!("Dropping superseded refetch of {}", key);
            return Ok(RefetchOutcome::Superseded);
        }

        self.set(key.clone(), fresh);
        info!("Refetched {}", key);
        Ok(RefetchOutcome::Replaced)
    }

    async fn fetch_like(&self, key: &CacheKey, current: &CacheEntry) -> FetchResult<CacheEntry> {
        match current {
            CacheEntry::Scalar(_) => {
                self.fetches.fetch_add(1, Ordering::Relaxed);
                Ok(CacheEntry::Scalar(self.source.fetch_scalar(key).await?))
            }
            CacheEntry::Paged(list) => {
                let wanted = list.pages.len().max(1);
                let mut pages = Vec::with_capacity(wanted);
                let mut cursor: Option<String> = None;

                for i in 0..wanted {
                    if i > 0 && cursor.is_none() {
                        break;
                    }
                    self.fetches.fetch_add(1, Ordering::Relaxed);
                    let page = self.source.fetch_page(key, cursor.as_deref()).await?;
                    cursor = page.next_cursor.clone();
                    pages.push(page);
                }

                Ok(PagedList::from_pages(pages).dedupe().into())
            }
        }
    }

    /// Number of page and scalar requests issued to the data source so far
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }
}
