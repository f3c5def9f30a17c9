//! Optimistic mutations with snapshot rollback.
//!
//! A mutation writes its expected result into the cache before the confirming
//! server call settles. The pre-mutation values of every touched key are kept
//! in a `MutationContext`; on failure they are restored all at once, on success
//! the context is discarded and the keys are optionally refetched so
//! server-assigned fields replace local placeholders.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};

use super::coalescer::Invalidator;
use super::store::Snapshot;
use super::{CacheEntry, CacheKey, CacheStore};

/// Errors surfaced to the caller of an optimistic mutation
#[derive(Debug, Error)]
pub enum MutationError<E> {
    /// The confirming call failed; the cache was rolled back
    #[error("Mutation rejected: {0}")]
    Rejected(E),
}

impl<E> MutationError<E> {
    pub fn into_inner(self) -> E {
        match self {
            MutationError::Rejected(e) => e,
        }
    }
}

/// Rollback record of one optimistic mutation
#[derive(Debug)]
pub struct MutationContext {
    previous_snapshot: Snapshot,
    affected_keys: BTreeSet<CacheKey>,
    started_at: Instant,
}

impl MutationContext {
    pub fn affected_keys(&self) -> &BTreeSet<CacheKey> {
        &self.affected_keys
    }

    /// Value of `key` before the mutation (`None` if the mutation did not write it)
    pub fn previous(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.previous_snapshot.get(key)
    }
}

/// Applies, confirms and rolls back optimistic mutations
#[derive(Clone)]
pub struct OptimisticEngine {
    store: Arc<CacheStore>,
    invalidator: Invalidator,
}

impl OptimisticEngine {
    pub fn new(store: Arc<CacheStore>, invalidator: Invalidator) -> Self {
        Self { store, invalidator }
    }

    /// Transform every key in one atomic write and remember the previous values.
    ///
    /// Keys with no cached entry are left untouched and are not affected keys.
    pub fn apply_optimistic<F>(&self, keys: &[CacheKey], transform: F) -> MutationContext
    where
        F: FnMut(&CacheKey, &CacheEntry) -> CacheEntry,
    {
        let previous_snapshot = self.store.update_many(keys, transform);
        let affected_keys = previous_snapshot.keys().cloned().collect();
        debug!("Applied optimistic mutation to {:?}", affected_keys);

        MutationContext {
            previous_snapshot,
            affected_keys,
            started_at: Instant::now(),
        }
    }

    /// Discard the context after the server confirmed the mutation
    pub fn settle_success(&self, ctx: MutationContext, invalidate: bool) {
        debug!(
            "Mutation confirmed after {:?}",
            ctx.started_at.elapsed()
        );
        if invalidate {
            self.invalidator.mark_all_stale(ctx.affected_keys);
        }
    }

    /// Restore every affected key to its pre-mutation value
    pub fn settle_failure(&self, ctx: MutationContext) {
        warn!(
            "Mutation rejected, rolling back {} keys",
            ctx.affected_keys.len()
        );
        self.store.restore(&ctx.previous_snapshot);
    }

    /// Run the full optimistic protocol around `call`.
    ///
    /// The cache is written before `call` is awaited. On `Err` the cache is
    /// rolled back and the error is returned to the caller.
    pub async fn mutate<F, Fut, T, E>(
        &self,
        keys: &[CacheKey],
        transform: F,
        call: Fut,
        invalidate_on_success: bool,
    ) -> Result<T, MutationError<E>>
    where
        F: FnMut(&CacheKey, &CacheEntry) -> CacheEntry,
        Fut: Future<Output = Result<T, E>>,
    {
        let ctx = self.apply_optimistic(keys, transform);
        match call.await {
            Ok(value) => {
                self.settle_success(ctx, invalidate_on_success);
                Ok(value)
            }
            Err(e) => {
                self.settle_failure(ctx);
                Err(MutationError::Rejected(e))
            }
        }
    }
}

/// Pure cache transforms used by optimistic mutations and event handlers.
///
/// Every transform is total: applied to a scalar where a list is expected, or
/// targeting an id that is not there, it returns the entry unchanged.
pub mod transforms {
    use serde_json::{Map, Value};
    use std::sync::Arc;

    use crate::cache::tree;
    use crate::cache::{CacheEntry, Item, ItemId, Page, PagedList};

    /// Prefix of locally minted identities
    pub const TEMP_ID_PREFIX: &str = "temp-";

    /// Fresh temporary identity for an optimistic insert
    pub fn temp_id() -> ItemId {
        ItemId::new(format!("{}{}", TEMP_ID_PREFIX, uuid::Uuid::new_v4()))
    }

    /// Apply `op` to the first page where it reports a change
    fn rewrite_pages<F>(list: &PagedList, mut op: F) -> Option<PagedList>
    where
        F: FnMut(&[Arc<Item>]) -> Option<Vec<Arc<Item>>>,
    {
        for (idx, page) in list.pages.iter().enumerate() {
            if let Some(items) = op(&page.items) {
                let mut next = list.clone();
                next.pages[idx].items = items;
                return Some(next);
            }
        }
        None
    }

    fn map_paged<F>(entry: &CacheEntry, f: F) -> CacheEntry
    where
        F: FnOnce(&PagedList) -> Option<PagedList>,
    {
        match entry {
            CacheEntry::Paged(list) => match f(list) {
                Some(next) => CacheEntry::Paged(next),
                None => entry.clone(),
            },
            CacheEntry::Scalar(_) => entry.clone(),
        }
    }

    /// Prepend `item` to the first page, removing any older copy of the same id
    pub fn insert_at_head(entry: &CacheEntry, item: Arc<Item>) -> CacheEntry {
        map_paged(entry, |list| {
            let mut next = list.clone();
            for page in &mut next.pages {
                page.items.retain(|existing| existing.id != item.id);
            }
            match next.pages.first_mut() {
                Some(first) => first.items.insert(0, item),
                None => next.pages.push(Page {
                    items: vec![item],
                    next_cursor: None,
                }),
            }
            Some(next)
        })
    }

    /// Insert `reply` under `parent_id` wherever the parent lives
    pub fn insert_reply(entry: &CacheEntry, parent_id: &ItemId, reply: Arc<Item>) -> CacheEntry {
        map_paged(entry, |list| {
            if list.contains(&reply.id) {
                return None;
            }
            rewrite_pages(list, |items| tree::try_insert_child(items, parent_id, reply.clone()))
        })
    }

    /// Merge `fields` into the item with `id`
    pub fn patch_item(entry: &CacheEntry, id: &ItemId, fields: &Map<String, Value>) -> CacheEntry {
        map_paged(entry, |list| {
            rewrite_pages(list, |items| tree::try_replace(items, id, |node| node.merged(fields)))
        })
    }

    /// Remove the item with `id` (and its replies)
    pub fn remove_item(entry: &CacheEntry, id: &ItemId) -> CacheEntry {
        map_paged(entry, |list| rewrite_pages(list, |items| tree::try_remove(items, id)))
    }

    /// Flip `flag` on the item with `id` and move `counter` by one in the same
    /// direction, never below zero.
    pub fn toggle_flag_with_counter(entry: &CacheEntry, id: &ItemId, flag: &str, counter: &str) -> CacheEntry {
        map_paged(entry, |list| {
            rewrite_pages(list, |items| {
                tree::try_replace(items, id, |node| {
                    let on = !node.flag(flag);
                    let count = node.counter(counter);
                    let count = if on { count + 1 } else { (count - 1).max(0) };

                    let mut next = node.clone();
                    next.set_field(flag, on);
                    next.set_field(counter, count);
                    next
                })
            })
        })
    }

    /// Set `flag` to `value` on every top-level item
    pub fn set_flag_all(entry: &CacheEntry, flag: &str, value: bool) -> CacheEntry {
        map_paged(entry, |list| {
            let mut next = list.clone();
            for page in &mut next.pages {
                for item in &mut page.items {
                    if item.flag(flag) != value {
                        let mut updated = item.as_ref().clone();
                        updated.set_field(flag, value);
                        *item = Arc::new(updated);
                    }
                }
            }
            Some(next)
        })
    }

    /// Add `delta` to a scalar counter, clamped at zero
    pub fn adjust_counter(entry: &CacheEntry, delta: i64) -> CacheEntry {
        match entry {
            CacheEntry::Scalar(value) => CacheEntry::Scalar((value + delta).max(0)),
            other => other.clone(),
        }
    }
}
