//! Applies inbound events to the cache.
//!
//! Each resource is described by a `ResourceSpec`: which cache key holds its
//! list, which scalar counts its unresolved items, and whether patches are
//! applied in place or turned into a coalesced refetch.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use serde_json::Value;
use tracing::debug;

use super::{EventHandler, EventKind, HandlerError, InboundEvent, Resource};
use crate::cache::optimistic::transforms;
use crate::cache::{CacheEntry, CacheKey, CacheStore, Invalidator, Item, ItemId};

/// How `resource:patch` events are reconciled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchPolicy {
    /// Locate the item and merge the new fields into it
    ApplyInPlace,
    /// Mark the collection stale and let the coalescer refetch it
    Invalidate,
}

/// Cache layout of one pushed resource
#[derive(Debug, Clone)]
pub struct ResourceSpec {
    pub resource: Resource,
    /// Cache resource name of the list
    pub list_resource: String,
    /// Payload fields that become list key parameters
    pub key_params: Vec<String>,
    /// Scalar counting unresolved items
    pub counter: Option<CacheKey>,
    /// Boolean field marking an item resolved (e.g. `isRead`)
    pub resolved_flag: Option<String>,
    pub patch_policy: PatchPolicy,
    /// Whether new items with a parent are attached as replies
    pub nested: bool,
}

impl ResourceSpec {
    /// Notifications: flat list plus unread counter
    pub fn notifications() -> Self {
        Self {
            resource: Resource::Notification,
            list_resource: "notifications".to_string(),
            key_params: Vec::new(),
            counter: Some(CacheKey::new("notifications/unread-count")),
            resolved_flag: Some("isRead".to_string()),
            patch_policy: PatchPolicy::ApplyInPlace,
            nested: false,
        }
    }

    /// Friendships: status transitions move items between views, so patches
    /// refetch rather than patch in place
    pub fn friendships() -> Self {
        Self {
            resource: Resource::Friendship,
            list_resource: "friends".to_string(),
            key_params: Vec::new(),
            counter: Some(CacheKey::new("friends/pending-count")),
            resolved_flag: None,
            patch_policy: PatchPolicy::Invalidate,
            nested: false,
        }
    }

    /// Comments: one reply tree per movie
    pub fn comments() -> Self {
        Self {
            resource: Resource::Comment,
            list_resource: "comments".to_string(),
            key_params: vec!["movieId".to_string()],
            counter: None,
            resolved_flag: None,
            patch_policy: PatchPolicy::ApplyInPlace,
            nested: true,
        }
    }

    /// Exact list key for `scope`, or an error naming the first missing parameter
    pub fn list_key(&self, scope: &BTreeMap<String, String>, event: &str) -> Result<CacheKey, HandlerError> {
        let mut key = CacheKey::new(self.list_resource.clone());
        for param in &self.key_params {
            let value = scope.get(param).ok_or_else(|| HandlerError::MissingScope {
                event: event.to_string(),
                param: param.clone(),
            })?;
            key = key.with_param(param.clone(), value.clone());
        }
        Ok(key)
    }

    /// Whether `key` is one of this resource's lists and agrees with `scope`
    fn matches(&self, key: &CacheKey, scope: &BTreeMap<String, String>) -> bool {
        key.resource == self.list_resource
            && self
                .key_params
                .iter()
                .all(|param| match scope.get(param) {
                    Some(value) => key.param(param) == Some(value.as_str()),
                    None => true,
                })
    }

    fn is_unresolved(&self, item: &Item) -> bool {
        self.resolved_flag
            .as_deref()
            .map(|flag| !item.flag(flag))
            .unwrap_or(false)
    }
}

/// Event handler that reconciles push events into the cache store
pub struct CacheEventHandler {
    store: Arc<CacheStore>,
    invalidator: Invalidator,
    specs: HashMap<Resource, ResourceSpec>,
    applied: AtomicU64,
}

impl CacheEventHandler {
    /// Handler for notifications, friendships and comments
    pub fn new(store: Arc<CacheStore>, invalidator: Invalidator) -> Self {
        Self::with_specs(
            store,
            invalidator,
            vec![
                ResourceSpec::notifications(),
                ResourceSpec::friendships(),
                ResourceSpec::comments(),
            ],
        )
    }

    pub fn with_specs(store: Arc<CacheStore>, invalidator: Invalidator, specs: Vec<ResourceSpec>) -> Self {
        Self {
            store,
            invalidator,
            specs: specs.into_iter().map(|spec| (spec.resource, spec)).collect(),
            applied: AtomicU64::new(0),
        }
    }

    pub fn spec(&self, resource: Resource) -> Option<&ResourceSpec> {
        self.specs.get(&resource)
    }

    /// Number of events handled successfully
    pub fn applied_count(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    /// Cached lists an event without a full scope may refer to
    fn target_keys(&self, spec: &ResourceSpec, scope: &BTreeMap<String, String>) -> Vec<CacheKey> {
        self.store
            .paged_keys()
            .into_iter()
            .filter(|key| spec.matches(key, scope))
            .collect()
    }

    /// Keys to write in one step: the lists, then the counter if there is one
    fn with_counter(spec: &ResourceSpec, lists: Vec<CacheKey>) -> Vec<CacheKey> {
        let mut keys = lists;
        keys.extend(spec.counter.clone());
        keys
    }

    fn on_new(&self, spec: &ResourceSpec, event: &InboundEvent, item: &Item) -> Result<(), HandlerError> {
        let mut scope = event.scope.clone();
        for param in &spec.key_params {
            if scope.contains_key(param) {
                continue;
            }
            match item.field(param) {
                Some(Value::String(s)) => {
                    scope.insert(param.clone(), s.clone());
                }
                Some(Value::Number(n)) => {
                    scope.insert(param.clone(), n.to_string());
                }
                _ => {}
            }
        }
        let list = spec.list_key(&scope, &event.name())?;

        let item = Arc::new(item.clone());
        let parent = if spec.nested { item.parent_id() } else { None };
        let counts = spec.is_unresolved(&item);
        // Stays true when the list is not cached: the counter is still bumped
        let mut inserted = true;

        self.store.update_many(&Self::with_counter(spec, vec![list.clone()]), |key, entry| {
            if key == &list {
                let already_cached = entry.as_paged().map(|l| l.contains(&item.id)).unwrap_or(true);
                inserted = !already_cached;
                match &parent {
                    Some(parent_id) => transforms::insert_reply(entry, parent_id, item.clone()),
                    None => transforms::insert_at_head(entry, item.clone()),
                }
            } else if inserted && counts {
                transforms::adjust_counter(entry, 1)
            } else {
                entry.clone()
            }
        });

        debug!("Applied {} {} to {}", event.name(), item.id, list);
        Ok(())
    }

    fn on_patch(
        &self,
        spec: &ResourceSpec,
        event: &InboundEvent,
        id: &ItemId,
        fields: &serde_json::Map<String, Value>,
    ) -> Result<(), HandlerError> {
        let targets = self.target_keys(spec, &event.scope);

        if spec.patch_policy == PatchPolicy::Invalidate {
            match spec.list_key(&event.scope, &event.name()) {
                Ok(key) => self.invalidator.mark_stale(key),
                Err(_) => self.invalidator.mark_all_stale(targets),
            }
            return Ok(());
        }

        let new_flag = spec
            .resolved_flag
            .as_deref()
            .and_then(|flag| fields.get(flag).and_then(Value::as_bool).map(|v| (flag, v)));

        // One write for every list plus the counter, which comes last
        let counter = spec.counter.as_ref();
        let mut delta = 0;
        self.store.update_many(&Self::with_counter(spec, targets), |key, entry| {
            if Some(key) == counter {
                return transforms::adjust_counter(entry, delta);
            }
            if let (Some((flag, resolved)), Some(prior)) = (new_flag, entry.as_paged().and_then(|l| l.find(id))) {
                if prior.flag(flag) != resolved {
                    delta = if resolved { -1 } else { 1 };
                }
            }
            transforms::patch_item(entry, id, fields)
        });
        Ok(())
    }

    fn on_delete(&self, spec: &ResourceSpec, event: &InboundEvent, id: &ItemId) -> Result<(), HandlerError> {
        let targets = self.target_keys(spec, &event.scope);
        let counter = spec.counter.as_ref();
        let mut removed_unresolved = false;
        self.store.update_many(&Self::with_counter(spec, targets), |key, entry| {
            if Some(key) == counter {
                let delta = if removed_unresolved { -1 } else { 0 };
                return transforms::adjust_counter(entry, delta);
            }
            let unresolved = entry
                .as_paged()
                .and_then(|l| l.find(id))
                .map(|prior| spec.is_unresolved(prior))
                .unwrap_or(false);
            removed_unresolved |= unresolved;
            transforms::remove_item(entry, id)
        });
        Ok(())
    }

    fn on_counter(&self, spec: &ResourceSpec, value: i64) -> Result<(), HandlerError> {
        let counter = spec.counter.clone().ok_or_else(|| {
            HandlerError::InvalidPayload(format!("{} has no counter", spec.resource))
        })?;
        self.store.set(counter, CacheEntry::Scalar(value.max(0)));
        Ok(())
    }

    fn on_bulk_cleared(&self, spec: &ResourceSpec, event: &InboundEvent) -> Result<(), HandlerError> {
        let targets = self.target_keys(spec, &event.scope);

        match spec.resolved_flag.as_deref() {
            Some(flag) => {
                let mut keys = targets;
                keys.extend(spec.counter.clone());
                self.store.update_many(&keys, |key, entry| match entry {
                    CacheEntry::Scalar(_) if Some(key) == spec.counter.as_ref() => CacheEntry::Scalar(0),
                    _ => transforms::set_flag_all(entry, flag, true),
                });
            }
            None => {
                if let Some(counter) = &spec.counter {
                    self.store.update(counter, |_| CacheEntry::Scalar(0));
                }
                self.invalidator.mark_all_stale(targets);
            }
        }
        Ok(())
    }
}

impl EventHandler for CacheEventHandler {
    fn handle(&self, event: &InboundEvent) -> Result<(), HandlerError> {
        let spec = self
            .specs
            .get(&event.resource)
            .ok_or(HandlerError::Unregistered(event.resource))?;

        match &event.kind {
            EventKind::New { item } => self.on_new(spec, event, item)?,
            EventKind::Patch { id, fields } => self.on_patch(spec, event, id, fields)?,
            EventKind::Delete { id } => self.on_delete(spec, event, id)?,
            EventKind::Counter { value } => self.on_counter(spec, *value)?,
            EventKind::BulkCleared => self.on_bulk_cleared(spec, event)?,
        }

        self.applied.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
