//! Query cache for server-owned collections.
//!
//! This module holds the data model shared by every part of the engine:
//! - Cache keys addressing one query result (resource + filter parameters)
//! - Cache entries (scalar counters and cursor-paginated page sequences)
//! - Items with stable identity and an optional recursive reply tree
//!
//! Entries are immutable values. Every write replaces a whole entry, and items
//! are shared between versions through `Arc` so a rewrite only copies the path
//! it touched.

pub mod coalescer;
pub mod optimistic;
pub mod store;
pub mod tree;

pub use coalescer::{CoalescingWindow, Invalidator};
pub use optimistic::{MutationContext, MutationError, OptimisticEngine};
pub use store::CacheStore;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Field carrying the number of direct replies of a comment
pub const REPLIES_COUNT_FIELD: &str = "repliesCount";

/// Field naming the parent of a reply
pub const PARENT_ID_FIELD: &str = "parentId";

/// Address of one cached query result
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    /// Resource name (e.g. "notifications")
    pub resource: String,
    /// Filter parameters, ordered so equal filters hash equally
    pub params: BTreeMap<String, String>,
}

impl CacheKey {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.resource)?;
        for (i, (name, value)) in self.params.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{}{}={}", sep, name, value)?;
        }
        Ok(())
    }
}

/// Stable identity of an item.
///
/// Servers send ids as strings or integers; both forms of the same value are
/// the same identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this id was minted locally for an optimistic insert
    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(optimistic::transforms::TEMP_ID_PREFIX)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ItemId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<i64> for ItemId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

impl<'de> Deserialize<'de> for ItemId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Signed(i64),
            Unsigned(u64),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(s) => ItemId(s),
            Raw::Signed(n) => ItemId(n.to_string()),
            Raw::Unsigned(n) => ItemId(n.to_string()),
        })
    }
}

/// A cached item (notification, friendship, comment).
///
/// Comments carry their replies recursively; other resources leave
/// `replies` empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replies: Vec<Arc<Item>>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Item {
    pub fn new(id: impl Into<ItemId>) -> Self {
        Self {
            id: id.into(),
            replies: Vec::new(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn with_reply(mut self, reply: Item) -> Self {
        self.replies.push(Arc::new(reply));
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Boolean field, `false` when missing or not a boolean
    pub fn flag(&self, name: &str) -> bool {
        self.fields.get(name).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Integer field, `0` when missing or not an integer
    pub fn counter(&self, name: &str) -> i64 {
        self.fields.get(name).and_then(Value::as_i64).unwrap_or(0)
    }

    /// Parent reference for replies, if any
    pub fn parent_id(&self) -> Option<ItemId> {
        match self.fields.get(PARENT_ID_FIELD)? {
            Value::String(s) => Some(ItemId::new(s.clone())),
            Value::Number(n) => Some(ItemId::new(n.to_string())),
            _ => None,
        }
    }

    /// Copy of this node with a different reply sequence
    pub fn with_replies(&self, replies: Vec<Arc<Item>>) -> Item {
        Item {
            id: self.id.clone(),
            replies,
            fields: self.fields.clone(),
        }
    }

    /// Merge patch fields into a copy of this item. Identity and the reply
    /// sub-collection cannot be overwritten through a field patch.
    pub fn merged(&self, patch: &Map<String, Value>) -> Item {
        let mut next = self.clone();
        for (name, value) in patch {
            if name == "id" || name == "replies" {
                continue;
            }
            next.fields.insert(name.clone(), value.clone());
        }
        next
    }
}

/// One page of a paginated list
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Page {
    pub items: Vec<Arc<Item>>,
    #[serde(default, rename = "nextCursor")]
    pub next_cursor: Option<String>,
}

impl Page {
    pub fn new(items: Vec<Item>) -> Self {
        Self {
            items: items.into_iter().map(Arc::new).collect(),
            next_cursor: None,
        }
    }

    pub fn with_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.next_cursor = Some(cursor.into());
        self
    }
}

/// Ordered sequence of pages making up an infinite list
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PagedList {
    pub pages: Vec<Page>,
}

impl PagedList {
    pub fn new() -> Self {
        Self { pages: Vec::new() }
    }

    pub fn from_pages(pages: Vec<Page>) -> Self {
        Self { pages }
    }

    /// All items in server order
    pub fn items(&self) -> impl Iterator<Item = &Arc<Item>> {
        self.pages.iter().flat_map(|page| page.items.iter())
    }

    /// Number of top-level items across all pages
    pub fn len(&self) -> usize {
        self.pages.iter().map(|page| page.items.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Locate an item anywhere in the list, including nested replies
    pub fn find(&self, id: &ItemId) -> Option<&Arc<Item>> {
        self.pages.iter().find_map(|page| tree::find(&page.items, id))
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        self.find(id).is_some()
    }

    /// Cursor to request the page after the last loaded one
    pub fn last_cursor(&self) -> Option<&str> {
        self.pages.last().and_then(|page| page.next_cursor.as_deref())
    }

    /// Whether the server reported more pages after the loaded ones
    pub fn has_next_page(&self) -> bool {
        self.last_cursor().is_some()
    }

    /// Drop repeated top-level identities, keeping the first occurrence
    pub fn dedupe(mut self) -> Self {
        let mut seen = HashSet::new();
        for page in &mut self.pages {
            page.items.retain(|item| seen.insert(item.id.clone()));
        }
        self
    }
}

/// A cached query result
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEntry {
    /// Flat value such as an unread counter
    Scalar(i64),
    /// Cursor-paginated list
    Paged(PagedList),
}

impl CacheEntry {
    pub fn as_scalar(&self) -> Option<i64> {
        match self {
            CacheEntry::Scalar(value) => Some(*value),
            CacheEntry::Paged(_) => None,
        }
    }

    pub fn as_paged(&self) -> Option<&PagedList> {
        match self {
            CacheEntry::Paged(list) => Some(list),
            CacheEntry::Scalar(_) => None,
        }
    }

    pub fn is_paged(&self) -> bool {
        matches!(self, CacheEntry::Paged(_))
    }
}

impl From<PagedList> for CacheEntry {
    fn from(list: PagedList) -> Self {
        CacheEntry::Paged(list)
    }
}
