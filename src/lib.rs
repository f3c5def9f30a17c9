//! streamcache - real-time cache synchronization engine.
//!
//! Keeps a local, paginated cache of server-owned collections (notifications,
//! unread counters, friendships, nested comment trees) consistent with:
//! - optimistic mutations that apply instantly and roll back on failure
//! - push events over a connection that may drop and reconnect at any time
//! - bursts of related events, coalesced into one refetch per key

pub mod cache;
pub mod config;
pub mod events;
pub mod session;
pub mod source;
pub mod transport;

pub use cache::{CacheEntry, CacheKey, CacheStore, Item, ItemId, Page, PagedList};
pub use config::{ConfigError, SessionConfig};
pub use events::{EventKind, InboundEvent, Resource};
pub use session::{SessionStats, SyncSession};
pub use source::{DataSource, FetchError, HttpDataSource};
pub use transport::{ConnectionState, Credentials, TransportError, WsConnector};
