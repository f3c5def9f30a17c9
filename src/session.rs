//! The synchronization session.
//!
//! One `SyncSession` exists per authenticated user. It wires the cache store,
//! the coalescer, the optimistic engine, the event queue and the transport
//! together, and watches the credential so a revocation disconnects at once.
//! Created on login with `init`, destroyed on logout with `teardown`.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::info;

use crate::cache::{CacheStore, Invalidator, OptimisticEngine};
use crate::config::{ConfigError, SessionConfig};
use crate::events::{CacheEventHandler, EventQueue};
use crate::source::DataSource;
use crate::transport::{ConnectionHandle, ConnectionState, Connector, Credentials, TransportManager};

/// Session statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub connection_state: ConnectionState,
    /// Events waiting in the queue
    pub queued_events: usize,
    pub cached_entries: usize,
    pub reconnects: u64,
    /// Events applied to the cache by the handler
    pub events_applied: u64,
    /// Requests issued to the data source
    pub fetches: u64,
    pub uptime: Duration,
}

/// A running cache synchronization session
pub struct SyncSession {
    config: SessionConfig,
    credentials: Credentials,
    store: Arc<CacheStore>,
    invalidator: Invalidator,
    optimistic: OptimisticEngine,
    queue: Arc<EventQueue>,
    handler: Arc<CacheEventHandler>,
    transport: TransportManager,
    /// Task disconnecting the session when the credential is revoked
    revocation: Mutex<Option<JoinHandle<()>>>,
    started_at: Instant,
}

impl SyncSession {
    /// Build a session. Nothing connects until `connect` is called.
    pub fn init(
        config: SessionConfig,
        credentials: Credentials,
        source: Arc<dyn DataSource>,
        connector: Arc<dyn Connector>,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;

        let store = Arc::new(CacheStore::new(source));
        let invalidator = Invalidator::new(store.clone(), config.coalesce_window);
        let optimistic = OptimisticEngine::new(store.clone(), invalidator.clone());
        let queue = Arc::new(EventQueue::new());
        let handler = Arc::new(CacheEventHandler::new(store.clone(), invalidator.clone()));
        let transport = TransportManager::new(connector, queue.clone(), config.transport());

        // Events missed while offline are gone; refetch every list instead
        let resync_store = store.clone();
        let resync = invalidator.clone();
        transport.set_on_reconnect(move || {
            let keys = resync_store.paged_keys();
            info!("Reconnected, refreshing {} cached lists", keys.len());
            resync.mark_all_stale(keys);
        });

        info!("Sync session initialized");

        Ok(Arc::new(Self {
            config,
            credentials,
            store,
            invalidator,
            optimistic,
            queue,
            handler,
            transport,
            revocation: Mutex::new(None),
            started_at: Instant::now(),
        }))
    }

    /// Register the cache handler and start the push connection.
    ///
    /// Returns `None` when there is no credential.
    pub fn connect(&self) -> Option<ConnectionHandle> {
        self.transport.register_handler(self.handler.clone());
        let handle = self.transport.connect(&self.credentials)?;
        self.watch_revocation();
        Some(handle)
    }

    fn watch_revocation(&self) {
        let mut watcher = self.revocation.lock();
        if watcher.as_ref().map_or(false, |task| !task.is_finished()) {
            return;
        }

        let mut token = self.credentials.watch();
        let transport = self.transport.clone();
        let invalidator = self.invalidator.clone();
        *watcher = Some(tokio::spawn(async move {
            while token.changed().await.is_ok() {
                if token.borrow_and_update().is_none() {
                    info!("Credential revoked, disconnecting");
                    transport.disconnect();
                    invalidator.cancel();
                    break;
                }
            }
        }));
    }

    /// Stop the connection and drop pending work; cached data is kept
    pub fn disconnect(&self) {
        if let Some(watcher) = self.revocation.lock().take() {
            watcher.abort();
        }
        self.transport.disconnect();
        self.invalidator.cancel();
    }

    /// Disconnect and drop every cached entry
    pub fn teardown(&self) {
        self.disconnect();
        self.store.clear();
        info!("Sync session torn down after {:?}", self.started_at.elapsed());
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn optimistic(&self) -> &OptimisticEngine {
        &self.optimistic
    }

    pub fn invalidator(&self) -> &Invalidator {
        &self.invalidator
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    pub fn handler(&self) -> &Arc<CacheEventHandler> {
        &self.handler
    }

    pub fn transport(&self) -> &TransportManager {
        &self.transport
    }

    pub fn stats(&self) -> SessionStats {
        let transport = self.transport.stats();
        SessionStats {
            connection_state: transport.state,
            queued_events: self.queue.len(),
            cached_entries: self.store.len(),
            reconnects: transport.reconnects,
            events_applied: self.handler.applied_count(),
            fetches: self.store.fetch_count(),
            uptime: self.started_at.elapsed(),
        }
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        if let Some(watcher) = self.revocation.get_mut().take() {
            watcher.abort();
        }
    }
}
