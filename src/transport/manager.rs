//! Lifecycle of the push connection.
//!
//! The manager owns at most one connection task. The task:
//! - opens a channel with the current credential
//! - sends one subscribe request, publishes `Connected`, and drains the queue
//! - decodes every frame into an `InboundEvent` and enqueues it
//! - on a drop, marks the queue not ready and retries after a fixed delay
//!
//! A clean server close is retried without counting against the retry budget.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::protocol::{self, ClientMessage, ProtocolError};
use super::{ChannelEvent, ConnectionState, Connector, Credentials, PushChannel, TransportError};
use crate::events::{EventHandler, EventQueue, InboundEvent};

/// Reconnect policy
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Fixed delay before each reconnect attempt
    pub reconnect_delay: Duration,
    /// Consecutive failed attempts tolerated before giving up
    pub max_reconnect_attempts: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 5,
        }
    }
}

/// Connection statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportStats {
    pub state: ConnectionState,
    /// Successful reconnections (not counting the first connect)
    pub reconnects: u64,
    pub frames_received: u64,
    /// Frames that could not be decoded or had no handler
    pub frames_dropped: u64,
}

/// Observer of a running connection
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    state: watch::Receiver<ConnectionState>,
}

impl ConnectionHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Wait for the next state change; `None` once the manager is gone
    pub async fn changed(&mut self) -> Option<ConnectionState> {
        self.state.changed().await.ok()?;
        Some(*self.state.borrow_and_update())
    }

    /// Wait until the state satisfies `predicate` and return it
    pub async fn wait_until<F>(&mut self, predicate: F) -> ConnectionState
    where
        F: Fn(&ConnectionState) -> bool,
    {
        loop {
            let current = *self.state.borrow_and_update();
            if predicate(&current) {
                return current;
            }
            if self.state.changed().await.is_err() {
                return *self.state.borrow();
            }
        }
    }
}

type ReconnectHook = Arc<dyn Fn() + Send + Sync>;

/// The connection task currently owned by the manager
struct ConnectionTask {
    generation: u64,
    shutdown_tx: broadcast::Sender<()>,
    join: JoinHandle<()>,
}

/// How one connected session ended
enum SessionEnd {
    Shutdown,
    ServerClosed(Option<String>),
    Failed(TransportError),
}

struct ManagerInner {
    connector: Arc<dyn Connector>,
    queue: Arc<EventQueue>,
    config: TransportConfig,
    state: watch::Sender<ConnectionState>,
    handler: RwLock<Option<Arc<dyn EventHandler>>>,
    on_reconnect: RwLock<Option<ReconnectHook>>,
    task: Mutex<Option<ConnectionTask>>,
    generations: AtomicU64,
    sequence: AtomicU64,
    reconnects: AtomicU64,
    frames_received: AtomicU64,
    frames_dropped: AtomicU64,
}

/// Manages the single push connection of a session
#[derive(Clone)]
pub struct TransportManager {
    inner: Arc<ManagerInner>,
}

impl TransportManager {
    pub fn new(connector: Arc<dyn Connector>, queue: Arc<EventQueue>, config: TransportConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(ManagerInner {
                connector,
                queue,
                config,
                state,
                handler: RwLock::new(None),
                on_reconnect: RwLock::new(None),
                task: Mutex::new(None),
                generations: AtomicU64::new(1),
                sequence: AtomicU64::new(0),
                reconnects: AtomicU64::new(0),
                frames_received: AtomicU64::new(0),
                frames_dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Start the connection task.
    ///
    /// Idempotent: while a task is alive its handle is returned again. Returns
    /// `None` when `credentials` hold no token.
    pub fn connect(&self, credentials: &Credentials) -> Option<ConnectionHandle> {
        let mut task = self.inner.task.lock();

        if let Some(running) = task.as_ref() {
            if !running.join.is_finished() {
                debug!("Connection already running");
                return Some(self.handle());
            }
        }

        if credentials.token().is_none() {
            warn!("No credential available, not connecting");
            return None;
        }

        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        self.inner.state.send_replace(ConnectionState::Connecting);

        let inner = self.inner.clone();
        let credentials = credentials.clone();
        let join = tokio::spawn(async move {
            inner.run(generation, credentials, shutdown_rx).await;
        });

        *task = Some(ConnectionTask {
            generation,
            shutdown_tx,
            join,
        });
        Some(self.handle())
    }

    /// Stop the connection, drop the handler and discard undrained events
    pub fn disconnect(&self) {
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            let _ = task.shutdown_tx.send(());
        }

        self.inner.queue.set_ready(false);
        let discarded = self.inner.queue.clear();
        *self.inner.handler.write() = None;
        self.inner.state.send_replace(ConnectionState::Disconnected);

        info!("Disconnected ({} queued events discarded)", discarded);
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            state: self.inner.state.subscribe(),
        }
    }

    /// Handler every decoded event is enqueued with
    pub fn register_handler(&self, handler: Arc<dyn EventHandler>) {
        *self.inner.handler.write() = Some(handler);
    }

    /// Called each time a dropped connection is re-established
    pub fn set_on_reconnect<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.inner.on_reconnect.write() = Some(Arc::new(hook));
    }

    /// Next arrival sequence number
    pub fn next_sequence(&self) -> u64 {
        self.inner.next_sequence()
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.inner.queue
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            state: self.state(),
            reconnects: self.inner.reconnects.load(Ordering::Relaxed),
            frames_received: self.inner.frames_received.load(Ordering::Relaxed),
            frames_dropped: self.inner.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

impl ManagerInner {
    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Publish `state` unless the task has been replaced or disconnected.
    ///
    /// Queue readiness follows the published state under the task lock, so a
    /// `disconnect` can never be followed by a stale task marking it ready.
    fn publish(&self, generation: u64, state: ConnectionState) -> bool {
        let task = self.task.lock();
        if task.as_ref().map(|t| t.generation) != Some(generation) {
            return false;
        }
        self.queue.set_ready(state.is_connected());
        self.state.send_replace(state);
        true
    }

    async fn run(
        self: Arc<Self>,
        generation: u64,
        credentials: Credentials,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut failures: u32 = 0;
        let mut connected_before = false;

        loop {
            let Some(token) = credentials.token() else {
                warn!("Credential gone, giving up on the connection");
                self.publish(generation, ConnectionState::Failed);
                return;
            };

            let attempt = tokio::select! {
                _ = shutdown.recv() => return,
                result = self.connector.connect(&token) => result,
            };

            match attempt {
                Ok(mut channel) => {
                    failures = 0;
                    let end = self
                        .serve(generation, channel.as_mut(), &mut shutdown, connected_before)
                        .await;
                    connected_before = true;

                    match end {
                        SessionEnd::Shutdown => {
                            channel.close().await;
                            return;
                        }
                        SessionEnd::ServerClosed(reason) => {
                            info!("Server closed the connection: {}", reason.as_deref().unwrap_or("no reason"));
                        }
                        SessionEnd::Failed(e) => {
                            warn!("Connection lost: {}", e);
                            failures += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!("Connection attempt failed: {}", e);
                    failures += 1;
                }
            }

            if failures > self.config.max_reconnect_attempts {
                error!("Giving up after {} failed connection attempts", failures);
                self.publish(generation, ConnectionState::Failed);
                return;
            }

            let attempt = failures.max(1);
            if !self.publish(generation, ConnectionState::Reconnecting { attempt }) {
                return;
            }
            debug!("Reconnecting in {:?} (attempt {})", self.config.reconnect_delay, attempt);

            tokio::select! {
                _ = shutdown.recv() => return,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }
    }

    /// Subscribe, go live, and pump frames until the channel ends
    async fn serve(
        &self,
        generation: u64,
        channel: &mut dyn PushChannel,
        shutdown: &mut broadcast::Receiver<()>,
        reconnected: bool,
    ) -> SessionEnd {
        if let Err(e) = channel.send(&ClientMessage::Subscribe).await {
            return SessionEnd::Failed(e);
        }
        if !self.publish(generation, ConnectionState::Connected) {
            return SessionEnd::Shutdown;
        }
        info!("Connected and subscribed");

        if reconnected {
            self.reconnects.fetch_add(1, Ordering::Relaxed);
            let hook = self.on_reconnect.read().clone();
            if let Some(hook) = hook {
                hook();
            }
        }

        let drained = self.queue.drain();
        if drained > 0 {
            debug!("Drained {} buffered events", drained);
        }

        loop {
            tokio::select! {
                _ = shutdown.recv() => return SessionEnd::Shutdown,
                event = channel.recv() => match event {
                    ChannelEvent::Frame(text) => self.dispatch(&text),
                    ChannelEvent::ServerClosed(reason) => return SessionEnd::ServerClosed(reason),
                    ChannelEvent::Failed(e) => return SessionEnd::Failed(e),
                },
            }
        }
    }

    fn dispatch(&self, text: &str) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);

        let decoded = match protocol::decode_event(text) {
            Ok(decoded) => decoded,
            Err(ProtocolError::UnknownEvent(name)) => {
                debug!("Dropping unknown event {}", name);
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(e) => {
                warn!("Dropping malformed frame: {}", e);
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let handler = self.handler.read().clone();
        let Some(handler) = handler else {
            debug!("No handler registered, dropping {}:{}", decoded.resource, decoded.kind.name());
            self.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let mut event = InboundEvent::new(decoded.resource, decoded.kind, self.next_sequence());
        event.scope = decoded.scope;
        self.queue.enqueue(event, handler);
    }
}
