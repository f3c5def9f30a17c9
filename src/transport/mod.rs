//! Push transport: one long-lived authenticated connection delivering events.
//!
//! The connection itself sits behind the `Connector` / `PushChannel` traits so
//! the manager's lifecycle logic is independent of the wire:
//! - `manager` - connect, subscribe, detect drops, reconnect with bounded retries
//! - `protocol` - JSON frame format of inbound events and outbound requests
//! - `ws` - `tokio-tungstenite` implementation of the traits

pub mod manager;
pub mod protocol;
pub mod ws;

pub use manager::{ConnectionHandle, TransportConfig, TransportManager, TransportStats};
pub use protocol::{ClientMessage, ProtocolError};
pub use ws::WsConnector;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// Lifecycle of the push connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting to retry; `attempt` counts consecutive failures
    Reconnecting { attempt: u32 },
    /// Retries exhausted or credential gone; terminal until the next `connect`
    Failed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Reconnecting { attempt } => write!(f, "reconnecting (attempt {})", attempt),
            ConnectionState::Failed => f.write_str("failed"),
        }
    }
}

/// Errors that can occur on the push connection
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Connection closed")]
    Closed,

    #[error("No credential available")]
    MissingCredential,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Invalid connection request: {0}")]
    InvalidRequest(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Current credential plus a revocation signal.
///
/// Cloning shares the same underlying value; the session watches it and
/// disconnects as soon as the credential is revoked.
#[derive(Clone)]
pub struct Credentials {
    token: Arc<watch::Sender<Option<String>>>,
}

impl Credentials {
    pub fn new(token: Option<String>) -> Self {
        let (tx, _) = watch::channel(token);
        Self { token: Arc::new(tx) }
    }

    /// Credentials with no token; `connect` refuses to use them
    pub fn anonymous() -> Self {
        Self::new(None)
    }

    /// Current token, if any
    pub fn token(&self) -> Option<String> {
        self.token.borrow().clone()
    }

    /// Replace the token (login or refresh)
    pub fn set(&self, token: impl Into<String>) {
        self.token.send_replace(Some(token.into()));
    }

    /// Drop the token (logout or revocation)
    pub fn revoke(&self) {
        self.token.send_replace(None);
    }

    /// Observe token changes
    pub fn watch(&self) -> watch::Receiver<Option<String>> {
        self.token.subscribe()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("present", &self.token.borrow().is_some())
            .finish()
    }
}

/// Something that happened on an open channel
#[derive(Debug)]
pub enum ChannelEvent {
    /// A text frame
    Frame(String),
    /// The server closed the connection cleanly
    ServerClosed(Option<String>),
    /// The connection broke
    Failed(TransportError),
}

/// Opens authenticated push channels
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, credential: &str) -> TransportResult<Box<dyn PushChannel>>;
}

/// One open push connection
#[async_trait]
pub trait PushChannel: Send {
    async fn send(&mut self, message: &ClientMessage) -> TransportResult<()>;

    /// Next event; must be cancel-safe
    async fn recv(&mut self) -> ChannelEvent;

    async fn close(&mut self);
}
