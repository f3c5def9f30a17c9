//! In-memory push connector and data source for session tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use streamcache::cache::{CacheKey, Page};
use streamcache::source::{DataSource, FetchError, FetchResult};
use streamcache::transport::{
    ChannelEvent, ClientMessage, Connector, PushChannel, TransportError, TransportResult,
};

/// Server end of one in-memory connection
pub struct ServerSide {
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

impl ServerSide {
    /// Push a JSON frame `{"event": name, "data": data}`
    pub fn push(&self, event: &str, data: serde_json::Value) {
        let frame = serde_json::json!({ "event": event, "data": data }).to_string();
        let _ = self.tx.send(ChannelEvent::Frame(frame));
    }

    pub fn close(&self) {
        let _ = self.tx.send(ChannelEvent::ServerClosed(Some("going away".to_string())));
    }

    pub fn fail(&self) {
        let _ = self.tx.send(ChannelEvent::Failed(TransportError::Closed));
    }
}

/// Connector handing out pre-opened in-memory links in order
#[derive(Default)]
pub struct MemoryConnector {
    links: Mutex<VecDeque<mpsc::UnboundedReceiver<ChannelEvent>>>,
    attempts: AtomicUsize,
    pub tokens: Mutex<Vec<String>>,
    pub sent: Arc<Mutex<Vec<ClientMessage>>>,
}

impl MemoryConnector {
    /// Make the next `connect` succeed; returns its server end
    pub fn open(&self) -> ServerSide {
        let (tx, rx) = mpsc::unbounded_channel();
        self.links.lock().push_back(rx);
        ServerSide { tx }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, credential: &str) -> TransportResult<Box<dyn PushChannel>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.tokens.lock().push(credential.to_string());

        let link = self.links.lock().pop_front();
        match link {
            Some(rx) => Ok(Box::new(MemoryChannel {
                rx,
                sent: self.sent.clone(),
            })),
            None => Err(TransportError::ConnectFailed("no server".to_string())),
        }
    }
}

struct MemoryChannel {
    rx: mpsc::UnboundedReceiver<ChannelEvent>,
    sent: Arc<Mutex<Vec<ClientMessage>>>,
}

#[async_trait]
impl PushChannel for MemoryChannel {
    async fn send(&mut self, message: &ClientMessage) -> TransportResult<()> {
        self.sent.lock().push(message.clone());
        Ok(())
    }

    async fn recv(&mut self) -> ChannelEvent {
        match self.rx.recv().await {
            Some(event) => event,
            None => ChannelEvent::Failed(TransportError::Closed),
        }
    }

    async fn close(&mut self) {
        self.rx.close();
    }
}

/// Data source whose responses can be changed mid-test
#[derive(Default)]
pub struct MemorySource {
    pages: Mutex<HashMap<(CacheKey, Option<String>), Page>>,
    scalars: Mutex<HashMap<CacheKey, i64>>,
    calls: Mutex<Vec<CacheKey>>,
}

impl MemorySource {
    pub fn set_page(&self, key: &CacheKey, cursor: Option<&str>, page: Page) {
        self.pages
            .lock()
            .insert((key.clone(), cursor.map(String::from)), page);
    }

    pub fn set_scalar(&self, key: &CacheKey, value: i64) {
        self.scalars.lock().insert(key.clone(), value);
    }

    pub fn calls_for(&self, key: &CacheKey) -> usize {
        self.calls.lock().iter().filter(|k| *k == key).count()
    }
}

#[async_trait]
impl DataSource for MemorySource {
    async fn fetch_page(&self, key: &CacheKey, cursor: Option<&str>) -> FetchResult<Page> {
        self.calls.lock().push(key.clone());
        self.pages
            .lock()
            .get(&(key.clone(), cursor.map(String::from)))
            .cloned()
            .ok_or_else(|| FetchError::Unavailable(key.to_string()))
    }

    async fn fetch_scalar(&self, key: &CacheKey) -> FetchResult<i64> {
        self.calls.lock().push(key.clone());
        self.scalars
            .lock()
            .get(key)
            .copied()
            .ok_or_else(|| FetchError::Unavailable(key.to_string()))
    }
}
