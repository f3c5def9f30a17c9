//! streamcache - keeps a local cache of notifications, friendships and
//! comments in sync with the server and logs every change.

use anyhow::Context;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use streamcache::events::ResourceSpec;
use streamcache::{Credentials, HttpDataSource, SessionConfig, SyncSession, WsConnector};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "streamcache=info".into()),
        )
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let config = SessionConfig::from_env().context("Failed to read configuration")?;
    let credentials = Credentials::new(std::env::var("STREAMCACHE_TOKEN").ok());

    info!("streamcache v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Push endpoint: {}", config.ws_url);
    info!("   Data layer: {}", config.api_url);

    let source = Arc::new(HttpDataSource::new(config.api_url.clone(), credentials.clone()));
    let connector = Arc::new(WsConnector::new(config.ws_url.clone()));
    let session = SyncSession::init(config, credentials, source, connector)?;

    // Warm the lists and counters that need no parameters
    for spec in [ResourceSpec::notifications(), ResourceSpec::friendships()] {
        let list = spec.list_key(&Default::default(), spec.resource.name())?;
        if let Err(e) = session.store().load_paged(&list).await {
            warn!("Could not load {}: {}", list, e);
        }
        if let Some(counter) = &spec.counter {
            if let Err(e) = session.store().load_scalar(counter).await {
                warn!("Could not load {}: {}", counter, e);
            }
        }
    }

    let mut handle = session
        .connect()
        .context("STREAMCACHE_TOKEN is not set")?;
    let mut changes = session.store().subscribe();

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutting down");
                break;
            }
            state = handle.changed() => match state {
                Some(state) => info!("Connection {}", state),
                None => break,
            },
            change = changes.recv() => match change {
                Ok(key) => info!("Cache updated: {}", key),
                Err(RecvError::Lagged(skipped)) => warn!("Missed {} cache notifications", skipped),
                Err(RecvError::Closed) => break,
            },
        }
    }

    let stats = session.stats();
    info!(
        "Applied {} events, {} fetches, {} reconnects",
        stats.events_applied, stats.fetches, stats.reconnects
    );
    session.teardown();
    Ok(())
}
