//! End-to-end session scenarios over an in-memory push connection.

mod common;

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use common::{MemoryConnector, MemorySource};
use streamcache::cache::optimistic::transforms;
use streamcache::cache::{CacheEntry, CacheKey, Item, ItemId, MutationError, Page, PagedList};
use streamcache::events::{EventKind, InboundEvent, Resource};
use streamcache::transport::{ClientMessage, ConnectionState, Credentials};
use streamcache::{SessionConfig, SyncSession};

const WINDOW: Duration = Duration::from_millis(300);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

struct Harness {
    session: Arc<SyncSession>,
    source: Arc<MemorySource>,
    connector: Arc<MemoryConnector>,
    credentials: Credentials,
}

fn harness() -> Harness {
    let source = Arc::new(MemorySource::default());
    let connector = Arc::new(MemoryConnector::default());
    let credentials = Credentials::new(Some("token-1".to_string()));
    let config = SessionConfig::default()
        .with_reconnect_delay(RECONNECT_DELAY)
        .with_max_reconnect_attempts(3)
        .with_coalesce_window(WINDOW);

    let session = SyncSession::init(config, credentials.clone(), source.clone(), connector.clone()).unwrap();
    Harness {
        session,
        source,
        connector,
        credentials,
    }
}

fn notifications() -> CacheKey {
    CacheKey::new("notifications")
}

fn unread() -> CacheKey {
    CacheKey::new("notifications/unread-count")
}

fn comments(movie: &str) -> CacheKey {
    CacheKey::new("comments").with_param("movieId", movie)
}

fn list(items: Vec<Item>) -> CacheEntry {
    PagedList::from_pages(vec![Page::new(items)]).into()
}

fn ids(session: &SyncSession, key: &CacheKey) -> Vec<String> {
    session
        .store()
        .paged(key)
        .map(|l| l.items().map(|i| i.id.to_string()).collect())
        .unwrap_or_default()
}

#[tokio::test(start_paused = true)]
async fn test_unread_counter_drains_to_zero_after_connect() {
    let h = harness();
    let unread_items = (1..=3)
        .map(|i| Item::new(i as i64).with_field("isRead", false))
        .collect();
    h.session.store().set(notifications(), list(unread_items));
    h.session.store().set(unread(), CacheEntry::Scalar(3));

    // Three read receipts arrive before the connection is up
    for (seq, id) in ["1", "2", "3"].into_iter().enumerate() {
        let fields = json!({ "isRead": true }).as_object().cloned().unwrap();
        let event = InboundEvent::new(
            Resource::Notification,
            EventKind::Patch {
                id: ItemId::from(id),
                fields,
            },
            seq as u64,
        );
        h.session.queue().enqueue(event, h.session.handler().clone());
    }
    assert_eq!(h.session.stats().queued_events, 3);
    assert_eq!(h.session.store().scalar(&unread()), Some(3));

    let _server = h.connector.open();
    let mut handle = h.session.connect().unwrap();
    handle.wait_until(ConnectionState::is_connected).await;

    assert_eq!(h.session.store().scalar(&unread()), Some(0));
    let stored = h.session.store().paged(&notifications()).unwrap();
    assert!(stored.items().all(|item| item.flag("isRead")));
    assert!(h.session.queue().is_empty());
    assert_eq!(h.session.stats().events_applied, 3);
}

#[tokio::test(start_paused = true)]
async fn test_push_frames_update_cache() {
    let h = harness();
    h.session.store().set(comments("7"), list(vec![Item::new("1")]));

    let server = h.connector.open();
    let mut handle = h.session.connect().unwrap();
    handle.wait_until(ConnectionState::is_connected).await;

    server.push(
        "comment:new",
        json!({ "id": 2, "movieId": 7, "parentId": 1, "text": "reply" }),
    );
    server.push(
        "comment:patch",
        json!({ "id": 2, "movieId": 7, "fields": { "likesCount": 3 } }),
    );
    server.push("notification:counter", json!({ "value": 5 }));
    server.push("story:new", json!({ "id": 1 }));
    tokio::time::sleep(Duration::from_millis(10)).await;

    let thread = h.session.store().paged(&comments("7")).unwrap();
    let parent = thread.find(&ItemId::from("1")).unwrap();
    assert_eq!(parent.counter("repliesCount"), 1);
    assert_eq!(parent.replies[0].id, ItemId::from(2));
    assert_eq!(parent.replies[0].counter("likesCount"), 3);
    assert_eq!(h.session.store().scalar(&unread()), Some(5));

    assert_eq!(h.session.stats().events_applied, 3);
    assert_eq!(*h.connector.sent.lock(), vec![ClientMessage::Subscribe]);
    assert_eq!(*h.connector.tokens.lock(), vec!["token-1".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_event_storm_refetches_once() {
    let h = harness();
    let friends = CacheKey::new("friends");
    h.session.store().set(friends.clone(), list(vec![Item::new("f1").with_field("status", "pending")]));
    h.source.set_page(
        &friends,
        None,
        Page::new(vec![Item::new("f1").with_field("status", "accepted")]),
    );

    let server = h.connector.open();
    let mut handle = h.session.connect().unwrap();
    handle.wait_until(ConnectionState::is_connected).await;

    for _ in 0..10 {
        server.push("friendship:patch", json!({ "id": "f1", "status": "accepted" }));
    }
    tokio::time::sleep(WINDOW / 2).await;
    assert_eq!(h.source.calls_for(&friends), 0);

    tokio::time::sleep(WINDOW).await;
    assert_eq!(h.source.calls_for(&friends), 1);

    let stored = h.session.store().paged(&friends).unwrap();
    let status = stored.find(&ItemId::from("f1")).unwrap().field("status").cloned();
    assert_eq!(status, Some(json!("accepted")));
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_resyncs_paged_lists() {
    let h = harness();
    h.session.store().set(notifications(), list(vec![Item::new("old")]));
    h.session.store().set(unread(), CacheEntry::Scalar(1));
    h.source.set_page(&notifications(), None, Page::new(vec![Item::new("new"), Item::new("old")]));

    let first = h.connector.open();
    let _second = h.connector.open();
    let mut handle = h.session.connect().unwrap();
    handle.wait_until(ConnectionState::is_connected).await;

    first.fail();
    let state = handle
        .wait_until(|s| matches!(s, ConnectionState::Reconnecting { .. }))
        .await;
    assert_eq!(state, ConnectionState::Reconnecting { attempt: 1 });

    handle.wait_until(ConnectionState::is_connected).await;
    tokio::time::sleep(WINDOW + Duration::from_millis(50)).await;

    assert_eq!(ids(&h.session, &notifications()), vec!["new", "old"]);
    // Scalars are resent by the server, not refetched
    assert_eq!(h.source.calls_for(&unread()), 0);
    assert_eq!(h.session.stats().reconnects, 1);
    assert_eq!(h.connector.attempts(), 2);
    assert_eq!(h.connector.sent.lock().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_retry_budget() {
    let h = harness();
    let mut handle = h.session.connect().unwrap();

    let state = handle
        .wait_until(|s| matches!(s, ConnectionState::Failed))
        .await;

    assert_eq!(state, ConnectionState::Failed);
    assert_eq!(h.connector.attempts(), 4);

    // A new connect starts over
    let _server = h.connector.open();
    let mut handle = h.session.connect().unwrap();
    handle.wait_until(ConnectionState::is_connected).await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_discards_buffered_events() {
    let h = harness();
    h.session.store().set(unread(), CacheEntry::Scalar(2));
    h.session.queue().enqueue(
        InboundEvent::new(Resource::Notification, EventKind::Counter { value: 9 }, 1),
        h.session.handler().clone(),
    );

    h.session.disconnect();
    assert_eq!(h.session.stats().queued_events, 0);

    let _server = h.connector.open();
    let mut handle = h.session.connect().unwrap();
    handle.wait_until(ConnectionState::is_connected).await;
    assert_eq!(h.session.store().scalar(&unread()), Some(2));
}

#[tokio::test(start_paused = true)]
async fn test_revoked_credential_disconnects() {
    let h = harness();
    let _server = h.connector.open();
    let mut handle = h.session.connect().unwrap();
    handle.wait_until(ConnectionState::is_connected).await;

    h.credentials.revoke();
    handle
        .wait_until(|s| *s == ConnectionState::Disconnected)
        .await;

    assert!(!h.session.is_connected());
    assert!(!h.session.queue().is_ready());
    assert!(h.session.connect().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_optimistic_reply_rolls_back_then_confirms() {
    let h = harness();
    let key = comments("7");
    h.session.store().set(key.clone(), list(vec![Item::new("1")]));
    let before = h.session.store().get(&key);

    let temp = Arc::new(Item::new(transforms::temp_id()).with_field("text", "first"));
    let parent = ItemId::from("1");

    let rejected: Result<(), _> = h
        .session
        .optimistic()
        .mutate(
            &[key.clone()],
            |_, entry| transforms::insert_reply(entry, &parent, temp.clone()),
            async { Err::<(), _>("503") },
            true,
        )
        .await;
    assert!(matches!(rejected, Err(MutationError::Rejected("503"))));
    assert_eq!(h.session.store().get(&key), before);

    // Server state after the confirmed insert
    let confirmed = Item::new("1")
        .with_field("repliesCount", 1)
        .with_reply(Item::new("10").with_field("text", "first"));
    h.source.set_page(&key, None, Page::new(vec![confirmed]));

    let id = h
        .session
        .optimistic()
        .mutate(
            &[key.clone()],
            |_, entry| transforms::insert_reply(entry, &parent, temp.clone()),
            async { Ok::<_, String>(ItemId::from("10")) },
            true,
        )
        .await
        .unwrap();
    assert_eq!(id, ItemId::from("10"));

    let optimistic = h.session.store().paged(&key).unwrap();
    assert!(optimistic.find(&temp.id).is_some());

    tokio::time::sleep(WINDOW * 2).await;
    let settled = h.session.store().paged(&key).unwrap();
    assert!(settled.find(&temp.id).is_none());
    assert!(settled.find(&ItemId::from("10")).is_some());
}
