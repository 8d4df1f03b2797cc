//! Integration tests for the notification feed over the in-process store.
//!
//! These tests verify:
//! 1. Deliveries replace the whole list: newest first, capped, unread counted
//! 2. Authorization failures become exactly one channel event each
//! 3. Marking as read goes through the store and skips already-read records
//! 4. The feed follows the session: open on sign-in, closed and empty on sign-out

use std::sync::Arc;
use std::time::Duration;

use classhub::events::{ErrorChannel, ErrorEvent, PermissionErrorEvent, Topic};
use classhub::models::session::{Role, Session};
use classhub::notification::{FeedSnapshot, NotificationFeed};
use classhub::session::SessionHub;
use classhub::store::memory::MemoryStore;
use classhub::store::Operation;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(2);

fn fixture(message: &str, minute: u32, read: bool) -> Map<String, Value> {
    json!({
        "message": message,
        "created_at": format!("2024-03-01T10:{:02}:00Z", minute),
        "read": read,
        "type": "announcement",
    })
    .as_object()
    .cloned()
    .unwrap()
}

/// Channel with one listener that forwards every permission event.
fn recording_channel() -> (Arc<ErrorChannel>, mpsc::UnboundedReceiver<PermissionErrorEvent>) {
    let channel = Arc::new(ErrorChannel::new());
    let (tx, rx) = mpsc::unbounded_channel();
    channel.on(Topic::PermissionError, move |event| {
        let ErrorEvent::Permission(event) = event;
        let _ = tx.send(event.clone());
        Ok(())
    });
    (channel, rx)
}

async fn wait_for(feed: &NotificationFeed, pred: impl FnMut(&FeedSnapshot) -> bool) -> FeedSnapshot {
    let mut updates = feed.updates();
    let snapshot = tokio::time::timeout(WAIT, updates.wait_for(pred))
        .await
        .expect("feed did not reach the expected state")
        .expect("feed state dropped");
    snapshot.clone()
}

async fn no_more_events(rx: &mut mpsc::UnboundedReceiver<PermissionErrorEvent>) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err(), "unexpected extra permission event");
}

mod delivery_tests {
    use super::*;

    #[tokio::test]
    async fn test_feed_is_newest_first_and_capped() {
        let store = MemoryStore::new();
        for minute in 0..12 {
            store.seed("notifications", &format!("n{:02}", minute), fixture("m", minute, false));
        }
        let (channel, _rx) = recording_channel();
        let feed = NotificationFeed::new(Arc::new(store), channel, 10);

        let _sub = feed.subscribe(10).await;
        let snapshot = wait_for(&feed, |s| s.loaded).await;

        assert_eq!(snapshot.items.len(), 10);
        assert_eq!(snapshot.items[0].id, "n11");
        assert_eq!(snapshot.items[9].id, "n02");
        assert!(snapshot
            .items
            .windows(2)
            .all(|w| w[0].created_at >= w[1].created_at));
    }

    #[tokio::test]
    async fn test_new_notification_replaces_list() {
        let store = MemoryStore::new();
        store.seed("notifications", "a", fixture("first", 1, false));
        let (channel, _rx) = recording_channel();
        let feed = NotificationFeed::new(Arc::new(store.clone()), channel, 10);

        let _sub = feed.subscribe(10).await;
        wait_for(&feed, |s| s.loaded && s.items.len() == 1).await;

        store.seed("notifications", "b", fixture("second", 2, false));
        let snapshot = wait_for(&feed, |s| s.items.len() == 2).await;
        assert_eq!(snapshot.items[0].id, "b");
        assert_eq!(feed.unread_count(), 2);
    }

    #[tokio::test]
    async fn test_unread_count_tracks_list() {
        let store = MemoryStore::new();
        store.seed("notifications", "a", fixture("a", 1, false));
        store.seed("notifications", "b", fixture("b", 2, true));
        store.seed("notifications", "c", fixture("c", 3, false));
        let (channel, _rx) = recording_channel();
        let feed = NotificationFeed::new(Arc::new(store), channel, 10);

        let _sub = feed.subscribe(10).await;
        let snapshot = wait_for(&feed, |s| s.loaded).await;
        assert_eq!(snapshot.unread_count(), 2);
        assert_eq!(feed.unread_count(), 2);
    }

    #[tokio::test]
    async fn test_zero_limit_is_an_empty_window() {
        let store = MemoryStore::new();
        store.seed("notifications", "a", fixture("a", 1, false));
        let (channel, mut rx) = recording_channel();
        let feed = NotificationFeed::new(Arc::new(store.clone()), channel, 10);

        let _sub = feed.subscribe(0).await;
        let snapshot = wait_for(&feed, |s| s.loaded).await;
        assert!(snapshot.items.is_empty());
        assert_eq!(feed.unread_count(), 0);

        store.seed("notifications", "b", fixture("b", 2, false));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(feed.items().is_empty());
        no_more_events(&mut rx).await;
    }

    #[tokio::test]
    async fn test_limit_bounds_the_window_exactly() {
        let store = MemoryStore::new();
        for minute in 0..3 {
            store.seed("notifications", &format!("n{}", minute), fixture("m", minute, false));
        }
        let (channel, _rx) = recording_channel();
        let feed = NotificationFeed::new(Arc::new(store), channel, 10);

        let _sub = feed.subscribe(1).await;
        let snapshot = wait_for(&feed, |s| s.loaded).await;
        let ids: Vec<_> = snapshot.items.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["n2"]);
    }

    #[tokio::test]
    async fn test_mixed_offsets_keep_newest_in_window() {
        let store = MemoryStore::new();
        for minute in 0..10 {
            store.seed("notifications", &format!("n{}", minute), fixture("m", minute, false));
        }
        // 11:00 UTC expressed in a -02:00 offset.
        let mut latest = fixture("latest", 0, false);
        latest.insert("created_at".into(), json!("2024-03-01T09:00:00-02:00"));
        store.seed("notifications", "latest", latest);
        let (channel, _rx) = recording_channel();
        let feed = NotificationFeed::new(Arc::new(store), channel, 10);

        let _sub = feed.subscribe(10).await;
        let snapshot = wait_for(&feed, |s| s.loaded).await;
        assert_eq!(snapshot.items.len(), 10);
        assert_eq!(snapshot.items[0].id, "latest");
        assert!(snapshot.items.iter().all(|n| n.id != "n0"));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_stops_updates() {
        let store = MemoryStore::new();
        store.seed("notifications", "a", fixture("a", 1, false));
        let (channel, _rx) = recording_channel();
        let feed = NotificationFeed::new(Arc::new(store.clone()), channel, 10);

        let sub = feed.subscribe(10).await;
        wait_for(&feed, |s| s.loaded).await;
        assert_eq!(feed.open_subscriptions(), 1);

        sub.close();
        sub.close();
        assert!(sub.is_closed());
        assert_eq!(feed.open_subscriptions(), 0);

        store.seed("notifications", "b", fixture("b", 2, false));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(feed.items().len(), 1);
    }
}

mod permission_tests {
    use super::*;

    #[tokio::test]
    async fn test_denied_list_publishes_one_event_and_stays_empty() {
        let store = MemoryStore::new();
        store.seed("notifications", "a", fixture("a", 1, false));
        store.deny("notifications", Operation::List);
        let (channel, mut rx) = recording_channel();
        let feed = NotificationFeed::new(Arc::new(store), channel, 10);

        let _sub = feed.subscribe(10).await;
        let event = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(event.path, "notifications");
        assert_eq!(event.operation, Operation::List);
        no_more_events(&mut rx).await;

        let snapshot = feed.snapshot();
        assert!(snapshot.loaded);
        assert!(snapshot.items.is_empty());
        assert_eq!(feed.unread_count(), 0);
    }

    #[tokio::test]
    async fn test_denied_update_publishes_one_event_and_keeps_flag() {
        let store = MemoryStore::new();
        store.seed("notifications", "n1", fixture("a", 1, false));
        let (channel, mut rx) = recording_channel();
        let feed = NotificationFeed::new(Arc::new(store.clone()), channel, 10);

        let _sub = feed.subscribe(10).await;
        wait_for(&feed, |s| s.loaded).await;

        store.deny("notifications", Operation::Update);
        feed.mark_as_read("n1").await.unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.path, "notifications/n1");
        assert_eq!(event.operation, Operation::Update);
        assert_eq!(event.request_resource_data, Some(json!({"read": true})));
        no_more_events(&mut rx).await;

        assert_eq!(store.get("notifications", "n1").unwrap().data["read"], json!(false));
        assert!(!feed.items()[0].read);
        assert_eq!(feed.unread_count(), 1);
    }

    #[tokio::test]
    async fn test_already_read_is_a_no_op() {
        let store = MemoryStore::new();
        store.seed("notifications", "n1", fixture("a", 1, true));
        let (channel, mut rx) = recording_channel();
        let feed = NotificationFeed::new(Arc::new(store.clone()), channel, 10);

        let _sub = feed.subscribe(10).await;
        wait_for(&feed, |s| s.loaded).await;

        // A store call would be rejected and show up as an event.
        store.deny("notifications", Operation::Update);
        feed.mark_as_read("n1").await.unwrap();
        no_more_events(&mut rx).await;
    }
}

mod mark_read_tests {
    use super::*;

    #[tokio::test]
    async fn test_mark_as_read_updates_store_and_feed() {
        let store = MemoryStore::new();
        store.seed("notifications", "n1", fixture("a", 1, false));
        let (channel, mut rx) = recording_channel();
        let feed = NotificationFeed::new(Arc::new(store.clone()), channel, 10);

        let _sub = feed.subscribe(10).await;
        wait_for(&feed, |s| s.loaded).await;

        feed.mark_as_read("n1").await.unwrap();
        assert_eq!(store.get("notifications", "n1").unwrap().data["read"], json!(true));

        let snapshot = wait_for(&feed, |s| s.unread_count() == 0).await;
        assert!(snapshot.items[0].read);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_mark_all_as_read_marks_every_unread() {
        let store = MemoryStore::new();
        store.seed("notifications", "a", fixture("a", 1, false));
        store.seed("notifications", "b", fixture("b", 2, true));
        store.seed("notifications", "c", fixture("c", 3, false));
        store.seed("notifications", "d", fixture("d", 4, false));
        let (channel, _rx) = recording_channel();
        let feed = NotificationFeed::new(Arc::new(store.clone()), channel, 10);

        let _sub = feed.subscribe(10).await;
        wait_for(&feed, |s| s.loaded && s.unread_count() == 3).await;

        feed.mark_all_as_read().await.unwrap();
        for id in ["a", "b", "c", "d"] {
            assert_eq!(store.get("notifications", id).unwrap().data["read"], json!(true));
        }
        wait_for(&feed, |s| s.unread_count() == 0).await;
    }

    #[tokio::test]
    async fn test_mark_all_denied_reports_each_record() {
        let store = MemoryStore::new();
        store.seed("notifications", "a", fixture("a", 1, false));
        store.seed("notifications", "b", fixture("b", 2, false));
        let (channel, mut rx) = recording_channel();
        let feed = NotificationFeed::new(Arc::new(store.clone()), channel, 10);

        let _sub = feed.subscribe(10).await;
        wait_for(&feed, |s| s.loaded).await;

        store.deny("notifications", Operation::Update);
        feed.mark_all_as_read().await.unwrap();

        let mut paths = vec![rx.try_recv().unwrap().path, rx.try_recv().unwrap().path];
        paths.sort();
        assert_eq!(paths, vec!["notifications/a", "notifications/b"]);
        assert_eq!(feed.unread_count(), 2);
    }
}

mod session_tests {
    use super::*;

    async fn watchers_drop_to(store: &MemoryStore, expected: usize) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while store.watcher_count("notifications") != expected {
            assert!(tokio::time::Instant::now() < deadline, "live query was not closed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_feed_follows_session() {
        let store = MemoryStore::new();
        store.seed("notifications", "a", fixture("a", 1, false));
        let (channel, _rx) = recording_channel();
        let feed = Arc::new(NotificationFeed::new(Arc::new(store.clone()), channel, 10));
        let hub = SessionHub::new();
        let _binding = feed.follow_session(hub.subscribe());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(feed.items().is_empty());
        assert_eq!(feed.open_subscriptions(), 0);

        hub.sign_in(Session::new("u1", Role::Student));
        let snapshot = wait_for(&feed, |s| s.loaded).await;
        assert_eq!(snapshot.items.len(), 1);
        assert_eq!(feed.open_subscriptions(), 1);
        assert_eq!(store.watcher_count("notifications"), 1);

        hub.sign_out();
        let snapshot = wait_for(&feed, |s| !s.loaded && s.items.is_empty()).await;
        assert_eq!(snapshot.unread_count(), 0);
        assert_eq!(feed.open_subscriptions(), 0);
        watchers_drop_to(&store, 0).await;
    }

    #[tokio::test]
    async fn test_unbind_clears_feed() {
        let store = MemoryStore::new();
        store.seed("notifications", "a", fixture("a", 1, false));
        let (channel, _rx) = recording_channel();
        let feed = Arc::new(NotificationFeed::new(Arc::new(store.clone()), channel, 10));
        let hub = SessionHub::new();
        hub.sign_in(Session::new("u1", Role::Student));

        let binding = feed.follow_session(hub.subscribe());
        wait_for(&feed, |s| s.loaded).await;

        binding.unbind();
        assert!(feed.items().is_empty());
        watchers_drop_to(&store, 0).await;
    }
}
