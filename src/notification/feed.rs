//! Live notification feed for the active session.
//!
//! The feed keeps the newest `limit` records of the `notifications`
//! collection. Each delivery from the store replaces the whole list; the
//! list is normalised (deduplicated by id, `created_at` descending, capped)
//! before it is published, so readers never observe a partial update.
//!
//! Authorization failures never reach the caller as store errors: they are
//! turned into [`PermissionErrorEvent`]s on the [`ErrorChannel`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::join_all;
use futures::StreamExt;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::events::{ChannelError, ErrorChannel, PermissionErrorEvent};
use crate::metrics;
use crate::models::notification::NotificationRecord;
use crate::models::session::Session;
use crate::session::SessionObserver;
use crate::store::{document_path, Document, DocumentStore, LiveQuery, Operation, SnapshotStream, StoreError};

pub const NOTIFICATIONS_COLLECTION: &str = "notifications";
pub const DEFAULT_FEED_LIMIT: usize = 10;
const ORDER_FIELD: &str = "created_at";

/// What readers of the feed see.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeedSnapshot {
    pub items: Vec<NotificationRecord>,
    /// False until the current subscription delivered (or failed) once.
    pub loaded: bool,
}

impl FeedSnapshot {
    pub fn unread_count(&self) -> usize {
        self.items.iter().filter(|r| !r.read).count()
    }

    fn is_read(&self, id: &str) -> bool {
        self.items.iter().any(|r| r.id == id && r.read)
    }
}

/// Shared between the feed and its pump tasks.
///
/// Every subscription runs under a generation number; a pump only publishes
/// while its generation is current, so a late delivery from a closed
/// subscription can never overwrite a cleared feed.
struct FeedState {
    generation: Mutex<u64>,
    snapshot: watch::Sender<FeedSnapshot>,
    open: AtomicUsize,
}

impl FeedState {
    fn new() -> Self {
        let (snapshot, _) = watch::channel(FeedSnapshot::default());
        Self {
            generation: Mutex::new(0),
            snapshot,
            open: AtomicUsize::new(0),
        }
    }

    /// Start a new generation with an empty, not-yet-loaded feed.
    fn reset(&self) -> u64 {
        let mut generation = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        *generation += 1;
        self.snapshot.send_replace(FeedSnapshot::default());
        *generation
    }

    fn publish(&self, generation: u64, items: Vec<NotificationRecord>) -> bool {
        let current = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != generation {
            return false;
        }
        self.snapshot.send_replace(FeedSnapshot { items, loaded: true });
        true
    }
}

/// Decode, deduplicate, order and cap one delivery.
fn normalize(docs: Vec<Document>, limit: usize) -> Vec<NotificationRecord> {
    let mut seen = HashSet::new();
    let mut items: Vec<NotificationRecord> = docs
        .into_iter()
        .filter_map(|doc| {
            let id = doc.id.clone();
            match NotificationRecord::from_document(doc) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!(id = %id, error = %e, "skipping malformed notification");
                    None
                }
            }
        })
        .filter(|r| seen.insert(r.id.clone()))
        .collect();

    items.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
    items.truncate(limit);
    items
}

/// Convert an authorization failure into a channel event. Other failures
/// are only logged. Returns the channel outcome for the caller to decide
/// whether a raised listener error matters to it.
fn report(channel: &ErrorChannel, err: StoreError, event: PermissionErrorEvent) -> Result<(), ChannelError> {
    if !err.is_permission_denied() {
        tracing::warn!(path = %event.path, operation = %event.operation, error = %err, "notification store request failed");
        return Ok(());
    }
    metrics::global().permission_error(event.operation);
    channel.emit(event).map(|_| ())
}

async fn pump(
    mut stream: SnapshotStream,
    state: Arc<FeedState>,
    channel: Arc<ErrorChannel>,
    generation: u64,
    limit: usize,
) {
    while let Some(delivery) = stream.next().await {
        match delivery {
            Ok(docs) => {
                let items = normalize(docs, limit);
                tracing::debug!(count = items.len(), generation, "notification snapshot received");
                if !state.publish(generation, items) {
                    return;
                }
                metrics::global().feed_delivery();
            }
            Err(err) => {
                fail_list(&state, &channel, generation, err);
                return;
            }
        }
    }
    tracing::debug!(generation, "notification live query ended");
}

fn fail_list(state: &FeedState, channel: &ErrorChannel, generation: u64, err: StoreError) {
    if !state.publish(generation, Vec::new()) {
        return;
    }
    let event = PermissionErrorEvent::new(NOTIFICATIONS_COLLECTION, Operation::List);
    if let Err(raised) = report(channel, err, event) {
        tracing::error!(error = %raised, "notification subscription failure raised by listener");
    }
}

/// Handle to an open live query. Closing is idempotent and also happens on
/// drop.
pub struct FeedSubscription {
    task: Option<JoinHandle<()>>,
    closed: AtomicBool,
    state: Arc<FeedState>,
}

impl FeedSubscription {
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = &self.task {
            task.abort();
            self.state.open.fetch_sub(1, Ordering::AcqRel);
        }
        tracing::debug!("notification subscription closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Receives every published snapshot.
    pub fn updates(&self) -> watch::Receiver<FeedSnapshot> {
        self.state.snapshot.subscribe()
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct NotificationFeed {
    store: Arc<dyn DocumentStore>,
    channel: Arc<ErrorChannel>,
    limit: usize,
    state: Arc<FeedState>,
}

impl NotificationFeed {
    pub fn new(store: Arc<dyn DocumentStore>, channel: Arc<ErrorChannel>, limit: usize) -> Self {
        Self {
            store,
            channel,
            limit,
            state: Arc::new(FeedState::new()),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Open a live query for the newest `limit` notifications. A `limit` of
    /// zero opens an empty window that still reports `loaded`.
    ///
    /// Never fails: a rejected query leaves the feed empty and publishes a
    /// `list` permission event instead.
    pub async fn subscribe(&self, limit: usize) -> FeedSubscription {
        let generation = self.state.reset();
        let query = LiveQuery::newest_first(NOTIFICATIONS_COLLECTION, ORDER_FIELD, limit);

        match self.store.watch(query).await {
            Ok(stream) => {
                self.state.open.fetch_add(1, Ordering::AcqRel);
                let task = tokio::spawn(pump(
                    stream,
                    self.state.clone(),
                    self.channel.clone(),
                    generation,
                    limit,
                ));
                tracing::debug!(limit, generation, "notification subscription opened");
                FeedSubscription {
                    task: Some(task),
                    closed: AtomicBool::new(false),
                    state: self.state.clone(),
                }
            }
            Err(err) => {
                fail_list(&self.state, &self.channel, generation, err);
                FeedSubscription {
                    task: None,
                    closed: AtomicBool::new(true),
                    state: self.state.clone(),
                }
            }
        }
    }

    /// Empty the feed and detach any running subscription from it.
    pub fn clear(&self) {
        self.state.reset();
    }

    pub fn snapshot(&self) -> FeedSnapshot {
        self.state.snapshot.borrow().clone()
    }

    pub fn items(&self) -> Vec<NotificationRecord> {
        self.state.snapshot.borrow().items.clone()
    }

    pub fn unread_count(&self) -> usize {
        self.state.snapshot.borrow().unread_count()
    }

    pub fn updates(&self) -> watch::Receiver<FeedSnapshot> {
        self.state.snapshot.subscribe()
    }

    /// Number of subscriptions currently open on this feed.
    pub fn open_subscriptions(&self) -> usize {
        self.state.open.load(Ordering::Acquire)
    }

    /// Set `read = true` on one record.
    ///
    /// A record the feed already shows as read is left alone. A permission
    /// rejection is published on the channel and the local flag is not
    /// touched; the only error returned is a listener raising on that event.
    pub async fn mark_as_read(&self, id: &str) -> Result<(), ChannelError> {
        if self.state.snapshot.borrow().is_read(id) {
            tracing::debug!(id, "notification already read");
            return Ok(());
        }

        let mut fields = Map::new();
        fields.insert("read".into(), Value::Bool(true));
        let patch = Value::Object(fields.clone());

        match self.store.update(NOTIFICATIONS_COLLECTION, id, fields).await {
            Ok(()) => {
                tracing::debug!(id, "notification marked as read");
                Ok(())
            }
            Err(err) => {
                let event = PermissionErrorEvent::new(document_path(NOTIFICATIONS_COLLECTION, id), Operation::Update)
                    .with_request_data(patch);
                report(&self.channel, err, event)
            }
        }
    }

    /// Mark every unread record in the current feed. Updates are issued
    /// together and succeed or fail independently; the first listener error
    /// (if any) is returned after all of them settle.
    pub async fn mark_all_as_read(&self) -> Result<(), ChannelError> {
        let unread: Vec<String> = self
            .state
            .snapshot
            .borrow()
            .items
            .iter()
            .filter(|r| !r.read)
            .map(|r| r.id.clone())
            .collect();

        if unread.is_empty() {
            return Ok(());
        }
        tracing::debug!(count = unread.len(), "marking all notifications as read");

        let results = join_all(unread.iter().map(|id| self.mark_as_read(id))).await;
        results.into_iter().find_map(Result::err).map_or(Ok(()), Err)
    }

    /// Drive the feed from a session observer: subscribe while a user is
    /// signed in, close and clear when they sign out or the user changes.
    pub fn follow_session(self: &Arc<Self>, observer: SessionObserver) -> SessionBinding {
        let feed = self.clone();
        let task = tokio::spawn(follow(feed, observer));
        SessionBinding {
            task,
            feed: self.clone(),
        }
    }
}

async fn follow(feed: Arc<NotificationFeed>, mut observer: SessionObserver) {
    let mut active: Option<(String, FeedSubscription)> = None;

    loop {
        let session: Option<Session> = observer.borrow_and_update().clone();
        let current_user = active.as_ref().map(|(user, _)| user.clone());
        match session {
            Some(session) if current_user.as_deref() == Some(session.user_id.as_str()) => {}
            Some(session) => {
                if let Some((_, previous)) = active.take() {
                    previous.close();
                }
                tracing::debug!(user_id = %session.user_id, "session active, opening notification feed");
                let subscription = feed.subscribe(feed.limit).await;
                active = Some((session.user_id, subscription));
            }
            None => {
                if let Some((user, subscription)) = active.take() {
                    tracing::debug!(user_id = %user, "session ended, closing notification feed");
                    subscription.close();
                }
                feed.clear();
            }
        }

        if observer.changed().await.is_err() {
            break;
        }
    }

    if let Some((_, subscription)) = active.take() {
        subscription.close();
    }
    feed.clear();
}

/// Keeps a feed bound to a session observer. Dropping it stops following,
/// closes the subscription and clears the feed.
pub struct SessionBinding {
    task: JoinHandle<()>,
    feed: Arc<NotificationFeed>,
}

impl SessionBinding {
    pub fn unbind(self) {
        drop(self);
    }
}

impl Drop for SessionBinding {
    fn drop(&mut self) {
        self.task.abort();
        self.feed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;

    fn doc(id: &str, minute: i64, read: bool) -> Document {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap() + Duration::minutes(minute);
        Document {
            id: id.to_string(),
            data: json!({"message": id, "created_at": ts, "read": read})
                .as_object()
                .cloned()
                .unwrap(),
        }
    }

    #[test]
    fn test_normalize_sorts_dedupes_and_caps() {
        let docs = vec![
            doc("a", 1, false),
            doc("c", 3, false),
            doc("b", 2, true),
            doc("c", 0, false),
            doc("d", 4, false),
        ];
        let items = normalize(docs, 3);
        let ids: Vec<_> = items.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["d", "c", "b"]);
    }

    #[test]
    fn test_normalize_skips_malformed() {
        let mut bad = doc("bad", 5, false);
        bad.data.remove("message");
        let items = normalize(vec![bad, doc("ok", 1, false)], 10);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "ok");
    }

    #[test]
    fn test_stale_generation_cannot_publish() {
        let state = FeedState::new();
        let first = state.reset();
        let second = state.reset();
        assert!(!state.publish(first, normalize(vec![doc("a", 1, false)], 10)));
        assert!(state.snapshot.borrow().items.is_empty());
        assert!(state.publish(second, normalize(vec![doc("a", 1, false)], 10)));
        assert_eq!(state.snapshot.borrow().unread_count(), 1);
    }
}
