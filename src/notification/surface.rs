//! Everything one UI surface mounts to show notifications: its session,
//! error channel, presenter, toasts and a session-bound feed.
//!
//! Nothing here is shared across surfaces. Dropping the surface unbinds the
//! feed, closes its subscription and unmounts the presenter.

use std::sync::Arc;
use std::time::Duration;

use super::feed::{FeedSnapshot, NotificationFeed, SessionBinding};
use super::presenter::{PermissionErrorPresenter, PresentationMode};
use super::toast::{Toast, ToastQueue};
use crate::events::ErrorChannel;
use crate::models::session::Session;
use crate::session::SessionHub;
use crate::store::DocumentStore;

pub struct NotificationSurface {
    // Field order is drop order: stop following the session first, then
    // take the presenter off the channel.
    binding: SessionBinding,
    presenter: PermissionErrorPresenter,
    session: SessionHub,
    channel: Arc<ErrorChannel>,
    toasts: Arc<ToastQueue>,
    feed: Arc<NotificationFeed>,
}

impl NotificationSurface {
    pub fn mount(
        store: Arc<dyn DocumentStore>,
        mode: PresentationMode,
        feed_limit: usize,
        toast_limit: usize,
    ) -> Self {
        let session = SessionHub::new();
        let channel = Arc::new(ErrorChannel::new());
        let toasts = Arc::new(ToastQueue::new(toast_limit));
        let presenter = PermissionErrorPresenter::mount(&channel, mode, toasts.clone());
        let feed = Arc::new(NotificationFeed::new(store, channel.clone(), feed_limit));
        let binding = feed.follow_session(session.subscribe());

        Self {
            binding,
            presenter,
            session,
            channel,
            toasts,
            feed,
        }
    }

    pub fn session(&self) -> &SessionHub {
        &self.session
    }

    pub fn sign_in(&self, session: Session) {
        self.session.sign_in(session);
    }

    pub fn sign_out(&self) {
        self.session.sign_out();
    }

    pub fn channel(&self) -> &Arc<ErrorChannel> {
        &self.channel
    }

    pub fn feed(&self) -> &Arc<NotificationFeed> {
        &self.feed
    }

    pub fn toasts(&self) -> &Arc<ToastQueue> {
        &self.toasts
    }

    pub fn visible_toasts(&self) -> Vec<Toast> {
        self.toasts.visible()
    }

    pub fn mode(&self) -> PresentationMode {
        self.presenter.mode()
    }

    /// Wait until the current subscription delivered (or failed) once.
    /// Returns the snapshot, or `None` on timeout.
    pub async fn loaded(&self, timeout: Duration) -> Option<FeedSnapshot> {
        let mut updates = self.feed.updates();
        let waited = tokio::time::timeout(timeout, updates.wait_for(|s| s.loaded)).await;
        match waited {
            Ok(Ok(snapshot)) => Some(snapshot.clone()),
            _ => None,
        }
    }

    /// Tear down in order: feed first, then the presenter.
    pub fn unmount(self) {
        let Self {
            binding, presenter, ..
        } = self;
        binding.unbind();
        presenter.unmount();
    }
}
