use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

/// Default number of toasts visible at once.
pub const DEFAULT_TOAST_LIMIT: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToastVariant {
    Default,
    Destructive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewToast {
    pub title: String,
    pub description: String,
    pub variant: ToastVariant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Toast {
    pub id: u64,
    pub title: String,
    pub description: String,
    pub variant: ToastVariant,
    pub dismissible: bool,
    pub created_at: DateTime<Utc>,
}

/// Where non-blocking notices go.
pub trait ToastSink: Send + Sync {
    fn show(&self, toast: NewToast) -> u64;
}

/// Visible toasts, newest first, capped at `limit`. Older ones fall off.
pub struct ToastQueue {
    limit: usize,
    next_id: AtomicU64,
    visible: watch::Sender<Vec<Toast>>,
}

impl Default for ToastQueue {
    fn default() -> Self {
        Self::new(DEFAULT_TOAST_LIMIT)
    }
}

impl ToastQueue {
    pub fn new(limit: usize) -> Self {
        let (visible, _) = watch::channel(Vec::new());
        Self {
            limit: limit.max(1),
            next_id: AtomicU64::new(1),
            visible,
        }
    }

    pub fn visible(&self) -> Vec<Toast> {
        self.visible.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Toast>> {
        self.visible.subscribe()
    }

    /// Remove a toast. Returns false when it is no longer visible.
    pub fn dismiss(&self, id: u64) -> bool {
        self.visible.send_if_modified(|toasts| {
            let before = toasts.len();
            toasts.retain(|t| t.id != id);
            toasts.len() != before
        })
    }

    pub fn dismiss_all(&self) {
        self.visible.send_if_modified(|toasts| {
            let had_any = !toasts.is_empty();
            toasts.clear();
            had_any
        });
    }
}

impl ToastSink for ToastQueue {
    fn show(&self, toast: NewToast) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let limit = self.limit;
        self.visible.send_modify(|toasts| {
            toasts.insert(
                0,
                Toast {
                    id,
                    title: toast.title,
                    description: toast.description,
                    variant: toast.variant,
                    dismissible: true,
                    created_at: Utc::now(),
                },
            );
            toasts.truncate(limit);
        });
        id
    }
}
