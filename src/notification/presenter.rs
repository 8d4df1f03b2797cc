//! Permission-error presentation.
//!
//! Mounted for the lifetime of a UI surface. Every permission event is
//! logged with its full context; development builds then re-raise it so it
//! fails loudly at the emitting call site, production builds show a
//! dismissible toast instead and carry on.

use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

use super::toast::{NewToast, ToastSink, ToastVariant};
use crate::events::{ErrorChannel, ErrorEvent, ListenerGuard, PermissionErrorEvent, Topic};

pub const PERMISSION_DENIED_TITLE: &str = "Permission denied";
pub const PERMISSION_DENIED_NOTICE: &str = "You do not have permission to perform this action.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresentationMode {
    Development,
    Production,
}

impl PresentationMode {
    /// `production` selects production; anything else is development.
    pub fn from_env_name(name: &str) -> Self {
        if name.trim().eq_ignore_ascii_case("production") {
            PresentationMode::Production
        } else {
            PresentationMode::Development
        }
    }
}

/// Raised by the development presenter.
#[derive(Debug, Error)]
pub enum PresentationError {
    #[error(transparent)]
    PermissionDenied(#[from] PermissionErrorEvent),
}

pub struct PermissionErrorPresenter {
    mode: PresentationMode,
    guard: ListenerGuard,
}

impl PermissionErrorPresenter {
    pub fn mount(
        channel: &Arc<ErrorChannel>,
        mode: PresentationMode,
        toasts: Arc<dyn ToastSink>,
    ) -> Self {
        let guard = channel.subscribe(Topic::PermissionError, move |event| match event {
            ErrorEvent::Permission(event) => present(event, mode, toasts.as_ref()),
        });
        tracing::debug!(?mode, "permission error presenter mounted");
        Self { mode, guard }
    }

    pub fn mode(&self) -> PresentationMode {
        self.mode
    }

    pub fn unmount(mut self) {
        self.guard.release();
        tracing::debug!(mode = ?self.mode, "permission error presenter unmounted");
    }
}

fn present(event: &PermissionErrorEvent, mode: PresentationMode, toasts: &dyn ToastSink) -> anyhow::Result<()> {
    tracing::error!(
        path = %event.path,
        operation = %event.operation,
        context = %event.context(),
        "permission denied by backing store"
    );

    match mode {
        PresentationMode::Development => Err(PresentationError::PermissionDenied(event.clone()).into()),
        PresentationMode::Production => {
            toasts.show(NewToast {
                title: PERMISSION_DENIED_TITLE.to_string(),
                description: PERMISSION_DENIED_NOTICE.to_string(),
                variant: ToastVariant::Destructive,
            });
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::toast::ToastQueue;
    use crate::store::Operation;

    fn denied() -> PermissionErrorEvent {
        PermissionErrorEvent::new("notifications/n1", Operation::Update)
    }

    #[test]
    fn test_mode_from_env_name() {
        assert_eq!(PresentationMode::from_env_name("production"), PresentationMode::Production);
        assert_eq!(PresentationMode::from_env_name("PRODUCTION"), PresentationMode::Production);
        assert_eq!(PresentationMode::from_env_name("staging"), PresentationMode::Development);
        assert_eq!(PresentationMode::from_env_name(""), PresentationMode::Development);
    }

    #[test]
    fn test_development_reraises() {
        let channel = Arc::new(ErrorChannel::new());
        let toasts = Arc::new(ToastQueue::default());
        let _presenter = PermissionErrorPresenter::mount(&channel, PresentationMode::Development, toasts.clone());

        let err = channel.emit(denied()).unwrap_err();
        let raised = err.raised().unwrap().downcast_ref::<PresentationError>().unwrap();
        let PresentationError::PermissionDenied(event) = raised;
        assert_eq!(event.path, "notifications/n1");
        assert!(toasts.visible().is_empty());
    }

    #[test]
    fn test_production_shows_toast() {
        let channel = Arc::new(ErrorChannel::new());
        let toasts = Arc::new(ToastQueue::default());
        let _presenter = PermissionErrorPresenter::mount(&channel, PresentationMode::Production, toasts.clone());

        assert_eq!(channel.emit(denied()).unwrap(), 1);
        let visible = toasts.visible();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].description, PERMISSION_DENIED_NOTICE);
        assert_eq!(visible[0].variant, ToastVariant::Destructive);
    }

    #[test]
    fn test_unmount_deregisters() {
        let channel = Arc::new(ErrorChannel::new());
        let presenter = PermissionErrorPresenter::mount(
            &channel,
            PresentationMode::Development,
            Arc::new(ToastQueue::default()),
        );
        assert_eq!(channel.listener_count(Topic::PermissionError), 1);
        presenter.unmount();
        assert_eq!(channel.listener_count(Topic::PermissionError), 0);
        assert_eq!(channel.emit(denied()).unwrap(), 0);
    }
}
