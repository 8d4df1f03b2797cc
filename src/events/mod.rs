//! Error Channel: typed publish/subscribe bus between data-access code and
//! UI listeners.

pub mod channel;
pub mod permission;

pub use channel::{ChannelError, ErrorChannel, ListenerGuard, ListenerId};
pub use permission::PermissionErrorEvent;

/// Named channel on the [`ErrorChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    PermissionError,
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Topic::PermissionError => f.write_str("permission-error"),
        }
    }
}

/// Payloads carried by the channel; each variant belongs to exactly one topic.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorEvent {
    Permission(PermissionErrorEvent),
}

impl ErrorEvent {
    pub fn topic(&self) -> Topic {
        match self {
            ErrorEvent::Permission(_) => Topic::PermissionError,
        }
    }
}

impl From<PermissionErrorEvent> for ErrorEvent {
    fn from(event: PermissionErrorEvent) -> Self {
        ErrorEvent::Permission(event)
    }
}
