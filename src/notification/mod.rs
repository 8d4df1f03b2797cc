pub mod feed;
pub mod presenter;
pub mod surface;
pub mod toast;

pub use feed::{FeedSnapshot, FeedSubscription, NotificationFeed, SessionBinding};
pub use presenter::{PermissionErrorPresenter, PresentationError, PresentationMode};
pub use surface::NotificationSurface;
pub use toast::{NewToast, Toast, ToastQueue, ToastSink, ToastVariant};
