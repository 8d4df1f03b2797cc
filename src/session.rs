//! Session state observer.
//!
//! The authentication collaborator pushes sign-in / sign-out transitions
//! into a [`SessionHub`]; consumers (the notification feed, headers, admin
//! gating) hold a [`SessionObserver`] and react to changes instead of
//! re-reading storage on every navigation.

use std::sync::Arc;

use tokio::sync::watch;

use crate::models::session::Session;

pub type SessionObserver = watch::Receiver<Option<Session>>;

#[derive(Clone)]
pub struct SessionHub {
    state: Arc<watch::Sender<Option<Session>>>,
}

impl Default for SessionHub {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionHub {
    pub fn new() -> Self {
        let (state, _) = watch::channel(None);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn sign_in(&self, session: Session) {
        tracing::info!(user_id = %session.user_id, role = ?session.role, "session started");
        self.state.send_replace(Some(session));
    }

    pub fn sign_out(&self) {
        if let Some(previous) = self.state.send_replace(None) {
            tracing::info!(user_id = %previous.user_id, "session ended");
        }
    }

    pub fn current(&self) -> Option<Session> {
        self.state.borrow().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.borrow().is_some()
    }

    pub fn is_admin(&self) -> bool {
        self.state.borrow().as_ref().is_some_and(Session::is_admin)
    }

    pub fn subscribe(&self) -> SessionObserver {
        self.state.subscribe()
    }
}
