//! Synchronous, multi-producer/multi-consumer error bus.
//!
//! - `emit` runs every handler registered for the event's topic, in
//!   registration order, on the caller's thread.
//! - A handler returning `Err` stops dispatch; the error reaches the caller.
//! - Nothing is buffered: with no listeners the event is dropped.
//! - Emitting to a topic from inside one of its own handlers is rejected
//!   with [`ChannelError::Reentrant`].

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;

use super::{ErrorEvent, Topic};

pub type Handler = Arc<dyn Fn(&ErrorEvent) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("listener {listener} on {topic} raised: {source}")]
    ListenerRaised {
        topic: Topic,
        listener: ListenerId,
        #[source]
        source: anyhow::Error,
    },

    #[error("reentrant emit on {0} while it is being dispatched")]
    Reentrant(Topic),
}

impl ChannelError {
    /// The error a listener raised, if that is what stopped dispatch.
    pub fn raised(&self) -> Option<&anyhow::Error> {
        match self {
            ChannelError::ListenerRaised { source, .. } => Some(source),
            ChannelError::Reentrant(_) => None,
        }
    }
}

struct Registration {
    id: ListenerId,
    topic: Topic,
    handler: Handler,
}

static NEXT_CHANNEL: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// (channel, topic) pairs currently dispatching on this thread.
    static DISPATCHING: RefCell<Vec<(u64, Topic)>> = const { RefCell::new(Vec::new()) };
}

/// Pops the dispatch marker even when a handler panics.
struct DispatchMarker {
    channel: u64,
    topic: Topic,
}

impl DispatchMarker {
    fn enter(channel: u64, topic: Topic) -> Option<Self> {
        DISPATCHING.with(|active| {
            let mut active = active.borrow_mut();
            if active.contains(&(channel, topic)) {
                return None;
            }
            active.push((channel, topic));
            Some(Self { channel, topic })
        })
    }
}

impl Drop for DispatchMarker {
    fn drop(&mut self) {
        DISPATCHING.with(|active| {
            let mut active = active.borrow_mut();
            if let Some(pos) = active.iter().rposition(|e| *e == (self.channel, self.topic)) {
                active.remove(pos);
            }
        });
    }
}

pub struct ErrorChannel {
    key: u64,
    next_listener: AtomicU64,
    registrations: RwLock<Vec<Registration>>,
}

impl Default for ErrorChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorChannel {
    pub fn new() -> Self {
        Self {
            key: NEXT_CHANNEL.fetch_add(1, Ordering::Relaxed),
            next_listener: AtomicU64::new(1),
            registrations: RwLock::new(Vec::new()),
        }
    }

    /// Register `handler` for `topic`. Pair with [`ErrorChannel::off`].
    pub fn on<F>(&self, topic: Topic, handler: F) -> ListenerId
    where
        F: Fn(&ErrorEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        let mut regs = self.registrations.write().unwrap_or_else(PoisonError::into_inner);
        regs.push(Registration {
            id,
            topic,
            handler: Arc::new(handler),
        });
        tracing::debug!(%topic, listener = %id, "error channel listener registered");
        id
    }

    /// Deregister a listener. Returns false if it was not registered.
    pub fn off(&self, topic: Topic, id: ListenerId) -> bool {
        let mut regs = self.registrations.write().unwrap_or_else(PoisonError::into_inner);
        let before = regs.len();
        regs.retain(|r| !(r.id == id && r.topic == topic));
        let removed = regs.len() != before;
        if removed {
            tracing::debug!(%topic, listener = %id, "error channel listener removed");
        }
        removed
    }

    /// Register a listener that is removed when the returned guard drops.
    pub fn subscribe<F>(self: &Arc<Self>, topic: Topic, handler: F) -> ListenerGuard
    where
        F: Fn(&ErrorEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.on(topic, handler);
        ListenerGuard {
            channel: self.clone(),
            topic,
            id: Some(id),
        }
    }

    pub fn listener_count(&self, topic: Topic) -> usize {
        let regs = self.registrations.read().unwrap_or_else(PoisonError::into_inner);
        regs.iter().filter(|r| r.topic == topic).count()
    }

    /// Deliver `event` to the listeners of its topic. Returns how many
    /// listeners ran to completion.
    pub fn emit(&self, event: impl Into<ErrorEvent>) -> Result<usize, ChannelError> {
        let event = event.into();
        let topic = event.topic();

        let _marker = DispatchMarker::enter(self.key, topic).ok_or_else(|| {
            tracing::error!(%topic, "reentrant emit rejected");
            ChannelError::Reentrant(topic)
        })?;

        // Snapshot so handlers may register or deregister while we dispatch.
        let handlers: Vec<(ListenerId, Handler)> = {
            let regs = self.registrations.read().unwrap_or_else(PoisonError::into_inner);
            regs.iter()
                .filter(|r| r.topic == topic)
                .map(|r| (r.id, r.handler.clone()))
                .collect()
        };

        if handlers.is_empty() {
            tracing::debug!(%topic, "no listeners, event dropped");
            return Ok(0);
        }

        for (delivered, (id, handler)) in handlers.iter().enumerate() {
            if let Err(source) = handler(&event) {
                tracing::debug!(%topic, listener = %id, delivered, "listener raised, dispatch stopped");
                return Err(ChannelError::ListenerRaised {
                    topic,
                    listener: *id,
                    source,
                });
            }
        }

        Ok(handlers.len())
    }
}

/// Scoped registration; deregisters on drop.
pub struct ListenerGuard {
    channel: Arc<ErrorChannel>,
    topic: Topic,
    id: Option<ListenerId>,
}

impl ListenerGuard {
    pub fn id(&self) -> Option<ListenerId> {
        self.id
    }

    /// Deregister now. Safe to call more than once.
    pub fn release(&mut self) {
        if let Some(id) = self.id.take() {
            self.channel.off(self.topic, id);
        }
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::PermissionErrorEvent;
    use crate::store::Operation;
    use std::sync::Mutex;

    fn event() -> PermissionErrorEvent {
        PermissionErrorEvent::new("notifications", Operation::List)
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let channel = ErrorChannel::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for label in ["first", "second", "third"] {
            let seen = seen.clone();
            channel.on(Topic::PermissionError, move |_| {
                seen.lock().unwrap().push(label);
                Ok(())
            });
        }

        assert_eq!(channel.emit(event()).unwrap(), 3);
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_no_listeners_drops_event() {
        let channel = ErrorChannel::new();
        assert_eq!(channel.emit(event()).unwrap(), 0);

        // Registering afterwards does not replay anything.
        let hits = Arc::new(Mutex::new(0));
        let h = hits.clone();
        channel.on(Topic::PermissionError, move |_| {
            *h.lock().unwrap() += 1;
            Ok(())
        });
        assert_eq!(*hits.lock().unwrap(), 0);
    }

    #[test]
    fn test_raising_listener_stops_dispatch() {
        let channel = ErrorChannel::new();
        let later = Arc::new(Mutex::new(false));
        let raiser = channel.on(Topic::PermissionError, |_| anyhow::bail!("boom"));
        let l = later.clone();
        channel.on(Topic::PermissionError, move |_| {
            *l.lock().unwrap() = true;
            Ok(())
        });

        let err = channel.emit(event()).unwrap_err();
        match &err {
            ChannelError::ListenerRaised { listener, .. } => assert_eq!(*listener, raiser),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(err.raised().unwrap().to_string(), "boom");
        assert!(!*later.lock().unwrap());
    }

    #[test]
    fn test_off_removes_listener() {
        let channel = ErrorChannel::new();
        let id = channel.on(Topic::PermissionError, |_| Ok(()));
        assert!(channel.off(Topic::PermissionError, id));
        assert!(!channel.off(Topic::PermissionError, id));
        assert_eq!(channel.listener_count(Topic::PermissionError), 0);
    }

    #[test]
    fn test_guard_deregisters_on_drop() {
        let channel = Arc::new(ErrorChannel::new());
        {
            let _guard = channel.subscribe(Topic::PermissionError, |_| Ok(()));
            assert_eq!(channel.listener_count(Topic::PermissionError), 1);
        }
        assert_eq!(channel.listener_count(Topic::PermissionError), 0);
    }

    #[test]
    fn test_reentrant_emit_rejected() {
        let channel = Arc::new(ErrorChannel::new());
        let inner = Arc::new(Mutex::new(None));
        let weak = Arc::downgrade(&channel);
        let slot = inner.clone();
        channel.on(Topic::PermissionError, move |ev| {
            if let Some(ch) = weak.upgrade() {
                *slot.lock().unwrap() = Some(ch.emit(ev.clone()));
            }
            Ok(())
        });

        assert_eq!(channel.emit(event()).unwrap(), 1);
        let nested = inner.lock().unwrap().take().unwrap();
        assert!(matches!(nested, Err(ChannelError::Reentrant(Topic::PermissionError))));

        // Marker is cleared once dispatch returns.
        assert_eq!(channel.emit(event()).unwrap(), 1);
    }

    #[test]
    fn test_handler_may_deregister_during_dispatch() {
        let channel = Arc::new(ErrorChannel::new());
        let weak = Arc::downgrade(&channel);
        let own_id = Arc::new(Mutex::new(None::<ListenerId>));
        let slot = own_id.clone();
        let id = channel.on(Topic::PermissionError, move |_| {
            if let (Some(ch), Some(id)) = (weak.upgrade(), *slot.lock().unwrap()) {
                ch.off(Topic::PermissionError, id);
            }
            Ok(())
        });
        *own_id.lock().unwrap() = Some(id);

        assert_eq!(channel.emit(event()).unwrap(), 1);
        assert_eq!(channel.emit(event()).unwrap(), 0);
    }
}
