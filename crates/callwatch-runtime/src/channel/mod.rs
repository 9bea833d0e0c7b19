//! Session-scoped push channel.
//!
//! [`SessionChannelManager`] owns at most one transport link, bound to the
//! current session credential. On top of that link it tracks the joined
//! business room, fans escalation events out to registered observers, and
//! sends takeover commands at most once.
//!
//! The wire transport sits behind [`Transport`] / [`TransportLink`] so the
//! lifecycle rules can be tested without a server.

pub mod socketio;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use callwatch_core::{BusinessId, CallId, ClientCommand, EscalationEvent, SessionCredential};

use crate::error::ChannelError;

pub use socketio::SocketIoTransport;

/// Opens links. One link per credential at a time.
pub trait Transport: Send + Sync + 'static {
    fn open(&self, credential: &SessionCredential, sink: EventSink) -> Box<dyn TransportLink>;
}

/// A live (or reconnecting) connection.
pub trait TransportLink: Send + Sync {
    /// True between a successful Socket.IO connect and the next disconnect.
    fn is_connected(&self) -> bool;

    /// Subscribe to a business room. The link remembers it and re-joins
    /// after every reconnect.
    fn join(&self, business: &BusinessId);

    /// Send a command once. Fails when the link is not currently connected.
    fn emit(&self, command: ClientCommand) -> Result<(), ChannelError>;

    fn close(self: Box<Self>);
}

pub type ObserverId = u64;

type Handler = Box<dyn Fn(&EscalationEvent) + Send + Sync>;

#[derive(Default)]
struct SinkShared {
    /// Generation of the link allowed to deliver; 0 = none.
    live: AtomicU64,
    observers: Mutex<Vec<(ObserverId, Handler)>>,
    next_observer: AtomicU64,
}

impl SinkShared {
    fn observers(&self) -> MutexGuard<'_, Vec<(ObserverId, Handler)>> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handed to a link so it can deliver escalation events. Events from a link
/// that has been closed or replaced are dropped.
#[derive(Clone)]
pub struct EventSink {
    shared: Arc<SinkShared>,
    generation: u64,
}

impl EventSink {
    /// Runs every observer in registration order. Returns false when this
    /// sink's link is no longer the live one.
    ///
    /// Observers run under the observer lock; they must not register or
    /// remove observers themselves.
    pub fn dispatch(&self, event: &EscalationEvent) -> bool {
        let observers = self.shared.observers();
        if self.shared.live.load(Ordering::Acquire) != self.generation {
            tracing::debug!(call_id = %event.call_id, "channel: event from superseded link dropped");
            return false;
        }
        for (_, handler) in observers.iter() {
            handler(event);
        }
        true
    }
}

/// Result of [`SessionChannelManager::join`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    AlreadyJoined,
    /// A different room was joined before; the link was reopened first.
    ScopeChanged,
    NotConnected,
}

/// Snapshot of the manager for status reporting.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ChannelStatus {
    pub linked: bool,
    pub connected: bool,
    pub room: Option<BusinessId>,
    pub observers: usize,
}

struct ActiveLink {
    credential: SessionCredential,
    link: Box<dyn TransportLink>,
}

pub struct SessionChannelManager {
    transport: Arc<dyn Transport>,
    sink: Arc<SinkShared>,
    generation: u64,
    active: Option<ActiveLink>,
    room: Option<BusinessId>,
}

impl SessionChannelManager {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            sink: Arc::new(SinkShared::default()),
            generation: 0,
            active: None,
            room: None,
        }
    }

    /// Establish the link for `credential`, reusing the live one when it is
    /// already bound to the same credential.
    pub fn connect(&mut self, credential: &SessionCredential) {
        if let Some(active) = &self.active {
            if &active.credential == credential {
                return;
            }
            tracing::info!("channel: credential changed, replacing link");
            self.close_link();
            self.room = None;
        }
        self.open_link(credential.clone());
    }

    /// Tear everything down. Safe to call repeatedly.
    pub fn disconnect(&mut self) {
        if self.active.is_some() {
            tracing::info!("channel: disconnecting");
        }
        self.close_link();
        self.room = None;
        self.sink.observers().clear();
    }

    pub fn join(&mut self, business: &BusinessId) -> JoinOutcome {
        let Some(credential) = self.active.as_ref().map(|a| a.credential.clone()) else {
            tracing::warn!(business = %business, "channel: join without a link");
            return JoinOutcome::NotConnected;
        };

        match self.room.clone() {
            Some(current) if &current == business => JoinOutcome::AlreadyJoined,
            Some(previous) => {
                // Rooms are additive server-side; only a fresh socket drops the old one.
                tracing::info!(from = %previous, to = %business, "channel: scope changed, reopening link");
                self.close_link();
                self.open_link(credential);
                self.join_on_link(business);
                JoinOutcome::ScopeChanged
            }
            None => {
                self.join_on_link(business);
                JoinOutcome::Joined
            }
        }
    }

    /// Drop the room subscription, keeping the session connected.
    pub fn leave(&mut self) {
        if self.room.take().is_none() {
            return;
        }
        if let Some(credential) = self.active.as_ref().map(|a| a.credential.clone()) {
            tracing::info!("channel: scope cleared, reopening link without a room");
            self.close_link();
            self.open_link(credential);
        }
    }

    pub fn on_escalation<F>(&self, handler: F) -> ObserverId
    where
        F: Fn(&EscalationEvent) + Send + Sync + 'static,
    {
        let id = self.sink.next_observer.fetch_add(1, Ordering::Relaxed) + 1;
        self.sink.observers().push((id, Box::new(handler)));
        id
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut observers = self.sink.observers();
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        observers.len() != before
    }

    /// Ask the backend to hand the call to a human. Sent once; the backend
    /// gives no acknowledgment.
    ///
    /// `Ok` means the command was queued on a link that looked connected. A
    /// socket that dies without a close frame is only noticed at the next
    /// missed heartbeat, and a command queued in that gap is dropped when
    /// the link reconnects.
    pub fn request_takeover(&self, call_id: &CallId, phone_number: &str) -> Result<(), ChannelError> {
        if call_id.as_str().is_empty() {
            return Err(ChannelError::InvalidRequest("call id is empty"));
        }
        if phone_number.trim().is_empty() {
            return Err(ChannelError::InvalidRequest("phone number is empty"));
        }
        let Some(active) = &self.active else {
            return Err(ChannelError::TransportUnavailable("not connected"));
        };
        if !active.link.is_connected() {
            return Err(ChannelError::TransportUnavailable("reconnecting"));
        }
        active.link.emit(ClientCommand::RequestTakeover {
            call_id: call_id.clone(),
            phone_number: phone_number.trim().to_string(),
        })?;
        tracing::info!(call_id = %call_id, "channel: takeover requested");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.active.as_ref().is_some_and(|a| a.link.is_connected())
    }

    pub fn room(&self) -> Option<&BusinessId> {
        self.room.as_ref()
    }

    pub fn status(&self) -> ChannelStatus {
        ChannelStatus {
            linked: self.active.is_some(),
            connected: self.is_connected(),
            room: self.room().cloned(),
            observers: self.sink.observers().len(),
        }
    }

    fn open_link(&mut self, credential: SessionCredential) {
        self.generation += 1;
        self.sink.live.store(self.generation, Ordering::Release);
        let sink = EventSink {
            shared: Arc::clone(&self.sink),
            generation: self.generation,
        };
        let link = self.transport.open(&credential, sink);
        self.active = Some(ActiveLink { credential, link });
    }

    fn close_link(&mut self) {
        if let Some(active) = self.active.take() {
            // Waits for an in-flight dispatch before the link is closed.
            let guard = self.sink.observers();
            self.sink.live.store(0, Ordering::Release);
            drop(guard);
            active.link.close();
        }
    }

    fn join_on_link(&mut self, business: &BusinessId) {
        if let Some(active) = &self.active {
            active.link.join(business);
            self.room = Some(business.clone());
            tracing::info!(business = %business, "channel: joined business room");
        }
    }
}

impl Drop for SessionChannelManager {
    fn drop(&mut self) {
        self.close_link();
    }
}
