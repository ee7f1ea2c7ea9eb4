//! Events delivered to the presentation layer.
//!
//! Listeners subscribe per [`EventKind`] on the [`EventBus`] and get a
//! [`Subscription`] back; dropping the subscription keeps the listener,
//! calling [`Subscription::unsubscribe`] removes it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use tracing::error;

use messenger_shared::types::{DiscoveredService, MachineId, Message};

pub const EVENT_MESSAGE_RECEIVED: &str = "message-received";
pub const EVENT_PEER_CONNECTED: &str = "peer-connected";
pub const EVENT_PEER_DISCONNECTED: &str = "peer-disconnected";
pub const EVENT_LOCAL_SERVICE_DISCOVERED: &str = "local-service-discovered";
pub const EVENT_LOCAL_SERVICE_LOST: &str = "local-service-lost";
pub const EVENT_LOCAL_SERVER_STARTED: &str = "local-server-started";
pub const EVENT_LOCAL_PEER_CONNECTED: &str = "local-peer-connected";
pub const EVENT_LOCAL_PEER_DISCONNECTED: &str = "local-peer-disconnected";
pub const EVENT_LOCAL_PEER_CONNECTION_FAILED: &str = "local-peer-connection-failed";
pub const EVENT_INTERNET_CONNECTED: &str = "internet-connected";
pub const EVENT_INTERNET_DISCONNECTED: &str = "internet-disconnected";
pub const EVENT_INTERNET_CONNECTION_FAILED: &str = "internet-connection-failed";
pub const EVENT_ROOM_JOINED: &str = "room-joined";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerEventPayload {
    pub username: String,
    pub machine_id: MachineId,
    pub socket_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceLostPayload {
    pub id: MachineId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointPayload {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionFailedPayload {
    pub host: String,
    pub port: u16,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomJoinedPayload {
    pub username: String,
    pub machine_id: MachineId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum MessengerEvent {
    MessageReceived(Message),
    PeerConnected(PeerEventPayload),
    PeerDisconnected(PeerEventPayload),
    LocalServiceDiscovered(DiscoveredService),
    LocalServiceLost(ServiceLostPayload),
    LocalServerStarted { port: u16 },
    LocalPeerConnected(EndpointPayload),
    LocalPeerDisconnected(EndpointPayload),
    LocalPeerConnectionFailed(ConnectionFailedPayload),
    InternetConnected,
    InternetDisconnected,
    InternetConnectionFailed { error: String },
    RoomJoined(RoomJoinedPayload),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    MessageReceived,
    PeerConnected,
    PeerDisconnected,
    LocalServiceDiscovered,
    LocalServiceLost,
    LocalServerStarted,
    LocalPeerConnected,
    LocalPeerDisconnected,
    LocalPeerConnectionFailed,
    InternetConnected,
    InternetDisconnected,
    InternetConnectionFailed,
    RoomJoined,
}

impl EventKind {
    pub const ALL: [EventKind; 13] = [
        EventKind::MessageReceived,
        EventKind::PeerConnected,
        EventKind::PeerDisconnected,
        EventKind::LocalServiceDiscovered,
        EventKind::LocalServiceLost,
        EventKind::LocalServerStarted,
        EventKind::LocalPeerConnected,
        EventKind::LocalPeerDisconnected,
        EventKind::LocalPeerConnectionFailed,
        EventKind::InternetConnected,
        EventKind::InternetDisconnected,
        EventKind::InternetConnectionFailed,
        EventKind::RoomJoined,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::MessageReceived => EVENT_MESSAGE_RECEIVED,
            EventKind::PeerConnected => EVENT_PEER_CONNECTED,
            EventKind::PeerDisconnected => EVENT_PEER_DISCONNECTED,
            EventKind::LocalServiceDiscovered => EVENT_LOCAL_SERVICE_DISCOVERED,
            EventKind::LocalServiceLost => EVENT_LOCAL_SERVICE_LOST,
            EventKind::LocalServerStarted => EVENT_LOCAL_SERVER_STARTED,
            EventKind::LocalPeerConnected => EVENT_LOCAL_PEER_CONNECTED,
            EventKind::LocalPeerDisconnected => EVENT_LOCAL_PEER_DISCONNECTED,
            EventKind::LocalPeerConnectionFailed => EVENT_LOCAL_PEER_CONNECTION_FAILED,
            EventKind::InternetConnected => EVENT_INTERNET_CONNECTED,
            EventKind::InternetDisconnected => EVENT_INTERNET_DISCONNECTED,
            EventKind::InternetConnectionFailed => EVENT_INTERNET_CONNECTION_FAILED,
            EventKind::RoomJoined => EVENT_ROOM_JOINED,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl MessengerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            MessengerEvent::MessageReceived(_) => EventKind::MessageReceived,
            MessengerEvent::PeerConnected(_) => EventKind::PeerConnected,
            MessengerEvent::PeerDisconnected(_) => EventKind::PeerDisconnected,
            MessengerEvent::LocalServiceDiscovered(_) => EventKind::LocalServiceDiscovered,
            MessengerEvent::LocalServiceLost(_) => EventKind::LocalServiceLost,
            MessengerEvent::LocalServerStarted { .. } => EventKind::LocalServerStarted,
            MessengerEvent::LocalPeerConnected(_) => EventKind::LocalPeerConnected,
            MessengerEvent::LocalPeerDisconnected(_) => EventKind::LocalPeerDisconnected,
            MessengerEvent::LocalPeerConnectionFailed(_) => EventKind::LocalPeerConnectionFailed,
            MessengerEvent::InternetConnected => EventKind::InternetConnected,
            MessengerEvent::InternetDisconnected => EventKind::InternetDisconnected,
            MessengerEvent::InternetConnectionFailed { .. } => EventKind::InternetConnectionFailed,
            MessengerEvent::RoomJoined(_) => EventKind::RoomJoined,
        }
    }
}

type Listener = Arc<dyn Fn(&MessengerEvent) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    by_kind: HashMap<EventKind, Vec<(u64, Listener)>>,
}

/// Fan-out of [`MessengerEvent`]s to subscribed listeners.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<Listeners>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> Subscription
    where
        F: Fn(&MessengerEvent) + Send + Sync + 'static,
    {
        let id = match self.inner.lock() {
            Ok(mut guard) => {
                guard.next_id += 1;
                let id = guard.next_id;
                guard
                    .by_kind
                    .entry(kind)
                    .or_default()
                    .push((id, Arc::new(listener)));
                id
            }
            Err(e) => {
                error!(error = %e, "Event listeners poisoned");
                0
            }
        };
        Subscription {
            bus: Arc::downgrade(&self.inner),
            kind,
            id,
        }
    }

    /// Deliver `event` to every listener of its kind.
    ///
    /// Listeners run on the caller's task, outside the lock, so they may
    /// subscribe or unsubscribe.
    pub fn emit(&self, event: &MessengerEvent) {
        let listeners: Vec<Listener> = match self.inner.lock() {
            Ok(guard) => guard
                .by_kind
                .get(&event.kind())
                .map(|l| l.iter().map(|(_, f)| f.clone()).collect())
                .unwrap_or_default(),
            Err(e) => {
                error!(event = %event.kind(), error = %e, "Event listeners poisoned");
                return;
            }
        };
        for listener in listeners {
            listener(event);
        }
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.inner
            .lock()
            .map(|g| g.by_kind.get(&kind).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

/// Disposer returned by [`EventBus::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    bus: Weak<Mutex<Listeners>>,
    kind: EventKind,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        let Some(bus) = self.bus.upgrade() else {
            return;
        };
        let Ok(mut guard) = bus.lock() else {
            return;
        };
        if let Some(listeners) = guard.by_kind.get_mut(&self.kind) {
            listeners.retain(|(id, _)| *id != self.id);
        }
    }
}
