//! Outbound peer session tracking.
//!
//! Maintains the map of sessions this instance dialed to other mesh
//! endpoints, keyed by `host:port`, plus the dials still in flight. At most
//! one live or pending session exists per key.

use std::collections::{HashMap, HashSet};
use std::net::Ipv6Addr;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info};

use messenger_shared::protocol::WireEvent;
use messenger_shared::types::{now_millis, MachineId};

use crate::error::NetError;
use crate::session::{dial, spawn_session, DialOutcome, DialTarget, SessionEvent, SessionHandle};

/// An established outbound session.
#[derive(Debug, Clone)]
pub struct OutboundSession {
    pub host: String,
    pub port: u16,
    pub handle: SessionHandle,
    /// Unix epoch millis.
    pub connected_at: i64,
    /// Remote identities announced over this session.
    pub announced: HashSet<MachineId>,
}

impl OutboundSession {
    pub fn key(&self) -> String {
        peer_key(&self.host, self.port)
    }
}

/// What a dial outcome turned into.
#[derive(Debug)]
pub enum DialResolution {
    Connected(OutboundSession),
    Failed { host: String, port: u16, error: String },
    /// The dial was cancelled or superseded; its stream was dropped.
    Discarded,
}

pub fn peer_key(host: &str, port: u16) -> String {
    format!("{host}:{port}")
}

/// WebSocket URL for a mesh endpoint. IPv6 literals are bracketed.
pub fn peer_url(host: &str, port: u16) -> String {
    if host.parse::<Ipv6Addr>().is_ok() {
        format!("ws://[{host}]:{port}")
    } else {
        format!("ws://{host}:{port}")
    }
}

/// Tracks all outbound peer sessions.
#[derive(Debug)]
pub struct PeerSessionManager {
    connect_timeout: Duration,
    sessions: HashMap<String, OutboundSession>,
    pending: HashMap<String, (u64, AbortHandle)>,
    next_attempt: u64,
}

impl PeerSessionManager {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            sessions: HashMap::new(),
            pending: HashMap::new(),
            next_attempt: 0,
        }
    }

    /// Start dialing `ws://host:port`.
    ///
    /// The outcome is delivered on `done` and must be handed back to
    /// [`Self::on_dial_outcome`]. Fails with [`NetError::AlreadyConnected`]
    /// when a session or dial for the same key exists.
    pub fn connect(
        &mut self,
        host: &str,
        port: u16,
        done: mpsc::UnboundedSender<DialOutcome>,
    ) -> Result<(), NetError> {
        let key = peer_key(host, port);
        if self.sessions.contains_key(&key) || self.pending.contains_key(&key) {
            debug!(peer = %key, "Already connected to this peer");
            return Err(NetError::AlreadyConnected);
        }

        self.next_attempt += 1;
        let attempt = self.next_attempt;
        let url = peer_url(host, port);
        let timeout = self.connect_timeout;
        let target = DialTarget::Peer {
            host: host.to_string(),
            port,
        };

        debug!(peer = %key, attempt, "Dialing local peer");
        let task = tokio::spawn(async move {
            let result = dial(&url, timeout).await;
            let _ = done.send(DialOutcome {
                attempt,
                target,
                result,
            });
        });

        self.pending.insert(key, (attempt, task.abort_handle()));
        Ok(())
    }

    /// Settle a finished dial. Successful streams become tracked sessions
    /// whose events flow into `session_events`.
    pub fn on_dial_outcome(
        &mut self,
        outcome: DialOutcome,
        session_events: &mpsc::UnboundedSender<SessionEvent>,
    ) -> DialResolution {
        let DialTarget::Peer { host, port } = outcome.target else {
            return DialResolution::Discarded;
        };
        let key = peer_key(&host, port);

        let current = matches!(self.pending.get(&key), Some((attempt, _)) if *attempt == outcome.attempt);
        if !current {
            debug!(peer = %key, attempt = outcome.attempt, "Discarding stale dial outcome");
            return DialResolution::Discarded;
        }
        self.pending.remove(&key);

        match outcome.result {
            Ok(ws) => {
                let handle = spawn_session(ws, session_events.clone());
                let session = OutboundSession {
                    host,
                    port,
                    handle,
                    connected_at: now_millis(),
                    announced: HashSet::new(),
                };
                info!(peer = %key, session = %session.handle.id(), "Connected to local peer");
                self.sessions.insert(key, session.clone());
                DialResolution::Connected(session)
            }
            Err(e) => {
                info!(peer = %key, error = %e, "Failed to connect to local peer");
                DialResolution::Failed {
                    host,
                    port,
                    error: e.to_string(),
                }
            }
        }
    }

    /// Close and forget the session to `host:port`.
    pub fn disconnect(&mut self, host: &str, port: u16) -> Result<OutboundSession, NetError> {
        let key = peer_key(host, port);
        match self.sessions.remove(&key) {
            Some(session) => {
                session.handle.close();
                info!(peer = %key, "Disconnected from local peer");
                Ok(session)
            }
            None => Err(NetError::PeerNotFound),
        }
    }

    /// Forget the session that reported closing, if it is one of ours.
    pub fn on_session_closed(&mut self, session_id: &str) -> Option<OutboundSession> {
        let key = self
            .sessions
            .iter()
            .find(|(_, s)| s.handle.id() == session_id)
            .map(|(k, _)| k.clone())?;
        let session = self.sessions.remove(&key);
        if session.is_some() {
            info!(peer = %key, "Disconnected from local peer");
        }
        session
    }

    pub fn session_mut(&mut self, session_id: &str) -> Option<&mut OutboundSession> {
        self.sessions
            .values_mut()
            .find(|s| s.handle.id() == session_id)
    }

    pub fn contains_session(&self, session_id: &str) -> bool {
        self.sessions.values().any(|s| s.handle.id() == session_id)
    }

    /// Send an event over every outbound session.
    pub fn broadcast(&self, event: &WireEvent) {
        for session in self.sessions.values() {
            session.handle.send(event.clone());
        }
    }

    /// Close every session and cancel every dial in flight.
    pub fn stop_all(&mut self) -> Vec<OutboundSession> {
        for (key, (_, abort)) in self.pending.drain() {
            debug!(peer = %key, "Cancelling dial");
            abort.abort();
        }
        let closed: Vec<OutboundSession> = self.sessions.drain().map(|(_, s)| s).collect();
        for session in &closed {
            session.handle.close();
        }
        closed
    }

    pub fn is_connected(&self, host: &str, port: u16) -> bool {
        self.sessions.contains_key(&peer_key(host, port))
    }

    pub fn is_pending(&self, host: &str, port: u16) -> bool {
        self.pending.contains_key(&peer_key(host, port))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
