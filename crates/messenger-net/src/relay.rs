use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info};

use messenger_shared::protocol::WireEvent;

use crate::session::{dial, spawn_session, DialOutcome, DialTarget, SessionEvent, SessionHandle};

/// What a relay dial outcome turned into.
#[derive(Debug)]
pub enum RelayResolution {
    Connected { session_id: String },
    Failed { error: String },
    Discarded,
}

/// The single session to the internet relay.
#[derive(Debug)]
pub struct RelayClient {
    url: String,
    connect_timeout: Duration,
    session: Option<SessionHandle>,
    pending: Option<(u64, AbortHandle)>,
    next_attempt: u64,
}

impl RelayClient {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
            session: None,
            pending: None,
            next_attempt: 0,
        }
    }

    /// Dial the relay, replacing any existing session or dial.
    pub fn connect(&mut self, done: mpsc::UnboundedSender<DialOutcome>) {
        self.disconnect();

        self.next_attempt += 1;
        let attempt = self.next_attempt;
        let url = self.url.clone();
        let timeout = self.connect_timeout;

        info!(url = %url, attempt, "Connecting to internet relay");
        let task = tokio::spawn(async move {
            let result = dial(&url, timeout).await;
            let _ = done.send(DialOutcome {
                attempt,
                target: DialTarget::Relay,
                result,
            });
        });
        self.pending = Some((attempt, task.abort_handle()));
    }

    pub fn on_dial_outcome(
        &mut self,
        outcome: DialOutcome,
        session_events: &mpsc::UnboundedSender<SessionEvent>,
    ) -> RelayResolution {
        let current = outcome.target == DialTarget::Relay
            && matches!(self.pending, Some((attempt, _)) if attempt == outcome.attempt);
        if !current {
            debug!(attempt = outcome.attempt, "Discarding stale relay dial outcome");
            return RelayResolution::Discarded;
        }
        self.pending = None;

        match outcome.result {
            Ok(ws) => {
                let handle = spawn_session(ws, session_events.clone());
                let session_id = handle.id().to_string();
                info!(url = %self.url, session = %session_id, "Connected to internet relay");
                self.session = Some(handle);
                RelayResolution::Connected { session_id }
            }
            Err(e) => {
                info!(url = %self.url, error = %e, "Failed to connect to internet relay");
                RelayResolution::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    /// Returns `true` when the closed session was the relay session.
    pub fn on_session_closed(&mut self, session_id: &str) -> bool {
        if self.is_session(session_id) {
            self.session = None;
            info!(url = %self.url, "Disconnected from internet relay");
            true
        } else {
            false
        }
    }

    pub fn is_session(&self, session_id: &str) -> bool {
        self.session.as_ref().is_some_and(|s| s.id() == session_id)
    }

    pub fn is_connected(&self) -> bool {
        self.session.as_ref().is_some_and(SessionHandle::is_open)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Send over the relay session. Returns `false` when not connected.
    pub fn send(&self, event: WireEvent) -> bool {
        match &self.session {
            Some(session) if session.is_open() => session.send(event),
            _ => false,
        }
    }

    /// Close the session and cancel any dial. Returns `true` if a session
    /// was open.
    pub fn disconnect(&mut self) -> bool {
        if let Some((attempt, abort)) = self.pending.take() {
            debug!(attempt, "Cancelling relay dial");
            abort.abort();
        }
        match self.session.take() {
            Some(session) => {
                session.close();
                true
            }
            None => false,
        }
    }
}
