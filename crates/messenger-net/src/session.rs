//! One persistent WebSocket session, whichever side opened it.
//!
//! Each session runs in its own tokio task that owns the socket. Outgoing
//! events are queued through a [`SessionHandle`]; decoded incoming events and
//! the final close are reported on a shared [`SessionEvent`] channel, in wire
//! order.

use std::sync::Once;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as Frame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use messenger_shared::protocol::WireEvent;

use crate::error::NetError;

/// Client-side WebSocket stream, plain or TLS.
pub type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Reported by a session task to whoever owns its event channel.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Frame { session_id: String, event: WireEvent },
    Closed { session_id: String },
}

#[derive(Debug)]
enum Outbound {
    Event(WireEvent),
    Close,
}

/// Cheap handle used to write to a session or close it.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: String,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue an event. Returns `false` once the session task has ended.
    pub fn send(&self, event: WireEvent) -> bool {
        self.tx.send(Outbound::Event(event)).is_ok()
    }

    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Spawn the task driving `ws` and return its handle.
pub fn spawn_session<S>(
    ws: WebSocketStream<S>,
    events: mpsc::UnboundedSender<SessionEvent>,
) -> SessionHandle
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let id = uuid::Uuid::new_v4().to_string();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(run_session(id.clone(), ws, rx, events));

    SessionHandle { id, tx }
}

async fn run_session<S>(
    session_id: String,
    mut ws: WebSocketStream<S>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<SessionEvent>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    debug!(session = %session_id, "Session started");

    loop {
        tokio::select! {
            out = outbound.recv() => {
                match out {
                    Some(Outbound::Event(event)) => {
                        let text = match event.to_json() {
                            Ok(t) => t,
                            Err(e) => {
                                warn!(session = %session_id, error = %e, "Failed to encode event");
                                continue;
                            }
                        };
                        if let Err(e) = ws.send(Frame::Text(text.into())).await {
                            debug!(session = %session_id, error = %e, "Session write failed");
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = ws.close(None).await;
                        break;
                    }
                }
            }

            frame = ws.next() => {
                match frame {
                    Some(Ok(Frame::Text(text))) => match WireEvent::from_json(text.as_str()) {
                        Ok(event) => {
                            let session_id = session_id.clone();
                            if events.send(SessionEvent::Frame { session_id, event }).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            debug!(session = %session_id, error = %e, "Ignoring undecodable frame");
                        }
                    },
                    Some(Ok(Frame::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(session = %session_id, error = %e, "Session read failed");
                        break;
                    }
                }
            }
        }
    }

    debug!(session = %session_id, "Session ended");
    let _ = events.send(SessionEvent::Closed { session_id });
}

static CRYPTO_PROVIDER: Once = Once::new();

/// `wss://` dials need a process-wide rustls provider.
fn install_crypto_provider() {
    CRYPTO_PROVIDER.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            debug!("rustls crypto provider already installed");
        }
    });
}

/// Open a client session to `url`, giving up after `timeout`.
pub async fn dial(url: &str, timeout: Duration) -> Result<ClientStream, NetError> {
    install_crypto_provider();
    match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url)).await {
        Ok(Ok((ws, _response))) => Ok(ws),
        Ok(Err(e)) => Err(NetError::Connect(e)),
        Err(_) => Err(NetError::Timeout(timeout.as_secs())),
    }
}

/// Where a dial was headed, echoed back with its outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialTarget {
    Peer { host: String, port: u16 },
    Relay,
}

/// Completion of a spawned dial.
///
/// `attempt` identifies the dial that produced it; owners discard outcomes
/// whose attempt is no longer pending.
#[derive(Debug)]
pub struct DialOutcome {
    pub attempt: u64,
    pub target: DialTarget,
    pub result: Result<ClientStream, NetError>,
}
