//! Message stamping, inbound normalization and deduplication.

use std::collections::{HashSet, VecDeque};

use rand::Rng;
use tracing::debug;

use messenger_shared::constants::DEDUP_WINDOW;
use messenger_shared::protocol::{ChatPayload, JoinRoom};
use messenger_shared::types::{now_millis, Direction, MachineId, Message};

/// Display key of a materialized message: `<timestamp>-<jitter>`.
pub fn message_id(timestamp: i64) -> String {
    let jitter: u32 = rand::thread_rng().gen();
    format!("{timestamp}-{jitter:08x}")
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DedupKey {
    sender: String,
    timestamp: i64,
    text: String,
}

/// Remembers the last `capacity` delivered keys.
#[derive(Debug)]
struct RecentKeys {
    capacity: usize,
    order: VecDeque<DedupKey>,
    seen: HashSet<DedupKey>,
}

impl RecentKeys {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// Returns `false` if the key was already present.
    fn insert(&mut self, key: DedupKey) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(key.clone());
        self.seen.insert(key);
        true
    }
}

#[derive(Debug)]
pub struct MessageRouter {
    identity: MachineId,
    recent: RecentKeys,
}

impl MessageRouter {
    pub fn new(identity: MachineId) -> Self {
        Self::with_window(identity, DEDUP_WINDOW)
    }

    pub fn with_window(identity: MachineId, window: usize) -> Self {
        Self {
            identity,
            recent: RecentKeys::new(window.max(1)),
        }
    }

    /// Stamp an outgoing message. Returns the `sent` message for the
    /// caller and the payload to put on the wire.
    pub fn outgoing(&mut self, text: &str, username: &str) -> (Message, ChatPayload) {
        let timestamp = now_millis();
        let payload = ChatPayload {
            text: text.to_string(),
            username: username.to_string(),
            timestamp: Some(timestamp),
            sender_id: Some(self.identity.clone()),
            sender_socket_id: None,
        };
        self.recent.insert(DedupKey {
            sender: self.identity.to_string(),
            timestamp,
            text: text.to_string(),
        });
        let message = Message {
            id: message_id(timestamp),
            text: payload.text.clone(),
            username: payload.username.clone(),
            sender_id: payload.sender_id.clone(),
            sender_socket_id: None,
            timestamp,
            direction: Direction::Sent,
        };
        (message, payload)
    }

    pub fn join_payload(&self, username: &str) -> JoinRoom {
        JoinRoom {
            username: username.to_string(),
            machine_id: self.identity.clone(),
        }
    }

    /// Turn a transport payload into a `received` message.
    ///
    /// Returns `None` for our own echoes and for anything already delivered.
    pub fn inbound(&mut self, chat: ChatPayload) -> Option<Message> {
        if chat.sender_id.as_ref() == Some(&self.identity) {
            debug!(timestamp = ?chat.timestamp, "Dropping own echo");
            return None;
        }

        let timestamp = chat.timestamp.unwrap_or_else(now_millis);
        let sender = match (&chat.sender_id, &chat.sender_socket_id) {
            (Some(id), _) => id.to_string(),
            (None, Some(socket)) => socket.clone(),
            (None, None) => chat.username.clone(),
        };
        let fresh = self.recent.insert(DedupKey {
            sender,
            timestamp,
            text: chat.text.clone(),
        });
        if !fresh {
            debug!(timestamp, "Dropping duplicate message");
            return None;
        }

        Some(Message {
            id: message_id(timestamp),
            text: chat.text,
            username: chat.username,
            sender_id: chat.sender_id,
            sender_socket_id: chat.sender_socket_id,
            timestamp,
            direction: Direction::Received,
        })
    }

    /// A locally generated notice, e.g. the join confirmation.
    pub fn system(&self, text: String) -> Message {
        let timestamp = now_millis();
        Message {
            id: message_id(timestamp),
            text,
            username: String::new(),
            sender_id: None,
            sender_socket_id: None,
            timestamp,
            direction: Direction::System,
        }
    }
}
