//! Conversation fan-out hub.
//!
//! A publish/subscribe broker decoupled from socket handling: each connected
//! session registers an outbound queue plus an explicit subscription set,
//! and publishers address named groups. Delivery to each session is an
//! independent non-blocking enqueue, so one slow or dead session never
//! stalls a broadcast to the rest.

pub mod ws;

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tokio::sync::{RwLock, mpsc};
use tracing::debug;
use uuid::Uuid;

use crate::address::conversation_group;
use crate::store::model::MessageLogEntry;

/// Global group: delivery-status ticks for every conversation.
pub const GROUP_DELIVERY: &str = "delivery";
/// Global group: sidebar refresh hints.
pub const GROUP_CONTACTS: &str = "contacts";
/// Global group: counterpart online/offline events.
pub const GROUP_PRESENCE: &str = "presence";

/// Group name for one conversation: `chat_` + digits-only address.
pub fn chat_group(address: &str) -> Option<String> {
    let digits = conversation_group(address);
    if digits.is_empty() {
        None
    } else {
        Some(format!("chat_{digits}"))
    }
}

/// An event fanned out to subscribed sessions.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "new_message")]
    NewMessage { message: MessageLogEntry },

    #[serde(rename = "delivery_update")]
    DeliveryUpdate {
        /// Empty for conversation-level read updates.
        message_id: String,
        status: String,
        address: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "presence_update")]
    PresenceUpdate { address: String, status: String },

    #[serde(rename = "typing")]
    Typing { address: String, state: bool },
}

struct SessionHandle {
    tx: mpsc::UnboundedSender<ServerEvent>,
    groups: HashSet<String>,
}

/// The broker. Cheap to share behind an `Arc`.
#[derive(Default)]
pub struct FanoutHub {
    sessions: RwLock<HashMap<Uuid, SessionHandle>>,
}

impl FanoutHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session and auto-join the global groups.
    ///
    /// Returns the session id and the receiving end of its event queue.
    pub async fn register(&self) -> (Uuid, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        let groups: HashSet<String> = [GROUP_DELIVERY, GROUP_CONTACTS, GROUP_PRESENCE]
            .iter()
            .map(|g| g.to_string())
            .collect();

        self.sessions
            .write()
            .await
            .insert(id, SessionHandle { tx, groups });
        debug!(session = %id, "Session registered");
        (id, rx)
    }

    /// Subscribe a session to an additional group.
    pub async fn join(&self, session: Uuid, group: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&session) {
            Some(handle) => {
                handle.groups.insert(group.to_string());
                true
            }
            None => false,
        }
    }

    /// Drop a session and all its subscriptions.
    pub async fn unregister(&self, session: Uuid) {
        self.sessions.write().await.remove(&session);
        debug!(session = %session, "Session unregistered");
    }

    /// Fan an event out to every session subscribed to `group`.
    ///
    /// Sessions whose queue is gone are pruned. Returns the number of
    /// sessions the event was enqueued for.
    pub async fn publish(&self, group: &str, event: ServerEvent) -> usize {
        let mut dead = Vec::new();
        let mut delivered = 0;

        {
            let sessions = self.sessions.read().await;
            for (id, handle) in sessions.iter() {
                if !handle.groups.contains(group) {
                    continue;
                }
                if handle.tx.send(event.clone()).is_ok() {
                    delivered += 1;
                } else {
                    dead.push(*id);
                }
            }
        }

        if !dead.is_empty() {
            let mut sessions = self.sessions.write().await;
            for id in dead {
                sessions.remove(&id);
                debug!(session = %id, "Pruned dead session");
            }
        }

        delivered
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
