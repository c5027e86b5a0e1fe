//! Chat WebSocket endpoint.
//!
//! Each connection registers with the fan-out hub (auto-joining the global
//! groups), then runs a select loop: hub events are forwarded to the socket,
//! and client requests are handled inline. Blocking work (store reads and
//! transport calls) happens on this connection's task only — broadcasts to
//! other sessions go through the hub's non-blocking queues.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Router,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::address::canonical_address;
use crate::hub::{FanoutHub, GROUP_CONTACTS, GROUP_DELIVERY, GROUP_PRESENCE, ServerEvent, chat_group};
use crate::store::Store;
use crate::store::model::{ContactSummary, ContentKind, MessageLogEntry, MessagesPage};
use crate::transport::Transport;

/// Default conversation page size.
const DEFAULT_PAGE_SIZE: usize = 200;

// ── JSON Protocol ───────────────────────────────────────────────────────

/// Message from dashboard client → server.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ClientMessage {
    #[serde(rename = "join")]
    Join { address: String },

    #[serde(rename = "get_contacts")]
    GetContacts {
        #[serde(default)]
        q: String,
    },

    #[serde(rename = "get_messages")]
    GetMessages {
        address: String,
        #[serde(default = "default_page")]
        page: usize,
        #[serde(default = "default_page_size")]
        page_size: usize,
    },

    #[serde(rename = "send_message")]
    SendMessage {
        address: String,
        #[serde(default)]
        text: String,
        #[serde(default)]
        media_id: Option<String>,
        #[serde(default)]
        media_kind: Option<ContentKind>,
    },

    #[serde(rename = "mark_read")]
    MarkRead { address: String },

    #[serde(rename = "typing")]
    Typing { address: String, state: bool },
}

fn default_page() -> usize {
    1
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

/// Direct (non-broadcast) reply from server → requesting client.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum Reply {
    #[serde(rename = "connected")]
    Connected,

    #[serde(rename = "joined")]
    Joined { address: String },

    #[serde(rename = "contacts_list")]
    ContactsList { contacts: Vec<ContactSummary> },

    #[serde(rename = "messages_page")]
    MessagesPage {
        address: String,
        #[serde(flatten)]
        page: MessagesPage,
    },

    #[serde(rename = "sent_ok")]
    SentOk { message_id: String, address: String },

    #[serde(rename = "send_error")]
    SendError { error: String },

    #[serde(rename = "marked_read")]
    MarkedRead { address: String },

    #[serde(rename = "error")]
    Error { message: String },
}

// ── State & routes ──────────────────────────────────────────────────────

/// Shared state for the chat endpoint.
#[derive(Clone)]
pub struct ChatState {
    pub store: Arc<dyn Store>,
    pub hub: Arc<FanoutHub>,
    pub transport: Arc<dyn Transport>,
}

/// Build the Axum router for the chat WebSocket.
pub fn chat_routes(state: ChatState) -> Router {
    Router::new()
        .route("/ws/chat", get(ws_chat_handler))
        .with_state(state)
}

async fn ws_chat_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<ChatState>,
) -> impl IntoResponse {
    // Agent identity comes from the session layer upstream; the query param
    // is a pass-through for whoever fronts this service.
    let agent = params.get("agent").cloned().unwrap_or_default();
    info!("Chat client connecting");
    ws.on_upgrade(move |socket| handle_chat_socket(socket, state, agent))
}

async fn handle_chat_socket(mut socket: WebSocket, state: ChatState, agent: String) {
    let (session_id, mut events) = state.hub.register().await;
    info!(session = %session_id, "Chat client connected");

    if send_reply(&mut socket, &Reply::Connected).await.is_err() {
        state.hub.unregister(session_id).await;
        return;
    }

    loop {
        tokio::select! {
            // Forward hub events to this client
            event = events.recv() => {
                match event {
                    Some(event) => {
                        if let Ok(json) = serde_json::to_string(&event) {
                            if socket.send(Message::Text(json.into())).await.is_err() {
                                debug!("Chat client disconnected during send");
                                break;
                            }
                        }
                    }
                    None => {
                        debug!("Hub queue closed");
                        break;
                    }
                }
            }

            // Handle requests from the client
            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(msg) => {
                                let reply =
                                    handle_client_message(&state, session_id, &agent, msg).await;
                                if let Some(reply) = reply {
                                    if send_reply(&mut socket, &reply).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Err(e) => {
                                debug!(error = %e, text = %text, "Unrecognized chat message");
                                let reply = Reply::Error {
                                    message: "unknown message type".into(),
                                };
                                if send_reply(&mut socket, &reply).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(session = %session_id, "Chat client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Chat WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    state.hub.unregister(session_id).await;
    info!(session = %session_id, "Chat connection closed");
}

async fn send_reply(socket: &mut WebSocket, reply: &Reply) -> Result<(), axum::Error> {
    match serde_json::to_string(reply) {
        Ok(json) => socket.send(Message::Text(json.into())).await,
        Err(e) => {
            warn!(error = %e, "Failed to serialize reply");
            Ok(())
        }
    }
}

// ── Request handling ────────────────────────────────────────────────────

async fn handle_client_message(
    state: &ChatState,
    session_id: Uuid,
    agent: &str,
    msg: ClientMessage,
) -> Option<Reply> {
    match msg {
        ClientMessage::Join { address } => {
            let address = canonical_address(&address);
            let Some(group) = chat_group(&address) else {
                return Some(Reply::Error {
                    message: "address missing in join".into(),
                });
            };
            state.hub.join(session_id, &group).await;
            state
                .hub
                .publish(
                    GROUP_PRESENCE,
                    ServerEvent::PresenceUpdate {
                        address: address.clone(),
                        status: "online".into(),
                    },
                )
                .await;
            Some(Reply::Joined { address })
        }

        ClientMessage::GetContacts { q } => match state.store.contacts(&q).await {
            Ok(contacts) => Some(Reply::ContactsList { contacts }),
            Err(e) => {
                warn!(error = %e, "Contacts query failed");
                Some(Reply::Error {
                    message: "contacts query failed".into(),
                })
            }
        },

        ClientMessage::GetMessages {
            address,
            page,
            page_size,
        } => {
            let address = canonical_address(&address);
            match state.store.messages_page(&address, page, page_size).await {
                Ok(page) => Some(Reply::MessagesPage { address, page }),
                Err(e) => {
                    warn!(error = %e, "Messages query failed");
                    Some(Reply::Error {
                        message: "messages query failed".into(),
                    })
                }
            }
        }

        ClientMessage::SendMessage {
            address,
            text,
            media_id,
            media_kind,
        } => Some(handle_send(state, agent, &address, &text, media_id, media_kind).await),

        ClientMessage::MarkRead { address } => {
            let address = canonical_address(&address);
            match state.store.mark_read(&address).await {
                Ok(changed) => {
                    debug!(address = %address, changed, "Marked conversation read");
                    if let Some(group) = chat_group(&address) {
                        state
                            .hub
                            .publish(
                                &group,
                                ServerEvent::DeliveryUpdate {
                                    // empty id => conversation-level read
                                    message_id: String::new(),
                                    status: "Read".into(),
                                    address: address.clone(),
                                    error: None,
                                },
                            )
                            .await;
                    }
                    state
                        .hub
                        .publish(
                            GROUP_CONTACTS,
                            ServerEvent::PresenceUpdate {
                                address: address.clone(),
                                status: "updated".into(),
                            },
                        )
                        .await;
                    Some(Reply::MarkedRead { address })
                }
                Err(e) => {
                    warn!(error = %e, "Mark read failed");
                    Some(Reply::Error {
                        message: "mark read failed".into(),
                    })
                }
            }
        }

        ClientMessage::Typing { address, state: typing } => {
            let address = canonical_address(&address);
            if let Some(group) = chat_group(&address) {
                state
                    .hub
                    .publish(
                        &group,
                        ServerEvent::Typing {
                            address,
                            state: typing,
                        },
                    )
                    .await;
            }
            None
        }
    }
}

/// Send an interactive message and fan out the result.
async fn handle_send(
    state: &ChatState,
    agent: &str,
    address: &str,
    text: &str,
    media_id: Option<String>,
    media_kind: Option<ContentKind>,
) -> Reply {
    let address = canonical_address(address);
    if address.is_empty() {
        return Reply::Error {
            message: "address required for send_message".into(),
        };
    }

    let (send_result, content) = match media_id {
        Some(ref media_id) => {
            let kind = media_kind.unwrap_or(ContentKind::Image);
            (
                state
                    .transport
                    .send_media(&address, media_id, kind, text)
                    .await,
                kind,
            )
        }
        None => (
            state.transport.send_text(&address, text).await,
            ContentKind::Text,
        ),
    };

    let mut entry = MessageLogEntry::outbound(&address, text, content)
        .with_template("manual")
        .with_contact_name(agent);

    match send_result {
        Ok(receipt) => {
            entry = entry.with_external_id(&receipt.external_id);
            if let Err(e) = state.store.insert_log(&entry).await {
                warn!(error = %e, "Failed to log outbound message");
            }

            if let Some(group) = chat_group(&address) {
                state
                    .hub
                    .publish(
                        &group,
                        ServerEvent::NewMessage {
                            message: entry.clone(),
                        },
                    )
                    .await;
            }
            state
                .hub
                .publish(
                    GROUP_DELIVERY,
                    ServerEvent::DeliveryUpdate {
                        message_id: receipt.external_id.clone(),
                        status: "Sent".into(),
                        address: address.clone(),
                        error: None,
                    },
                )
                .await;
            state
                .hub
                .publish(
                    GROUP_CONTACTS,
                    ServerEvent::PresenceUpdate {
                        address: address.clone(),
                        status: "updated".into(),
                    },
                )
                .await;

            Reply::SentOk {
                message_id: receipt.external_id,
                address,
            }
        }
        Err(e) => {
            // The attempt is still logged so the conversation shows it.
            let entry = entry.failed(&e.to_string());
            if let Err(db_err) = state.store.insert_log(&entry).await {
                warn!(error = %db_err, "Failed to log failed send");
            }
            if let Some(group) = chat_group(&address) {
                state
                    .hub
                    .publish(&group, ServerEvent::NewMessage { message: entry })
                    .await;
            }
            Reply::SendError {
                error: e.to_string(),
            }
        }
    }
}
