//! Delivery-status normalization and webhook ingestion.
//!
//! Provider webhooks carry two kinds of items: inbound customer messages
//! and delivery receipts for our sends. Receipts are correlated with log
//! entries only by external message id; inbound messages are deduplicated
//! on the same key. Status updates ride a monotonic ladder — a late or
//! duplicate receipt can never downgrade an entry.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::address::canonical_address;
use crate::hub::{FanoutHub, GROUP_CONTACTS, GROUP_DELIVERY, GROUP_PRESENCE, ServerEvent, chat_group};
use crate::store::Store;
use crate::store::model::{ContentKind, LogStatus, MessageLogEntry};
use crate::transport::Transport;

/// Map a provider status token to the canonical state.
///
/// Case-insensitive; anything unrecognized is treated as Failed
/// (fail-closed — an unknown token never counts as progress).
pub fn normalize_status(token: &str) -> LogStatus {
    match token.to_ascii_lowercase().as_str() {
        "sent" => LogStatus::Sent,
        "delivered" => LogStatus::Delivered,
        "read" => LogStatus::Read,
        _ => LogStatus::Failed,
    }
}

/// Statuses a receipt may overwrite when applying `status`.
///
/// Upgrades only: `Failed` applies from anywhere on the ladder except
/// `Read` — a conversation the customer already read cannot un-happen.
fn allowed_current(status: LogStatus) -> &'static [LogStatus] {
    match status {
        LogStatus::Sent => &[],
        LogStatus::Delivered => &[LogStatus::Sent],
        LogStatus::Read => &[LogStatus::Sent, LogStatus::Delivered],
        LogStatus::Failed => &[LogStatus::Sent, LogStatus::Delivered],
        LogStatus::Unread => &[],
    }
}

/// Applies webhook events to the message log and fans updates out.
pub struct DeliveryNormalizer {
    store: Arc<dyn Store>,
    hub: Arc<FanoutHub>,
    transport: Arc<dyn Transport>,
    /// Directory inbound media downloads are written to.
    media_dir: PathBuf,
}

impl DeliveryNormalizer {
    pub fn new(
        store: Arc<dyn Store>,
        hub: Arc<FanoutHub>,
        transport: Arc<dyn Transport>,
        media_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            hub,
            transport,
            media_dir: media_dir.into(),
        }
    }

    /// Process one webhook envelope.
    ///
    /// Walks `entry[].changes[].value`, handling inbound messages before
    /// receipts. A failure on one item is logged and never aborts the rest
    /// of the batch.
    pub async fn process_envelope(&self, envelope: &Value) {
        let entries = envelope
            .get("entry")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for entry in &entries {
            let changes = entry
                .get("changes")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();

            for change in &changes {
                let Some(value) = change.get("value") else {
                    continue;
                };

                let contacts = value
                    .get("contacts")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();

                if let Some(messages) = value.get("messages").and_then(Value::as_array) {
                    for msg in messages {
                        self.handle_inbound(msg, &contacts).await;
                    }
                }

                if let Some(statuses) = value.get("statuses").and_then(Value::as_array) {
                    for receipt in statuses {
                        self.handle_receipt(receipt).await;
                    }
                }
            }
        }
    }

    // ── Inbound messages ────────────────────────────────────────────

    async fn handle_inbound(&self, msg: &Value, contacts: &[Value]) {
        let Some(external_id) = msg.get("id").and_then(Value::as_str) else {
            debug!("Inbound message without id, skipping");
            return;
        };
        let address =
            canonical_address(msg.get("from").and_then(Value::as_str).unwrap_or_default());

        // Dedup: a replayed message re-emits only a presence update.
        match self.store.has_external_id(external_id).await {
            Ok(true) => {
                if let Some(group) = chat_group(&address) {
                    self.hub
                        .publish(
                            &group,
                            ServerEvent::PresenceUpdate {
                                address: address.clone(),
                                status: "online".into(),
                            },
                        )
                        .await;
                }
                trace!(external_id, "Duplicate inbound message dropped");
                return;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, external_id, "Dedup check failed, skipping inbound");
                return;
            }
        }

        let kind_token = msg.get("type").and_then(Value::as_str).unwrap_or("text");
        let (content, body) = match kind_token {
            "text" => (
                ContentKind::Text,
                msg.get("text")
                    .and_then(|t| t.get("body"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            ),
            "interactive" => (ContentKind::Interactive, interactive_body(msg)),
            "image" | "video" | "audio" | "document" => {
                let content: ContentKind = kind_token.parse().unwrap_or(ContentKind::Document);
                (content, format!("[{}]", capitalize(kind_token)))
            }
            other => {
                debug!(kind = other, "Unsupported inbound kind, logging as text");
                (ContentKind::Text, format!("[{other}]"))
            }
        };

        let contact_name = contacts
            .first()
            .and_then(|c| c.get("profile"))
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default();

        let mut entry = MessageLogEntry::inbound(&address, &body, content, external_id)
            .with_contact_name(contact_name);

        if content.is_media() {
            if let Some(media_ref) = self.download_media_for(msg, kind_token).await {
                entry.media_ref = Some(media_ref);
            }
        }

        if let Err(e) = self.store.insert_log(&entry).await {
            // Lost the race with a concurrent delivery of the same event.
            debug!(error = %e, external_id, "Inbound insert failed (likely duplicate)");
            return;
        }

        if let Some(group) = chat_group(&address) {
            self.hub
                .publish(
                    &group,
                    ServerEvent::NewMessage {
                        message: entry.clone(),
                    },
                )
                .await;
        }
        self.hub
            .publish(
                GROUP_PRESENCE,
                ServerEvent::PresenceUpdate {
                    address: address.clone(),
                    status: "online".into(),
                },
            )
            .await;
        self.hub
            .publish(
                GROUP_CONTACTS,
                ServerEvent::PresenceUpdate {
                    address,
                    status: "updated".into(),
                },
            )
            .await;
    }

    /// Download inbound media and park it under the media directory.
    /// Best-effort: a failed download leaves the entry without a media ref.
    async fn download_media_for(&self, msg: &Value, kind_token: &str) -> Option<String> {
        let media_id = msg
            .get(kind_token)
            .and_then(|m| m.get("id"))
            .and_then(Value::as_str)?;

        match self.transport.download_media(media_id).await {
            Ok((filename, bytes)) => {
                if let Err(e) = tokio::fs::create_dir_all(&self.media_dir).await {
                    warn!(error = %e, "Failed to create media directory");
                    return None;
                }
                let path = self.media_dir.join(&filename);
                match tokio::fs::write(&path, bytes).await {
                    Ok(()) => Some(filename),
                    Err(e) => {
                        warn!(error = %e, media_id, "Failed to store downloaded media");
                        None
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, media_id, "Media download failed");
                None
            }
        }
    }

    // ── Delivery receipts ───────────────────────────────────────────

    async fn handle_receipt(&self, receipt: &Value) {
        let Some(external_id) = receipt.get("id").and_then(Value::as_str) else {
            debug!("Receipt without message id, skipping");
            return;
        };
        let token = receipt
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let recipient = receipt
            .get("recipient_id")
            .or_else(|| receipt.get("recipient"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let address = canonical_address(recipient);

        let error = receipt
            .get("errors")
            .and_then(Value::as_array)
            .and_then(|errs| errs.first())
            .map(|err| {
                format!(
                    "{} - {}: {}",
                    err.get("code").and_then(Value::as_i64).unwrap_or_default(),
                    err.get("title").and_then(Value::as_str).unwrap_or_default(),
                    err.get("message")
                        .and_then(Value::as_str)
                        .unwrap_or_default(),
                )
            });

        self.apply_receipt(external_id, token, &address, error).await;
    }

    /// Apply one normalized receipt and broadcast the update.
    pub async fn apply_receipt(
        &self,
        external_id: &str,
        token: &str,
        address: &str,
        error: Option<String>,
    ) {
        let status = normalize_status(token);

        let applied = match self
            .store
            .apply_receipt_status(external_id, status, allowed_current(status))
            .await
        {
            Ok(applied) => applied,
            Err(e) => {
                warn!(error = %e, external_id, "Receipt update failed");
                return;
            }
        };

        if !applied {
            // Distinguish a stale/duplicate receipt from an unknown id.
            match self.store.get_log_by_external_id(external_id).await {
                Ok(Some(entry)) => {
                    if status == LogStatus::Failed && entry.status == LogStatus::Read {
                        warn!(
                            external_id,
                            "Anomalous Failed receipt after Read, dropped"
                        );
                    } else {
                        trace!(
                            external_id,
                            current = entry.status.as_str(),
                            incoming = status.as_str(),
                            "Stale receipt ignored"
                        );
                    }
                }
                Ok(None) => trace!(external_id, "Receipt for unknown message id"),
                Err(e) => warn!(error = %e, external_id, "Receipt lookup failed"),
            }
            return;
        }

        if let Some(ref detail) = error {
            if let Err(e) = self.store.set_log_error(external_id, detail).await {
                warn!(error = %e, external_id, "Failed to attach receipt error");
            }
        }

        let event = ServerEvent::DeliveryUpdate {
            message_id: external_id.to_string(),
            status: status.as_str().to_string(),
            address: address.to_string(),
            error,
        };
        if let Some(group) = chat_group(address) {
            self.hub.publish(&group, event.clone()).await;
        }
        self.hub.publish(GROUP_DELIVERY, event).await;
    }
}

fn interactive_body(msg: &Value) -> String {
    let interactive = msg.get("interactive").cloned().unwrap_or_default();
    match interactive.get("type").and_then(Value::as_str) {
        Some("button") => interactive
            .get("button")
            .and_then(|b| b.get("text"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        Some("list_reply") => interactive
            .get("list_reply")
            .and_then(|l| l.get("title"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
