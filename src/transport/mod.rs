//! Messaging provider transport.

pub mod cloud;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::store::model::ContentKind;

pub use cloud::CloudTransport;

/// Provider acknowledgement for an accepted send.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    /// Provider-assigned message id, the delivery-tracking idempotency key.
    pub external_id: String,
    /// Raw provider response, kept for diagnostics.
    pub raw: serde_json::Value,
}

/// Result of a number pre-check.
///
/// The check is fail-open: transport failures and unrecognized provider
/// answers come back `valid` with an explanatory reason, so a flaky check
/// never blocks a bulk run.
#[derive(Debug, Clone)]
pub struct NumberCheck {
    pub valid: bool,
    pub blocked: bool,
    pub reason: String,
}

impl NumberCheck {
    pub fn assumed_valid(reason: impl Into<String>) -> Self {
        Self {
            valid: true,
            blocked: false,
            reason: reason.into(),
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            blocked: false,
            reason: reason.into(),
        }
    }

    pub fn blocked(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            blocked: true,
            reason: reason.into(),
        }
    }
}

/// Outbound messaging capability consumed by the job engine and the chat
/// session layer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a plain text message.
    async fn send_text(&self, to: &str, body: &str) -> Result<SendReceipt, TransportError>;

    /// Send previously-uploaded media, with an optional caption for
    /// image/video.
    async fn send_media(
        &self,
        to: &str,
        media_id: &str,
        kind: ContentKind,
        caption: &str,
    ) -> Result<SendReceipt, TransportError>;

    /// Send a pre-built template payload.
    async fn send_template(
        &self,
        to: &str,
        payload: &serde_json::Value,
    ) -> Result<SendReceipt, TransportError>;

    /// Pre-check whether a number can receive messages.
    async fn check_number(&self, to: &str) -> NumberCheck;

    /// Fetch a template's BODY text for preview rendering.
    async fn fetch_template_body(&self, name: &str) -> Result<Option<String>, TransportError>;

    /// Upload media bytes; returns the provider media id.
    async fn upload_media(
        &self,
        bytes: Vec<u8>,
        mime: &str,
        filename: &str,
    ) -> Result<String, TransportError>;

    /// Download media by id; returns (filename, bytes).
    async fn download_media(&self, media_id: &str) -> Result<(String, Vec<u8>), TransportError>;
}
