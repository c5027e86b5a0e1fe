//! WhatsApp Cloud API transport.
//!
//! One implementation parameterized by `TenantConfig` — tenants differ only
//! in credentials, phone-number id, and API version, never in code path.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use secrecy::ExposeSecret;

use crate::config::TenantConfig;
use crate::error::TransportError;
use crate::store::model::ContentKind;
use crate::transport::{NumberCheck, SendReceipt, Transport};

/// Base delay for send retries; doubled per attempt, plus jitter.
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Provider error code: recipient has blocked the business.
const CODE_USER_BLOCKED: i64 = 131011;

/// Provider error codes: recipient cannot receive messages.
const CODES_UNDELIVERABLE: [i64; 3] = [131009, 131045, 131000];

/// Graph API client for one tenant.
pub struct CloudTransport {
    tenant: TenantConfig,
    client: reqwest::Client,
    max_retries: u32,
}

impl CloudTransport {
    pub fn new(tenant: TenantConfig, timeout: Duration, max_retries: u32) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            tenant,
            client,
            max_retries,
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!(
            "{}/{}/{path}",
            self.tenant.base_url, self.tenant.api_version
        )
    }

    fn messages_url(&self) -> String {
        self.api_url(&format!("{}/messages", self.tenant.phone_number_id))
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.tenant.access_token.expose_secret())
    }

    /// POST a JSON payload to the messages endpoint with bounded retries.
    ///
    /// Timeouts, connection failures, 429 and 5xx are retried with
    /// exponential backoff and jitter; application-level rejections are
    /// surfaced immediately.
    async fn post_messages(
        &self,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, TransportError> {
        let url = self.messages_url();
        let mut last_error = String::new();

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = RETRY_BASE_DELAY * 2u32.saturating_pow(attempt - 1);
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
                tokio::time::sleep(backoff + jitter).await;
            }

            let resp = match self
                .client
                .post(&url)
                .header("Authorization", self.bearer())
                .json(payload)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(e) => {
                    last_error = e.to_string();
                    tracing::warn!(attempt, error = %last_error, "Messages request failed, will retry");
                    continue;
                }
            };

            let status = resp.status();
            if retryable_status(status) {
                last_error = format!("provider returned {status}");
                tracing::warn!(attempt, %status, "Retryable provider status");
                continue;
            }

            let body: serde_json::Value = resp.json().await.map_err(|e| {
                TransportError::InvalidResponse(format!("non-JSON messages response: {e}"))
            })?;

            if status.is_success() {
                return Ok(body);
            }

            // Application-level rejection: do not retry.
            let message = body
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("Unknown error")
                .to_string();
            return Err(TransportError::Rejected {
                code: status.as_u16(),
                message,
            });
        }

        Err(TransportError::RetriesExhausted {
            attempts: self.max_retries + 1,
            last_error,
        })
    }

    /// Pull `messages[0].id` out of a successful send response.
    fn receipt_from(body: serde_json::Value) -> Result<SendReceipt, TransportError> {
        let external_id = body
            .get("messages")
            .and_then(|m| m.get(0))
            .and_then(|m| m.get("id"))
            .and_then(|id| id.as_str())
            .ok_or_else(|| {
                TransportError::InvalidResponse("send response missing messages[0].id".into())
            })?
            .to_string();
        Ok(SendReceipt {
            external_id,
            raw: body,
        })
    }
}

fn retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

#[async_trait]
impl Transport for CloudTransport {
    async fn send_text(&self, to: &str, body: &str) -> Result<SendReceipt, TransportError> {
        let payload = serde_json::json!({
            "messaging_product": "whatsapp",
            "to": to,
            "type": "text",
            "text": {"body": body},
        });
        Self::receipt_from(self.post_messages(&payload).await?)
    }

    async fn send_media(
        &self,
        to: &str,
        media_id: &str,
        kind: ContentKind,
        caption: &str,
    ) -> Result<SendReceipt, TransportError> {
        let kind_str = kind.as_str();
        let mut media = serde_json::json!({"id": media_id});
        if !caption.is_empty() && matches!(kind, ContentKind::Image | ContentKind::Video) {
            media["caption"] = serde_json::Value::String(caption.to_string());
        }
        let payload = serde_json::json!({
            "messaging_product": "whatsapp",
            "to": to,
            "type": kind_str,
            kind_str: media,
        });
        Self::receipt_from(self.post_messages(&payload).await?)
    }

    async fn send_template(
        &self,
        _to: &str,
        payload: &serde_json::Value,
    ) -> Result<SendReceipt, TransportError> {
        Self::receipt_from(self.post_messages(payload).await?)
    }

    async fn check_number(&self, to: &str) -> NumberCheck {
        let payload = serde_json::json!({
            "messaging_product": "whatsapp",
            "to": to,
            "type": "contacts",
        });

        let resp = self
            .client
            .post(self.messages_url())
            .header("Authorization", self.bearer())
            .json(&payload)
            .send()
            .await;

        let body: serde_json::Value = match resp {
            Ok(resp) => match resp.json().await {
                Ok(body) => body,
                Err(e) => {
                    return NumberCheck::assumed_valid(format!(
                        "Validation error (assume valid): {e}"
                    ));
                }
            },
            Err(e) => {
                return NumberCheck::assumed_valid(format!("Validation error (assume valid): {e}"));
            }
        };

        if let Some(status) = body
            .get("contacts")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("status"))
            .and_then(|s| s.as_str())
        {
            match status {
                "valid" => return NumberCheck::assumed_valid("Valid WhatsApp user"),
                "invalid" => return NumberCheck::invalid("Not a WhatsApp user"),
                _ => {}
            }
        }

        if let Some(err) = body.get("error") {
            let code = err.get("code").and_then(|c| c.as_i64());
            let message = err
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or_default();
            match code {
                Some(CODE_USER_BLOCKED) => return NumberCheck::blocked("User blocked business"),
                Some(c) if CODES_UNDELIVERABLE.contains(&c) => {
                    return NumberCheck::invalid(message);
                }
                _ => {}
            }
        }

        NumberCheck::assumed_valid("Unknown (assumed valid)")
    }

    async fn fetch_template_body(&self, name: &str) -> Result<Option<String>, TransportError> {
        let url = self.api_url(&format!(
            "{}/message_templates?name={name}",
            self.tenant.business_account_id
        ));

        let resp = self
            .client
            .get(&url)
            .header("Authorization", self.bearer())
            .send()
            .await
            .map_err(|e| TransportError::RequestFailed {
                endpoint: "message_templates".into(),
                reason: e.to_string(),
            })?;

        let body: serde_json::Value = resp.json().await.map_err(|e| {
            TransportError::InvalidResponse(format!("non-JSON template response: {e}"))
        })?;

        let text = body
            .get("data")
            .and_then(|d| d.get(0))
            .and_then(|t| t.get("components"))
            .and_then(|c| c.as_array())
            .and_then(|components| {
                components.iter().find_map(|comp| {
                    (comp.get("type").and_then(|t| t.as_str()) == Some("BODY"))
                        .then(|| comp.get("text").and_then(|t| t.as_str()))
                        .flatten()
                        .map(str::to_string)
                })
            });

        Ok(text)
    }

    async fn upload_media(
        &self,
        bytes: Vec<u8>,
        mime: &str,
        filename: &str,
    ) -> Result<String, TransportError> {
        let url = self.api_url(&format!("{}/media", self.tenant.phone_number_id));

        let part = Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str(mime)
            .map_err(|e| TransportError::Media(format!("invalid mime type {mime:?}: {e}")))?;
        let form = Form::new()
            .text("messaging_product", "whatsapp")
            .part("file", part);

        let resp = self
            .client
            .post(&url)
            .header("Authorization", self.bearer())
            .multipart(form)
            .send()
            .await
            .map_err(|e| TransportError::RequestFailed {
                endpoint: "media upload".into(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let err = resp.text().await.unwrap_or_default();
            return Err(TransportError::Rejected {
                code: status.as_u16(),
                message: format!("media upload failed: {err}"),
            });
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| TransportError::InvalidResponse(format!("non-JSON upload response: {e}")))?;

        body.get("id")
            .and_then(|id| id.as_str())
            .map(str::to_string)
            .ok_or_else(|| TransportError::InvalidResponse("upload response missing id".into()))
    }

    async fn download_media(&self, media_id: &str) -> Result<(String, Vec<u8>), TransportError> {
        // Two-step: fetch metadata for the signed URL, then the bytes.
        let meta_url = self.api_url(media_id);
        let meta: serde_json::Value = self
            .client
            .get(&meta_url)
            .header("Authorization", self.bearer())
            .send()
            .await
            .map_err(|e| TransportError::Media(format!("media metadata fetch failed: {e}")))?
            .json()
            .await
            .map_err(|e| TransportError::InvalidResponse(format!("non-JSON media metadata: {e}")))?;

        let file_url = meta
            .get("url")
            .and_then(|u| u.as_str())
            .ok_or_else(|| TransportError::Media("media metadata missing url".into()))?;
        let mime = meta
            .get("mime_type")
            .and_then(|m| m.as_str())
            .unwrap_or_default();
        let ext = mime.rsplit('/').next().filter(|e| !e.is_empty()).unwrap_or("bin");

        let bytes = self
            .client
            .get(file_url)
            .header("Authorization", self.bearer())
            .send()
            .await
            .map_err(|e| TransportError::Media(format!("media download failed: {e}")))?
            .bytes()
            .await
            .map_err(|e| TransportError::Media(format!("media body read failed: {e}")))?;

        Ok((format!("whatsapp_{media_id}.{ext}"), bytes.to_vec()))
    }
}
