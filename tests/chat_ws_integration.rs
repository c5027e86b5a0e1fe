//! Integration tests for the chat WebSocket, webhook, and job REST surfaces.
//!
//! Each test spins up the real Axum app on a random port, connects via
//! tokio-tungstenite, and exercises the wire contract end to end against an
//! in-memory store and a stub transport.

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use wa_dispatch::artifacts::FsArtifactStore;
use wa_dispatch::config::DispatchConfig;
use wa_dispatch::delivery::DeliveryNormalizer;
use wa_dispatch::error::TransportError;
use wa_dispatch::http::{AppState, app_router};
use wa_dispatch::hub::FanoutHub;
use wa_dispatch::hub::ws::ChatState;
use wa_dispatch::job::JobEngine;
use wa_dispatch::store::model::{ContentKind, LogStatus, MessageLogEntry};
use wa_dispatch::store::{LibSqlStore, Store};
use wa_dispatch::transport::{NumberCheck, SendReceipt, Transport};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

const VERIFY_TOKEN: &str = "test_verify_123";

/// Stub transport: deterministic receipts, no network.
#[derive(Default)]
struct StubTransport {
    sends: AtomicUsize,
}

impl StubTransport {
    fn receipt(&self) -> SendReceipt {
        let n = self.sends.fetch_add(1, Ordering::SeqCst);
        SendReceipt {
            external_id: format!("wamid.test-{n}"),
            raw: serde_json::json!({}),
        }
    }
}

#[async_trait]
impl Transport for StubTransport {
    async fn send_text(&self, _to: &str, _body: &str) -> Result<SendReceipt, TransportError> {
        Ok(self.receipt())
    }

    async fn send_media(
        &self,
        _to: &str,
        _media_id: &str,
        _kind: ContentKind,
        _caption: &str,
    ) -> Result<SendReceipt, TransportError> {
        Ok(self.receipt())
    }

    async fn send_template(
        &self,
        _to: &str,
        _payload: &Value,
    ) -> Result<SendReceipt, TransportError> {
        Ok(self.receipt())
    }

    async fn check_number(&self, _to: &str) -> NumberCheck {
        NumberCheck::assumed_valid("Valid WhatsApp user")
    }

    async fn fetch_template_body(&self, _name: &str) -> Result<Option<String>, TransportError> {
        Ok(Some("Welcome {{1}}, glad to have you.".to_string()))
    }

    async fn upload_media(
        &self,
        _bytes: Vec<u8>,
        _mime: &str,
        _filename: &str,
    ) -> Result<String, TransportError> {
        Ok("stub-media".to_string())
    }

    async fn download_media(&self, media_id: &str) -> Result<(String, Vec<u8>), TransportError> {
        Ok((format!("whatsapp_{media_id}.jpeg"), vec![0xFF, 0xD8]))
    }
}

struct TestServer {
    port: u16,
    store: Arc<LibSqlStore>,
    _artifact_dir: tempfile::TempDir,
}

impl TestServer {
    fn ws_url(&self) -> String {
        format!("ws://127.0.0.1:{}/ws/chat", self.port)
    }

    fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.port)
    }
}

/// Start the full app on a random port.
async fn start_server() -> TestServer {
    let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
    let hub = Arc::new(FanoutHub::new());
    let transport: Arc<dyn Transport> = Arc::new(StubTransport::default());
    let artifact_dir = tempfile::tempdir().unwrap();
    let artifacts = Arc::new(FsArtifactStore::new(artifact_dir.path()));

    let config = DispatchConfig {
        chunk_size: 50,
        per_row_delay: Duration::from_millis(0),
        finalize_poll_delay: Duration::from_millis(20),
        chunk_max_retries: 0,
        ..DispatchConfig::default()
    };

    let engine = JobEngine::new(
        store.clone() as Arc<dyn Store>,
        Arc::clone(&transport),
        artifacts.clone(),
        config,
    );
    let normalizer = Arc::new(DeliveryNormalizer::new(
        store.clone() as Arc<dyn Store>,
        Arc::clone(&hub),
        Arc::clone(&transport),
        artifact_dir.path().join("media"),
    ));

    let app = app_router(
        AppState {
            store: store.clone() as Arc<dyn Store>,
            engine,
            artifacts,
            normalizer,
            transport: Arc::clone(&transport),
            verify_token: VERIFY_TOKEN.to_string(),
        },
        ChatState {
            store: store.clone() as Arc<dyn Store>,
            hub,
            transport,
        },
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        port,
        store,
        _artifact_dir: artifact_dir,
    }
}

type WsClient = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Connect and consume the initial `connected` frame.
async fn connect_chat(server: &TestServer) -> WsClient {
    let (mut ws, _) = connect_async(server.ws_url()).await.expect("WS connect failed");
    let first = next_json(&mut ws).await;
    assert_eq!(first["type"], "connected");
    ws
}

async fn next_json(ws: &mut WsClient) -> Value {
    let msg = timeout(Duration::from_secs(3), ws.next())
        .await
        .expect("timed out waiting for WS frame")
        .expect("WS stream ended")
        .expect("WS error");
    match msg {
        Message::Text(txt) => serde_json::from_str(&txt).expect("invalid JSON from server"),
        other => panic!("expected Text frame, got {other:?}"),
    }
}

async fn send_json(ws: &mut WsClient, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Collect the next `n` JSON frames.
async fn collect_json(ws: &mut WsClient, n: usize) -> Vec<Value> {
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(next_json(ws).await);
    }
    out
}

fn inbound_envelope(external_id: &str, from: &str, body: &str) -> Value {
    serde_json::json!({
        "entry": [{
            "changes": [{
                "value": {
                    "contacts": [{"profile": {"name": "Ravi"}}],
                    "messages": [{
                        "id": external_id,
                        "from": from,
                        "type": "text",
                        "text": {"body": body}
                    }]
                }
            }]
        }]
    })
}

fn receipt_envelope(external_id: &str, status: &str, recipient: &str) -> Value {
    serde_json::json!({
        "entry": [{
            "changes": [{
                "value": {
                    "statuses": [{
                        "id": external_id,
                        "status": status,
                        "recipient_id": recipient
                    }]
                }
            }]
        }]
    })
}

// ── WebSocket: join + conversation flow ──────────────────────────────────

#[tokio::test]
async fn ws_connect_receives_connected() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let _ws = connect_chat(&server).await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn joined_session_receives_exactly_one_new_message() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        // Session 1 joins the conversation for address A.
        let mut watcher = connect_chat(&server).await;
        send_json(&mut watcher, serde_json::json!({"type": "join", "address": "9491006569"}))
            .await;
        let joined = next_json(&mut watcher).await;
        assert_eq!(joined["type"], "joined");
        assert_eq!(joined["address"], "+919491006569");
        // The join itself publishes a presence_update to the presence group,
        // which this session is part of.
        let own_presence = next_json(&mut watcher).await;
        assert_eq!(own_presence["type"], "presence_update");

        // Session 2 sends a message to A.
        let mut sender = connect_chat(&server).await;
        send_json(
            &mut sender,
            serde_json::json!({"type": "send_message", "address": "9491006569", "text": "hello there"}),
        )
        .await;

        // Watcher gets new_message (conversation), delivery_update (global),
        // presence_update (contacts) — exactly one new_message among them.
        let events = collect_json(&mut watcher, 3).await;
        let new_messages: Vec<&Value> = events
            .iter()
            .filter(|e| e["type"] == "new_message")
            .collect();
        assert_eq!(new_messages.len(), 1, "events: {events:?}");
        let message = &new_messages[0]["message"];
        assert_eq!(message["body"], "hello there");
        assert_eq!(message["external_id"], "wamid.test-0");
        assert_eq!(message["address"], "+919491006569");

        // The sender is not joined to the conversation: it gets sent_ok,
        // delivery_update, presence_update — and no new_message.
        let sender_events = collect_json(&mut sender, 3).await;
        assert!(sender_events.iter().any(|e| e["type"] == "sent_ok"));
        assert!(sender_events.iter().all(|e| e["type"] != "new_message"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn typing_is_forwarded_and_not_persisted() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        let mut watcher = connect_chat(&server).await;
        send_json(&mut watcher, serde_json::json!({"type": "join", "address": "9491006569"}))
            .await;
        let _ = next_json(&mut watcher).await; // joined
        let _ = next_json(&mut watcher).await; // own join presence

        let mut other = connect_chat(&server).await;
        send_json(&mut other, serde_json::json!({"type": "join", "address": "9491006569"}))
            .await;
        let _ = next_json(&mut other).await; // joined
        // watcher also sees the presence_update published by other's join
        let presence = next_json(&mut watcher).await;
        assert_eq!(presence["type"], "presence_update");

        send_json(
            &mut other,
            serde_json::json!({"type": "typing", "address": "9491006569", "state": true}),
        )
        .await;

        let typing = next_json(&mut watcher).await;
        assert_eq!(typing["type"], "typing");
        assert_eq!(typing["state"], true);

        // Nothing was written to the log
        let page = server
            .store
            .messages_page("+919491006569", 1, 10)
            .await
            .unwrap();
        assert_eq!(page.total_items, 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn get_messages_pages_chronologically() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let address = "+919491006569";
        for i in 0..3 {
            let mut entry =
                MessageLogEntry::outbound(address, &format!("m{i}"), ContentKind::Text);
            entry.sent_at = chrono::Utc::now() + chrono::Duration::seconds(i);
            server.store.insert_log(&entry).await.unwrap();
        }

        let mut ws = connect_chat(&server).await;
        send_json(
            &mut ws,
            serde_json::json!({"type": "get_messages", "address": "9491006569", "page": 1, "page_size": 2}),
        )
        .await;

        let page = next_json(&mut ws).await;
        assert_eq!(page["type"], "messages_page");
        assert_eq!(page["total_items"], 3);
        assert_eq!(page["total_pages"], 2);
        let items = page["items"].as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["body"], "m0");
        assert_eq!(items[1]["body"], "m1");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn mark_read_clears_unread_and_broadcasts() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let address = "+919491006569";
        for i in 0..2 {
            server
                .store
                .insert_log(&MessageLogEntry::inbound(
                    address,
                    "hi",
                    ContentKind::Text,
                    &format!("wamid.unread-{i}"),
                ))
                .await
                .unwrap();
        }

        let mut ws = connect_chat(&server).await;
        send_json(&mut ws, serde_json::json!({"type": "join", "address": address})).await;
        let _ = next_json(&mut ws).await; // joined
        let _ = next_json(&mut ws).await; // own join presence

        send_json(&mut ws, serde_json::json!({"type": "mark_read", "address": address})).await;

        // Expect marked_read reply plus the conversation-level delivery
        // update and the contacts-scoped presence update, in any order.
        let events = collect_json(&mut ws, 3).await;
        assert!(events.iter().any(|e| e["type"] == "marked_read"));
        let delivery = events
            .iter()
            .find(|e| e["type"] == "delivery_update")
            .expect("no delivery_update broadcast");
        assert_eq!(delivery["status"], "Read");
        assert_eq!(delivery["message_id"], "");
        assert!(events.iter().any(|e| e["type"] == "presence_update"));

        let contacts = server.store.contacts("").await.unwrap();
        assert_eq!(contacts[0].unread, 0);
    })
    .await
    .expect("test timed out");
}

// ── Webhook ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn webhook_verification_handshake() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        let ok = reqwest::get(server.url(&format!(
            "/webhook?hub.mode=subscribe&hub.verify_token={VERIFY_TOKEN}&hub.challenge=12345"
        )))
        .await
        .unwrap();
        assert_eq!(ok.status(), 200);
        assert_eq!(ok.text().await.unwrap(), "12345");

        let bad = reqwest::get(server.url(
            "/webhook?hub.mode=subscribe&hub.verify_token=wrong&hub.challenge=12345",
        ))
        .await
        .unwrap();
        assert_eq!(bad.status(), 400);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn duplicate_inbound_webhook_logs_one_entry() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let client = reqwest::Client::new();
        let envelope = inbound_envelope("wamid.XYZ", "919491006569", "hello!");

        for _ in 0..2 {
            let resp = client
                .post(server.url("/webhook"))
                .json(&envelope)
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 200);
        }

        let entry = server
            .store
            .get_log_by_external_id("wamid.XYZ")
            .await
            .unwrap()
            .expect("inbound message not logged");
        assert_eq!(entry.body, "hello!");
        assert_eq!(entry.contact_name, "Ravi");
        assert_eq!(entry.status, LogStatus::Unread);

        let page = server
            .store
            .messages_page("+919491006569", 1, 10)
            .await
            .unwrap();
        assert_eq!(page.total_items, 1, "replay must not double-log");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn delivery_receipts_upgrade_status_and_broadcast() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let address = "+919491006569";
        let entry = MessageLogEntry::outbound(address, "out", ContentKind::Text)
            .with_external_id("wamid.tick");
        server.store.insert_log(&entry).await.unwrap();

        let mut ws = connect_chat(&server).await;

        let client = reqwest::Client::new();
        client
            .post(server.url("/webhook"))
            .json(&receipt_envelope("wamid.tick", "delivered", "919491006569"))
            .send()
            .await
            .unwrap();

        let update = next_json(&mut ws).await;
        assert_eq!(update["type"], "delivery_update");
        assert_eq!(update["message_id"], "wamid.tick");
        assert_eq!(update["status"], "Delivered");

        let stored = server
            .store
            .get_log_by_external_id("wamid.tick")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, LogStatus::Delivered);

        // A stale "sent" receipt afterwards must not downgrade.
        client
            .post(server.url("/webhook"))
            .json(&receipt_envelope("wamid.tick", "sent", "919491006569"))
            .send()
            .await
            .unwrap();

        let stored = server
            .store
            .get_log_by_external_id("wamid.tick")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, LogStatus::Delivered);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn failed_receipt_after_read_is_dropped() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let entry = MessageLogEntry::outbound("+919491006569", "out", ContentKind::Text)
            .with_external_id("wamid.read");
        server.store.insert_log(&entry).await.unwrap();

        let client = reqwest::Client::new();
        client
            .post(server.url("/webhook"))
            .json(&receipt_envelope("wamid.read", "read", "919491006569"))
            .send()
            .await
            .unwrap();

        client
            .post(server.url("/webhook"))
            .json(&receipt_envelope("wamid.read", "failed", "919491006569"))
            .send()
            .await
            .unwrap();

        let stored = server
            .store
            .get_log_by_external_id("wamid.read")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, LogStatus::Read, "Failed must not overwrite Read");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn unknown_receipt_id_is_a_no_op() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let client = reqwest::Client::new();

        let resp = client
            .post(server.url("/webhook"))
            .json(&receipt_envelope("wamid.ghost", "delivered", "919491006569"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        assert!(
            server
                .store
                .get_log_by_external_id("wamid.ghost")
                .await
                .unwrap()
                .is_none()
        );
    })
    .await
    .expect("test timed out");
}

// ── REST: jobs ──────────────────────────────────────────────────────────

#[tokio::test]
async fn rest_health_endpoint() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        let resp = reqwest::get(server.url("/health")).await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "wa-dispatch");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn submit_job_and_download_report() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        let mut csv = tempfile::NamedTempFile::new().unwrap();
        writeln!(csv, "customer_name,cust_mobile").unwrap();
        for i in 0..7 {
            writeln!(csv, "Customer {i},94910{:05}", i).unwrap();
        }
        csv.flush().unwrap();

        let client = reqwest::Client::new();
        let resp = client
            .post(server.url("/api/jobs"))
            .json(&serde_json::json!({
                "template": "welcome",
                "source": csv.path().to_string_lossy(),
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let body: Value = resp.json().await.unwrap();
        let job_id = body["job_id"].as_str().unwrap().to_string();

        // Poll the status surface until the finalizer completes the job.
        let mut status = Value::Null;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            status = client
                .get(server.url(&format!("/api/jobs/{job_id}")))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if status["status"] == "completed" {
                break;
            }
        }
        assert_eq!(status["status"], "completed", "job never completed: {status}");
        assert_eq!(status["total"], 7);
        assert_eq!(status["attempted"], 7);
        assert_eq!(status["succeeded"], 7);
        assert_eq!(status["failed"], 0);
        assert_eq!(status["progress"], 100.0);

        let report = client
            .get(server.url(&format!("/api/jobs/{job_id}/report/success")))
            .send()
            .await
            .unwrap();
        assert_eq!(report.status(), 200);
        let text = report.text().await.unwrap();
        assert!(text.starts_with("Name,Mobile,MessageID"));
        assert_eq!(text.lines().count(), 8); // header + 7 rows

        // No failure report was produced
        let missing = client
            .get(server.url(&format!("/api/jobs/{job_id}/report/failed")))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), 404);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn submit_job_rejects_bad_template_and_source() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let client = reqwest::Client::new();

        let bad_template = client
            .post(server.url("/api/jobs"))
            .json(&serde_json::json!({"template": "bogus", "source": "/tmp/x.csv"}))
            .send()
            .await
            .unwrap();
        assert_eq!(bad_template.status(), 400);

        let bad_source = client
            .post(server.url("/api/jobs"))
            .json(&serde_json::json!({"template": "welcome", "source": "/nonexistent/rows.csv"}))
            .send()
            .await
            .unwrap();
        assert_eq!(bad_source.status(), 400);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn job_status_unknown_id_is_404() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let resp = reqwest::get(server.url(&format!("/api/jobs/{}", uuid::Uuid::new_v4())))
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);

        let invalid = reqwest::get(server.url("/api/jobs/not-a-uuid")).await.unwrap();
        assert_eq!(invalid.status(), 400);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn media_upload_returns_provider_id() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let client = reqwest::Client::new();

        let resp = client
            .post(server.url("/api/media?filename=receipt.jpeg"))
            .header("content-type", "image/jpeg")
            .body(vec![0xFF, 0xD8, 0xFF])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["media_id"], "stub-media");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn contacts_api_lists_conversations() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        server
            .store
            .insert_log(&MessageLogEntry::inbound(
                "+919491006569",
                "need help with my loan",
                ContentKind::Text,
                "wamid.c1",
            ))
            .await
            .unwrap();

        let body: Value = reqwest::get(server.url("/api/contacts"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let contacts = body["contacts"].as_array().unwrap();
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0]["address"], "+919491006569");
        assert_eq!(contacts[0]["unread"], 1);

        let filtered: Value = reqwest::get(server.url("/api/contacts?q=loan"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(filtered["contacts"].as_array().unwrap().len(), 1);

        let none: Value = reqwest::get(server.url("/api/contacts?q=zzz"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(none["contacts"].as_array().unwrap().is_empty());
    })
    .await
    .expect("test timed out");
}
