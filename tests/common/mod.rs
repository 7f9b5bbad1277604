//! Shared test support: a mock alert gateway.
//!
//! The mock is a real HTTP server on an ephemeral port speaking the
//! gateway's `{action, token, ...}` protocol, so tests exercise the full
//! client wire path. Per-action counters let tests assert that locally
//! refused actions never reached the gateway at all.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use axum::{Json, Router, extract::State, routing::post};
use serde_json::{Value, json};
use tokio::net::TcpListener;

#[derive(Default)]
pub struct Counts {
    pub info: AtomicUsize,
    pub acknowledge: AtomicUsize,
    pub message: AtomicUsize,
    pub status: AtomicUsize,
}

pub struct MockGateway {
    pub url: String,
    pub counts: Arc<Counts>,
    /// Artificial latency for send_message, to provoke gate overlap.
    pub message_delay_ms: Arc<AtomicU64>,
}

#[derive(Clone)]
struct MockState {
    alert_info: Value,
    counts: Arc<Counts>,
    message_delay_ms: Arc<AtomicU64>,
}

/// Serve the mock gateway; `alert_info` is the `get_alert_info` payload.
pub async fn spawn_mock_gateway(alert_info: Value) -> MockGateway {
    let counts = Arc::new(Counts::default());
    let message_delay_ms = Arc::new(AtomicU64::new(0));

    let state = MockState {
        alert_info,
        counts: counts.clone(),
        message_delay_ms: message_delay_ms.clone(),
    };
    let app = Router::new().route("/", post(handle)).with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    MockGateway {
        url: format!("http://{addr}/"),
        counts,
        message_delay_ms,
    }
}

async fn handle(State(state): State<MockState>, Json(body): Json<Value>) -> Json<Value> {
    match body["action"].as_str() {
        Some("get_alert_info") => {
            state.counts.info.fetch_add(1, Ordering::SeqCst);
            if body["token"] == "expired-token" {
                Json(json!({
                    "success": false,
                    "error": { "message": "Token expired" },
                }))
            } else {
                Json(json!({ "success": true, "data": state.alert_info }))
            }
        }
        Some("acknowledge") => {
            let n = state.counts.acknowledge.fetch_add(1, Ordering::SeqCst) + 1;
            Json(json!({
                "success": true,
                "data": {
                    "acknowledgmentId": format!("ack-{n}"),
                    "acknowledgmentType": body["acknowledgmentType"],
                    "sosAlertId": "alert-1",
                    "userName": "Ada",
                    "message": "Acknowledged",
                },
            }))
        }
        Some("send_message") => {
            let delay = state.message_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            let n = state.counts.message.fetch_add(1, Ordering::SeqCst) + 1;
            Json(json!({
                "success": true,
                "data": {
                    "messageId": format!("msg-sent-{n}"),
                    "sosAlertId": "alert-1",
                    "sentAt": "2025-06-01T12:30:00Z",
                },
            }))
        }
        Some("status_update") => {
            state.counts.status.fetch_add(1, Ordering::SeqCst);
            Json(json!({
                "success": true,
                "data": {
                    "statusCode": body["statusCode"],
                    "statusText": "On my way",
                    "sosAlertId": "alert-1",
                },
            }))
        }
        _ => Json(json!({
            "success": false,
            "error": { "message": "unknown action" },
        })),
    }
}

/// Build a `get_alert_info` payload with the given status and messages.
pub fn alert_info_json(status: &str, messages: Value) -> Value {
    json!({
        "alert": {
            "id": "alert-1",
            "alert_type": "manual",
            "status": status,
            "message": "Help needed",
            "triggered_at": "2025-06-01T12:00:00Z",
            "resolved_at": null,
            "has_acknowledgments": false,
            "acknowledgment_count": 0,
            "responders_count": 0,
            "earliest_eta_minutes": null,
            "userName": "Ada",
            "location": {
                "latitude": 48.137,
                "longitude": 11.575,
                "accuracy": 25.0
            }
        },
        "contact": { "id": "contact-1", "name": "Grace" },
        "existingAcknowledgment": null,
        "messages": messages,
        "statusTemplates": [
            {
                "id": "tpl-1",
                "code": "omw",
                "display_text": "On my way",
                "icon": "🚗",
                "category": "Travel",
                "sort_order": 1,
                "is_active": true
            }
        ]
    })
}

/// Three transcript entries deliberately out of order.
pub fn unordered_messages() -> Value {
    json!([
        {
            "id": "msg-late",
            "sender_type": "user",
            "message_type": "text",
            "content": "anyone?",
            "latitude": null,
            "longitude": null,
            "created_at": "2025-06-01T12:20:00Z"
        },
        {
            "id": "msg-early",
            "sender_type": "user",
            "message_type": "text",
            "content": "please help",
            "latitude": null,
            "longitude": null,
            "created_at": "2025-06-01T12:05:00Z"
        },
        {
            "id": "msg-middle",
            "sender_type": "contact",
            "message_type": "text",
            "content": "seen it",
            "latitude": null,
            "longitude": null,
            "created_at": "2025-06-01T12:10:00Z"
        }
    ])
}
