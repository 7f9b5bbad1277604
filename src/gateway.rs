//! Remote alert gateway client.
//!
//! The gateway is a single HTTPS POST endpoint multiplexing four actions
//! through an `action` discriminator in the JSON body. Authentication is a
//! static API key (header) plus the per-alert capability token inside the
//! body. There is no user session; whoever holds the link holds the
//! capability.
//!
//! The client performs no retries. A transport or decode failure surfaces
//! as [`GatewayError::Network`], which callers must treat as "outcome
//! unknown": acknowledge and send-message are not idempotent, so blind
//! resubmission is left to the person behind the retry control, never done
//! here.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::GatewayError;
use crate::model::{AcknowledgmentType, AlertInfo, MessageKind};

/// Bound on every gateway round trip so hangs become typed errors.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Envelope every gateway response is wrapped in.
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ApiErrorBody>,
}

/// Error payload of a rejected request.
#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
    pub message: String,
}

/// Optional geo-tag attached to an acknowledgment or message.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// Optional fields of an acknowledge submission.
#[derive(Debug, Clone, Default)]
pub struct AckOptions {
    pub message: Option<String>,
    pub eta_minutes: Option<i64>,
    pub coords: Option<Coordinates>,
}

/// Confirmation of a persisted acknowledgment.
#[derive(Debug, Clone, Deserialize)]
pub struct AcknowledgeReceipt {
    #[serde(rename = "acknowledgmentId")]
    pub acknowledgment_id: String,
    #[serde(rename = "acknowledgmentType")]
    pub acknowledgment_type: AcknowledgmentType,
    #[serde(rename = "sosAlertId")]
    pub sos_alert_id: String,
    #[serde(rename = "userName", default)]
    pub user_name: String,
    #[serde(default)]
    pub message: String,
}

/// Confirmation of a persisted chat message.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageReceipt {
    #[serde(rename = "messageId")]
    pub message_id: String,
    #[serde(rename = "sosAlertId")]
    pub sos_alert_id: String,
    #[serde(rename = "sentAt")]
    pub sent_at: DateTime<Utc>,
}

/// Confirmation of a quick status update.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusReceipt {
    #[serde(rename = "statusCode")]
    pub status_code: String,
    #[serde(rename = "statusText")]
    pub status_text: String,
    #[serde(rename = "sosAlertId")]
    pub sos_alert_id: String,
}

#[derive(Debug, Serialize)]
struct AcknowledgeRequest<'a> {
    action: &'static str,
    token: &'a str,
    #[serde(rename = "acknowledgmentType")]
    acknowledgment_type: AcknowledgmentType,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
    #[serde(rename = "etaMinutes", skip_serializing_if = "Option::is_none")]
    eta_minutes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    longitude: Option<f64>,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    action: &'static str,
    token: &'a str,
    #[serde(rename = "messageType")]
    message_type: MessageKind,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    longitude: Option<f64>,
}

/// Client for the alert gateway endpoint.
#[derive(Clone)]
pub struct GatewayClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl GatewayClient {
    /// Create a client for the given endpoint and static API key.
    pub fn new(endpoint: &str, api_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.to_string(),
            api_key: api_key.to_string(),
        }
    }

    /// Fetch the full snapshot for a capability token.
    ///
    /// A rejected request means the token is invalid or expired. That is
    /// terminal for this token; the caller must obtain a new link.
    pub async fn fetch_alert_info(&self, token: &str) -> Result<AlertInfo, GatewayError> {
        self.request(
            serde_json::json!({ "action": "get_alert_info", "token": token }),
            GatewayError::TokenInvalidOrExpired,
        )
        .await
    }

    /// Persist an acknowledgment of the alert.
    pub async fn acknowledge(
        &self,
        token: &str,
        acknowledgment_type: AcknowledgmentType,
        options: &AckOptions,
    ) -> Result<AcknowledgeReceipt, GatewayError> {
        let body = AcknowledgeRequest {
            action: "acknowledge",
            token,
            acknowledgment_type,
            message: options.message.as_deref(),
            eta_minutes: options.eta_minutes,
            latitude: options.coords.map(|c| c.latitude),
            longitude: options.coords.map(|c| c.longitude),
        };
        self.request(
            serde_json::to_value(&body).map_err(GatewayError::network)?,
            GatewayError::ValidationRejected,
        )
        .await
    }

    /// Persist a chat message.
    pub async fn send_message(
        &self,
        token: &str,
        message_type: MessageKind,
        content: &str,
        coords: Option<Coordinates>,
    ) -> Result<MessageReceipt, GatewayError> {
        let body = SendMessageRequest {
            action: "send_message",
            token,
            message_type,
            content,
            latitude: coords.map(|c| c.latitude),
            longitude: coords.map(|c| c.longitude),
        };
        self.request(
            serde_json::to_value(&body).map_err(GatewayError::network)?,
            GatewayError::ValidationRejected,
        )
        .await
    }

    /// Send a quick status update by template code.
    pub async fn send_status(
        &self,
        token: &str,
        status_code: &str,
    ) -> Result<StatusReceipt, GatewayError> {
        self.request(
            serde_json::json!({
                "action": "status_update",
                "token": token,
                "statusCode": status_code,
            }),
            GatewayError::ValidationRejected,
        )
        .await
    }

    /// Execute one round trip and unwrap the `{success, data, error}`
    /// envelope. `rejected` decides what a server-side refusal means for
    /// this operation.
    async fn request<T: DeserializeOwned>(
        &self,
        body: serde_json::Value,
        rejected: fn(String) -> GatewayError,
    ) -> Result<T, GatewayError> {
        let response = self
            .client
            .post(&self.endpoint)
            .timeout(REQUEST_TIMEOUT)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(GatewayError::network)?;

        let envelope = response
            .json::<ApiEnvelope<T>>()
            .await
            .map_err(GatewayError::network)?;

        if !envelope.success {
            let message = envelope
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| "request rejected".to_string());
            debug!(%message, "gateway rejected request");
            return Err(rejected(message));
        }

        envelope
            .data
            .ok_or_else(|| GatewayError::network("success response without data payload"))
    }
}
