//! HTTP routing surface.
//!
//! Two URL path shapes resolve to the same response view, keyed by the
//! capability token in the path; every other path is a static not-found
//! view. The handlers only mount sessions and serialize whatever the core
//! emits; no reconciliation logic lives here.
//!
//! The capability token is the whole authorization, so it is never written
//! to logs; spans carry the alert id instead.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::error::GatewayError;
use crate::gateway::{AckOptions, Coordinates};
use crate::model::AcknowledgmentType;
use crate::session::ResponseSession;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    config: Config,
    /// One live session per token, shared by view and action handlers.
    sessions: Arc<RwLock<HashMap<String, Arc<ResponseSession>>>>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Look up the mounted session for a token, opening one on first use.
    async fn session(&self, token: &str) -> Result<Arc<ResponseSession>, GatewayError> {
        if let Some(session) = self.sessions.read().await.get(token) {
            return Ok(session.clone());
        }

        // Opened outside the lock; a concurrent first request may race us,
        // in which case the loser is torn down again.
        let opened = Arc::new(ResponseSession::open(&self.config, token).await?);
        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .entry(token.to_string())
            .or_insert_with(|| opened.clone());
        if !Arc::ptr_eq(entry, &opened) {
            opened.close();
        }
        Ok(entry.clone())
    }
}

/// Build the full router for the routing surface.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/respond/:token", get(get_respond))
        .route("/emergency/respond/:token", get(get_respond))
        .route("/respond/:token/acknowledge", post(post_acknowledge))
        .route(
            "/emergency/respond/:token/acknowledge",
            post(post_acknowledge),
        )
        .route("/respond/:token/message", post(post_message))
        .route("/emergency/respond/:token/message", post(post_message))
        .route("/respond/:token/status", post(post_status))
        .route("/emergency/respond/:token/status", post(post_status))
        .fallback(not_found)
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

/// Body of an acknowledge POST.
#[derive(Debug, Deserialize)]
pub struct AcknowledgeBody {
    #[serde(rename = "acknowledgmentType")]
    pub acknowledgment_type: AcknowledgmentType,
    pub message: Option<String>,
    #[serde(rename = "etaMinutes")]
    pub eta_minutes: Option<i64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Body of a chat message POST.
#[derive(Debug, Deserialize)]
pub struct MessageBody {
    pub content: String,
}

/// Body of a quick status POST.
#[derive(Debug, Deserialize)]
pub struct StatusBody {
    #[serde(rename = "statusCode")]
    pub status_code: String,
}

/// Result of an action POST; failure details stay in the logs.
#[derive(Debug, Serialize)]
pub struct ActionOutcome {
    pub success: bool,
}

/// GET /respond/{token}: the response view.
#[instrument(skip_all)]
pub async fn get_respond(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> impl IntoResponse {
    match state.session(&token).await {
        Ok(session) => {
            info!(alert_id = %session.alert_id(), "response view rendered");
            Json(session.state()).into_response()
        }
        Err(err) => expired_or_failed(err),
    }
}

/// POST /respond/{token}/acknowledge
#[instrument(skip_all)]
pub async fn post_acknowledge(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(body): Json<AcknowledgeBody>,
) -> impl IntoResponse {
    let session = match state.session(&token).await {
        Ok(session) => session,
        Err(err) => return expired_or_failed(err),
    };

    let coords = match (body.latitude, body.longitude) {
        (Some(latitude), Some(longitude)) => Some(Coordinates {
            latitude,
            longitude,
        }),
        _ => None,
    };
    let options = AckOptions {
        message: body.message,
        eta_minutes: body.eta_minutes,
        coords,
    };

    let success = session.acknowledge(body.acknowledgment_type, options).await;
    Json(ActionOutcome { success }).into_response()
}

/// POST /respond/{token}/message
#[instrument(skip_all)]
pub async fn post_message(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(body): Json<MessageBody>,
) -> impl IntoResponse {
    let session = match state.session(&token).await {
        Ok(session) => session,
        Err(err) => return expired_or_failed(err),
    };

    let success = session.send_message(&body.content).await;
    Json(ActionOutcome { success }).into_response()
}

/// POST /respond/{token}/status
#[instrument(skip_all)]
pub async fn post_status(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(body): Json<StatusBody>,
) -> impl IntoResponse {
    let session = match state.session(&token).await {
        Ok(session) => session,
        Err(err) => return expired_or_failed(err),
    };

    let success = session.send_status(&body.status_code).await;
    Json(ActionOutcome { success }).into_response()
}

/// Static not-found view for every unknown path.
pub async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({
            "view": "not_found",
            "message": "This page does not exist.",
        })),
    )
}

fn expired_or_failed(err: GatewayError) -> axum::response::Response {
    match err {
        GatewayError::TokenInvalidOrExpired(message) => {
            info!("token rejected; rendering expired view");
            (
                StatusCode::GONE,
                Json(serde_json::json!({
                    "view": "token_expired",
                    "message": message,
                })),
            )
                .into_response()
        }
        err => {
            warn!(%err, "snapshot fetch failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({
                    "view": "error",
                    "message": err.to_string(),
                })),
            )
                .into_response()
        }
    }
}
