//! Data models for Flare.
//!
//! These types mirror the wire contracts of the two backends the response
//! page talks to: the relational store behind the alert gateway and the
//! broadcast tree used for real-time fan-out. Field names follow the wire
//! (snake_case rows, a handful of camelCase leftovers like `userName`), so
//! every type here round-trips through serde unchanged.
//!
//! Nothing in this module performs I/O; reconciliation rules live in
//! [`crate::sync`], transport in [`crate::gateway`] and [`crate::feeds`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How the alert was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    /// The user pressed the SOS control themselves.
    Manual,
    /// Raised automatically by crash detection.
    CrashDetected,
}

/// Lifecycle status of an alert.
///
/// Only `Active` alerts accept acknowledgments and chat; once the status
/// leaves `Active` the client refuses submissions locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Active,
    Resolved,
    Cancelled,
}

impl AlertStatus {
    /// Whether the alert still accepts responder actions.
    pub fn is_active(self) -> bool {
        matches!(self, AlertStatus::Active)
    }
}

/// A responder's reply to the alert.
///
/// One acknowledgment exists per (alert, contact) pair upstream; a contact
/// transitioning through several types overwrites the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcknowledgmentType {
    Received,
    Responding,
    OnTheWay,
    Arrived,
    CannotHelp,
}

/// Kind of a chat entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    StatusUpdate,
    LocationShare,
}

/// Which side of the conversation authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderRole {
    /// The person who raised the alert.
    User,
    /// The responder viewing this page.
    Contact,
}

/// Last known position of the alerter.
///
/// Replaced wholesale on every location event, never merged field by
/// field. Last writer by arrival order wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    /// Accuracy radius in meters, when the device reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    /// Pre-built maps link supplied by the backend.
    #[serde(
        default,
        rename = "googleMapsUrl",
        skip_serializing_if = "Option::is_none"
    )]
    pub google_maps_url: Option<String>,
}

/// Snapshot of an SOS alert as served by the gateway.
///
/// Identity (`id`) is immutable for the alert's lifetime; `status` and
/// `resolved_at` are the only fields mutated afterwards, and only by feed
/// events. Live location is tracked beside the alert, not inside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyAlert {
    pub id: String,
    pub alert_type: AlertType,
    pub status: AlertStatus,
    pub message: Option<String>,
    pub triggered_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub has_acknowledgments: bool,
    #[serde(default)]
    pub acknowledgment_count: i64,
    #[serde(default)]
    pub responders_count: i64,
    pub earliest_eta_minutes: Option<i64>,
    #[serde(rename = "userName")]
    pub user_name: String,
    pub location: Option<Location>,
}

/// The responder identity bound to the capability token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub name: String,
}

/// A contact's acknowledgment of an alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Acknowledgment {
    pub id: String,
    pub sos_alert_id: String,
    pub contact_id: String,
    pub acknowledgment_type: AcknowledgmentType,
    pub message: Option<String>,
    pub eta_minutes: Option<i64>,
    pub responded_at: DateTime<Utc>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// One entry of the chat transcript.
///
/// Ordering is by `created_at` ascending. `id` is used only for
/// de-duplication across the two delivery paths, never for ordering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub sender_type: SenderRole,
    pub message_type: MessageKind,
    pub content: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// Static quick-reply catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusTemplate {
    pub id: String,
    pub code: String,
    pub display_text: String,
    pub icon: String,
    pub category: String,
    #[serde(default)]
    pub sort_order: i64,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

/// Group active templates by category for the quick-reply UI.
///
/// Categories keep their first-seen order; templates within a category are
/// ordered by `sort_order`. An empty category falls back to `"Other"`.
pub fn group_templates_by_category(
    templates: &[StatusTemplate],
) -> Vec<(String, Vec<StatusTemplate>)> {
    let mut groups: Vec<(String, Vec<StatusTemplate>)> = Vec::new();

    for template in templates.iter().filter(|t| t.is_active) {
        let category = if template.category.is_empty() {
            "Other".to_string()
        } else {
            template.category.clone()
        };

        match groups.iter_mut().find(|(name, _)| *name == category) {
            Some((_, entries)) => entries.push(template.clone()),
            None => groups.push((category, vec![template.clone()])),
        }
    }

    for (_, entries) in &mut groups {
        entries.sort_by_key(|t| t.sort_order);
    }

    groups
}

/// Everything the gateway returns for a valid token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertInfo {
    pub alert: EmergencyAlert,
    pub contact: Contact,
    #[serde(rename = "existingAcknowledgment")]
    pub existing_acknowledgment: Option<Acknowledgment>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default, rename = "statusTemplates")]
    pub status_templates: Vec<StatusTemplate>,
}
