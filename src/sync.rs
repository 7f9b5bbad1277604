//! Reconciliation state machine.
//!
//! One state container merges the gateway snapshot, feed events from both
//! real-time channels, and confirmed local mutations into the single view
//! the presentation layer renders. The merge rules make event application
//! commutative and idempotent across channel interleavings:
//!
//! - location and status are **replaced**, never merged field by field, so
//!   the last arrival wins regardless of which channel delivered first;
//! - messages are merged **by id** into a list ordered by creation time,
//!   so a duplicate delivery (or a local echo coming back) is a no-op.
//!
//! The reconciled state is a pure function of (snapshot, ordered events
//! per channel, confirmed local mutations); nothing here performs I/O.

use serde::Serialize;

use crate::feeds::FeedEvent;
use crate::model::{
    Acknowledgment, AlertInfo, ChatMessage, Contact, EmergencyAlert, Location, StatusTemplate,
};

/// Lifecycle phase of the reconciled view.
///
/// `Loading -> Ready` on a successful snapshot fetch, `Loading -> Errored`
/// on a rejected token. `Errored` is terminal for the token: the page
/// shows the token-expired view and never retries on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Loading,
    Ready,
    Errored,
}

/// The reconciled, render-ready view of one alert.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseState {
    pub phase: Phase,
    /// Human-readable reason when `phase` is `Errored`.
    pub error: Option<String>,
    pub alert: Option<EmergencyAlert>,
    pub contact: Option<Contact>,
    /// The viewing contact's own acknowledgment; replaced, never appended.
    pub own_acknowledgment: Option<Acknowledgment>,
    /// Chat transcript, ascending by creation time.
    pub messages: Vec<ChatMessage>,
    /// Last known location, replaced wholesale by each location event.
    pub location: Option<Location>,
    pub status_templates: Vec<StatusTemplate>,
    /// A real-time channel faulted; data may be stale but the page stays.
    pub channel_degraded: bool,
}

impl ResponseState {
    pub fn loading() -> Self {
        Self {
            phase: Phase::Loading,
            error: None,
            alert: None,
            contact: None,
            own_acknowledgment: None,
            messages: Vec::new(),
            location: None,
            status_templates: Vec::new(),
            channel_degraded: false,
        }
    }

    /// Terminal failure for this token.
    pub fn errored(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            phase: Phase::Errored,
            ..Self::loading()
        }
    }

    /// Seed the state from a fetched snapshot.
    ///
    /// Messages are sorted ascending by creation time no matter the input
    /// order; the location starts from the snapshot's last known one.
    pub fn ready(info: AlertInfo) -> Self {
        let mut messages = info.messages;
        messages.sort_by_key(|m| m.created_at);

        Self {
            phase: Phase::Ready,
            error: None,
            location: info.alert.location.clone(),
            alert: Some(info.alert),
            contact: Some(info.contact),
            own_acknowledgment: info.existing_acknowledgment,
            messages,
            status_templates: info.status_templates,
            channel_degraded: false,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.phase == Phase::Ready
    }

    /// Whether actions are currently allowed: the view is ready and the
    /// alert has not left `active`.
    pub fn is_active(&self) -> bool {
        self.is_ready()
            && self
                .alert
                .as_ref()
                .is_some_and(|alert| alert.status.is_active())
    }

    /// Merge one feed event into the state.
    ///
    /// No-op outside the `Ready` phase. Commutative across the location /
    /// status event kinds and idempotent for message appends.
    pub fn apply(&mut self, event: &FeedEvent) {
        if !self.is_ready() {
            return;
        }

        match event {
            FeedEvent::LocationChanged(location) => {
                self.location = Some(location.clone());
            }
            FeedEvent::AlertStatusChanged {
                status,
                resolved_at,
            } => {
                if let Some(alert) = self.alert.as_mut() {
                    alert.status = *status;
                    alert.resolved_at = *resolved_at;
                }
            }
            FeedEvent::MessageAppended(message) => {
                self.append_message(message.clone());
            }
        }
    }

    /// Insert a message unless its id is already present, keeping the
    /// transcript ordered by creation time (ties keep arrival order).
    pub fn append_message(&mut self, message: ChatMessage) {
        if self.messages.iter().any(|m| m.id == message.id) {
            return;
        }
        let position = self
            .messages
            .partition_point(|m| m.created_at <= message.created_at);
        self.messages.insert(position, message);
    }

    /// Replace the viewing contact's own acknowledgment.
    ///
    /// The last locally confirmed submission wins for this client's
    /// display; earlier fields (such as a previous ETA) do not survive.
    pub fn set_own_acknowledgment(&mut self, acknowledgment: Acknowledgment) {
        self.own_acknowledgment = Some(acknowledgment);
    }

    /// Record that a feed channel reported a fatal error. Sticky for the
    /// lifetime of this state.
    pub fn mark_channel_degraded(&mut self) {
        self.channel_degraded = true;
    }
}
