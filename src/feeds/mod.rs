//! Dual real-time feed adapter.
//!
//! Two independently operated push channels cover overlapping data: the
//! relational backend's row-change feed (websocket, [`row_change`]) and the
//! broadcast tree (HTTP streaming, [`broadcast`]). This module normalizes
//! both into exactly three typed event kinds and multiplexes them onto one
//! stream the reconciliation layer consumes.
//!
//! Contract: a subscription emits zero or more events after
//! [`FeedAdapter::start`], none after [`FeedGuard::unsubscribe`], and never
//! emits again after a fatal channel error without a fresh subscribe. A
//! fault is reported through the `degraded` flag: stale-data risk, not a
//! page error.

pub mod broadcast;
pub mod row_change;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::ChannelError;
use crate::model::{AlertStatus, ChatMessage, Location};

use self::broadcast::{BroadcastClient, BroadcastSubscription};
use self::row_change::{RowChange, RowEventKind, RowFeedClient, RowSubscription};

/// Table holding the alert rows (status + location columns).
pub const ALERTS_TABLE: &str = "sos_alerts";
/// Table holding chat rows.
pub const CHAT_TABLE: &str = "emergency_chat_messages";

/// Buffered events between the channel tasks and the consumer.
const EVENT_BUFFER: usize = 64;

/// A normalized update from either real-time channel.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// The alerter's position changed; replaces the previous location.
    LocationChanged(Location),
    /// The alert's lifecycle status changed.
    AlertStatusChanged {
        status: AlertStatus,
        resolved_at: Option<DateTime<Utc>>,
    },
    /// A chat message was appended by either delivery path.
    MessageAppended(ChatMessage),
}

/// Normalize a `sos_alerts` UPDATE row image.
///
/// One row update can yield both a status event and a location event. The
/// location fires only when both coordinates are present in the image
/// (presence, not truthiness, so an exact-zero coordinate still counts).
pub fn row_update_events(record: &Value) -> Vec<FeedEvent> {
    let mut events = Vec::new();

    if let Ok(status) = serde_json::from_value::<AlertStatus>(record["status"].clone()) {
        let resolved_at = serde_json::from_value(record["resolved_at"].clone()).unwrap_or(None);
        events.push(FeedEvent::AlertStatusChanged {
            status,
            resolved_at,
        });
    }

    if let (Some(latitude), Some(longitude)) =
        (record["latitude"].as_f64(), record["longitude"].as_f64())
    {
        events.push(FeedEvent::LocationChanged(Location {
            latitude,
            longitude,
            accuracy: record["location_accuracy_m"].as_f64(),
            google_maps_url: None,
        }));
    }

    events
}

/// Normalize an `emergency_chat_messages` INSERT row image.
pub fn chat_insert_event(record: &Value) -> Option<FeedEvent> {
    match serde_json::from_value::<ChatMessage>(record.clone()) {
        Ok(message) => Some(FeedEvent::MessageAppended(message)),
        Err(err) => {
            warn!(%err, "dropping undecodable chat row");
            None
        }
    }
}

/// Keep only messages whose id has not been seen yet, recording the rest.
///
/// The broadcast tree fires the complete child set on every write, so this
/// is what turns snapshots into append events.
pub fn diff_new_messages(
    seen: &mut HashSet<String>,
    snapshot: Vec<ChatMessage>,
) -> Vec<ChatMessage> {
    snapshot
        .into_iter()
        .filter(|message| seen.insert(message.id.clone()))
        .collect()
}

/// Teardown handle for an established feed subscription.
///
/// `unsubscribe` is idempotent and safe to call from any exit path; it is
/// also invoked on drop so a dropped subscription cannot leak a live push
/// connection.
pub struct FeedGuard {
    live: Arc<AtomicBool>,
    pumps: Vec<JoinHandle<()>>,
    alerts: RowSubscription,
    chats: RowSubscription,
    messages: BroadcastSubscription,
}

impl FeedGuard {
    /// Stop all channel tasks. No event is delivered after this returns.
    pub fn unsubscribe(&self) {
        self.live.store(false, Ordering::SeqCst);
        for pump in &self.pumps {
            pump.abort();
        }
        self.alerts.shutdown();
        self.chats.shutdown();
        self.messages.shutdown();
    }
}

impl Drop for FeedGuard {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// An established dual-channel subscription for one alert.
pub struct FeedSubscription {
    /// Normalized event stream. Closes after unsubscribe, or once every
    /// channel has faulted.
    pub events: mpsc::Receiver<FeedEvent>,
    /// Flips to `true` when a channel reported a fatal error while the
    /// subscription was still live.
    pub degraded: watch::Receiver<bool>,
    /// Teardown handle.
    pub guard: FeedGuard,
}

/// Factory wiring both channels for a single alert id.
pub struct FeedAdapter;

impl FeedAdapter {
    /// Subscribe both channels for `alert_id` and start normalization.
    ///
    /// `seen_message_ids` seeds the broadcast de-duplication set, normally
    /// with the ids already present in the fetched snapshot, so the
    /// broadcast channel's initial full-set delivery does not replay them.
    pub async fn start(
        row_client: &RowFeedClient,
        broadcast_client: &BroadcastClient,
        alert_id: &str,
        seen_message_ids: impl IntoIterator<Item = String>,
    ) -> Result<FeedSubscription, ChannelError> {
        let (alerts, alert_rows) = row_client
            .subscribe(ALERTS_TABLE, &format!("id=eq.{alert_id}"), RowEventKind::Update)
            .await?;
        let (chats, chat_rows) = row_client
            .subscribe(
                CHAT_TABLE,
                &format!("sos_alert_id=eq.{alert_id}"),
                RowEventKind::Insert,
            )
            .await?;
        let (messages, message_sets) = broadcast_client.subscribe_messages(alert_id).await?;

        let live = Arc::new(AtomicBool::new(true));
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let (degraded_tx, degraded_rx) = watch::channel(false);
        let degraded_tx = Arc::new(degraded_tx);

        let pumps = vec![
            tokio::spawn(pump_alert_rows(
                alert_rows,
                event_tx.clone(),
                live.clone(),
                degraded_tx.clone(),
            )),
            tokio::spawn(pump_chat_rows(
                chat_rows,
                event_tx.clone(),
                live.clone(),
                degraded_tx.clone(),
            )),
            tokio::spawn(pump_message_sets(
                message_sets,
                seen_message_ids.into_iter().collect(),
                event_tx,
                live.clone(),
                degraded_tx,
            )),
        ];

        Ok(FeedSubscription {
            events: event_rx,
            degraded: degraded_rx,
            guard: FeedGuard {
                live,
                pumps,
                alerts,
                chats,
                messages,
            },
        })
    }
}

fn mark_degraded(live: &AtomicBool, degraded: &watch::Sender<bool>, channel: &str) {
    // A closed source is only a fault while the subscription is live;
    // after unsubscribe it is the expected shutdown path.
    if live.load(Ordering::SeqCst) {
        warn!(channel, "real-time channel ended; data may be stale");
        degraded.send_replace(true);
    }
}

async fn pump_alert_rows(
    mut rows: mpsc::Receiver<RowChange>,
    events: mpsc::Sender<FeedEvent>,
    live: Arc<AtomicBool>,
    degraded: Arc<watch::Sender<bool>>,
) {
    while let Some(change) = rows.recv().await {
        if !live.load(Ordering::SeqCst) {
            return;
        }
        for event in row_update_events(&change.record) {
            if events.send(event).await.is_err() {
                return;
            }
        }
    }
    mark_degraded(&live, &degraded, "row-change:alerts");
}

async fn pump_chat_rows(
    mut rows: mpsc::Receiver<RowChange>,
    events: mpsc::Sender<FeedEvent>,
    live: Arc<AtomicBool>,
    degraded: Arc<watch::Sender<bool>>,
) {
    while let Some(change) = rows.recv().await {
        if !live.load(Ordering::SeqCst) {
            return;
        }
        if let Some(event) = chat_insert_event(&change.record) {
            if events.send(event).await.is_err() {
                return;
            }
        }
    }
    mark_degraded(&live, &degraded, "row-change:chat");
}

async fn pump_message_sets(
    mut sets: mpsc::Receiver<Vec<ChatMessage>>,
    mut seen: HashSet<String>,
    events: mpsc::Sender<FeedEvent>,
    live: Arc<AtomicBool>,
    degraded: Arc<watch::Sender<bool>>,
) {
    while let Some(snapshot) = sets.recv().await {
        if !live.load(Ordering::SeqCst) {
            return;
        }
        let fresh = diff_new_messages(&mut seen, snapshot);
        debug!(count = fresh.len(), "broadcast set diffed");
        for message in fresh {
            if events
                .send(FeedEvent::MessageAppended(message))
                .await
                .is_err()
            {
                return;
            }
        }
    }
    mark_degraded(&live, &degraded, "broadcast:messages");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MessageKind, SenderRole};

    fn message(id: &str, at: &str) -> ChatMessage {
        ChatMessage {
            id: id.to_string(),
            sender_type: SenderRole::User,
            message_type: MessageKind::Text,
            content: "hello".to_string(),
            latitude: None,
            longitude: None,
            created_at: at.parse().unwrap(),
        }
    }

    #[test]
    fn test_row_update_yields_status_and_location() {
        let record = serde_json::json!({
            "id": "alert-1",
            "status": "active",
            "resolved_at": null,
            "latitude": 48.1,
            "longitude": 11.5,
            "location_accuracy_m": 30.0
        });

        let events = row_update_events(&record);

        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0],
            FeedEvent::AlertStatusChanged {
                status: AlertStatus::Active,
                resolved_at: None
            }
        ));
        match &events[1] {
            FeedEvent::LocationChanged(location) => {
                assert_eq!(location.latitude, 48.1);
                assert_eq!(location.accuracy, Some(30.0));
            }
            other => panic!("expected location event, got {other:?}"),
        }
    }

    #[test]
    fn test_row_update_without_coordinates_yields_status_only() {
        let record = serde_json::json!({
            "status": "resolved",
            "resolved_at": "2025-06-01T13:00:00Z",
            "latitude": null,
            "longitude": null
        });

        let events = row_update_events(&record);

        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            FeedEvent::AlertStatusChanged {
                status: AlertStatus::Resolved,
                resolved_at: Some(_)
            }
        ));
    }

    #[test]
    fn test_zero_coordinates_still_emit_location() {
        let record = serde_json::json!({
            "latitude": 0.0,
            "longitude": 0.0
        });

        let events = row_update_events(&record);

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], FeedEvent::LocationChanged(_)));
    }

    #[test]
    fn test_chat_insert_event_decodes_row() {
        let record = serde_json::json!({
            "id": "msg-1",
            "sender_type": "contact",
            "message_type": "text",
            "content": "omw",
            "created_at": "2025-06-01T12:05:00Z"
        });

        match chat_insert_event(&record) {
            Some(FeedEvent::MessageAppended(message)) => {
                assert_eq!(message.id, "msg-1");
                assert_eq!(message.sender_type, SenderRole::Contact);
            }
            other => panic!("expected message event, got {other:?}"),
        }
    }

    #[test]
    fn test_diff_new_messages_emits_each_id_once() {
        let mut seen = HashSet::from(["msg-1".to_string()]);

        let first = diff_new_messages(
            &mut seen,
            vec![
                message("msg-1", "2025-06-01T12:00:00Z"),
                message("msg-2", "2025-06-01T12:01:00Z"),
            ],
        );
        let ids: Vec<&str> = first.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["msg-2"]);

        // The full set fires again on the next write; nothing is replayed.
        let second = diff_new_messages(
            &mut seen,
            vec![
                message("msg-1", "2025-06-01T12:00:00Z"),
                message("msg-2", "2025-06-01T12:01:00Z"),
                message("msg-3", "2025-06-01T12:02:00Z"),
            ],
        );
        let ids: Vec<&str> = second.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["msg-3"]);
    }
}
