//! Integration tests for the session core against a mock gateway.
//!
//! These drive the full path wire-in, wire-out: snapshot fetch through the
//! real gateway client, feed events through the adapter's event stream,
//! actions through the binding layer.

mod common;

use std::sync::atomic::Ordering;

use serde_json::json;
use tokio::sync::mpsc;

use flare::feeds::FeedEvent;
use flare::gateway::{AckOptions, GatewayClient};
use flare::model::{AcknowledgmentType, AlertStatus, Location};
use flare::session::ResponseSession;

use common::{alert_info_json, spawn_mock_gateway, unordered_messages};

/// Wait (bounded) until the reconciled state satisfies a predicate.
async fn wait_until(session: &ResponseSession, pred: impl Fn(&flare::sync::ResponseState) -> bool) {
    let mut watcher = session.subscribe();
    tokio::time::timeout(std::time::Duration::from_secs(2), async move {
        loop {
            if pred(&watcher.borrow_and_update()) {
                return;
            }
            watcher.changed().await.unwrap();
        }
    })
    .await
    .expect("state never reached the expected shape");
}

async fn open_session(
    alert_info: serde_json::Value,
) -> (ResponseSession, mpsc::Sender<FeedEvent>, common::MockGateway) {
    let mock = spawn_mock_gateway(alert_info).await;
    let gateway = GatewayClient::new(&mock.url, "test-key");
    let info = gateway.fetch_alert_info("tok-1").await.unwrap();

    let (event_tx, event_rx) = mpsc::channel(16);
    let session = ResponseSession::with_parts(gateway, "tok-1", info, event_rx, None);
    (session, event_tx, mock)
}

#[tokio::test]
async fn test_snapshot_messages_arrive_sorted() {
    let (session, _events, _mock) =
        open_session(alert_info_json("active", unordered_messages())).await;

    let state = session.state();
    let ids: Vec<&str> = state.messages.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["msg-early", "msg-middle", "msg-late"]);
    // Snapshot location seeds the live location.
    assert_eq!(state.location.unwrap().latitude, 48.137);
}

#[tokio::test]
async fn test_resolved_alert_refuses_actions_without_gateway_contact() {
    let (session, _events, mock) =
        open_session(alert_info_json("resolved", json!([]))).await;

    assert!(!session.send_message("hello?").await);
    assert!(
        !session
            .acknowledge(AcknowledgmentType::Received, AckOptions::default())
            .await
    );
    assert!(!session.send_status("omw").await);

    assert_eq!(mock.counts.message.load(Ordering::SeqCst), 0);
    assert_eq!(mock.counts.acknowledge.load(Ordering::SeqCst), 0);
    assert_eq!(mock.counts.status.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_acknowledge_then_upgrade_keeps_latest_only() {
    let (session, _events, _mock) =
        open_session(alert_info_json("active", json!([]))).await;

    let options = AckOptions {
        eta_minutes: Some(15),
        ..AckOptions::default()
    };
    assert!(session.acknowledge(AcknowledgmentType::OnTheWay, options).await);

    let ack = session.state().own_acknowledgment.unwrap();
    assert_eq!(ack.acknowledgment_type, AcknowledgmentType::OnTheWay);
    assert_eq!(ack.eta_minutes, Some(15));

    assert!(
        session
            .acknowledge(AcknowledgmentType::Arrived, AckOptions::default())
            .await
    );

    let ack = session.state().own_acknowledgment.unwrap();
    assert_eq!(ack.acknowledgment_type, AcknowledgmentType::Arrived);
    assert_eq!(ack.eta_minutes, None);
    assert_eq!(ack.contact_id, "contact-1");
}

#[tokio::test]
async fn test_confirmed_send_applies_once_despite_feed_echo() {
    let (session, events, _mock) =
        open_session(alert_info_json("active", json!([]))).await;

    assert!(session.send_message("on my way").await);

    let state = session.state();
    assert_eq!(state.messages.len(), 1);
    let sent = state.messages[0].clone();
    assert_eq!(sent.id, "msg-sent-1");

    // The echo comes back through a feed with the same id but reordered /
    // differently cased field content; it must be a no-op.
    events
        .send(FeedEvent::MessageAppended(sent.clone()))
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert_eq!(session.state().messages.len(), 1);
}

#[tokio::test]
async fn test_second_send_rejected_while_first_in_flight() {
    let (session, _events, mock) =
        open_session(alert_info_json("active", json!([]))).await;
    mock.message_delay_ms.store(150, Ordering::SeqCst);

    let session = std::sync::Arc::new(session);
    let first = {
        let session = session.clone();
        tokio::spawn(async move { session.send_message("first").await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;

    // The gate refuses the overlap without contacting the gateway.
    assert!(!session.send_message("second").await);
    assert!(first.await.unwrap());
    assert_eq!(mock.counts.message.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_location_and_status_interleavings_converge() {
    let location = FeedEvent::LocationChanged(Location {
        latitude: 48.2,
        longitude: 11.6,
        accuracy: None,
        google_maps_url: None,
    });
    let status = FeedEvent::AlertStatusChanged {
        status: AlertStatus::Resolved,
        resolved_at: Some("2025-06-01T13:00:00Z".parse().unwrap()),
    };

    let (one, one_events, _m1) = open_session(alert_info_json("active", json!([]))).await;
    one_events.send(location.clone()).await.unwrap();
    one_events.send(status.clone()).await.unwrap();

    let (other, other_events, _m2) = open_session(alert_info_json("active", json!([]))).await;
    other_events.send(status).await.unwrap();
    other_events.send(location).await.unwrap();

    let settled = |state: &flare::sync::ResponseState| {
        state.location.as_ref().is_some_and(|l| l.latitude == 48.2)
            && state
                .alert
                .as_ref()
                .is_some_and(|a| a.status == AlertStatus::Resolved)
    };
    wait_until(&one, settled).await;
    wait_until(&other, settled).await;

    let one = one.state();
    let other = other.state();
    assert_eq!(one.location, other.location);
    assert_eq!(one.alert.unwrap(), other.alert.unwrap());
}

#[tokio::test]
async fn test_status_change_closes_controls_live() {
    let (session, events, mock) =
        open_session(alert_info_json("active", json!([]))).await;

    assert!(session.send_status("omw").await);
    assert_eq!(mock.counts.status.load(Ordering::SeqCst), 1);

    events
        .send(FeedEvent::AlertStatusChanged {
            status: AlertStatus::Cancelled,
            resolved_at: None,
        })
        .await
        .unwrap();
    wait_until(&session, |state| {
        state
            .alert
            .as_ref()
            .is_some_and(|a| a.status == AlertStatus::Cancelled)
    })
    .await;

    // The stale view may still show controls; the core refuses anyway.
    assert!(!session.send_status("omw").await);
    assert_eq!(mock.counts.status.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_closed_session_ignores_late_feed_callback() {
    let (session, events, _mock) =
        open_session(alert_info_json("active", json!([]))).await;

    session.close();
    let _ = events
        .send(FeedEvent::AlertStatusChanged {
            status: AlertStatus::Resolved,
            resolved_at: None,
        })
        .await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert_eq!(session.state().alert.unwrap().status, AlertStatus::Active);
}

#[tokio::test]
async fn test_expired_token_is_terminal() {
    let mock = spawn_mock_gateway(alert_info_json("active", json!([]))).await;
    let gateway = GatewayClient::new(&mock.url, "test-key");

    let err = gateway.fetch_alert_info("expired-token").await.unwrap_err();
    assert!(matches!(
        err,
        flare::error::GatewayError::TokenInvalidOrExpired(_)
    ));
}
