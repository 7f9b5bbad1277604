//! Row-change feed channel.
//!
//! Websocket client with subscribe-by-table-and-filter semantics: one
//! socket per subscription, a phoenix-style topic join, and a periodic
//! heartbeat to keep the connection alive. The backend delivers committed
//! row images in order per topic; cross-topic ordering is not guaranteed
//! and not assumed anywhere downstream.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::error::ChannelError;

/// Interval between phoenix heartbeats.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// Buffered row changes per subscription.
const ROW_BUFFER: usize = 64;

/// Row event kinds a subscription can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowEventKind {
    Insert,
    Update,
}

impl RowEventKind {
    fn as_wire(self) -> &'static str {
        match self {
            RowEventKind::Insert => "INSERT",
            RowEventKind::Update => "UPDATE",
        }
    }
}

/// One committed row change delivered by the channel.
#[derive(Debug, Clone)]
pub struct RowChange {
    pub kind: RowEventKind,
    /// The changed row's new field values.
    pub record: Value,
}

/// Client for the row-change websocket endpoint.
#[derive(Clone)]
pub struct RowFeedClient {
    url: String,
    api_key: String,
}

impl RowFeedClient {
    pub fn new(url: &str, api_key: &str) -> Self {
        Self {
            url: url.to_string(),
            api_key: api_key.to_string(),
        }
    }

    /// Open a subscription for one table, equality filter, and event kind.
    ///
    /// Returns the subscription handle and the stream of row changes. The
    /// stream ends on [`RowSubscription::shutdown`] or on a fatal socket
    /// error; it never resumes without a fresh subscribe.
    pub async fn subscribe(
        &self,
        table: &str,
        filter: &str,
        kind: RowEventKind,
    ) -> Result<(RowSubscription, mpsc::Receiver<RowChange>), ChannelError> {
        let url = format!("{}?apikey={}&vsn=1.0.0", self.url, self.api_key);
        let topic = topic_name(table, filter);

        let (mut socket, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;

        socket
            .send(Message::Text(join_message(&topic)))
            .await
            .map_err(|e| ChannelError::Protocol(e.to_string()))?;
        info!(%topic, "row-change subscription joined");

        let (mut write, mut read) = socket.split();
        let (tx, rx) = mpsc::channel(ROW_BUFFER);

        let reader = tokio::spawn({
            let topic = topic.clone();
            async move {
                while let Some(frame) = read.next().await {
                    match frame {
                        Ok(Message::Text(text)) => {
                            if let Some(record) = parse_row_event(&text, &topic, kind) {
                                if tx.send(RowChange { kind, record }).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Ok(Message::Close(_)) => {
                            info!(%topic, "row-change socket closed by server");
                            return;
                        }
                        Ok(_) => {}
                        Err(err) => {
                            warn!(%topic, %err, "row-change socket error");
                            return;
                        }
                    }
                }
            }
        });

        let heartbeat = tokio::spawn(async move {
            let mut heartbeat_ref: u64 = 1;
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                heartbeat_ref += 1;
                if write
                    .send(Message::Text(heartbeat_message(heartbeat_ref)))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        });

        Ok((RowSubscription { reader, heartbeat }, rx))
    }
}

/// Handle on one live row-change subscription.
pub struct RowSubscription {
    reader: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

impl RowSubscription {
    /// Stop the socket tasks. Idempotent; no row change is delivered after
    /// this returns.
    pub fn shutdown(&self) {
        self.reader.abort();
        self.heartbeat.abort();
    }
}

impl Drop for RowSubscription {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn topic_name(table: &str, filter: &str) -> String {
    format!("realtime:public:{table}:{filter}")
}

fn join_message(topic: &str) -> String {
    serde_json::json!({
        "topic": topic,
        "event": "phx_join",
        "payload": {},
        "ref": "1",
    })
    .to_string()
}

fn heartbeat_message(heartbeat_ref: u64) -> String {
    serde_json::json!({
        "topic": "phoenix",
        "event": "heartbeat",
        "payload": {},
        "ref": heartbeat_ref.to_string(),
    })
    .to_string()
}

/// Extract the row image from a channel frame, if it is the event this
/// subscription asked for.
fn parse_row_event(text: &str, topic: &str, kind: RowEventKind) -> Option<Value> {
    let frame: Value = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            debug!(%err, "ignoring undecodable channel frame");
            return None;
        }
    };

    if frame["topic"].as_str() != Some(topic) {
        return None;
    }
    if frame["event"].as_str() != Some(kind.as_wire()) {
        return None;
    }

    let record = frame["payload"]["record"].clone();
    record.is_object().then_some(record)
}
