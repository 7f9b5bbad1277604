//! Broadcast-tree feed channel.
//!
//! The broadcast store is a key-value tree namespaced per alert
//! (`emergency_chats/{alert_id}`) with `messages` and `acknowledgments`
//! sub-paths. Reads are an HTTP streaming subscription (`text/event-stream`
//! with `put`/`patch` frames carrying `{path, data}`); every applied write
//! yields the complete current child set, which is what the adapter diffs.
//! Writes are plain REST `PUT`s on child paths: the local-echo path for
//! messages and for the per-contact acknowledgment slot.

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::ChannelError;
use crate::model::{Acknowledgment, ChatMessage, MessageKind, SenderRole};

/// Root namespace of the per-alert trees.
const TREE_ROOT: &str = "emergency_chats";

/// Buffered child-set snapshots per subscription.
const SET_BUFFER: usize = 16;

/// A chat message as stored in the broadcast tree.
///
/// Children written by other clients can miss fields, so everything is
/// optional on the way in and filled with the same defaults the upstream
/// writers assume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BroadcastMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_type: Option<SenderRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_contact_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<MessageKind>,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub read_by_user: bool,
    #[serde(default)]
    pub read_by_contact: bool,
}

impl BroadcastMessage {
    /// Build the echo payload for a message this client just persisted.
    pub fn from_chat(message: &ChatMessage, sender_contact_id: Option<&str>) -> Self {
        Self {
            sender_type: Some(message.sender_type),
            sender_user_id: None,
            sender_contact_id: sender_contact_id.map(str::to_string),
            message_type: Some(message.message_type),
            content: message.content.clone(),
            latitude: message.latitude,
            longitude: message.longitude,
            created_at: Some(message.created_at),
            read_by_user: message.sender_type == SenderRole::User,
            read_by_contact: message.sender_type == SenderRole::Contact,
        }
    }

    /// Convert a tree child into a transcript entry, keyed by its node id.
    pub fn into_chat_message(self, id: &str) -> ChatMessage {
        ChatMessage {
            id: id.to_string(),
            sender_type: self.sender_type.unwrap_or(SenderRole::User),
            message_type: self.message_type.unwrap_or(MessageKind::Text),
            content: self.content,
            latitude: self.latitude,
            longitude: self.longitude,
            created_at: self.created_at.unwrap_or_else(Utc::now),
        }
    }
}

/// Per-contact acknowledgment slot, last write wins.
///
/// Optionals serialize as explicit nulls; the store rejects absent values
/// on this path.
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastAcknowledgment {
    pub id: String,
    pub contact_id: String,
    pub acknowledgment_type: crate::model::AcknowledgmentType,
    pub eta_minutes: Option<i64>,
    pub message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Acknowledgment> for BroadcastAcknowledgment {
    fn from(ack: &Acknowledgment) -> Self {
        Self {
            id: ack.id.clone(),
            contact_id: ack.contact_id.clone(),
            acknowledgment_type: ack.acknowledgment_type,
            eta_minutes: ack.eta_minutes,
            message: ack.message.clone(),
            updated_at: ack.responded_at,
        }
    }
}

/// Client for the broadcast tree.
#[derive(Clone)]
pub struct BroadcastClient {
    client: reqwest::Client,
    base_url: String,
}

impl BroadcastClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn node_url(&self, segments: &[&str]) -> String {
        let path: Vec<String> = segments
            .iter()
            .map(|s| urlencoding::encode(s).into_owned())
            .collect();
        format!("{}/{}.json", self.base_url, path.join("/"))
    }

    /// Subscribe to the full message set of one alert.
    ///
    /// Emits the complete current child set after every applied write,
    /// starting with the initial state of the tree.
    pub async fn subscribe_messages(
        &self,
        alert_id: &str,
    ) -> Result<(BroadcastSubscription, mpsc::Receiver<Vec<ChatMessage>>), ChannelError> {
        let url = self.node_url(&[TREE_ROOT, alert_id, "messages"]);
        let response = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ChannelError::Connect(format!(
                "stream request returned {}",
                response.status()
            )));
        }
        info!(alert_id, "broadcast message stream opened");

        let (tx, rx) = mpsc::channel(SET_BUFFER);
        let reader = tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut parser = SseParser::default();
            let mut tree = Value::Object(Map::new());

            while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        warn!(%err, "broadcast stream transport error");
                        return;
                    }
                };
                for frame in parser.push(&bytes) {
                    match frame.event.as_str() {
                        "put" | "patch" => {
                            let body: SseUpdate = match serde_json::from_str(&frame.data) {
                                Ok(body) => body,
                                Err(err) => {
                                    warn!(%err, "undecodable broadcast frame");
                                    continue;
                                }
                            };
                            apply_update(
                                &mut tree,
                                &body.path,
                                body.data,
                                frame.event == "patch",
                            );
                            if tx.send(decode_children(&tree)).await.is_err() {
                                return;
                            }
                        }
                        "keep-alive" => {}
                        "cancel" | "auth_revoked" => {
                            warn!(event = %frame.event, "broadcast subscription revoked");
                            return;
                        }
                        _ => {}
                    }
                }
            }
        });

        Ok((BroadcastSubscription { reader }, rx))
    }

    /// Write a message child under a caller-chosen key.
    ///
    /// The key is the gateway-issued message id, which keeps id-equality
    /// de-duplication sound across both delivery paths.
    pub async fn put_message(
        &self,
        alert_id: &str,
        message_id: &str,
        message: &BroadcastMessage,
    ) -> Result<(), ChannelError> {
        self.put(&[TREE_ROOT, alert_id, "messages", message_id], message)
            .await
    }

    /// Write a contact's acknowledgment slot (last write per contact wins).
    pub async fn put_acknowledgment(
        &self,
        alert_id: &str,
        acknowledgment: &BroadcastAcknowledgment,
    ) -> Result<(), ChannelError> {
        self.put(
            &[
                TREE_ROOT,
                alert_id,
                "acknowledgments",
                &acknowledgment.contact_id,
            ],
            acknowledgment,
        )
        .await
    }

    async fn put<T: Serialize>(&self, segments: &[&str], body: &T) -> Result<(), ChannelError> {
        let url = self.node_url(segments);
        let response = self
            .client
            .put(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ChannelError::Protocol(format!(
                "tree write returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Handle on one live broadcast subscription.
pub struct BroadcastSubscription {
    reader: JoinHandle<()>,
}

impl BroadcastSubscription {
    /// Stop the stream task. Idempotent; no child set is delivered after
    /// this returns.
    pub fn shutdown(&self) {
        self.reader.abort();
    }
}

impl Drop for BroadcastSubscription {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Debug, Deserialize)]
struct SseUpdate {
    path: String,
    data: Value,
}

/// Apply a `put` (replace) or `patch` (merge) at a slash path.
fn apply_update(tree: &mut Value, path: &str, data: Value, merge: bool) {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    apply_at(tree, &segments, data, merge);
}

fn apply_at(node: &mut Value, segments: &[&str], data: Value, merge: bool) {
    let Some((first, rest)) = segments.split_first() else {
        if merge {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            if let (Value::Object(target), Value::Object(entries)) = (node, data) {
                for (key, value) in entries {
                    if value.is_null() {
                        target.remove(&key);
                    } else {
                        target.insert(key, value);
                    }
                }
            }
        } else if data.is_null() {
            *node = Value::Object(Map::new());
        } else {
            *node = data;
        }
        return;
    };

    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        let child = map
            .entry((*first).to_string())
            .or_insert(Value::Object(Map::new()));
        apply_at(child, rest, data, merge);
    }
}

/// Decode the tree's children into transcript entries, ascending by
/// creation time.
fn decode_children(tree: &Value) -> Vec<ChatMessage> {
    let Some(children) = tree.as_object() else {
        return Vec::new();
    };

    let mut messages: Vec<ChatMessage> = children
        .iter()
        .filter_map(|(id, value)| {
            match serde_json::from_value::<BroadcastMessage>(value.clone()) {
                Ok(message) => Some(message.into_chat_message(id)),
                Err(err) => {
                    warn!(id = %id, %err, "skipping undecodable tree child");
                    None
                }
            }
        })
        .collect();
    messages.sort_by_key(|m| m.created_at);
    messages
}

/// Incremental `text/event-stream` frame parser.
///
/// Frames are separated by a blank line; `data:` may span several lines.
#[derive(Default)]
struct SseParser {
    buffer: String,
}

struct SseFrame {
    event: String,
    data: String,
}

impl SseParser {
    fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer
            .push_str(&String::from_utf8_lossy(chunk).replace('\r', ""));

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..pos + 2).collect();
            if let Some(frame) = parse_block(&block) {
                frames.push(frame);
            }
        }
        frames
    }
}

fn parse_block(block: &str) -> Option<SseFrame> {
    let mut event = String::new();
    let mut data_lines: Vec<&str> = Vec::new();

    for line in block.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            event = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim_start());
        }
    }

    if event.is_empty() && data_lines.is_empty() {
        return None;
    }
    Some(SseFrame {
        event,
        data: data_lines.join("\n"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_parser_across_chunk_boundaries() {
        let mut parser = SseParser::default();

        let first = parser.push(b"event: put\ndata: {\"path\":\"/\",");
        assert!(first.is_empty());

        let second = parser.push(b"\"data\":null}\n\nevent: keep-alive\ndata: null\n\n");
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].event, "put");
        assert_eq!(second[0].data, "{\"path\":\"/\",\"data\":null}");
        assert_eq!(second[1].event, "keep-alive");
    }

    #[test]
    fn test_apply_update_put_and_patch() {
        let mut tree = Value::Object(Map::new());

        apply_update(
            &mut tree,
            "/",
            serde_json::json!({ "msg-1": { "content": "a" } }),
            false,
        );
        apply_update(
            &mut tree,
            "/msg-2",
            serde_json::json!({ "content": "b" }),
            false,
        );
        assert_eq!(tree["msg-1"]["content"], "a");
        assert_eq!(tree["msg-2"]["content"], "b");

        // Patch merges at the root; null values delete children.
        apply_update(
            &mut tree,
            "/",
            serde_json::json!({ "msg-1": null, "msg-3": { "content": "c" } }),
            true,
        );
        assert!(tree.get("msg-1").is_none());
        assert_eq!(tree["msg-3"]["content"], "c");

        // A root put of null clears the tree.
        apply_update(&mut tree, "/", Value::Null, false);
        assert!(tree.as_object().unwrap().is_empty());
    }

    #[test]
    fn test_decode_children_sorted_and_lenient() {
        let tree = serde_json::json!({
            "b-later": {
                "sender_type": "contact",
                "message_type": "status_update",
                "content": "omw",
                "created_at": "2025-06-01T12:10:00Z"
            },
            "a-earlier": {
                // Missing sender/type/coords: defaults apply.
                "content": "hello",
                "created_at": "2025-06-01T12:00:00Z"
            }
        });

        let messages = decode_children(&tree);

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, "a-earlier");
        assert_eq!(messages[0].sender_type, SenderRole::User);
        assert_eq!(messages[0].message_type, MessageKind::Text);
        assert_eq!(messages[1].id, "b-later");
        assert_eq!(messages[1].message_type, MessageKind::StatusUpdate);
    }

    #[test]
    fn test_acknowledgment_serializes_explicit_nulls() {
        let ack = BroadcastAcknowledgment {
            id: "ack-1".to_string(),
            contact_id: "contact-1".to_string(),
            acknowledgment_type: crate::model::AcknowledgmentType::Arrived,
            eta_minutes: None,
            message: None,
            updated_at: "2025-06-01T12:00:00Z".parse().unwrap(),
        };

        let json = serde_json::to_value(&ack).unwrap();
        assert!(json["eta_minutes"].is_null());
        assert!(json["message"].is_null());
        assert_eq!(json["acknowledgment_type"], "arrived");
    }

    #[test]
    fn test_echo_round_trip_keeps_gateway_id() {
        let chat = ChatMessage {
            id: "msg-from-gateway".to_string(),
            sender_type: SenderRole::Contact,
            message_type: MessageKind::Text,
            content: "on my way".to_string(),
            latitude: None,
            longitude: None,
            created_at: "2025-06-01T12:00:00Z".parse().unwrap(),
        };

        let echo = BroadcastMessage::from_chat(&chat, Some("contact-1"));
        assert!(echo.read_by_contact);
        assert!(!echo.read_by_user);

        let back = echo.into_chat_message("msg-from-gateway");
        assert_eq!(back, chat);
    }
}
