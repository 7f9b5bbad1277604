//! Presentation binding layer.
//!
//! [`ResponseSession`] is what a view mounts: it owns the reconciled state
//! behind a `watch` channel, pumps feed events into it, and exposes the
//! three action functions. Actions return a plain `bool`; every failure
//! is logged and converted at this boundary, nothing panics or throws
//! into the rendering layer.
//!
//! Concurrency: chat sends (text and quick status share one channel of
//! activity) are serialized by an in-flight gate that rejects a second
//! send; acknowledgments have their own independent gate. A session that
//! has been closed drops all late results via its liveness flag, so a
//! gateway call or feed callback finishing after teardown cannot mutate
//! state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{ActionError, GatewayError};
use crate::feeds::broadcast::{BroadcastClient, BroadcastMessage};
use crate::feeds::row_change::RowFeedClient;
use crate::feeds::{FeedAdapter, FeedEvent, FeedGuard, FeedSubscription};
use crate::gateway::{AckOptions, GatewayClient};
use crate::model::{
    Acknowledgment, AcknowledgmentType, AlertInfo, ChatMessage, MessageKind, SenderRole,
};
use crate::sync::ResponseState;

/// RAII in-flight gate; releases on every exit path.
struct Gate<'a>(&'a AtomicBool);

impl<'a> Gate<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        if flag.swap(true, Ordering::SeqCst) {
            None
        } else {
            Some(Self(flag))
        }
    }
}

impl Drop for Gate<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A mounted response view for one capability token.
pub struct ResponseSession {
    token: String,
    alert_id: String,
    contact_id: String,
    gateway: GatewayClient,
    /// Echo path into the broadcast tree; absent in feed-less sessions.
    broadcast: Option<BroadcastClient>,
    state_tx: Arc<watch::Sender<ResponseState>>,
    live: Arc<AtomicBool>,
    sending: AtomicBool,
    acknowledging: AtomicBool,
    feed_guard: Option<FeedGuard>,
    pumps: Vec<JoinHandle<()>>,
}

impl ResponseSession {
    /// Fetch the snapshot for `token` and open both real-time channels.
    ///
    /// A rejected or failed fetch is terminal for the token and is
    /// returned as the error; the caller renders the token-expired view.
    /// A feed subscription failure is not fatal: the session opens with
    /// `channel_degraded` set and no live channels.
    pub async fn open(config: &Config, token: &str) -> Result<Self, GatewayError> {
        let gateway = GatewayClient::new(&config.gateway_url, &config.gateway_api_key);
        let info = gateway.fetch_alert_info(token).await?;
        info!(alert_id = %info.alert.id, "alert snapshot loaded");

        let row_client = RowFeedClient::new(&config.row_feed_url, &config.gateway_api_key);
        let broadcast = BroadcastClient::new(&config.broadcast_url);
        let seen = info.messages.iter().map(|m| m.id.clone()).collect::<Vec<_>>();

        let feed = match FeedAdapter::start(&row_client, &broadcast, &info.alert.id, seen).await {
            Ok(subscription) => Some(subscription),
            Err(err) => {
                warn!(%err, "feed subscription failed; view will not receive live updates");
                None
            }
        };
        let degraded = feed.is_none();

        Ok(Self::build(gateway, token, info, feed, Some(broadcast), degraded))
    }

    /// Assemble a session from pre-fetched parts with an injected event
    /// stream. This is the seam the integration tests drive.
    pub fn with_parts(
        gateway: GatewayClient,
        token: &str,
        info: AlertInfo,
        events: mpsc::Receiver<FeedEvent>,
        broadcast: Option<BroadcastClient>,
    ) -> Self {
        let mut session = Self::build(gateway, token, info, None, broadcast, false);
        session.spawn_event_pump(events);
        session
    }

    fn build(
        gateway: GatewayClient,
        token: &str,
        info: AlertInfo,
        feed: Option<FeedSubscription>,
        broadcast: Option<BroadcastClient>,
        degraded: bool,
    ) -> Self {
        let alert_id = info.alert.id.clone();
        let contact_id = info.contact.id.clone();

        let mut state = ResponseState::ready(info);
        if degraded {
            state.mark_channel_degraded();
        }

        let (state_tx, _) = watch::channel(state);
        let mut session = Self {
            token: token.to_string(),
            alert_id,
            contact_id,
            gateway,
            broadcast,
            state_tx: Arc::new(state_tx),
            live: Arc::new(AtomicBool::new(true)),
            sending: AtomicBool::new(false),
            acknowledging: AtomicBool::new(false),
            feed_guard: None,
            pumps: Vec::new(),
        };

        if let Some(subscription) = feed {
            session.spawn_event_pump(subscription.events);
            session.spawn_degraded_watch(subscription.degraded);
            session.feed_guard = Some(subscription.guard);
        }

        session
    }

    fn spawn_event_pump(&mut self, mut events: mpsc::Receiver<FeedEvent>) {
        let state_tx = self.state_tx.clone();
        let live = self.live.clone();
        self.pumps.push(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if !live.load(Ordering::SeqCst) {
                    return;
                }
                state_tx.send_modify(|state| state.apply(&event));
            }
        }));
    }

    fn spawn_degraded_watch(&mut self, mut degraded: watch::Receiver<bool>) {
        let state_tx = self.state_tx.clone();
        let live = self.live.clone();
        self.pumps.push(tokio::spawn(async move {
            while degraded.changed().await.is_ok() {
                if *degraded.borrow() && live.load(Ordering::SeqCst) {
                    state_tx.send_modify(ResponseState::mark_channel_degraded);
                }
            }
        }));
    }

    /// The alert this session is bound to.
    pub fn alert_id(&self) -> &str {
        &self.alert_id
    }

    /// Reactive read-only view of the reconciled state.
    pub fn subscribe(&self) -> watch::Receiver<ResponseState> {
        self.state_tx.subscribe()
    }

    /// Current reconciled state.
    pub fn state(&self) -> ResponseState {
        self.state_tx.borrow().clone()
    }

    /// Whether a chat send is currently in flight.
    pub fn is_sending(&self) -> bool {
        self.sending.load(Ordering::SeqCst)
    }

    /// Acknowledge the alert. Returns `true` once the acknowledgment is
    /// confirmed and applied to local state.
    pub async fn acknowledge(&self, kind: AcknowledgmentType, options: AckOptions) -> bool {
        match self.try_acknowledge(kind, options).await {
            Ok(()) => true,
            Err(err) => {
                warn!(%err, "acknowledge failed");
                false
            }
        }
    }

    /// Send a text chat message. Returns `true` once persisted and applied.
    pub async fn send_message(&self, content: &str) -> bool {
        match self.try_send_message(content).await {
            Ok(()) => true,
            Err(err) => {
                warn!(%err, "send message failed");
                false
            }
        }
    }

    /// Send a quick status reply by template code.
    pub async fn send_status(&self, status_code: &str) -> bool {
        match self.try_send_status(status_code).await {
            Ok(()) => true,
            Err(err) => {
                warn!(%err, "send status failed");
                false
            }
        }
    }

    async fn try_acknowledge(
        &self,
        kind: AcknowledgmentType,
        options: AckOptions,
    ) -> Result<(), ActionError> {
        self.ensure_active()?;
        let _gate = Gate::acquire(&self.acknowledging).ok_or(ActionError::Busy)?;

        let receipt = self.gateway.acknowledge(&self.token, kind, &options).await?;

        // Confirmed fields only; nothing was applied while in flight, so a
        // failed submission needs no rollback.
        let acknowledgment = Acknowledgment {
            id: receipt.acknowledgment_id,
            sos_alert_id: receipt.sos_alert_id,
            contact_id: self.contact_id.clone(),
            acknowledgment_type: receipt.acknowledgment_type,
            message: options.message,
            eta_minutes: options.eta_minutes,
            responded_at: Utc::now(),
            latitude: options.coords.map(|c| c.latitude),
            longitude: options.coords.map(|c| c.longitude),
        };

        if self.live.load(Ordering::SeqCst) {
            let applied = acknowledgment.clone();
            self.state_tx
                .send_modify(|state| state.set_own_acknowledgment(applied));
        }

        if let Some(broadcast) = &self.broadcast {
            if let Err(err) = broadcast
                .put_acknowledgment(&self.alert_id, &(&acknowledgment).into())
                .await
            {
                warn!(%err, "acknowledgment echo failed");
            }
        }
        Ok(())
    }

    async fn try_send_message(&self, content: &str) -> Result<(), ActionError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ActionError::EmptyContent);
        }
        self.ensure_active()?;
        let _gate = Gate::acquire(&self.sending).ok_or(ActionError::Busy)?;

        let receipt = self
            .gateway
            .send_message(&self.token, MessageKind::Text, content, None)
            .await?;

        let message = ChatMessage {
            id: receipt.message_id,
            sender_type: SenderRole::Contact,
            message_type: MessageKind::Text,
            content: content.to_string(),
            latitude: None,
            longitude: None,
            created_at: receipt.sent_at,
        };

        if self.live.load(Ordering::SeqCst) {
            let applied = message.clone();
            self.state_tx
                .send_modify(|state| state.append_message(applied));
        }

        // Echo under the gateway-issued id so the broadcast set and the
        // row feed de-duplicate to the same entry.
        if let Some(broadcast) = &self.broadcast {
            let echo = BroadcastMessage::from_chat(&message, Some(&self.contact_id));
            if let Err(err) = broadcast
                .put_message(&self.alert_id, &message.id, &echo)
                .await
            {
                warn!(%err, "message echo failed");
            }
        }
        Ok(())
    }

    async fn try_send_status(&self, status_code: &str) -> Result<(), ActionError> {
        if status_code.trim().is_empty() {
            return Err(ActionError::EmptyContent);
        }
        self.ensure_active()?;
        let _gate = Gate::acquire(&self.sending).ok_or(ActionError::Busy)?;

        let receipt = self.gateway.send_status(&self.token, status_code).await?;
        info!(code = %receipt.status_code, "status update sent");

        // The status receipt carries no message id, so there is no entry
        // to apply or echo here; the persisted row arrives through the
        // row-change feed with its canonical id.
        Ok(())
    }

    fn ensure_active(&self) -> Result<(), ActionError> {
        let state = self.state_tx.borrow();
        if !state.is_ready() {
            return Err(ActionError::NotReady);
        }
        if !state.is_active() {
            return Err(ActionError::AlertClosed);
        }
        Ok(())
    }

    /// Tear the session down: unsubscribe both channels and stop the
    /// pumps. Idempotent; late feed callbacks and late action results are
    /// dropped after this returns.
    pub fn close(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            info!(alert_id = %self.alert_id, "response session closed");
        }
        if let Some(guard) = &self.feed_guard {
            guard.unsubscribe();
        }
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

impl Drop for ResponseSession {
    fn drop(&mut self) {
        self.close();
    }
}
