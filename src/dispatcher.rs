//! Broker event handling: subscribe on connect, route each publish through
//! registry -> decoder -> store.
//!
//! No message-level failure escapes `on_message`; every drop path is an
//! explicit [`MessageOutcome`] variant and the dispatcher is ready for the next
//! message afterwards.

use std::{borrow::Cow, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rumqttc::{
    AsyncClient, ConnAck, ConnectReturnCode, ConnectionError, Event, EventLoop, Packet, QoS, SubAck,
    SubscribeFilter, SubscribeReasonCode,
};
use tokio::{sync::watch, time};
use tracing::{debug, error, info, warn};

use crate::{
    config::SubscribeMode,
    db::{Store, StoreError},
    decoder::{self, DecodeError},
    registry::{SnapshotDiff, TopicRegistry, TopicSnapshot},
    topic::WILDCARD_FILTER,
};

/// Requested delivery guarantee; brokers may grant less.
pub const SUBSCRIBE_QOS: QoS = QoS::ExactlyOnce;

/// Pause between failed polls so a dead broker does not spin the loop.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Longest payload prefix written to logs.
const PAYLOAD_EXCERPT_BYTES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Connection acknowledged, subscription not (yet) issued.
    Connected,
    Subscribed,
}

/// What happened to one inbound message.
#[derive(Debug)]
pub enum MessageOutcome {
    Committed {
        device_id: i32,
        recorded_at: DateTime<Utc>,
    },
    /// No active device owns the topic.
    Unmapped,
    Rejected(DecodeError),
    StoreFailed(StoreError),
}

impl MessageOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }
}

pub struct Dispatcher {
    registry: Arc<TopicRegistry>,
    store: Store,
    mode: SubscribeMode,
    state: watch::Sender<ConnectionState>,
}

impl Dispatcher {
    pub fn new(registry: Arc<TopicRegistry>, store: Store, mode: SubscribeMode) -> Self {
        Self {
            registry,
            store,
            mode,
            state: watch::Sender::new(ConnectionState::Disconnected),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn registry(&self) -> &TopicRegistry {
        &self.registry
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(from = ?prev, to = ?next, "Connection state changed");
        }
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    /// Handle a CONNACK. Safe to call again on every reconnect: the
    /// subscription is rebuilt from the current registry snapshot each time.
    pub async fn on_connect(&self, client: &AsyncClient, ack: &ConnAck) -> Result<()> {
        if ack.code != ConnectReturnCode::Success {
            error!(code = ?ack.code, "Broker refused connection");
            self.set_state(ConnectionState::Disconnected);
            return Ok(());
        }

        info!(session_present = ack.session_present, "Connected to MQTT broker");
        self.set_state(ConnectionState::Connected);

        let filters = subscription_filters(self.mode, &self.registry.snapshot());
        if filters.is_empty() {
            warn!("No active device topics to subscribe to; add a device and send SIGHUP");
            return Ok(());
        }

        let count = filters.len();
        client
            .subscribe_many(filters)
            .await
            .context("failed to queue subscribe request")?;
        self.set_state(ConnectionState::Subscribed);
        info!(filters = count, qos = ?SUBSCRIBE_QOS, mode = ?self.mode, "Subscribed to device topics");
        Ok(())
    }

    pub fn on_connection_error(&self, err: &ConnectionError) {
        warn!(error = %err, "MQTT connection error; the client will reconnect");
        self.set_state(ConnectionState::Disconnected);
    }

    fn on_suback(&self, suback: &SubAck) {
        for code in &suback.return_codes {
            match code {
                SubscribeReasonCode::Success(granted) if *granted == SUBSCRIBE_QOS => {}
                SubscribeReasonCode::Success(granted) => warn!(
                    requested = ?SUBSCRIBE_QOS,
                    granted = ?granted,
                    "Broker downgraded subscription QoS; duplicates are possible on redelivery"
                ),
                SubscribeReasonCode::Failure => {
                    error!(pkid = suback.pkid, "Broker rejected a subscription filter")
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    /// Resolve, decode and persist one message.
    pub async fn on_message(&self, topic: &str, payload: &[u8]) -> MessageOutcome {
        debug!(topic = %topic, payload = %excerpt(payload), "Received message");

        let Some(device_id) = self.registry.resolve(topic) else {
            warn!(topic = %topic, "Received message on an unmapped topic; ignoring");
            return MessageOutcome::Unmapped;
        };

        let candidate = match decoder::decode(payload) {
            Ok(candidate) => candidate,
            Err(e) if e.is_structural() => {
                warn!(topic = %topic, payload = %excerpt(payload), error = %e, "Dropping malformed payload");
                return MessageOutcome::Rejected(e);
            }
            Err(e) => {
                error!(
                    topic = %topic,
                    device_id,
                    payload = %excerpt(payload),
                    error = ?e,
                    "Dropping payload with mistyped fields"
                );
                return MessageOutcome::Rejected(e);
            }
        };

        let reading = candidate.for_device(device_id);
        match self.store.insert_reading(&reading).await {
            Ok(row) => {
                info!(
                    device_id,
                    recorded_at = %row.recorded_at,
                    moisture_perc = row.moisture_perc,
                    "Inserted moisture reading"
                );
                MessageOutcome::Committed {
                    device_id,
                    recorded_at: row.recorded_at,
                }
            }
            Err(e) => {
                error!(topic = %topic, device_id, error = %e, "Failed to insert moisture reading");
                MessageOutcome::StoreFailed(e)
            }
        }
    }

    /// Dispatch one event-loop notification.
    pub async fn handle_event(&self, client: &AsyncClient, event: Event) -> Result<()> {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => self.on_connect(client, &ack).await?,
            Event::Incoming(Packet::SubAck(suback)) => self.on_suback(&suback),
            Event::Incoming(Packet::Publish(publish)) => {
                self.on_message(&publish.topic, &publish.payload).await;
                // Acknowledge only after handling so a crash mid-insert gets redelivered.
                client
                    .ack(&publish)
                    .await
                    .context("failed to queue publish acknowledgement")?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Serve the broker connection forever. Transport errors are logged and
    /// the next poll reconnects.
    pub async fn run(&self, client: &AsyncClient, mut eventloop: EventLoop) {
        info!("Ingestion loop started");
        loop {
            match eventloop.poll().await {
                Ok(event) => {
                    if let Err(e) = self.handle_event(client, event).await {
                        error!(error = %e, "Failed to handle broker event");
                    }
                }
                Err(e) => {
                    self.on_connection_error(&e);
                    time::sleep(RECONNECT_DELAY).await;
                    self.set_state(ConnectionState::Connecting);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Registry refresh
    // -----------------------------------------------------------------------

    /// Reload the registry without dropping the connection. In registry mode
    /// the subscription follows the new snapshot, including the first topic
    /// added after starting with none.
    ///
    /// Requests are queued without waiting so a full client channel never
    /// stalls the caller while the event loop is busy.
    pub async fn reload(&self, client: &AsyncClient) -> Result<SnapshotDiff> {
        let diff = self.registry.reload(&self.store).await?;

        let live = matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Subscribed
        );
        if self.mode == SubscribeMode::Registry && live {
            if !diff.added.is_empty() {
                let filters = diff
                    .added
                    .iter()
                    .map(|topic| SubscribeFilter::new(topic.clone(), SUBSCRIBE_QOS));
                client
                    .try_subscribe_many(filters)
                    .context("failed to queue subscribe for added topics")?;
                self.set_state(ConnectionState::Subscribed);
            }
            for topic in &diff.removed {
                client
                    .try_unsubscribe(topic.clone())
                    .with_context(|| format!("failed to queue unsubscribe from {topic}"))?;
            }
        }

        for topic in &diff.added {
            info!(topic = %topic, "Now accepting messages for topic");
        }
        for topic in &diff.removed {
            info!(topic = %topic, "No longer accepting messages for topic");
        }
        Ok(diff)
    }
}

/// Filters to subscribe with for the given mode and snapshot.
pub fn subscription_filters(mode: SubscribeMode, snapshot: &TopicSnapshot) -> Vec<SubscribeFilter> {
    match mode {
        SubscribeMode::Wildcard => vec![SubscribeFilter::new(WILDCARD_FILTER.to_owned(), SUBSCRIBE_QOS)],
        SubscribeMode::Registry => snapshot
            .topics()
            .into_iter()
            .map(|topic| SubscribeFilter::new(topic.to_owned(), SUBSCRIBE_QOS))
            .collect(),
    }
}

fn excerpt(payload: &[u8]) -> Cow<'_, str> {
    if payload.len() <= PAYLOAD_EXCERPT_BYTES {
        String::from_utf8_lossy(payload)
    } else {
        let head = String::from_utf8_lossy(&payload[..PAYLOAD_EXCERPT_BYTES]);
        Cow::Owned(format!("{head}... ({} bytes)", payload.len()))
    }
}
