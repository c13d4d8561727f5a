//! Startup sequence for the consumer:
//! pool -> schema -> seed reconciliation -> registry -> broker connection -> subscribe.
//!
//! Every failure here is fatal; there is no useful degraded mode without a
//! schema, a registry or a broker.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rumqttc::{AsyncClient, ConnAck, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet};
use tokio::time;
use tracing::{info, warn};

use crate::{
    config::{Config, MqttConfig},
    db::{self, models::DeviceSeed, Store},
    dispatcher::Dispatcher,
    registry::TopicRegistry,
};

/// Capacity of the request channel between `AsyncClient` and the event loop.
///
/// Acks are queued from the task that polls the event loop, so the channel must
/// hold every ack of a read batch plus any reload requests queued meanwhile.
pub const CLIENT_CHANNEL_CAPACITY: usize = 256;

/// Everything the serve loop needs once startup has succeeded.
pub struct Running {
    pub store: Store,
    pub dispatcher: Arc<Dispatcher>,
    pub client: AsyncClient,
    pub eventloop: EventLoop,
}

pub async fn start(config: &Config) -> Result<Running> {
    let store = prepare_store(config).await?;

    let snapshot = TopicRegistry::load(&store)
        .await
        .context("could not load device topics")?;
    if snapshot.is_empty() {
        warn!("No active devices registered; messages will be ignored until one is added");
    }
    let registry = Arc::new(TopicRegistry::new(snapshot));

    let dispatcher = Arc::new(Dispatcher::new(
        registry,
        store.clone(),
        config.mqtt.subscribe_mode,
    ));

    let (client, eventloop, ack) = connect(&config.mqtt).await?;
    dispatcher.on_connect(&client, &ack).await?;

    Ok(Running {
        store,
        dispatcher,
        client,
        eventloop,
    })
}

/// Connect the pool, ensure the schema and reconcile configured seeds.
pub async fn prepare_store(config: &Config) -> Result<Store> {
    let pool = db::create_pool(&config.database).await?;
    let store = Store::new(pool);
    store
        .ensure_schema()
        .await
        .context("schema creation failed")?;
    reconcile_seeds(&store, &config.device_seeds).await?;
    Ok(store)
}

/// Insert seed devices that are not in the store yet. An id already taken by a
/// differently named device is a configuration conflict and fails.
pub async fn reconcile_seeds(store: &Store, seeds: &[DeviceSeed]) -> Result<u64> {
    if seeds.is_empty() {
        return Ok(0);
    }
    info!(seeds = seeds.len(), "Reconciling seed devices");
    let inserted = store
        .upsert_device_seed(seeds)
        .await
        .context("seed devices conflict with the devices table")?;
    info!(inserted, "Seed devices reconciled");
    Ok(inserted)
}

pub fn mqtt_options(config: &MqttConfig) -> MqttOptions {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(config.keep_alive);
    options.set_credentials(&config.username, config.password.expose());
    // Durable session: the broker queues QoS 1/2 messages while we are away.
    options.set_clean_session(false);
    // Publishes are acknowledged by the dispatcher after they are handled.
    options.set_manual_acks(true);
    options
}

/// Open the broker connection and wait, bounded by the configured timeout,
/// for the first CONNACK.
pub async fn connect(config: &MqttConfig) -> Result<(AsyncClient, EventLoop, ConnAck)> {
    info!(host = %config.host, port = config.port, client_id = %config.client_id, "Connecting to MQTT broker");
    let (client, mut eventloop) = AsyncClient::new(mqtt_options(config), CLIENT_CHANNEL_CAPACITY);

    let ack = time::timeout(config.connect_timeout, wait_for_connack(&mut eventloop))
        .await
        .with_context(|| {
            format!(
                "timed out after {:?} connecting to {}:{}",
                config.connect_timeout, config.host, config.port
            )
        })?
        .with_context(|| format!("error connecting to {}:{}", config.host, config.port))?;

    if ack.code != ConnectReturnCode::Success {
        bail!("broker refused connection: {:?}", ack.code);
    }
    Ok((client, eventloop, ack))
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<ConnAck, rumqttc::ConnectionError> {
    loop {
        if let Event::Incoming(Packet::ConnAck(ack)) = eventloop.poll().await? {
            return Ok(ack);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sqlx::PgPool;

    use super::*;
    use crate::config::{Secret, SubscribeMode};

    fn mqtt_config() -> MqttConfig {
        MqttConfig {
            host: "broker.local".into(),
            port: 1883,
            username: "consumer".into(),
            password: Secret::from("s3cret"),
            client_id: "plant-telemetry-moisture".into(),
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_millis(200),
            subscribe_mode: SubscribeMode::Wildcard,
        }
    }

    #[test]
    fn options_request_durable_session() {
        let options = mqtt_options(&mqtt_config());
        assert_eq!(options.client_id(), "plant-telemetry-moisture");
        assert_eq!(options.broker_address(), ("broker.local".to_owned(), 1883));
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
        assert!(!options.clean_session());
        assert!(options.manual_acks());
        assert_eq!(
            options.credentials(),
            Some(("consumer".to_owned(), "s3cret".to_owned()))
        );
    }

    #[test]
    fn request_channel_outsizes_a_read_batch() {
        // rumqttc reads up to 10 packets per poll; each publish queues one ack.
        assert!(CLIENT_CHANNEL_CAPACITY >= 10 * 10);
    }

    #[tokio::test]
    async fn unreachable_broker_fails_fast() {
        let mut config = mqtt_config();
        // Reserved TEST-NET-1 address; nothing answers there.
        config.host = "192.0.2.1".into();
        let started = std::time::Instant::now();
        assert!(connect(&config).await.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn reconcile_seeds_is_idempotent(pool: PgPool) {
        let store = Store::new(pool);
        let seeds = vec![DeviceSeed {
            id: 1,
            name: "scarlet-star-1".into(),
            topic: "plant-monitoring/living-room/scarlet-star-1/telemetry".into(),
        }];
        assert_eq!(reconcile_seeds(&store, &seeds).await.unwrap(), 1);
        assert_eq!(reconcile_seeds(&store, &seeds).await.unwrap(), 0);
        assert_eq!(reconcile_seeds(&store, &[]).await.unwrap(), 0);
    }
}
