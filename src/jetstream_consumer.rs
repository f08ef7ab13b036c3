use anyhow::{Context, Result};
use async_nats::jetstream::{
    self, AckKind,
    consumer::{self, AckPolicy, Consumer, DeliverPolicy, pull::Config as PullConfig},
    context::Context as JetStreamContext,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::time::Duration;
use tracing::{info, warn};

use crate::credentials::BrokerCredentials;
use crate::log_consumer::{Delivery, DeliverySource};
use crate::queue_config::{ACK_WAIT_SECS, CLIENT_NAME, PREFETCH_COUNT};

/// Everything needed to reach the broker and bind the consumer
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    /// JetStream domain, the broker-side namespace
    pub domain: Option<String>,
    pub stream_name: String,
    pub consumer_name: String,
    pub subject: String,
    pub tls: bool,
    pub connect_timeout: Duration,
}

impl BrokerSettings {
    pub fn url(&self) -> String {
        format!("nats://{}:{}", self.host, self.port)
    }
}

/// Long-lived broker connection owned by the consumer for the process lifetime
pub struct BrokerConnection {
    client: async_nats::Client,
    jetstream: JetStreamContext,
}

impl BrokerConnection {
    /// Connect to the broker. Failure here is a startup failure.
    pub async fn connect(
        settings: &BrokerSettings,
        credentials: &BrokerCredentials,
    ) -> Result<Self> {
        let mut options = if credentials.username.is_empty() && credentials.password.is_empty() {
            async_nats::ConnectOptions::new()
        } else {
            async_nats::ConnectOptions::with_user_and_password(
                credentials.username.clone(),
                credentials.password.clone(),
            )
        };

        options = options
            .name(CLIENT_NAME)
            .connection_timeout(settings.connect_timeout);

        if settings.tls {
            options = options
                .require_tls(true)
                .tls_client_config(crate::relaxed_tls::client_config()?);
        } else {
            warn!("Broker TLS disabled - credentials are sent in clear text");
        }

        let url = settings.url();
        info!("Connecting to NATS at {}...", url);
        let client = options
            .connect(url.as_str())
            .await
            .with_context(|| format!("Failed to connect to NATS at {}", url))?;
        info!("Connected to NATS successfully");

        let jetstream = match &settings.domain {
            Some(domain) => jetstream::with_domain(client.clone(), domain),
            None => jetstream::new(client.clone()),
        };

        Ok(Self { client, jetstream })
    }

    pub fn jetstream(&self) -> &JetStreamContext {
        &self.jetstream
    }

    /// Flush and close the connection. Best effort: errors are only logged.
    pub async fn close(self) {
        if let Err(e) = self.client.flush().await {
            warn!("Failed to flush NATS connection on shutdown: {}", e);
        }
        drop(self.jetstream);
        drop(self.client);
        info!("NATS connection closed");
    }
}

/// Durable JetStream pull consumer bound to the message log subject
///
/// The consumer is durable, so on restart it picks up where it left off.
/// Explicit acks with at most one pending message give prefetch-1 semantics.
pub struct JetStreamConsumer {
    consumer: Consumer<PullConfig>,
    stream_name: String,
    consumer_name: String,
}

impl JetStreamConsumer {
    /// Look up the stream and reuse or create the durable consumer
    pub async fn new(jetstream: &JetStreamContext, settings: &BrokerSettings) -> Result<Self> {
        info!(
            "Setting up JetStream consumer '{}' for stream '{}'...",
            settings.consumer_name, settings.stream_name
        );

        let stream = jetstream
            .get_stream(&settings.stream_name)
            .await
            .context(format!(
                "Failed to get JetStream stream '{}'",
                settings.stream_name
            ))?;

        info!("JetStream stream '{}' found", settings.stream_name);

        let consumer_config = consumer_config(settings);

        let consumer: Consumer<PullConfig> = stream
            .get_or_create_consumer(&settings.consumer_name, consumer_config.clone())
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "Failed to get or create JetStream consumer '{}': {}",
                    settings.consumer_name,
                    e
                )
            })?;

        // An existing durable consumer keeps whatever config it was created with
        let mismatches =
            config_mismatches(&consumer.cached_info().config, &consumer_config);
        if !mismatches.is_empty() {
            anyhow::bail!(
                "JetStream consumer '{}' exists with incompatible settings ({}) - \
                 delete it or update it to match before starting",
                settings.consumer_name,
                mismatches.join(", ")
            );
        }

        info!(
            "JetStream consumer '{}' ready on subject '{}'",
            settings.consumer_name, settings.subject
        );

        Ok(Self {
            consumer,
            stream_name: settings.stream_name.clone(),
            consumer_name: settings.consumer_name.clone(),
        })
    }

    /// Open the message stream. One message is fetched per pull.
    pub async fn deliveries(&self) -> Result<JetStreamDeliveries> {
        let messages = self
            .consumer
            .stream()
            .max_messages_per_batch(PREFETCH_COUNT as usize)
            .messages()
            .await
            .context("Failed to get messages")?;

        info!(
            "JetStream consumer '{}' waiting for messages on stream '{}'",
            self.consumer_name, self.stream_name
        );

        Ok(JetStreamDeliveries { messages })
    }
}

/// Pull consumer configuration: explicit acks, one unacknowledged message
pub fn consumer_config(settings: &BrokerSettings) -> PullConfig {
    PullConfig {
        durable_name: Some(settings.consumer_name.clone()),
        ack_policy: AckPolicy::Explicit,
        deliver_policy: DeliverPolicy::All,
        filter_subject: settings.subject.clone(),
        max_ack_pending: PREFETCH_COUNT,
        ack_wait: Duration::from_secs(ACK_WAIT_SECS),
        ..Default::default()
    }
}

/// Settings on an existing consumer that differ from `expected` and would break
/// one-at-a-time explicit acknowledgement or bind the wrong subject
pub fn config_mismatches(existing: &consumer::Config, expected: &PullConfig) -> Vec<String> {
    let mut mismatches = Vec::new();

    if existing.ack_policy != expected.ack_policy {
        mismatches.push(format!(
            "ack_policy is {:?}, expected {:?}",
            existing.ack_policy, expected.ack_policy
        ));
    }
    if existing.max_ack_pending != expected.max_ack_pending {
        mismatches.push(format!(
            "max_ack_pending is {}, expected {}",
            existing.max_ack_pending, expected.max_ack_pending
        ));
    }
    if existing.filter_subject != expected.filter_subject {
        mismatches.push(format!(
            "filter_subject is '{}', expected '{}'",
            existing.filter_subject, expected.filter_subject
        ));
    }

    mismatches
}

/// How a delivery is settled with the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Requeue,
    Terminate,
}

impl Settlement {
    pub fn ack_kind(self) -> AckKind {
        match self {
            Settlement::Ack => AckKind::Ack,
            Settlement::Requeue => AckKind::Nak(None),
            Settlement::Terminate => AckKind::Term,
        }
    }
}

/// Stream of deliveries from the pull consumer
pub struct JetStreamDeliveries {
    messages: jetstream::consumer::pull::Stream,
}

#[async_trait]
impl DeliverySource for JetStreamDeliveries {
    type Delivery = JetStreamDelivery;

    async fn next_delivery(&mut self) -> Option<Result<JetStreamDelivery>> {
        let next = self.messages.next().await?;
        Some(
            next.map(JetStreamDelivery::new)
                .map_err(|e| anyhow::anyhow!("Error receiving message from JetStream: {}", e)),
        )
    }
}

/// A JetStream message with its ack handle
pub struct JetStreamDelivery {
    message: jetstream::Message,
    attempt: u64,
}

impl JetStreamDelivery {
    fn new(message: jetstream::Message) -> Self {
        let attempt = match message.info() {
            Ok(info) => info.delivered.max(1) as u64,
            Err(e) => {
                warn!("JetStream message has no delivery info: {}", e);
                1
            }
        };
        Self { message, attempt }
    }

    async fn settle(&self, settlement: Settlement) -> Result<()> {
        self.message
            .ack_with(settlement.ack_kind())
            .await
            .map_err(|e| anyhow::anyhow!("{}", e))
    }
}

#[async_trait]
impl Delivery for JetStreamDelivery {
    fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    fn delivery_attempt(&self) -> u64 {
        self.attempt
    }

    async fn ack(&self) -> Result<()> {
        self.settle(Settlement::Ack).await
    }

    async fn requeue(&self) -> Result<()> {
        self.settle(Settlement::Requeue).await
    }

    async fn terminate(&self) -> Result<()> {
        self.settle(Settlement::Terminate).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue_config::{MESSAGE_LOG_CONSUMER, MESSAGE_LOG_STREAM, MESSAGE_LOG_SUBJECT};

    fn settings() -> BrokerSettings {
        BrokerSettings {
            host: "broker.internal".to_string(),
            port: 4222,
            domain: Some("integration".to_string()),
            stream_name: MESSAGE_LOG_STREAM.to_string(),
            consumer_name: MESSAGE_LOG_CONSUMER.to_string(),
            subject: MESSAGE_LOG_SUBJECT.to_string(),
            tls: true,
            connect_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_url() {
        assert_eq!(settings().url(), "nats://broker.internal:4222");
    }

    #[test]
    fn test_consumer_config_is_prefetch_one_manual_ack() {
        let config = consumer_config(&settings());

        assert_eq!(config.durable_name.as_deref(), Some("message-log-worker"));
        assert_eq!(config.ack_policy, AckPolicy::Explicit);
        assert_eq!(config.max_ack_pending, 1);
        assert_eq!(config.filter_subject, "wachter.logging.message.log");
        assert_eq!(config.ack_wait, Duration::from_secs(ACK_WAIT_SECS));
    }

    fn existing(max_ack_pending: i64, ack_policy: AckPolicy, subject: &str) -> consumer::Config {
        consumer::Config {
            durable_name: Some(MESSAGE_LOG_CONSUMER.to_string()),
            ack_policy,
            max_ack_pending,
            filter_subject: subject.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_matching_existing_consumer_is_accepted() {
        let expected = consumer_config(&settings());
        let current = existing(1, AckPolicy::Explicit, MESSAGE_LOG_SUBJECT);

        assert!(config_mismatches(&current, &expected).is_empty());
    }

    #[test]
    fn test_existing_consumer_with_larger_ack_window_is_rejected() {
        let expected = consumer_config(&settings());
        let current = existing(1000, AckPolicy::Explicit, MESSAGE_LOG_SUBJECT);

        let mismatches = config_mismatches(&current, &expected);
        assert_eq!(mismatches, vec!["max_ack_pending is 1000, expected 1"]);
    }

    #[test]
    fn test_existing_consumer_with_other_policy_and_subject_is_rejected() {
        let expected = consumer_config(&settings());
        let current = existing(1, AckPolicy::None, "wachter.logging.other");

        let mismatches = config_mismatches(&current, &expected);
        assert_eq!(mismatches.len(), 2);
        assert!(mismatches[0].starts_with("ack_policy"));
        assert!(mismatches[1].starts_with("filter_subject"));
    }

    #[test]
    fn test_settlements_map_to_ack_kinds() {
        assert!(matches!(Settlement::Ack.ack_kind(), AckKind::Ack));
        assert!(matches!(Settlement::Requeue.ack_kind(), AckKind::Nak(None)));
        assert!(matches!(Settlement::Terminate.ack_kind(), AckKind::Term));
    }
}
