//! Consume-persist-acknowledge loop for the message log
//!
//! Every delivery gets exactly one persistence attempt and exactly one
//! resolution: acknowledged after a committed insert, or requeued (terminated
//! once the optional delivery cap is reached) when decoding or the insert fails.
//! The ack is never sent before the commit returns.

use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::message_log::NewMessageLog;
use crate::queue_config::{PROGRESS_LOG_INTERVAL, RECEIVE_ERROR_BACKOFF_MS};

/// A single message handed out by the broker, together with its delivery handle
#[async_trait]
pub trait Delivery: Send + Sync {
    /// Raw message body
    fn payload(&self) -> &[u8];

    /// 1-based delivery attempt as counted by the broker
    fn delivery_attempt(&self) -> u64;

    /// Acknowledge this message only (never cumulative)
    async fn ack(&self) -> Result<()>;

    /// Negatively acknowledge and ask the broker to redeliver
    async fn requeue(&self) -> Result<()>;

    /// Remove the message without redelivery
    async fn terminate(&self) -> Result<()>;
}

/// Source of broker deliveries
#[async_trait]
pub trait DeliverySource: Send {
    type Delivery: Delivery;

    /// Wait for the next delivery
    ///
    /// Returns:
    /// - `Some(Ok(delivery))` - next message
    /// - `Some(Err(e))` - receive error, the source is still usable
    /// - `None` - the broker stream ended
    async fn next_delivery(&mut self) -> Option<Result<Self::Delivery>>;
}

/// Insert-and-commit access to the message log table
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Insert one record. Returning `Ok` means the row is committed.
    async fn insert(&self, record: NewMessageLog) -> Result<Uuid>;
}

/// Per-message failures. All of them are resolved by requeueing.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("message body is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("failed to persist message log record: {0:#}")]
    Persist(anyhow::Error),
    #[error("failed to receive message from broker: {0:#}")]
    Receive(anyhow::Error),
}

/// Failure classification for the consume loop
#[derive(Debug, Error)]
pub enum Failure {
    /// Stops the loop; the host decides whether to restart the process
    #[error("fatal consumer failure: {0:#}")]
    Fatal(anyhow::Error),
    /// Handled locally, the loop continues with the next message
    #[error(transparent)]
    Recoverable(#[from] ProcessingError),
}

impl Failure {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Failure::Fatal(_))
    }
}

/// How a delivery was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Committed as a new record and acknowledged
    Persisted(Uuid),
    /// Rejected with requeue, the broker will redeliver
    Requeued,
    /// Delivery cap reached, removed without redelivery
    Terminated,
}

/// Counters for one run of the loop
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub persisted: u64,
    pub requeued: u64,
    pub terminated: u64,
    pub receive_errors: u64,
}

impl RunSummary {
    fn record(&mut self, disposition: Disposition) {
        match disposition {
            Disposition::Persisted(_) => self.persisted += 1,
            Disposition::Requeued => self.requeued += 1,
            Disposition::Terminated => self.terminated += 1,
        }
    }
}

/// The consume loop bound to one exchange (queue name)
pub struct LogConsumer<S> {
    store: S,
    exchange: String,
    max_deliveries: Option<u64>,
}

impl<S: LogStore> LogConsumer<S> {
    pub fn new(store: S, exchange: impl Into<String>) -> Self {
        Self {
            store,
            exchange: exchange.into(),
            max_deliveries: None,
        }
    }

    /// Stop redelivering a failing message once it has been delivered `max` times.
    /// `None` requeues forever.
    pub fn with_max_deliveries(mut self, max: Option<u64>) -> Self {
        self.max_deliveries = max.filter(|m| *m > 0);
        self
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Process deliveries one at a time until shutdown is requested or the
    /// broker stream ends.
    ///
    /// Shutdown is only observed between messages: a message that is already
    /// being handled is always resolved first.
    pub async fn run<D>(
        &self,
        source: &mut D,
        shutdown: CancellationToken,
    ) -> Result<RunSummary, Failure>
    where
        D: DeliverySource,
    {
        info!("Consuming messages for exchange '{}'", self.exchange);

        let mut summary = RunSummary::default();
        let start_time = Instant::now();
        let mut last_log_time = Instant::now();
        let mut last_log_count = 0u64;

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, consume loop stopping");
                    break;
                }
                next = source.next_delivery() => next,
            };

            let step = match next {
                None => Err(Failure::Fatal(anyhow::anyhow!(
                    "broker delivery stream ended"
                ))),
                Some(Err(e)) => Err(Failure::Recoverable(ProcessingError::Receive(e))),
                Some(Ok(delivery)) => Ok(self.handle(&delivery).await),
            };

            match step {
                Ok(disposition) => {
                    summary.record(disposition);

                    if matches!(disposition, Disposition::Persisted(_))
                        && summary.persisted.is_multiple_of(PROGRESS_LOG_INTERVAL)
                    {
                        let elapsed_since_start = start_time.elapsed().as_secs_f64();
                        let elapsed_since_last_log = last_log_time.elapsed().as_secs_f64();
                        let recent = summary.persisted - last_log_count;
                        info!(
                            "Logged {} messages ({:.1} msg/s since start, {:.1} msg/s recent)",
                            summary.persisted,
                            summary.persisted as f64 / elapsed_since_start,
                            recent as f64 / elapsed_since_last_log
                        );
                        last_log_time = Instant::now();
                        last_log_count = summary.persisted;
                    }
                }
                Err(Failure::Recoverable(e)) => {
                    error!("{}", e);
                    metrics::counter!("message_log.consumer.receive_error").increment(1);
                    summary.receive_errors += 1;

                    // Avoid a tight loop on persistent receive errors
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        _ = sleep(Duration::from_millis(RECEIVE_ERROR_BACKOFF_MS)) => {}
                    }
                }
                Err(fatal) => {
                    error!("{}", fatal);
                    return Err(fatal);
                }
            }
        }

        info!(
            "Consume loop stopped: {} persisted, {} requeued, {} terminated, {} receive errors",
            summary.persisted, summary.requeued, summary.terminated, summary.receive_errors
        );
        Ok(summary)
    }

    /// Handle one delivery: decode, persist, then ack or requeue.
    ///
    /// Never fails; every error is turned into a disposition.
    pub async fn handle<D>(&self, delivery: &D) -> Disposition
    where
        D: Delivery + ?Sized,
    {
        let attempt = delivery.delivery_attempt();

        match self.persist(delivery.payload()).await {
            Ok(id) => {
                if let Err(e) = delivery.ack().await {
                    // The row is committed; a redelivery will log it again
                    error!(
                        "Failed to ACK logged message {}: {:#} - will be redelivered",
                        id, e
                    );
                    metrics::counter!("message_log.consumer.ack_error").increment(1);
                }
                metrics::counter!("message_log.consumer.persisted").increment(1);
                info!("Logged message {}", id);
                Disposition::Persisted(id)
            }
            Err(e) => self.reject(delivery, attempt, e).await,
        }
    }

    async fn persist(&self, payload: &[u8]) -> Result<Uuid, ProcessingError> {
        let text = String::from_utf8(payload.to_vec()).inspect_err(|_| {
            metrics::counter!("message_log.consumer.decode_error").increment(1);
        })?;

        let record = NewMessageLog::received(self.exchange.as_str(), text);
        debug!("Persisting message log record {}", record.id);

        let start = Instant::now();
        let id = self.store.insert(record).await.map_err(|e| {
            metrics::counter!("message_log.consumer.persist_error").increment(1);
            ProcessingError::Persist(e)
        })?;
        metrics::histogram!("message_log.consumer.persist_ms")
            .record(start.elapsed().as_secs_f64() * 1000.0);

        Ok(id)
    }

    async fn reject<D>(&self, delivery: &D, attempt: u64, reason: ProcessingError) -> Disposition
    where
        D: Delivery + ?Sized,
    {
        if self.max_deliveries.is_some_and(|max| attempt >= max) {
            error!(
                "Failed to log message on delivery {} ({} bytes): {} - delivery cap reached, terminating",
                attempt,
                delivery.payload().len(),
                reason
            );
            if let Err(e) = delivery.terminate().await {
                error!("Failed to terminate message: {:#}", e);
            }
            metrics::counter!("message_log.consumer.terminated").increment(1);
            return Disposition::Terminated;
        }

        error!(
            "Failed to log message on delivery {}: {} - requeueing",
            attempt, reason
        );
        if let Err(e) = delivery.requeue().await {
            warn!(
                "Failed to NAK message: {:#} - broker will redeliver after ack wait",
                e
            );
        }
        metrics::counter!("message_log.consumer.requeued").increment(1);
        Disposition::Requeued
    }
}
