//! Message log worker
//!
//! Consumes messages from the logging queue on the broker and records each one
//! as a row in the `message_log` table. A message is acknowledged only after its
//! row is committed; any failure requeues it for redelivery.

pub mod credentials;
pub mod db;
pub mod instance_lock;
pub mod jetstream_consumer;
pub mod log_consumer;
pub mod log_format;
pub mod message_log;
pub mod message_log_repo;
pub mod metrics;
pub mod queue_config;
pub mod relaxed_tls;
pub mod schema;
pub mod telemetry;

pub use log_consumer::{Delivery, DeliverySource, Disposition, Failure, LogConsumer, LogStore};
pub use message_log::{MessageLog, MessageStatus, NewMessageLog};
pub use message_log_repo::MessageLogRepository;
