//! Well-known broker names and defaults for the message log consumer
//!
//! The consumer binds to one fixed subject for its whole lifetime. Stream and
//! consumer names can be overridden on the command line, the subject cannot.

// ============================================================================
// NATS JetStream Configuration Constants
// ============================================================================

/// Subject (queue name) the message log consumer is bound to.
/// Also stored as the `exchange` of every log record.
pub const MESSAGE_LOG_SUBJECT: &str = "wachter.logging.message.log";

/// Default JetStream stream that captures `MESSAGE_LOG_SUBJECT`
pub const MESSAGE_LOG_STREAM: &str = "MESSAGE_LOG";

/// Default durable consumer name
pub const MESSAGE_LOG_CONSUMER: &str = "message-log-worker";

/// Client name reported to the NATS server
pub const CLIENT_NAME: &str = "message-log-worker";

/// Default secret title used to look up broker credentials
pub const BROKER_SECRET_ID: &str = "MessageBroker";

// ============================================================================
// Flow Control
// ============================================================================

/// Maximum number of unacknowledged messages the broker hands to this consumer.
/// Fixed at 1: messages are persisted strictly one at a time.
pub const PREFETCH_COUNT: i64 = 1;

/// How long the broker waits for an ack before redelivering, in seconds
pub const ACK_WAIT_SECS: u64 = 30;

/// Pause after a broker receive error before asking for the next message
pub const RECEIVE_ERROR_BACKOFF_MS: u64 = 100;

/// Log throughput every this many persisted messages
pub const PROGRESS_LOG_INTERVAL: u64 = 1_000;

/// Database connections kept by the pool. One writer plus headroom for
/// the startup schema check.
pub const DB_POOL_SIZE: u32 = 2;

/// Build the instance lock name for a consumer so two workers sharing one
/// durable consumer cannot run on the same host.
///
/// # Examples
/// ```
/// use message_log::queue_config::instance_lock_name;
///
/// assert_eq!(instance_lock_name("message-log-worker"), "message-log-message-log-worker");
/// ```
pub fn instance_lock_name(consumer_name: &str) -> String {
    format!("message-log-{}", consumer_name)
}
