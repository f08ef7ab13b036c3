use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_derive_enum::DbEnum;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a logged message.
///
/// The consumer only ever writes `Received`. `Failed` is reserved for
/// out-of-band tooling that flags records needing human attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, DbEnum)]
#[db_enum(existing_type_path = "crate::schema::sql_types::MessageStatus")]
pub enum MessageStatus {
    #[default]
    #[db_enum(rename = "Received")]
    Received,
    #[db_enum(rename = "Failed")]
    Failed,
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageStatus::Received => write!(f, "Received"),
            MessageStatus::Failed => write!(f, "Failed"),
        }
    }
}

/// Insert model for a message received from the broker
#[derive(Debug, Clone, PartialEq, Eq, Insertable)]
#[diesel(table_name = crate::schema::message_log)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct NewMessageLog {
    pub id: Uuid,
    pub exchange: String,
    pub status: MessageStatus,
    pub payload: String,
    pub raw_payload: Option<Vec<u8>>,
    pub failure_addressed: bool,
    pub received_at: DateTime<Utc>,
}

impl NewMessageLog {
    /// Shape a freshly received message into a log record.
    ///
    /// The id is generated here, never taken from the message. UUIDv7 keeps ids
    /// sortable by creation time, which matches delivery order for acked messages.
    ///
    /// PostgreSQL text cannot hold U+0000. Such payloads are kept byte-exact in
    /// `raw_payload`, and `payload` gets U+FFFD in place of each NUL.
    pub fn received(exchange: impl Into<String>, payload: String) -> Self {
        let (payload, raw_payload) = if payload.contains('\0') {
            (
                payload.replace('\0', "\u{FFFD}"),
                Some(payload.into_bytes()),
            )
        } else {
            (payload, None)
        };

        Self {
            id: Uuid::now_v7(),
            exchange: exchange.into(),
            status: MessageStatus::Received,
            payload,
            raw_payload,
            failure_addressed: false,
            received_at: Utc::now(),
        }
    }
}

/// Diesel model for the message_log table
#[derive(Debug, Clone, PartialEq, Eq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::message_log)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct MessageLog {
    pub id: Uuid,
    pub exchange: String,
    pub status: MessageStatus,
    pub payload: String,
    pub raw_payload: Option<Vec<u8>>,
    pub failure_addressed: bool,
    pub received_at: DateTime<Utc>,
}

impl From<NewMessageLog> for MessageLog {
    fn from(new: NewMessageLog) -> Self {
        Self {
            id: new.id,
            exchange: new.exchange,
            status: new.status,
            payload: new.payload,
            raw_payload: new.raw_payload,
            failure_addressed: new.failure_addressed,
            received_at: new.received_at,
        }
    }
}

impl MessageLog {
    /// The message body exactly as it was received
    pub fn original_payload(&self) -> &[u8] {
        self.raw_payload
            .as_deref()
            .unwrap_or(self.payload.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue_config::MESSAGE_LOG_SUBJECT;

    #[test]
    fn test_received_record_shape() {
        let record = NewMessageLog::received(MESSAGE_LOG_SUBJECT, r#"{"a":1}"#.to_string());

        assert_eq!(record.exchange, "wachter.logging.message.log");
        assert_eq!(record.status, MessageStatus::Received);
        assert_eq!(record.status.to_string(), "Received");
        assert_eq!(record.payload, r#"{"a":1}"#);
        assert!(!record.failure_addressed);
        assert!(!record.id.is_nil());
        assert_eq!(record.raw_payload, None);
    }

    #[test]
    fn test_nul_payload_keeps_exact_bytes() {
        let body = "{\"a\":\"x\0y\"}";
        let record = NewMessageLog::received(MESSAGE_LOG_SUBJECT, body.to_string());

        assert!(!record.payload.contains('\0'));
        assert_eq!(record.payload, "{\"a\":\"x\u{FFFD}y\"}");
        assert_eq!(record.raw_payload.as_deref(), Some(body.as_bytes()));

        let stored = MessageLog::from(record);
        assert_eq!(stored.original_payload(), body.as_bytes());
    }

    #[test]
    fn test_original_payload_falls_back_to_text() {
        let stored = MessageLog::from(NewMessageLog::received(
            MESSAGE_LOG_SUBJECT,
            "plain".to_string(),
        ));
        assert_eq!(stored.original_payload(), b"plain");
    }

    #[test]
    fn test_received_records_get_distinct_ids() {
        let first = NewMessageLog::received(MESSAGE_LOG_SUBJECT, "same".to_string());
        let second = NewMessageLog::received(MESSAGE_LOG_SUBJECT, "same".to_string());

        assert_ne!(first.id, second.id);
        // v7 ids sort by creation time
        assert!(first.id < second.id);
    }

    #[test]
    fn test_status_serializes_as_display_name() {
        let json = serde_json::to_string(&MessageStatus::Received).unwrap();
        assert_eq!(json, "\"Received\"");
        assert_eq!(MessageStatus::default(), MessageStatus::Received);
    }
}
