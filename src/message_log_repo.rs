use anyhow::Result;
use async_trait::async_trait;
use diesel::prelude::*;
use diesel::sql_types::Text;
use tracing::debug;
use uuid::Uuid;

use crate::db::PgPool;
use crate::log_consumer::LogStore;
use crate::message_log::{MessageLog, NewMessageLog};

/// Table the message log is stored in
pub const MESSAGE_LOG_TABLE: &str = "message_log";

/// Column as reported by information_schema
#[derive(Debug, Clone, PartialEq, Eq, QueryableByName)]
pub struct ColumnInfo {
    #[diesel(sql_type = Text)]
    pub column_name: String,
    #[diesel(sql_type = Text)]
    pub data_type: String,
}

#[derive(Clone)]
pub struct MessageLogRepository {
    pool: PgPool,
}

impl MessageLogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a new message log record
    ///
    /// The insert runs outside an explicit transaction, so it is committed when
    /// this returns Ok. Returns the ID of the inserted record.
    pub async fn insert(&self, new_message: NewMessageLog) -> Result<Uuid> {
        use crate::schema::message_log::dsl::*;

        let message_id = new_message.id;
        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;

            diesel::insert_into(message_log)
                .values(&new_message)
                .execute(&mut conn)?;

            metrics::counter!("message_log.records.inserted").increment(1);
            debug!("Inserted message log record {}", message_id);
            Ok::<Uuid, anyhow::Error>(message_id)
        })
        .await?
    }

    /// Get a single record by ID
    pub async fn get(&self, record_id: Uuid) -> Result<Option<MessageLog>> {
        use crate::schema::message_log::dsl::*;

        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            let record = message_log
                .find(record_id)
                .select(MessageLog::as_select())
                .first(&mut conn)
                .optional()?;
            Ok::<Option<MessageLog>, anyhow::Error>(record)
        })
        .await?
    }

    /// Most recently received records, newest first
    pub async fn recent(&self, limit: i64) -> Result<Vec<MessageLog>> {
        use crate::schema::message_log::dsl::*;

        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            let records = message_log
                .order((received_at.desc(), id.desc()))
                .limit(limit)
                .select(MessageLog::as_select())
                .load(&mut conn)?;
            Ok::<Vec<MessageLog>, anyhow::Error>(records)
        })
        .await?
    }

    /// Total number of records
    pub async fn count(&self) -> Result<i64> {
        use crate::schema::message_log::dsl::*;

        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            let total: i64 = message_log.count().get_result(&mut conn)?;
            Ok::<i64, anyhow::Error>(total)
        })
        .await?
    }

    /// Columns of the message log table in ordinal order.
    /// Empty when the table does not exist.
    pub async fn describe_table(&self) -> Result<Vec<ColumnInfo>> {
        let pool = self.pool.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            let columns = diesel::sql_query(
                "SELECT column_name::text AS column_name, data_type::text AS data_type \
                 FROM information_schema.columns \
                 WHERE table_schema = current_schema() AND table_name = $1 \
                 ORDER BY ordinal_position",
            )
            .bind::<Text, _>(MESSAGE_LOG_TABLE)
            .load::<ColumnInfo>(&mut conn)?;
            Ok::<Vec<ColumnInfo>, anyhow::Error>(columns)
        })
        .await?
    }
}

#[async_trait]
impl LogStore for MessageLogRepository {
    async fn insert(&self, record: NewMessageLog) -> Result<Uuid> {
        MessageLogRepository::insert(self, record).await
    }
}
