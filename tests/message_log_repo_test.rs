//! Repository and consume loop against a real PostgreSQL database.
//!
//! Run with `cargo test -- --ignored` and `TEST_DATABASE_URL` set.

mod common;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use common::TestDatabase;
use message_log::log_consumer::{Delivery, DeliverySource, Disposition, LogConsumer};
use message_log::message_log::{MessageStatus, NewMessageLog};
use message_log::message_log_repo::MessageLogRepository;
use message_log::queue_config::MESSAGE_LOG_SUBJECT;
use tokio_util::sync::CancellationToken;

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_insert_and_get() {
    let test_db = TestDatabase::new()
        .await
        .expect("Failed to create test database");
    let repository = MessageLogRepository::new(test_db.pool());

    let record = NewMessageLog::received(MESSAGE_LOG_SUBJECT, "{\"a\":1}".to_string());
    let id = repository.insert(record.clone()).await.unwrap();
    assert_eq!(id, record.id);

    let stored = repository.get(id).await.unwrap().expect("record exists");
    assert_eq!(stored.exchange, MESSAGE_LOG_SUBJECT);
    assert_eq!(stored.payload, "{\"a\":1}");
    assert_eq!(stored.status, MessageStatus::Received);
    assert!(!stored.failure_addressed);

    assert!(repository.get(uuid::Uuid::now_v7()).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_recent_is_newest_first() {
    let test_db = TestDatabase::new()
        .await
        .expect("Failed to create test database");
    let repository = MessageLogRepository::new(test_db.pool());

    for payload in ["first", "second", "third"] {
        repository
            .insert(NewMessageLog::received(MESSAGE_LOG_SUBJECT, payload.to_string()))
            .await
            .unwrap();
    }

    let recent = repository.recent(2).await.unwrap();
    let payloads: Vec<_> = recent.iter().map(|r| r.payload.as_str()).collect();
    assert_eq!(payloads, vec!["third", "second"]);
    assert_eq!(repository.count().await.unwrap(), 3);
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_describe_table_lists_columns() {
    let test_db = TestDatabase::new()
        .await
        .expect("Failed to create test database");
    let repository = MessageLogRepository::new(test_db.pool());

    let columns = repository.describe_table().await.unwrap();
    let names: Vec<_> = columns.iter().map(|c| c.column_name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "id",
            "exchange",
            "status",
            "payload",
            "raw_payload",
            "failure_addressed",
            "received_at"
        ]
    );
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_nul_payload_is_logged_and_read_back_exactly() {
    let test_db = TestDatabase::new()
        .await
        .expect("Failed to create test database");
    let repository = MessageLogRepository::new(test_db.pool());
    let consumer = LogConsumer::new(repository.clone(), MESSAGE_LOG_SUBJECT);

    let body = b"{\"a\":\"x\0y\"}".to_vec();
    let acks = Arc::new(Mutex::new(Vec::new()));
    let delivery = ScriptedDelivery {
        payload: body.clone(),
        acks: acks.clone(),
    };

    let disposition = consumer.handle(&delivery).await;
    let Disposition::Persisted(id) = disposition else {
        panic!("expected a persisted record, got {:?}", disposition);
    };
    assert_eq!(*acks.lock().unwrap(), vec!["ack"]);

    let stored = repository.get(id).await.unwrap().expect("record exists");
    assert_eq!(stored.original_payload(), body.as_slice());
    assert_eq!(stored.payload, "{\"a\":\"x\u{FFFD}y\"}");
}

struct ScriptedDelivery {
    payload: Vec<u8>,
    acks: Arc<Mutex<Vec<&'static str>>>,
}

#[async_trait]
impl Delivery for ScriptedDelivery {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn delivery_attempt(&self) -> u64 {
        1
    }

    async fn ack(&self) -> Result<()> {
        self.acks.lock().unwrap().push("ack");
        Ok(())
    }

    async fn requeue(&self) -> Result<()> {
        self.acks.lock().unwrap().push("requeue");
        Ok(())
    }

    async fn terminate(&self) -> Result<()> {
        self.acks.lock().unwrap().push("terminate");
        Ok(())
    }
}

/// Hands out the scripted deliveries, then requests shutdown
struct ScriptedSource {
    deliveries: VecDeque<ScriptedDelivery>,
    shutdown: CancellationToken,
}

#[async_trait]
impl DeliverySource for ScriptedSource {
    type Delivery = ScriptedDelivery;

    async fn next_delivery(&mut self) -> Option<Result<ScriptedDelivery>> {
        match self.deliveries.pop_front() {
            Some(delivery) => Some(Ok(delivery)),
            None => {
                self.shutdown.cancel();
                std::future::pending().await
            }
        }
    }
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn test_consumer_commits_before_ack() {
    let test_db = TestDatabase::new()
        .await
        .expect("Failed to create test database");
    let repository = MessageLogRepository::new(test_db.pool());

    let acks = Arc::new(Mutex::new(Vec::new()));
    let shutdown = CancellationToken::new();
    let mut source = ScriptedSource {
        deliveries: [b"hello".to_vec(), vec![0xff, 0xfe], b"world".to_vec()]
            .into_iter()
            .map(|payload| ScriptedDelivery {
                payload,
                acks: acks.clone(),
            })
            .collect(),
        shutdown: shutdown.clone(),
    };

    let consumer = LogConsumer::new(repository.clone(), MESSAGE_LOG_SUBJECT);
    let summary = consumer.run(&mut source, shutdown).await.unwrap();

    assert_eq!(summary.persisted, 2);
    assert_eq!(summary.requeued, 1);
    assert_eq!(*acks.lock().unwrap(), vec!["ack", "requeue", "ack"]);

    let payloads: Vec<_> = repository
        .recent(10)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.payload)
        .collect();
    assert_eq!(payloads, vec!["world".to_string(), "hello".to_string()]);

    let single = ScriptedDelivery {
        payload: b"direct".to_vec(),
        acks: acks.clone(),
    };
    let disposition = consumer.handle(&single).await;
    let Disposition::Persisted(id) = disposition else {
        panic!("expected a persisted record, got {:?}", disposition);
    };
    assert_eq!(repository.get(id).await.unwrap().unwrap().payload, "direct");
}
