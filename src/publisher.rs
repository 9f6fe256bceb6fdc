//! Publish path: hand a change record to the queue, then mark it sent.
//!
//! The send and the mark are two separate writes. A crash between them
//! leaves a record on the queue without a sent mark; the change-send
//! reconciler finds it later and publishes it again. Consumers are
//! idempotent, so the duplicate is harmless.

use crate::change::{ChangeMessage, ChangeRecord};
use crate::error::Result;
use crate::ledger::ChangeLedger;
use crate::queue::MessageQueue;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of [`ChangePublisher::publish_all`].
#[derive(Debug, Default)]
pub struct PublishReport {
    pub published: Vec<i64>,
    /// Change numbers that failed, with the error's display text.
    pub failed: Vec<(i64, String)>,
}

impl PublishReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Clone)]
pub struct ChangePublisher {
    queue: Arc<dyn MessageQueue>,
    ledger: Arc<dyn ChangeLedger>,
}

impl ChangePublisher {
    pub fn new(queue: Arc<dyn MessageQueue>, ledger: Arc<dyn ChangeLedger>) -> Self {
        Self { queue, ledger }
    }

    /// Send one record and register its sent mark. Returns the message id.
    pub async fn publish(&self, record: &ChangeRecord) -> Result<String> {
        let body = ChangeMessage::single(record.clone()).encode()?;
        let message_id = self.queue.send(&body).await?;
        self.ledger.register_sent(record).await?;
        debug!(change_number = record.change_number, message_id = %message_id, "Published change");
        Ok(message_id)
    }

    /// Send a record without touching the ledger. Used for synthetic records.
    pub async fn send_unmarked(&self, record: &ChangeRecord) -> Result<String> {
        let body = ChangeMessage::single(record.clone()).encode()?;
        self.queue.send(&body).await
    }

    /// Publish each record independently; one failure does not stop the rest.
    pub async fn publish_all(&self, records: &[ChangeRecord]) -> PublishReport {
        let mut report = PublishReport::default();
        for record in records {
            match self.publish(record).await {
                Ok(_) => report.published.push(record.change_number),
                Err(e) => {
                    warn!(change_number = record.change_number, error = %e, "Failed to publish change");
                    report.failed.push((record.change_number, e.to_string()));
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeType;
    use crate::error::ReplicationError;
    use crate::ledger::SqliteLedger;
    use crate::queue::QueueMessage;
    use crate::BoxFuture;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingQueue {
        sent: Mutex<Vec<String>>,
        fail_on: Option<usize>,
    }

    impl MessageQueue for RecordingQueue {
        fn receive(&self, _max: usize, _lease: Duration) -> BoxFuture<'_, Vec<QueueMessage>> {
            Box::pin(async { Ok(Vec::new()) })
        }

        fn delete_batch<'a>(&'a self, _messages: &'a [QueueMessage]) -> BoxFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }

        fn send<'a>(&'a self, payload: &'a str) -> BoxFuture<'a, String> {
            Box::pin(async move {
                let mut sent = self.sent.lock().unwrap();
                if self.fail_on == Some(sent.len()) {
                    sent.push(String::new());
                    return Err(ReplicationError::redis_msg("XADD", "connection reset"));
                }
                sent.push(payload.to_string());
                Ok(format!("{}-0", sent.len()))
            })
        }

        fn approximate_backlog(&self) -> BoxFuture<'_, u64> {
            Box::pin(async { Ok(0) })
        }
    }

    #[tokio::test]
    async fn test_publish_sends_then_marks() {
        let ledger = Arc::new(SqliteLedger::in_memory().await.unwrap());
        let record = ledger.replace_change("entity", "a", Some(1), ChangeType::Create).await.unwrap();
        let queue = Arc::new(RecordingQueue::default());
        let publisher = ChangePublisher::new(queue.clone(), ledger.clone());

        publisher.publish(&record).await.unwrap();

        let sent = queue.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        let decoded = ChangeMessage::decode(&sent[0]).unwrap();
        assert_eq!(decoded.changes[0].change_number, record.change_number);
        assert!(ledger.is_sent(record.change_number).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_send_leaves_record_unmarked() {
        let ledger = Arc::new(SqliteLedger::in_memory().await.unwrap());
        let a = ledger.replace_change("entity", "a", None, ChangeType::Create).await.unwrap();
        let b = ledger.replace_change("entity", "b", None, ChangeType::Create).await.unwrap();
        let c = ledger.replace_change("entity", "c", None, ChangeType::Create).await.unwrap();
        let queue = Arc::new(RecordingQueue {
            fail_on: Some(1),
            ..Default::default()
        });
        let publisher = ChangePublisher::new(queue, ledger.clone());

        let report = publisher.publish_all(&[a.clone(), b.clone(), c.clone()]).await;

        assert_eq!(report.published, vec![a.change_number, c.change_number]);
        assert_eq!(report.failed.len(), 1);
        assert!(!report.is_complete());
        assert!(!ledger.is_sent(b.change_number).await.unwrap());
        assert!(ledger.is_sent(c.change_number).await.unwrap());
    }

    #[tokio::test]
    async fn test_send_unmarked_skips_ledger() {
        let ledger = Arc::new(SqliteLedger::in_memory().await.unwrap());
        let record = ledger.replace_change("entity", "a", None, ChangeType::Create).await.unwrap();
        let publisher = ChangePublisher::new(Arc::new(RecordingQueue::default()), ledger.clone());

        publisher.send_unmarked(&record).await.unwrap();
        assert!(!ledger.is_sent(record.change_number).await.unwrap());
    }
}
