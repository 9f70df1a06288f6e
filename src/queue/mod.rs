//! Work queue abstraction with at-least-once delivery.

mod memory;

pub use memory::MemoryQueue;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::QueueError;
use crate::pipeline::types::DeadLetterRecord;

/// A message claimed from a queue.
///
/// It stays invisible to other consumers until its visibility timeout
/// expires or it is acknowledged with the matching `pop_receipt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub id: String,
    pub pop_receipt: String,
    pub body: String,
    /// Number of times this message has been received, including this one.
    pub dequeue_count: u32,
    pub inserted_at: DateTime<Utc>,
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Queue name, for logs and errors.
    fn name(&self) -> &str;

    /// Claim up to `max_messages` visible messages.
    async fn receive(
        &self,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError>;

    /// Delete a claimed message.
    async fn acknowledge(&self, message: &QueueMessage) -> Result<(), QueueError>;

    /// Enqueue a new message; returns its id.
    async fn send(&self, body: &str) -> Result<String, QueueError>;
}

/// Destination for messages that will never succeed.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn dead_letter(&self, record: &DeadLetterRecord) -> Result<(), QueueError>;
}

#[async_trait]
impl<Q> DeadLetterSink for Q
where
    Q: MessageQueue + ?Sized,
{
    async fn dead_letter(&self, record: &DeadLetterRecord) -> Result<(), QueueError> {
        let body = serde_json::to_string(record)?;
        match self.send(&body).await {
            Ok(_) => Ok(()),
            Err(e @ QueueError::SendFailed { .. }) => Err(e),
            Err(e) => Err(QueueError::SendFailed {
                queue: self.name().to_string(),
                reason: e.to_string(),
            }),
        }
    }
}
