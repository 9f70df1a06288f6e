//! In-process queue with visibility timeouts and pop receipts.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::{MessageQueue, QueueMessage};
use crate::error::QueueError;

#[derive(Debug)]
struct Entry {
    id: String,
    body: String,
    dequeue_count: u32,
    inserted_at: DateTime<Utc>,
    visible_at: Instant,
    pop_receipt: Option<String>,
}

pub struct MemoryQueue {
    name: String,
    entries: Mutex<Vec<Entry>>,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Messages still on the queue, visible or not.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Bodies of every message still on the queue, in insertion order.
    pub async fn bodies(&self) -> Vec<String> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|e| e.body.clone())
            .collect()
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn receive(
        &self,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let mut claimed = Vec::new();

        for entry in entries.iter_mut() {
            if claimed.len() >= max_messages {
                break;
            }
            if entry.visible_at > now {
                continue;
            }
            let receipt = Uuid::new_v4().to_string();
            entry.dequeue_count += 1;
            entry.visible_at = now + visibility_timeout;
            entry.pop_receipt = Some(receipt.clone());
            claimed.push(QueueMessage {
                id: entry.id.clone(),
                pop_receipt: receipt,
                body: entry.body.clone(),
                dequeue_count: entry.dequeue_count,
                inserted_at: entry.inserted_at,
            });
        }

        if !claimed.is_empty() {
            debug!(queue = %self.name, count = claimed.len(), "Messages claimed");
        }
        Ok(claimed)
    }

    async fn acknowledge(&self, message: &QueueMessage) -> Result<(), QueueError> {
        let mut entries = self.entries.lock().await;
        let fail = |reason: &str| QueueError::AcknowledgeFailed {
            queue: self.name.clone(),
            id: message.id.clone(),
            reason: reason.to_string(),
        };

        let position = entries
            .iter()
            .position(|e| e.id == message.id)
            .ok_or_else(|| fail("message not found"))?;
        if entries[position].pop_receipt.as_deref() != Some(message.pop_receipt.as_str()) {
            return Err(fail("pop receipt does not match the latest receive"));
        }
        entries.remove(position);
        Ok(())
    }

    async fn send(&self, body: &str) -> Result<String, QueueError> {
        let id = Uuid::new_v4().to_string();
        self.entries.lock().await.push(Entry {
            id: id.clone(),
            body: body.to_string(),
            dequeue_count: 0,
            inserted_at: Utc::now(),
            visible_at: Instant::now(),
            pop_receipt: None,
        });
        Ok(id)
    }
}
