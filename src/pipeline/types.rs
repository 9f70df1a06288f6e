//! Shared types for the conversation processing pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PayloadError;

// ── Inbound payload ─────────────────────────────────────────────────

/// One inbound email event, as produced by upstream systems.
///
/// Immutable once received. Use [`EmailPayload::parse`] to get a value
/// that has passed every schema and invariant check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmailPayload {
    /// Unique identifier of the email.
    pub message_id: String,
    /// Subject line.
    pub subject: String,
    /// Raw body text or HTML content.
    pub body: String,
    /// Sender address.
    pub sender: String,
    /// Recipient addresses, in header order.
    pub recipients: Vec<String>,
    /// Attachment filenames.
    #[serde(default)]
    pub attachments: Vec<String>,
    /// When the email was sent/received.
    pub timestamp: DateTime<Utc>,
    /// Optional priority indicator ("high", "normal", ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    /// Conversation identifier if provided by upstream.
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Thread identifier if provided instead of `conversation_id`.
    #[serde(default)]
    pub thread_id: Option<String>,
    /// Earlier messages of the same conversation, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub thread: Vec<ThreadMessage>,
}

/// An earlier message in the conversation carried along with the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThreadMessage {
    pub sender: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl EmailPayload {
    /// Parse and validate a raw JSON payload.
    pub fn parse(raw: &str) -> Result<Self, PayloadError> {
        let payload: EmailPayload = serde_json::from_str(raw)?;
        payload.validate()
    }

    /// Check required fields and the thread-identifier invariant.
    ///
    /// Returns a normalized copy: string fields trimmed, blank optional
    /// identifiers collapsed to `None`.
    pub fn validate(mut self) -> Result<Self, PayloadError> {
        self.message_id = self.message_id.trim().to_string();
        self.sender = self.sender.trim().to_string();
        self.subject = self.subject.trim().to_string();
        self.body = self.body.trim().to_string();

        if self.message_id.is_empty() {
            return Err(PayloadError::EmptyField { field: "message_id" });
        }
        if self.sender.is_empty() {
            return Err(PayloadError::EmptyField { field: "sender" });
        }

        self.recipients = self
            .recipients
            .into_iter()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect();
        if self.recipients.is_empty() {
            return Err(PayloadError::NoRecipients);
        }

        self.conversation_id = non_blank(self.conversation_id);
        self.thread_id = non_blank(self.thread_id);
        if self.conversation_id.is_none() && self.thread_id.is_none() {
            return Err(PayloadError::MissingThreadIdentifier);
        }

        Ok(self)
    }

    /// Conversation key: conversation id, else thread id, else message id.
    pub fn conversation_key(&self) -> &str {
        self.conversation_id
            .as_deref()
            .or(self.thread_id.as_deref())
            .unwrap_or(&self.message_id)
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// ── Conversation ────────────────────────────────────────────────────

/// Cleaned, merged conversation ready for embedding and classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_id: String,
    /// Subject followed by the cleaned message bodies.
    pub body: String,
    /// Detected language code.
    pub language: String,
    /// Heuristic in [0, 1]; 1.0 means evenly sized thread segments.
    pub thread_consistency: f64,
}

// ── Matching & output ───────────────────────────────────────────────

/// A taxonomy label and its cosine similarity to the query embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub label: String,
    pub score: f32,
}

/// Record persisted per conversation in the output container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub conversation_id: String,
    pub taxonomy_version: String,
    pub matches: Vec<MatchResult>,
    pub language: String,
    pub model_version: String,
}

// ── Failure reporting ───────────────────────────────────────────────

/// Classification of a per-message failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Schema or invariant violation. Never retried.
    MalformedPayload,
    /// Referenced storage object is missing. Never retried.
    NotFound,
    /// Embedder, storage or queue temporarily unavailable.
    TransientDependencyFailure,
    /// Deployment inconsistency, e.g. embedder and taxonomy dimensions differ.
    FatalConfigurationError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MalformedPayload => "MalformedPayload",
            Self::NotFound => "NotFound",
            Self::TransientDependencyFailure => "TransientDependencyFailure",
            Self::FatalConfigurationError => "FatalConfigurationError",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error section of a dead-letter record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub kind: ErrorKind,
    pub message: String,
}

/// Everything an operator needs to replay a dead-lettered message.
///
/// Delivery is at least once. If the primary queue rejects the acknowledge
/// after the record was sent, the message is redelivered and dead-lettered
/// again, so consumers should deduplicate on `original_message_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub original_message_id: String,
    pub dequeue_count: u32,
    pub failed_at: DateTime<Utc>,
    pub error: FailureDetail,
    /// Payload JSON when it parsed, otherwise the raw text.
    pub original_payload: serde_json::Value,
}

impl DeadLetterRecord {
    pub fn new(
        original_message_id: impl Into<String>,
        dequeue_count: u32,
        kind: ErrorKind,
        message: impl Into<String>,
        raw_payload: &str,
    ) -> Self {
        let original_payload = serde_json::from_str(raw_payload)
            .unwrap_or_else(|_| serde_json::Value::String(raw_payload.to_string()));
        Self {
            original_message_id: original_message_id.into(),
            dequeue_count,
            failed_at: Utc::now(),
            error: FailureDetail {
                kind,
                message: message.into(),
            },
            original_payload,
        }
    }
}

// ── Processing outcome ──────────────────────────────────────────────

/// Final result of handling one queue message.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessingOutcome {
    /// Output published and source message acknowledged.
    Completed { record: OutputRecord },
    /// Dropped by preprocessing (language, spam, empty). Acknowledged.
    Skipped { reason: String },
    /// Left on the queue for redelivery.
    RetryableFailure { kind: ErrorKind, reason: String },
    /// Dead-lettered and acknowledged.
    Poisoned { kind: ErrorKind, reason: String },
}

impl ProcessingOutcome {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::Skipped { .. } => "skipped",
            Self::RetryableFailure { .. } => "retryable_failure",
            Self::Poisoned { .. } => "poisoned",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Completed { .. } => None,
            Self::Skipped { reason }
            | Self::RetryableFailure { reason, .. }
            | Self::Poisoned { reason, .. } => Some(reason),
        }
    }

    pub fn record(&self) -> Option<&OutputRecord> {
        match self {
            Self::Completed { record } => Some(record),
            _ => None,
        }
    }
}
