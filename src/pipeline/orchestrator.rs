//! Per-message pipeline: fetch, validate, preprocess, embed, match, publish.
//!
//! Every error is turned into a [`ProcessingOutcome`] here. Nothing escapes
//! to the worker loop.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::PipelineSettings;
use crate::embedding::Embedder;
use crate::error::{PayloadError, StorageError};
use crate::pipeline::drift::SharedDriftMonitor;
use crate::pipeline::preprocessor::{PreprocessOutcome, Preprocessor};
use crate::pipeline::state::{MessageLifecycle, MessageState};
use crate::pipeline::taxonomy::Taxonomy;
use crate::pipeline::types::{
    Conversation, DeadLetterRecord, EmailPayload, ErrorKind, MatchResult, OutputRecord,
    ProcessingOutcome,
};
use crate::queue::{DeadLetterSink, MessageQueue, QueueMessage};
use crate::storage::{BlobStore, publish_json};

/// Collaborators, injected fully configured.
#[derive(Clone)]
pub struct PipelineDeps {
    pub blobs: Arc<dyn BlobStore>,
    pub queue: Arc<dyn MessageQueue>,
    pub dead_letter: Arc<dyn DeadLetterSink>,
    pub embedder: Arc<dyn Embedder>,
    pub taxonomy: Arc<Taxonomy>,
    pub drift: SharedDriftMonitor,
    pub preprocessor: Arc<Preprocessor>,
}

/// A failed stage, before poison-threshold escalation.
#[derive(Debug)]
struct Failure {
    kind: ErrorKind,
    reason: String,
    retryable: bool,
}

impl Failure {
    fn retryable(reason: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::TransientDependencyFailure,
            reason: reason.into(),
            retryable: true,
        }
    }

    fn poisoned(kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            retryable: false,
        }
    }
}

impl From<StorageError> for Failure {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { .. } => Self::poisoned(ErrorKind::NotFound, err.to_string()),
            other => Self::retryable(other.to_string()),
        }
    }
}

impl From<PayloadError> for Failure {
    fn from(err: PayloadError) -> Self {
        Self::poisoned(ErrorKind::MalformedPayload, err.to_string())
    }
}

pub struct PipelineOrchestrator {
    settings: PipelineSettings,
    deps: PipelineDeps,
}

impl PipelineOrchestrator {
    pub fn new(settings: PipelineSettings, deps: PipelineDeps) -> Self {
        Self { settings, deps }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn queue(&self) -> &Arc<dyn MessageQueue> {
        &self.deps.queue
    }

    pub fn drift(&self) -> &SharedDriftMonitor {
        &self.deps.drift
    }

    /// Process one claimed message to a terminal state.
    pub async fn handle(&self, message: &QueueMessage) -> ProcessingOutcome {
        let mut lifecycle = MessageLifecycle::new(&message.id);
        let mut payload_text = None;

        let staged = self
            .run_stages(message, &mut lifecycle, &mut payload_text)
            .await;
        let outcome = self
            .settle(message, staged, &mut lifecycle, payload_text.as_deref())
            .await;

        info!(
            id = %message.id,
            state = %lifecycle.state,
            outcome = outcome.label(),
            dequeue_count = message.dequeue_count,
            reason = outcome.reason().unwrap_or(""),
            "Message processed"
        );
        outcome
    }

    async fn run_stages(
        &self,
        message: &QueueMessage,
        lifecycle: &mut MessageLifecycle,
        payload_text: &mut Option<String>,
    ) -> Result<ProcessingOutcome, Failure> {
        // Received → Validated
        let blob_name = parse_blob_reference(&message.body, &self.settings.input_container)?;
        let bytes = self
            .deps
            .blobs
            .read(&self.settings.input_container, &blob_name)
            .await?;
        if bytes.len() > self.settings.max_payload_bytes {
            return Err(PayloadError::TooLarge {
                size: bytes.len(),
                limit: self.settings.max_payload_bytes,
            }
            .into());
        }
        let text = String::from_utf8_lossy(&bytes).into_owned();
        let payload = EmailPayload::parse(&text);
        *payload_text = Some(text);
        let payload = payload?;
        advance(lifecycle, MessageState::Validated, Some(blob_name));

        // Validated → Preprocessed
        let conversation = match self.deps.preprocessor.run(&payload) {
            PreprocessOutcome::Accepted(conversation) => conversation,
            PreprocessOutcome::Dropped(reason) => {
                let reason = reason.to_string();
                advance(lifecycle, MessageState::Skipped, Some(reason.clone()));
                return Ok(ProcessingOutcome::Skipped { reason });
            }
        };
        advance(lifecycle, MessageState::Preprocessed, None);

        // Preprocessed → Embedded
        let embedding = self.embed(&conversation).await?;
        advance(lifecycle, MessageState::Embedded, None);

        // Embedded → Matched
        let matches = self
            .deps
            .taxonomy
            .match_embedding(&embedding, self.settings.top_k)
            .map_err(|e| Failure::poisoned(ErrorKind::FatalConfigurationError, e.to_string()))?;
        advance(lifecycle, MessageState::Matched, None);
        self.observe_drift(&matches).await;

        // Matched → Published
        let record = OutputRecord {
            conversation_id: conversation.conversation_id.clone(),
            taxonomy_version: self.deps.taxonomy.version().to_string(),
            matches,
            language: conversation.language,
            model_version: self.settings.model_version.clone(),
        };
        let key = format!("{}.json", record.conversation_id);
        publish_json(
            self.deps.blobs.as_ref(),
            &self.settings.output_container,
            &key,
            &record,
        )
        .await
        .map_err(|e| Failure::retryable(format!("publish failed: {e}")))?;
        advance(lifecycle, MessageState::Published, Some(key));

        Ok(ProcessingOutcome::Completed { record })
    }

    async fn embed(&self, conversation: &Conversation) -> Result<Vec<f32>, Failure> {
        self.deps
            .embedder
            .embed(std::slice::from_ref(&conversation.body))
            .await
            .map_err(|e| Failure::retryable(e.to_string()))?
            .into_iter()
            .next()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Failure::retryable("embedder returned no vector"))
    }

    async fn observe_drift(&self, matches: &[MatchResult]) {
        let Some(top) = matches.first() else {
            return;
        };
        let mut monitor = self.deps.drift.lock().await;
        monitor.record(top.score);
        let Some(alert) = monitor.check() else {
            return;
        };
        let stats = monitor.snapshot();
        if self.deps.taxonomy.is_placeholder() {
            debug!(alert = %alert, "Drift alert suppressed for placeholder taxonomy");
        } else {
            warn!(
                alert = %alert,
                window = stats.count,
                mean = stats.mean,
                low_ratio = stats.low_ratio,
                taxonomy_version = %self.deps.taxonomy.version(),
                "Classification drift detected"
            );
        }
    }

    /// Acknowledge, leave for redelivery, or dead-letter.
    async fn settle(
        &self,
        message: &QueueMessage,
        staged: Result<ProcessingOutcome, Failure>,
        lifecycle: &mut MessageLifecycle,
        payload_text: Option<&str>,
    ) -> ProcessingOutcome {
        let failure = match staged {
            Ok(outcome) => match self.deps.queue.acknowledge(message).await {
                Ok(()) => {
                    if lifecycle.state == MessageState::Published {
                        advance(lifecycle, MessageState::Acknowledged, None);
                    }
                    return outcome;
                }
                Err(e) => Failure::retryable(format!("acknowledge failed: {e}")),
            },
            Err(failure) => failure,
        };

        if failure.retryable {
            advance(lifecycle, MessageState::RetryableFailure, Some(failure.reason.clone()));
            if message.dequeue_count <= self.settings.poison_threshold {
                return ProcessingOutcome::RetryableFailure {
                    kind: failure.kind,
                    reason: failure.reason,
                };
            }
            let reason = format!(
                "{} (dequeue count {} exceeds poison threshold {})",
                failure.reason, message.dequeue_count, self.settings.poison_threshold
            );
            return self
                .poison(message, failure.kind, reason, lifecycle, payload_text)
                .await;
        }

        self.poison(message, failure.kind, failure.reason, lifecycle, payload_text)
            .await
    }

    async fn poison(
        &self,
        message: &QueueMessage,
        kind: ErrorKind,
        reason: String,
        lifecycle: &mut MessageLifecycle,
        payload_text: Option<&str>,
    ) -> ProcessingOutcome {
        let record = DeadLetterRecord::new(
            &message.id,
            message.dequeue_count,
            kind,
            &reason,
            payload_text.unwrap_or(&message.body),
        );

        if let Err(e) = self.deps.dead_letter.dead_letter(&record).await {
            // Leave it on the primary queue; the next delivery tries again.
            error!(id = %message.id, kind = %kind, error = %e, "Dead-letter send failed");
            let reason = format!("dead-letter failed: {e}");
            if lifecycle.state != MessageState::RetryableFailure {
                advance(lifecycle, MessageState::RetryableFailure, Some(reason.clone()));
            }
            return ProcessingOutcome::RetryableFailure {
                kind: ErrorKind::TransientDependencyFailure,
                reason,
            };
        }

        error!(
            id = %message.id,
            kind = %kind,
            dequeue_count = message.dequeue_count,
            reason = %reason,
            "Message dead-lettered"
        );
        advance(lifecycle, MessageState::Poisoned, Some(reason.clone()));

        self.acknowledge_dead_lettered(message).await;
        ProcessingOutcome::Poisoned { kind, reason }
    }

    /// Two attempts. A message still on the queue after both is redelivered
    /// and dead-lettered again under the same `original_message_id`.
    async fn acknowledge_dead_lettered(&self, message: &QueueMessage) {
        let Err(first) = self.deps.queue.acknowledge(message).await else {
            return;
        };
        debug!(id = %message.id, error = %first, "Retrying acknowledge of dead-lettered message");
        if let Err(e) = self.deps.queue.acknowledge(message).await {
            warn!(
                id = %message.id,
                error = %e,
                "Failed to acknowledge dead-lettered message; a duplicate record may follow"
            );
        }
    }
}

fn advance(lifecycle: &mut MessageLifecycle, to: MessageState, reason: Option<String>) {
    if let Err(e) = lifecycle.transition_to(to, reason) {
        warn!(id = %lifecycle.message_id, error = %e, "Illegal lifecycle transition");
    }
}

/// Extract the input blob name from a queue message body.
///
/// Accepts `{"blob_name": "..."}` or a storage event `{"data": {"url": "..."}}`
/// whose URL path contains `/<input_container>/`.
pub fn parse_blob_reference(body: &str, input_container: &str) -> Result<String, PayloadError> {
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| PayloadError::UnrecognizedMessage(format!("not JSON: {e}")))?;

    if let Some(name) = value.get("blob_name").and_then(|v| v.as_str()) {
        let name = name.trim();
        if name.is_empty() {
            return Err(PayloadError::EmptyField { field: "blob_name" });
        }
        return Ok(name.to_string());
    }

    let url = value
        .get("data")
        .and_then(|d| d.get("url"))
        .and_then(|u| u.as_str())
        .ok_or_else(|| {
            PayloadError::UnrecognizedMessage("expected `blob_name` or `data.url`".to_string())
        })?;

    let marker = format!("/{input_container}/");
    let name = url
        .split_once(&marker)
        .map(|(_, rest)| rest.split(['?', '#']).next().unwrap_or(rest))
        .filter(|rest| !rest.is_empty())
        .ok_or_else(|| {
            PayloadError::UnrecognizedMessage(format!(
                "url does not reference container `{input_container}`"
            ))
        })?;
    Ok(name.to_string())
}
