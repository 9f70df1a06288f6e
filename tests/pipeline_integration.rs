//! Integration tests for the classification pipeline.
//!
//! Each test wires the orchestrator to in-memory storage and queues plus a
//! stub embedder, then drives messages through the public API.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use inbox_classifier::config::{DriftConfig, LoopSettings, PipelineSettings, PreprocessConfig};
use inbox_classifier::embedding::Embedder;
use inbox_classifier::error::{EmbeddingError, QueueError, StorageError};
use inbox_classifier::pipeline::drift::DriftMonitor;
use inbox_classifier::pipeline::orchestrator::{PipelineDeps, PipelineOrchestrator};
use inbox_classifier::pipeline::preprocessor::{LanguageDetector, Preprocessor, preprocess_payload};
use inbox_classifier::pipeline::taxonomy::{Taxonomy, TaxonomyEntry};
use inbox_classifier::pipeline::types::{
    DeadLetterRecord, EmailPayload, ErrorKind, OutputRecord, ProcessingOutcome,
};
use inbox_classifier::pipeline::worker::spawn_worker;
use inbox_classifier::queue::{DeadLetterSink, MemoryQueue, MessageQueue, QueueMessage};
use inbox_classifier::storage::{BlobStore, MemoryBlobStore};

/// Maximum time any async loop test is allowed to run.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

const INPUT: &str = "incoming";
const OUTPUT: &str = "classified";

// ── Stubs ───────────────────────────────────────────────────────────

/// Returns the same vector for every input and counts calls.
struct StubEmbedder {
    vector: Vec<f32>,
    calls: AtomicUsize,
}

impl StubEmbedder {
    fn new(vector: Vec<f32>) -> Arc<Self> {
        Arc::new(Self {
            vector,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Embedder for StubEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|_| self.vector.clone()).collect())
    }
}

/// Embedding endpoint that is always down.
struct DownEmbedder;

#[async_trait]
impl Embedder for DownEmbedder {
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Err(EmbeddingError::RequestFailed {
            reason: "connection refused".into(),
        })
    }
}

/// Always reports English.
struct EnglishDetector;

impl LanguageDetector for EnglishDetector {
    fn detect(&self, _text: &str) -> Option<String> {
        Some("en".into())
    }
}

/// Blob store whose reads always fail with a backend error.
struct FlakyBlobStore;

#[async_trait]
impl BlobStore for FlakyBlobStore {
    async fn read(&self, container: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        Err(StorageError::Backend {
            container: container.into(),
            key: key.into(),
            reason: "503 from storage".into(),
        })
    }
    async fn write(&self, _: &str, _: &str, _: &[u8], _: bool) -> Result<(), StorageError> {
        Ok(())
    }
    async fn promote(&self, _: &str, _: &str, _: &str) -> Result<(), StorageError> {
        Ok(())
    }
    async fn delete(&self, _: &str, _: &str) -> Result<(), StorageError> {
        Ok(())
    }
    async fn list(&self, _: &str) -> Result<Vec<String>, StorageError> {
        Ok(Vec::new())
    }
}

/// Dead-letter channel that rejects every record.
struct BrokenSink;

#[async_trait]
impl DeadLetterSink for BrokenSink {
    async fn dead_letter(&self, _record: &DeadLetterRecord) -> Result<(), QueueError> {
        Err(QueueError::SendFailed {
            queue: "poison".into(),
            reason: "unavailable".into(),
        })
    }
}

/// Primary queue that rejects its first `failures` acknowledgements.
struct StubbornAckQueue {
    inner: Arc<MemoryQueue>,
    failures: AtomicUsize,
}

#[async_trait]
impl MessageQueue for StubbornAckQueue {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn receive(&self, max: usize, visibility: Duration) -> Result<Vec<QueueMessage>, QueueError> {
        self.inner.receive(max, visibility).await
    }

    async fn acknowledge(&self, message: &QueueMessage) -> Result<(), QueueError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(QueueError::AcknowledgeFailed {
                queue: self.name().to_string(),
                id: message.id.clone(),
                reason: "connection reset".into(),
            });
        }
        self.inner.acknowledge(message).await
    }

    async fn send(&self, body: &str) -> Result<String, QueueError> {
        self.inner.send(body).await
    }
}

// ── Harness ─────────────────────────────────────────────────────────

struct Harness {
    blobs: Arc<MemoryBlobStore>,
    queue: Arc<MemoryQueue>,
    poison: Arc<MemoryQueue>,
    orchestrator: Arc<PipelineOrchestrator>,
}

fn taxonomy() -> Taxonomy {
    Taxonomy::from_entries(
        "v1.0",
        vec![],
        vec![
            TaxonomyEntry::new("Billing > Refund", vec![1.0, 0.0, 0.0]),
            TaxonomyEntry::new("Support > Login", vec![0.0, 1.0, 0.0]),
            TaxonomyEntry::new("Sales > Quote", vec![0.0, 0.0, 1.0]),
        ],
    )
    .unwrap()
}

fn english_preprocessor() -> Preprocessor {
    Preprocessor::with_detector(PreprocessConfig::new(&["en"]), Box::new(EnglishDetector))
}

struct HarnessBuilder {
    embedder: Arc<dyn Embedder>,
    preprocessor: Preprocessor,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
    settings: PipelineSettings,
    ack_failures: usize,
}

impl HarnessBuilder {
    fn new() -> Self {
        Self {
            embedder: StubEmbedder::new(vec![0.9, 0.1, 0.0]),
            preprocessor: english_preprocessor(),
            dead_letter: None,
            settings: PipelineSettings::default(),
            ack_failures: 0,
        }
    }

    fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = embedder;
        self
    }

    fn preprocessor(mut self, preprocessor: Preprocessor) -> Self {
        self.preprocessor = preprocessor;
        self
    }

    fn dead_letter(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letter = Some(sink);
        self
    }

    fn settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    fn ack_failures(mut self, failures: usize) -> Self {
        self.ack_failures = failures;
        self
    }

    fn build(self) -> Harness {
        self.build_with_blobs(None)
    }

    fn build_with_blobs(self, blobs_override: Option<Arc<dyn BlobStore>>) -> Harness {
        let blobs = Arc::new(MemoryBlobStore::new());
        let queue = Arc::new(MemoryQueue::new("emails"));
        let poison = Arc::new(MemoryQueue::new("emails-poison"));
        let deps = PipelineDeps {
            blobs: blobs_override.unwrap_or_else(|| blobs.clone() as Arc<dyn BlobStore>),
            queue: Arc::new(StubbornAckQueue {
                inner: queue.clone(),
                failures: AtomicUsize::new(self.ack_failures),
            }),
            dead_letter: self
                .dead_letter
                .unwrap_or_else(|| poison.clone() as Arc<dyn DeadLetterSink>),
            embedder: self.embedder,
            taxonomy: Arc::new(taxonomy()),
            drift: DriftMonitor::shared(DriftConfig::default()),
            preprocessor: Arc::new(self.preprocessor),
        };
        Harness {
            blobs,
            queue,
            poison,
            orchestrator: Arc::new(PipelineOrchestrator::new(self.settings, deps)),
        }
    }
}

fn payload(conversation_id: &str, subject: &str, body: &str) -> Value {
    json!({
        "message_id": format!("m-{conversation_id}"),
        "subject": subject,
        "body": body,
        "sender": "customer@example.com",
        "recipients": ["support@example.com"],
        "timestamp": "2024-05-01T12:00:00Z",
        "conversation_id": conversation_id,
    })
}

impl Harness {
    /// Store a payload blob and enqueue a reference to it.
    async fn enqueue(&self, key: &str, payload: &Value) {
        self.blobs
            .write(INPUT, key, payload.to_string().as_bytes(), true)
            .await
            .unwrap();
        self.queue
            .send(&json!({ "blob_name": key }).to_string())
            .await
            .unwrap();
    }

    /// Claim one message, immediately visible again if not acknowledged.
    async fn claim(&self) -> Option<QueueMessage> {
        self.queue
            .receive(1, Duration::ZERO)
            .await
            .unwrap()
            .into_iter()
            .next()
    }

    async fn process_next(&self) -> ProcessingOutcome {
        let message = self.claim().await.expect("queue should not be empty");
        self.orchestrator.handle(&message).await
    }

    async fn output(&self, conversation_id: &str) -> OutputRecord {
        let raw = self
            .blobs
            .read(OUTPUT, &format!("{conversation_id}.json"))
            .await
            .unwrap();
        serde_json::from_slice(&raw).unwrap()
    }

    async fn dead_letters(&self) -> Vec<Value> {
        self.poison
            .bodies()
            .await
            .iter()
            .map(|b| serde_json::from_str(b).unwrap())
            .collect()
    }
}

// ── End to end ──────────────────────────────────────────────────────

#[tokio::test]
async fn valid_payload_is_published_and_acknowledged() {
    let h = HarnessBuilder::new()
        .preprocessor(Preprocessor::new(PreprocessConfig::new(&["en"])))
        .build();
    h.enqueue("c-1.json", &payload("c-1", "Test subject", "Hello, this is a body."))
        .await;

    let outcome = h.process_next().await;
    let ProcessingOutcome::Completed { record } = &outcome else {
        panic!("expected completed, got {outcome:?}");
    };
    assert_eq!(record.conversation_id, "c-1");

    let stored = h.output("c-1").await;
    assert_eq!(&stored, record);
    assert_eq!(stored.taxonomy_version, "v1.0");
    assert_eq!(stored.model_version, "v1.0.0");
    assert_eq!(stored.language, "en");
    assert_eq!(stored.matches.len(), 3);
    assert_eq!(stored.matches[0].label, "Billing > Refund");

    assert_eq!(h.blobs.list(OUTPUT).await.unwrap(), vec!["c-1.json"]);
    assert!(h.queue.is_empty().await);
    assert!(h.poison.is_empty().await);
}

#[tokio::test]
async fn real_language_detection_end_to_end() {
    let h = HarnessBuilder::new()
        .preprocessor(Preprocessor::new(PreprocessConfig::default()))
        .build();
    h.enqueue(
        "c-7.json",
        &payload(
            "c-7",
            "Question about the invoice you sent last week",
            "Hello, I would like to know why my last invoice was charged twice this month.",
        ),
    )
    .await;

    let outcome = h.process_next().await;
    assert_eq!(outcome.label(), "completed", "{outcome:?}");
    assert_eq!(h.output("c-7").await.language, "en");
}

#[test]
fn footer_stripped_from_conversation_body() {
    let parsed: EmailPayload = serde_json::from_value(payload(
        "c-2",
        "Test subject",
        "Real content.\n\nSent from my iPhone",
    ))
    .unwrap();
    let conversation = preprocess_payload(&parsed, &["en".to_string()]).expect("conversation");
    assert!(conversation.body.contains("Real content."));
    assert!(!conversation.body.contains("Sent from my iPhone"));
    assert_eq!(conversation.language, "en");
}

#[tokio::test]
async fn publishing_same_conversation_twice_keeps_one_object() {
    let h = HarnessBuilder::new().build();
    let body = payload("c-3", "Refund", "Please refund my last order.");
    h.enqueue("first.json", &body).await;
    h.enqueue("second.json", &body).await;

    assert_eq!(h.process_next().await.label(), "completed");
    let first = h.output("c-3").await;
    assert_eq!(h.process_next().await.label(), "completed");

    assert_eq!(h.blobs.list(OUTPUT).await.unwrap(), vec!["c-3.json"]);
    assert_eq!(h.output("c-3").await, first);
}

#[tokio::test]
async fn thread_id_used_when_conversation_id_missing() {
    let h = HarnessBuilder::new().build();
    let mut body = payload("ignored", "Login", "I cannot log in to my account.");
    body["conversation_id"] = Value::Null;
    body["thread_id"] = json!("t-9");
    h.enqueue("t.json", &body).await;

    assert_eq!(h.process_next().await.label(), "completed");
    assert_eq!(h.output("t-9").await.conversation_id, "t-9");
}

// ── Drops ───────────────────────────────────────────────────────────

#[tokio::test]
async fn spam_is_skipped_and_acknowledged() {
    let embedder = StubEmbedder::new(vec![1.0, 0.0, 0.0]);
    let h = HarnessBuilder::new().embedder(embedder.clone()).build();
    h.enqueue("spam.json", &payload("c-4", "Limited offer", "Buy NOW and save"))
        .await;

    let outcome = h.process_next().await;
    assert!(matches!(outcome, ProcessingOutcome::Skipped { .. }), "{outcome:?}");
    assert!(outcome.reason().unwrap().contains("buy now"));
    assert!(h.queue.is_empty().await);
    assert!(h.poison.is_empty().await);
    assert!(h.blobs.list(OUTPUT).await.unwrap().is_empty());
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn drift_monitor_records_only_matched_messages() {
    let h = HarnessBuilder::new().build();
    h.enqueue("c-1.json", &payload("c-1", "Refund", "Please refund my last order."))
        .await;
    let outcome = h.process_next().await;
    let record = outcome.record().expect("completed").clone();

    {
        let drift = h.orchestrator.drift().lock().await;
        assert_eq!(drift.len(), 1);
        assert_eq!(drift.snapshot().mean, f64::from(record.matches[0].score));
    }

    h.enqueue("spam.json", &payload("c-4", "Limited offer", "Buy NOW and save"))
        .await;
    assert_eq!(h.process_next().await.label(), "skipped");

    let mut bad = payload("c-5", "Subject", "Body text here.");
    bad.as_object_mut().unwrap().remove("conversation_id");
    h.enqueue("bad.json", &bad).await;
    assert_eq!(h.process_next().await.label(), "poisoned");

    assert_eq!(h.orchestrator.drift().lock().await.len(), 1);
}

#[tokio::test]
async fn drift_monitor_untouched_when_embedding_fails() {
    let h = HarnessBuilder::new().embedder(Arc::new(DownEmbedder)).build();
    h.enqueue("c-6.json", &payload("c-6", "Refund", "Please refund my last order."))
        .await;

    assert_eq!(h.process_next().await.label(), "retryable_failure");
    assert!(h.orchestrator.drift().lock().await.is_empty());
}

// ── Poisoning ───────────────────────────────────────────────────────

#[tokio::test]
async fn payload_without_thread_identifier_is_poisoned() {
    let h = HarnessBuilder::new().build();
    let mut body = payload("c-5", "Subject", "Body text here.");
    body.as_object_mut().unwrap().remove("conversation_id");
    h.enqueue("bad.json", &body).await;

    let outcome = h.process_next().await;
    assert!(
        matches!(
            outcome,
            ProcessingOutcome::Poisoned {
                kind: ErrorKind::MalformedPayload,
                ..
            }
        ),
        "{outcome:?}"
    );
    assert!(h.queue.is_empty().await);

    let letters = h.dead_letters().await;
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0]["error"]["kind"], "MalformedPayload");
    assert_eq!(letters[0]["dequeue_count"], 1);
    assert_eq!(letters[0]["original_payload"]["message_id"], "m-c-5");
}

#[tokio::test]
async fn dead_lettered_message_acknowledged_on_second_attempt() {
    let h = HarnessBuilder::new().ack_failures(1).build();
    let mut body = payload("c-5", "Subject", "Body text here.");
    body.as_object_mut().unwrap().remove("conversation_id");
    h.enqueue("bad.json", &body).await;

    assert_eq!(h.process_next().await.label(), "poisoned");
    assert!(h.queue.is_empty().await);
    assert_eq!(h.dead_letters().await.len(), 1);
}

#[tokio::test]
async fn unacknowledged_dead_letter_is_recorded_again_on_redelivery() {
    let h = HarnessBuilder::new().ack_failures(2).build();
    let mut body = payload("c-5", "Subject", "Body text here.");
    body.as_object_mut().unwrap().remove("conversation_id");
    h.enqueue("bad.json", &body).await;

    assert_eq!(h.process_next().await.label(), "poisoned");
    assert_eq!(h.queue.len().await, 1);

    assert_eq!(h.process_next().await.label(), "poisoned");
    assert!(h.queue.is_empty().await);

    let letters = h.dead_letters().await;
    assert_eq!(letters.len(), 2);
    assert_eq!(letters[0]["original_message_id"], letters[1]["original_message_id"]);
    assert_eq!(letters[1]["dequeue_count"], 2);
}

#[tokio::test]
async fn non_json_payload_is_poisoned_with_raw_text() {
    let h = HarnessBuilder::new().build();
    h.blobs.write(INPUT, "junk.json", b"<<not json>>", true).await.unwrap();
    h.queue.send(r#"{"blob_name": "junk.json"}"#).await.unwrap();

    let outcome = h.process_next().await;
    assert_eq!(outcome.label(), "poisoned");
    let letters = h.dead_letters().await;
    assert_eq!(letters[0]["original_payload"], "<<not json>>");
}

#[tokio::test]
async fn unrecognized_queue_message_is_poisoned() {
    let h = HarnessBuilder::new().build();
    h.queue.send("hello").await.unwrap();

    let outcome = h.process_next().await;
    assert!(matches!(
        outcome,
        ProcessingOutcome::Poisoned {
            kind: ErrorKind::MalformedPayload,
            ..
        }
    ));
    assert_eq!(h.dead_letters().await[0]["original_payload"], "hello");
}

#[tokio::test]
async fn missing_blob_is_poisoned_not_found() {
    let h = HarnessBuilder::new().build();
    h.queue
        .send(r#"{"data": {"url": "https://acct.blob.core.windows.net/incoming/gone.json"}}"#)
        .await
        .unwrap();

    let outcome = h.process_next().await;
    assert!(
        matches!(
            outcome,
            ProcessingOutcome::Poisoned {
                kind: ErrorKind::NotFound,
                ..
            }
        ),
        "{outcome:?}"
    );
    assert!(h.queue.is_empty().await);
    assert_eq!(h.dead_letters().await[0]["error"]["kind"], "NotFound");
}

#[tokio::test]
async fn oversized_payload_is_poisoned() {
    let settings = PipelineSettings {
        max_payload_bytes: 64,
        ..PipelineSettings::default()
    };
    let h = HarnessBuilder::new().settings(settings).build();
    h.enqueue("big.json", &payload("c-6", "Subject", &"x".repeat(200)))
        .await;

    let outcome = h.process_next().await;
    assert_eq!(outcome.label(), "poisoned");
    assert!(outcome.reason().unwrap().contains("limit is 64"));
}

#[tokio::test]
async fn embedding_dimension_mismatch_is_fatal_configuration() {
    let h = HarnessBuilder::new()
        .embedder(StubEmbedder::new(vec![1.0, 0.0]))
        .build();
    h.enqueue("c-8.json", &payload("c-8", "Refund", "Please refund me."))
        .await;

    let outcome = h.process_next().await;
    assert!(
        matches!(
            outcome,
            ProcessingOutcome::Poisoned {
                kind: ErrorKind::FatalConfigurationError,
                ..
            }
        ),
        "{outcome:?}"
    );
    assert!(h.blobs.list(OUTPUT).await.unwrap().is_empty());
}

#[tokio::test]
async fn transient_failure_dead_lettered_exactly_once_past_threshold() {
    let h = HarnessBuilder::new().embedder(Arc::new(DownEmbedder)).build();
    h.enqueue("c-9.json", &payload("c-9", "Refund", "Please refund me."))
        .await;

    let mut outcomes = Vec::new();
    while let Some(message) = h.claim().await {
        outcomes.push(h.orchestrator.handle(&message).await);
        assert!(outcomes.len() <= 10, "message never left the queue");
    }

    let labels: Vec<_> = outcomes.iter().map(ProcessingOutcome::label).collect();
    assert_eq!(
        labels,
        vec![
            "retryable_failure",
            "retryable_failure",
            "retryable_failure",
            "retryable_failure",
            "retryable_failure",
            "poisoned",
        ]
    );
    assert!(matches!(
        outcomes.last(),
        Some(ProcessingOutcome::Poisoned {
            kind: ErrorKind::TransientDependencyFailure,
            ..
        })
    ));

    let letters = h.dead_letters().await;
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0]["dequeue_count"], 6);
    assert_eq!(letters[0]["original_payload"]["conversation_id"], "c-9");
    assert!(h.queue.is_empty().await);
}

#[tokio::test]
async fn transient_storage_failure_is_retryable() {
    let h = HarnessBuilder::new().build_with_blobs(Some(Arc::new(FlakyBlobStore)));
    h.queue.send(r#"{"blob_name": "a.json"}"#).await.unwrap();

    let outcome = h.process_next().await;
    assert!(matches!(
        outcome,
        ProcessingOutcome::RetryableFailure {
            kind: ErrorKind::TransientDependencyFailure,
            ..
        }
    ));
    assert_eq!(h.queue.len().await, 1);
    assert!(h.poison.is_empty().await);
}

#[tokio::test]
async fn failed_dead_letter_leaves_message_on_queue() {
    let h = HarnessBuilder::new().dead_letter(Arc::new(BrokenSink)).build();
    h.queue.send(r#"{"blob_name": "missing.json"}"#).await.unwrap();

    let outcome = h.process_next().await;
    assert_eq!(outcome.label(), "retryable_failure");
    assert_eq!(h.queue.len().await, 1);
}

// ── Worker loop ─────────────────────────────────────────────────────

fn fast_loop() -> LoopSettings {
    LoopSettings {
        batch_size: 2,
        visibility_timeout: Duration::from_secs(30),
        poll_interval: Duration::from_millis(10),
    }
}

#[tokio::test]
async fn worker_drains_queue_until_cancelled() {
    let h = HarnessBuilder::new().build();
    for id in ["w-1", "w-2", "w-3"] {
        h.enqueue(&format!("{id}.json"), &payload(id, "Refund", "Please refund my order."))
            .await;
    }

    let cancel = CancellationToken::new();
    let handle = spawn_worker(
        0,
        Arc::clone(&h.orchestrator),
        h.queue.clone(),
        fast_loop(),
        cancel.clone(),
    );

    timeout(TEST_TIMEOUT, async {
        while h.blobs.list(OUTPUT).await.unwrap().len() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("worker did not publish all records");

    cancel.cancel();
    let stats = timeout(TEST_TIMEOUT, handle)
        .await
        .expect("worker did not stop")
        .unwrap();
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.received, 3);
    assert!(h.queue.is_empty().await);
}

#[tokio::test]
async fn idle_worker_stops_promptly_on_cancel() {
    let h = HarnessBuilder::new().build();
    let settings = LoopSettings {
        poll_interval: Duration::from_secs(60),
        ..fast_loop()
    };
    let cancel = CancellationToken::new();
    let handle = spawn_worker(
        0,
        Arc::clone(&h.orchestrator),
        h.queue.clone(),
        settings,
        cancel.clone(),
    );

    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();
    let stats = timeout(TEST_TIMEOUT, handle)
        .await
        .expect("worker ignored cancellation")
        .unwrap();
    assert_eq!(stats.received, 0);
    assert!(stats.polls >= 1);
}
