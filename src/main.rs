use std::sync::Arc;

use inbox_classifier::config::{EmbeddingConfig, WorkerConfig};
use inbox_classifier::embedding::{Embedder, HttpEmbedder};
use inbox_classifier::error::Result;
use inbox_classifier::pipeline::drift::DriftMonitor;
use inbox_classifier::pipeline::orchestrator::{PipelineDeps, PipelineOrchestrator};
use inbox_classifier::pipeline::preprocessor::Preprocessor;
use inbox_classifier::pipeline::taxonomy::Taxonomy;
use inbox_classifier::pipeline::worker::{WorkerStats, spawn_workers};
use inbox_classifier::queue::{MemoryQueue, MessageQueue};
use inbox_classifier::shutdown::ShutdownSignal;
use inbox_classifier::storage::{BlobStore, FsBlobStore, is_temp_key};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    // Configuration and taxonomy errors abort before anything is consumed.
    let config = WorkerConfig::from_env()?;
    let embedding_config = EmbeddingConfig::from_env()?;
    let taxonomy = Arc::new(Taxonomy::load(&config.taxonomy_path)?);
    let http_embedder = HttpEmbedder::new(&embedding_config)?;
    let embedding_endpoint = http_embedder.endpoint().to_string();
    let embedder: Arc<dyn Embedder> = Arc::new(http_embedder);

    eprintln!("📬 Inbox Classifier v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Storage: {}", config.storage_root.display());
    eprintln!(
        "   Containers: {} -> {}",
        config.pipeline.input_container, config.pipeline.output_container
    );
    eprintln!(
        "   Taxonomy: {} ({} labels, dim {})",
        taxonomy.version(),
        taxonomy.len(),
        taxonomy.dimension()
    );
    eprintln!(
        "   Embedding: {} @ {}",
        embedding_config.model, embedding_endpoint
    );
    eprintln!("   Workers: {}\n", config.worker_count);

    if taxonomy.is_placeholder() {
        warn!("Placeholder taxonomy loaded; drift alerts are suppressed");
    }

    // ── Storage & queues ────────────────────────────────────────────────
    let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(config.storage_root.clone()));
    let queue = Arc::new(MemoryQueue::new(config.queue_name.clone()));
    let poison_queue = Arc::new(MemoryQueue::new(config.poison_queue_name.clone()));

    let seeded = seed_queue(
        blobs.as_ref(),
        queue.as_ref(),
        &config.pipeline.input_container,
    )
    .await?;
    info!(queue = %config.queue_name, seeded, "Queue seeded from input container");

    // ── Pipeline ────────────────────────────────────────────────────────
    let deps = PipelineDeps {
        blobs: Arc::clone(&blobs),
        queue: queue.clone(),
        dead_letter: poison_queue.clone(),
        embedder,
        taxonomy,
        drift: DriftMonitor::shared(config.drift.clone()),
        preprocessor: Arc::new(Preprocessor::new(config.preprocess.clone())),
    };
    let orchestrator = Arc::new(PipelineOrchestrator::new(config.pipeline.clone(), deps));

    // Handlers must be registered before workers claim messages.
    let mut shutdown = ShutdownSignal::install()?;
    let cancel = CancellationToken::new();
    let handles = spawn_workers(
        config.worker_count,
        orchestrator,
        queue.clone(),
        config.polling.clone(),
        cancel.clone(),
    );

    shutdown.wait().await?;
    cancel.cancel();

    let mut total = WorkerStats::default();
    for result in futures::future::join_all(handles).await {
        match result {
            Ok(stats) => total.merge(&stats),
            Err(e) => error!(error = %e, "Worker task failed"),
        }
    }

    // The in-memory poison queue dies with the process; keep its records.
    for body in poison_queue.bodies().await {
        let key = format!("{}.json", Uuid::new_v4().simple());
        if let Err(e) = blobs
            .write(&config.poison_queue_name, &key, body.as_bytes(), false)
            .await
        {
            error!(error = %e, "Failed to persist dead-letter record");
        }
    }

    info!(
        completed = total.completed,
        skipped = total.skipped,
        retried = total.retried,
        poisoned = total.poisoned,
        remaining = queue.len().await,
        "Inbox Classifier stopped"
    );
    Ok(())
}

/// Local transport: enqueue a reference to every payload already in `container`.
async fn seed_queue(
    blobs: &dyn BlobStore,
    queue: &dyn MessageQueue,
    container: &str,
) -> Result<usize> {
    let mut seeded = 0usize;
    for key in blobs.list(container).await? {
        if is_temp_key(&key) {
            continue;
        }
        let body = serde_json::json!({ "blob_name": key }).to_string();
        queue.send(&body).await?;
        seeded += 1;
    }
    Ok(seeded)
}
