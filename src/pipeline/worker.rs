//! Polling worker loop.
//!
//! Each loop claims a batch, hands every message to the orchestrator, and
//! sleeps when the queue is empty. Cancellation stops claiming; messages
//! already claimed are still processed.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::LoopSettings;
use crate::pipeline::orchestrator::PipelineOrchestrator;
use crate::pipeline::types::ProcessingOutcome;
use crate::queue::MessageQueue;

/// Counters for one worker loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub polls: u64,
    pub received: u64,
    pub completed: u64,
    pub skipped: u64,
    pub retried: u64,
    pub poisoned: u64,
}

impl WorkerStats {
    pub fn record(&mut self, outcome: &ProcessingOutcome) {
        match outcome {
            ProcessingOutcome::Completed { .. } => self.completed += 1,
            ProcessingOutcome::Skipped { .. } => self.skipped += 1,
            ProcessingOutcome::RetryableFailure { .. } => self.retried += 1,
            ProcessingOutcome::Poisoned { .. } => self.poisoned += 1,
        }
    }

    pub fn merge(&mut self, other: &WorkerStats) {
        self.polls += other.polls;
        self.received += other.received;
        self.completed += other.completed;
        self.skipped += other.skipped;
        self.retried += other.retried;
        self.poisoned += other.poisoned;
    }
}

/// Run one worker loop until `cancel` fires.
pub async fn run_worker(
    worker: usize,
    orchestrator: Arc<PipelineOrchestrator>,
    queue: Arc<dyn MessageQueue>,
    settings: LoopSettings,
    cancel: CancellationToken,
) -> WorkerStats {
    let mut stats = WorkerStats::default();
    info!(worker, queue = %queue.name(), batch_size = settings.batch_size, "Worker started");

    loop {
        if cancel.is_cancelled() {
            break;
        }

        stats.polls += 1;
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            r = queue.receive(settings.batch_size, settings.visibility_timeout) => r,
        };

        match received {
            Ok(messages) if !messages.is_empty() => {
                stats.received += messages.len() as u64;
                for message in &messages {
                    let outcome = orchestrator.handle(message).await;
                    stats.record(&outcome);
                }
                continue;
            }
            Ok(_) => {}
            Err(e) => error!(worker, error = %e, "Queue receive failed"),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(settings.poll_interval) => {}
        }
    }

    info!(
        worker,
        completed = stats.completed,
        skipped = stats.skipped,
        retried = stats.retried,
        poisoned = stats.poisoned,
        "Worker stopped"
    );
    stats
}

pub fn spawn_worker(
    worker: usize,
    orchestrator: Arc<PipelineOrchestrator>,
    queue: Arc<dyn MessageQueue>,
    settings: LoopSettings,
    cancel: CancellationToken,
) -> JoinHandle<WorkerStats> {
    tokio::spawn(run_worker(worker, orchestrator, queue, settings, cancel))
}

/// Start `count` loops sharing one orchestrator and queue.
pub fn spawn_workers(
    count: usize,
    orchestrator: Arc<PipelineOrchestrator>,
    queue: Arc<dyn MessageQueue>,
    settings: LoopSettings,
    cancel: CancellationToken,
) -> Vec<JoinHandle<WorkerStats>> {
    (0..count.max(1))
        .map(|worker| {
            spawn_worker(
                worker,
                Arc::clone(&orchestrator),
                Arc::clone(&queue),
                settings.clone(),
                cancel.clone(),
            )
        })
        .collect()
}
