//! Classification pipeline.
//!
//! Every queue message flows through:
//! 1. `Preprocessor::run()`: clean, gate on language and spam, merge thread
//! 2. `Embedder::embed()`: external embedding call
//! 3. `Taxonomy::match_embedding()`: nearest centroids, top-K
//! 4. `DriftMonitor::record()`: side channel, never blocks a message
//! 5. `publish_json()` then acknowledge
//!
//! `PipelineOrchestrator` owns the per-message lifecycle and the
//! retry/poison decisions; `worker` drives it from the queue.

pub mod drift;
pub mod eval;
pub mod orchestrator;
pub mod preprocessor;
pub mod state;
pub mod taxonomy;
pub mod types;
pub mod worker;
