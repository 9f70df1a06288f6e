//! Inbox Classifier: queue-driven email conversation classification.

pub mod config;
pub mod embedding;
pub mod error;
pub mod pipeline;
pub mod queue;
pub mod shutdown;
pub mod storage;
