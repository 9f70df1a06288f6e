//! Text embedding and intent classification.

mod http;
mod intent;

pub use http::HttpEmbedder;
pub use intent::CentroidIntentClassifier;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EmbeddingError;

/// Intent reported for blank input.
pub const UNKNOWN_INTENT: &str = "Unknown";

/// Maps texts to fixed-dimension vectors, one per input, in input order.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentPrediction {
    pub intent: String,
    pub confidence: f32,
}

impl IntentPrediction {
    pub fn unknown() -> Self {
        Self {
            intent: UNKNOWN_INTENT.to_string(),
            confidence: 0.0,
        }
    }
}

#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn predict(&self, text: &str) -> Result<IntentPrediction, EmbeddingError>;
}

/// Scale a vector to unit length in place. Zero vectors are left alone.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}
