//! Nearest-centroid intent classifier on top of an [`Embedder`].

use std::sync::Arc;

use async_trait::async_trait;

use super::{Embedder, IntentClassifier, IntentPrediction};
use crate::error::EmbeddingError;
use crate::pipeline::taxonomy::Taxonomy;

/// Intents are stored as a flat [`Taxonomy`] of intent name to centroid.
pub struct CentroidIntentClassifier {
    embedder: Arc<dyn Embedder>,
    intents: Taxonomy,
}

impl CentroidIntentClassifier {
    pub fn new(embedder: Arc<dyn Embedder>, intents: Taxonomy) -> Self {
        Self { embedder, intents }
    }

    pub fn intents(&self) -> &Taxonomy {
        &self.intents
    }
}

#[async_trait]
impl IntentClassifier for CentroidIntentClassifier {
    async fn predict(&self, text: &str) -> Result<IntentPrediction, EmbeddingError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(IntentPrediction::unknown());
        }

        let embedding = self
            .embedder
            .embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::InvalidResponse {
                reason: "no embedding returned".to_string(),
            })?;

        let best = self.intents.match_embedding(&embedding, 1)?.into_iter().next();
        Ok(match best {
            Some(m) => IntentPrediction {
                intent: m.label,
                confidence: m.score.max(0.0),
            },
            None => IntentPrediction::unknown(),
        })
    }
}
