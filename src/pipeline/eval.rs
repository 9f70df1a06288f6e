//! Offline accuracy check against a labelled golden set.
//!
//! Level-1 and intent accuracy are reported separately; there is no
//! combined score.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::embedding::{Embedder, IntentClassifier};
use crate::error::{EmbeddingError, EvalError};
use crate::pipeline::taxonomy::{Taxonomy, top_level};

/// Label used when the taxonomy yields no match.
pub const FALLBACK_LABEL: &str = "Other > Uncategorized";

#[derive(Debug, Deserialize)]
struct GoldenRow {
    #[serde(default)]
    conversation: GoldenConversation,
    #[serde(default)]
    labels: GoldenLabels,
}

#[derive(Debug, Default, Deserialize)]
struct GoldenConversation {
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    messages: Vec<GoldenMessage>,
}

#[derive(Debug, Deserialize)]
struct GoldenMessage {
    #[serde(default)]
    body: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct GoldenLabels {
    #[serde(default)]
    level1: Option<String>,
    #[serde(default)]
    intent: Option<String>,
}

/// One labelled conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct GoldenExample {
    pub text: String,
    pub level1: String,
    pub intent: String,
}

/// Parse JSONL golden rows. Rows missing either label are skipped.
pub fn parse_golden(raw: &str) -> Result<Vec<GoldenExample>, EvalError> {
    let mut examples = Vec::new();
    for (index, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let row: GoldenRow = serde_json::from_str(line).map_err(|source| EvalError::Parse {
            line: index + 1,
            source,
        })?;

        let (Some(level1), Some(intent)) = (
            row.labels.level1.filter(|l| !l.is_empty()),
            row.labels.intent.filter(|i| !i.is_empty()),
        ) else {
            continue;
        };

        let subject = row.conversation.subject.unwrap_or_default();
        let bodies: Vec<String> = row
            .conversation
            .messages
            .into_iter()
            .map(|m| m.body.unwrap_or_default())
            .collect();
        let text = format!("{subject}\n\n{}", bodies.join("\n")).trim().to_string();

        examples.push(GoldenExample {
            text,
            level1,
            intent,
        });
    }
    Ok(examples)
}

pub fn load_golden(path: impl AsRef<Path>) -> Result<Vec<GoldenExample>, EvalError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| EvalError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse_golden(&raw)
}

/// Count of (expected, predicted) intent pairs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfusionEntry {
    pub expected: String,
    pub predicted: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvalReport {
    pub total: usize,
    pub level1_accuracy: f64,
    pub intent_accuracy: f64,
    /// Sorted by count descending, then by pair.
    pub confusion: Vec<ConfusionEntry>,
}

impl EvalReport {
    /// Metrics below `threshold`, by name.
    pub fn failing_metrics(&self, threshold: f64) -> Vec<(&'static str, f64)> {
        [
            ("level1_accuracy", self.level1_accuracy),
            ("intent_accuracy", self.intent_accuracy),
        ]
        .into_iter()
        .filter(|(_, value)| *value < threshold)
        .collect()
    }
}

/// Run the golden set through embedding, taxonomy matching and intent
/// prediction.
pub async fn evaluate(
    examples: &[GoldenExample],
    embedder: &dyn Embedder,
    taxonomy: &Taxonomy,
    intents: &dyn IntentClassifier,
) -> Result<EvalReport, EvalError> {
    let texts: Vec<String> = examples.iter().map(|e| e.text.clone()).collect();
    let embeddings = embedder.embed(&texts).await?;
    if embeddings.len() != examples.len() {
        return Err(EmbeddingError::InvalidResponse {
            reason: format!(
                "received {} embeddings for {} examples",
                embeddings.len(),
                examples.len()
            ),
        }
        .into());
    }

    let mut level1_correct = 0usize;
    let mut intent_correct = 0usize;
    let mut confusion: HashMap<(String, String), usize> = HashMap::new();

    for (example, embedding) in examples.iter().zip(&embeddings) {
        let matches = taxonomy
            .match_embedding(embedding, 1)
            .map_err(EmbeddingError::from)?;
        let label = matches
            .first()
            .map(|m| m.label.as_str())
            .unwrap_or(FALLBACK_LABEL);
        if top_level(label) == example.level1 {
            level1_correct += 1;
        }

        let predicted = intents.predict(&example.text).await?.intent;
        if predicted == example.intent {
            intent_correct += 1;
        }
        *confusion
            .entry((example.intent.clone(), predicted))
            .or_default() += 1;
    }

    let total = examples.len();
    let ratio = |n: usize| if total == 0 { 0.0 } else { n as f64 / total as f64 };

    let mut confusion: Vec<ConfusionEntry> = confusion
        .into_iter()
        .map(|((expected, predicted), count)| ConfusionEntry {
            expected,
            predicted,
            count,
        })
        .collect();
    confusion.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| a.expected.cmp(&b.expected))
            .then_with(|| a.predicted.cmp(&b.predicted))
    });

    let report = EvalReport {
        total,
        level1_accuracy: ratio(level1_correct),
        intent_accuracy: ratio(intent_correct),
        confusion,
    };
    info!(
        total = report.total,
        level1_accuracy = report.level1_accuracy,
        intent_accuracy = report.intent_accuracy,
        "Golden set evaluated"
    );
    Ok(report)
}
