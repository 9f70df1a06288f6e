//! Versioned taxonomy with centroid-based nearest-label matching.
//!
//! The taxonomy JSON is validated entirely at load time. Downstream code
//! only ever sees a well-formed [`Taxonomy`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::info;

use crate::error::TaxonomyError;
use crate::pipeline::types::MatchResult;

/// Number of matches returned when callers don't ask for a specific K.
pub const DEFAULT_TOP_K: usize = 3;

/// Separator between hierarchy levels in a label ("Billing > Refund").
pub const LEVEL_SEPARATOR: &str = " > ";

// ── On-disk shape ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TaxonomyFile {
    #[serde(default = "unknown_version")]
    version: String,
    #[serde(default)]
    labels: TaxonomyLabels,
    centroids_info: CentroidsInfo,
}

#[derive(Debug, Default, Deserialize)]
struct TaxonomyLabels {
    #[serde(default)]
    level1: Vec<String>,
    // Carried for completeness of the file format; matching is flat.
    #[serde(default)]
    #[allow(dead_code)]
    level2: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct CentroidsInfo {
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    file: Option<PathBuf>,
    #[serde(default)]
    vectors: Option<Vec<Vec<f32>>>,
}

fn unknown_version() -> String {
    "unknown".to_string()
}

// ── Taxonomy ────────────────────────────────────────────────────────

/// A label hierarchy string with its centroid vector.
#[derive(Debug, Clone, PartialEq)]
pub struct TaxonomyEntry {
    pub label: String,
    pub centroid: Vec<f32>,
    norm: f32,
}

impl TaxonomyEntry {
    pub fn new(label: impl Into<String>, centroid: Vec<f32>) -> Self {
        let norm = l2_norm(&centroid);
        Self {
            label: label.into(),
            centroid,
            norm,
        }
    }

    /// First hierarchy level of the label.
    pub fn top_level(&self) -> &str {
        top_level(&self.label)
    }
}

/// Ordered, versioned collection of taxonomy entries sharing one dimension.
#[derive(Debug, Clone)]
pub struct Taxonomy {
    version: String,
    level1: Vec<String>,
    entries: Vec<TaxonomyEntry>,
    dimension: usize,
}

impl Taxonomy {
    /// Load a taxonomy JSON file. Centroid files resolve relative to it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TaxonomyError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| TaxonomyError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let taxonomy = Self::from_json(&raw, base_dir)?;
        info!(
            path = %path.display(),
            version = %taxonomy.version,
            labels = taxonomy.len(),
            dimension = taxonomy.dimension,
            placeholder = taxonomy.is_placeholder(),
            "Taxonomy loaded"
        );
        Ok(taxonomy)
    }

    /// Parse taxonomy JSON. `base_dir` resolves a relative centroid `file`.
    pub fn from_json(raw: &str, base_dir: &Path) -> Result<Self, TaxonomyError> {
        let file: TaxonomyFile = serde_json::from_str(raw)?;
        let CentroidsInfo {
            labels,
            file: centroid_file,
            vectors,
        } = file.centroids_info;

        let vectors = match (vectors, centroid_file) {
            (Some(vectors), None) => vectors,
            (None, Some(rel)) => {
                let path = base_dir.join(rel);
                let raw = std::fs::read_to_string(&path).map_err(|source| TaxonomyError::Read {
                    path: path.display().to_string(),
                    source,
                })?;
                serde_json::from_str(&raw)?
            }
            _ => return Err(TaxonomyError::CentroidSource),
        };

        if labels.len() != vectors.len() {
            return Err(TaxonomyError::CountMismatch {
                labels: labels.len(),
                vectors: vectors.len(),
            });
        }

        let entries = labels
            .into_iter()
            .zip(vectors)
            .map(|(label, centroid)| TaxonomyEntry::new(label, centroid))
            .collect();
        Self::from_entries(file.version, file.labels.level1, entries)
    }

    /// Build from already-constructed entries.
    ///
    /// An empty `level1` derives the top-level groups from the entry labels.
    pub fn from_entries(
        version: impl Into<String>,
        level1: Vec<String>,
        entries: Vec<TaxonomyEntry>,
    ) -> Result<Self, TaxonomyError> {
        let Some(first) = entries.first() else {
            return Err(TaxonomyError::Empty);
        };
        let dimension = first.centroid.len();

        for (index, entry) in entries.iter().enumerate() {
            if entry.centroid.len() != dimension || dimension == 0 {
                return Err(TaxonomyError::DimensionMismatch {
                    index,
                    expected: dimension,
                    found: entry.centroid.len(),
                });
            }
            if entry.centroid.iter().any(|v| !v.is_finite()) {
                return Err(TaxonomyError::NonFinite { index });
            }
        }

        let level1 = if level1.is_empty() {
            let mut groups: Vec<String> = Vec::new();
            for entry in &entries {
                let group = entry.top_level();
                if !groups.iter().any(|g| g == group) {
                    groups.push(group.to_string());
                }
            }
            groups
        } else {
            level1
        };

        Ok(Self {
            version: version.into(),
            level1,
            entries,
            dimension,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[TaxonomyEntry] {
        &self.entries
    }

    /// True when there is at most one top-level group (bootstrap taxonomy).
    pub fn is_placeholder(&self) -> bool {
        self.level1.len() <= 1
    }

    /// Nearest `top_k` labels by cosine similarity, best first.
    ///
    /// Ties keep taxonomy order. Returns fewer than `top_k` results when the
    /// taxonomy is smaller.
    pub fn match_embedding(
        &self,
        embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<MatchResult>, TaxonomyError> {
        if embedding.len() != self.dimension {
            return Err(TaxonomyError::QueryDimension {
                expected: self.dimension,
                found: embedding.len(),
            });
        }

        let query_norm = l2_norm(embedding);
        let mut scored: Vec<MatchResult> = self
            .entries
            .iter()
            .map(|entry| MatchResult {
                label: entry.label.clone(),
                score: cosine(embedding, query_norm, &entry.centroid, entry.norm),
            })
            .collect();

        // `sort_by` is stable, so equal scores stay in insertion order.
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(top_k);
        Ok(scored)
    }
}

/// First hierarchy level of a label.
pub fn top_level(label: &str) -> &str {
    label.split(LEVEL_SEPARATOR).next().unwrap_or(label).trim()
}

fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// `dot(a, b) / (|a| |b|)`; zero-length vectors score 0.0.
fn cosine(a: &[f32], a_norm: f32, b: &[f32], b_norm: f32) -> f32 {
    if a_norm <= f32::EPSILON || b_norm <= f32::EPSILON {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let score = dot / (a_norm * b_norm);
    if score.is_finite() {
        score.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}
