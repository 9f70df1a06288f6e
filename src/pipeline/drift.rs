//! Rolling-window monitor over top-1 match scores.
//!
//! Advisory only: alerts are surfaced to the caller and never change how a
//! message is handled.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::{DriftConfig, MEAN_SIMILARITY};

/// Observations required before any alert can fire.
pub const MIN_OBSERVATIONS: usize = 100;

/// Fraction of the baseline mean below which the window counts as drifted.
const MEAN_DROP_FACTOR: f64 = 0.9;

/// Scores below this count as low-confidence matches.
const LOW_CONFIDENCE_SCORE: f64 = 0.7;

/// Share of low-confidence scores that triggers a spike alert.
const LOW_CONFIDENCE_RATIO: f64 = 0.25;

/// Monitor shared by all workers in a process.
pub type SharedDriftMonitor = Arc<Mutex<DriftMonitor>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftAlert {
    MeanSimilarityDrop,
    LowConfidenceSpike,
}

impl DriftAlert {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MeanSimilarityDrop => "MEAN_SIMILARITY_DROP",
            Self::LowConfidenceSpike => "LOW_CONFIDENCE_SPIKE",
        }
    }
}

impl fmt::Display for DriftAlert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of the window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftStats {
    pub count: usize,
    pub mean: f64,
    pub low_ratio: f64,
}

#[derive(Debug)]
pub struct DriftMonitor {
    window: VecDeque<f64>,
    capacity: usize,
    baseline: HashMap<String, f64>,
}

impl DriftMonitor {
    pub fn new(config: DriftConfig) -> Self {
        let capacity = config.window_size.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            baseline: config.baseline,
        }
    }

    pub fn shared(config: DriftConfig) -> SharedDriftMonitor {
        Arc::new(Mutex::new(Self::new(config)))
    }

    /// Append a score, evicting the oldest once the window is full.
    pub fn record(&mut self, score: f32) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(f64::from(score));
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn snapshot(&self) -> DriftStats {
        let count = self.window.len();
        if count == 0 {
            return DriftStats {
                count,
                mean: 0.0,
                low_ratio: 0.0,
            };
        }
        let mean = self.window.iter().sum::<f64>() / count as f64;
        let low = self
            .window
            .iter()
            .filter(|s| **s < LOW_CONFIDENCE_SCORE)
            .count();
        DriftStats {
            count,
            mean,
            low_ratio: low as f64 / count as f64,
        }
    }

    pub fn check(&self) -> Option<DriftAlert> {
        if self.window.len() < MIN_OBSERVATIONS {
            return None;
        }
        let stats = self.snapshot();
        let baseline_mean = self.baseline.get(MEAN_SIMILARITY).copied().unwrap_or(0.0);

        if stats.mean < baseline_mean * MEAN_DROP_FACTOR {
            Some(DriftAlert::MeanSimilarityDrop)
        } else if stats.low_ratio > LOW_CONFIDENCE_RATIO {
            Some(DriftAlert::LowConfidenceSpike)
        } else {
            None
        }
    }
}
