//! Configuration types, built from environment variables.
//!
//! Every `from_env()` has a `from_lookup()` twin taking a closure so tests
//! never touch the process environment.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Hard upper bound for `MAX_PAYLOAD_BYTES`.
const MAX_PAYLOAD_LIMIT: usize = 10_000_000;

/// Spam keywords used when `SPAM_KEYWORDS` is unset.
pub const DEFAULT_SPAM_KEYWORDS: &[&str] = &["unsubscribe", "free trial", "viagra", "buy now"];

/// Baseline key compared against the drift window mean.
pub const MEAN_SIMILARITY: &str = "mean_similarity";

// ── Preprocessing ───────────────────────────────────────────────────

/// Filters applied by the preprocessor.
#[derive(Debug, Clone)]
pub struct PreprocessConfig {
    /// Language codes allowed through (ISO 639-1 where one exists).
    pub allowed_languages: Vec<String>,
    /// Lowercase substrings that mark a conversation as spam.
    pub spam_keywords: Vec<String>,
}

impl PreprocessConfig {
    pub fn new(allowed_languages: &[&str]) -> Self {
        Self {
            allowed_languages: allowed_languages.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            allowed_languages: vec!["en".to_string(), "es".to_string()],
            spam_keywords: DEFAULT_SPAM_KEYWORDS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

// ── Drift ───────────────────────────────────────────────────────────

/// Drift monitor window and startup baseline.
#[derive(Debug, Clone)]
pub struct DriftConfig {
    pub window_size: usize,
    pub baseline: HashMap<String, f64>,
}

impl DriftConfig {
    pub fn with_baseline_mean(window_size: usize, mean_similarity: f64) -> Self {
        Self {
            window_size,
            baseline: HashMap::from([(MEAN_SIMILARITY.to_string(), mean_similarity)]),
        }
    }
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self::with_baseline_mean(1000, 0.8)
    }
}

// ── Embedding endpoint ──────────────────────────────────────────────

/// OpenAI-compatible embedding endpoint settings.
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub api_key: SecretString,
    pub model: String,
    pub timeout: Duration,
}

impl EmbeddingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = required(&lookup, "EMBEDDING_API_KEY")?;
        Ok(Self {
            base_url: lookup("EMBEDDING_API_URL")
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key: SecretString::from(api_key),
            model: lookup("EMBEDDING_MODEL")
                .unwrap_or_else(|| "text-embedding-3-small".to_string()),
            timeout: Duration::from_secs(parse_or(&lookup, "EMBEDDING_TIMEOUT_SECS", 30u64)?),
        })
    }
}

// ── Pipeline & worker loop ──────────────────────────────────────────

/// Settings the orchestrator needs for a single message.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub input_container: String,
    pub output_container: String,
    pub model_version: String,
    pub max_payload_bytes: usize,
    /// Dequeue count above which a failing message is dead-lettered.
    pub poison_threshold: u32,
    pub top_k: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            input_container: "incoming".to_string(),
            output_container: "classified".to_string(),
            model_version: "v1.0.0".to_string(),
            max_payload_bytes: 512_000,
            poison_threshold: 5,
            top_k: 3,
        }
    }
}

/// Settings for the polling loop.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub batch_size: usize,
    pub visibility_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            batch_size: 1,
            visibility_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Complete worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub storage_root: PathBuf,
    pub queue_name: String,
    pub poison_queue_name: String,
    pub taxonomy_path: PathBuf,
    pub worker_count: usize,
    pub pipeline: PipelineSettings,
    pub polling: LoopSettings,
    pub preprocess: PreprocessConfig,
    pub drift: DriftConfig,
}

impl WorkerConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let max_payload_bytes = parse_or(&lookup, "MAX_PAYLOAD_BYTES", 512_000usize)?;
        if max_payload_bytes == 0 || max_payload_bytes > MAX_PAYLOAD_LIMIT {
            return Err(ConfigError::InvalidValue {
                key: "MAX_PAYLOAD_BYTES".into(),
                message: format!("must be between 1 and {MAX_PAYLOAD_LIMIT}"),
            });
        }

        let batch_size = parse_or(&lookup, "RECEIVE_BATCH_SIZE", 1usize)?;
        let worker_count = parse_or(&lookup, "WORKER_COUNT", 1usize)?;
        let window_size = parse_or(&lookup, "DRIFT_WINDOW_SIZE", 1000usize)?;
        for (key, value) in [
            ("RECEIVE_BATCH_SIZE", batch_size),
            ("WORKER_COUNT", worker_count),
            ("DRIFT_WINDOW_SIZE", window_size),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.into(),
                    message: "must be at least 1".into(),
                });
            }
        }

        let allowed_languages = match lookup("ALLOWED_LANGUAGES") {
            Some(raw) => parse_language_list(&raw),
            None => PreprocessConfig::default().allowed_languages,
        };
        if allowed_languages.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "ALLOWED_LANGUAGES".into(),
                message: "no languages listed".into(),
            });
        }

        let spam_keywords = match lookup("SPAM_KEYWORDS") {
            Some(raw) => split_csv(&raw)
                .into_iter()
                .map(|k| k.to_lowercase())
                .collect(),
            None => PreprocessConfig::default().spam_keywords,
        };

        Ok(Self {
            storage_root: PathBuf::from(
                lookup("STORAGE_ROOT").unwrap_or_else(|| "./data".to_string()),
            ),
            queue_name: required(&lookup, "QUEUE_NAME")?,
            poison_queue_name: required(&lookup, "POISON_QUEUE_NAME")?,
            taxonomy_path: PathBuf::from(required(&lookup, "TAXONOMY_PATH")?),
            worker_count,
            pipeline: PipelineSettings {
                input_container: required(&lookup, "INPUT_CONTAINER")?,
                output_container: required(&lookup, "OUTPUT_CONTAINER")?,
                model_version: lookup("MODEL_VERSION").unwrap_or_else(|| "v1.0.0".to_string()),
                max_payload_bytes,
                poison_threshold: parse_or(&lookup, "POISON_THRESHOLD", 5u32)?,
                top_k: parse_or(&lookup, "TOP_K", 3usize)?,
            },
            polling: LoopSettings {
                batch_size,
                visibility_timeout: Duration::from_secs(parse_or(
                    &lookup,
                    "VISIBILITY_TIMEOUT_SECS",
                    300u64,
                )?),
                poll_interval: Duration::from_secs(parse_or(&lookup, "POLL_INTERVAL_SECS", 5u64)?),
            },
            preprocess: PreprocessConfig {
                allowed_languages,
                spam_keywords,
            },
            drift: DriftConfig::with_baseline_mean(
                window_size,
                parse_or(&lookup, "DRIFT_BASELINE_MEAN_SIMILARITY", 0.8f64)?,
            ),
        })
    }
}

fn required<F>(lookup: &F, key: &str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
    }
}

/// Accept a JSON array (`["en","es"]`) or a comma-separated list.
fn parse_language_list(raw: &str) -> Vec<String> {
    if let Ok(list) = serde_json::from_str::<Vec<String>>(raw) {
        return list
            .into_iter()
            .map(|l| l.trim().to_lowercase())
            .filter(|l| !l.is_empty())
            .collect();
    }
    split_csv(raw).into_iter().map(|l| l.to_lowercase()).collect()
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const REQUIRED: &[(&str, &str)] = &[
        ("INPUT_CONTAINER", "incoming"),
        ("OUTPUT_CONTAINER", "classified"),
        ("QUEUE_NAME", "emails"),
        ("POISON_QUEUE_NAME", "emails-poison"),
        ("TAXONOMY_PATH", "/etc/taxonomy.json"),
    ];

    #[test]
    fn defaults_applied() {
        let cfg = WorkerConfig::from_lookup(env(REQUIRED)).unwrap();
        assert_eq!(cfg.pipeline.model_version, "v1.0.0");
        assert_eq!(cfg.pipeline.max_payload_bytes, 512_000);
        assert_eq!(cfg.pipeline.poison_threshold, 5);
        assert_eq!(cfg.preprocess.allowed_languages, vec!["en", "es"]);
        assert_eq!(cfg.polling.visibility_timeout, Duration::from_secs(300));
        assert_eq!(cfg.drift.window_size, 1000);
        assert_eq!(cfg.drift.baseline[MEAN_SIMILARITY], 0.8);
        assert_eq!(cfg.storage_root, PathBuf::from("./data"));
    }

    #[test]
    fn missing_required_var() {
        let err = WorkerConfig::from_lookup(env(&REQUIRED[1..])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "INPUT_CONTAINER"));
    }

    #[test]
    fn allowed_languages_json_or_csv() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("ALLOWED_LANGUAGES", r#"["EN", "fr"]"#));
        let cfg = WorkerConfig::from_lookup(env(&pairs)).unwrap();
        assert_eq!(cfg.preprocess.allowed_languages, vec!["en", "fr"]);

        let mut pairs = REQUIRED.to_vec();
        pairs.push(("ALLOWED_LANGUAGES", "en, de ,"));
        let cfg = WorkerConfig::from_lookup(env(&pairs)).unwrap();
        assert_eq!(cfg.preprocess.allowed_languages, vec!["en", "de"]);
    }

    #[test]
    fn payload_limit_validated() {
        for bad in ["0", "20000000", "lots"] {
            let mut pairs = REQUIRED.to_vec();
            pairs.push(("MAX_PAYLOAD_BYTES", bad));
            let err = WorkerConfig::from_lookup(env(&pairs)).unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "MAX_PAYLOAD_BYTES"),
                "value {bad} should be rejected"
            );
        }
    }

    #[test]
    fn zero_batch_size_rejected() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("RECEIVE_BATCH_SIZE", "0"));
        assert!(WorkerConfig::from_lookup(env(&pairs)).is_err());
    }

    #[test]
    fn spam_keywords_override_lowercased() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("SPAM_KEYWORDS", "Lottery, WIN BIG"));
        let cfg = WorkerConfig::from_lookup(env(&pairs)).unwrap();
        assert_eq!(cfg.preprocess.spam_keywords, vec!["lottery", "win big"]);
    }

    #[test]
    fn embedding_config_requires_key() {
        assert!(matches!(
            EmbeddingConfig::from_lookup(env(&[])),
            Err(ConfigError::MissingEnvVar(_))
        ));
        let cfg = EmbeddingConfig::from_lookup(env(&[("EMBEDDING_API_KEY", "sk-test")])).unwrap();
        assert_eq!(cfg.model, "text-embedding-3-small");
        assert_eq!(cfg.timeout, Duration::from_secs(30));
    }
}
