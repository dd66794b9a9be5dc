use anyhow::{Context, Result};
use std::path::PathBuf;

/// Configuration for the tracking pipeline
#[derive(Debug, Clone)]
pub struct IngestionConfig {
    pub session_timeout_mins: i64,
    pub track_interval_secs: u64,
    pub use_ml_classifier: bool,
    pub ml_timeout_secs: u64,
    pub ml_cache_ttl_secs: u64,
    /// Read the text of tracked files into `content`
    pub read_file_content: bool,
    pub whitelist_apps: Vec<String>,
    pub whitelist_domains: Vec<String>,
    pub rules_path: Option<PathBuf>,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            session_timeout_mins: 30,
            track_interval_secs: 60,
            use_ml_classifier: false,
            ml_timeout_secs: 5,
            ml_cache_ttl_secs: 300,
            read_file_content: true,
            whitelist_apps: Vec::new(),
            whitelist_domains: Vec::new(),
            rules_path: None,
        }
    }
}

impl IngestionConfig {
    /// Create config from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let session_timeout_mins = parse_env("LEARNTRAIL_SESSION_TIMEOUT_MINS")?
            .unwrap_or(defaults.session_timeout_mins);
        let track_interval_secs = parse_env("LEARNTRAIL_TRACK_INTERVAL_SECS")?
            .unwrap_or(defaults.track_interval_secs);
        let ml_timeout_secs =
            parse_env("LEARNTRAIL_AI_TIMEOUT_SECS")?.unwrap_or(defaults.ml_timeout_secs);

        let use_ml_classifier = env_flag("LEARNTRAIL_USE_ML_CLASSIFIER").unwrap_or(false);
        let read_file_content =
            env_flag("LEARNTRAIL_READ_FILE_CONTENT").unwrap_or(defaults.read_file_content);

        Ok(Self {
            session_timeout_mins,
            track_interval_secs,
            use_ml_classifier,
            ml_timeout_secs,
            ml_cache_ttl_secs: defaults.ml_cache_ttl_secs,
            read_file_content,
            whitelist_apps: split_list(std::env::var("LEARNTRAIL_WHITELIST_APPS").ok()),
            whitelist_domains: split_list(std::env::var("LEARNTRAIL_WHITELIST_DOMAINS").ok()),
            rules_path: std::env::var("LEARNTRAIL_RULES_PATH").ok().map(PathBuf::from),
        })
    }
}

fn parse_env<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("invalid value for {}: {}", key, raw)),
        Err(_) => Ok(None),
    }
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key).ok().map(|v| {
        let v = v.trim().to_lowercase();
        v == "true" || v == "1"
    })
}

fn split_list(raw: Option<String>) -> Vec<String> {
    raw.map(|list| {
        list.split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect()
    })
    .unwrap_or_default()
}
