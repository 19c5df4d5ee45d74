//! Proxy configuration
//!
//! Everything comes from environment variables with defaults; invalid
//! numeric values are fatal at startup. The server binary may override
//! `port` and `llama_url` from its command line.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::fmt::Display;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Backend base URL (llama.cpp server or compatible).
    pub llama_url: String,
    /// Number of concurrent inference slots the backend offers.
    pub n_slots: usize,
    /// Inbound listen port.
    pub port: u16,
    /// Directory for cache-entry metadata records.
    pub meta_dir: PathBuf,
    /// The backend's KV-file directory, enforced by the janitor.
    pub cache_dir: PathBuf,
    /// Minimum prompt length, in words, to engage caching.
    pub big_threshold_words: usize,
    /// Fingerprint block granularity, in words.
    pub words_per_block: usize,
    /// Similarity threshold in [0,1] for prefix reuse.
    pub lcp_threshold: f64,
    /// Per-request deadline in seconds.
    pub request_timeout_secs: u64,
    /// Age bound for the janitor; 0 disables the age pass.
    pub cache_max_age_hours: u64,
    /// Total-size bound for the janitor, in GB.
    pub cache_max_size_gb: f64,
    /// Janitor period in minutes.
    pub cache_cleanup_interval_minutes: u64,
    /// Save ids exempt from eviction.
    pub pinned_keys: HashSet<String>,
    /// Optional preamble file prepended to every prompt before fingerprinting.
    pub system_prompt_file: Option<PathBuf>,
    /// Optional fixed model id advertised by /v1/models instead of asking
    /// the backend.
    pub model_id: Option<String>,
}

fn default_llama_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            llama_url: default_llama_url(),
            n_slots: 4,
            port: 3080,
            meta_dir: PathBuf::from("./kvmeta"),
            cache_dir: PathBuf::from("./kvcache"),
            big_threshold_words: 1000,
            words_per_block: 16,
            lcp_threshold: 0.5,
            request_timeout_secs: 600,
            cache_max_age_hours: 168,
            cache_max_size_gb: 50.0,
            cache_cleanup_interval_minutes: 30,
            pinned_keys: HashSet::new(),
            system_prompt_file: None,
            model_id: None,
        }
    }
}

/// Parse an environment variable, falling back to `default` when unset.
fn var_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    <T as FromStr>::Err: Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("invalid {name}={raw}: {e}"))),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();

        let pinned_keys = match env::var("PINNED_KEYS") {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| Error::Config(format!("invalid PINNED_KEYS={raw}: {e}")))?,
            Err(_) => HashSet::new(),
        };

        let config = Self {
            llama_url: var_or("LLAMA_URL", defaults.llama_url)?,
            n_slots: var_or("N_SLOTS", defaults.n_slots)?,
            port: var_or("PORT", defaults.port)?,
            meta_dir: var_or("META_DIR", defaults.meta_dir)?,
            cache_dir: var_or("CACHE_DIR", defaults.cache_dir)?,
            big_threshold_words: var_or("BIG_THRESHOLD_WORDS", defaults.big_threshold_words)?,
            words_per_block: var_or("WORDS_PER_BLOCK", defaults.words_per_block)?,
            lcp_threshold: var_or("LCP_TH", defaults.lcp_threshold)?,
            request_timeout_secs: var_or("REQUEST_TIMEOUT", defaults.request_timeout_secs)?,
            cache_max_age_hours: var_or("CACHE_MAX_AGE_HOURS", defaults.cache_max_age_hours)?,
            cache_max_size_gb: var_or("CACHE_MAX_SIZE_GB", defaults.cache_max_size_gb)?,
            cache_cleanup_interval_minutes: var_or(
                "CACHE_CLEANUP_INTERVAL_MINUTES",
                defaults.cache_cleanup_interval_minutes,
            )?,
            pinned_keys,
            system_prompt_file: env::var("SYSTEM_PROMPT_FILE").ok().map(PathBuf::from),
            model_id: env::var("MODEL_ID").ok(),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.n_slots == 0 {
            return Err(Error::Config("N_SLOTS must be at least 1".to_string()));
        }
        if self.words_per_block == 0 {
            return Err(Error::Config(
                "WORDS_PER_BLOCK must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.lcp_threshold) {
            return Err(Error::Config(format!(
                "LCP_TH must be between 0.0 and 1.0, got {}",
                self.lcp_threshold
            )));
        }
        Ok(())
    }

    /// Ensure the metadata directory exists.
    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.meta_dir)?;
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cache_cleanup_interval_minutes * 60)
    }

    /// Read the optional system preamble file.
    pub fn system_preamble(&self) -> Result<Option<String>> {
        match &self.system_prompt_file {
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!(
                        "cannot read SYSTEM_PROMPT_FILE '{}': {e}",
                        path.display()
                    ))
                })?;
                Ok(Some(text))
            }
            None => Ok(None),
        }
    }
}
