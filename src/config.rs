use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use url::Url;

use crate::error::DigestError;

pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Lowest score (0-10) a paper needs to make it into the digest.
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_max_papers")]
    pub max_papers: usize,
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default)]
    pub openai: OpenAiConfig,
    pub arxiv: ArxivConfig,
    #[serde(default)]
    pub zotero: ZoteroConfig,
    pub interests: InterestsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    #[serde(default)]
    pub from_email: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub to_email: String,
    #[serde(default = "default_smtp_host")]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    /// Send a short notice when nothing cleared the threshold.
    #[serde(default = "default_true")]
    pub send_when_empty: bool,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            from_email: String::new(),
            password: String::new(),
            to_email: String::new(),
            smtp_host: default_smtp_host(),
            smtp_port: default_smtp_port(),
            send_when_empty: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    /// Hard limit for the whole scoring stage; anything still in flight is dropped.
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_model(),
            base_url: default_base_url(),
            max_workers: default_max_workers(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            requests_per_minute: default_requests_per_minute(),
            run_timeout_secs: default_run_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArxivConfig {
    pub categories: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default = "default_max_results")]
    pub max_results: u32,
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
    #[serde(default = "default_arxiv_api_url")]
    pub api_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZoteroConfig {
    pub library_file: Option<PathBuf>,
    #[serde(default = "default_detailed_papers")]
    pub detailed_papers: usize,
}

impl Default for ZoteroConfig {
    fn default() -> Self {
        Self {
            library_file: None,
            detailed_papers: default_detailed_papers(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InterestsConfig {
    #[serde(default)]
    pub description: String,
}

fn default_threshold() -> f64 { 7.0 }
fn default_max_papers() -> usize { 20 }
fn default_smtp_host() -> String { "smtp.gmail.com".to_string() }
fn default_smtp_port() -> u16 { 587 }
fn default_true() -> bool { true }
fn default_model() -> String { "gpt-4o-mini".to_string() }
fn default_base_url() -> String { "https://api.openai.com/v1".to_string() }
fn default_max_workers() -> usize { 10 }
fn default_max_retries() -> u32 { 2 }
fn default_retry_backoff_ms() -> u64 { 500 }
fn default_requests_per_minute() -> u32 { 500 }
fn default_run_timeout_secs() -> u64 { 600 }
fn default_max_results() -> u32 { 200 }
fn default_lookback_days() -> u32 { 1 }
fn default_arxiv_api_url() -> String { crate::layers::discovery::ARXIV_API.to_string() }
fn default_detailed_papers() -> usize { 30 }

impl Config {
    /// Resolves the config path: explicit argument, then `ARXIV_DIGEST_CONFIG`,
    /// then `config.toml` in the working directory.
    pub fn resolve_path(explicit: Option<PathBuf>) -> PathBuf {
        explicit
            .or_else(|| env::var("ARXIV_DIGEST_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    pub fn load(path: &Path) -> Result<Self, DigestError> {
        let text = fs::read_to_string(path)
            .map_err(|e| DigestError::config(format!("cannot read {}: {}", path.display(), e)))?;
        let mut cfg = Self::from_toml(&text)?;
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    pub fn from_toml(text: &str) -> Result<Self, DigestError> {
        toml::from_str(text).map_err(|e| DigestError::config(e.to_string()))
    }

    /// Secrets may live in the environment (or `.env`) instead of the file.
    fn apply_env_overrides(&mut self) {
        if let Ok(key) = env::var("OPENAI_API_KEY") {
            if !key.trim().is_empty() {
                self.openai.api_key = key;
            }
        }
        if let Ok(password) = env::var("EMAIL_PASSWORD") {
            if !password.trim().is_empty() {
                self.email.password = password;
            }
        }
    }

    /// Checks everything that can be checked without touching the network.
    /// Email settings are only required when the digest is actually mailed.
    pub fn validate(&self, require_delivery: bool) -> Result<(), DigestError> {
        if !(0.0..=10.0).contains(&self.threshold) {
            return Err(DigestError::config(format!(
                "threshold must be within 0..=10, got {}",
                self.threshold
            )));
        }
        if self.max_papers == 0 {
            return Err(DigestError::config("max_papers must be at least 1"));
        }
        if require_delivery {
            for (field, value) in [
                ("email.from_email", &self.email.from_email),
                ("email.password", &self.email.password),
                ("email.to_email", &self.email.to_email),
                ("email.smtp_host", &self.email.smtp_host),
            ] {
                if value.trim().is_empty() {
                    return Err(DigestError::config(format!("{} is required", field)));
                }
            }
        }
        if self.openai.api_key.trim().is_empty() {
            return Err(DigestError::config(
                "openai.api_key is required (or set OPENAI_API_KEY)",
            ));
        }
        Url::parse(&self.openai.base_url)
            .map_err(|e| DigestError::config(format!("openai.base_url: {}", e)))?;
        if self.openai.max_workers == 0 {
            return Err(DigestError::config("openai.max_workers must be at least 1"));
        }
        if self.openai.requests_per_minute == 0 {
            return Err(DigestError::config(
                "openai.requests_per_minute must be at least 1",
            ));
        }
        if self.arxiv.categories.iter().all(|c| c.trim().is_empty()) {
            return Err(DigestError::config("arxiv.categories must not be empty"));
        }
        if self.arxiv.lookback_days == 0 {
            return Err(DigestError::config("arxiv.lookback_days must be at least 1"));
        }
        if self.interests.description.trim().is_empty() {
            return Err(DigestError::config("interests.description is required"));
        }
        if let Some(path) = &self.zotero.library_file {
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_ascii_lowercase());
            if !matches!(ext.as_deref(), Some("bib") | Some("json")) {
                return Err(DigestError::config(format!(
                    "zotero.library_file {} must be a .bib or .json export",
                    path.display()
                )));
            }
        }
        Ok(())
    }

    /// Configured categories with blanks dropped, in configured order.
    pub fn categories(&self) -> Vec<String> {
        self.arxiv
            .categories
            .iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect()
    }
}
