// src/config/mod.rs
pub mod budget;

pub use budget::BudgetConfig;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::source::SourceKind;

pub const ENV_CONFIG_PATH: &str = "FEEDWATCH_CONFIG_PATH";
pub const DEFAULT_TOML_PATH: &str = "config/feedwatch.toml";
pub const DEFAULT_JSON_PATH: &str = "config/feedwatch.json";

fn default_poll_interval_ms() -> u64 {
    60_000
}
fn default_backfill_size() -> usize {
    10
}
fn default_batch_size_cap() -> usize {
    25
}
fn default_max_query_len() -> usize {
    512
}
fn default_scheduler_max_wait_ms() -> u64 {
    120_000
}
fn default_request_timeout_ms() -> u64 {
    15_000
}
fn default_state_path() -> PathBuf {
    PathBuf::from("state/feedwatch.json")
}
fn default_query_prefix() -> String {
    "from:".to_string()
}

/// Where a source kind is fetched from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Rate-limit key; defaults to the kind's standard endpoint.
    #[serde(default)]
    pub endpoint: Option<String>,
    pub url: String,
    /// Prepended to each external id when building the OR'd query.
    #[serde(default = "default_query_prefix")]
    pub query_prefix: String,
    /// Name of the env var holding the bearer token (never the token itself).
    #[serde(default)]
    pub bearer_token_env: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Item count fetched for a source that has never been polled.
    #[serde(default = "default_backfill_size")]
    pub backfill_size: usize,
    #[serde(default = "default_batch_size_cap")]
    pub batch_size_cap: usize,
    #[serde(default = "default_max_query_len")]
    pub max_query_len: usize,
    #[serde(default = "default_scheduler_max_wait_ms")]
    pub scheduler_max_wait_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    #[serde(default)]
    pub webhook_auth_token: Option<String>,
    /// Unset keeps the dedup ledger forever.
    #[serde(default)]
    pub ledger_retention_days: Option<u32>,
    #[serde(default)]
    pub default_budget: BudgetConfig,
    #[serde(default)]
    pub endpoints: BTreeMap<String, BudgetConfig>,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            backfill_size: default_backfill_size(),
            batch_size_cap: default_batch_size_cap(),
            max_query_len: default_max_query_len(),
            scheduler_max_wait_ms: default_scheduler_max_wait_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            state_path: default_state_path(),
            webhook_auth_token: None,
            ledger_retention_days: None,
            default_budget: BudgetConfig::default(),
            endpoints: BTreeMap::new(),
            providers: BTreeMap::new(),
        }
    }
}

impl AppConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn scheduler_max_wait(&self) -> Duration {
        Duration::from_millis(self.scheduler_max_wait_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn ledger_retention(&self) -> Option<chrono::Duration> {
        self.ledger_retention_days
            .map(|d| chrono::Duration::days(i64::from(d)))
    }

    /// Provider configs keyed by a parsed kind; unknown kinds are a config error.
    pub fn providers_by_kind(&self) -> Result<Vec<(SourceKind, ProviderConfig)>> {
        self.providers
            .iter()
            .map(|(k, v)| {
                SourceKind::parse(k)
                    .map(|kind| (kind, v.clone()))
                    .map_err(|e| anyhow!(e))
            })
            .collect()
    }

    fn sanitized(mut self) -> Self {
        if self.poll_interval_ms == 0 {
            self.poll_interval_ms = default_poll_interval_ms();
        }
        self.backfill_size = self.backfill_size.max(1);
        self.batch_size_cap = self.batch_size_cap.max(1);
        if self.max_query_len == 0 {
            self.max_query_len = default_max_query_len();
        }
        self.default_budget = self.default_budget.sanitized();
        for b in self.endpoints.values_mut() {
            *b = b.sanitized();
        }
        self
    }

    fn apply_env_overrides(mut self) -> Self {
        if let Some(v) = env_parse::<u64>("POLL_INTERVAL_MS") {
            self.poll_interval_ms = v;
        }
        if let Some(v) = env_parse::<usize>("BACKFILL_SIZE") {
            self.backfill_size = v;
        }
        if let Ok(v) = std::env::var("WEBHOOK_AUTH_TOKEN") {
            let v = v.trim().to_string();
            if !v.is_empty() {
                self.webhook_auth_token = Some(v);
            }
        }
        self
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Load config from an explicit path. Supports TOML or JSON formats.
pub fn load_from(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading config from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let cfg = parse_config(&content, ext.as_str())
        .with_context(|| format!("parsing config {}", path.display()))?;
    Ok(cfg.apply_env_overrides().sanitized())
}

/// Load config using env var + fallbacks:
/// 1) $FEEDWATCH_CONFIG_PATH
/// 2) config/feedwatch.toml
/// 3) config/feedwatch.json
/// 4) built-in defaults
pub fn load_default() -> Result<AppConfig> {
    if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return load_from(&pb);
        } else {
            return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
        }
    }
    let toml_p = PathBuf::from(DEFAULT_TOML_PATH);
    if toml_p.exists() {
        return load_from(&toml_p);
    }
    let json_p = PathBuf::from(DEFAULT_JSON_PATH);
    if json_p.exists() {
        return load_from(&json_p);
    }
    Ok(AppConfig::default().apply_env_overrides().sanitized())
}

fn parse_config(s: &str, hint_ext: &str) -> Result<AppConfig> {
    let looks_json = s.trim_start().starts_with('{');
    if hint_ext == "json" || (hint_ext != "toml" && looks_json) {
        return serde_json::from_str(s).context("invalid JSON config");
    }
    toml::from_str(s).context("invalid TOML config")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_with_endpoint_table() {
        let s = r#"
poll_interval_ms = 30000
backfill_size = 5

[default_budget]
requests_per_window = 100
window_size_minutes = 15
safety_margin = 0.8

[endpoints.search]
requests_per_window = 1
window_size_minutes = 1
safety_margin = 1.0

[providers.pattern_scan]
url = "https://api.example.com/search"
"#;
        let cfg = parse_config(s, "toml").unwrap().sanitized();
        assert_eq!(cfg.poll_interval_ms, 30_000);
        assert_eq!(cfg.backfill_size, 5);
        assert_eq!(cfg.default_budget.effective_cap(), 80);
        assert_eq!(cfg.endpoints["search"].effective_cap(), 1);
        let provs = cfg.providers_by_kind().unwrap();
        assert_eq!(provs[0].0, SourceKind::PatternScan);
        assert_eq!(provs[0].1.query_prefix, "from:");
    }

    #[test]
    fn json_defaults_fill_missing_fields() {
        let cfg = parse_config(r#"{"batch_size_cap": 0}"#, "json")
            .unwrap()
            .sanitized();
        assert_eq!(cfg.batch_size_cap, 1);
        assert_eq!(cfg.backfill_size, 10);
        assert_eq!(cfg.poll_interval(), Duration::from_secs(60));
        assert!(cfg.ledger_retention().is_none());
    }

    #[test]
    fn unknown_provider_kind_is_error() {
        let s = r#"
[providers.rss]
url = "https://x"
"#;
        let cfg = parse_config(s, "toml").unwrap();
        assert!(cfg.providers_by_kind().is_err());
    }
}
