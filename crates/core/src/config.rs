//! TOML-based configuration for wikisync.
//!
//! The API token is never stored in the file. `remote.token_env` names an
//! environment variable that is resolved at runtime via
//! [`SyncConfig::resolve_env_vars`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;
use crate::remote::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Remote wiki connection settings.
    pub remote: RemoteConfig,

    /// Local mirror tree settings.
    pub local: LocalConfig,

    /// Sync behaviour settings.
    #[serde(default)]
    pub sync: SyncSection,

    /// Rate-limit retry settings.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

// ---------------------------------------------------------------------------
// Remote
// ---------------------------------------------------------------------------

/// Remote wiki connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Base URL of the wiki (e.g. `https://wiki.example.com`).
    pub base_url: String,

    /// Space key the synced tree lives in.
    pub space_key: String,

    /// Page id of the root of the synced tree. The root itself is not mirrored.
    pub root_page_id: String,

    /// Username for basic authentication.
    pub username: String,

    /// Environment variable holding the API token.
    pub token_env: String,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Resolved token (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub token: Option<String>,
}

fn default_timeout_secs() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// Local
// ---------------------------------------------------------------------------

/// Local mirror tree settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Directory that mirrors the remote tree.
    pub root: PathBuf,

    /// File extension of page files, without the dot.
    #[serde(default = "default_extension")]
    pub extension: String,

    /// Glob patterns (relative to `root`) that are never scanned.
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
}

fn default_extension() -> String {
    "md".into()
}

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

/// Sync behaviour settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSection {
    /// Path of the persisted page state. Relative paths resolve against
    /// `local.root`.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Size of the per-page worker pool.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Glob patterns matched against remote page titles; matches are never pulled.
    #[serde(default)]
    pub exclude_titles: Vec<String>,

    /// Changed-line ratio above which the patch planner replaces the whole
    /// document instead of emitting bounded operations.
    #[serde(default = "default_replace_threshold")]
    pub replace_threshold: f64,
}

fn default_state_file() -> PathBuf {
    PathBuf::from(".wikisync/state.json")
}
fn default_workers() -> usize {
    4
}
fn default_replace_threshold() -> f64 {
    0.5
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            workers: default_workers(),
            exclude_titles: Vec::new(),
            replace_threshold: default_replace_threshold(),
        }
    }
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Bounded exponential backoff for rate-limited remote calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound on any single delay.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Growth factor between consecutive delays.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryConfig {
    /// Build the policy value injected into the remote wrapper.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
            self.multiplier,
        )
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "warn".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl SyncConfig {
    /// Load a [`SyncConfig`] from a TOML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse a [`SyncConfig`] from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig =
            toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Resolve the API token from the environment.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        info!("resolving environment variable references");
        self.remote.token = resolve_optional_env(&self.remote.token_env, "remote.token_env");
        Ok(())
    }

    /// Like [`resolve_env_vars`](Self::resolve_env_vars) but a missing token is an error.
    pub fn require_token(&self) -> Result<&str, ConfigError> {
        self.remote
            .token
            .as_deref()
            .ok_or_else(|| ConfigError::EnvVarMissing {
                var: self.remote.token_env.clone(),
                field: "remote.token_env".into(),
            })
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.remote.base_url.is_empty() {
            return Err(invalid("remote.base_url", "base URL must not be empty"));
        }
        if !self.remote.base_url.starts_with("http://")
            && !self.remote.base_url.starts_with("https://")
        {
            return Err(invalid("remote.base_url", "base URL must be http(s)"));
        }
        if self.remote.space_key.is_empty() {
            return Err(invalid("remote.space_key", "space key must not be empty"));
        }
        if self.remote.root_page_id.is_empty() {
            return Err(invalid("remote.root_page_id", "root page id must not be empty"));
        }
        if self.remote.token_env.is_empty() {
            return Err(invalid("remote.token_env", "token variable name must not be empty"));
        }
        if self.local.root.as_os_str().is_empty() {
            return Err(invalid("local.root", "local root must not be empty"));
        }
        if self.local.extension.is_empty() || self.local.extension.contains('.') {
            return Err(invalid(
                "local.extension",
                "extension must be non-empty and given without a dot",
            ));
        }
        if self.sync.workers == 0 {
            return Err(invalid("sync.workers", "worker pool must have at least one slot"));
        }
        if !(self.sync.replace_threshold > 0.0 && self.sync.replace_threshold <= 1.0) {
            return Err(invalid(
                "sync.replace_threshold",
                "threshold must be in (0, 1]",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "at least one attempt is required"));
        }
        if self.retry.multiplier < 1.0 {
            return Err(invalid("retry.multiplier", "multiplier must be >= 1.0"));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(invalid(
                "retry.initial_backoff_ms",
                "initial backoff exceeds max_backoff_ms",
            ));
        }
        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// Absolute location of the state file.
    pub fn state_path(&self) -> PathBuf {
        if self.sync.state_file.is_absolute() {
            self.sync.state_file.clone()
        } else {
            self.local.root.join(&self.sync.state_file)
        }
    }

    /// Generate a default TOML config template string.
    pub fn default_template() -> &'static str {
        r#"# wikisync configuration

[remote]
base_url = "https://wiki.example.com"
space_key = "DOCS"
root_page_id = "123456"
username = "you@example.com"
token_env = "WIKISYNC_TOKEN"
# timeout_secs = 30

[local]
root = "./docs"
extension = "md"
# ignore_patterns = ["drafts/**"]

[sync]
# state_file = ".wikisync/state.json"   # relative to local.root
workers = 4
# exclude_titles = ["Archive*"]
replace_threshold = 0.5

[retry]
max_attempts = 5
initial_backoff_ms = 500
max_backoff_ms = 30000
multiplier = 2.0

[logging]
level = "warn"
"#
    }
}

fn invalid(field: &str, detail: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.into(),
        detail: detail.into(),
    }
}

/// Try to read an environment variable by name.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}
