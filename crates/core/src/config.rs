//! TOML-based configuration for treesync.
//!
//! Every field has a serde default, so an empty document is a valid
//! configuration. A few knobs can be overridden from the environment via
//! [`SyncConfig::apply_env_overrides`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;

/// Environment variable overriding `resolver.max_commit_retries`.
pub const ENV_MAX_RETRIES: &str = "TREESYNC_MAX_RETRIES";
/// Environment variable overriding `sequencer.timeout_ms`.
pub const ENV_SEQUENCER_TIMEOUT_MS: &str = "TREESYNC_SEQUENCER_TIMEOUT_MS";
/// Environment variable overriding `logging.level`.
pub const ENV_LOG_LEVEL: &str = "TREESYNC_LOG_LEVEL";

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Conflict resolution and commit retry settings.
    #[serde(default)]
    pub resolver: ResolverConfig,

    /// Sequencer client settings.
    #[serde(default)]
    pub sequencer: SequencerConfig,

    /// Log output settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// `[resolver]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Rejected commits tolerated per resolution cycle before giving up.
    #[serde(default = "default_max_commit_retries")]
    pub max_commit_retries: u32,

    /// Pause between a rejected commit and the refetch, in milliseconds.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_max_commit_retries() -> u32 {
    10
}
fn default_retry_backoff_ms() -> u64 {
    10
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_commit_retries: default_max_commit_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl ResolverConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// `[sequencer]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencerConfig {
    /// Upper bound on any single sequencer call, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl SequencerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// `[logging]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default log level / filter directive.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Let `RUST_LOG` take precedence over `level`.
    #[serde(default = "default_true")]
    pub env_override: bool,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            env_override: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & validation
// ---------------------------------------------------------------------------

impl SyncConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: SyncConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Validate required invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resolver.max_commit_retries == 0 {
            return Err(ConfigError::InvalidValue {
                field: "resolver.max_commit_retries".into(),
                detail: "retry cap must be > 0".into(),
            });
        }
        if self.sequencer.timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sequencer.timeout_ms".into(),
                detail: "sequencer timeout must be > 0".into(),
            });
        }
        if !LOG_LEVELS.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "logging.level".into(),
                detail: format!(
                    "unknown level '{}', expected one of {}",
                    self.logging.level,
                    LOG_LEVELS.join(", ")
                ),
            });
        }
        Ok(())
    }

    /// Load, apply environment overrides, and validate.
    pub fn load_and_validate<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `TREESYNC_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary variable lookup. Values that do
    /// not parse are logged and ignored.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = resolve_override(&lookup, ENV_MAX_RETRIES, "resolver.max_commit_retries")
        {
            match val.parse() {
                Ok(n) => self.resolver.max_commit_retries = n,
                Err(_) => warn!(env_name = ENV_MAX_RETRIES, value = %val, "ignoring non-numeric override"),
            }
        }
        if let Some(val) =
            resolve_override(&lookup, ENV_SEQUENCER_TIMEOUT_MS, "sequencer.timeout_ms")
        {
            match val.parse() {
                Ok(n) => self.sequencer.timeout_ms = n,
                Err(_) => warn!(env_name = ENV_SEQUENCER_TIMEOUT_MS, value = %val, "ignoring non-numeric override"),
            }
        }
        if let Some(val) = resolve_override(&lookup, ENV_LOG_LEVEL, "logging.level") {
            self.logging.level = val;
        }
    }
}

/// Look up an override, treating an empty value as unset.
fn resolve_override<F>(lookup: &F, env_name: &str, field: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(env_name) {
        Some(val) if !val.is_empty() => {
            debug!(field, env_name, "applying env override");
            Some(val)
        }
        Some(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        None => None,
    }
}
