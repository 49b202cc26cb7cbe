use serde::{Deserialize, Serialize};
use std::{env, fs, path::PathBuf, time::Duration};
use thiserror::Error;
use tracing::debug;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Errors raised while resolving configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file extension is neither yaml nor json.
    #[error("Unsupported configuration format for {path}. Use 'yaml' or 'json'.")]
    UnsupportedFormat { path: PathBuf },

    /// The file content did not parse.
    #[error("Failed to parse configuration file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    /// An environment override held an unusable value.
    #[error("Invalid {variable} value: {message}")]
    InvalidEnv { variable: String, message: String },

    /// The resolved configuration failed validation.
    #[error("Invalid configuration: {}", .problems.join("; "))]
    Invalid { problems: Vec<String> },
}

/// Reconnect policy for live feeds.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct FeedSettings {
    /// Delay before the first reconnect attempt, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Upper bound for any single reconnect delay, in milliseconds.
    pub max_backoff_ms: u64,
    /// Growth factor applied to the delay after each failed attempt.
    pub backoff_multiplier: f64,
    /// Consecutive failed attempts tolerated before a feed is closed for good.
    pub max_reconnect_attempts: u32,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 250,
            max_backoff_ms: 8_000,
            backoff_multiplier: 2.0,
            max_reconnect_attempts: 5,
        }
    }
}

impl FeedSettings {
    /// Initial reconnect delay.
    #[must_use]
    pub const fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    /// Reconnect delay ceiling.
    #[must_use]
    pub const fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Optimistic reconciliation tuning.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ReconcileSettings {
    /// Width of the match window and of the local dedupe bucket, in seconds.
    pub window_secs: u64,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self { window_secs: 120 }
    }
}

/// Object storage bucket names.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct BucketSettings {
    /// Bucket holding chat attachments.
    pub chat_media: String,
    /// Bucket holding post media.
    pub posts: String,
    /// Bucket holding avatars.
    pub avatars: String,
}

impl Default for BucketSettings {
    fn default() -> Self {
        Self {
            chat_media: "chat-media".to_string(),
            posts: "posts".to_string(),
            avatars: "avatars".to_string(),
        }
    }
}

/// The main configuration structure for the sync engine
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    /// Logging level used when `RUST_LOG` is not set
    pub log_level: String,

    /// Capacity of the UI update broadcast channel
    pub update_channel_capacity: usize,

    /// Feed reconnect policy
    pub feed: FeedSettings,

    /// Optimistic reconciliation settings
    pub reconcile: ReconcileSettings,

    /// Storage bucket names
    pub buckets: BucketSettings,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl SyncConfig {
    /// Generates a default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self {
            log_level: "info".to_string(),
            update_channel_capacity: 256,
            feed: FeedSettings::default(),
            reconcile: ReconcileSettings::default(),
            buckets: BucketSettings::default(),
        }
    }

    /// Loads the configuration from a file, environment variables, or defaults.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if the file cannot be read or parsed, an
    /// environment override is malformed, or the result fails validation.
    pub fn load_config(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        Self::load_config_with_env(config_path, |key| env::var(key).ok())
    }

    /// Same as [`SyncConfig::load_config`] with an injectable environment.
    ///
    /// # Errors
    /// See [`SyncConfig::load_config`].
    pub fn load_config_with_env<F>(config_path: Option<PathBuf>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match config_path {
            Some(path) => Self::from_file(path)?,
            None => Self::with_defaults(),
        };

        config.apply_env_overrides(lookup)?;

        config
            .validate()
            .map_err(|problems| ConfigError::Invalid { problems })?;

        Ok(config)
    }

    fn from_file(path: PathBuf) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;

        let parsed = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml" | "yml") => {
                serde_yml::from_str::<Self>(&content).map_err(|err| err.to_string())
            }
            Some("json") => serde_json::from_str::<Self>(&content).map_err(|err| err.to_string()),
            _ => return Err(ConfigError::UnsupportedFormat { path }),
        };

        debug!(path = %path.display(), "loaded configuration file");
        parsed.map_err(|message| ConfigError::Parse { path, message })
    }

    /// Environment values only apply where the value is still the default.
    fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::with_defaults();

        if self.log_level == defaults.log_level {
            if let Some(level) = lookup("FEEDSYNC_LOG_LEVEL") {
                self.log_level = level;
            }
        }
        if self.feed.max_reconnect_attempts == defaults.feed.max_reconnect_attempts {
            if let Some(value) = lookup("FEEDSYNC_MAX_RECONNECT_ATTEMPTS") {
                self.feed.max_reconnect_attempts = parse_env("FEEDSYNC_MAX_RECONNECT_ATTEMPTS", &value)?;
            }
        }
        if self.feed.initial_backoff_ms == defaults.feed.initial_backoff_ms {
            if let Some(value) = lookup("FEEDSYNC_INITIAL_BACKOFF_MS") {
                self.feed.initial_backoff_ms = parse_env("FEEDSYNC_INITIAL_BACKOFF_MS", &value)?;
            }
        }
        if self.feed.max_backoff_ms == defaults.feed.max_backoff_ms {
            if let Some(value) = lookup("FEEDSYNC_MAX_BACKOFF_MS") {
                self.feed.max_backoff_ms = parse_env("FEEDSYNC_MAX_BACKOFF_MS", &value)?;
            }
        }
        if self.reconcile.window_secs == defaults.reconcile.window_secs {
            if let Some(value) = lookup("FEEDSYNC_RECONCILE_WINDOW_SECS") {
                self.reconcile.window_secs = parse_env("FEEDSYNC_RECONCILE_WINDOW_SECS", &value)?;
            }
        }
        if self.buckets.chat_media == defaults.buckets.chat_media {
            if let Some(bucket) = lookup("FEEDSYNC_CHAT_MEDIA_BUCKET") {
                self.buckets.chat_media = bucket;
            }
        }

        Ok(())
    }

    /// Validate the complete configuration
    ///
    /// # Errors
    /// Returns every problem found, not just the first one.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !LOG_LEVELS.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            errors.push(format!(
                "Invalid log level '{}'. Expected one of: {}",
                self.log_level,
                LOG_LEVELS.join(", ")
            ));
        }
        if self.update_channel_capacity == 0 {
            errors.push("Update channel capacity must be greater than 0.".to_string());
        }
        if self.feed.initial_backoff_ms == 0 {
            errors.push("Initial backoff must be greater than 0 ms.".to_string());
        }
        if self.feed.initial_backoff_ms > self.feed.max_backoff_ms {
            errors.push(format!(
                "Initial backoff ({} ms) exceeds maximum backoff ({} ms).",
                self.feed.initial_backoff_ms, self.feed.max_backoff_ms
            ));
        }
        if !(self.feed.backoff_multiplier.is_finite() && self.feed.backoff_multiplier >= 1.0) {
            errors.push("Backoff multiplier must be a finite number >= 1.0.".to_string());
        }
        if self.reconcile.window_secs == 0 {
            errors.push("Reconcile window must be greater than 0 seconds.".to_string());
        }
        for (name, bucket) in [
            ("chat_media", &self.buckets.chat_media),
            ("posts", &self.buckets.posts),
            ("avatars", &self.buckets.avatars),
        ] {
            if bucket.trim().is_empty() {
                errors.push(format!("Bucket '{name}' must not be empty."));
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

fn parse_env<T>(variable: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|err: T::Err| ConfigError::InvalidEnv {
        variable: variable.to_string(),
        message: err.to_string(),
    })
}
