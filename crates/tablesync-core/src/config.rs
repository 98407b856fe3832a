//! Engine configuration.
//!
//! Every field has a default, so an empty JSON object (or no file at all) is a
//! valid configuration:
//!
//! ```json
//! {
//!   "default_fetch_limit": 2000,
//!   "max_fetch_limit": 10000,
//!   "conflict_policy": "reject",
//!   "lock_timeout_ms": 5000
//! }
//! ```
use std::{fmt, path::Path, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

/// What the table store does when a write loses its compare-and-swap.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Fail the write with a version mismatch; nothing is recorded.
    #[default]
    Reject,
    /// Record a conflict pair and hold the row until it is resolved.
    PreserveConflicts,
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictPolicy::Reject => write!(f, "reject"),
            ConflictPolicy::PreserveConflicts => write!(f, "preserve_conflicts"),
        }
    }
}

/// Error returned when parsing a [`ConflictPolicy`] from a string.
#[derive(Debug, Snafu)]
#[snafu(display("unknown conflict policy {input:?} (expected reject or preserve_conflicts)"))]
pub struct ParseConflictPolicyError {
    input: String,
}

impl FromStr for ConflictPolicy {
    type Err = ParseConflictPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "reject" => Ok(ConflictPolicy::Reject),
            "preserve" | "preserve_conflicts" => Ok(ConflictPolicy::PreserveConflicts),
            _ => Err(ParseConflictPolicyError {
                input: s.to_string(),
            }),
        }
    }
}

/// Errors from loading or validating a configuration.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[snafu(display("Failed to read config file {path}: {source}"))]
    Read {
        /// File that was read.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The configuration is not valid JSON for [`EngineConfig`].
    #[snafu(display("Failed to parse config {path}: {source}"))]
    Parse {
        /// File (or `<inline>`) that was parsed.
        path: String,
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// A value is out of range.
    #[snafu(display("Invalid config: {msg}"))]
    Invalid {
        /// What is wrong.
        msg: String,
    },
}

/// Tunables of a [`SyncEngine`](crate::engine::SyncEngine).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Page size when a caller does not ask for one.
    pub default_fetch_limit: usize,
    /// Largest page size served; larger requests are clamped.
    pub max_fetch_limit: usize,
    /// Behavior of losing writes.
    pub conflict_policy: ConflictPolicy,
    /// Longest a writer waits for a row lock.
    pub lock_timeout_ms: u64,
}

impl EngineConfig {
    /// Default page size of the change feed.
    pub const DEFAULT_FETCH_LIMIT: usize = 2000;
    /// Default upper bound on page size.
    pub const DEFAULT_MAX_FETCH_LIMIT: usize = 10_000;
    /// Default row-lock wait.
    pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;

    /// Replace the conflict policy.
    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Row-lock wait as a duration.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Page size for a request: `None` or 0 means the default; anything
    /// above the maximum is clamped.
    pub fn effective_fetch_limit(&self, requested: Option<usize>) -> usize {
        match requested {
            None | Some(0) => self.default_fetch_limit,
            Some(n) if n > self.max_fetch_limit => {
                log::warn!(
                    "fetch limit {n} exceeds maximum {}; clamping",
                    self.max_fetch_limit
                );
                self.max_fetch_limit
            }
            Some(n) => n,
        }
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(
            self.default_fetch_limit > 0,
            InvalidSnafu {
                msg: "default_fetch_limit must be at least 1",
            }
        );
        ensure!(
            self.max_fetch_limit >= self.default_fetch_limit,
            InvalidSnafu {
                msg: format!(
                    "max_fetch_limit ({}) must be >= default_fetch_limit ({})",
                    self.max_fetch_limit, self.default_fetch_limit
                ),
            }
        );
        ensure!(
            self.lock_timeout_ms > 0,
            InvalidSnafu {
                msg: "lock_timeout_ms must be at least 1",
            }
        );
        Ok(())
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).context(ParseSnafu { path: "<inline>" })?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub async fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let json = tokio::fs::read_to_string(path)
            .await
            .context(ReadSnafu {
                path: display.clone(),
            })?;
        let config: Self = serde_json::from_str(&json).context(ParseSnafu { path: display })?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_fetch_limit: Self::DEFAULT_FETCH_LIMIT,
            max_fetch_limit: Self::DEFAULT_MAX_FETCH_LIMIT,
            conflict_policy: ConflictPolicy::default(),
            lock_timeout_ms: Self::DEFAULT_LOCK_TIMEOUT_MS,
        }
    }
}
