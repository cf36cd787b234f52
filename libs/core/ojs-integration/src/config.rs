//! OJS integration configuration
//!
//! `OjsConfig` can be loaded from `OJS_*` environment variables or
//! deserialized from any serde source.

use core_config::{env_list_or, env_or_default, env_parse_or, ConfigError, FromEnv};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::{Display, EnumString};

pub const DEFAULT_URL: &str = "http://localhost:8080";
pub const DEFAULT_QUEUE: &str = "default";
const DEFAULT_CONCURRENCY: usize = 10;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Retry backoff strategy requested from the backend.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Backoff {
    #[default]
    Exponential,
    Fixed,
}

/// Worker overrides. Zero or empty values defer to the top-level settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub queues: Vec<String>,
    /// Poll interval in milliseconds when no jobs are available
    pub poll_interval_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 0,
            queues: Vec::new(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Backoff::Exponential,
        }
    }
}

/// Configuration for the OJS client and worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OjsConfig {
    /// Backend base URL
    pub url: String,

    /// Queue used when an enqueue does not name one
    pub default_queue: String,

    /// Queues the worker polls
    pub queues: Vec<String>,

    /// Maximum concurrent jobs
    pub concurrency: usize,

    /// Whether the integration is active at all
    pub enabled: bool,

    pub worker: WorkerSettings,

    pub retry: RetrySettings,
}

impl Default for OjsConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            default_queue: DEFAULT_QUEUE.to_string(),
            queues: vec![DEFAULT_QUEUE.to_string()],
            concurrency: DEFAULT_CONCURRENCY,
            enabled: true,
            worker: WorkerSettings::default(),
            retry: RetrySettings::default(),
        }
    }
}

impl OjsConfig {
    /// `worker.concurrency` when set, otherwise `concurrency`.
    pub fn resolved_concurrency(&self) -> usize {
        if self.worker.concurrency > 0 {
            self.worker.concurrency
        } else {
            self.concurrency
        }
    }

    /// `worker.queues` when set, otherwise `queues`.
    pub fn resolved_queues(&self) -> Vec<String> {
        if self.worker.queues.is_empty() {
            self.queues.clone()
        } else {
            self.worker.queues.clone()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker.poll_interval_ms)
    }

    /// Reject values the worker cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: "OJS_CONCURRENCY".to_string(),
                details: "must be greater than 0".to_string(),
            });
        }
        if self.default_queue.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "OJS_DEFAULT_QUEUE".to_string(),
                details: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

impl FromEnv for OjsConfig {
    /// Reads from environment variables with these defaults:
    /// - OJS_URL: http://localhost:8080
    /// - OJS_DEFAULT_QUEUE: default
    /// - OJS_QUEUES: default (comma-separated)
    /// - OJS_CONCURRENCY: 10
    /// - OJS_ENABLED: true
    /// - OJS_WORKER_CONCURRENCY: 0 (use OJS_CONCURRENCY)
    /// - OJS_WORKER_QUEUES: empty (use OJS_QUEUES)
    /// - OJS_WORKER_POLL_INTERVAL_MS: 1000
    /// - OJS_RETRY_MAX_ATTEMPTS: 3
    /// - OJS_RETRY_BACKOFF: exponential
    fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            url: env_or_default("OJS_URL", DEFAULT_URL),
            default_queue: env_or_default("OJS_DEFAULT_QUEUE", DEFAULT_QUEUE),
            queues: env_list_or("OJS_QUEUES", &[DEFAULT_QUEUE]),
            concurrency: env_parse_or("OJS_CONCURRENCY", DEFAULT_CONCURRENCY)?,
            enabled: env_parse_or("OJS_ENABLED", true)?,
            worker: WorkerSettings {
                concurrency: env_parse_or("OJS_WORKER_CONCURRENCY", 0)?,
                queues: env_list_or("OJS_WORKER_QUEUES", &[]),
                poll_interval_ms: env_parse_or(
                    "OJS_WORKER_POLL_INTERVAL_MS",
                    DEFAULT_POLL_INTERVAL_MS,
                )?,
            },
            retry: RetrySettings {
                max_attempts: env_parse_or("OJS_RETRY_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?,
                backoff: env_parse_or("OJS_RETRY_BACKOFF", Backoff::Exponential)?,
            },
        };

        config.validate()?;
        Ok(config)
    }
}
