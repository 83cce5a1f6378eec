//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Port the HTTP API binds to.
    pub port: u16,
    /// Tasks older than this (measured from creation) are evicted.
    pub max_task_age: Duration,
    /// How often the reaper sweeps the store.
    pub reaper_interval: Duration,
    /// Upper bound on a single automation call.
    pub step_timeout: Duration,
    /// Capture a screenshot after every successful step.
    pub capture_each_step: bool,
    /// Directory for screenshots; in-memory storage when unset.
    pub artifact_dir: Option<PathBuf>,
    /// Remote automation driver.
    pub driver: DriverConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            max_task_age: Duration::from_secs(3600), // 1 hour
            reaper_interval: Duration::from_secs(3600), // 1 hour
            step_timeout: Duration::from_secs(30),
            capture_each_step: true,
            artifact_dir: None,
            driver: DriverConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Build configuration from `TASKS_*` / `AUTOMATION_DRIVER_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let port = parse_or(&lookup, "TASKS_PORT", defaults.port)?;
        let max_task_age = secs_or(&lookup, "TASKS_MAX_AGE_SECS", defaults.max_task_age)?;
        let reaper_interval =
            secs_or(&lookup, "TASKS_REAPER_INTERVAL_SECS", defaults.reaper_interval)?;
        let step_timeout = secs_or(&lookup, "TASKS_STEP_TIMEOUT_SECS", defaults.step_timeout)?;
        let capture_each_step =
            parse_or(&lookup, "TASKS_CAPTURE_EACH_STEP", defaults.capture_each_step)?;
        let artifact_dir = lookup("TASKS_ARTIFACT_DIR")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        let base_url = lookup("AUTOMATION_DRIVER_URL").unwrap_or(defaults.driver.base_url);
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ConfigError::InvalidValue {
                key: "AUTOMATION_DRIVER_URL".to_string(),
                message: format!("expected an http(s) URL, got '{base_url}'"),
            });
        }
        let token = lookup("AUTOMATION_DRIVER_TOKEN")
            .filter(|s| !s.is_empty())
            .map(SecretString::from);

        Ok(Self {
            port,
            max_task_age,
            reaper_interval,
            step_timeout,
            capture_each_step,
            artifact_dir,
            driver: DriverConfig {
                base_url: base_url.trim_end_matches('/').to_string(),
                token,
            },
        })
    }
}

/// Connection settings for the remote automation driver.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Base URL of the automation agent.
    pub base_url: String,
    /// Optional bearer token.
    pub token: Option<SecretString>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9515".to_string(),
            token: None,
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("'{raw}': {e}"),
            }),
        None => Ok(default),
    }
}

fn secs_or<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let secs: u64 = parse_or(lookup, key, default.as_secs())?;
    if secs == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}
