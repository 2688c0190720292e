//! Tracker configuration loaded from environment variables.

use std::time::Duration;

use afe_core::error::CoreError;

use crate::reconnect::ReconnectConfig;

const DEFAULT_API_URL: &str = "http://localhost:8009/afe/api";
const DEFAULT_JOB_KIND: &str = "lecture_evaluation";

/// Endpoints and timing for job tracking.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerConfig {
    /// HTTP base URL, e.g. `http://host:8009/afe/api`.
    pub api_url: String,
    /// WebSocket base URL. Derived from `api_url` when not set.
    pub ws_url: String,
    /// Path segment of the progress channel (`{ws_url}/ws/{job_kind}`).
    pub job_kind: String,
    pub heartbeat_interval: Duration,
    pub poll_interval: Duration,
    /// Hard ceiling on one tracking session, measured from its start.
    pub tracking_timeout: Duration,
    pub request_timeout: Duration,
    pub reconnect: ReconnectConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            ws_url: derive_ws_url(DEFAULT_API_URL),
            job_kind: DEFAULT_JOB_KIND.to_string(),
            heartbeat_interval: Duration::from_secs(25),
            poll_interval: Duration::from_secs(30),
            tracking_timeout: Duration::from_secs(60 * 60),
            request_timeout: Duration::from_secs(30),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl TrackerConfig {
    /// Load from the process environment.
    ///
    /// | Env var                       | Default                          |
    /// |-------------------------------|----------------------------------|
    /// | `AFE_API_URL`                 | `http://localhost:8009/afe/api`  |
    /// | `AFE_WS_URL`                  | derived from `AFE_API_URL`       |
    /// | `AFE_JOB_KIND`                | `lecture_evaluation`             |
    /// | `AFE_HEARTBEAT_SECS`          | `25`                             |
    /// | `AFE_POLL_INTERVAL_SECS`      | `30`                             |
    /// | `AFE_TRACKING_TIMEOUT_SECS`   | `3600`                           |
    /// | `AFE_REQUEST_TIMEOUT_SECS`    | `30`                             |
    /// | `AFE_RECONNECT_BASE_SECS`     | `30`                             |
    /// | `AFE_RECONNECT_CAP_SECS`      | `300`                            |
    /// | `AFE_MAX_RECONNECT_ATTEMPTS`  | `20`                             |
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let api_url = lookup("AFE_API_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or(defaults.api_url);
        if !(api_url.starts_with("http://") || api_url.starts_with("https://")) {
            return Err(CoreError::Validation(format!(
                "AFE_API_URL must be an http(s) URL, got '{api_url}'"
            )));
        }

        let ws_url = lookup("AFE_WS_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| derive_ws_url(&api_url));

        let job_kind = lookup("AFE_JOB_KIND").unwrap_or(defaults.job_kind);
        if job_kind.trim().is_empty() {
            return Err(CoreError::Validation("AFE_JOB_KIND must not be blank".into()));
        }

        let secs = |key: &str, default: Duration| -> Result<Duration, CoreError> {
            match lookup(key) {
                None => Ok(default),
                Some(raw) => match raw.trim().parse::<u64>() {
                    Ok(0) | Err(_) => Err(CoreError::Validation(format!(
                        "{key} must be a positive number of seconds, got '{raw}'"
                    ))),
                    Ok(n) => Ok(Duration::from_secs(n)),
                },
            }
        };

        let initial_delay = secs("AFE_RECONNECT_BASE_SECS", defaults.reconnect.initial_delay)?;
        let max_delay = secs("AFE_RECONNECT_CAP_SECS", defaults.reconnect.max_delay)?;
        if max_delay < initial_delay {
            return Err(CoreError::Validation(
                "AFE_RECONNECT_CAP_SECS must not be below AFE_RECONNECT_BASE_SECS".into(),
            ));
        }

        let max_attempts = match lookup("AFE_MAX_RECONNECT_ATTEMPTS") {
            None => defaults.reconnect.max_attempts,
            Some(raw) => raw.trim().parse::<u32>().map_err(|_| {
                CoreError::Validation(format!(
                    "AFE_MAX_RECONNECT_ATTEMPTS must be a non-negative integer, got '{raw}'"
                ))
            })?,
        };

        Ok(Self {
            api_url,
            ws_url,
            job_kind,
            heartbeat_interval: secs("AFE_HEARTBEAT_SECS", defaults.heartbeat_interval)?,
            poll_interval: secs("AFE_POLL_INTERVAL_SECS", defaults.poll_interval)?,
            tracking_timeout: secs("AFE_TRACKING_TIMEOUT_SECS", defaults.tracking_timeout)?,
            request_timeout: secs("AFE_REQUEST_TIMEOUT_SECS", defaults.request_timeout)?,
            reconnect: ReconnectConfig {
                initial_delay,
                max_delay,
                max_attempts,
                ..defaults.reconnect
            },
        })
    }

    /// URL of the progress channel.
    pub fn job_ws_url(&self) -> String {
        format!("{}/ws/{}", self.ws_url, self.job_kind)
    }

    /// URL of the notification channel.
    pub fn notifications_ws_url(&self) -> String {
        format!("{}/ws/notifications", self.ws_url)
    }
}

/// Swap the scheme of an HTTP base URL for its WebSocket counterpart.
pub fn derive_ws_url(api_url: &str) -> String {
    if let Some(rest) = api_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = api_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        api_url.to_string()
    }
}
