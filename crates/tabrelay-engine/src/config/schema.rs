use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TabrelayConfig {
    pub engine: EngineSettings,
    pub dispatcher: DispatcherSettings,
    pub browser: BrowserSettings,
}

/// Timing knobs for the instruction engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Pause between failed attempts of the retry runner.
    pub retry_backoff_ms: u64,
    /// Granularity of every polling loop.
    pub poll_interval_ms: u64,
    /// Slack around the viewport when deciding visibility.
    pub viewport_margin_px: f64,
    pub drag_settle_ms: u64,
    /// Quiet period `network` waits require before succeeding early.
    pub network_settle_ms: u64,
    /// Delay before the change notification that follows a key press.
    pub key_change_delay_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            retry_backoff_ms: 1000,
            poll_interval_ms: 100,
            viewport_margin_px: 100.0,
            drag_settle_ms: 100,
            network_settle_ms: 500,
            key_change_delay_ms: 10,
        }
    }
}

impl EngineSettings {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn drag_settle(&self) -> Duration {
        Duration::from_millis(self.drag_settle_ms)
    }

    pub fn network_settle(&self) -> Duration {
        Duration::from_millis(self.network_settle_ms)
    }

    pub fn key_change_delay(&self) -> Duration {
        Duration::from_millis(self.key_change_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherSettings {
    /// Base URL of the remote task server.
    pub server_url: String,
    pub listen_port: u16,
    /// Period of the dispatch loop.
    pub interval_ms: u64,
    pub notify_attempts: u32,
    /// Backoff unit; attempt `n` waits `n * notify_backoff_ms`.
    pub notify_backoff_ms: u64,
    pub queue_max_age_ms: u64,
    /// Response timeout for a single channel request.
    pub request_timeout_ms: u64,
    /// Grace period before re-probing a context that navigated.
    pub probe_grace_ms: u64,
    pub identity_path: Option<PathBuf>,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            listen_port: 9001,
            interval_ms: 5000,
            notify_attempts: 3,
            notify_backoff_ms: 500,
            queue_max_age_ms: 60 * 60 * 1000,
            request_timeout_ms: 10_000,
            probe_grace_ms: 1000,
            identity_path: None,
        }
    }
}

impl DispatcherSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn notify_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.notify_backoff_ms.saturating_mul(u64::from(attempt)))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn probe_grace(&self) -> Duration {
        Duration::from_millis(self.probe_grace_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    /// Launch a headed browser instead of headless.
    pub visible: bool,
    /// Explicit Chrome/Chromium binary.
    pub chrome_bin: Option<PathBuf>,
}
