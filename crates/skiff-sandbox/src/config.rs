use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Shape of a provisioned sandbox and where things live inside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    pub image: String,
    pub cpu: f64,
    pub memory_mb: u64,
    /// Hard lifetime of a unit.
    pub timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub agent_port: u16,
    pub workspace_dir: String,
    pub agent_log_path: String,
    pub env_file: String,
    pub agent_binary: String,
    pub source_host: String,
    pub source_api_url: String,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            image: "skiff/opencode-sandbox:latest".to_string(),
            cpu: 1.0,
            memory_mb: 2048,
            timeout_secs: 3600,
            idle_timeout_secs: 600,
            agent_port: 4096,
            workspace_dir: "/workspace".to_string(),
            agent_log_path: "/tmp/opencode.log".to_string(),
            env_file: "/root/.opencode-env".to_string(),
            agent_binary: "opencode".to_string(),
            source_host: "github.com".to_string(),
            source_api_url: "https://api.github.com".to_string(),
        }
    }
}

/// Bounded health poll: wait `initial_delay_ms` (or `resume_delay_ms`), then
/// check up to `max_attempts` times, `interval_ms` apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthPollConfig {
    pub initial_delay_ms: u64,
    pub resume_delay_ms: u64,
    pub interval_ms: u64,
    pub max_attempts: u32,
}

impl Default for HealthPollConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 5_000,
            resume_delay_ms: 3_000,
            interval_ms: 2_000,
            max_attempts: 30,
        }
    }
}

impl HealthPollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn initial_delay(&self, resuming: bool) -> Duration {
        Duration::from_millis(if resuming {
            self.resume_delay_ms
        } else {
            self.initial_delay_ms
        })
    }

    /// Upper bound on time spent polling, excluding check latency.
    pub fn budget(&self, resuming: bool) -> Duration {
        self.initial_delay(resuming)
            + self.interval() * self.max_attempts.saturating_sub(1)
    }
}
