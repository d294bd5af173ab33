use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use skiff_runtime::HttpError;

/// What to provision. The image is a fixed base template that already carries
/// git, node and the agent server binary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UnitSpec {
    pub image: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Ports exposed through an encrypted tunnel.
    #[serde(default)]
    pub encrypted_ports: Vec<u16>,
    pub cpu: f64,
    pub memory_mb: u64,
    pub timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnitInfo {
    pub id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExecOutput {
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// The remote compute provider. Everything the lifecycle controller does
/// inside a unit goes through `exec`.
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    async fn create_unit(&self, spec: &UnitSpec) -> Result<UnitInfo, HttpError>;

    async fn exec(&self, unit_id: &str, argv: &[String]) -> Result<ExecOutput, HttpError>;

    async fn tunnel_url(&self, unit_id: &str, port: u16) -> Result<String, HttpError>;

    /// Stops the unit and keeps its filesystem.
    async fn stop_unit(&self, unit_id: &str) -> Result<(), HttpError>;

    async fn start_unit(&self, unit_id: &str) -> Result<(), HttpError>;

    /// Permanent. Deleting a unit that no longer exists succeeds.
    async fn delete_unit(&self, unit_id: &str) -> Result<(), HttpError>;
}

pub fn sh(script: impl Into<String>) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.into()]
}
