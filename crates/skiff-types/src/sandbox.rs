use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub name: String,
    pub path: String,
    pub is_directory: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Diagnostic bundle pulled from a running sandbox.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SandboxLogs {
    pub agent_log: String,
    pub processes: String,
    pub health_check: String,
    pub environment: String,
}

/// Result of a successful create or resume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SandboxCreated {
    pub sandbox_id: String,
    pub endpoint_url: String,
    #[serde(default)]
    pub agent_conversation_id: Option<String>,
}
