use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use skiff_observability::redact_text;
use skiff_runtime::{HttpConfig, RetryPolicy};
use skiff_types::{FileInfo, SandboxCreated, SandboxLogs, SessionSecrets};

use crate::config::{HealthPollConfig, SandboxSettings};
use crate::controller::SandboxController;
use crate::error::{Result, SandboxError};
use crate::http_backend::HttpComputeBackend;

#[derive(Clone, Default)]
pub struct CreateSandboxRequest {
    pub secrets: SessionSecrets,
    /// `owner/name` on the source host.
    pub repo: Option<String>,
    pub source_token: Option<String>,
    /// Start the agent server bound to an existing conversation.
    pub resume_conversation_id: Option<String>,
}

#[derive(Clone, Default)]
pub struct ResumeSandboxRequest {
    pub sandbox_id: String,
    pub secrets: SessionSecrets,
    pub source_token: Option<String>,
    pub agent_conversation_id: Option<String>,
}

/// Variables exported to the agent server. Explicit keys win over
/// `agent_env` entries with the same name.
pub fn agent_environment(
    secrets: &SessionSecrets,
    source_token: Option<&str>,
) -> BTreeMap<String, String> {
    let mut env = secrets.agent_env.clone();
    if let Some(token) = source_token.filter(|t| !t.is_empty()) {
        env.insert("GH_TOKEN".to_string(), token.to_string());
    }
    if let Some(key) = secrets.anthropic_api_key.as_deref().filter(|k| !k.is_empty()) {
        env.insert("ANTHROPIC_API_KEY".to_string(), key.to_string());
    }
    env
}

/// Create, pause, resume and terminate the sandbox behind one session, plus
/// the read-only views into it.
#[async_trait]
pub trait SandboxLifecycle: Send + Sync {
    async fn create(&self, request: CreateSandboxRequest) -> Result<SandboxCreated>;

    async fn pause(&self, sandbox_id: &str) -> Result<()>;

    async fn resume(&self, request: ResumeSandboxRequest) -> Result<SandboxCreated>;

    /// Never fails; errors are logged.
    async fn terminate(&self, sandbox_id: &str);

    async fn list_files(&self, sandbox_id: &str, path: &str) -> Result<Vec<FileInfo>>;

    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<Vec<u8>>;

    async fn get_logs(&self, sandbox_id: &str, tail: usize) -> Result<SandboxLogs>;
}

/// Builds the lifecycle controller for one session's credentials.
pub trait LifecycleProvider: Send + Sync {
    fn connect(&self, secrets: &SessionSecrets) -> Result<Arc<dyn SandboxLifecycle>>;
}

/// Connects to the HTTP sandbox controller named by the session secrets,
/// falling back to the configured default endpoint.
#[derive(Debug, Clone)]
pub struct HttpLifecycleProvider {
    pub default_url: Option<String>,
    pub default_token: Option<String>,
    pub settings: SandboxSettings,
    pub health: HealthPollConfig,
    pub http: HttpConfig,
    pub retry: RetryPolicy,
}

impl LifecycleProvider for HttpLifecycleProvider {
    fn connect(&self, secrets: &SessionSecrets) -> Result<Arc<dyn SandboxLifecycle>> {
        let url = secrets
            .controller_url
            .as_deref()
            .or(self.default_url.as_deref())
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| SandboxError::create_failed("no sandbox controller URL configured"))?;
        let token = secrets
            .controller_token
            .as_deref()
            .or(self.default_token.as_deref());
        tracing::debug!(
            "Connecting to sandbox controller {} (token {})",
            url,
            token.map(redact_text).unwrap_or_else(|| "none".to_string())
        );
        let backend = HttpComputeBackend::new(url, token, &self.http, self.retry.clone())?;
        Ok(Arc::new(SandboxController::new(
            Arc::new(backend),
            self.settings.clone(),
            self.health.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_prefers_explicit_secrets() {
        let mut secrets = SessionSecrets {
            anthropic_api_key: Some("sk-ant".to_string()),
            ..Default::default()
        };
        secrets
            .agent_env
            .insert("ANTHROPIC_API_KEY".to_string(), "stale".to_string());
        secrets
            .agent_env
            .insert("OPENAI_API_KEY".to_string(), "sk-oai".to_string());

        let env = agent_environment(&secrets, Some("ghp_1"));
        assert_eq!(env["ANTHROPIC_API_KEY"], "sk-ant");
        assert_eq!(env["OPENAI_API_KEY"], "sk-oai");
        assert_eq!(env["GH_TOKEN"], "ghp_1");
        assert!(!agent_environment(&SessionSecrets::default(), Some("")).contains_key("GH_TOKEN"));
    }

    #[test]
    fn provider_requires_a_controller_url() {
        let provider = HttpLifecycleProvider {
            default_url: None,
            default_token: None,
            settings: SandboxSettings::default(),
            health: HealthPollConfig::default(),
            http: HttpConfig::default(),
            retry: RetryPolicy::default(),
        };
        let err = provider.connect(&SessionSecrets::default()).err().unwrap();
        assert!(matches!(err, SandboxError::CreateFailed { .. }));

        let secrets = SessionSecrets {
            controller_url: Some("http://127.0.0.1:9".to_string()),
            ..Default::default()
        };
        assert!(provider.connect(&secrets).is_ok());
    }
}
