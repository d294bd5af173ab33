use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use base64::Engine as _;
use serde::Deserialize;
use tracing::Level;

use skiff_observability::{record_milestone, redact_text, scrub_secrets, Milestone, ProcessKind};
use skiff_runtime::truncate;
use skiff_types::{FileInfo, SandboxCreated, SandboxLogs};

use crate::backend::{ComputeBackend, ExecOutput, UnitSpec};
use crate::config::{HealthPollConfig, SandboxSettings};
use crate::error::{Result, SandboxError};
use crate::files::{parse_listing, redact_environment};
use crate::lifecycle::{
    agent_environment, CreateSandboxRequest, ResumeSandboxRequest, SandboxLifecycle,
};
use crate::shell;

pub const DEFAULT_LOG_TAIL: usize = 100;
pub const MAX_LOG_TAIL: usize = 5_000;
const DIAGNOSTIC_LOG_CHARS: usize = 500;

#[derive(Debug, Deserialize)]
struct SourceIdentity {
    login: Option<String>,
    name: Option<String>,
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AgentConversation {
    id: String,
}

/// [`SandboxLifecycle`] over any [`ComputeBackend`].
pub struct SandboxController {
    backend: Arc<dyn ComputeBackend>,
    settings: SandboxSettings,
    health: HealthPollConfig,
}

impl SandboxController {
    pub fn new(
        backend: Arc<dyn ComputeBackend>,
        settings: SandboxSettings,
        health: HealthPollConfig,
    ) -> Self {
        Self {
            backend,
            settings,
            health,
        }
    }

    async fn exec(&self, unit_id: &str, argv: Vec<String>) -> Result<ExecOutput> {
        Ok(self.backend.exec(unit_id, &argv).await?)
    }

    async fn exec_checked(&self, unit_id: &str, argv: Vec<String>, what: &str) -> Result<ExecOutput> {
        let output = self.exec(unit_id, argv).await?;
        if !output.success() {
            return Err(SandboxError::Exec(format!(
                "{} exited with {}: {}",
                what,
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(output)
    }

    fn unit_spec(&self, request: &CreateSandboxRequest) -> UnitSpec {
        UnitSpec {
            image: self.settings.image.clone(),
            env: agent_environment(&request.secrets, request.source_token.as_deref()),
            encrypted_ports: vec![self.settings.agent_port],
            cpu: self.settings.cpu,
            memory_mb: self.settings.memory_mb,
            timeout_secs: self.settings.timeout_secs,
            idle_timeout_secs: self.settings.idle_timeout_secs,
        }
    }

    /// Everything after provisioning. Any failure here leaves a unit that the
    /// caller must delete.
    async fn prepare(&self, unit_id: &str, request: &CreateSandboxRequest) -> Result<SandboxCreated> {
        let token = request.source_token.as_deref().filter(|t| !t.is_empty());

        if let Some(token) = token {
            tracing::info!("Configuring git credentials ({})", redact_text(token));
            self.exec_checked(
                unit_id,
                shell::git_credentials(&self.settings, token),
                "git credential setup",
            )
            .await?;
        }

        match request.repo.as_deref() {
            Some(repo) => {
                tracing::info!("Cloning {} into {}", repo, self.settings.workspace_dir);
                let output = self.exec(unit_id, shell::git_clone(&self.settings, repo)).await?;
                if !output.success() {
                    return Err(SandboxError::create_failed(format!(
                        "failed to clone {}: {}",
                        repo,
                        output.stderr.trim()
                    )));
                }
                if let Some(token) = token {
                    self.configure_identity(unit_id, token).await;
                }
            }
            None => {
                self.exec_checked(unit_id, shell::make_workspace(&self.settings), "mkdir")
                    .await?;
            }
        }

        self.exec_checked(
            unit_id,
            shell::write_agent_config(&self.settings),
            "agent config write",
        )
        .await?;

        let resume_id = request.resume_conversation_id.as_deref();
        self.start_agent(unit_id, &agent_environment(&request.secrets, token), resume_id)
            .await?;
        self.wait_for_healthy(unit_id, false).await?;

        let agent_conversation_id = match resume_id {
            Some(id) => id.to_string(),
            None => self.open_conversation(unit_id).await?,
        };
        let endpoint_url = self
            .backend
            .tunnel_url(unit_id, self.settings.agent_port)
            .await?;

        Ok(SandboxCreated {
            sandbox_id: unit_id.to_string(),
            endpoint_url,
            agent_conversation_id: Some(agent_conversation_id),
        })
    }

    /// Best effort: a missing or unparsable identity leaves git defaults.
    async fn configure_identity(&self, unit_id: &str, token: &str) {
        let output = match self
            .exec(unit_id, shell::fetch_identity(&self.settings, token))
            .await
        {
            Ok(output) if output.success() => output,
            Ok(output) => {
                tracing::warn!("Identity lookup exited with {}", output.exit_code);
                return;
            }
            Err(e) => {
                tracing::warn!("Identity lookup failed: {}", e);
                return;
            }
        };
        let identity: SourceIdentity = match serde_json::from_str(&output.stdout) {
            Ok(identity) => identity,
            Err(e) => {
                tracing::warn!("Could not parse identity response: {}", e);
                return;
            }
        };
        let Some(login) = identity.login.filter(|l| !l.is_empty()) else {
            tracing::warn!("Identity response carried no login");
            return;
        };
        let email = identity
            .email
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| format!("{}@users.noreply.github.com", login));
        let name = identity.name.filter(|n| !n.is_empty()).unwrap_or(login);

        for (key, value) in [("user.email", email), ("user.name", name)] {
            if let Err(e) = self
                .exec_checked(unit_id, shell::git_config(key, &value), "git config")
                .await
            {
                tracing::warn!("Failed to set {}: {}", key, e);
            }
        }
    }

    async fn start_agent(
        &self,
        unit_id: &str,
        env: &BTreeMap<String, String>,
        conversation_id: Option<&str>,
    ) -> Result<()> {
        tracing::debug!("Writing agent environment in {}: {}", unit_id, describe_env(env));
        self.exec_checked(
            unit_id,
            shell::write_env_file(&self.settings, env),
            "env file write",
        )
        .await?;
        tracing::info!(
            "Starting agent server in {} (conversation: {})",
            unit_id,
            conversation_id.unwrap_or("new")
        );
        self.exec_checked(
            unit_id,
            shell::start_agent(&self.settings, conversation_id),
            "agent server start",
        )
        .await?;
        Ok(())
    }

    async fn wait_for_healthy(&self, unit_id: &str, resuming: bool) -> Result<()> {
        tokio::time::sleep(self.health.initial_delay(resuming)).await;

        let max_attempts = self.health.max_attempts.max(1);
        let mut last_seen = String::new();
        for attempt in 1..=max_attempts {
            match self.exec(unit_id, shell::health_check(&self.settings)).await {
                Ok(output) if output.stdout.trim() == "200" => {
                    tracing::info!("Agent server in {} ready (attempt {})", unit_id, attempt);
                    return Ok(());
                }
                Ok(output) => last_seen = format!("health returned {:?}", output.stdout.trim()),
                Err(e) => last_seen = e.to_string(),
            }
            tracing::debug!(
                "Agent server in {} not ready ({}/{}): {}",
                unit_id,
                attempt,
                max_attempts,
                last_seen
            );
            if attempt < max_attempts {
                tokio::time::sleep(self.health.interval()).await;
            }
        }

        let detail = format!("attempts={} last={}", max_attempts, last_seen);
        record_milestone(
            Level::WARN,
            ProcessKind::Core,
            Milestone {
                event: "sandbox.health.timeout",
                sandbox_id: Some(unit_id),
                status: Some("timeout"),
                error_code: Some("SANDBOX_CREATE_FAILED"),
                detail: Some(&detail),
                ..Default::default()
            },
        );
        let diagnostics = self.collect_diagnostics(unit_id).await;
        Err(SandboxError::CreateFailed {
            message: format!(
                "agent server did not become healthy after {} attempts",
                max_attempts
            ),
            diagnostics: Some(diagnostics),
        })
    }

    async fn collect_diagnostics(&self, unit_id: &str) -> String {
        let sections = [
            ("processes", shell::agent_processes(&self.settings)),
            ("listeners", shell::listeners(&self.settings)),
            (
                "agent log",
                shell::log_tail_chars(&self.settings, DIAGNOSTIC_LOG_CHARS),
            ),
        ];
        let mut report = String::new();
        for (label, argv) in sections {
            let body = match self.exec(unit_id, argv).await {
                Ok(output) => output.stdout.trim().to_string(),
                Err(e) => format!("<unavailable: {}>", e),
            };
            report.push_str(&format!("== {} ==\n{}\n", label, body));
        }
        report
    }

    /// A sandbox without a conversation cannot serve a turn, so failing to
    /// open one fails the create.
    async fn open_conversation(&self, unit_id: &str) -> Result<String> {
        let output = self
            .exec(unit_id, shell::create_conversation(&self.settings))
            .await?;
        if !output.success() {
            return Err(SandboxError::create_failed(format!(
                "agent server refused to open a conversation (exit {}): {}",
                output.exit_code,
                truncate(output.stderr.trim(), 200)
            )));
        }
        match serde_json::from_str::<AgentConversation>(&output.stdout) {
            Ok(conversation) if !conversation.id.is_empty() => Ok(conversation.id),
            Ok(_) => Err(SandboxError::create_failed(
                "agent server returned an empty conversation id",
            )),
            Err(e) => Err(SandboxError::create_failed(format!(
                "unexpected conversation response ({}): {}",
                e,
                truncate(&output.stdout, 200)
            ))),
        }
    }

    async fn restart(&self, request: &ResumeSandboxRequest) -> Result<SandboxCreated> {
        let unit_id = request.sandbox_id.as_str();
        self.backend.start_unit(unit_id).await?;
        let env = agent_environment(&request.secrets, request.source_token.as_deref());
        self.start_agent(unit_id, &env, request.agent_conversation_id.as_deref())
            .await?;
        self.wait_for_healthy(unit_id, true).await?;

        let agent_conversation_id = match request.agent_conversation_id.clone() {
            Some(id) => id,
            None => self.open_conversation(unit_id).await?,
        };
        let endpoint_url = self
            .backend
            .tunnel_url(unit_id, self.settings.agent_port)
            .await?;
        Ok(SandboxCreated {
            sandbox_id: unit_id.to_string(),
            endpoint_url,
            agent_conversation_id: Some(agent_conversation_id),
        })
    }

    fn listing_path<'a>(&'a self, path: &'a str) -> Result<&'a str> {
        let path = path.trim();
        if path.is_empty() {
            return Ok(self.settings.workspace_dir.as_str());
        }
        validate_path(path)?;
        if path.len() > 1 {
            Ok(path.trim_end_matches('/'))
        } else {
            Ok(path)
        }
    }
}

fn validate_path(path: &str) -> Result<()> {
    if !path.starts_with('/') || path.contains('\0') {
        return Err(SandboxError::InvalidPath(path.to_string()));
    }
    Ok(())
}

fn into_create_failed(err: SandboxError) -> SandboxError {
    match err {
        SandboxError::CreateFailed { .. } => err,
        other => SandboxError::create_failed(other.to_string()),
    }
}

/// Failure text comes from command stderr and the agent log, both of which
/// can echo credentials; none of it leaves the controller unscrubbed.
fn scrub_failure(err: SandboxError, env: &BTreeMap<String, String>) -> SandboxError {
    let secrets: Vec<&str> = env.values().map(String::as_str).collect();
    match into_create_failed(err) {
        SandboxError::CreateFailed {
            message,
            diagnostics,
        } => SandboxError::CreateFailed {
            message: scrub_secrets(&message, &secrets),
            diagnostics: diagnostics.map(|d| scrub_secrets(&d, &secrets)),
        },
        other => other,
    }
}

fn describe_env(env: &BTreeMap<String, String>) -> String {
    env.iter()
        .map(|(name, value)| format!("{}={}", name, redact_text(value)))
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
impl SandboxLifecycle for SandboxController {
    async fn create(&self, request: CreateSandboxRequest) -> Result<SandboxCreated> {
        let started = Instant::now();
        record_milestone(
            Level::INFO,
            ProcessKind::Core,
            Milestone {
                event: "sandbox.create.start",
                status: Some("start"),
                detail: request.repo.as_deref(),
                ..Default::default()
            },
        );

        let unit = self
            .backend
            .create_unit(&self.unit_spec(&request))
            .await
            .map_err(|e| SandboxError::create_failed(format!("failed to provision sandbox: {}", e)))?;
        tracing::info!("Provisioned sandbox {}", unit.id);

        match self.prepare(&unit.id, &request).await {
            Ok(created) => {
                record_milestone(
                    Level::INFO,
                    ProcessKind::Core,
                    Milestone {
                        event: "sandbox.create.ready",
                        sandbox_id: Some(&created.sandbox_id),
                        status: Some("ready"),
                        elapsed: Some(started.elapsed()),
                        ..Default::default()
                    },
                );
                Ok(created)
            }
            Err(err) => {
                let env = agent_environment(&request.secrets, request.source_token.as_deref());
                let err = scrub_failure(err, &env);
                let detail = err.to_string();
                record_milestone(
                    Level::ERROR,
                    ProcessKind::Core,
                    Milestone {
                        event: "sandbox.create.failed",
                        sandbox_id: Some(&unit.id),
                        status: Some("failed"),
                        error_code: Some("SANDBOX_CREATE_FAILED"),
                        elapsed: Some(started.elapsed()),
                        detail: Some(&detail),
                        ..Default::default()
                    },
                );
                self.terminate(&unit.id).await;
                Err(err)
            }
        }
    }

    async fn pause(&self, sandbox_id: &str) -> Result<()> {
        self.backend.stop_unit(sandbox_id).await?;
        tracing::info!("Paused sandbox {}", sandbox_id);
        Ok(())
    }

    async fn resume(&self, request: ResumeSandboxRequest) -> Result<SandboxCreated> {
        let env = agent_environment(&request.secrets, request.source_token.as_deref());
        self.restart(&request)
            .await
            .map_err(|err| scrub_failure(err, &env))
    }

    async fn terminate(&self, sandbox_id: &str) {
        match self.backend.delete_unit(sandbox_id).await {
            Ok(()) => tracing::info!("Deleted sandbox {}", sandbox_id),
            Err(e) => tracing::warn!("Failed to delete sandbox {}: {}", sandbox_id, e),
        }
    }

    async fn list_files(&self, sandbox_id: &str, path: &str) -> Result<Vec<FileInfo>> {
        let path = self.listing_path(path)?;
        let output = self.exec(sandbox_id, shell::list_directory(path)).await?;
        match output.exit_code {
            0 => Ok(parse_listing(path, &output.stdout)),
            2 => Err(SandboxError::FileNotFound(path.to_string())),
            code => Err(SandboxError::Exec(format!(
                "listing {} exited with {}: {}",
                path,
                code,
                output.stderr.trim()
            ))),
        }
    }

    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<Vec<u8>> {
        validate_path(path)?;
        let is_file = self.exec(sandbox_id, shell::is_file(path)).await?;
        if !is_file.success() {
            return Err(SandboxError::FileNotFound(path.to_string()));
        }
        let output = self
            .exec_checked(sandbox_id, shell::read_base64(path), "file read")
            .await?;
        base64::engine::general_purpose::STANDARD
            .decode(output.stdout.trim())
            .map_err(|e| SandboxError::Exec(format!("unreadable contents of {}: {}", path, e)))
    }

    async fn get_logs(&self, sandbox_id: &str, tail: usize) -> Result<SandboxLogs> {
        let tail = tail.clamp(1, MAX_LOG_TAIL);
        let agent_log = self
            .exec(sandbox_id, shell::log_tail_lines(&self.settings, tail))
            .await?
            .stdout;
        let processes = self
            .exec(sandbox_id, shell::agent_processes(&self.settings))
            .await?
            .stdout;
        let health_check = self
            .exec(sandbox_id, shell::health_report(&self.settings))
            .await?
            .stdout;
        let environment = self.exec(sandbox_id, shell::environment()).await?.stdout;

        Ok(SandboxLogs {
            agent_log,
            processes,
            health_check: health_check.trim().to_string(),
            environment: redact_environment(&environment),
        })
    }
}
