use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tracing::Level;

use skiff_observability::{record_milestone, Milestone, ProcessKind};
use skiff_relay::{relay_turn, AgentServerClient, RelayConfig, TurnRequest};
use skiff_sandbox::{
    CreateSandboxRequest, LifecycleProvider, ResumeSandboxRequest, SandboxLifecycle,
    DEFAULT_LOG_TAIL,
};
use skiff_types::{
    EventType, FileInfo, Message, NormalizedEvent, OwnershipCheck, SandboxCreated, SandboxHandle,
    SandboxLogs, Session, SessionConfig, SessionPublicState, SessionStatus, TerminateAck,
    ToolCallRecord,
};

use crate::error::{Result, SessionError};
use crate::request::{FilePathRequest, InitializeRequest, SendMessageRequest};
use crate::store::SessionStore;
use crate::usage::{record_usage, UsageEvent, UsageSink};

/// The event stream handed back by `send_message`.
pub type TurnStream = ReceiverStream<NormalizedEvent>;

/// Collaborators shared by every actor.
pub struct ActorDeps {
    pub store: Arc<dyn SessionStore>,
    pub lifecycle: Arc<dyn LifecycleProvider>,
    pub agent: Arc<dyn AgentServerClient>,
    pub usage: Arc<dyn UsageSink>,
    pub relay: RelayConfig,
}

/// A listing or a file body, depending on the shape of the requested path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathContent {
    Listing(Vec<FileInfo>),
    File(Vec<u8>),
}

#[derive(Default)]
struct ActorState {
    loaded: bool,
    session: Option<Session>,
    config: Option<SessionConfig>,
    owner: Option<String>,
}

/// Owns one session. Every mutation goes through `state`, so at most one is
/// in flight; network calls that take long run with the lock released and
/// re-validate the session before applying their result.
pub struct SessionActor {
    id: String,
    state: Mutex<ActorState>,
    deps: Arc<ActorDeps>,
}

impl SessionActor {
    pub fn new(id: impl Into<String>, deps: Arc<ActorDeps>) -> Self {
        Self {
            id: id.into(),
            state: Mutex::new(ActorState::default()),
            deps,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    async fn ensure_loaded(&self, state: &mut ActorState) -> Result<()> {
        if state.loaded {
            return Ok(());
        }
        let store = &self.deps.store;
        state.session = store.load_state(&self.id).await?;
        state.config = store.load_config(&self.id).await?;
        state.owner = store.load_owner(&self.id).await?;
        state.loaded = true;
        Ok(())
    }

    async fn persist(&self, session: &Session) {
        if let Err(e) = self.deps.store.save_state(session).await {
            tracing::error!("Session {}: failed to persist state: {}", self.id, e);
        }
    }

    fn emit(&self, level: Level, event: &str, session: Option<&Session>, detail: Option<&str>) {
        let sandbox_id = session
            .and_then(|s| s.sandbox.as_ref())
            .map(|h| h.sandbox_id.as_str());
        record_milestone(
            level,
            ProcessKind::Core,
            Milestone {
                event,
                session_id: Some(&self.id),
                sandbox_id,
                status: session.map(|s| s.status.as_str()),
                detail,
                ..Default::default()
            },
        );
    }

    fn connect(&self, config: Option<&SessionConfig>) -> Result<Arc<dyn SandboxLifecycle>> {
        let secrets = config.map(|c| c.secrets.clone()).unwrap_or_default();
        Ok(self.deps.lifecycle.connect(&secrets)?)
    }

    pub async fn get_state(&self) -> Result<SessionPublicState> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        state
            .session
            .as_ref()
            .map(Session::public_state)
            .ok_or_else(|| SessionError::NotFound(self.id.clone()))
    }

    pub async fn check_ownership(&self, caller_id: &str) -> Result<OwnershipCheck> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        let exists = state.session.is_some();
        Ok(OwnershipCheck {
            exists,
            owned: exists && state.owner.as_deref() == Some(caller_id),
        })
    }

    /// Creates the session and starts booting its sandbox in the background.
    /// A second call returns the existing state and ignores its arguments.
    pub async fn initialize(
        self: &Arc<Self>,
        owner_id: &str,
        request: InitializeRequest,
    ) -> Result<SessionPublicState> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        if let Some(existing) = &state.session {
            tracing::debug!("Session {} already initialized", self.id);
            return Ok(existing.public_state());
        }

        let session = Session::new(self.id.clone(), request.repo.clone());
        let config = SessionConfig {
            secrets: request.secrets,
            source_token: request.source_token,
        };
        let store = &self.deps.store;
        store.save_owner(&self.id, owner_id).await?;
        store.save_config(&self.id, &config).await?;
        store.save_state(&session).await?;

        let public = session.public_state();
        let generation = session.created_at;
        state.owner = Some(owner_id.to_string());
        state.config = Some(config.clone());
        state.session = Some(session);
        self.emit(Level::INFO, "session.initialize", state.session.as_ref(), request.repo.as_deref());
        drop(state);

        record_usage(
            &self.deps.usage,
            UsageEvent::SessionCreated {
                session_id: self.id.clone(),
                owner_id: owner_id.to_string(),
                repo: request.repo.clone(),
            },
        );

        let actor = self.clone();
        tokio::spawn(async move {
            actor.boot_sandbox(config, request.repo, generation).await;
        });
        Ok(public)
    }

    async fn boot_sandbox(&self, config: SessionConfig, repo: Option<String>, generation: DateTime<Utc>) {
        let outcome = match self.connect(Some(&config)) {
            Ok(lifecycle) => {
                let request = CreateSandboxRequest {
                    secrets: config.secrets.clone(),
                    repo,
                    source_token: config.source_token.clone(),
                    resume_conversation_id: None,
                };
                let created = lifecycle.create(request).await;
                match created {
                    Ok(created) if created.agent_conversation_id.is_none() => {
                        lifecycle.terminate(&created.sandbox_id).await;
                        Err(missing_conversation())
                    }
                    Ok(created) => Ok((lifecycle, created)),
                    Err(e) => Err(SessionError::from(e)),
                }
            }
            Err(e) => Err(e),
        };

        let mut state = self.state.lock().await;
        let booting = state
            .session
            .as_ref()
            .map_or(false, |s| s.created_at == generation && s.status == SessionStatus::Starting);
        if !booting {
            drop(state);
            if let Ok((lifecycle, created)) = outcome {
                tracing::info!(
                    "Session {} went away while its sandbox booted; terminating {}",
                    self.id,
                    created.sandbox_id
                );
                lifecycle.terminate(&created.sandbox_id).await;
            }
            return;
        }
        let Some(session) = state.session.as_mut() else {
            return;
        };

        match outcome {
            Ok((_, created)) => {
                apply_created(session, created);
                session.status = SessionStatus::Idle;
                session.last_error = None;
                session.last_diagnostics = None;
                session.touch();
                let snapshot = session.clone();
                self.persist(&snapshot).await;
                self.emit(Level::INFO, "session.sandbox.ready", Some(&snapshot), None);
            }
            Err(e) => {
                mark_failed(session, &e);
                let snapshot = session.clone();
                self.persist(&snapshot).await;
                self.emit(
                    Level::ERROR,
                    "session.sandbox.failed",
                    Some(&snapshot),
                    Some(&e.to_string()),
                );
            }
        }
    }

    /// Starts a turn and returns its event stream immediately; a background
    /// task drives the agent and writes into the stream.
    pub async fn send_message(self: &Arc<Self>, request: SendMessageRequest) -> Result<TurnStream> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        let session = session_mut(&mut state, &self.id)?;

        if session.is_processing {
            return Err(SessionError::Busy(
                "session is already processing a message".to_string(),
            ));
        }
        match session.status {
            SessionStatus::Starting => {
                return Err(SessionError::Busy(
                    "sandbox is still starting; poll the session state until it is idle".to_string(),
                ))
            }
            SessionStatus::Error => return Err(creation_error(session)),
            SessionStatus::Paused => {
                session.is_processing = true;
                session.status = SessionStatus::Starting;
                let snapshot = session.clone();
                self.persist(&snapshot).await;
                let config = state.config.clone();
                drop(state);

                let resumed = self
                    .resume_sandbox(&snapshot, config.as_ref())
                    .await
                    .and_then(|created| {
                        if created.agent_conversation_id.is_none()
                            && snapshot.agent_conversation_id.is_none()
                        {
                            return Err(missing_conversation());
                        }
                        Ok(created)
                    });
                state = self.state.lock().await;
                let session = session_mut(&mut state, &self.id)?;
                if session.created_at != snapshot.created_at {
                    return Err(SessionError::NotFound(self.id.clone()));
                }
                match resumed {
                    Ok(created) => {
                        apply_created(session, created);
                        self.emit(Level::INFO, "session.resume.ready", Some(&*session), None);
                    }
                    Err(e) => {
                        mark_failed(session, &e);
                        let snapshot = session.clone();
                        self.persist(&snapshot).await;
                        self.emit(
                            Level::ERROR,
                            "session.resume.failed",
                            Some(&snapshot),
                            Some(&e.to_string()),
                        );
                        return Err(creation_error(&snapshot));
                    }
                }
            }
            SessionStatus::Idle | SessionStatus::Running => {}
        }

        let session = session_mut(&mut state, &self.id)?;
        let target = session
            .sandbox
            .as_ref()
            .map(|h| h.endpoint_url.clone())
            .zip(session.agent_conversation_id.clone());
        let Some((endpoint, conversation_id)) = target else {
            session.is_processing = false;
            if session.status == SessionStatus::Starting {
                session.status = SessionStatus::Idle;
            }
            let snapshot = session.clone();
            self.persist(&snapshot).await;
            return Err(SessionError::Internal(
                "session has no agent conversation to talk to".to_string(),
            ));
        };

        session.status = SessionStatus::Running;
        session.is_processing = true;
        session.touch();
        let snapshot = session.clone();
        self.persist(&snapshot).await;
        if let Err(e) = self
            .deps
            .store
            .append_message(&self.id, &Message::user(&request.content))
            .await
        {
            tracing::error!("Session {}: failed to append user message: {}", self.id, e);
        }
        drop(state);

        self.emit(Level::INFO, "session.turn.start", Some(&snapshot), None);
        record_usage(
            &self.deps.usage,
            UsageEvent::MessageSent {
                session_id: self.id.clone(),
                chars: request.content.chars().count(),
            },
        );

        let (tx, rx) = mpsc::channel(self.deps.relay.channel_capacity.max(1));
        let turn = TurnRequest {
            session_id: self.id.clone(),
            endpoint,
            conversation_id,
            content: request.content,
        };
        let actor = self.clone();
        tokio::spawn(async move {
            actor.forward_turn(turn, tx, snapshot.created_at).await;
        });
        Ok(ReceiverStream::new(rx))
    }

    async fn resume_sandbox(
        &self,
        session: &Session,
        config: Option<&SessionConfig>,
    ) -> Result<SandboxCreated> {
        let handle = session.sandbox.as_ref().ok_or_else(|| SessionError::SandboxCreateFailed {
            message: "paused session has no sandbox to resume".to_string(),
            diagnostics: None,
        })?;
        let lifecycle = self.connect(config)?;
        self.emit(Level::INFO, "session.resume.start", Some(session), None);
        let request = ResumeSandboxRequest {
            sandbox_id: handle.sandbox_id.clone(),
            secrets: config.map(|c| c.secrets.clone()).unwrap_or_default(),
            source_token: config.and_then(|c| c.source_token.clone()),
            agent_conversation_id: session.agent_conversation_id.clone(),
        };
        Ok(lifecycle.resume(request).await?)
    }

    /// Pumps the relay into the caller's channel. The turn always finishes,
    /// whether the relay completes, fails or the caller goes away.
    async fn forward_turn(
        &self,
        turn: TurnRequest,
        tx: mpsc::Sender<NormalizedEvent>,
        generation: DateTime<Utc>,
    ) {
        let mut transcript = TurnTranscript::default();
        let stream = relay_turn(self.deps.agent.clone(), turn);
        futures::pin_mut!(stream);
        let mut finished = false;

        loop {
            let next = tokio::select! {
                _ = tx.closed() => {
                    tracing::info!("Session {}: caller disconnected mid-turn", self.id);
                    break;
                }
                next = stream.next() => next,
            };
            let Some(event) = next else {
                break;
            };
            transcript.observe(&event);

            // Record completion before the caller can observe it.
            if event.event_type == EventType::SessionIdle {
                self.finish_turn(&mut transcript, generation).await;
                finished = true;
            }
            if tx.send(event).await.is_err() {
                tracing::info!("Session {}: caller disconnected mid-turn", self.id);
                break;
            }
        }

        if !finished {
            self.finish_turn(&mut transcript, generation).await;
        }
    }

    async fn finish_turn(&self, transcript: &mut TurnTranscript, generation: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        let Some(session) = state
            .session
            .as_mut()
            .filter(|s| s.created_at == generation)
        else {
            return;
        };
        if session.status == SessionStatus::Running {
            session.status = SessionStatus::Idle;
        }
        session.is_processing = false;
        session.touch();
        let snapshot = session.clone();
        self.persist(&snapshot).await;

        if let Some(message) = transcript.take_message() {
            if let Err(e) = self.deps.store.append_message(&self.id, &message).await {
                tracing::error!("Session {}: failed to append assistant message: {}", self.id, e);
            }
        }
        self.emit(Level::INFO, "session.turn.finish", Some(&snapshot), None);
    }

    /// Lifecycle access for the read-only views; requires a booted sandbox.
    async fn sandbox_access(&self) -> Result<(Arc<dyn SandboxLifecycle>, String)> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        let session = state
            .session
            .as_ref()
            .ok_or_else(|| SessionError::NotFound(self.id.clone()))?;
        match session.status {
            SessionStatus::Starting => {
                return Err(SessionError::Busy(
                    "sandbox is still starting; poll the session state until it is idle".to_string(),
                ))
            }
            SessionStatus::Paused => {
                return Err(SessionError::Busy(
                    "session is paused; send a message to resume it".to_string(),
                ))
            }
            SessionStatus::Error => return Err(creation_error(session)),
            SessionStatus::Idle | SessionStatus::Running => {}
        }
        let sandbox_id = session
            .sandbox
            .as_ref()
            .map(|h| h.sandbox_id.clone())
            .ok_or_else(|| creation_error(session))?;
        let lifecycle = self.connect(state.config.as_ref())?;
        Ok((lifecycle, sandbox_id))
    }

    pub async fn list_files(&self, path: &FilePathRequest) -> Result<Vec<FileInfo>> {
        let (lifecycle, sandbox_id) = self.sandbox_access().await?;
        Ok(lifecycle.list_files(&sandbox_id, path.sandbox_path()).await?)
    }

    pub async fn read_file(&self, path: &FilePathRequest) -> Result<Vec<u8>> {
        if path.is_listing() {
            return Err(SessionError::Validation(format!(
                "{} names a directory",
                path.path
            )));
        }
        let (lifecycle, sandbox_id) = self.sandbox_access().await?;
        Ok(lifecycle.read_file(&sandbox_id, &path.path).await?)
    }

    pub async fn browse(&self, path: &FilePathRequest) -> Result<PathContent> {
        if path.is_listing() {
            self.list_files(path).await.map(PathContent::Listing)
        } else {
            self.read_file(path).await.map(PathContent::File)
        }
    }

    pub async fn get_logs(&self, tail: Option<usize>) -> Result<SandboxLogs> {
        let (lifecycle, sandbox_id) = self.sandbox_access().await?;
        Ok(lifecycle
            .get_logs(&sandbox_id, tail.unwrap_or(DEFAULT_LOG_TAIL))
            .await?)
    }

    /// Stops the sandbox in place. The next message resumes it.
    pub async fn pause(&self) -> Result<SessionPublicState> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        let config = state.config.clone();
        let session = session_mut(&mut state, &self.id)?;

        if session.is_processing || session.status == SessionStatus::Starting {
            return Err(SessionError::Busy(
                "session is busy and cannot be paused".to_string(),
            ));
        }
        match session.status {
            SessionStatus::Paused => return Ok(session.public_state()),
            SessionStatus::Error => return Err(creation_error(session)),
            _ => {}
        }
        let sandbox_id = session
            .sandbox
            .as_ref()
            .map(|h| h.sandbox_id.clone())
            .ok_or_else(|| creation_error(session))?;

        let lifecycle = self.connect(config.as_ref())?;
        lifecycle.pause(&sandbox_id).await?;

        session.status = SessionStatus::Paused;
        session.touch();
        let snapshot = session.clone();
        self.persist(&snapshot).await;
        self.emit(Level::INFO, "session.pause", Some(&snapshot), None);
        Ok(snapshot.public_state())
    }

    /// Deletes the sandbox (best effort) and every stored record. Always
    /// acknowledges.
    pub async fn terminate(&self) -> TerminateAck {
        let mut state = self.state.lock().await;
        if let Err(e) = self.ensure_loaded(&mut state).await {
            tracing::warn!("Session {}: failed to load before terminate: {}", self.id, e);
        }
        let session = state.session.take();
        let config = state.config.take();
        state.owner = None;
        state.loaded = true;

        if let Some(handle) = session.as_ref().and_then(|s| s.sandbox.as_ref()) {
            match self.connect(config.as_ref()) {
                Ok(lifecycle) => lifecycle.terminate(&handle.sandbox_id).await,
                Err(e) => tracing::warn!(
                    "Session {}: cannot reach sandbox controller to delete {}: {}",
                    self.id,
                    handle.sandbox_id,
                    e
                ),
            }
        }
        if let Err(e) = self.deps.store.delete(&self.id).await {
            tracing::error!("Session {}: failed to delete stored records: {}", self.id, e);
        }
        drop(state);

        if session.is_some() {
            self.emit(Level::INFO, "session.terminate", session.as_ref(), None);
            record_usage(
                &self.deps.usage,
                UsageEvent::SessionTerminated {
                    session_id: self.id.clone(),
                },
            );
        }
        TerminateAck::terminated()
    }

    /// Settles state left behind by a previous process: an interrupted boot
    /// becomes `error`, an interrupted turn becomes `idle`.
    pub async fn recover(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        let Some(session) = state.session.as_mut() else {
            return Ok(());
        };
        let before = (session.status, session.is_processing);
        match session.status {
            SessionStatus::Starting => {
                session.status = SessionStatus::Error;
                session.last_error = Some("sandbox startup was interrupted".to_string());
            }
            SessionStatus::Running => session.status = SessionStatus::Idle,
            _ => {}
        }
        session.is_processing = false;
        if before != (session.status, session.is_processing) {
            let snapshot = session.clone();
            self.persist(&snapshot).await;
            self.emit(Level::WARN, "session.recover", Some(&snapshot), None);
        }
        Ok(())
    }
}

fn session_mut<'a>(state: &'a mut ActorState, id: &str) -> Result<&'a mut Session> {
    state
        .session
        .as_mut()
        .ok_or_else(|| SessionError::NotFound(id.to_string()))
}

/// A resumed sandbox that reports no conversation keeps the previous one.
fn apply_created(session: &mut Session, created: SandboxCreated) {
    session.sandbox = Some(SandboxHandle {
        sandbox_id: created.sandbox_id,
        endpoint_url: created.endpoint_url,
    });
    if let Some(conversation_id) = created.agent_conversation_id {
        session.agent_conversation_id = Some(conversation_id);
    }
}

fn missing_conversation() -> SessionError {
    SessionError::SandboxCreateFailed {
        message: "agent server did not open a conversation".to_string(),
        diagnostics: None,
    }
}

fn mark_failed(session: &mut Session, error: &SessionError) {
    session.status = SessionStatus::Error;
    session.is_processing = false;
    session.touch();
    match error {
        SessionError::SandboxCreateFailed {
            message,
            diagnostics,
        } => {
            session.last_error = Some(message.clone());
            session.last_diagnostics = diagnostics.clone();
        }
        other => {
            session.last_error = Some(other.to_string());
            session.last_diagnostics = None;
        }
    }
}

fn creation_error(session: &Session) -> SessionError {
    SessionError::SandboxCreateFailed {
        message: session
            .last_error
            .clone()
            .unwrap_or_else(|| "session has no running sandbox".to_string()),
        diagnostics: session.last_diagnostics.clone(),
    }
}

/// Assistant output of one turn, folded into a single message row.
#[derive(Default)]
struct TurnTranscript {
    partial: String,
    blocks: Vec<String>,
    tools: Vec<ToolCallRecord>,
}

impl TurnTranscript {
    fn observe(&mut self, event: &NormalizedEvent) {
        match event.event_type {
            EventType::MessageAssistant => {
                let Some(content) = event.content() else {
                    return;
                };
                let is_partial = event
                    .data
                    .get("isPartial")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                if is_partial {
                    self.partial.push_str(content);
                } else {
                    self.blocks.push(content.to_string());
                }
            }
            EventType::MessageTool => {
                let field = |name: &str| {
                    event
                        .data
                        .get(name)
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string()
                };
                let tool_id = field("toolId");
                let tool_name = field("toolName");
                let status = field("status");
                let index = match self.tools.iter().position(|t| t.tool_id == tool_id) {
                    Some(index) => index,
                    None => {
                        self.tools.push(ToolCallRecord {
                            tool_id,
                            tool_name,
                            input: serde_json::Value::Null,
                            result: None,
                        });
                        self.tools.len() - 1
                    }
                };
                let record = &mut self.tools[index];
                match status.as_str() {
                    "calling" => {
                        if let Some(input) = event.data.get("input") {
                            record.input = input.clone();
                        }
                    }
                    "result" => record.result = event.data.get("result").cloned(),
                    _ => {}
                }
            }
            _ => {}
        }
    }

    /// Completed blocks win over the concatenated deltas.
    fn take_message(&mut self) -> Option<Message> {
        let content = if self.blocks.is_empty() {
            std::mem::take(&mut self.partial)
        } else {
            self.partial.clear();
            std::mem::take(&mut self.blocks).join("\n\n")
        };
        let tools = std::mem::take(&mut self.tools);
        if content.trim().is_empty() && tools.is_empty() {
            return None;
        }
        Some(Message::assistant(content, tools))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn transcript_prefers_completed_blocks() {
        let mut transcript = TurnTranscript::default();
        transcript.observe(&NormalizedEvent::message_assistant("Hel", true));
        transcript.observe(&NormalizedEvent::message_assistant("lo", true));
        transcript.observe(&NormalizedEvent::message_assistant("Hello", false));
        let message = transcript.take_message().unwrap();
        assert_eq!(message.content, "Hello");
        assert!(message.tool_calls.is_none());
        assert!(transcript.take_message().is_none());
    }

    #[test]
    fn transcript_falls_back_to_deltas_and_merges_tool_updates() {
        let mut transcript = TurnTranscript::default();
        transcript.observe(&NormalizedEvent::message_assistant("Listing", true));
        transcript.observe(&NormalizedEvent::tool_calling("bash", "call_1", json!({})));
        transcript.observe(&NormalizedEvent::tool_calling(
            "bash",
            "call_1",
            json!({"command": "ls"}),
        ));
        transcript.observe(&NormalizedEvent::tool_result("bash", "call_1", json!("a\nb")));
        transcript.observe(&NormalizedEvent::session_idle("s1"));

        let message = transcript.take_message().unwrap();
        assert_eq!(message.content, "Listing");
        let tools = message.tool_calls.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].input, json!({"command": "ls"}));
        assert_eq!(tools[0].result, Some(json!("a\nb")));
    }

    #[test]
    fn empty_turn_records_nothing() {
        let mut transcript = TurnTranscript::default();
        transcript.observe(&NormalizedEvent::message_user("hi"));
        transcript.observe(&NormalizedEvent::message_assistant("  ", true));
        assert!(transcript.take_message().is_none());
    }
}
