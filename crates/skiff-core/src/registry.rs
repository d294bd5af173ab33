use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use skiff_types::{FileInfo, OwnershipCheck, SandboxLogs, SessionPublicState, TerminateAck};

use crate::actor::{ActorDeps, PathContent, SessionActor, TurnStream};
use crate::error::{Result, SessionError};
use crate::request::{validate_session_id, FilePathRequest, InitializeRequest, SendMessageRequest};

/// Entry point for the calling layer: routes each operation to the actor
/// that owns the session. Actors are created by `initialize`, by `restore`,
/// or on first access to a session the store already holds; lookups of
/// unknown ids never add one.
pub struct SessionRegistry {
    actors: RwLock<HashMap<String, Arc<SessionActor>>>,
    deps: Arc<ActorDeps>,
}

impl SessionRegistry {
    pub fn new(deps: ActorDeps) -> Self {
        Self {
            actors: RwLock::new(HashMap::new()),
            deps: Arc::new(deps),
        }
    }

    async fn insert(&self, session_id: &str) -> Arc<SessionActor> {
        let mut actors = self.actors.write().await;
        actors
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(SessionActor::new(session_id, self.deps.clone())))
            .clone()
    }

    /// The actor for a session that exists in memory or in the store.
    async fn existing(&self, session_id: &str) -> Result<Option<Arc<SessionActor>>> {
        validate_session_id(session_id)?;
        if let Some(actor) = self.actors.read().await.get(session_id) {
            return Ok(Some(actor.clone()));
        }
        if self.deps.store.load_state(session_id).await?.is_none() {
            return Ok(None);
        }
        Ok(Some(self.insert(session_id).await))
    }

    async fn actor(&self, session_id: &str) -> Result<Arc<SessionActor>> {
        self.existing(session_id)
            .await?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    #[cfg(test)]
    pub(crate) async fn actor_count(&self) -> usize {
        self.actors.read().await.len()
    }

    /// Rehydrates every stored session and settles work interrupted by a
    /// restart. Returns the number of sessions found.
    pub async fn restore(&self) -> Result<usize> {
        let ids = self.deps.store.session_ids().await?;
        for id in &ids {
            if let Err(e) = validate_session_id(id) {
                tracing::warn!("Skipping stored session {:?}: {}", id, e);
                continue;
            }
            let actor = self.insert(id).await;
            if let Err(e) = actor.recover().await {
                tracing::warn!("Session {}: recovery failed: {}", id, e);
            }
        }
        tracing::info!("Restored {} session(s)", ids.len());
        Ok(ids.len())
    }

    pub async fn initialize(
        &self,
        session_id: &str,
        owner_id: &str,
        request: InitializeRequest,
    ) -> Result<SessionPublicState> {
        if owner_id.trim().is_empty() {
            return Err(SessionError::Validation("owner id must not be empty".to_string()));
        }
        let request = request.validate()?;
        validate_session_id(session_id)?;
        self.insert(session_id)
            .await
            .initialize(owner_id, request)
            .await
    }

    pub async fn get_state(&self, session_id: &str) -> Result<SessionPublicState> {
        self.actor(session_id).await?.get_state().await
    }

    pub async fn check_ownership(&self, session_id: &str, owner_id: &str) -> Result<OwnershipCheck> {
        match self.existing(session_id).await? {
            Some(actor) => actor.check_ownership(owner_id).await,
            None => Ok(OwnershipCheck {
                exists: false,
                owned: false,
            }),
        }
    }

    /// `SESSION_NOT_FOUND` or `SESSION_NOT_OWNED` unless `owner_id` owns the
    /// session.
    pub async fn ensure_owned(&self, session_id: &str, owner_id: &str) -> Result<()> {
        let check = self.check_ownership(session_id, owner_id).await?;
        if !check.exists {
            return Err(SessionError::NotFound(session_id.to_string()));
        }
        if !check.owned {
            return Err(SessionError::NotOwned(session_id.to_string()));
        }
        Ok(())
    }

    pub async fn send_message(
        &self,
        session_id: &str,
        request: SendMessageRequest,
    ) -> Result<TurnStream> {
        let request = request.validate()?;
        self.actor(session_id).await?.send_message(request).await
    }

    pub async fn list_files(&self, session_id: &str, path: FilePathRequest) -> Result<Vec<FileInfo>> {
        let path = path.validate()?;
        self.actor(session_id).await?.list_files(&path).await
    }

    pub async fn read_file(&self, session_id: &str, path: FilePathRequest) -> Result<Vec<u8>> {
        let path = path.validate()?;
        self.actor(session_id).await?.read_file(&path).await
    }

    pub async fn browse(&self, session_id: &str, path: FilePathRequest) -> Result<PathContent> {
        let path = path.validate()?;
        self.actor(session_id).await?.browse(&path).await
    }

    pub async fn get_logs(&self, session_id: &str, tail: Option<usize>) -> Result<SandboxLogs> {
        self.actor(session_id).await?.get_logs(tail).await
    }

    pub async fn pause(&self, session_id: &str) -> Result<SessionPublicState> {
        self.actor(session_id).await?.pause().await
    }

    pub async fn terminate(&self, session_id: &str) -> Result<TerminateAck> {
        match self.existing(session_id).await? {
            Some(actor) => Ok(actor.terminate().await),
            None => Ok(TerminateAck::terminated()),
        }
    }
}
