//! Durable per-session storage: state, secrets, owner and the message log.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use skiff_types::{Message, Session, SessionConfig};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load_state(&self, session_id: &str) -> StoreResult<Option<Session>>;
    async fn save_state(&self, session: &Session) -> StoreResult<()>;

    async fn load_config(&self, session_id: &str) -> StoreResult<Option<SessionConfig>>;
    async fn save_config(&self, session_id: &str, config: &SessionConfig) -> StoreResult<()>;

    async fn load_owner(&self, session_id: &str) -> StoreResult<Option<String>>;
    async fn save_owner(&self, session_id: &str, owner_id: &str) -> StoreResult<()>;

    /// Rows are never rewritten once appended.
    async fn append_message(&self, session_id: &str, message: &Message) -> StoreResult<()>;
    async fn messages(&self, session_id: &str) -> StoreResult<Vec<Message>>;

    /// Removes every record of the session. Deleting an unknown session is
    /// not an error.
    async fn delete(&self, session_id: &str) -> StoreResult<()>;

    async fn session_ids(&self) -> StoreResult<Vec<String>>;
}

#[derive(Default, Clone)]
struct MemoryRecord {
    state: Option<Session>,
    config: Option<SessionConfig>,
    owner: Option<String>,
    messages: Vec<Message>,
}

#[derive(Default)]
pub struct MemorySessionStore {
    records: RwLock<HashMap<String, MemoryRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load_state(&self, session_id: &str) -> StoreResult<Option<Session>> {
        Ok(self
            .records
            .read()
            .await
            .get(session_id)
            .and_then(|r| r.state.clone()))
    }

    async fn save_state(&self, session: &Session) -> StoreResult<()> {
        self.records
            .write()
            .await
            .entry(session.id.clone())
            .or_default()
            .state = Some(session.clone());
        Ok(())
    }

    async fn load_config(&self, session_id: &str) -> StoreResult<Option<SessionConfig>> {
        Ok(self
            .records
            .read()
            .await
            .get(session_id)
            .and_then(|r| r.config.clone()))
    }

    async fn save_config(&self, session_id: &str, config: &SessionConfig) -> StoreResult<()> {
        self.records
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .config = Some(config.clone());
        Ok(())
    }

    async fn load_owner(&self, session_id: &str) -> StoreResult<Option<String>> {
        Ok(self
            .records
            .read()
            .await
            .get(session_id)
            .and_then(|r| r.owner.clone()))
    }

    async fn save_owner(&self, session_id: &str, owner_id: &str) -> StoreResult<()> {
        self.records
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .owner = Some(owner_id.to_string());
        Ok(())
    }

    async fn append_message(&self, session_id: &str, message: &Message) -> StoreResult<()> {
        self.records
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .messages
            .push(message.clone());
        Ok(())
    }

    async fn messages(&self, session_id: &str) -> StoreResult<Vec<Message>> {
        Ok(self
            .records
            .read()
            .await
            .get(session_id)
            .map(|r| r.messages.clone())
            .unwrap_or_default())
    }

    async fn delete(&self, session_id: &str) -> StoreResult<()> {
        self.records.write().await.remove(session_id);
        Ok(())
    }

    async fn session_ids(&self) -> StoreResult<Vec<String>> {
        let records = self.records.read().await;
        let mut ids: Vec<String> = records
            .iter()
            .filter(|(_, r)| r.state.is_some())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

/// One directory per session:
/// `state.json`, `config.json`, `owner`, `messages.jsonl`.
pub struct FileSessionStore {
    root: PathBuf,
}

impl FileSessionStore {
    pub async fn new(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
        match fs::read_to_string(path).await {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_json<T: serde::Serialize>(
        &self,
        session_id: &str,
        file: &str,
        value: &T,
    ) -> StoreResult<()> {
        let dir = self.session_dir(session_id);
        fs::create_dir_all(&dir).await?;
        let raw = serde_json::to_string_pretty(value)?;
        atomic_write(&dir.join(file), raw.as_bytes()).await
    }
}

/// Temp file plus rename, so readers never observe a partial document.
async fn atomic_write(path: &Path, content: &[u8]) -> StoreResult<()> {
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, content).await?;
    fs::rename(&temp_path, path).await?;
    Ok(())
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load_state(&self, session_id: &str) -> StoreResult<Option<Session>> {
        Self::read_json(&self.session_dir(session_id).join("state.json")).await
    }

    async fn save_state(&self, session: &Session) -> StoreResult<()> {
        self.write_json(&session.id, "state.json", session).await
    }

    async fn load_config(&self, session_id: &str) -> StoreResult<Option<SessionConfig>> {
        Self::read_json(&self.session_dir(session_id).join("config.json")).await
    }

    async fn save_config(&self, session_id: &str, config: &SessionConfig) -> StoreResult<()> {
        self.write_json(session_id, "config.json", config).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let path = self.session_dir(session_id).join("config.json");
            fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
        }
        Ok(())
    }

    async fn load_owner(&self, session_id: &str) -> StoreResult<Option<String>> {
        match fs::read_to_string(self.session_dir(session_id).join("owner")).await {
            Ok(raw) => Ok(Some(raw.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_owner(&self, session_id: &str, owner_id: &str) -> StoreResult<()> {
        let dir = self.session_dir(session_id);
        fs::create_dir_all(&dir).await?;
        atomic_write(&dir.join("owner"), owner_id.as_bytes()).await
    }

    async fn append_message(&self, session_id: &str, message: &Message) -> StoreResult<()> {
        let dir = self.session_dir(session_id);
        fs::create_dir_all(&dir).await?;
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("messages.jsonl"))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn messages(&self, session_id: &str) -> StoreResult<Vec<Message>> {
        let path = self.session_dir(session_id).join("messages.jsonl");
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut messages = Vec::new();
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str(line) {
                Ok(message) => messages.push(message),
                Err(e) => tracing::warn!("Skipping unreadable message row in {:?}: {}", path, e),
            }
        }
        Ok(messages)
    }

    async fn delete(&self, session_id: &str) -> StoreResult<()> {
        match fs::remove_dir_all(self.session_dir(session_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn session_ids(&self) -> StoreResult<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.path().join("state.json").exists() {
                if let Some(name) = entry.file_name().to_str() {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}
