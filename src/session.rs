use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::budget::TurnLog;
use crate::config::WindowConfig;
use crate::error::ContextError;
use crate::ledger::{ContextItem, Ledger};

/// Persists session budgets so a conversation can stop and resume with the
/// exact same accounting.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Save a checkpoint of the current session state.
    async fn checkpoint(&self, checkpoint: &SessionCheckpoint) -> Result<(), ContextError>;

    /// Load the most recent checkpoint for a session.
    async fn load(&self, session_id: &str) -> Result<Option<SessionCheckpoint>, ContextError>;
}

/// Flat, ordered record of a session's ledger plus everything needed to
/// reproduce its budget snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCheckpoint {
    pub session_id: String,
    pub items: Vec<ContextItem>,
    pub config: WindowConfig,
    pub signal_latched: bool,
    #[serde(default)]
    pub compactions: u32,
    /// Sum of item estimates at checkpoint time. Checked on restore.
    pub used_tokens: u64,
    #[serde(default)]
    pub turns: TurnLog,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl SessionCheckpoint {
    /// Validate and rebuild the ledger. A recorded total that disagrees with
    /// the items means the checkpoint can't be trusted.
    pub fn to_ledger(&self) -> Result<Ledger, ContextError> {
        self.config.validate()?;
        let ledger = Ledger::from_items(self.items.clone(), self.compactions);
        let recounted = ledger.recount();
        if recounted != self.used_tokens {
            return Err(ContextError::LedgerCorruption(format!(
                "checkpoint for {} records {} tokens but its items sum to {recounted}",
                self.session_id, self.used_tokens
            )));
        }
        Ok(ledger)
    }
}

// --- NoSessionStore ---

/// No persistence. Fire-and-forget.
pub struct NoSessionStore;

#[async_trait]
impl SessionStore for NoSessionStore {
    async fn checkpoint(&self, _: &SessionCheckpoint) -> Result<(), ContextError> {
        Ok(())
    }

    async fn load(&self, _: &str) -> Result<Option<SessionCheckpoint>, ContextError> {
        Ok(None)
    }
}

// --- FileSessionStore ---

/// Saves checkpoints to disk as JSON, one file per session.
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Session ids become file names, so they may not name another directory.
    fn path_for(&self, session_id: &str) -> Result<PathBuf, ContextError> {
        if session_id.is_empty()
            || session_id.starts_with('.')
            || session_id.contains(['/', '\\', '\0'])
        {
            return Err(ContextError::Session(format!(
                "invalid session id {session_id:?}"
            )));
        }
        Ok(self.dir.join(format!("{session_id}.json")))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn checkpoint(&self, checkpoint: &SessionCheckpoint) -> Result<(), ContextError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| ContextError::Session(e.to_string()))?;
        let path = self.path_for(&checkpoint.session_id)?;
        let json = serde_json::to_string_pretty(checkpoint)
            .map_err(|e| ContextError::Session(e.to_string()))?;
        // Write-then-rename so a crash mid-write never leaves a torn checkpoint.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| ContextError::Session(e.to_string()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| ContextError::Session(e.to_string()))?;
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<SessionCheckpoint>, ContextError> {
        match tokio::fs::read_to_string(self.path_for(session_id)?).await {
            Ok(json) => {
                let checkpoint: SessionCheckpoint = serde_json::from_str(&json)
                    .map_err(|e| ContextError::Session(e.to_string()))?;
                Ok(Some(checkpoint))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ContextError::Session(e.to_string())),
        }
    }
}
