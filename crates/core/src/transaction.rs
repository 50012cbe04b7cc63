use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cache::FileStateCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Pending,
    Committed,
    RolledBack,
}

/// Snapshot of a file taken before a mutating tool touched it. Enough to
/// restore the previous content, or to remove a file that did not exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreState {
    pub path: PathBuf,
    pub existed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<u8>>,
    pub hash: String,
}

impl PreState {
    pub fn capture(path: &Path) -> Self {
        match std::fs::read(path) {
            Ok(content) => {
                let hash = hex::encode(Sha256::digest(&content));
                Self {
                    path: path.to_path_buf(),
                    existed: true,
                    content: Some(content),
                    hash,
                }
            }
            Err(_) => Self {
                path: path.to_path_buf(),
                existed: false,
                content: None,
                hash: String::new(),
            },
        }
    }
}

/// One recorded tool invocation inside a transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxAction {
    pub tool: String,
    pub args: serde_json::Value,
    pub result_summary: String,
    #[serde(default)]
    pub pre_states: Vec<PreState>,
    /// Shell commands and other effects that cannot be undone set this
    /// false; rollback logs them and keeps going.
    pub reversible: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub tx_id: String,
    pub task_id: String,
    pub actions: Vec<TxAction>,
    pub status: TxStatus,
}

impl Transaction {
    pub fn begin(task_id: impl Into<String>) -> Self {
        Self {
            tx_id: format!("tx_{}", uuid::Uuid::new_v4().simple()),
            task_id: task_id.into(),
            actions: Vec::new(),
            status: TxStatus::Pending,
        }
    }

    pub fn record(&mut self, action: TxAction) {
        self.actions.push(action);
    }

    pub fn commit(&mut self) {
        self.status = TxStatus::Committed;
    }

    /// Replay pre-states in reverse order. Irreversible actions produce a
    /// warning, never an abort. Restored paths are invalidated in the
    /// file cache so later reads observe the rolled-back content.
    pub fn rollback(&mut self, cache: &FileStateCache) {
        for action in self.actions.iter().rev() {
            if !action.reversible {
                tracing::warn!(
                    tool = %action.tool,
                    "action cannot be rolled back; skipping"
                );
                continue;
            }
            for pre in action.pre_states.iter().rev() {
                let result = if pre.existed {
                    match &pre.content {
                        Some(content) => {
                            if let Some(parent) = pre.path.parent() {
                                let _ = std::fs::create_dir_all(parent);
                            }
                            std::fs::write(&pre.path, content)
                        }
                        None => Ok(()),
                    }
                } else {
                    match std::fs::remove_file(&pre.path) {
                        Ok(()) => Ok(()),
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                        Err(e) => Err(e),
                    }
                };
                if let Err(e) = result {
                    tracing::warn!(path = %pre.path.display(), "rollback write failed: {e}");
                }
                cache.invalidate(&pre.path);
            }
        }
        self.status = TxStatus::RolledBack;
    }
}
