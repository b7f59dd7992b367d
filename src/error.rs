#![forbid(unsafe_code)]

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentqError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("task store busy after {attempts} attempts")]
    StoreBusy { attempts: u32 },

    #[error("workspace conflict at {path}: {reason}")]
    WorkspaceConflict { path: PathBuf, reason: String },

    #[error("git operation failed: {0}")]
    GitOperation(String),

    #[error("git is required but was not found in PATH")]
    GitNotFound,

    #[error("not inside a git repository")]
    NotInGitRepo,

    #[error("provider process error: {0}")]
    ProviderProcess(String),

    #[error("unknown provider '{0}'")]
    UnknownProvider(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("timed out waiting for lock {0}")]
    LockTimeout(PathBuf),

    #[error("io error at {path}: {source}")]
    IoPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AgentqError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoPath {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = AgentqError> = std::result::Result<T, E>;
