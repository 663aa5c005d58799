use thiserror::Error;

use crate::model::Revision;

/// Every failure the engine reports, one variant per failure kind.
///
/// Domain errors propagate to the caller verbatim; infrastructure failures
/// are logged where they arise and folded into [`Error::Storage`]. The enum
/// is `Clone` so a single shared computation (a cached read, a watch) can
/// deliver its failure to every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Revision {0} not found")]
    RevisionNotFound(Revision),
    #[error("Entry not found: {path} (revision {revision})")]
    EntryNotFound { revision: Revision, path: String },
    #[error("Project exists: {0}")]
    ProjectExists(String),
    #[error("Project not found: {0}")]
    ProjectNotFound(String),
    #[error("Repository exists: {0}")]
    RepositoryExists(String),
    #[error("Repository not found: {0}")]
    RepositoryNotFound(String),
    #[error("Change conflict: {0}")]
    ChangeConflict(String),
    #[error("Changes did not change anything")]
    RedundantChange,
    #[error("Query type mismatch: {0}")]
    QueryTypeMismatch(String),
    #[error("Invalid query: {0}")]
    QuerySyntax(String),
    #[error("Server is not writable")]
    ReadOnly,
    #[error("Operation not allowed on repository: {0}")]
    RepositoryNotAllowed(String),
    #[error("Mirror failed: {0}")]
    Mirror(String),
    #[error("Mirror access denied: {0}")]
    MirrorAccessDenied(String),
    #[error("Token not found: {0}")]
    TokenNotFound(String),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Invalid parameter: {0}")]
    InvalidParams(&'static str),
    #[error("Storage failure: {0}")]
    Storage(String),
}

impl Error {
    pub(crate) fn entry_not_found(revision: Revision, path: &str) -> Error {
        Error::EntryNotFound {
            revision,
            path: path.to_string(),
        }
    }

    pub(crate) fn conflict(msg: impl Into<String>) -> Error {
        Error::ChangeConflict(msg.into())
    }
}

// The wrapped error types are not `Clone`, so only their rendered message is
// carried.
impl From<git2::Error> for Error {
    fn from(e: git2::Error) -> Self {
        Error::Storage(format!("git: {}", e.message()))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(format!("io: {}", e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Storage(format!("json: {}", e))
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            Error::Cancelled
        } else {
            Error::Storage(format!("worker: {}", e))
        }
    }
}
