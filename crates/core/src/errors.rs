//! Error types for the wikisync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use std::time::Duration;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Local(#[from] LocalError),

    #[error(transparent)]
    Convert(#[from] ConvertError),

    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A required environment variable is not set.
    #[error("required environment variable '{var}' is not set (referenced by config field '{field}')")]
    EnvVarMissing { var: String, field: String },

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// `--force-push` and `--force-pull` were both requested.
    #[error("--force-push and --force-pull are mutually exclusive")]
    ConflictingModes,

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Page state errors
// ---------------------------------------------------------------------------

/// Errors from the persisted page state.
#[derive(Debug, Error)]
pub enum StateError {
    /// The state file exists but cannot be decoded.
    #[error("state file '{path}' is corrupt: {detail}")]
    Corrupt { path: String, detail: String },

    /// An upsert tried to move a page's remote version backwards.
    #[error("remote version of page {page_id} would regress from {current} to {attempted}")]
    VersionRegression {
        page_id: String,
        current: u64,
        attempted: u64,
    },

    /// The state could not be serialized.
    #[error("state serialization failed: {0}")]
    Serialize(String),

    /// Generic I/O error (permissions, disk full, failed rename).
    #[error("state I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Remote store errors
// ---------------------------------------------------------------------------

/// Errors from the remote wiki store.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The page does not exist (or is no longer visible).
    #[error("remote page not found: {page_id}")]
    NotFound { page_id: String },

    /// Credentials were rejected.
    #[error("remote authentication failed: {0}")]
    Unauthorized(String),

    /// The remote could not be reached.
    #[error("remote unreachable: {0}")]
    Unreachable(String),

    /// The remote asked us to slow down.
    #[error("remote rate limit exceeded (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// An optimistic-concurrency write lost the race.
    #[error("version conflict on page {page_id}: submitted against {expected}, remote is at {actual:?}")]
    VersionConflict {
        page_id: String,
        expected: u64,
        actual: Option<u64>,
    },

    /// The API returned an unexpected status code.
    #[error("remote API error (HTTP {status}): {body}")]
    Api { status: u16, body: String },

    /// The API response could not be decoded.
    #[error("remote response parse error: {0}")]
    Parse(String),

    /// The retry policy gave up.
    #[error("remote call '{operation}' failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last: String,
    },
}

impl RemoteError {
    /// `true` for errors that end the whole run (credentials, connectivity).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Unauthorized(_) | Self::Unreachable(_) | Self::RetriesExhausted { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

// ---------------------------------------------------------------------------
// Local tree errors
// ---------------------------------------------------------------------------

/// Errors from the local mirror tree.
#[derive(Debug, Error)]
pub enum LocalError {
    /// The front-matter header of a page file is malformed.
    #[error("malformed page header in '{path}': {detail}")]
    BadHeader { path: String, detail: String },

    /// The path escapes the sync root.
    #[error("path '{0}' is outside the sync root")]
    OutsideRoot(String),

    /// Generic I/O error.
    #[error("local I/O error at '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl LocalError {
    pub(crate) fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// Converter errors
// ---------------------------------------------------------------------------

/// Errors from the storage-format converter.
#[derive(Debug, Error)]
pub enum ConvertError {
    /// An element was opened but never closed.
    #[error("unclosed <{tag}> element at byte {offset}")]
    Unclosed { tag: String, offset: usize },

    /// The markup could not be tokenised.
    #[error("malformed markup at byte {offset}: {detail}")]
    Malformed { offset: usize, detail: String },
}

// ---------------------------------------------------------------------------
// Patch errors
// ---------------------------------------------------------------------------

/// Errors from the document patch planner/applier.
#[derive(Debug, Error)]
pub enum PatchError {
    /// A locator no longer matches the base document.
    #[error("locator for block {index} does not match the base document")]
    LocatorMismatch { index: usize },

    /// An operation targeted an opaque block.
    #[error("operation targets opaque block {id}")]
    OpaqueTarget { id: String },

    /// An operation targeted a block of the wrong kind.
    #[error("operation {op} cannot target a {kind} block")]
    WrongBlockKind { op: &'static str, kind: &'static str },

    /// A table row or cell index is out of range.
    #[error("table position out of range: row {row}, column {column:?}")]
    OutOfRange { row: usize, column: Option<usize> },

    /// The remote store rejected or failed the submission.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Convert(#[from] ConvertError),
}

// ---------------------------------------------------------------------------
// Sync orchestrator errors
// ---------------------------------------------------------------------------

/// Run-level errors from the sync orchestrator.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Bad, missing or corrupt configuration or state.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Credentials rejected.
    #[error("authentication error: {0}")]
    Auth(String),

    /// Remote unreachable or retry budget exhausted.
    #[error("network error: {0}")]
    Network(String),

    /// Persisted state could not be read or written.
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// Local tree could not be scanned or written.
    #[error("local tree error: {0}")]
    Local(#[from] LocalError),

    /// Another cycle holds the engine.
    #[error("sync already in progress (started at {started_at})")]
    AlreadyRunning { started_at: String },

    /// A worker task failed to complete.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Auth(_) => 3,
            Self::Network(_) => 4,
            _ => 1,
        }
    }
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Unauthorized(detail) => Self::Auth(detail),
            RemoteError::Unreachable(_) | RemoteError::RetriesExhausted { .. } => {
                Self::Network(err.to_string())
            }
            other => Self::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = RemoteError::NotFound {
            page_id: "42".into(),
        };
        assert_eq!(err.to_string(), "remote page not found: 42");

        let err = ConfigError::EnvVarMissing {
            var: "WIKISYNC_TOKEN".into(),
            field: "remote.token_env".into(),
        };
        assert!(err.to_string().contains("WIKISYNC_TOKEN"));

        let err = RemoteError::RateLimited { retry_after: None };
        assert!(err.to_string().contains("rate limit"));
    }

    #[test]
    fn test_remote_errors_map_to_run_errors() {
        let err: SyncError = RemoteError::Unauthorized("bad token".into()).into();
        assert!(matches!(err, SyncError::Auth(_)));
        assert_eq!(err.exit_code(), 3);

        let err: SyncError = RemoteError::Unreachable("connection refused".into()).into();
        assert_eq!(err.exit_code(), 4);

        let err: SyncError = RemoteError::RetriesExhausted {
            operation: "fetch".into(),
            attempts: 5,
            last: "429".into(),
        }
        .into();
        assert_eq!(err.exit_code(), 4);

        let err: SyncError = ConfigError::ConflictingModes.into();
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_fatal_classification() {
        assert!(RemoteError::Unauthorized("x".into()).is_fatal());
        assert!(!RemoteError::NotFound { page_id: "1".into() }.is_fatal());
        assert!(!RemoteError::VersionConflict {
            page_id: "1".into(),
            expected: 1,
            actual: Some(2)
        }
        .is_fatal());
    }

    #[test]
    fn test_core_error_from_subsystem() {
        let core: CoreError = StateError::Serialize("x".into()).into();
        assert!(matches!(core, CoreError::State(_)));
    }
}
