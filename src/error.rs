//! Centralized error types for the orchestration core
//!
//! Uses thiserror for typed errors that can be matched on,
//! while still being compatible with anyhow for propagation.
//!
//! The variants map to distinct response semantics: validation errors are
//! rejected before any work happens, not-found is idempotent for deletes,
//! security blocks are terminal and never retried, and data-integrity
//! failures abort hibernation without touching live resources.

use thiserror::Error;

/// Top-level error type for orchestrator operations
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("security block: {0}")]
    Security(#[from] SecurityError),

    #[error("archive store error: {0}")]
    Storage(#[from] StorageError),

    #[error("kubernetes error: {0}")]
    Kubernetes(#[from] kube::Error),

    #[error("compose error: {0}")]
    Compose(#[from] ComposeError),

    #[error("git error: {0}")]
    Git(#[from] GitError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Hibernation upload did not verify; live resources were left in place.
    #[error("data integrity: {0}")]
    DataIntegrity(String),

    #[error("timed out after {0}s")]
    Timeout(u64),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    /// Not-found errors are treated as success by delete paths.
    pub fn is_not_found(&self) -> bool {
        matches!(self, OrchestratorError::NotFound { .. })
    }
}

/// Startup-command and shell-command validation failures.
///
/// These are hard failures: the offending command is never executed,
/// never retried, and never partially substituted.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SecurityError {
    #[error("command contains dangerous pattern: {0}")]
    DangerousPattern(String),

    #[error("command '{0}' is not in the safe command whitelist")]
    NotWhitelisted(String),

    #[error("command '{0}' is explicitly blocked")]
    Blocked(String),

    #[error("command is too long ({length} chars, max {max})")]
    TooLong { length: usize, max: usize },

    #[error("command has too many arguments (max {max})")]
    TooManyArgs { max: usize },

    #[error("empty command")]
    Empty,

    #[error("failed to parse command: {0}")]
    Unparseable(String),
}

/// Object-store errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("bucket '{bucket}' does not exist; create it first")]
    BucketMissing { bucket: String },

    #[error("access denied to bucket '{bucket}'; check credentials")]
    AccessDenied { bucket: String },

    #[error("archive not found: {key}")]
    ArchiveNotFound { key: String },

    #[error("upload failed for {key}: {message}")]
    UploadFailed { key: String, message: String },

    #[error("download failed for {key}: {message}")]
    DownloadFailed { key: String, message: String },

    #[error("object store request failed: {0}")]
    Request(String),
}

/// Docker Compose invocation errors
#[derive(Error, Debug)]
pub enum ComposeError {
    #[error("docker compose {action} failed: {stderr}")]
    CommandFailed { action: String, stderr: String },

    #[error("compose file not found for project {slug}")]
    FileMissing { slug: String },

    #[error("failed to render compose file: {0}")]
    Render(String),
}

/// Git operation errors
#[derive(Error, Debug)]
pub enum GitError {
    #[error("git clone of {url} failed: {stderr}")]
    CloneFailed { url: String, stderr: String },

    #[error("invalid repository URL: {0}")]
    InvalidUrl(String),

    #[error("git command failed: {0}")]
    CommandFailed(String),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("required configuration missing: {field}")]
    MissingField { field: String },

    #[error("invalid configuration value for {field}: {value}")]
    InvalidValue { field: String, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_error_display() {
        let err = SecurityError::NotWhitelisted("gcc".to_string());
        assert!(err.to_string().contains("whitelist"));
    }

    #[test]
    fn test_error_conversion() {
        let sec = SecurityError::Empty;
        let top: OrchestratorError = sec.into();
        assert!(matches!(top, OrchestratorError::Security(_)));
    }

    #[test]
    fn test_not_found_is_idempotent_marker() {
        let err = OrchestratorError::NotFound {
            kind: "namespace",
            name: "proj-123".to_string(),
        };
        assert!(err.is_not_found());
        assert!(!OrchestratorError::Timeout(30).is_not_found());
    }

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::BucketMissing {
            bucket: "tesslate-projects".to_string(),
        };
        assert!(err.to_string().contains("does not exist"));
    }
}
