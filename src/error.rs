//! Custom error types for steward.
//!
//! The variants follow the failure taxonomy of the runtime: input and
//! configuration errors, policy violations, patch conflicts, transient
//! operational errors and fix-loop defects. Conflicts and unfixable issues are
//! normally reported by value (`PatchOutcome`, `FixOutcome`); the variants here
//! are what callers see once such a result has to abort the enclosing work.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for steward operations
#[derive(Error, Debug)]
pub enum StewardError {
    // =========================================================================
    // Input / Configuration Errors
    // =========================================================================
    /// Failed to load configuration
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    /// A required artifact (snapshot, checkpoint, report) does not exist
    #[error("Not found: {path}")]
    MissingArtifact { path: PathBuf },

    /// An artifact exists but cannot be decoded
    #[error("Malformed artifact {path}: {message}")]
    MalformedArtifact { path: PathBuf, message: String },

    // =========================================================================
    // Policy Errors
    // =========================================================================
    /// A target path escapes the worktree or the allow-list
    #[error("Policy violation for {path}: {reason}")]
    PolicyViolation { path: String, reason: String },

    // =========================================================================
    // Patch Errors
    // =========================================================================
    /// A patch could not be applied against the current target state
    #[error("Patch conflict on {path} ({patch_id}): {reason}")]
    PatchConflict {
        patch_id: String,
        path: String,
        reason: String,
    },

    // =========================================================================
    // Operational Errors
    // =========================================================================
    /// A transient failure reported by a worker (connectivity, locks, ...)
    #[error("Transient failure: {message}")]
    Transient { message: String },

    // =========================================================================
    // Fix Loop Errors
    // =========================================================================
    /// A requested issue id is not part of the validation report
    #[error("Issue not found: {issue_id}")]
    IssueNotFound { issue_id: String },

    /// A fix strategy reported success but no file content changed
    #[error("Fix for issue {issue_id} reported success but changed nothing")]
    NoOpFix {
        issue_id: String,
        claimed_files: Vec<PathBuf>,
    },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// YAML error wrapper
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    /// TOML error wrapper
    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StewardError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            path: None,
        }
    }

    /// Create a configuration error with path
    pub fn config_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Config {
            message: message.into(),
            path: Some(path),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a missing artifact error
    pub fn missing(path: impl Into<PathBuf>) -> Self {
        Self::MissingArtifact { path: path.into() }
    }

    /// Create a malformed artifact error
    pub fn malformed(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::MalformedArtifact {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a policy violation error
    pub fn policy(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PolicyViolation {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a transient error
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    // =========================================================================
    // Classification helpers
    // =========================================================================

    /// Stable snake_case name of the error kind, used in failure events.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::InvalidConfig { .. } => "invalid_config",
            Self::MissingArtifact { .. } => "missing_artifact",
            Self::MalformedArtifact { .. } => "malformed_artifact",
            Self::PolicyViolation { .. } => "policy_violation",
            Self::PatchConflict { .. } => "patch_conflict",
            Self::Transient { .. } => "transient",
            Self::IssueNotFound { .. } => "issue_not_found",
            Self::NoOpFix { .. } => "no_op_fix",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Yaml(_) => "yaml",
            Self::Toml(_) => "toml",
            Self::Other(_) => "other",
        }
    }

    /// Check if retrying the failed operation can never help
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::Config { .. }
                | Self::InvalidConfig { .. }
                | Self::MissingArtifact { .. }
                | Self::MalformedArtifact { .. }
                | Self::PolicyViolation { .. }
                | Self::PatchConflict { .. }
                | Self::IssueNotFound { .. }
                | Self::NoOpFix { .. }
                | Self::Json(_)
                | Self::Yaml(_)
                | Self::Toml(_)
        )
    }

    /// Get error code for exit status
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::PolicyViolation { .. } => 2,
            Self::PatchConflict { .. } => 3,
            Self::NoOpFix { .. } => 4,
            Self::MissingArtifact { .. } | Self::IssueNotFound { .. } => 6,
            Self::Config { .. } | Self::InvalidConfig { .. } => 7,
            _ => 1,
        }
    }
}

/// Type alias for steward results
pub type Result<T> = std::result::Result<T, StewardError>;
