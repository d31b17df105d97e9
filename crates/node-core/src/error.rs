//! Error taxonomy for the node lifecycle manager.
//!
//! Input/State/Integrity errors are reported verbatim with no on-disk
//! side effect; external-system errors fold into `External` and trigger
//! the orchestration engine's compensation tail.

use thiserror::Error;

/// Error kinds surfaced to callers of `eigenlayer-node`.
#[derive(Debug, Error)]
pub enum NodeError {
    // --- Input errors: no on-disk effect ---
    #[error("invalid source URL: {0}")]
    InvalidUrl(String),

    #[error("invalid version selector: {0}")]
    InvalidVersion(String),

    #[error("invalid package configuration: {}", .problems.join("; "))]
    InvalidConf { problems: Vec<String> },

    #[error("missing required option: {option}")]
    MissingRequiredOption { option: String },

    #[error("profile not found: {name}")]
    ProfileNotFound { name: String },

    #[error("package directory not found: {path}")]
    DirNotFound { path: String },

    // --- State errors: reported, no side effects ---
    #[error("instance already exists: {id}")]
    InstanceAlreadyExists { id: String },

    #[error("instance not found: {id}")]
    InstanceNotFound { id: String },

    #[error("invalid instance: {reason}")]
    InvalidInstance { reason: String },

    #[error("invalid instance directory: {id}")]
    InvalidInstanceDir { id: String },

    #[error("temp directory already exists: {id}")]
    TempDirAlreadyExists { id: String },

    #[error("duplicate instance: {id}")]
    DuplicateInstance { id: String },

    #[error("no such monitoring endpoint: {endpoint}")]
    NonexistingEndpoint { endpoint: String },

    #[error("refusing to update: installed version {current} is newer than requested {requested}")]
    OldVersionRefused { current: String, requested: String },

    #[error("locker for {path} is not locked")]
    NotLocked { path: String },

    // --- Integrity errors: any staged temp artifacts removed ---
    #[error("checksum mismatch for {path}")]
    InvalidChecksum { path: String },

    #[error("invalid backup identifier: {name}")]
    InvalidBackupName { name: String },

    #[error("repository is private or missing: {url}")]
    RepoPrivateOrMissing { url: String },

    #[error("repository not found: {url}")]
    RepoNotFound { url: String },

    #[error("no versions found matching the tag pattern")]
    NoVersions,

    #[error("monitoring config reload failed with status {status}")]
    ReloadFailed { status: u16 },

    // --- External-system errors: wrapped with operation context ---
    #[error(transparent)]
    External(#[from] anyhow::Error),
}

impl NodeError {
    /// True for errors that never touch disk (Input/State/Integrity);
    /// false for `External`, which requires the engine's compensation tail.
    pub fn is_side_effect_free(&self) -> bool {
        !matches!(self, NodeError::External(_))
    }
}

pub type Result<T> = std::result::Result<T, NodeError>;
