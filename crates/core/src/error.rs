//! Error taxonomy for the BuildStream core.
//!
//! Errors are grouped by domain. Every variant carries a human-readable brief
//! (the `Display` impl), an optional multi-line detail, and a stable
//! machine-readable reason token surfaced through [`reason()`]. The scheduler
//! uses [`is_temporary()`] to decide whether a failed job may be retried.
//!
//! [`reason()`]: CasError::reason
//! [`is_temporary()`]: CasError::is_temporary

use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the content-addressable store.
#[derive(Debug, Error, Diagnostic)]
pub enum CasError {
    /// A referenced object or ref does not exist in the store.
    #[error("Object not found: {name}")]
    #[diagnostic(code(cas::not_found))]
    NotFound { name: String },

    /// Stored bytes do not match their digest, or a Directory message
    /// failed to decode.
    #[error("Corrupt object in CAS: {name}")]
    #[diagnostic(
        code(cas::corrupt),
        help("The object can be removed and re-fetched from a remote")
    )]
    Corrupt { name: String, detail: String },

    /// The store root or one of its entries is not accessible.
    #[error("Permission denied accessing CAS: {path}")]
    #[diagnostic(code(cas::perm_denied))]
    PermDenied { path: PathBuf },

    /// An I/O operation on the store failed.
    #[error("CAS I/O error during {operation}")]
    #[diagnostic(code(cas::io))]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },
}

impl CasError {
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    pub fn corrupt(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Corrupt {
            name: name.into(),
            detail: detail.into(),
        }
    }

    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Stable reason token, used in user messages and asserted by tests.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not-found",
            Self::Corrupt { .. } => "corrupt",
            Self::PermDenied { .. } => "perm-denied",
            Self::Io { .. } => "io",
        }
    }

    /// Whether a retry may reasonably succeed.
    pub fn is_temporary(&self) -> bool {
        matches!(self, Self::Io { .. })
    }
}

/// Errors raised by the artifact cache layer.
#[derive(Debug, Error, Diagnostic)]
pub enum ArtifactError {
    /// Eviction ran out of removable refs while still over quota.
    #[error("Cache too full. Aborting.")]
    #[diagnostic(
        code(artifact::cache_too_full),
        help("Increase the cache quota or free disk space")
    )]
    CacheTooFull { detail: String },

    /// A remote could not be reached or answered with a transport error.
    #[error("Remote artifact cache unavailable: {url}")]
    #[diagnostic(code(artifact::remote_unavailable))]
    RemoteUnavailable { url: String, detail: String },

    /// The remote refused an update because pushing is disabled.
    #[error("Push forbidden by remote: {url}")]
    #[diagnostic(code(artifact::push_forbidden))]
    PushForbidden { url: String },

    /// The configured quota cannot be satisfied by the cache volume.
    #[error("Insufficient storage for cache quota: {message}")]
    #[diagnostic(
        code(artifact::insufficient_storage_for_quota),
        help("Lower the configured quota or make more disk space available")
    )]
    InsufficientStorageForQuota { message: String },

    /// An underlying CAS failure, propagated with its own reason.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Cas(#[from] CasError),
}

impl ArtifactError {
    pub fn remote_unavailable(url: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::RemoteUnavailable {
            url: url.into(),
            detail: detail.into(),
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::CacheTooFull { .. } => "cache-too-full",
            Self::RemoteUnavailable { .. } => "remote-unavailable",
            Self::PushForbidden { .. } => "push-forbidden",
            Self::InsufficientStorageForQuota { .. } => "insufficient-storage-for-quota",
            Self::Cas(e) => e.reason(),
        }
    }

    pub fn is_temporary(&self) -> bool {
        match self {
            Self::RemoteUnavailable { .. } => true,
            Self::Cas(e) => e.is_temporary(),
            _ => false,
        }
    }

    /// Multi-line detail for the frontend, where one exists.
    pub fn detail(&self) -> Option<&str> {
        match self {
            Self::CacheTooFull { detail } | Self::RemoteUnavailable { detail, .. } => {
                Some(detail.as_str())
            }
            _ => None,
        }
    }
}

/// Errors raised while loading the element graph.
#[derive(Debug, Error, Diagnostic)]
pub enum LoadError {
    #[error("{message}")]
    #[diagnostic(code(load::missing_file))]
    MissingFile {
        message: String,
        detail: Option<String>,
    },

    #[error("{message}")]
    #[diagnostic(code(load::invalid_yaml))]
    InvalidYaml { message: String },

    #[error("{message}")]
    #[diagnostic(code(load::invalid_data))]
    InvalidData { message: String },

    #[error("{message}")]
    #[diagnostic(code(load::illegal_composite))]
    IllegalComposite { message: String },

    #[error("Circular dependency detected at element: {element}\nDependency chain: {chain}")]
    #[diagnostic(code(load::circular_dependency))]
    CircularDependency { element: String, chain: String },

    #[error("Conflicting junction {junction} in subprojects, define junction in {project}")]
    #[diagnostic(code(load::conflicting_junction))]
    ConflictingJunction { junction: String, project: String },

    #[error("Subproject fetch needed for junction: {junction}")]
    #[diagnostic(
        code(load::subproject_fetch_needed),
        help("Fetch the junction sources before loading")
    )]
    SubprojectFetchNeeded { junction: String },

    #[error("Subproject has no ref for junction: {junction}")]
    #[diagnostic(code(load::subproject_inconsistent))]
    SubprojectInconsistent { junction: String },
}

impl LoadError {
    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::MissingFile { .. } => "missing-file",
            Self::InvalidYaml { .. } => "invalid-yaml",
            Self::InvalidData { .. } => "invalid-data",
            Self::IllegalComposite { .. } => "illegal-composite",
            Self::CircularDependency { .. } => "circular-dependency",
            Self::ConflictingJunction { .. } => "conflicting-junction",
            Self::SubprojectFetchNeeded { .. } => "subproject-fetch-needed",
            Self::SubprojectInconsistent { .. } => "subproject-inconsistent",
        }
    }

    /// Load errors always halt the pipeline.
    pub fn is_temporary(&self) -> bool {
        false
    }
}

/// Errors raised around sandboxed command execution.
#[derive(Debug, Error, Diagnostic)]
pub enum SandboxError {
    #[error("Missing command: {command}")]
    #[diagnostic(code(sandbox::missing_command))]
    MissingCommand { command: String },

    #[error("Command failed with exit status {exit_code}: {command}")]
    #[diagnostic(code(sandbox::command_failed))]
    CommandFailed { command: String, exit_code: i32 },
}

impl SandboxError {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MissingCommand { .. } => "missing-command",
            Self::CommandFailed { .. } => "command-failed",
        }
    }
}

/// Errors raised by element and source plugins.
#[derive(Debug, Error, Diagnostic)]
pub enum PluginError {
    /// A plugin failed to implement a mandatory method.
    #[error("{message}")]
    #[diagnostic(code(plugin::impl_error))]
    ImplError { message: String },

    #[error("Plugin '{plugin}' requires format version {required}, project provides {provided}")]
    #[diagnostic(code(plugin::version_mismatch))]
    VersionMismatch {
        plugin: String,
        required: u32,
        provided: u32,
    },
}

impl PluginError {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::ImplError { .. } => "impl-error",
            Self::VersionMismatch { .. } => "version-mismatch",
        }
    }
}
