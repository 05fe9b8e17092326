//! Error types for remote CAS replication

use buildstream_core::{ArtifactError, CasError};
use miette::Diagnostic;
use thiserror::Error;

/// Result type alias for remote operations
pub type Result<T> = std::result::Result<T, RemoteError>;

/// Errors that can occur while talking to a remote CAS server
#[derive(Debug, Error, Diagnostic)]
pub enum RemoteError {
    /// Failed to connect to the remote server
    #[error("Failed to connect to remote cache at {endpoint}: {message}")]
    #[diagnostic(
        code(remote::connection_failed),
        help("Check that the URL is correct and the server is running")
    )]
    ConnectionFailed { endpoint: String, message: String },

    /// gRPC call failed
    #[error("gRPC call failed: {operation}")]
    #[diagnostic(code(remote::grpc_error))]
    GrpcError {
        operation: String,
        #[source]
        source: tonic::Status,
    },

    /// The remote refused an upload because pushing is disabled
    #[error("Push forbidden by remote: {url}")]
    #[diagnostic(code(remote::push_forbidden))]
    PushForbidden { url: String },

    /// A blob arrived with content that does not match its digest
    #[error("Blob integrity check failed for {digest}")]
    #[diagnostic(code(remote::invalid_blob))]
    InvalidBlob { digest: String },

    /// A ByteStream upload stopped short of the declared size
    #[error("Upload of {digest} incomplete: committed {committed} of {expected} bytes")]
    #[diagnostic(code(remote::incomplete_write))]
    IncompleteWrite {
        digest: String,
        expected: i64,
        committed: i64,
    },

    /// Operation still failing after the configured retry attempts
    #[error("Operation failed after {attempts} attempts: {operation}")]
    #[diagnostic(code(remote::retry_exhausted))]
    RetryExhausted { operation: String, attempts: usize },

    /// Invalid remote configuration
    #[error("Remote configuration error: {0}")]
    #[diagnostic(code(remote::config_error))]
    ConfigError(String),

    /// I/O error while staging blobs
    #[error("I/O error: {operation}")]
    #[diagnostic(code(remote::io_error))]
    IoError {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Local store failure during replication
    #[error(transparent)]
    #[diagnostic(transparent)]
    Cas(#[from] CasError),
}

impl RemoteError {
    pub fn connection_failed(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    pub fn grpc_error(operation: impl Into<String>, source: tonic::Status) -> Self {
        Self::GrpcError {
            operation: operation.into(),
            source,
        }
    }

    pub fn io_error(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::IoError {
            operation: operation.into(),
            source,
        }
    }

    /// Whether a retry may reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionFailed { .. } | Self::IoError { .. } => true,
            Self::GrpcError { source, .. } => matches!(
                source.code(),
                tonic::Code::Unavailable
                    | tonic::Code::ResourceExhausted
                    | tonic::Code::DeadlineExceeded
                    | tonic::Code::Aborted
                    | tonic::Code::Internal
                    | tonic::Code::Unknown
            ),
            Self::Cas(e) => e.is_temporary(),
            _ => false,
        }
    }
}

impl From<RemoteError> for ArtifactError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::PushForbidden { url } => ArtifactError::PushForbidden { url },
            RemoteError::Cas(e) => ArtifactError::Cas(e),
            RemoteError::ConnectionFailed { endpoint, message } => {
                ArtifactError::remote_unavailable(endpoint, message)
            }
            other => ArtifactError::remote_unavailable("remote", other.to_string()),
        }
    }
}
