//! Error types for the KurrentDB client.
//!
//! Every failure surfaces as a [`ClientError`] carrying a stable
//! [`ErrorCode`]. When the server or the transport supplied more detail, it is
//! kept as a typed [`ErrorCause`] reachable through [`ClientError::cause`] and
//! [`std::error::Error::source`].

mod translate;

pub use translate::{
    decode_rich_details, headers, pack_detail, status_with_details, RpcStatus, TYPE_URL_PREFIX,
};

use std::fmt;
use std::sync::Arc;

use tonic::Status;

use crate::types::{Endpoint, StreamState};

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Closed set of failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Unclassified error.
    Unknown,
    /// The targeted node does not support the request.
    UnsupportedFeature,
    DeadlineExceeded,
    /// Authentication was required and failed.
    Unauthenticated,
    /// A remote resource was not found, or access to it was denied.
    ResourceNotFound,
    ResourceAlreadyExists,
    /// The client or subscription has been closed.
    ConnectionClosed,
    /// An append failed its optimistic concurrency check.
    WrongExpectedVersion,
    /// A multi-stream append failed its optimistic concurrency check.
    StreamRevisionConflict,
    StreamTombstoned,
    AppendRecordSizeExceeded,
    AppendTransactionSizeExceeded,
    AccessDenied,
    StreamDeleted,
    Parsing,
    /// Unexpected failure inside the client, including invalid settings or arguments.
    InternalClient,
    InternalServer,
    /// A request requiring the leader reached another node.
    NotLeader,
    Aborted,
    Unavailable,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Unknown => "ErrorCodeUnknown",
            ErrorCode::UnsupportedFeature => "ErrorCodeUnsupportedFeature",
            ErrorCode::DeadlineExceeded => "ErrorCodeDeadlineExceeded",
            ErrorCode::Unauthenticated => "ErrorCodeUnauthenticated",
            ErrorCode::ResourceNotFound => "ErrorCodeResourceNotFound",
            ErrorCode::ResourceAlreadyExists => "ErrorCodeResourceAlreadyExists",
            ErrorCode::ConnectionClosed => "ErrorCodeConnectionClosed",
            ErrorCode::WrongExpectedVersion => "ErrorCodeWrongExpectedVersion",
            ErrorCode::StreamRevisionConflict => "ErrorCodeStreamRevisionConflict",
            ErrorCode::StreamTombstoned => "ErrorCodeStreamTombstoned",
            ErrorCode::AppendRecordSizeExceeded => "ErrorCodeAppendRecordSizeExceeded",
            ErrorCode::AppendTransactionSizeExceeded => "ErrorCodeAppendTransactionSizeExceeded",
            ErrorCode::AccessDenied => "ErrorCodeAccessDenied",
            ErrorCode::StreamDeleted => "ErrorCodeStreamDeleted",
            ErrorCode::Parsing => "ErrorCodeParsing",
            ErrorCode::InternalClient => "ErrorCodeInternalClient",
            ErrorCode::InternalServer => "ErrorCodeInternalServer",
            ErrorCode::NotLeader => "ErrorCodeNotLeader",
            ErrorCode::Aborted => "ErrorCodeAborted",
            ErrorCode::Unavailable => "ErrorCodeUnavailable",
        }
    }

    /// Message used when nothing more specific is known.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::Unknown => "unclassified error",
            ErrorCode::UnsupportedFeature => {
                "request not supported by the targeted KurrentDB node"
            }
            ErrorCode::DeadlineExceeded => "gRPC deadline exceeded error",
            ErrorCode::Unauthenticated => {
                "request requires authentication and the authentication failed"
            }
            ErrorCode::ResourceNotFound => "a remote resource was not found or its access was denied",
            ErrorCode::ResourceAlreadyExists => {
                "a creation request was made for a resource that already exists"
            }
            ErrorCode::ConnectionClosed => "the connection is already closed",
            ErrorCode::WrongExpectedVersion => {
                "an append request failed the optimistic concurrency on the server"
            }
            ErrorCode::StreamRevisionConflict => "an append request failed due to a stream revision conflict",
            ErrorCode::StreamTombstoned => "requested stream is tombstoned",
            ErrorCode::AppendRecordSizeExceeded => "an append record exceeds the maximum allowed size",
            ErrorCode::AppendTransactionSizeExceeded => {
                "an append transaction exceeds the maximum allowed size"
            }
            ErrorCode::AccessDenied => "the request requires the right ACL",
            ErrorCode::StreamDeleted => "requested stream is deleted",
            ErrorCode::Parsing => "error when parsing data",
            ErrorCode::InternalClient => "unexpected error from the client library",
            ErrorCode::InternalServer => "unexpected error from the server",
            ErrorCode::NotLeader => {
                "the request needing a leader node was executed on a follower node"
            }
            ErrorCode::Aborted => "the operation was aborted",
            ErrorCode::Unavailable => "the server is unavailable",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed detail behind a [`ClientError`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum ErrorCause {
    #[error("wrong expected version: stream={stream} expected={expected} actual={actual}")]
    WrongExpectedVersion {
        stream: String,
        expected: StreamState,
        actual: StreamState,
    },

    #[error("stream revision conflict: stream={stream} expected_revision={expected} actual_revision={actual}")]
    StreamRevisionConflict {
        stream: String,
        expected: StreamState,
        actual: StreamState,
    },

    #[error("stream deleted: stream={stream}")]
    StreamDeleted { stream: String },

    #[error("stream tombstoned: stream={stream}")]
    StreamTombstoned { stream: String },

    #[error("The size of record {record_id} ({size} bytes) exceeds the maximum allowed size of {max_size} bytes by {} bytes", size.saturating_sub(*max_size))]
    AppendRecordSizeExceeded {
        stream: String,
        record_id: String,
        size: u64,
        max_size: u64,
    },

    #[error("The total size of the append transaction ({size} bytes) exceeds the maximum allowed size of {max_size} bytes by {} bytes", size.saturating_sub(*max_size))]
    AppendTransactionSizeExceeded { size: u64, max_size: u64 },

    #[error("not leader{}", leader.as_ref().map(|l| format!(", leader is {l}")).unwrap_or_default())]
    NotLeader { leader: Option<Endpoint> },

    #[error("no suitable node found after {attempts} discovery attempts")]
    DiscoveryExhausted { attempts: u32 },

    #[error("grpc status: {0}")]
    Status(Arc<Status>),

    #[error("transport error: {0}")]
    Transport(Arc<tonic::transport::Error>),

    #[error("{0}")]
    Other(Arc<dyn std::error::Error + Send + Sync>),
}

/// An error from any client operation.
#[derive(Debug, Clone)]
pub struct ClientError {
    code: ErrorCode,
    message: String,
    cause: Option<ErrorCause>,
}

impl ClientError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(code: ErrorCode, message: impl Into<String>, cause: ErrorCause) -> Self {
        Self {
            code,
            message: message.into(),
            cause: Some(cause),
        }
    }

    /// Error carrying only a code, described by the code's default message.
    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    /// Wraps an arbitrary error under `code`, keeping it as the cause.
    pub fn from_error<E>(code: ErrorCode, message: impl Into<String>, err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::with_cause(code, message, ErrorCause::Other(Arc::new(err)))
    }

    /// Wraps an error that does not fit any other class.
    pub fn unknown<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let message = err.to_string();
        Self::from_error(ErrorCode::Unknown, message, err)
    }

    pub fn wrong_expected_version(
        stream: impl Into<String>,
        expected: StreamState,
        actual: StreamState,
    ) -> Self {
        let cause = ErrorCause::WrongExpectedVersion {
            stream: stream.into(),
            expected,
            actual,
        };
        Self::with_cause(ErrorCode::WrongExpectedVersion, cause.to_string(), cause)
    }

    pub fn connection_closed() -> Self {
        Self::from_code(ErrorCode::ConnectionClosed)
    }

    /// Invalid settings or arguments supplied by the caller.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalClient, message)
    }

    /// Translates a gRPC status, unwrapping structured details when present.
    pub fn from_status(status: Status) -> Self {
        translate::from_status(status)
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&ErrorCause> {
        self.cause.as_ref()
    }

    /// Returns the underlying gRPC Status if the error came from one.
    pub fn status(&self) -> Option<&Status> {
        match &self.cause {
            Some(ErrorCause::Status(status)) => Some(status),
            _ => None,
        }
    }

    pub fn is_code(&self, code: ErrorCode) -> bool {
        self.code == code
    }

    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::ResourceNotFound
    }

    pub fn is_connection_closed(&self) -> bool {
        self.code == ErrorCode::ConnectionClosed
    }

    /// Whether the connection that produced this error should be replaced.
    pub fn invalidates_connection(&self) -> bool {
        matches!(self.code, ErrorCode::NotLeader | ErrorCode::Unavailable)
            || matches!(self.cause, Some(ErrorCause::Transport(_)))
    }

    /// Leader endpoint advertised by a not-leader response.
    pub fn leader_hint(&self) -> Option<&Endpoint> {
        match &self.cause {
            Some(ErrorCause::NotLeader { leader }) => leader.as_ref(),
            _ => None,
        }
    }

    /// Concurrency conflicts the caller may resolve by re-reading and retrying.
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::WrongExpectedVersion | ErrorCode::StreamRevisionConflict
        )
    }

    /// Errors after which the stream can never be written again.
    pub fn is_stream_terminal(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::StreamDeleted | ErrorCode::StreamTombstoned
        )
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

impl From<Status> for ClientError {
    fn from(status: Status) -> Self {
        ClientError::from_status(status)
    }
}

impl From<tonic::transport::Error> for ClientError {
    fn from(err: tonic::transport::Error) -> Self {
        let message = format!("transport failure: {err}");
        ClientError::with_cause(
            ErrorCode::Unavailable,
            message,
            ErrorCause::Transport(Arc::new(err)),
        )
    }
}
