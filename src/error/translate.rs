//! gRPC status to [`ClientError`] translation.
//!
//! Servers describe failures in three layers: the status code, an
//! `exception` metadata header naming the domain error, and (on newer servers)
//! structured details packed as a `google.rpc.Status` in the status details.
//! The most specific layer present wins.

use std::sync::Arc;

use bytes::Bytes;
use prost::Message;
use tonic::metadata::MetadataMap;
use tonic::{Code, Status};

use super::{ClientError, ErrorCause, ErrorCode};
use crate::proto::kurrentdb::protocol::v2::streams::errors::{
    AppendRecordSizeExceededErrorDetails, AppendTransactionSizeExceededErrorDetails,
    StreamRevisionConflictErrorDetails, StreamTombstonedErrorDetails,
};
use crate::types::{Endpoint, StreamState};

pub const TYPE_URL_PREFIX: &str = "type.googleapis.com/";

const DETAILS_PACKAGE: &str = "kurrentdb.protocol.v2.streams.errors";

/// Metadata keys and values used by servers to name domain errors.
pub mod headers {
    pub const EXCEPTION: &str = "exception";
    pub const LEADER_HOST: &str = "leader-endpoint-host";
    pub const LEADER_PORT: &str = "leader-endpoint-port";
    pub const STREAM_NAME: &str = "stream-name";
    pub const EXPECTED_VERSION: &str = "expected-version";
    pub const ACTUAL_VERSION: &str = "actual-version";
    pub const MAXIMUM_APPEND_SIZE: &str = "maximum-append-size";

    pub const NOT_LEADER: &str = "not-leader";
    pub const STREAM_DELETED: &str = "stream-deleted";
    pub const WRONG_EXPECTED_VERSION: &str = "wrong-expected-version";
    pub const ACCESS_DENIED: &str = "access-denied";
    pub const NOT_AUTHENTICATED: &str = "not-authenticated";
    pub const STREAM_NOT_FOUND: &str = "stream-not-found";
    pub const PERSISTENT_SUBSCRIPTION_EXISTS: &str = "persistent-subscription-exists";
    pub const PERSISTENT_SUBSCRIPTION_DOES_NOT_EXIST: &str =
        "persistent-subscription-does-not-exist";
    pub const MAXIMUM_APPEND_SIZE_EXCEEDED: &str = "maximum-append-size-exceeded";
}

/// `google.rpc.Status`, the envelope for structured status details.
#[derive(Clone, PartialEq, Message)]
pub struct RpcStatus {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(message, repeated, tag = "3")]
    pub details: Vec<prost_types::Any>,
}

/// Packs an error detail message for [`status_with_details`].
pub fn pack_detail<M: Message>(name: &str, detail: &M) -> prost_types::Any {
    prost_types::Any {
        type_url: format!("{TYPE_URL_PREFIX}{DETAILS_PACKAGE}.{name}"),
        value: detail.encode_to_vec(),
    }
}

/// Builds a status carrying structured details.
pub fn status_with_details(
    code: Code,
    message: impl Into<String>,
    details: Vec<prost_types::Any>,
) -> Status {
    let message = message.into();
    let envelope = RpcStatus {
        code: code as i32,
        message: message.clone(),
        details,
    };
    Status::with_details(code, message, Bytes::from(envelope.encode_to_vec()))
}

pub(super) fn from_status(status: Status) -> ClientError {
    if let Some((code, cause)) = decode_rich_details(&status) {
        return ClientError::with_cause(code, cause.to_string(), cause);
    }

    let message = status.message().to_string();
    if let Some((code, cause)) = from_exception_header(status.metadata()) {
        let message = if message.is_empty() {
            code.default_message().to_string()
        } else {
            message
        };
        return match cause {
            Some(cause) => ClientError::with_cause(code, message, cause),
            None => ClientError::with_cause(code, message, ErrorCause::Status(Arc::new(status))),
        };
    }

    let code = map_code(status.code());
    let message = if message.is_empty() {
        code.default_message().to_string()
    } else {
        message
    };
    ClientError::with_cause(code, message, ErrorCause::Status(Arc::new(status)))
}

/// Decodes the structured details of `status`, if it carries any known one.
pub fn decode_rich_details(status: &Status) -> Option<(ErrorCode, ErrorCause)> {
    if status.details().is_empty() {
        return None;
    }
    let envelope = RpcStatus::decode(status.details()).ok()?;
    envelope.details.iter().find_map(decode_detail)
}

fn decode_detail(any: &prost_types::Any) -> Option<(ErrorCode, ErrorCause)> {
    let name = any.type_url.rsplit('/').next()?;
    let name = name.strip_prefix(DETAILS_PACKAGE)?.strip_prefix('.')?;
    let value = any.value.as_slice();
    match name {
        "StreamRevisionConflictErrorDetails" => {
            let detail = StreamRevisionConflictErrorDetails::decode(value).ok()?;
            Some((
                ErrorCode::StreamRevisionConflict,
                ErrorCause::StreamRevisionConflict {
                    stream: detail.stream,
                    expected: lenient_state(detail.expected_revision),
                    actual: lenient_state(detail.actual_revision),
                },
            ))
        }
        "StreamTombstonedErrorDetails" => {
            let detail = StreamTombstonedErrorDetails::decode(value).ok()?;
            Some((
                ErrorCode::StreamTombstoned,
                ErrorCause::StreamTombstoned {
                    stream: detail.stream,
                },
            ))
        }
        "AppendRecordSizeExceededErrorDetails" => {
            let detail = AppendRecordSizeExceededErrorDetails::decode(value).ok()?;
            Some((
                ErrorCode::AppendRecordSizeExceeded,
                ErrorCause::AppendRecordSizeExceeded {
                    stream: detail.stream,
                    record_id: detail.record_id,
                    size: detail.size.max(0) as u64,
                    max_size: detail.max_size.max(0) as u64,
                },
            ))
        }
        "AppendTransactionSizeExceededErrorDetails" => {
            let detail = AppendTransactionSizeExceededErrorDetails::decode(value).ok()?;
            Some((
                ErrorCode::AppendTransactionSizeExceeded,
                ErrorCause::AppendTransactionSizeExceeded {
                    size: detail.size.max(0) as u64,
                    max_size: detail.max_size.max(0) as u64,
                },
            ))
        }
        _ => None,
    }
}

/// Sentinel decoding for values reported back by the server. Unrecognised
/// negative values fall back to `Any` instead of failing the translation.
fn lenient_state(value: i64) -> StreamState {
    StreamState::from_wire(value).unwrap_or(StreamState::Any)
}

fn header<'a>(metadata: &'a MetadataMap, key: &str) -> Option<&'a str> {
    metadata.get(key).and_then(|v| v.to_str().ok())
}

fn from_exception_header(metadata: &MetadataMap) -> Option<(ErrorCode, Option<ErrorCause>)> {
    let exception = header(metadata, headers::EXCEPTION)?;
    let stream = || header(metadata, headers::STREAM_NAME).unwrap_or_default().to_string();
    let translated = match exception {
        headers::NOT_LEADER => {
            let leader = header(metadata, headers::LEADER_HOST).and_then(|host| {
                let port = header(metadata, headers::LEADER_PORT)?.parse().ok()?;
                Some(Endpoint::new(host, port))
            });
            (ErrorCode::NotLeader, Some(ErrorCause::NotLeader { leader }))
        }
        headers::STREAM_DELETED => (
            ErrorCode::StreamDeleted,
            Some(ErrorCause::StreamDeleted { stream: stream() }),
        ),
        headers::WRONG_EXPECTED_VERSION => {
            let state = |key| {
                header(metadata, key)
                    .and_then(|v| v.parse::<i64>().ok())
                    .map(lenient_state)
                    .unwrap_or_default()
            };
            (
                ErrorCode::WrongExpectedVersion,
                Some(ErrorCause::WrongExpectedVersion {
                    stream: stream(),
                    expected: state(headers::EXPECTED_VERSION),
                    actual: state(headers::ACTUAL_VERSION),
                }),
            )
        }
        headers::MAXIMUM_APPEND_SIZE_EXCEEDED => {
            let max_size = header(metadata, headers::MAXIMUM_APPEND_SIZE)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or_default();
            (
                ErrorCode::AppendTransactionSizeExceeded,
                Some(ErrorCause::AppendTransactionSizeExceeded {
                    size: 0,
                    max_size,
                }),
            )
        }
        headers::ACCESS_DENIED => (ErrorCode::AccessDenied, None),
        headers::NOT_AUTHENTICATED => (ErrorCode::Unauthenticated, None),
        headers::STREAM_NOT_FOUND => (ErrorCode::ResourceNotFound, None),
        headers::PERSISTENT_SUBSCRIPTION_EXISTS => (ErrorCode::ResourceAlreadyExists, None),
        headers::PERSISTENT_SUBSCRIPTION_DOES_NOT_EXIST => (ErrorCode::ResourceNotFound, None),
        _ => return None,
    };
    Some(translated)
}

fn map_code(code: Code) -> ErrorCode {
    match code {
        Code::Unauthenticated => ErrorCode::Unauthenticated,
        Code::PermissionDenied => ErrorCode::AccessDenied,
        Code::DeadlineExceeded => ErrorCode::DeadlineExceeded,
        Code::NotFound => ErrorCode::ResourceNotFound,
        Code::AlreadyExists => ErrorCode::ResourceAlreadyExists,
        Code::Unimplemented => ErrorCode::UnsupportedFeature,
        Code::Unavailable => ErrorCode::Unavailable,
        Code::Aborted | Code::Cancelled => ErrorCode::Aborted,
        Code::Internal | Code::DataLoss => ErrorCode::InternalServer,
        Code::InvalidArgument => ErrorCode::InternalClient,
        _ => ErrorCode::Unknown,
    }
}
