//! Retry utilities: backoff builders and retryable error classification.

use backon::ConstantBuilder;

use crate::config::ClientSettings;
use crate::error::{ClientError, ErrorCode};

/// Backoff between topology discovery rounds.
///
/// - Delay: `discovery_interval`
/// - Total attempts: `max_discover_attempts` (the first attempt is not a retry)
pub fn discovery_backoff(settings: &ClientSettings) -> ConstantBuilder {
    ConstantBuilder::default()
        .with_delay(settings.discovery_interval())
        .with_max_times(settings.max_discover_attempts.saturating_sub(1) as usize)
}

/// Determines if an error is worth retrying unchanged.
///
/// Retryable codes:
/// - `Unavailable`: node down or connection lost
/// - `DeadlineExceeded`: the call timed out
/// - `Aborted`: the server gave up on the request
///
/// Concurrency conflicts are not retryable unchanged: the caller must re-read
/// and pick a new expected state.
pub fn is_transient(err: &ClientError) -> bool {
    matches!(
        err.code(),
        ErrorCode::Unavailable | ErrorCode::DeadlineExceeded | ErrorCode::Aborted
    )
}
