use std::time::Duration;

/// Error kinds observable at the WSv2 core's boundary.
///
/// Recovery-matrix entries (`tool_output_not_found`, `previous_response_not_found`)
/// are handled inline by the forwarder and never surface here.
#[derive(Debug, thiserror::Error, Clone)]
pub enum WsError {
    #[error("no schedulable account for this request")]
    AccountUnschedulable,
    #[error("no schedulable account remained after slot acquisition failed on every candidate")]
    NoSchedulableAccount,
    #[error("upstream dial failed: {0}")]
    UpstreamDialError(String),
    #[error("upstream read timed out")]
    UpstreamReadTimeout,
    #[error("upstream write timed out")]
    UpstreamWriteTimeout,
    #[error("upstream closed with policy code {code}: {reason}")]
    UpstreamPolicyClose { code: u16, reason: String },
    #[error("upstream authentication failed: {0}")]
    UpstreamAuthError(String),
    #[error("upstream rejected the request as invalid: {0}")]
    UpstreamInvalidRequest(String),
    #[error("normalizer invariant violated: {0}")]
    NormalizerInvariantViolation(String),
    #[error("client disconnected")]
    ClientDisconnect,
    #[error("request context cancelled")]
    ContextCancelled,
}

impl WsError {
    /// Classification used by the retry policy (§4.8). Recovery-matrix
    /// entries never reach this classifier — they're resolved inline.
    pub fn class(&self) -> ErrorClass {
        match self {
            WsError::UpstreamDialError(_)
            | WsError::UpstreamReadTimeout
            | WsError::UpstreamWriteTimeout => ErrorClass::Retryable,
            WsError::UpstreamPolicyClose { .. }
            | WsError::UpstreamAuthError(_)
            | WsError::UpstreamInvalidRequest(_)
            | WsError::ContextCancelled => ErrorClass::NonRetryable,
            WsError::AccountUnschedulable
            | WsError::NoSchedulableAccount
            | WsError::NormalizerInvariantViolation(_)
            | WsError::ClientDisconnect => ErrorClass::Terminal,
        }
    }

    pub fn is_retryable_close_code(code: u16, non_retryable: &[u16]) -> bool {
        !non_retryable.contains(&code) && matches!(code, 1011 | 1012 | 1013 | 1014)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    NonRetryable,
    /// Not classified by C8 at all — surfaced to the client (or to the
    /// forwarder's own recovery matrix) without a retry attempt.
    Terminal,
}

pub type WsResult<T> = Result<T, WsError>;

/// Caps applied to every independent C1 operation regardless of the
/// caller's own deadline (§4.1).
pub const STATE_STORE_DEADLINE: Duration = Duration::from_secs(3);
