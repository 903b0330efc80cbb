//! Error taxonomy shared across the engine.
//!
//! Mirrors the hand-rolled enum + manual `Display`/`Error` style used
//! throughout this codebase rather than a derive-macro based approach.

use std::fmt;

/// Stable error kind, independent of the human-readable message.
///
/// This is the wire-visible `error.code` carried in `error` envelopes (see
/// the envelope format), not a Rust type name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    IframeNotReady,
    ProtocolUnsupported,
    AckTimeout,
    Timeout,
    AsyncTimeout,
    MethodNotFound,
    NoResponse,
    TooManyRequests,
    TargetWindowClosed,
    RequestError,
    StreamError,
    StreamCancelled,
    StreamNotBound,
    StreamStartTimeout,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::IframeNotReady => "IFRAME_NOT_READY",
            ErrorCode::ProtocolUnsupported => "PROTOCOL_UNSUPPORTED",
            ErrorCode::AckTimeout => "ACK_TIMEOUT",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::AsyncTimeout => "ASYNC_TIMEOUT",
            ErrorCode::MethodNotFound => "METHOD_NOT_FOUND",
            ErrorCode::NoResponse => "NO_RESPONSE",
            ErrorCode::TooManyRequests => "TOO_MANY_REQUESTS",
            ErrorCode::TargetWindowClosed => "TARGET_WINDOW_CLOSED",
            ErrorCode::RequestError => "REQUEST_ERROR",
            ErrorCode::StreamError => "STREAM_ERROR",
            ErrorCode::StreamCancelled => "STREAM_CANCELLED",
            ErrorCode::StreamNotBound => "STREAM_NOT_BOUND",
            ErrorCode::StreamStartTimeout => "STREAM_START_TIMEOUT",
        }
    }

    /// Maps a wire-visible error code string back to a variant, falling back
    /// to `RequestError` for anything this implementation does not
    /// recognize (e.g. a code minted by a peer running a newer version).
    pub fn from_wire(code: &str) -> Self {
        match code {
            "IFRAME_NOT_READY" => ErrorCode::IframeNotReady,
            "PROTOCOL_UNSUPPORTED" => ErrorCode::ProtocolUnsupported,
            "ACK_TIMEOUT" => ErrorCode::AckTimeout,
            "TIMEOUT" => ErrorCode::Timeout,
            "ASYNC_TIMEOUT" => ErrorCode::AsyncTimeout,
            "METHOD_NOT_FOUND" => ErrorCode::MethodNotFound,
            "NO_RESPONSE" => ErrorCode::NoResponse,
            "TOO_MANY_REQUESTS" => ErrorCode::TooManyRequests,
            "TARGET_WINDOW_CLOSED" => ErrorCode::TargetWindowClosed,
            "STREAM_ERROR" => ErrorCode::StreamError,
            "STREAM_CANCELLED" => ErrorCode::StreamCancelled,
            "STREAM_NOT_BOUND" => ErrorCode::StreamNotBound,
            "STREAM_START_TIMEOUT" => ErrorCode::StreamStartTimeout,
            _ => ErrorCode::RequestError,
        }
    }

    /// HTTP-ish status a server-side occurrence of this code should carry.
    pub fn status(self) -> u16 {
        match self {
            ErrorCode::MethodNotFound => 404,
            ErrorCode::TooManyRequests => 429,
            ErrorCode::AckTimeout
            | ErrorCode::Timeout
            | ErrorCode::AsyncTimeout
            | ErrorCode::StreamStartTimeout => 408,
            _ => 500,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unified error type surfaced by public `winrpc-core` APIs.
#[derive(Debug, Clone)]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn iframe_not_ready(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::IframeNotReady, message)
    }

    pub fn protocol_unsupported(version: u32, minimum: u32) -> Self {
        Self::new(
            ErrorCode::ProtocolUnsupported,
            format!("protocol version {version} is below the minimum supported version {minimum}"),
        )
    }

    pub fn ack_timeout(request_id: &str) -> Self {
        Self::new(ErrorCode::AckTimeout, format!("ack timed out for request {request_id}"))
    }

    pub fn timeout(request_id: &str) -> Self {
        Self::new(ErrorCode::Timeout, format!("response timed out for request {request_id}"))
    }

    pub fn async_timeout(request_id: &str) -> Self {
        Self::new(
            ErrorCode::AsyncTimeout,
            format!("async response timed out for request {request_id}"),
        )
    }

    pub fn target_window_closed() -> Self {
        Self::new(ErrorCode::TargetWindowClosed, "target window is no longer reachable")
    }

    pub fn stream_not_bound() -> Self {
        Self::new(ErrorCode::StreamNotBound, "stream was never bound to a request context")
    }

    pub fn stream_cancelled(reason: Option<&str>) -> Self {
        Self::new(
            ErrorCode::StreamCancelled,
            reason.unwrap_or("stream was cancelled").to_string(),
        )
    }

    pub fn no_response(request_id: &str) -> Self {
        Self::new(
            ErrorCode::NoResponse,
            format!("handler for request {request_id} returned without sending a reply"),
        )
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

/// Errors from the channel/transport layer.
#[derive(Debug, Clone)]
pub enum TransportError {
    Closed,
    SendFailed(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Closed => f.write_str("channel is closed"),
            TransportError::SendFailed(reason) => write!(f, "send failed: {reason}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<TransportError> for RpcError {
    fn from(value: TransportError) -> Self {
        RpcError::new(ErrorCode::TargetWindowClosed, value.to_string())
    }
}

/// Errors from envelope validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    NotAnObject,
    MissingProtocolVersion,
    ProtocolVersionTooLow { found: u32, minimum: u32 },
    MissingOrInvalidType,
    MissingRequestId,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::NotAnObject => f.write_str("envelope payload is not an object"),
            ValidationError::MissingProtocolVersion => f.write_str("envelope is missing __protocol__"),
            ValidationError::ProtocolVersionTooLow { found, minimum } => write!(
                f,
                "envelope protocol version {found} is below minimum {minimum}"
            ),
            ValidationError::MissingOrInvalidType => f.write_str("envelope has a missing or invalid type"),
            ValidationError::MissingRequestId => f.write_str("envelope is missing requestId"),
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<ValidationError> for RpcError {
    fn from(value: ValidationError) -> Self {
        match value {
            ValidationError::ProtocolVersionTooLow { found, minimum } => {
                RpcError::protocol_unsupported(found, minimum)
            }
            other => RpcError::new(ErrorCode::RequestError, other.to_string()),
        }
    }
}

/// Errors from the stream engine.
#[derive(Debug, Clone)]
pub enum StreamError {
    NotBound,
    Cancelled(Option<String>),
    PendingQueueOverflow,
    Remote(String),
    StartTimedOut,
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::NotBound => f.write_str("stream not bound to a request context"),
            StreamError::Cancelled(reason) => match reason {
                Some(reason) => write!(f, "stream cancelled: {reason}"),
                None => f.write_str("stream cancelled"),
            },
            StreamError::PendingQueueOverflow => f.write_str("stream pending queue limit exceeded"),
            StreamError::Remote(message) => write!(f, "remote stream error: {message}"),
            StreamError::StartTimedOut => f.write_str("stream start timed out"),
        }
    }
}

impl std::error::Error for StreamError {}

impl From<StreamError> for RpcError {
    fn from(value: StreamError) -> Self {
        let code = match &value {
            StreamError::NotBound => ErrorCode::StreamNotBound,
            StreamError::Cancelled(_) => ErrorCode::StreamCancelled,
            StreamError::StartTimedOut => ErrorCode::StreamStartTimeout,
            StreamError::PendingQueueOverflow | StreamError::Remote(_) => ErrorCode::StreamError,
        };
        RpcError::new(code, value.to_string())
    }
}
