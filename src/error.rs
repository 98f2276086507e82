use std::fmt::Display;

use serde::Serialize;

/// The closed set of reason codes a [`SendError`] can carry.
///
/// Reasons are serialised in SCREAMING_SNAKE_CASE so clients can switch on
/// them without parsing a human-readable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorReason {
    /// Malformed input: unparseable URL, invalid JSON body, failed validation.
    BadRequest,
    /// A declarative security check on the matched route rejected the request.
    Forbidden,
    /// No route matched, or a file sender target does not exist.
    NotFound,
    /// A route matched the path but not the request method.
    MethodNotAllowed,
    /// The request body exceeded the configured ceiling.
    PayloadTooLarge,
    /// A `Range` header referenced bytes outside the file.
    RangeNotSatisfiable,
    /// `read_multipart_data` was called on a request whose `Content-Type` is
    /// not `multipart/*`.
    MultipartInvalidContentType,
    /// The multipart `Content-Type` carried no `boundary` parameter.
    MultipartMissingBoundary,
    /// A handler completed without ending the response stream.
    RequestDropped,
    /// A write was attempted on an already-closed event stream.
    StreamClosed,
    /// The named recipe does not exist in this wiki.
    RecipeNotFound,
    /// The named bag does not exist in this wiki.
    BagNotFound,
    /// Anything the engine cannot attribute to the client.
    InternalServerError,
}

impl Display for ErrorReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorReason::BadRequest => "BAD_REQUEST",
            ErrorReason::Forbidden => "FORBIDDEN",
            ErrorReason::NotFound => "NOT_FOUND",
            ErrorReason::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            ErrorReason::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ErrorReason::RangeNotSatisfiable => "RANGE_NOT_SATISFIABLE",
            ErrorReason::MultipartInvalidContentType => "MULTIPART_INVALID_CONTENT_TYPE",
            ErrorReason::MultipartMissingBoundary => "MULTIPART_MISSING_BOUNDARY",
            ErrorReason::RequestDropped => "REQUEST_DROPPED",
            ErrorReason::StreamClosed => "STREAM_CLOSED",
            ErrorReason::RecipeNotFound => "RECIPE_NOT_FOUND",
            ErrorReason::BagNotFound => "BAG_NOT_FOUND",
            ErrorReason::InternalServerError => "INTERNAL_SERVER_ERROR",
        };
        write!(f, "{}", name)
    }
}

/// A structured, client-facing error.
///
/// Handlers return `SendError` to surface an error response; the router
/// catches it at the top of dispatch and renders it as
/// `{"reason": ..., "status": ..., "details": ...}` unless response headers
/// have already been written, in which case it is only logged.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SendError {
    /// The reason code, from the closed [`ErrorReason`] set.
    pub reason: ErrorReason,
    /// The HTTP status the response will carry.
    pub status: u16,
    /// Reason-specific structured payload, if any.
    pub details: Option<serde_json::Value>,
}

impl SendError {
    /// Creates an error with no detail payload.
    pub fn new(reason: ErrorReason, status: u16) -> Self {
        Self {
            reason,
            status,
            details: None,
        }
    }

    /// Attaches a structured detail payload.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// 400 with a detail message or validation tree.
    pub fn bad_request(details: serde_json::Value) -> Self {
        Self::new(ErrorReason::BadRequest, 400).with_details(details)
    }

    /// 403 for a failed security check.
    pub fn forbidden() -> Self {
        Self::new(ErrorReason::Forbidden, 403)
    }

    /// 404 for an unmatched request or missing file.
    pub fn not_found() -> Self {
        Self::new(ErrorReason::NotFound, 404)
    }

    /// 413 for an over-limit body.
    pub fn payload_too_large(limit: usize) -> Self {
        Self::new(ErrorReason::PayloadTooLarge, 413)
            .with_details(serde_json::json!({ "limit": limit }))
    }

    /// 500 carrying a diagnostic message.
    pub fn internal<T: Display>(message: T) -> Self {
        Self::new(ErrorReason::InternalServerError, 500)
            .with_details(serde_json::Value::String(message.to_string()))
    }

    /// 500 for a handler that returned without ending the stream.
    pub fn request_dropped(route_path: &str) -> Self {
        Self::new(ErrorReason::RequestDropped, 500)
            .with_details(serde_json::json!({ "route": route_path }))
    }

    /// Serialises to the wire form `{reason, status, details}`.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "reason": self.reason.to_string(),
            "status": self.status,
            "details": self.details,
        })
    }
}

impl Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.details {
            Some(details) => write!(f, "{} ({}): {}", self.reason, self.status, details),
            None => write!(f, "{} ({})", self.reason, self.status),
        }
    }
}

impl std::error::Error for SendError {}

impl From<std::io::Error> for SendError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            SendError::not_found()
        } else {
            SendError::internal(err)
        }
    }
}

impl From<serde_json::Error> for SendError {
    fn from(err: serde_json::Error) -> Self {
        SendError::bad_request(serde_json::Value::String(err.to_string()))
    }
}
