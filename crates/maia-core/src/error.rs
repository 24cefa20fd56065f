use serde::Serialize;
use thiserror::Error;

/// Process exit codes for the gateway binary and any CLI tooling.
pub const EXIT_OK: i32 = 0;
pub const EXIT_USAGE: i32 = 64;
pub const EXIT_CONFIG: i32 = 65;
pub const EXIT_UNAVAILABLE: i32 = 69;
pub const EXIT_INTERNAL: i32 = 70;

/// The stable error taxonomy shared by every component.
///
/// Experts fold collaborator failures into these kinds; the dispatcher never
/// raises; the orchestrator translates everything except `Unauthorized` and
/// `Forbidden` into a degraded natural-language response.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ErrorKind {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("circuit open for service '{service}'")]
    CircuitOpen { service: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("ambiguous reference: {0}")]
    Ambiguous(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ErrorKind {
    /// Stable kind string used in the HTTP error envelope and in
    /// `ActionResult.error` serialization.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Unauthorized(_) => "unauthorized",
            ErrorKind::Forbidden(_) => "forbidden",
            ErrorKind::Invalid(_) => "invalid",
            ErrorKind::NotFound(_) => "not_found",
            ErrorKind::Conflict(_) => "conflict",
            ErrorKind::Timeout { .. } => "timeout",
            ErrorKind::CircuitOpen { .. } => "circuit_open",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Ambiguous(_) => "ambiguous",
            ErrorKind::Unavailable(_) => "unavailable",
            ErrorKind::Internal(_) => "internal",
        }
    }

    /// HTTP status for the standard error envelope.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::Unauthorized(_) => 401,
            ErrorKind::Forbidden(_) => 403,
            ErrorKind::Invalid(_) | ErrorKind::Ambiguous(_) => 400,
            ErrorKind::NotFound(_) => 404,
            ErrorKind::Conflict(_) => 409,
            ErrorKind::Timeout { .. } => 504,
            ErrorKind::CircuitOpen { .. } | ErrorKind::Unavailable(_) => 503,
            ErrorKind::Cancelled => 499,
            ErrorKind::Internal(_) => 500,
        }
    }

    /// True for the kinds that may be retried on idempotent operations.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::Timeout { .. } | ErrorKind::Unavailable(_))
    }

    /// True for the kinds that flip `partial = true` on a dispatch result.
    pub fn marks_partial(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout { .. } | ErrorKind::CircuitOpen { .. }
        )
    }
}

impl Serialize for ErrorKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.code())
    }
}

pub type Result<T> = std::result::Result<T, ErrorKind>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ErrorKind::Cancelled.code(), "cancelled");
        assert_eq!(
            ErrorKind::CircuitOpen {
                service: "calendar".into()
            }
            .code(),
            "circuit_open"
        );
        assert_eq!(ErrorKind::Timeout { ms: 100 }.code(), "timeout");
    }

    #[test]
    fn only_timeout_and_unavailable_are_transient() {
        assert!(ErrorKind::Timeout { ms: 1 }.is_transient());
        assert!(ErrorKind::Unavailable("503".into()).is_transient());
        assert!(!ErrorKind::Invalid("bad".into()).is_transient());
        assert!(!ErrorKind::Cancelled.is_transient());
        assert!(!ErrorKind::CircuitOpen {
            service: "lists".into()
        }
        .is_transient());
    }

    #[test]
    fn serializes_as_kind_string() {
        let json = serde_json::to_string(&ErrorKind::NotFound("x".into())).unwrap();
        assert_eq!(json, "\"not_found\"");
    }
}
