//! Unified, machine-readable error taxonomy shared by every crate in the
//! workspace. Component errors are defined locally with `thiserror` and
//! convert into [`KbError`] at crate boundaries via `#[from]`, the same
//! shape the reference orchestration crate uses for its own error sum.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Coarse grouping used for metrics and for routing in the HTTP layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Authentication,
    Authorization,
    NotFound,
    Conflict,
    Storage,
    Index,
    Model,
    RateLimit,
    Invariant,
    Internal,
    Unavailable,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::Authorization => "authorization",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Conflict => "conflict",
            ErrorCategory::Storage => "storage",
            ErrorCategory::Index => "index",
            ErrorCategory::Model => "model",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Invariant => "invariant",
            ErrorCategory::Internal => "internal",
            ErrorCategory::Unavailable => "unavailable",
        };
        f.write_str(s)
    }
}

/// Retry policy class from spec §7. The Task Manager pattern-matches on
/// this, not on `ErrorCode`, to decide whether to retry a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Network timeout, 5xx, lease lost: retry with jittered backoff.
    Transient,
    /// Unparseable file, unsupported type, checksum mismatch: no retry.
    PermanentInput,
    /// Caller lacks rights: never enqueue work.
    Permission,
    /// Cross-store inconsistency: log, surface to cleanup, do not auto-fix.
    Invariant,
    /// Cooperative cancellation: not a failure.
    Cancellation,
}

/// Stable wire code, `SCREAMING_SNAKE_CASE` in JSON, following the
/// reference error crate's `ErrorCode` convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    RateLimited,
    Internal,
    Unavailable,
    ChecksumMismatch,
    UnsupportedFileType,
    EmptyDocument,
    LeaseLost,
    Timeout,
    Transport,
    BadResponse,
    InvariantViolation,
    Cancelled,
    AttemptsExhausted,
}

impl ErrorCode {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ErrorCode::InvalidRequest
            | ErrorCode::ChecksumMismatch
            | ErrorCode::UnsupportedFileType
            | ErrorCode::EmptyDocument => ErrorCategory::Validation,
            ErrorCode::Unauthorized => ErrorCategory::Authentication,
            ErrorCode::Forbidden => ErrorCategory::Authorization,
            ErrorCode::NotFound => ErrorCategory::NotFound,
            ErrorCode::Conflict => ErrorCategory::Conflict,
            ErrorCode::RateLimited => ErrorCategory::RateLimit,
            ErrorCode::Internal | ErrorCode::BadResponse => ErrorCategory::Internal,
            ErrorCode::Unavailable | ErrorCode::LeaseLost | ErrorCode::Timeout
            | ErrorCode::Transport => ErrorCategory::Unavailable,
            ErrorCode::InvariantViolation => ErrorCategory::Invariant,
            ErrorCode::Cancelled => ErrorCategory::Internal,
            ErrorCode::AttemptsExhausted => ErrorCategory::Unavailable,
        }
    }

    /// Retry classification from spec §7; used by `kb-tasks` to decide
    /// whether a stage error should retry, fail the version, or stall.
    pub fn severity(&self) -> Severity {
        match self {
            ErrorCode::Unavailable
            | ErrorCode::LeaseLost
            | ErrorCode::Timeout
            | ErrorCode::Transport
            | ErrorCode::RateLimited => Severity::Transient,
            ErrorCode::InvalidRequest
            | ErrorCode::ChecksumMismatch
            | ErrorCode::UnsupportedFileType
            | ErrorCode::EmptyDocument
            | ErrorCode::BadResponse => Severity::PermanentInput,
            ErrorCode::Unauthorized | ErrorCode::Forbidden => Severity::Permission,
            ErrorCode::InvariantViolation => Severity::Invariant,
            ErrorCode::Cancelled => Severity::Cancellation,
            ErrorCode::NotFound | ErrorCode::Conflict | ErrorCode::Internal
            | ErrorCode::AttemptsExhausted => Severity::PermanentInput,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::Internal => "INTERNAL",
            ErrorCode::Unavailable => "UNAVAILABLE",
            ErrorCode::ChecksumMismatch => "CHECKSUM_MISMATCH",
            ErrorCode::UnsupportedFileType => "UNSUPPORTED_FILE_TYPE",
            ErrorCode::EmptyDocument => "EMPTY_DOCUMENT",
            ErrorCode::LeaseLost => "LEASE_LOST",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Transport => "TRANSPORT",
            ErrorCode::BadResponse => "BAD_RESPONSE",
            ErrorCode::InvariantViolation => "INVARIANT_VIOLATION",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::AttemptsExhausted => "ATTEMPTS_EXHAUSTED",
        }
    }

    /// HTTP status the daemon maps this code to.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::InvalidRequest
            | ErrorCode::ChecksumMismatch
            | ErrorCode::UnsupportedFileType
            | ErrorCode::EmptyDocument => 400,
            ErrorCode::Unauthorized => 401,
            ErrorCode::Forbidden => 403,
            ErrorCode::NotFound => 404,
            ErrorCode::Conflict => 409,
            ErrorCode::RateLimited => 429,
            ErrorCode::Unavailable | ErrorCode::LeaseLost | ErrorCode::Timeout
            | ErrorCode::Transport | ErrorCode::AttemptsExhausted => 503,
            ErrorCode::Internal | ErrorCode::BadResponse | ErrorCode::InvariantViolation
            | ErrorCode::Cancelled => 500,
        }
    }

    pub const ALL: &'static [ErrorCode] = &[
        ErrorCode::InvalidRequest,
        ErrorCode::Unauthorized,
        ErrorCode::Forbidden,
        ErrorCode::NotFound,
        ErrorCode::Conflict,
        ErrorCode::RateLimited,
        ErrorCode::Internal,
        ErrorCode::Unavailable,
        ErrorCode::ChecksumMismatch,
        ErrorCode::UnsupportedFileType,
        ErrorCode::EmptyDocument,
        ErrorCode::LeaseLost,
        ErrorCode::Timeout,
        ErrorCode::Transport,
        ErrorCode::BadResponse,
        ErrorCode::InvariantViolation,
        ErrorCode::Cancelled,
        ErrorCode::AttemptsExhausted,
    ];
}

/// The concrete error type passed across crate and process boundaries.
/// Carries structured context (e.g. `version_id`, `task_id`) the way the
/// reference error crate attaches a `BTreeMap<String, Value>` rather than
/// interpolating IDs into the message string.
pub struct KbError {
    pub code: ErrorCode,
    pub message: String,
    pub context: BTreeMap<String, Value>,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl KbError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        KbError {
            code,
            message: message.into(),
            context: BTreeMap::new(),
            source: None,
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Conflict, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn severity(&self) -> Severity {
        self.code.severity()
    }

    pub fn to_dto(&self) -> KbErrorDto {
        KbErrorDto {
            code: self.code,
            message: self.message.clone(),
            context: self.context.clone(),
        }
    }
}

impl fmt::Debug for KbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KbError {{ code: {:?}, message: {:?}", self.code, self.message)?;
        if !self.context.is_empty() {
            write!(f, ", context: {:?}", self.context)?;
        }
        write!(f, " }}")
    }
}

impl fmt::Display for KbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.context.is_empty() {
            let ctx = serde_json::to_string(&self.context).unwrap_or_default();
            write!(f, " {}", ctx)?;
        }
        Ok(())
    }
}

impl std::error::Error for KbError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Serializable snapshot of a [`KbError`], used for the `{error: {code,
/// message}}` HTTP envelope and for embedding in `Task.last_error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KbErrorDto {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, Value>,
}

pub type Result<T> = std::result::Result<T, KbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_are_screaming_snake_case() {
        for code in ErrorCode::ALL {
            let json = serde_json::to_string(code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
    }

    #[test]
    fn every_code_has_a_category_and_severity() {
        for code in ErrorCode::ALL {
            let _ = code.category();
            let _ = code.severity();
            assert!(code.http_status() >= 400);
        }
    }

    #[test]
    fn display_includes_code_and_context() {
        let err = KbError::not_found("version missing")
            .with_context("version_id", "abc-123");
        let rendered = format!("{err}");
        assert!(rendered.contains("NOT_FOUND"));
        assert!(rendered.contains("version missing"));
        assert!(rendered.contains("abc-123"));
    }

    #[test]
    fn transient_codes_are_retryable() {
        assert_eq!(ErrorCode::Timeout.severity(), Severity::Transient);
        assert_eq!(ErrorCode::Forbidden.severity(), Severity::Permission);
        assert_eq!(ErrorCode::InvariantViolation.severity(), Severity::Invariant);
    }
}
