//! Typed errors for the processing core.
//!
//! The core never lets a raw panic or an untyped error cross an API seam:
//! every operation returns a `CoreError` carrying a stable code, a kind the
//! caller can branch on, and an i18n message key. `anyhow` is used only at
//! orchestration seams (worker loops, main wiring) where errors are logged
//! and converted into failure-queue rows.

use thiserror::Error;

/// Classifies an error by its blast radius and retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    /// User-visible input problem. Not retried.
    ValidationError,
    /// Malformed file or record. Fails the whole batch.
    ParseError,
    /// Illegal state-machine edge. Programmer error, logged loudly.
    InvalidTransition,
    /// Uploaded bytes do not match the declared digests.
    ChecksumMismatch,
    /// No FX rate for (currency, date). Record-scoped, batch continues.
    FxRateUnavailable,
    /// Rule expression failed to parse or evaluate. Rule-scoped.
    EvaluationError,
    /// Per-batch deadline exceeded.
    Timeout,
    /// Infrastructure fault, retried through the failure queue.
    SystemError,
    /// Retry budget exhausted; operator attention required.
    PermanentFailure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "VALIDATION_ERROR",
            ErrorKind::ParseError => "PARSE_ERROR",
            ErrorKind::InvalidTransition => "INVALID_TRANSITION",
            ErrorKind::ChecksumMismatch => "CHECKSUM_MISMATCH",
            ErrorKind::FxRateUnavailable => "FX_RATE_UNAVAILABLE",
            ErrorKind::EvaluationError => "EVALUATION_ERROR",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::SystemError => "SYSTEM_ERROR",
            ErrorKind::PermanentFailure => "PERMANENT_FAILURE",
        }
    }
}

/// The error type returned across every core API boundary.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
#[error("{code}: {message_key}{}", .detail.as_deref().map(|d| format!(" ({d})")).unwrap_or_default())]
pub struct CoreError {
    pub kind: ErrorKind,
    pub code: String,
    pub message_key: String,
    pub detail: Option<String>,
}

impl CoreError {
    pub fn new(kind: ErrorKind, code: impl Into<String>, message_key: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message_key: message_key.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn validation(code: impl Into<String>, message_key: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationError, code, message_key)
    }

    pub fn parse(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::ParseError, "PARSE_ERROR", "error.batch.parse").with_detail(detail)
    }

    /// Parse failure pinned to a specific record index in the source file.
    pub fn parse_at(index: usize, detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::ParseError, "PARSE_ERROR", "error.batch.parse")
            .with_detail(format!("record {}: {}", index, detail.into()))
    }

    pub fn invalid_transition(from: &str, to: &str) -> Self {
        Self::new(
            ErrorKind::InvalidTransition,
            "INVALID_TRANSITION",
            "error.batch.invalid_transition",
        )
        .with_detail(format!("{from} -> {to}"))
    }

    pub fn checksum_mismatch(which: &str, expected: &str, actual: &str) -> Self {
        Self::new(
            ErrorKind::ChecksumMismatch,
            "CHECKSUM_MISMATCH",
            "error.storage.checksum",
        )
        .with_detail(format!("{which}: expected {expected}, got {actual}"))
    }

    pub fn fx_unavailable(currency: &str, date: chrono::NaiveDate) -> Self {
        Self::new(
            ErrorKind::FxRateUnavailable,
            "FX_RATE_UNAVAILABLE",
            "error.fx.rate_unavailable",
        )
        .with_detail(format!("{currency} on {date}"))
    }

    pub fn evaluation(rule_id: &str, detail: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::EvaluationError,
            "EVALUATION_ERROR",
            "error.rule.evaluation",
        )
        .with_detail(format!("rule {}: {}", rule_id, detail.into()))
    }

    pub fn timeout(elapsed_secs: u64) -> Self {
        Self::new(ErrorKind::Timeout, "TIMEOUT", "error.batch.timeout")
            .with_detail(format!("deadline exceeded after {elapsed_secs}s"))
    }

    pub fn system(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::SystemError, "SYSTEM_ERROR", "error.system").with_detail(detail)
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        CoreError::system(format!("sqlite: {e}"))
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::system(format!("io: {e}"))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::parse(format!("json: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_code_and_detail() {
        let err = CoreError::invalid_transition("COMPLETED", "PARSING");
        let text = err.to_string();
        assert!(text.contains("INVALID_TRANSITION"));
        assert!(text.contains("COMPLETED -> PARSING"));
    }

    #[test]
    fn test_kind_strings_are_stable() {
        assert_eq!(ErrorKind::FxRateUnavailable.as_str(), "FX_RATE_UNAVAILABLE");
        assert_eq!(ErrorKind::ChecksumMismatch.as_str(), "CHECKSUM_MISMATCH");
    }

    #[test]
    fn test_parse_at_carries_record_index() {
        let err = CoreError::parse_at(17, "missing exposure_id");
        assert!(err.detail.as_deref().unwrap().contains("record 17"));
    }
}
