use crate::types::ErrorInfo;
use chrono::{DateTime, Local};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("daily quota exceeded; {remaining} remaining, resets at {}", .reset_at.to_rfc3339())]
    QuotaExceeded {
        remaining: u32,
        reset_at: DateTime<Local>,
    },
    #[error("unknown principal: {0}")]
    UnknownPrincipal(String),
}

/// Failures produced by the request queue itself, never by the queued work.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("request queue is shut down")]
    Closed,
    #[error("job ended without delivering an outcome")]
    Abandoned,
}

/// Failure of the external model or storage call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct BackendError {
    pub code: String,
    pub message: String,
    pub retriable: bool,
}

impl BackendError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, retriable: bool) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retriable,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error("video analysis failed: {0}")]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl AnalysisError {
    pub fn code(&self) -> &str {
        match self {
            AnalysisError::Invalid(_) => "invalid_request",
            AnalysisError::Admission(AdmissionError::QuotaExceeded { .. }) => "quota_exceeded",
            AnalysisError::Admission(AdmissionError::UnknownPrincipal(_)) => "unknown_principal",
            AnalysisError::Backend(e) => &e.code,
            AnalysisError::Queue(QueueError::Closed) => "queue_closed",
            AnalysisError::Queue(QueueError::Abandoned) => "job_abandoned",
        }
    }

    /// Whether the same request may succeed if sent again later.
    pub fn retriable(&self) -> bool {
        match self {
            AnalysisError::Invalid(_) => false,
            AnalysisError::Admission(AdmissionError::QuotaExceeded { .. }) => true,
            AnalysisError::Admission(AdmissionError::UnknownPrincipal(_)) => false,
            AnalysisError::Backend(e) => e.retriable,
            AnalysisError::Queue(QueueError::Closed) => false,
            AnalysisError::Queue(QueueError::Abandoned) => true,
        }
    }

    pub fn to_error_info(&self) -> ErrorInfo {
        ErrorInfo {
            code: self.code().to_string(),
            message: self.to_string(),
            retriable: self.retriable(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn error_code_matrix() {
        let reset_at = Local.with_ymd_and_hms(2026, 3, 11, 0, 0, 0).unwrap();
        let quota = AnalysisError::from(AdmissionError::QuotaExceeded {
            remaining: 0,
            reset_at,
        });
        assert_eq!(quota.code(), "quota_exceeded");
        assert!(quota.retriable());

        let unknown = AnalysisError::from(AdmissionError::UnknownPrincipal("p".into()));
        assert_eq!(unknown.code(), "unknown_principal");
        assert!(!unknown.retriable());

        let upstream = AnalysisError::from(BackendError::new("rate_limited", "slow down", true));
        assert_eq!(upstream.code(), "rate_limited");
        assert!(upstream.retriable());

        assert_eq!(AnalysisError::from(QueueError::Closed).code(), "queue_closed");
        assert_eq!(AnalysisError::Invalid("x".into()).code(), "invalid_request");
    }

    #[test]
    fn error_info_carries_message() {
        let info = AnalysisError::from(BackendError::new("not_found", "no such object", false))
            .to_error_info();
        assert_eq!(info.code, "not_found");
        assert!(info.message.contains("no such object"));
        assert!(!info.retriable);
    }
}
