use thiserror::Error;

/// Typed error taxonomy shared by every pipeline component.
///
/// Callers branch on the variant (or [`PipelineError::kind`]) instead of
/// matching message text; only `CoordUnavailable` is retried by the
/// coordination client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("over quota: counter {name} would reach {proposed} (max {max})")]
    OverQuota { name: String, proposed: i64, max: i64 },

    #[error("coordination service unavailable: {0}")]
    CoordUnavailable(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("build warning: {0}")]
    BuildWarning(String),

    #[error("failed to apply config, router response: {0}")]
    PushTransportFailure(String),

    #[error("push timed out: {0}")]
    PushTimeout(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("version mismatch on {0}")]
    BadVersion(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    /// Stable snake_case name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::ResourceExhausted(_) => "resource_exhausted",
            PipelineError::OverQuota { .. } => "over_quota",
            PipelineError::CoordUnavailable(_) => "coord_unavailable",
            PipelineError::BadRequest(_) => "bad_request",
            PipelineError::BuildWarning(_) => "build_warning",
            PipelineError::PushTransportFailure(_) => "push_transport_failure",
            PipelineError::PushTimeout(_) => "push_timeout",
            PipelineError::Conflict(_) => "conflict",
            PipelineError::NotFound(_) => "not_found",
            PipelineError::NodeExists(_) => "node_exists",
            PipelineError::BadVersion(_) => "bad_version",
            PipelineError::Cancelled => "cancelled",
            PipelineError::Serialization(_) => "serialization",
            PipelineError::Internal(_) => "internal",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::CoordUnavailable(_))
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        PipelineError::Serialization(e.to_string())
    }
}

/// Only connection-level failures of the store are transient. Query,
/// decode and constraint errors propagate without retry.
impl From<sqlx::Error> for PipelineError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => PipelineError::CoordUnavailable(e.to_string()),
            other => PipelineError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(PipelineError::ResourceExhausted("ae".into()).kind(), "resource_exhausted");
        assert_eq!(
            PipelineError::OverQuota { name: "vn".into(), proposed: 11, max: 10 }.kind(),
            "over_quota"
        );
        assert_eq!(PipelineError::BadRequest("x".into()).kind(), "bad_request");
        assert_eq!(PipelineError::PushTimeout("x".into()).kind(), "push_timeout");
    }

    #[test]
    fn test_only_coord_unavailable_retries() {
        assert!(PipelineError::CoordUnavailable("down".into()).is_retryable());
        assert!(!PipelineError::NodeExists("/a".into()).is_retryable());
        assert!(!PipelineError::BadVersion("/a".into()).is_retryable());
        assert!(!PipelineError::Cancelled.is_retryable());
    }

    #[test]
    fn test_sqlx_errors_split_transient_from_permanent() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        for transient in [
            sqlx::Error::Io(io),
            sqlx::Error::PoolTimedOut,
            sqlx::Error::PoolClosed,
            sqlx::Error::WorkerCrashed,
        ] {
            let e = PipelineError::from(transient);
            assert_eq!(e.kind(), "coord_unavailable");
            assert!(e.is_retryable());
        }
        for permanent in [
            sqlx::Error::RowNotFound,
            sqlx::Error::ColumnNotFound("value".into()),
            sqlx::Error::Protocol("bad frame".into()),
        ] {
            let e = PipelineError::from(permanent);
            assert_eq!(e.kind(), "internal");
            assert!(!e.is_retryable());
        }
    }

    #[test]
    fn test_transport_failure_message() {
        let e = PipelineError::PushTransportFailure("commit check failed".into());
        assert_eq!(
            e.to_string(),
            "failed to apply config, router response: commit check failed"
        );
    }
}
