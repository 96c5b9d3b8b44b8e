use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use sqlx::Error as SqlxError;
use thiserror::Error;

/// Application-level error types
#[derive(Error, Debug)]
pub enum AppError {
    /// Empty content, malformed window parameter and similar input problems
    #[error("Validation error: {0}")]
    Validation(String),

    /// A second submission for a (user, opportunity) pair that already pitched
    #[error("You already pitched this opportunity")]
    DuplicateSubmission,

    /// Live pricing requested for an opportunity whose price is frozen
    #[error("Opportunity is closed: {0}")]
    OpportunityClosed(String),

    /// Store write failed or timed out; the caller may retry
    #[error("Temporary storage failure, please retry: {0}")]
    TransientStore(String),

    /// Price computation failed for a single opportunity
    #[error("Price computation failed: {0}")]
    Computation(String),

    /// Not found errors
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Unauthorized access errors
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error with message
    #[error("{0}")]
    Message(String),
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// Check if error is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::NotFound(_))
    }

    /// Stable machine-readable kind for API responses
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation",
            AppError::DuplicateSubmission => "duplicate_submission",
            AppError::OpportunityClosed(_) => "opportunity_closed",
            AppError::TransientStore(_) => "transient_store",
            AppError::Computation(_) => "computation",
            AppError::NotFound(_) => "not_found",
            AppError::Unauthorized(_) => "unauthorized",
            _ => "internal",
        }
    }

    /// Get HTTP status code for the error
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::Validation(_) => 400,
            AppError::Unauthorized(_) => 401,
            AppError::NotFound(_) => 404,
            AppError::DuplicateSubmission => 409,
            AppError::OpportunityClosed(_) => 410,
            AppError::TransientStore(_) => 503,
            _ => 500,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        // Store and internal details stay in the logs
        let message = match &self {
            AppError::Config(_) | AppError::Message(_) => {
                tracing::error!("Request failed: {}", self);
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        };

        let body = axum::Json(json!({
            "error": message,
            "kind": self.kind(),
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

/// Repository-specific error types
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// Database query error
    #[error("Query error: {0}")]
    Query(SqlxError),

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Duplicate record
    #[error("Duplicate record: {0}")]
    Duplicate(String),

    /// Constraint violation
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The store did not answer within its bounded wait
    #[error("Store timed out: {0}")]
    Timeout(String),

    /// The store could not be reached
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl RepositoryError {
    /// Failures worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, RepositoryError::Timeout(_) | RepositoryError::Unavailable(_))
    }
}

impl From<RepositoryError> for AppError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(msg) => AppError::NotFound(msg),
            RepositoryError::Duplicate(_) => AppError::DuplicateSubmission,
            RepositoryError::ConstraintViolation(msg) => AppError::Validation(msg),
            RepositoryError::InvalidInput(msg) => AppError::Validation(msg),
            RepositoryError::Timeout(msg) | RepositoryError::Unavailable(msg) => {
                AppError::TransientStore(msg)
            }
            RepositoryError::Query(e) => AppError::TransientStore(e.to_string()),
        }
    }
}

impl From<SqlxError> for RepositoryError {
    fn from(err: SqlxError) -> Self {
        match &err {
            SqlxError::RowNotFound => RepositoryError::NotFound("Record not found".to_string()),
            SqlxError::PoolTimedOut => {
                RepositoryError::Timeout("Timed out acquiring a connection".to_string())
            }
            SqlxError::PoolClosed | SqlxError::Io(_) => {
                RepositoryError::Unavailable(err.to_string())
            }
            SqlxError::Database(db_err) => {
                // Check for common PostgreSQL error codes
                let code = db_err.code().map(|c| c.to_string());
                match code.as_deref() {
                    // Unique violation
                    Some("23505") => RepositoryError::Duplicate(db_err.message().to_string()),
                    // Foreign key / check violation
                    Some("23503") | Some("23514") => {
                        RepositoryError::ConstraintViolation(db_err.message().to_string())
                    }
                    // lock_not_available / query_canceled (statement_timeout)
                    Some("55P03") | Some("57014") => {
                        RepositoryError::Timeout(db_err.message().to_string())
                    }
                    _ => RepositoryError::Query(err),
                }
            }
            _ => RepositoryError::Query(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_maps_to_duplicate_submission() {
        let err: AppError =
            RepositoryError::Duplicate("pitches_user_opportunity_key".into()).into();
        assert!(matches!(err, AppError::DuplicateSubmission));
        assert_eq!(err.status_code(), 409);
        assert_eq!(err.kind(), "duplicate_submission");
    }

    #[test]
    fn test_timeouts_are_transient() {
        let repo_err = RepositoryError::Timeout("lock".into());
        assert!(repo_err.is_transient());

        let err: AppError = repo_err.into();
        assert!(matches!(err, AppError::TransientStore(_)));
        assert_eq!(err.status_code(), 503);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(AppError::Validation("empty".into()).status_code(), 400);
        assert_eq!(AppError::Unauthorized("anon".into()).status_code(), 401);
        assert_eq!(AppError::OpportunityClosed("frozen".into()).status_code(), 410);
        assert_eq!(AppError::Computation("nan".into()).status_code(), 500);
    }

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let repo_err: RepositoryError = SqlxError::RowNotFound.into();
        assert!(matches!(repo_err, RepositoryError::NotFound(_)));
        let err: AppError = repo_err.into();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_into_response_uses_status_code() {
        let response = AppError::DuplicateSubmission.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = AppError::Config("missing DATABASE_URL".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
