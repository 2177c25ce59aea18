//! Error types for event store operations.
//!
//! Maps database driver failures onto a small taxonomy so callers can tell
//! a missing row from a constraint violation without inspecting SQLSTATE
//! codes themselves.

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Error type for core and storage operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Entity not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Constraint violation.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// Invalid input.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested row not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                Self::ConstraintViolation(format!("foreign key violation: {db_err}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidInput(format!("invalid JSON: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_not_found_maps_to_not_found() {
        let error = CoreError::from(sqlx::Error::RowNotFound);
        assert!(matches!(error, CoreError::NotFound(_)));
    }

    #[test]
    fn pool_errors_map_to_database() {
        let error = CoreError::from(sqlx::Error::PoolTimedOut);
        assert!(matches!(error, CoreError::Database(_)));
        assert!(error.to_string().starts_with("database error"));
    }

    #[test]
    fn json_errors_map_to_invalid_input() {
        let parse_error = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let error = CoreError::from(parse_error);
        assert!(matches!(error, CoreError::InvalidInput(_)));
    }
}
