use common::error::{ErrorKind, Kinded};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("backend failure: {0}")]
    Backend(String),

    #[error("migration step {version} failed: {message}")]
    Migration { version: u32, message: String },

    #[error("row decode failure: {0}")]
    Decode(String),
}

impl Kinded for StoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound { .. } => ErrorKind::NotFound,
            StoreError::Constraint(_) => ErrorKind::Usage,
            _ => ErrorKind::Internal,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                entity: "row",
                key: String::new(),
            },
            rusqlite::Error::SqliteFailure(code, Some(msg))
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Constraint(msg)
            }
            other => StoreError::Backend(other.to_string()),
        }
    }
}

#[cfg(feature = "postgres")]
impl From<tokio_postgres::Error> for StoreError {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(db) = err.as_db_error() {
            if db.code().code().starts_with("23") {
                return StoreError::Constraint(db.message().to_string());
            }
        }
        StoreError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Decode(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
