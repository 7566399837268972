//! Store error shared by the catalog, progress, reply-context, message-log and
//! schedule stores.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("database error: {0}")]
    Database(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Map a sqlx error raised by `operation`.
    ///
    /// Unique violations (`23505`) become [`StoreError::Conflict`]; everything
    /// else is a [`StoreError::Database`] carrying the operation name.
    pub fn from_sqlx(operation: &str, err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let msg = format!("database error in {}: {}", operation, db_err.message());
                match db_err.code().as_deref() {
                    Some("23505") => StoreError::Conflict(msg),
                    _ => StoreError::Database(msg),
                }
            }
            sqlx::Error::PoolClosed => {
                StoreError::Database(format!("connection pool closed in {}", operation))
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Serialization(format!("failed to decode row in {}: {}", operation, err))
            }
            _ => StoreError::Database(format!("sqlx error in {}: {}", operation, err)),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        StoreError::Serialization(value.to_string())
    }
}
