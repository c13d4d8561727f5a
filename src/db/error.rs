use sqlx::error::ErrorKind;
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("schema setup failed: {0}")]
    Schema(#[from] sqlx::migrate::MigrateError),

    /// A CHECK constraint rejected the row (out-of-range percentage, bad topic, ...).
    #[error("constraint violation: {constraint}")]
    ConstraintViolation { constraint: String },

    /// A unique key collided with an existing row.
    #[error("integrity conflict: {constraint}")]
    IntegrityConflict { constraint: String },

    /// The referenced device does not exist.
    #[error("foreign key violation: {constraint}")]
    ForeignKey { constraint: String },

    #[error("record not found")]
    NotFound,

    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        let classified = match &err {
            sqlx::Error::Database(db_err) => {
                let constraint = db_err.constraint().unwrap_or("unknown").to_owned();
                match db_err.kind() {
                    ErrorKind::CheckViolation => Some(Self::ConstraintViolation { constraint }),
                    ErrorKind::UniqueViolation => Some(Self::IntegrityConflict { constraint }),
                    ErrorKind::ForeignKeyViolation => Some(Self::ForeignKey { constraint }),
                    _ => None,
                }
            }
            sqlx::Error::RowNotFound => Some(Self::NotFound),
            _ => None,
        };
        classified.unwrap_or_else(|| Self::Database(err))
    }
}
