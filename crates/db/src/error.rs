//! Errors raised by the automation store.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    /// Query, connection or transaction failure.
    #[error("automation store query failed: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// The automation or enrollment does not exist (or was soft-deleted
    /// where only live rows qualify).
    #[error("automation or enrollment not found")]
    NotFound,

    #[error("schema migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A stored value could not be interpreted (unknown status text, bad JSON).
    #[error("corrupt row: {0}")]
    Corrupt(String),
}
