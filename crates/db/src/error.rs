//! Database error types

use kgfusion_core::CoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Schema initialization failed: {0}")]
    SchemaInit(String),

    #[error("SurrealDB error: {0}")]
    Surreal(#[from] surrealdb::Error),
}

impl From<DbError> for CoreError {
    fn from(err: DbError) -> Self {
        CoreError::Store(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DbError>;
