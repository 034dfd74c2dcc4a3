use thiserror::Error;

/// Errors surfaced by the progress engine and its stores.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Store error: {0}")]
    Store(String),
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Store(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for EngineError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        EngineError::Store(format!("migration failed: {err}"))
    }
}
