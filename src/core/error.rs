use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Data layer error: {0}")]
    DataLayer(String),

    #[error("Data layer write to store '{0}' was not confirmed")]
    SyncFailed(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Corrupted organization '{0}', no registryId on the data layer, can not import")]
    CorruptedOrganization(String),

    #[error("Organization '{0}' has no registry, can not import")]
    MissingRegistry(String),

    #[error("Can not subscribe to '{0}', please import this organization first")]
    NotImported(String),

    #[error("No record in '{0}' matches {1}")]
    NotFound(String, String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Column '{0}' is not a known unit column")]
    InvalidColumn(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

impl RegistryError {
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, Self::ConstraintViolation(_))
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;

impl<T> From<std::sync::PoisonError<T>> for RegistryError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<hex::FromHexError> for RegistryError {
    fn from(err: hex::FromHexError) -> Self {
        Self::Serialization(format!("invalid hex payload: {}", err))
    }
}

impl From<std::string::FromUtf8Error> for RegistryError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Self::Serialization(format!("invalid utf-8 payload: {}", err))
    }
}

impl From<reqwest::Error> for RegistryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else {
            Self::DataLayer(err.to_string())
        }
    }
}

impl From<tokio::time::error::Elapsed> for RegistryError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Self::Timeout(err.to_string())
    }
}

/// Runs `work`, failing with [`RegistryError::Timeout`] once `limit` elapses.
pub async fn bounded<T>(
    limit: Duration,
    call: &str,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, work).await {
        Ok(result) => result,
        Err(_) => Err(RegistryError::Timeout(format!(
            "{} did not finish within {:?}",
            call, limit
        ))),
    }
}
