//! Errors that stop the service from starting or running.

use super::config::ConfigError;
use crate::delivery::DeliveryError;
use crate::store::LedgerError;

#[derive(Debug)]
pub enum ServerError {
    Config(ConfigError),
    /// The ledger backend could not be opened
    Store(LedgerError),
    /// The initial connection to the target failed
    Connect(DeliveryError),
    Io(std::io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Config(e) => write!(f, "configuration error: {}", e),
            ServerError::Store(e) => write!(f, "cannot open ledger: {}", e),
            ServerError::Connect(e) => write!(f, "{}", e),
            ServerError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Config(e) => Some(e),
            ServerError::Store(e) => Some(e),
            ServerError::Connect(e) => Some(e),
            ServerError::Io(e) => Some(e),
        }
    }
}

impl From<ConfigError> for ServerError {
    fn from(e: ConfigError) -> Self {
        ServerError::Config(e)
    }
}

impl From<LedgerError> for ServerError {
    fn from(e: LedgerError) -> Self {
        ServerError::Store(e)
    }
}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        ServerError::Io(e)
    }
}
