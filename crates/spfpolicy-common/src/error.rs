//! Error types for spfpolicy

use thiserror::Error;

/// Main error type for spfpolicy
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("SPF engine error: {0}")]
    Engine(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for spfpolicy
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Engine(_) => "ENGINE_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }
}
