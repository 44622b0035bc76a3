//! Error types for the emulation layer.

use std::time::Duration;

use thiserror::Error;

/// Emulation error type
#[derive(Error, Debug)]
pub enum EmulationError {
    /// A legacy-dialect token could not be translated (strict mode only)
    #[error("cannot translate '{token}': {reason}")]
    Translation {
        /// The offending token, verbatim
        token: String,
        /// Why it was rejected
        reason: String,
    },

    /// A mount token could not be parsed
    #[error("invalid mount '{token}': {reason}")]
    InvalidMount {
        /// The offending token, verbatim
        token: String,
        /// Why it was rejected
        reason: &'static str,
    },

    /// A mounted host directory could not be opened
    #[error("mount error: {0}")]
    Mount(String),

    /// The module bytes could not be read or compiled
    #[error("module load failed: {0}")]
    ModuleLoad(String),

    /// Linking or instantiation failed
    #[error("instantiation failed: {0}")]
    Instantiation(String),

    /// The module trapped without requesting an exit code
    #[error("module trapped: {0}")]
    Trap(String),

    /// The requested execution deadline elapsed
    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    /// A requested resource limit was hit
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for emulation operations
pub type Result<T> = std::result::Result<T, EmulationError>;
