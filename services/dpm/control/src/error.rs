//! Control layer errors.

use dpm_power::TimerError;
use dpm_retention::RetentionError;
use dpm_session::DpmError;
use thiserror::Error;

/// Control layer errors
#[derive(Error, Debug)]
pub enum ControlError {
    /// Session layer failure
    #[error(transparent)]
    Session(#[from] DpmError),

    /// Retention store failure
    #[error("retention: {0}")]
    Retention(#[from] RetentionError),

    /// Timer service failure
    #[error("timer: {0}")]
    Timer(#[from] TimerError),

    /// Configuration blob could not be encoded
    #[error("config encode failed: {0}")]
    Encode(String),

    /// Configuration blob could not be decoded
    #[error("config decode failed: {0}")]
    Decode(String),

    /// Configuration blob carries the wrong magic
    #[error("bad config magic 0x{0:08x}")]
    BadMagic(u32),

    /// Configuration blob was written by another schema
    #[error("config schema {found}, expected {expected}")]
    SchemaMismatch {
        /// Schema found in the blob
        found: u16,
        /// Schema this build writes
        expected: u16,
    },

    /// User parameters of the wrong size
    #[error("user params are {expected} bytes, got {actual}")]
    ParamsSize {
        /// Declared size
        expected: usize,
        /// Size supplied
        actual: usize,
    },
}
