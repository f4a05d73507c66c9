//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, used across the
//! pipeline. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different failure classes the system
//! distinguishes:
//!
//! - **`Config`** / **`Configuration`**: parsing errors from the `config`
//!   crate versus semantic errors caught during validation (bad addresses,
//!   zero-sized buffers).
//! - **`Io`**: wraps `std::io::Error`, covering all file and socket I/O.
//! - **`MalformedRecord`**: a wire or file record that cannot be decoded
//!   (short buffer, wrong magic). Fatal for file headers, per-record
//!   recoverable everywhere else.
//! - **`ModuleIndexOutOfRange`**: a datagram arrived from an address whose
//!   derived module index is outside the camera. Fatal in strict mode since
//!   it indicates a miswired network topology.
//! - **`CrcMismatch`**: a framed file chunk failed its checksum. Recoverable;
//!   callers log and skip the chunk.
//!
//! By using `#[from]`, `DaqError` can be seamlessly created from underlying
//! error types, so the `?` operator works throughout the crate.

use thiserror::Error;

/// Convenience alias for results using the pipeline error type.
pub type DaqResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    #[error("Unknown record type byte 0x{0:02x}")]
    UnknownRecordType(u8),

    #[error("Module index {index} derived from {addr} out of range 0..{n_modules} (strict mode)")]
    ModuleIndexOutOfRange {
        index: i64,
        addr: String,
        n_modules: usize,
    },

    #[error("CRC mismatch in chunk {index}: stored {stored:#010x}, computed {computed:#010x}")]
    CrcMismatch {
        index: usize,
        stored: u32,
        computed: u32,
    },

    #[error("Publish error on sink '{sink}': {message}")]
    Publish { sink: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DaqError {
    /// True when processing may continue after logging the error; false for
    /// configuration/topology errors that must stop the process.
    pub fn is_recoverable(&self) -> bool {
        match self {
            DaqError::Config(_)
            | DaqError::Configuration(_)
            | DaqError::ModuleIndexOutOfRange { .. } => false,
            DaqError::Io(_)
            | DaqError::MalformedRecord(_)
            | DaqError::UnknownRecordType(_)
            | DaqError::CrcMismatch { .. }
            | DaqError::Publish { .. }
            | DaqError::Serialization(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_mode_index_error_is_fatal() {
        let err = DaqError::ModuleIndexOutOfRange {
            index: 98,
            addr: "192.168.0.199".into(),
            n_modules: 32,
        };
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("192.168.0.199"));
    }

    #[test]
    fn crc_mismatch_is_recoverable() {
        let err = DaqError::CrcMismatch {
            index: 3,
            stored: 0xdead_beef,
            computed: 0x1234_5678,
        };
        assert!(err.is_recoverable());
    }
}
