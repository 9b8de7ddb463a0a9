use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type used across this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (socket, OS, etc.).
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Operation timed out.
    #[error("timeout waiting for response")]
    Timeout,

    /// Peer responded with an unexpected or invalid packet.
    #[error("protocol error: {0}")]
    Protocol(&'static str),

    /// Peer responded with an unexpected or invalid packet.
    #[error("protocol error: {0}")]
    ProtocolOwned(String),

    /// Authentication or integrity verification failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(&'static str),

    /// Cryptographic failure (invalid key sizes, decrypt failure, etc.).
    #[error("crypto error: {0}")]
    Crypto(&'static str),

    /// Unsupported configuration or protocol feature.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// Invalid caller-supplied argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// An IPMI command completed with a non-zero completion code.
    #[error("ipmi command netfn {netfn:#04x} cmd {cmd:#04x} failed: completion code {completion_code:#04x}")]
    CompletionCode {
        /// Network function of the failing request.
        netfn: u8,
        /// Command number of the failing request.
        cmd: u8,
        /// Raw completion code returned by the BMC.
        completion_code: u8,
    },

    /// A buffer is too short (or a value too long) for a template field.
    #[error("field `{field}` needs {expected} bits, {available} available")]
    FieldLength {
        /// Field name.
        field: &'static str,
        /// Bits required by the field.
        expected: usize,
        /// Bits left in the buffer.
        available: usize,
    },

    /// A buffer is longer than its template allows.
    #[error("{extra} bytes beyond the end of the template")]
    TrailingBytes {
        /// Number of bytes left over after the last field.
        extra: usize,
    },

    /// A field name is not part of the template.
    #[error("unknown field `{0}`")]
    UnknownField(String),

    /// A field was read, or required for encoding, before being set.
    #[error("field `{0}` is not set")]
    FieldNotSet(&'static str),

    /// A value does not fit in the declared width of its field.
    #[error("value {value:#x} does not fit in {bits}-bit field `{field}`")]
    FieldOverflow {
        /// Field name.
        field: &'static str,
        /// Declared field width.
        bits: u32,
        /// Rejected value.
        value: u64,
    },

    /// The SDR cache file exists and overwriting was not requested.
    #[error("sdr cache already exists: {}", .0.display())]
    CacheExists(PathBuf),

    /// The SDR cache file cannot be created because of permissions.
    #[error("permission denied: {}", .0.display())]
    Permission(PathBuf),

    /// The SDR cache path is not usable (missing directory, too long, loops).
    #[error("invalid sdr cache filename: {}", .0.display())]
    FilenameInvalid(PathBuf),

    /// The filesystem refused the SDR cache (out of space, too many files).
    #[error("filesystem error: {0}")]
    Filesystem(#[source] io::Error),

    /// An SDR record has a length inconsistent with its header or buffer bound.
    #[error("sdr record {record_id:#06x}: invalid length (declared {declared}, actual {actual})")]
    InvalidRecordLength {
        /// Record being read.
        record_id: u16,
        /// Length declared by the remote side.
        declared: usize,
        /// Length actually received (or the buffer bound).
        actual: usize,
    },

    /// The repository record count does not match the records returned.
    #[error("sdr repository declared {declared} records, {actual} read")]
    InvalidRecordCount {
        /// Count reported by Get SDR Repository Info.
        declared: u16,
        /// Records actually traversed.
        actual: u32,
    },

    /// Two records share the same record id.
    #[error("duplicate sdr record id {0:#06x}")]
    DuplicateRecordId(u16),

    /// Two sensor records share the same sensor number.
    #[error("duplicate sensor number {0:#04x}")]
    DuplicateSensorNumber(u8),

    /// The repository reservation kept getting cancelled.
    #[error("sdr reservation cancelled {attempts} times")]
    ReservationRetriesExhausted {
        /// Re-acquisitions performed before giving up.
        attempts: u32,
    },

    /// An SDR cache file is malformed.
    #[error("invalid sdr cache: {0}")]
    CacheFormat(&'static str),
}

impl Error {
    pub(crate) fn protocol_owned(msg: impl Into<String>) -> Self {
        Self::ProtocolOwned(msg.into())
    }

    /// Return the completion code when this error is a non-zero command completion.
    pub fn completion_code(&self) -> Option<u8> {
        match self {
            Self::CompletionCode {
                completion_code, ..
            } => Some(*completion_code),
            _ => None,
        }
    }
}
