//! Error types for pgvault.

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A source file disappeared before or during the read.
    #[error("file missing: {0}")]
    FileMissing(String),

    /// Integrity checksum of a loaded manifest did not match.
    #[error("checksum error: {0}")]
    Checksum(String),

    /// Persisted data could not be parsed.
    #[error("format error: {0}")]
    Format(String),

    /// Cluster identity does not match the stanza.
    #[error("backup mismatch: {0}")]
    BackupMismatch(String),

    #[error("WAL segment {segment} was not archived before the {timeout:?} timeout")]
    ArchiveTimeout { segment: String, timeout: Duration },

    /// Offline backup refused because the cluster is running.
    #[error("postmaster is running: {0}")]
    PostmasterRunning(String),

    #[error("protocol timeout: {0}")]
    ProtocolTimeout(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unable to connect to host: {0}")]
    HostConnect(String),

    #[error("database error: {0}")]
    Db(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("compression error: {0}")]
    Compress(String),

    #[error("cipher error: {0}")]
    Cipher(String),

    #[error("invalid option: {0}")]
    OptionInvalid(String),

    /// Internal invariant violation. Always a bug.
    #[error("assertion failed: {0}")]
    Assert(String),
}

impl Error {
    /// Stable numeric code used on the wire so a remote failure
    /// reconstructs the same error kind on the local side.
    pub fn code(&self) -> u32 {
        match self {
            Error::Io(_) => 29,
            Error::Json(_) => 30,
            Error::FileMissing(_) => 55,
            Error::Checksum(_) => 40,
            Error::Format(_) => 41,
            Error::BackupMismatch(_) => 51,
            Error::ArchiveTimeout { .. } => 62,
            Error::PostmasterRunning(_) => 64,
            Error::ProtocolTimeout(_) => 66,
            Error::Protocol(_) => 67,
            Error::HostConnect(_) => 68,
            Error::Db(_) => 69,
            Error::Storage(_) => 70,
            Error::Compress(_) => 71,
            Error::Cipher(_) => 72,
            Error::OptionInvalid(_) => 31,
            Error::Assert(_) => 25,
        }
    }

    /// Rebuild an error from a wire code and message.
    pub fn from_code(code: u32, message: String) -> Self {
        match code {
            55 => Error::FileMissing(message),
            40 => Error::Checksum(message),
            41 => Error::Format(message),
            51 => Error::BackupMismatch(message),
            64 => Error::PostmasterRunning(message),
            66 => Error::ProtocolTimeout(message),
            68 => Error::HostConnect(message),
            69 => Error::Db(message),
            70 => Error::Storage(message),
            71 => Error::Compress(message),
            72 => Error::Cipher(message),
            31 => Error::OptionInvalid(message),
            25 => Error::Assert(message),
            _ => Error::Protocol(message),
        }
    }

    /// True when the error is recoverable by skipping the file
    /// (the source was removed while the backup was running).
    pub fn is_file_missing(&self) -> bool {
        match self {
            Error::FileMissing(_) => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip() {
        let err = Error::FileMissing("pg_data/missing".into());
        let rebuilt = Error::from_code(err.code(), "pg_data/missing".into());
        assert!(matches!(rebuilt, Error::FileMissing(_)));

        let err = Error::Assert("bad invariant".into());
        let rebuilt = Error::from_code(err.code(), "bad invariant".into());
        assert!(matches!(rebuilt, Error::Assert(_)));
    }

    #[test]
    fn test_unknown_code_maps_to_protocol() {
        let rebuilt = Error::from_code(9999, "who knows".into());
        assert!(matches!(rebuilt, Error::Protocol(_)));
    }

    #[test]
    fn test_file_missing_detection() {
        let io = Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(io.is_file_missing());

        let io = Error::Io(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope"));
        assert!(!io.is_file_missing());
    }
}
