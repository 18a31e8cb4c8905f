// Error taxonomy shared by every layer
//
// Host shims translate native failures into these kinds; the router turns
// them into `error` responses. Nothing host-specific crosses this boundary.

use crate::types::Lifecycle;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub type VoltronResult<T> = Result<T, VoltronError>;

#[derive(Debug, Error)]
pub enum VoltronError {
    #[error("No adaptor registered for host: {0}")]
    UnsupportedHost(String),

    #[error("Duplicate registration: {0}")]
    DuplicateRegistration(String),

    #[error("Target is not stopped (state: {0})")]
    NotStopped(Lifecycle),

    #[error("Invalid address range {address:#x}+{length}")]
    InvalidAddress { address: u64, length: u64 },

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Target gone: {0}")]
    TargetGone(String),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
}

/// Wire-level name of an error, carried in `error_kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    UnsupportedHost,
    DuplicateRegistration,
    NotStopped,
    InvalidAddress,
    Unsupported,
    NotFound,
    Timeout,
    TargetGone,
    MalformedRequest,
    UnknownCommand,
    InvalidArguments,
}

impl VoltronError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsupportedHost(_) => ErrorKind::UnsupportedHost,
            Self::DuplicateRegistration(_) => ErrorKind::DuplicateRegistration,
            Self::NotStopped(_) => ErrorKind::NotStopped,
            Self::InvalidAddress { .. } => ErrorKind::InvalidAddress,
            Self::Unsupported(_) => ErrorKind::Unsupported,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::TargetGone(_) => ErrorKind::TargetGone,
            Self::MalformedRequest(_) => ErrorKind::MalformedRequest,
            Self::UnknownCommand(_) => ErrorKind::UnknownCommand,
            Self::InvalidArguments(_) => ErrorKind::InvalidArguments,
        }
    }

    /// Registry failures are fatal to session start; everything else is
    /// scoped to a single request.
    pub fn is_startup_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::UnsupportedHost | ErrorKind::DuplicateRegistration
        )
    }
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnsupportedHost => "UnsupportedHost",
            Self::DuplicateRegistration => "DuplicateRegistration",
            Self::NotStopped => "NotStopped",
            Self::InvalidAddress => "InvalidAddress",
            Self::Unsupported => "Unsupported",
            Self::NotFound => "NotFound",
            Self::Timeout => "Timeout",
            Self::TargetGone => "TargetGone",
            Self::MalformedRequest => "MalformedRequest",
            Self::UnknownCommand => "UnknownCommand",
            Self::InvalidArguments => "InvalidArguments",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_serializes_as_name() {
        let err = VoltronError::NotStopped(Lifecycle::Running);
        assert_eq!(err.kind(), ErrorKind::NotStopped);
        assert_eq!(
            serde_json::to_value(err.kind()).unwrap(),
            serde_json::json!("NotStopped")
        );
        assert_eq!(err.to_string(), "Target is not stopped (state: running)");
    }

    #[test]
    fn test_startup_fatal_kinds() {
        assert!(VoltronError::UnsupportedHost("vdb".into()).is_startup_fatal());
        assert!(VoltronError::DuplicateRegistration("gdb".into()).is_startup_fatal());
        assert!(!VoltronError::TargetGone("exited".into()).is_startup_fatal());
    }

    #[test]
    fn test_invalid_address_message() {
        let err = VoltronError::InvalidAddress {
            address: 0x1000,
            length: 16,
        };
        assert_eq!(err.to_string(), "Invalid address range 0x1000+16");
        assert_eq!(err.kind().as_str(), "InvalidAddress");
    }
}
