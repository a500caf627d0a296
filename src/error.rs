//! Error types for Resona

use thiserror::Error;

/// Error class recorded in a context's last-error slot.
///
/// These are the local, non-fatal failures an API call can hit. They are
/// carried inside [`ResonaError::Code`] and mirrored into the owning
/// context's last-error slot, which the caller polls and which clears on
/// read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Operation referenced a buffer, source, context, or device that does
    /// not exist.
    InvalidHandle,
    /// Unrecognized parameter or name token (unknown filter slot, unknown
    /// backend name, unknown config symbol).
    InvalidEnum,
    /// Out-of-range numeric argument (negative gain, zero pitch,
    /// non-normalizable orientation).
    InvalidValue,
    /// State-machine violation (dequeue of a pending buffer, queueing onto a
    /// statically-attached source, deleting a referenced buffer).
    InvalidOperation,
    /// Allocation failure in one of the pools.
    OutOfMemory,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::InvalidHandle => "invalid handle",
            Self::InvalidEnum => "invalid enum",
            Self::InvalidValue => "invalid value",
            Self::InvalidOperation => "invalid operation",
            Self::OutOfMemory => "out of memory",
        };
        write!(f, "{}", name)
    }
}

#[derive(Error, Debug)]
pub enum ResonaError {
    /// A classified API failure; the [`ErrorCode`] is also recorded in the
    /// owning context's last-error slot.
    #[error("{0}: {1}")]
    Code(ErrorCode, String),

    #[error("Audio device error: {0}")]
    Device(String),

    #[error("Audio format error: {0}")]
    Format(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Audio loading error: {0}")]
    Loading(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ResonaError {
    /// Returns the [`ErrorCode`] if this is a classified API failure.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Code(code, _) => Some(*code),
            _ => None,
        }
    }

    pub(crate) fn invalid_handle(msg: impl Into<String>) -> Self {
        Self::Code(ErrorCode::InvalidHandle, msg.into())
    }

    pub(crate) fn invalid_enum(msg: impl Into<String>) -> Self {
        Self::Code(ErrorCode::InvalidEnum, msg.into())
    }

    pub(crate) fn invalid_value(msg: impl Into<String>) -> Self {
        Self::Code(ErrorCode::InvalidValue, msg.into())
    }

    pub(crate) fn invalid_operation(msg: impl Into<String>) -> Self {
        Self::Code(ErrorCode::InvalidOperation, msg.into())
    }
}

pub type Result<T> = std::result::Result<T, ResonaError>;
