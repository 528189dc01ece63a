//! Error types for the file server session layer

use crate::auth::session::AuthState;
use crate::session::{PeerAddress, ProtocolId};
use std::convert::TryFrom;
use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for file server operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the session and authentication layer
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Protocol parsing error
    #[error("Protocol parsing error: {0}")]
    ParseError(String),

    /// Invalid SMB header
    #[error("Invalid SMB header: {0}")]
    InvalidHeader(String),

    /// Buffer too small
    #[error("Buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },

    /// A security blob window does not fit inside its buffer. This is a
    /// framing bug in the transport, never a client condition.
    #[error("Invalid token window: offset {offset} + length {length} exceeds buffer of {buffer_len} bytes")]
    InvalidTokenWindow {
        offset: usize,
        length: usize,
        buffer_len: usize,
    },

    /// The response blob of a security blob can only be set once
    #[error("Response blob already set")]
    ResponseAlreadySet,

    /// The authentication exchange already reached a terminal state
    #[error("Authentication already resolved: session is {0}")]
    SessionAlreadyResolved(AuthState),

    /// The transport handed a factory an address it cannot serve
    #[error("Unsupported remote address for {protocol} session: {address}")]
    UnsupportedAddress {
        protocol: ProtocolId,
        address: PeerAddress,
    },

    /// No session factory is registered for the protocol
    #[error("No session factory registered for protocol {0}")]
    UnsupportedProtocol(ProtocolId),

    /// Authentication error
    #[error("Authentication error: {0}")]
    AuthenticationError(String),

    /// Encryption or hashing error
    #[error("Encryption/Decryption error: {0}")]
    CryptoError(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Access denied
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// File data not found in the store
    #[error("File data not found: {0}")]
    FileNotFound(String),

    /// Connection closed
    #[error("Connection closed")]
    ConnectionClosed,
}

/// SMB protocol status codes (subset of NTSTATUS)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NtStatus {
    /// The operation completed successfully
    Success = 0x00000000,
    /// More processing required
    MoreProcessingRequired = 0xC0000016,
    /// The request is not supported
    NotSupported = 0xC00000BB,
    /// Access denied
    AccessDenied = 0xC0000022,
    /// The parameter is incorrect
    InvalidParameter = 0xC000000D,
    /// The user name or password is incorrect
    LogonFailure = 0xC000006D,
    /// The session was deleted
    UserSessionDeleted = 0xC0000203,
    /// Not implemented
    NotImplemented = 0xC0000002,
    /// Insufficient resources
    InsufficientResources = 0xC000009A,
}

impl TryFrom<u32> for NtStatus {
    type Error = ();

    fn try_from(value: u32) -> std::result::Result<Self, Self::Error> {
        match value {
            0x00000000 => Ok(NtStatus::Success),
            0xC0000016 => Ok(NtStatus::MoreProcessingRequired),
            0xC00000BB => Ok(NtStatus::NotSupported),
            0xC0000022 => Ok(NtStatus::AccessDenied),
            0xC000000D => Ok(NtStatus::InvalidParameter),
            0xC000006D => Ok(NtStatus::LogonFailure),
            0xC0000203 => Ok(NtStatus::UserSessionDeleted),
            0xC0000002 => Ok(NtStatus::NotImplemented),
            0xC000009A => Ok(NtStatus::InsufficientResources),
            _ => Err(()),
        }
    }
}

impl NtStatus {
    /// Check if this is a success status
    pub fn is_success(self) -> bool {
        self == NtStatus::Success
    }

    /// Check if this is an error status
    pub fn is_error(self) -> bool {
        (self as u32) & 0xC0000000 == 0xC0000000
    }

    /// Create from a raw u32 value
    pub fn from_u32(value: u32) -> Self {
        value.try_into().unwrap_or(NtStatus::InvalidParameter)
    }
}

impl fmt::Display for NtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            NtStatus::Success => "Success",
            NtStatus::MoreProcessingRequired => "More processing required",
            NtStatus::NotSupported => "Not supported",
            NtStatus::AccessDenied => "Access denied",
            NtStatus::InvalidParameter => "Invalid parameter",
            NtStatus::LogonFailure => "Logon failure",
            NtStatus::UserSessionDeleted => "User session deleted",
            NtStatus::NotImplemented => "Not implemented",
            NtStatus::InsufficientResources => "Insufficient resources",
        };
        write!(f, "{} (0x{:08X})", msg, *self as u32)
    }
}
