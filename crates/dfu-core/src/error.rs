//! Transfer error taxonomy.
//!
//! Recoverable conditions (checksum mismatch or a missing checkpoint in the
//! secure dialect) are absorbed by the state machine as object retransmits
//! and never reach the caller. Everything here is terminal.

use thiserror::Error;

use crate::protocol::CodecError;
use crate::transport::LinkError;

#[derive(Error, Debug)]
pub enum TransferError {
    /// Undecodable notification: malformed, or an unknown opcode,
    /// procedure or result.
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("Expected a response to {expected}, got {actual}")]
    UnexpectedResponse {
        expected: &'static str,
        actual: String,
    },

    #[error("{procedure} failed: {result} (0x{code:02X})")]
    ProcedureFailed {
        procedure: &'static str,
        result: &'static str,
        code: u8,
    },

    #[error("Checksum mismatch at offset {offset}: expected 0x{expected:08X}, device reported 0x{actual:08X}")]
    ChecksumMismatch {
        offset: usize,
        expected: u32,
        actual: u32,
    },

    #[error("No notification within {timeout_ms}ms")]
    NotificationTimeout { timeout_ms: u64 },

    #[error("Link lost")]
    LinkLost,

    #[error("Link error: {0}")]
    Link(LinkError),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("{0} is empty")]
    EmptyPayload(&'static str),

    #[error("Image of {size} bytes does not fit the 32-bit size field")]
    ImageTooLarge { size: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Cancelled after {bytes_sent}/{total} bytes")]
    Cancelled { bytes_sent: usize, total: usize },

    #[error("Object at offset {offset} failed after {attempts} attempts")]
    RetriesExhausted { offset: usize, attempts: u32 },
}

impl From<LinkError> for TransferError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::Disconnected => TransferError::LinkLost,
            other => TransferError::Link(other),
        }
    }
}
