//! Notification codec.
//!
//! Decodes raw control point notifications into typed events. Every decode
//! is bounds-checked up front, so short payloads surface as
//! [`CodecError::Malformed`] rather than a slice panic.

use byteorder::{ByteOrder, LittleEndian};
use std::fmt;
use thiserror::Error;

use super::Dialect;
use super::constants::MIN_NOTIFICATION_LEN;
use super::legacy::{LegacyOpcode, LegacyResult};
use super::secure::{SecureOpcode, SecureResult};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Malformed notification: need {expected} bytes, got {actual}")]
    Malformed { expected: usize, actual: usize },

    #[error("Unknown notification opcode 0x{0:02X}")]
    UnknownOpcode(u8),

    #[error("Unknown procedure 0x{0:02X}")]
    UnknownProcedure(u8),

    #[error("Unknown result code 0x{0:02X}")]
    UnknownResult(u8),

    #[error("Unknown object kind 0x{0:02X}")]
    UnknownObjectKind(u8),
}

pub(crate) fn require_len(raw: &[u8], expected: usize) -> Result<(), CodecError> {
    if raw.len() < expected {
        return Err(CodecError::Malformed {
            expected,
            actual: raw.len(),
        });
    }
    Ok(())
}

// ============================================================================
// Legacy
// ============================================================================

/// Decoded legacy control point notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyNotification {
    /// `RESPONSE, procedure, result`.
    Response {
        procedure: LegacyOpcode,
        result: LegacyResult,
    },
    /// `PACKET_RECEIPT_NOTIFICATION, bytes_acked (u32 LE)`.
    PacketReceipt { bytes_acked: u32 },
}

impl LegacyNotification {
    const RECEIPT_LEN: usize = 5;

    pub fn decode(raw: &[u8]) -> Result<Self, CodecError> {
        require_len(raw, MIN_NOTIFICATION_LEN)?;

        match LegacyOpcode::from_code(raw[0]) {
            Some(LegacyOpcode::Response) => {
                let procedure =
                    LegacyOpcode::from_code(raw[1]).ok_or(CodecError::UnknownProcedure(raw[1]))?;
                let result =
                    LegacyResult::from_code(raw[2]).ok_or(CodecError::UnknownResult(raw[2]))?;
                Ok(Self::Response { procedure, result })
            }
            Some(LegacyOpcode::PacketReceiptNotification) => {
                require_len(raw, Self::RECEIPT_LEN)?;
                Ok(Self::PacketReceipt {
                    bytes_acked: LittleEndian::read_u32(&raw[1..5]),
                })
            }
            _ => Err(CodecError::UnknownOpcode(raw[0])),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match *self {
            Self::Response { procedure, result } => {
                vec![LegacyOpcode::Response.code(), procedure.code(), result.code()]
            }
            Self::PacketReceipt { bytes_acked } => {
                let mut buf = vec![0u8; Self::RECEIPT_LEN];
                buf[0] = LegacyOpcode::PacketReceiptNotification.code();
                LittleEndian::write_u32(&mut buf[1..5], bytes_acked);
                buf
            }
        }
    }

    /// Result code; packet receipts are implicitly successful.
    pub fn result(&self) -> LegacyResult {
        match self {
            Self::Response { result, .. } => *result,
            Self::PacketReceipt { .. } => LegacyResult::Success,
        }
    }
}

impl fmt::Display for LegacyNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Response { procedure, result } => write!(f, "{procedure}: {result}"),
            Self::PacketReceipt { bytes_acked } => write!(f, "PRN: {bytes_acked} bytes"),
        }
    }
}

// ============================================================================
// Secure
// ============================================================================

/// Procedure-specific trailer of a successful secure response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurePayload {
    None,
    /// CALC_CHECKSUM (also the shape of packet receipts).
    Checksum { offset: u32, crc32: u32 },
    /// SELECT.
    Select { max_size: u32, offset: u32, crc32: u32 },
}

/// Decoded secure control point notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecureResponse {
    pub procedure: SecureOpcode,
    pub result: SecureResult,
    pub payload: SecurePayload,
}

impl SecureResponse {
    const CHECKSUM_LEN: usize = 11;
    const SELECT_LEN: usize = 15;

    /// Response with no trailer.
    pub fn status(procedure: SecureOpcode, result: SecureResult) -> Self {
        Self {
            procedure,
            result,
            payload: SecurePayload::None,
        }
    }

    /// Successful CALC_CHECKSUM response.
    pub fn checksum(offset: u32, crc32: u32) -> Self {
        Self {
            procedure: SecureOpcode::CalcChecksum,
            result: SecureResult::Success,
            payload: SecurePayload::Checksum { offset, crc32 },
        }
    }

    /// Successful SELECT response.
    pub fn select(max_size: u32, offset: u32, crc32: u32) -> Self {
        Self {
            procedure: SecureOpcode::Select,
            result: SecureResult::Success,
            payload: SecurePayload::Select {
                max_size,
                offset,
                crc32,
            },
        }
    }

    pub fn decode(raw: &[u8]) -> Result<Self, CodecError> {
        require_len(raw, MIN_NOTIFICATION_LEN)?;

        if raw[0] != SecureOpcode::Response.code() {
            return Err(CodecError::UnknownOpcode(raw[0]));
        }
        let procedure =
            SecureOpcode::from_code(raw[1]).ok_or(CodecError::UnknownProcedure(raw[1]))?;
        let result = SecureResult::from_code(raw[2]).ok_or(CodecError::UnknownResult(raw[2]))?;

        let payload = match (procedure, result) {
            (SecureOpcode::CalcChecksum, SecureResult::Success) => {
                require_len(raw, Self::CHECKSUM_LEN)?;
                SecurePayload::Checksum {
                    offset: LittleEndian::read_u32(&raw[3..7]),
                    crc32: LittleEndian::read_u32(&raw[7..11]),
                }
            }
            (SecureOpcode::Select, SecureResult::Success) => {
                require_len(raw, Self::SELECT_LEN)?;
                SecurePayload::Select {
                    max_size: LittleEndian::read_u32(&raw[3..7]),
                    offset: LittleEndian::read_u32(&raw[7..11]),
                    crc32: LittleEndian::read_u32(&raw[11..15]),
                }
            }
            _ => SecurePayload::None,
        };

        Ok(Self {
            procedure,
            result,
            payload,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![
            SecureOpcode::Response.code(),
            self.procedure.code(),
            self.result.code(),
        ];
        match self.payload {
            SecurePayload::None => {}
            SecurePayload::Checksum { offset, crc32 } => {
                let mut trailer = [0u8; 8];
                LittleEndian::write_u32(&mut trailer[0..4], offset);
                LittleEndian::write_u32(&mut trailer[4..8], crc32);
                buf.extend_from_slice(&trailer);
            }
            SecurePayload::Select {
                max_size,
                offset,
                crc32,
            } => {
                let mut trailer = [0u8; 12];
                LittleEndian::write_u32(&mut trailer[0..4], max_size);
                LittleEndian::write_u32(&mut trailer[4..8], offset);
                LittleEndian::write_u32(&mut trailer[8..12], crc32);
                buf.extend_from_slice(&trailer);
            }
        }
        buf
    }
}

impl fmt::Display for SecureResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.procedure, self.result)?;
        match self.payload {
            SecurePayload::None => Ok(()),
            SecurePayload::Checksum { offset, crc32 } => {
                write!(f, " (offset={offset}, crc=0x{crc32:08X})")
            }
            SecurePayload::Select {
                max_size,
                offset,
                crc32,
            } => write!(
                f,
                " (max_size={max_size}, offset={offset}, crc=0x{crc32:08X})"
            ),
        }
    }
}

// ============================================================================
// Either dialect
// ============================================================================

/// A notification decoded according to the active dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    Legacy(LegacyNotification),
    Secure(SecureResponse),
}

impl Notification {
    pub fn decode(dialect: Dialect, raw: &[u8]) -> Result<Self, CodecError> {
        match dialect {
            Dialect::Legacy => LegacyNotification::decode(raw).map(Self::Legacy),
            Dialect::Secure => SecureResponse::decode(raw).map(Self::Secure),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Legacy(n) => n.encode(),
            Self::Secure(r) => r.encode(),
        }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Legacy(n) => fmt::Display::fmt(n, f),
            Self::Secure(r) => fmt::Display::fmt(r, f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_payload_is_malformed() {
        for dialect in [Dialect::Legacy, Dialect::Secure] {
            for raw in [&[][..], &[0x60][..], &[0x10, 0x01][..]] {
                let err = Notification::decode(dialect, raw).unwrap_err();
                assert!(matches!(err, CodecError::Malformed { expected: 3, .. }));
            }
        }
    }

    #[test]
    fn test_every_legacy_response_decodes() {
        for &procedure in LegacyOpcode::ALL {
            for &result in LegacyResult::ALL {
                let n = LegacyNotification::Response { procedure, result };
                assert_eq!(LegacyNotification::decode(&n.encode()).unwrap(), n);
            }
        }
    }

    #[test]
    fn test_every_secure_status_decodes() {
        for &procedure in SecureOpcode::ALL {
            for &result in SecureResult::ALL {
                let has_trailer = result.is_success()
                    && matches!(procedure, SecureOpcode::CalcChecksum | SecureOpcode::Select);
                if has_trailer {
                    continue;
                }
                let r = SecureResponse::status(procedure, result);
                assert_eq!(SecureResponse::decode(&r.encode()).unwrap(), r);
            }
        }
    }

    #[test]
    fn test_legacy_packet_receipt() {
        let raw = [0x11, 0xC8, 0x00, 0x00, 0x00];
        let n = LegacyNotification::decode(&raw).unwrap();
        assert_eq!(n, LegacyNotification::PacketReceipt { bytes_acked: 200 });
        assert_eq!(n.result(), LegacyResult::Success);

        // opcode ok, count truncated
        let err = LegacyNotification::decode(&raw[..4]).unwrap_err();
        assert_eq!(
            err,
            CodecError::Malformed {
                expected: 5,
                actual: 4
            }
        );
    }

    #[test]
    fn test_secure_checksum_payload() {
        let raw = [
            0x60, 0x03, 0x01, // CALC_CHECKSUM SUCCESS
            0x00, 0x01, 0x00, 0x00, // offset 256
            0x78, 0x56, 0x34, 0x12, // crc
        ];
        let r = SecureResponse::decode(&raw).unwrap();
        assert_eq!(
            r.payload,
            SecurePayload::Checksum {
                offset: 256,
                crc32: 0x1234_5678
            }
        );
        assert_eq!(r, SecureResponse::checksum(256, 0x1234_5678));
    }

    #[test]
    fn test_secure_select_payload() {
        let r = SecureResponse::select(4096, 300, 0xDEAD_BEEF);
        let raw = r.encode();
        assert_eq!(raw.len(), 15);
        assert_eq!(&raw[3..7], &[0x00, 0x10, 0x00, 0x00]);
        assert_eq!(SecureResponse::decode(&raw).unwrap(), r);

        let err = SecureResponse::decode(&raw[..14]).unwrap_err();
        assert!(matches!(err, CodecError::Malformed { expected: 15, .. }));
    }

    #[test]
    fn test_failed_select_carries_no_payload() {
        let raw = [0x60, 0x06, 0x05];
        let r = SecureResponse::decode(&raw).unwrap();
        assert_eq!(r.result, SecureResult::InvalidObject);
        assert_eq!(r.payload, SecurePayload::None);
    }

    #[test]
    fn test_unknown_values() {
        assert_eq!(
            SecureResponse::decode(&[0x61, 0x01, 0x01]).unwrap_err(),
            CodecError::UnknownOpcode(0x61)
        );
        assert_eq!(
            SecureResponse::decode(&[0x60, 0x05, 0x01]).unwrap_err(),
            CodecError::UnknownProcedure(0x05)
        );
        assert_eq!(
            SecureResponse::decode(&[0x60, 0x01, 0x06]).unwrap_err(),
            CodecError::UnknownResult(0x06)
        );
        assert_eq!(
            LegacyNotification::decode(&[0x10, 0x09, 0x01]).unwrap_err(),
            CodecError::UnknownProcedure(0x09)
        );
        assert_eq!(
            LegacyNotification::decode(&[0x10, 0x01, 0x07]).unwrap_err(),
            CodecError::UnknownResult(0x07)
        );
        assert_eq!(
            LegacyNotification::decode(&[0x01, 0x01, 0x01]).unwrap_err(),
            CodecError::UnknownOpcode(0x01)
        );
    }
}
