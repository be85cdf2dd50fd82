//! Control point command encoding.
//!
//! Commands are written to the control point characteristic; decoding is
//! used by the simulated device.

use byteorder::{ByteOrder, LittleEndian};

use super::constants::{LEGACY_INIT_BEGIN, LEGACY_INIT_END, LEGACY_SIZE_PADDING};
use super::legacy::LegacyOpcode;
use super::notification::{CodecError, require_len};
use super::secure::{ObjectKind, SecureOpcode};

/// Legacy control point command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyCommand {
    StartDfu { image_type: u8 },
    /// `complete == false` opens the init packet, `true` closes it.
    InitDfu { complete: bool },
    ReceiveFirmwareImage,
    ValidateFirmware,
    ActivateImageAndReset,
    ResetSystem,
    ReportReceivedImageSize,
    PrnRequest { interval: u16 },
}

impl LegacyCommand {
    pub fn opcode(&self) -> LegacyOpcode {
        match self {
            Self::StartDfu { .. } => LegacyOpcode::StartDfu,
            Self::InitDfu { .. } => LegacyOpcode::InitDfu,
            Self::ReceiveFirmwareImage => LegacyOpcode::ReceiveFirmwareImage,
            Self::ValidateFirmware => LegacyOpcode::ValidateFirmware,
            Self::ActivateImageAndReset => LegacyOpcode::ActivateImageAndReset,
            Self::ResetSystem => LegacyOpcode::ResetSystem,
            Self::ReportReceivedImageSize => LegacyOpcode::ReportReceivedImageSize,
            Self::PrnRequest { .. } => LegacyOpcode::PrnRequest,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![self.opcode().code()];
        match *self {
            Self::StartDfu { image_type } => buf.push(image_type),
            Self::InitDfu { complete } => buf.push(if complete {
                LEGACY_INIT_END
            } else {
                LEGACY_INIT_BEGIN
            }),
            Self::PrnRequest { interval } => buf.extend_from_slice(&interval.to_le_bytes()),
            _ => {}
        }
        buf
    }

    pub fn decode(raw: &[u8]) -> Result<Self, CodecError> {
        require_len(raw, 1)?;
        let opcode = LegacyOpcode::from_code(raw[0]).ok_or(CodecError::UnknownOpcode(raw[0]))?;
        let cmd = match opcode {
            LegacyOpcode::StartDfu => {
                require_len(raw, 2)?;
                Self::StartDfu { image_type: raw[1] }
            }
            LegacyOpcode::InitDfu => {
                require_len(raw, 2)?;
                Self::InitDfu {
                    complete: raw[1] == LEGACY_INIT_END,
                }
            }
            LegacyOpcode::ReceiveFirmwareImage => Self::ReceiveFirmwareImage,
            LegacyOpcode::ValidateFirmware => Self::ValidateFirmware,
            LegacyOpcode::ActivateImageAndReset => Self::ActivateImageAndReset,
            LegacyOpcode::ResetSystem => Self::ResetSystem,
            LegacyOpcode::ReportReceivedImageSize => Self::ReportReceivedImageSize,
            LegacyOpcode::PrnRequest => {
                require_len(raw, 3)?;
                Self::PrnRequest {
                    interval: LittleEndian::read_u16(&raw[1..3]),
                }
            }
            LegacyOpcode::Response | LegacyOpcode::PacketReceiptNotification => {
                return Err(CodecError::UnknownOpcode(raw[0]));
            }
        };
        Ok(cmd)
    }
}

/// Image size packet sent on the data characteristic after START_DFU:
/// softdevice and bootloader sizes (zero) followed by the application size.
pub fn legacy_image_size_packet(app_size: u32) -> [u8; LEGACY_SIZE_PADDING + 4] {
    let mut buf = [0u8; LEGACY_SIZE_PADDING + 4];
    LittleEndian::write_u32(&mut buf[LEGACY_SIZE_PADDING..], app_size);
    buf
}

/// Secure control point command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureCommand {
    Create { kind: ObjectKind, size: u32 },
    SetPrn { interval: u16 },
    CalcChecksum,
    Execute,
    Select { kind: ObjectKind },
}

impl SecureCommand {
    pub fn opcode(&self) -> SecureOpcode {
        match self {
            Self::Create { .. } => SecureOpcode::Create,
            Self::SetPrn { .. } => SecureOpcode::SetPrn,
            Self::CalcChecksum => SecureOpcode::CalcChecksum,
            Self::Execute => SecureOpcode::Execute,
            Self::Select { .. } => SecureOpcode::Select,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![self.opcode().code()];
        match *self {
            Self::Create { kind, size } => {
                buf.push(kind.code());
                buf.extend_from_slice(&size.to_le_bytes());
            }
            Self::SetPrn { interval } => buf.extend_from_slice(&interval.to_le_bytes()),
            Self::Select { kind } => buf.push(kind.code()),
            Self::CalcChecksum | Self::Execute => {}
        }
        buf
    }

    pub fn decode(raw: &[u8]) -> Result<Self, CodecError> {
        require_len(raw, 1)?;
        let opcode = SecureOpcode::from_code(raw[0]).ok_or(CodecError::UnknownOpcode(raw[0]))?;
        let kind_at = |i: usize| -> Result<ObjectKind, CodecError> {
            require_len(raw, i + 1)?;
            ObjectKind::from_code(raw[i]).ok_or(CodecError::UnknownObjectKind(raw[i]))
        };
        let cmd = match opcode {
            SecureOpcode::Create => {
                require_len(raw, 6)?;
                Self::Create {
                    kind: kind_at(1)?,
                    size: LittleEndian::read_u32(&raw[2..6]),
                }
            }
            SecureOpcode::SetPrn => {
                require_len(raw, 3)?;
                Self::SetPrn {
                    interval: LittleEndian::read_u16(&raw[1..3]),
                }
            }
            SecureOpcode::CalcChecksum => Self::CalcChecksum,
            SecureOpcode::Execute => Self::Execute,
            SecureOpcode::Select => Self::Select { kind: kind_at(1)? },
            SecureOpcode::Response => return Err(CodecError::UnknownOpcode(raw[0])),
        };
        Ok(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_start_and_size() {
        let start = LegacyCommand::StartDfu { image_type: 0x04 };
        assert_eq!(start.encode(), vec![0x01, 0x04]);

        let size = legacy_image_size_packet(23);
        assert_eq!(size, [0, 0, 0, 0, 0, 0, 0, 0, 23, 0, 0, 0]);
    }

    #[test]
    fn test_legacy_prn_request() {
        let cmd = LegacyCommand::PrnRequest { interval: 10 };
        assert_eq!(cmd.encode(), vec![0x08, 0x0A, 0x00]);
        assert_eq!(LegacyCommand::decode(&cmd.encode()).unwrap(), cmd);
    }

    #[test]
    fn test_legacy_init_markers() {
        assert_eq!(
            LegacyCommand::InitDfu { complete: false }.encode(),
            vec![0x02, 0x00]
        );
        assert_eq!(
            LegacyCommand::InitDfu { complete: true }.encode(),
            vec![0x02, 0x01]
        );
    }

    #[test]
    fn test_secure_create() {
        let cmd = SecureCommand::Create {
            kind: ObjectKind::Data,
            size: 4096,
        };
        assert_eq!(cmd.encode(), vec![0x01, 0x02, 0x00, 0x10, 0x00, 0x00]);
        assert_eq!(SecureCommand::decode(&cmd.encode()).unwrap(), cmd);
    }

    #[test]
    fn test_secure_decode_rejects_bad_kind() {
        assert_eq!(
            SecureCommand::decode(&[0x06, 0x03]).unwrap_err(),
            CodecError::UnknownObjectKind(0x03)
        );
        assert!(matches!(
            SecureCommand::decode(&[0x01, 0x01, 0x00]).unwrap_err(),
            CodecError::Malformed { expected: 6, .. }
        ));
    }
}
