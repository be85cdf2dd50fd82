//! Secure DFU (Nordic SDK >= 12) control point tables.

wire_enum! {
    /// Control point opcodes.
    pub enum SecureOpcode {
        Create = 0x01 => "CREATE",
        SetPrn = 0x02 => "SET_PRN",
        CalcChecksum = 0x03 => "CALC_CHECKSUM",
        Execute = 0x04 => "EXECUTE",
        Select = 0x06 => "SELECT",
        /// Notification opcode for every response.
        Response = 0x60 => "RESPONSE",
    }
}

wire_enum! {
    /// Object kinds addressed by SELECT and CREATE.
    pub enum ObjectKind {
        /// Init packet (command object).
        Command = 0x01 => "COMMAND",
        /// Firmware data object.
        Data = 0x02 => "DATA",
    }
}

wire_enum! {
    /// Result codes carried in a RESPONSE notification.
    pub enum SecureResult {
        InvalidCode = 0x00 => "INVALID_CODE",
        Success = 0x01 => "SUCCESS",
        OpcodeNotSupported = 0x02 => "OPCODE_NOT_SUPPORTED",
        InvalidParameter = 0x03 => "INVALID_PARAMETER",
        InsufficientResources = 0x04 => "INSUFFICIENT_RESOURCES",
        InvalidObject = 0x05 => "INVALID_OBJECT",
        UnsupportedType = 0x07 => "UNSUPPORTED_TYPE",
        OperationNotPermitted = 0x08 => "OPERATION_NOT_PERMITTED",
        OperationFailed = 0x0A => "OPERATION_FAILED",
    }
}

impl SecureResult {
    pub fn is_success(self) -> bool {
        self == SecureResult::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_table() {
        assert_eq!(SecureOpcode::Create.code(), 0x01);
        assert_eq!(SecureOpcode::SetPrn.code(), 0x02);
        assert_eq!(SecureOpcode::CalcChecksum.code(), 0x03);
        assert_eq!(SecureOpcode::Execute.code(), 0x04);
        assert_eq!(SecureOpcode::Select.code(), 0x06);
        assert_eq!(SecureOpcode::Response.code(), 0x60);
        // 0x05 is a gap in the table
        assert_eq!(SecureOpcode::from_code(0x05), None);
    }

    #[test]
    fn test_result_table_has_gaps() {
        assert_eq!(SecureResult::from_code(0x06), None);
        assert_eq!(SecureResult::from_code(0x09), None);
        assert_eq!(
            SecureResult::from_code(0x0A),
            Some(SecureResult::OperationFailed)
        );
        assert_eq!(
            SecureResult::InsufficientResources.name(),
            "INSUFFICIENT_RESOURCES"
        );
    }

    #[test]
    fn test_object_kind() {
        assert_eq!(u8::from(ObjectKind::Command), 1);
        assert_eq!(ObjectKind::try_from(2u8), Ok(ObjectKind::Data));
    }
}
