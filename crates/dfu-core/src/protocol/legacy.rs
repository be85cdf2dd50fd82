//! Legacy DFU (Nordic SDK < 12) control point tables.
//!
//! Values must match the bootloader bit-for-bit.

wire_enum! {
    /// Control point opcodes.
    pub enum LegacyOpcode {
        StartDfu = 1 => "START_DFU",
        InitDfu = 2 => "INITIALIZE_DFU",
        ReceiveFirmwareImage = 3 => "RECEIVE_FIRMWARE_IMAGE",
        ValidateFirmware = 4 => "VALIDATE_FIRMWARE",
        ActivateImageAndReset = 5 => "ACTIVATE_IMAGE_AND_RESET",
        ResetSystem = 6 => "RESET_SYSTEM",
        ReportReceivedImageSize = 7 => "REPORT_RECEIVED_IMAGE_SIZE",
        PrnRequest = 8 => "PACKET_RECEIPT_NOTIFICATION_REQUEST",
        /// Notification opcode: response to a procedure.
        Response = 16 => "RESPONSE",
        /// Notification opcode: periodic packet receipt.
        PacketReceiptNotification = 17 => "PACKET_RECEIPT_NOTIFICATION",
    }
}

wire_enum! {
    /// Result codes carried in a RESPONSE notification.
    pub enum LegacyResult {
        Success = 1 => "SUCCESS",
        InvalidState = 2 => "INVALID_STATE",
        NotSupported = 3 => "NOT_SUPPORTED",
        DataSizeExceedsLimits = 4 => "DATA_SIZE_EXCEEDS_LIMITS",
        CrcError = 5 => "CRC_ERROR",
        OperationFailed = 6 => "OPERATION_FAILED",
    }
}

impl LegacyResult {
    pub fn is_success(self) -> bool {
        self == LegacyResult::Success
    }
}
