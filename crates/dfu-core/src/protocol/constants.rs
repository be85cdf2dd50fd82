//! Protocol constants shared by both dialects.

use uuid::Uuid;

// ============================================================================
// Legacy DFU service (SDK < 12)
// ============================================================================

/// Legacy control point characteristic (write + notify).
pub const LEGACY_CONTROL_POINT_UUID: Uuid =
    Uuid::from_u128(0x00001531_1212_efde_1523_785feabcd123);

/// Legacy packet characteristic (write without response).
pub const LEGACY_PACKET_UUID: Uuid = Uuid::from_u128(0x00001532_1212_efde_1523_785feabcd123);

/// Legacy DFU version characteristic (read).
pub const LEGACY_VERSION_UUID: Uuid = Uuid::from_u128(0x00001534_1212_efde_1523_785feabcd123);

/// Version value reported while the legacy bootloader is running.
pub const LEGACY_DFU_MODE_VERSION: [u8; 2] = [0x08, 0x00];

/// START_DFU parameter: application image.
pub const LEGACY_IMAGE_TYPE_APPLICATION: u8 = 0x04;

/// INIT_DFU parameter: init packet follows.
pub const LEGACY_INIT_BEGIN: u8 = 0x00;

/// INIT_DFU parameter: init packet complete.
pub const LEGACY_INIT_END: u8 = 0x01;

/// Softdevice + bootloader size fields preceding the application size.
pub const LEGACY_SIZE_PADDING: usize = 8;

// ============================================================================
// Secure DFU service (SDK >= 12)
// ============================================================================

/// Buttonless DFU characteristic, present only in application mode.
pub const SECURE_BUTTONLESS_UUID: Uuid = Uuid::from_u128(0x8e400001_f315_4f60_9fb8_838830daea50);

/// Secure control point characteristic (write + notify).
pub const SECURE_CONTROL_POINT_UUID: Uuid =
    Uuid::from_u128(0x8ec90001_f315_4f60_9fb8_838830daea50);

/// Secure packet characteristic (write without response).
pub const SECURE_PACKET_UUID: Uuid = Uuid::from_u128(0x8ec90002_f315_4f60_9fb8_838830daea50);

/// Buttonless "enter bootloader" request.
pub const SECURE_ENTER_BOOTLOADER: u8 = 0x01;

/// The secure bootloader advertises at the application address + 1.
pub const SECURE_BOOTLOADER_ADDRESS_OFFSET: u8 = 1;

// ============================================================================
// Transfer defaults
// ============================================================================

/// Data write size; bounded by the default ATT payload (MTU 23 - 3).
pub const DEFAULT_SEGMENT_SIZE: usize = 20;

/// Data writes between checkpoint notifications.
pub const DEFAULT_PACKET_RECEIPT_INTERVAL: u16 = 10;

/// Bounded wait for any single notification.
pub const DEFAULT_NOTIFICATION_TIMEOUT_MS: u64 = 30_000;

/// Pause before ACTIVATE_IMAGE_AND_RESET so the bootloader can finish copying.
pub const DEFAULT_ACTIVATION_DELAY_MS: u64 = 1_000;

/// Pause after requesting the switch into the bootloader.
pub const DEFAULT_MODE_SWITCH_DELAY_MS: u64 = 500;

/// Shortest notification either dialect can emit (opcode, procedure, result).
pub const MIN_NOTIFICATION_LEN: usize = 3;
