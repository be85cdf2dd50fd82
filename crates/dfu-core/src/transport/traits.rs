//! BLE link abstraction.
//!
//! Defines the `DfuLink` trait the transfer engine drives, allowing
//! different implementations (a GATT backend, the simulated device, the
//! scripted mock used by unit tests).

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Link lost")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connected GATT link to one DFU target.
///
/// The link is exclusively owned by one transfer at a time. Notifications
/// are delivered in the order the device emitted them.
pub trait DfuLink: Send + Sync {
    /// Enable notifications on a characteristic.
    fn subscribe(&self, characteristic: Uuid) -> Result<(), LinkError>;

    /// Write with response. Returns `LinkError::Timeout` when the write
    /// was not acknowledged in time.
    fn write_command(&self, characteristic: Uuid, value: &[u8]) -> Result<(), LinkError>;

    /// Write without response.
    fn write_data(&self, characteristic: Uuid, value: &[u8]) -> Result<(), LinkError>;

    /// Read a characteristic value.
    fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, LinkError>;

    /// Whether the peer exposes the characteristic.
    fn has_characteristic(&self, characteristic: Uuid) -> Result<bool, LinkError>;

    /// Block for the next notification. `Ok(None)` when `timeout` elapses.
    fn wait_for_notification(&self, timeout: Duration) -> Result<Option<Vec<u8>>, LinkError>;

    /// Whether the connection is still up.
    fn is_alive(&self) -> bool;
}
