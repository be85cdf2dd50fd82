//! DFU-Core: Nordic BLE DFU transfer engine in Rust.
//!
//! This crate implements the firmware transfer protocol spoken by Nordic
//! nRF5 bootloaders over BLE, in both the legacy (SDK < 12) and secure
//! (SDK >= 12) dialects.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Opcode tables, characteristic UUIDs, notification codec
//! - **Transport**: BLE link abstraction (simulated device, mock)
//! - **State**: Legacy and secure transfer state machines
//! - **Payload**: Firmware/init loading (raw binary, Intel-HEX), object partition
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: High-level controller and configuration
//!
//! # Example
//!
//! ```no_run
//! use dfu_core::session::{DfuSession, TransferConfig};
//! use dfu_core::transport::SimulatedDevice;
//!
//! let config = TransferConfig {
//!     firmware_path: Some("app.hex".to_string()),
//!     init_path: Some("app.dat".to_string()),
//!     ..Default::default()
//! };
//!
//! let session = DfuSession::new(config);
//! let (image, init) = session.load_inputs().expect("inputs");
//! let device = SimulatedDevice::secure();
//! session.run(&device, &image, &init).expect("DFU failed");
//! ```

pub mod error;
pub mod events;
pub mod payload;
pub mod protocol;
pub mod session;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use error::TransferError;
pub use events::{DfuEvent, DfuObserver, DfuPhase, LogLevel, NullObserver, TracingObserver};
pub use payload::{FirmwareImage, ImageError, InitData, ObjectPartition, ObjectSpan, PrefixCrc};
pub use protocol::{CodecError, Dialect, Notification};
pub use session::{AbortHandle, Completed, DfuSession, ModeSwitch, TransferConfig};
pub use state::{DfuTransfer, LegacyTransfer, SecureTransfer, TransferContext};
pub use transport::{DfuLink, Fault, LinkError, MockLink, SimulatedDevice};
