//! Transport layer module.

pub mod mock;
pub mod simulated;
pub mod traits;

pub use mock::{LinkWrite, MockLink, WriteKind};
pub use simulated::{DeviceStats, Fault, SimulatedDevice};
pub use traits::{DfuLink, LinkError};
