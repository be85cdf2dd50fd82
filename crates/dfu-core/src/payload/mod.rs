//! Payload handling module.
//!
//! Loads firmware images and init packets, and splits them into the
//! segments and objects the transfer engine sends.

pub mod firmware;
pub mod ihex;
pub mod objects;

pub use firmware::{FirmwareImage, ImageError, InitData, SegmentIter};
pub use objects::{ObjectPartition, ObjectSpan, PrefixCrc, object_start};
