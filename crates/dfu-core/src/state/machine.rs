//! Per-transfer session state shared by both dialect state machines.

use std::fmt;

use crate::protocol::{Dialect, ObjectKind};

/// Legacy dialect states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LegacyState {
    #[default]
    Idle,
    AwaitingSizeAck,
    AwaitingInitAck,
    Streaming,
    AwaitingValidation,
    Activated,
}

impl fmt::Display for LegacyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LegacyState::Idle => write!(f, "IDLE"),
            LegacyState::AwaitingSizeAck => write!(f, "AWAITING_SIZE_ACK"),
            LegacyState::AwaitingInitAck => write!(f, "AWAITING_INIT_ACK"),
            LegacyState::Streaming => write!(f, "STREAMING"),
            LegacyState::AwaitingValidation => write!(f, "AWAITING_VALIDATION"),
            LegacyState::Activated => write!(f, "ACTIVATED"),
        }
    }
}

/// Secure dialect states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecureState {
    #[default]
    Idle,
    /// SET_PRN sent.
    Configuring,
    /// Sending the init packet as a command object.
    InitObject,
    /// Sending firmware data objects.
    FirmwareObjects,
    /// Every object executed.
    Complete,
}

impl fmt::Display for SecureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecureState::Idle => write!(f, "IDLE"),
            SecureState::Configuring => write!(f, "CONFIGURING"),
            SecureState::InitObject => write!(f, "INIT_OBJECT"),
            SecureState::FirmwareObjects => write!(f, "FIRMWARE_OBJECTS"),
            SecureState::Complete => write!(f, "COMPLETE"),
        }
    }
}

/// Device-side view of the selected secure object, as last reported by
/// SELECT and refreshed at every checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectInfo {
    pub kind: ObjectKind,
    pub max_size: usize,
    /// Bytes the device holds for this object kind.
    pub offset: usize,
    /// Device CRC-32 over `[0, offset)`.
    pub crc32: u32,
}

/// Counts data writes since the last checkpoint.
#[derive(Debug, Clone, Copy)]
pub struct SegmentCounter {
    interval: u16,
    since_checkpoint: u16,
}

impl SegmentCounter {
    /// An interval of 0 disables checkpoints.
    pub fn new(interval: u16) -> Self {
        Self {
            interval,
            since_checkpoint: 0,
        }
    }

    /// Record one segment. Returns true when a checkpoint is due.
    pub fn record(&mut self) -> bool {
        if self.interval == 0 {
            return false;
        }
        self.since_checkpoint += 1;
        if self.since_checkpoint >= self.interval {
            self.since_checkpoint = 0;
            return true;
        }
        false
    }

    pub fn reset(&mut self) {
        self.since_checkpoint = 0;
    }

    /// Segments written since the last checkpoint.
    pub fn in_flight(&self) -> u16 {
        self.since_checkpoint
    }
}

/// Mutable state for one transfer run.
#[derive(Debug)]
pub struct TransferSession<S> {
    pub dialect: Dialect,
    pub state: S,
    /// Logical offset into the stream currently being sent.
    pub offset: usize,
    pub packet_receipt_interval: u16,
    /// Firmware bytes acknowledged so far.
    pub bytes_sent: usize,
    pub total: usize,
    /// Secure only: the active object.
    pub object: Option<ObjectInfo>,
    pub objects: usize,
    pub retransmits: u32,
}

impl<S: Copy + Default + fmt::Display> TransferSession<S> {
    pub fn new(dialect: Dialect, total: usize, packet_receipt_interval: u16) -> Self {
        Self {
            dialect,
            state: S::default(),
            offset: 0,
            packet_receipt_interval,
            bytes_sent: 0,
            total,
            object: None,
            objects: 0,
            retransmits: 0,
        }
    }

    /// Transition to a new state.
    pub fn goto_state(&mut self, new_state: S) {
        tracing::info!(from = %self.state, to = %new_state, "State transition");
        self.state = new_state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_counter_interval() {
        let mut counter = SegmentCounter::new(3);
        let due: Vec<bool> = (0..7).map(|_| counter.record()).collect();
        assert_eq!(due, vec![false, false, true, false, false, true, false]);
        assert_eq!(counter.in_flight(), 1);
        counter.reset();
        assert_eq!(counter.in_flight(), 0);
    }

    #[test]
    fn test_segment_counter_disabled() {
        let mut counter = SegmentCounter::new(0);
        assert!((0..100).all(|_| !counter.record()));
    }

    #[test]
    fn test_goto_state() {
        let mut session: TransferSession<LegacyState> =
            TransferSession::new(Dialect::Legacy, 23, 10);
        assert_eq!(session.state, LegacyState::Idle);
        session.goto_state(LegacyState::Streaming);
        assert_eq!(session.state, LegacyState::Streaming);
        assert_eq!(session.state.to_string(), "STREAMING");
    }
}
