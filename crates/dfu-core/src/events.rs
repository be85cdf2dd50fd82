//! Event system for UI decoupling.
//!
//! Front ends subscribe to transfer events (phase changes, progress,
//! retransmits, raw link traffic) without touching the state machines.

use std::fmt;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Transfer phases, shared by both dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfuPhase {
    /// Nothing sent yet.
    Idle,
    /// Asking the application to reboot into the bootloader.
    ModeSwitch,
    /// Init packet (legacy INIT_DFU / secure command object).
    InitPacket,
    /// Firmware image streaming.
    Firmware,
    /// Legacy VALIDATE_FIRMWARE.
    Validation,
    /// Legacy ACTIVATE_IMAGE_AND_RESET.
    Activation,
    /// Transfer finished.
    Complete,
    /// Terminal failure.
    Error,
}

impl fmt::Display for DfuPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DfuPhase::Idle => write!(f, "Idle"),
            DfuPhase::ModeSwitch => write!(f, "Mode Switch"),
            DfuPhase::InitPacket => write!(f, "Init Packet"),
            DfuPhase::Firmware => write!(f, "Firmware"),
            DfuPhase::Validation => write!(f, "Validation"),
            DfuPhase::Activation => write!(f, "Activation"),
            DfuPhase::Complete => write!(f, "Complete"),
            DfuPhase::Error => write!(f, "Error"),
        }
    }
}

/// Events emitted during a transfer.
#[derive(Debug, Clone)]
pub enum DfuEvent {
    /// Phase changed.
    PhaseChanged { from: DfuPhase, to: DfuPhase },
    /// Bytes acknowledged by the device so far.
    Progress {
        phase: DfuPhase,
        current: u64,
        total: u64,
    },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Decoded control point notification.
    NotificationReceived { notification: String },
    /// Raw link traffic.
    Packet {
        direction: PacketDirection,
        kind: PacketKind,
        length: usize,
        data: Option<Vec<u8>>,
    },
    /// A secure object is being resent from its start.
    ObjectRetransmit {
        offset: usize,
        attempt: u32,
        reason: String,
    },
    /// Terminal error, with the firmware progress reached before it.
    Error {
        message: String,
        bytes_sent: u64,
        total: u64,
    },
    /// Transfer completed successfully.
    Complete { bytes_sent: usize },
}

/// Link packet direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Central -> peripheral
    Rx, // Peripheral -> central
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Which characteristic traffic a packet belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Command,
    Data,
    Notification,
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketKind::Command => write!(f, "Command"),
            PacketKind::Data => write!(f, "Data"),
            PacketKind::Notification => write!(f, "Notification"),
        }
    }
}

/// Observer trait for receiving transfer events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait DfuObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &DfuEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl DfuObserver for NullObserver {
    fn on_event(&self, _event: &DfuEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl DfuObserver for TracingObserver {
    fn on_event(&self, event: &DfuEvent) {
        match event {
            DfuEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            DfuEvent::Progress {
                phase,
                current,
                total,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::debug!(phase = %phase, current, total, progress = %format!("{}%", pct), "Progress");
            }
            DfuEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            DfuEvent::NotificationReceived { notification } => {
                tracing::debug!(notification = %notification, "Notification");
            }
            DfuEvent::Packet {
                direction,
                kind,
                length,
                data,
            } => {
                let preview = data.as_deref().map(hex::encode).unwrap_or_default();
                tracing::trace!(
                    dir = %direction,
                    kind = %kind,
                    len = length,
                    data = %preview,
                    "Link packet"
                );
            }
            DfuEvent::ObjectRetransmit {
                offset,
                attempt,
                reason,
            } => {
                tracing::warn!(offset, attempt, reason = %reason, "Retransmitting object");
            }
            DfuEvent::Error {
                message,
                bytes_sent,
                total,
            } => {
                tracing::error!(bytes_sent, total, "Error: {}", message);
            }
            DfuEvent::Complete { bytes_sent } => {
                tracing::info!(bytes_sent, "Transfer complete");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Observer that records every event, for assertions.
    #[derive(Default)]
    pub struct RecordingObserver {
        events: Mutex<Vec<DfuEvent>>,
    }

    impl RecordingObserver {
        pub fn events(&self) -> Vec<DfuEvent> {
            self.events.lock().unwrap().clone()
        }

        pub fn retransmits(&self) -> usize {
            self.events()
                .iter()
                .filter(|e| matches!(e, DfuEvent::ObjectRetransmit { .. }))
                .count()
        }
    }

    impl DfuObserver for RecordingObserver {
        fn on_event(&self, event: &DfuEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }
}
