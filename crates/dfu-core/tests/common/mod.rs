#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use dfu_core::events::{DfuEvent, DfuObserver, DfuPhase, PacketDirection, PacketKind};
use dfu_core::session::{AbortHandle, DfuSession, TransferConfig};
use dfu_core::{Dialect, FirmwareImage, InitData};

/// Records every event; optionally aborts once firmware progress passes a
/// threshold.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<DfuEvent>>,
    abort_at: Mutex<Option<(u64, AbortHandle)>>,
}

impl Recorder {
    pub fn abort_after(&self, bytes: u64, handle: AbortHandle) {
        *self.abort_at.lock().unwrap() = Some((bytes, handle));
    }

    pub fn events(&self) -> Vec<DfuEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Raw commands written to a control point, in order.
    pub fn commands(&self) -> Vec<Vec<u8>> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                DfuEvent::Packet {
                    direction: PacketDirection::Tx,
                    kind: PacketKind::Command,
                    data,
                    ..
                } => data,
                _ => None,
            })
            .collect()
    }

    pub fn notifications(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                DfuEvent::NotificationReceived { notification } => Some(notification),
                _ => None,
            })
            .collect()
    }

    pub fn retransmits(&self) -> Vec<(usize, u32)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                DfuEvent::ObjectRetransmit {
                    offset, attempt, ..
                } => Some((offset, attempt)),
                _ => None,
            })
            .collect()
    }

    /// The terminal error event as (message, bytes_sent, total).
    pub fn failure(&self) -> Option<(String, u64, u64)> {
        self.events().into_iter().find_map(|e| match e {
            DfuEvent::Error {
                message,
                bytes_sent,
                total,
            } => Some((message, bytes_sent, total)),
            _ => None,
        })
    }

    pub fn phase_changes(&self) -> Vec<(DfuPhase, DfuPhase)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                DfuEvent::PhaseChanged { from, to } => Some((from, to)),
                _ => None,
            })
            .collect()
    }

    pub fn firmware_progress(&self) -> Vec<u64> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                DfuEvent::Progress {
                    phase: DfuPhase::Firmware,
                    current,
                    ..
                } => Some(current),
                _ => None,
            })
            .collect()
    }
}

impl DfuObserver for Recorder {
    fn on_event(&self, event: &DfuEvent) {
        if let DfuEvent::Progress {
            phase: DfuPhase::Firmware,
            current,
            ..
        } = event
            && let Some((threshold, handle)) = self.abort_at.lock().unwrap().as_ref()
            && current >= threshold
        {
            handle.abort();
        }
        self.events.lock().unwrap().push(event.clone());
    }
}

pub fn config(dialect: Dialect) -> TransferConfig {
    TransferConfig {
        dialect,
        activation_delay_ms: 0,
        mode_switch_delay_ms: 0,
        notification_timeout_ms: 50,
        ..Default::default()
    }
}

pub fn session(config: TransferConfig) -> (DfuSession<Recorder>, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    (DfuSession::with_observer(config, recorder.clone()), recorder)
}

/// Non-repeating test image, so a lost or shifted write changes the CRC.
pub fn image(len: usize) -> FirmwareImage {
    FirmwareImage::new((0..len).map(|i| (i * 31 + i / 256) as u8).collect())
}

pub fn init() -> InitData {
    InitData::new(vec![0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0])
}
