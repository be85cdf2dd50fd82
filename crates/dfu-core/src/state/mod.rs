//! Transfer state machines.
//!
//! Each dialect is an independent implementation of [`DfuTransfer`]; the
//! controller picks one from configuration. Both drive the link through a
//! shared [`TransferContext`].

pub mod legacy;
pub mod machine;
pub mod secure;

use std::cell::Cell;
use std::time::Duration;

use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::TransferError;
use crate::events::{DfuEvent, DfuObserver, DfuPhase, LogLevel};
use crate::payload::{FirmwareImage, InitData};
use crate::protocol::{Dialect, Notification};
use crate::session::{AbortHandle, TransferConfig};
use crate::transport::{DfuLink, LinkError};

pub use legacy::LegacyTransfer;
pub use machine::{LegacyState, ObjectInfo, SecureState, SegmentCounter, TransferSession};
pub use secure::SecureTransfer;

/// Outcome of asking the application to enter the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeSwitch {
    /// The bootloader is already running; transfer can start.
    AlreadyInDfu,
    /// The device is rebooting. Reconnect at the advertised address plus
    /// `address_offset` before starting the transfer.
    Rebooting { address_offset: u8 },
}

/// Counters a state machine reports on success.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub bytes_sent: usize,
    /// Secure data objects executed (legacy: 0).
    pub objects: usize,
    pub retransmits: u32,
}

/// A dialect-specific transfer procedure.
pub trait DfuTransfer {
    fn dialect(&self) -> Dialect;

    /// Whether the bootloader (rather than the application) is running.
    fn check_device_mode(&self, ctx: &TransferContext<'_>) -> Result<bool, TransferError>;

    /// Ask the running application to reboot into the bootloader.
    fn switch_to_dfu_mode(&self, ctx: &TransferContext<'_>) -> Result<ModeSwitch, TransferError>;

    /// Deliver the init packet and firmware image.
    fn start(
        &mut self,
        ctx: &TransferContext<'_>,
        image: &FirmwareImage,
        init: &InitData,
    ) -> Result<TransferStats, TransferError>;
}

/// Resources a state machine drives.
pub struct TransferContext<'a> {
    pub link: &'a dyn DfuLink,
    pub observer: &'a dyn DfuObserver,
    pub config: &'a TransferConfig,
    pub abort: &'a AbortHandle,
    phase: Cell<DfuPhase>,
    /// Last reported firmware progress as (bytes, total).
    firmware_progress: Cell<(usize, usize)>,
}

impl<'a> TransferContext<'a> {
    pub fn new(
        link: &'a dyn DfuLink,
        observer: &'a dyn DfuObserver,
        config: &'a TransferConfig,
        abort: &'a AbortHandle,
    ) -> Self {
        Self {
            link,
            observer,
            config,
            abort,
            phase: Cell::new(DfuPhase::Idle),
            firmware_progress: Cell::new((0, 0)),
        }
    }

    /// Phase most recently entered.
    pub fn current_phase(&self) -> DfuPhase {
        self.phase.get()
    }

    /// Firmware bytes acknowledged so far and the image size.
    pub fn last_progress(&self) -> (usize, usize) {
        self.firmware_progress.get()
    }

    pub(crate) fn emit(&self, event: DfuEvent) {
        self.observer.on_event(&event);
    }

    pub(crate) fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(DfuEvent::Log {
            level,
            message: message.into(),
        });
    }

    pub(crate) fn phase(&self, to: DfuPhase) {
        let from = self.phase.replace(to);
        self.emit(DfuEvent::PhaseChanged { from, to });
    }

    pub(crate) fn progress(&self, phase: DfuPhase, current: usize, total: usize) {
        if phase == DfuPhase::Firmware {
            self.firmware_progress.set((current, total));
        }
        self.emit(DfuEvent::Progress {
            phase,
            current: current as u64,
            total: total as u64,
        });
    }

    /// Size of the image about to be sent; progress starts at zero.
    pub(crate) fn set_firmware_total(&self, total: usize) {
        self.firmware_progress.set((0, total));
    }

    pub(crate) fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.notification_timeout_ms)
    }

    /// Fail with `Cancelled` if an abort was requested.
    pub(crate) fn ensure_not_cancelled(
        &self,
        bytes_sent: usize,
        total: usize,
    ) -> Result<(), TransferError> {
        if self.abort.is_aborted() {
            warn!(bytes_sent, total, "Transfer cancelled");
            return Err(TransferError::Cancelled { bytes_sent, total });
        }
        Ok(())
    }

    /// Write to a control point. An unacknowledged write is not fatal: the
    /// notification that follows decides the outcome.
    pub(crate) fn send_command(&self, characteristic: Uuid, value: &[u8]) -> Result<(), TransferError> {
        trace!(value = %hex::encode(value), "Command write");
        match self.link.write_command(characteristic, value) {
            Ok(()) => Ok(()),
            Err(LinkError::Timeout { timeout_ms }) => {
                warn!(timeout_ms, "Command write not acknowledged, awaiting notification");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) fn send_data(&self, characteristic: Uuid, value: &[u8]) -> Result<(), TransferError> {
        trace!(len = value.len(), "Data write");
        self.link.write_data(characteristic, value)?;
        Ok(())
    }

    /// Block for the next notification and decode it. `Ok(None)` on timeout.
    pub(crate) fn next_notification(
        &self,
        dialect: Dialect,
    ) -> Result<Option<Notification>, TransferError> {
        if !self.link.is_alive() {
            return Err(TransferError::LinkLost);
        }
        let Some(raw) = self.link.wait_for_notification(self.timeout())? else {
            debug!(timeout_ms = self.config.notification_timeout_ms, "No notification");
            return Ok(None);
        };
        let notification = Notification::decode(dialect, &raw)?;
        debug!(%notification, "Notification received");
        self.emit(DfuEvent::NotificationReceived {
            notification: notification.to_string(),
        });
        Ok(Some(notification))
    }

    /// Like `next_notification`, but a timeout is fatal.
    pub(crate) fn require_notification(
        &self,
        dialect: Dialect,
    ) -> Result<Notification, TransferError> {
        self.next_notification(dialect)?
            .ok_or(TransferError::NotificationTimeout {
                timeout_ms: self.config.notification_timeout_ms,
            })
    }

    pub(crate) fn sleep_ms(&self, ms: u64) {
        if ms > 0 {
            std::thread::sleep(Duration::from_millis(ms));
        }
    }
}
