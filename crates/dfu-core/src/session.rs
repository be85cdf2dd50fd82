//! Transfer controller - validates inputs, picks the dialect's state
//! machine and drives it to completion.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::error::TransferError;
use crate::events::{DfuEvent, DfuObserver, DfuPhase, PacketDirection, PacketKind, TracingObserver};
use crate::payload::{FirmwareImage, InitData};
use crate::protocol::Dialect;
use crate::protocol::constants::*;
use crate::state::{DfuTransfer, LegacyTransfer, SecureTransfer, TransferContext};
use crate::transport::{DfuLink, LinkError};

pub use crate::state::ModeSwitch;

/// Configuration for a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub dialect: Dialect,
    /// Data writes between checkpoints.
    pub packet_receipt_interval: u16,
    /// Bytes per data write.
    pub segment_size: usize,
    /// Bound on every notification wait.
    pub notification_timeout_ms: u64,
    /// Legacy pause between validation and activation.
    pub activation_delay_ms: u64,
    /// Settle time after asking the application to reboot.
    pub mode_switch_delay_ms: u64,
    /// Consecutive retransmits allowed per secure object. Unset retries forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_object_retries: Option<u32>,
    /// Firmware image (`.bin` or `.hex`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_path: Option<String>,
    /// Init packet (`.dat`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_path: Option<String>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            dialect: Dialect::default(),
            packet_receipt_interval: DEFAULT_PACKET_RECEIPT_INTERVAL,
            segment_size: DEFAULT_SEGMENT_SIZE,
            notification_timeout_ms: DEFAULT_NOTIFICATION_TIMEOUT_MS,
            activation_delay_ms: DEFAULT_ACTIVATION_DELAY_MS,
            mode_switch_delay_ms: DEFAULT_MODE_SWITCH_DELAY_MS,
            max_object_retries: None,
            firmware_path: None,
            init_path: None,
        }
    }
}

impl TransferConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: TransferConfig =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), TransferError> {
        if self.packet_receipt_interval == 0 {
            return Err(TransferError::InvalidConfig(
                "packet_receipt_interval must be at least 1".into(),
            ));
        }
        if self.segment_size == 0 {
            return Err(TransferError::InvalidConfig(
                "segment_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Cancels a running transfer at its next checkpoint or command exchange.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Summary of a successful transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completed {
    pub dialect: Dialect,
    pub bytes_sent: usize,
    /// Secure data objects executed.
    pub objects: usize,
    pub retransmits: u32,
    pub elapsed: Duration,
}

/// DFU session - orchestrates one firmware transfer over a link.
pub struct DfuSession<O: DfuObserver> {
    config: TransferConfig,
    observer: Arc<O>,
    abort: AbortHandle,
}

impl DfuSession<TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(config: TransferConfig) -> Self {
        Self::with_observer(config, Arc::new(TracingObserver))
    }
}

impl<O: DfuObserver + 'static> DfuSession<O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(config: TransferConfig, observer: Arc<O>) -> Self {
        Self {
            config,
            observer,
            abort: AbortHandle::new(),
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Handle that cancels this session's transfers from another thread.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    fn transfer(&self) -> Box<dyn DfuTransfer> {
        match self.config.dialect {
            Dialect::Legacy => Box::new(LegacyTransfer::new()),
            Dialect::Secure => Box::new(SecureTransfer::new()),
        }
    }

    /// Load the firmware image and init packet named in the configuration.
    pub fn load_inputs(&self) -> Result<(FirmwareImage, InitData)> {
        let firmware = self
            .config
            .firmware_path
            .as_deref()
            .context("no firmware image configured")?;
        let init = self
            .config
            .init_path
            .as_deref()
            .context("no init packet configured")?;
        let image = FirmwareImage::load(firmware)
            .with_context(|| format!("loading firmware image {firmware}"))?;
        let init = InitData::load(init).with_context(|| format!("loading init packet {init}"))?;
        Ok((image, init))
    }

    /// Make sure the bootloader is running, asking the application to
    /// reboot into it if needed.
    pub fn enter_dfu_mode<L: DfuLink>(&self, link: &L) -> Result<ModeSwitch, TransferError> {
        let link = ObservableLink {
            inner: link,
            observer: self.observer.as_ref(),
        };
        let ctx = TransferContext::new(
            &link,
            self.observer.as_ref(),
            &self.config,
            &self.abort,
        );
        let transfer = self.transfer();

        if transfer.check_device_mode(&ctx)? {
            info!(dialect = %self.config.dialect, "Device already in DFU mode");
            return Ok(ModeSwitch::AlreadyInDfu);
        }

        ctx.phase(DfuPhase::ModeSwitch);
        let switch = transfer.switch_to_dfu_mode(&ctx)?;
        info!(?switch, "Device switching to DFU mode");
        ctx.sleep_ms(self.config.mode_switch_delay_ms);
        Ok(switch)
    }

    /// Run a complete transfer on an exclusively held link.
    #[instrument(skip_all, fields(dialect = %self.config.dialect, image = image.len()))]
    pub fn run<L: DfuLink>(
        &self,
        link: &L,
        image: &FirmwareImage,
        init: &InitData,
    ) -> Result<Completed, TransferError> {
        self.config.validate()?;
        if image.is_empty() {
            return Err(TransferError::EmptyPayload("firmware image"));
        }
        if init.is_empty() {
            return Err(TransferError::EmptyPayload("init packet"));
        }

        let started = Instant::now();
        let link = ObservableLink {
            inner: link,
            observer: self.observer.as_ref(),
        };
        let ctx = TransferContext::new(
            &link,
            self.observer.as_ref(),
            &self.config,
            &self.abort,
        );
        ctx.set_firmware_total(image.len());

        let mut transfer = self.transfer();
        info!(
            dialect = %transfer.dialect(),
            image = image.len(),
            init = init.len(),
            prn = self.config.packet_receipt_interval,
            "Starting transfer"
        );

        match transfer.start(&ctx, image, init) {
            Ok(stats) => {
                let completed = Completed {
                    dialect: transfer.dialect(),
                    bytes_sent: stats.bytes_sent,
                    objects: stats.objects,
                    retransmits: stats.retransmits,
                    elapsed: started.elapsed(),
                };
                ctx.phase(DfuPhase::Complete);
                ctx.emit(DfuEvent::Complete {
                    bytes_sent: completed.bytes_sent,
                });
                info!(
                    bytes = completed.bytes_sent,
                    retransmits = completed.retransmits,
                    elapsed_ms = completed.elapsed.as_millis() as u64,
                    "Transfer finished"
                );
                Ok(completed)
            }
            Err(e) => {
                let (bytes_sent, total) = ctx.last_progress();
                error!(
                    error = %e,
                    phase = %ctx.current_phase(),
                    bytes_sent,
                    total,
                    "Transfer failed"
                );
                ctx.emit(DfuEvent::Error {
                    message: e.to_string(),
                    bytes_sent: bytes_sent as u64,
                    total: total as u64,
                });
                ctx.phase(DfuPhase::Error);
                Err(e)
            }
        }
    }
}

/// Link wrapper that emits packet events.
struct ObservableLink<'a, L: DfuLink + ?Sized, O: DfuObserver + ?Sized> {
    inner: &'a L,
    observer: &'a O,
}

impl<'a, L: DfuLink + ?Sized, O: DfuObserver + ?Sized> ObservableLink<'a, L, O> {
    fn packet(&self, direction: PacketDirection, kind: PacketKind, data: &[u8]) {
        self.observer.on_event(&DfuEvent::Packet {
            direction,
            kind,
            length: data.len(),
            data: Some(data.iter().take(32).cloned().collect()),
        });
    }
}

impl<'a, L: DfuLink + ?Sized, O: DfuObserver + ?Sized> DfuLink for ObservableLink<'a, L, O> {
    fn subscribe(&self, characteristic: Uuid) -> Result<(), LinkError> {
        self.inner.subscribe(characteristic)
    }

    fn write_command(&self, characteristic: Uuid, value: &[u8]) -> Result<(), LinkError> {
        let res = self.inner.write_command(characteristic, value);
        if !matches!(res, Err(LinkError::Disconnected)) {
            self.packet(PacketDirection::Tx, PacketKind::Command, value);
        }
        res
    }

    fn write_data(&self, characteristic: Uuid, value: &[u8]) -> Result<(), LinkError> {
        let res = self.inner.write_data(characteristic, value);
        if res.is_ok() {
            self.packet(PacketDirection::Tx, PacketKind::Data, value);
        }
        res
    }

    fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, LinkError> {
        self.inner.read(characteristic)
    }

    fn has_characteristic(&self, characteristic: Uuid) -> Result<bool, LinkError> {
        self.inner.has_characteristic(characteristic)
    }

    fn wait_for_notification(&self, timeout: Duration) -> Result<Option<Vec<u8>>, LinkError> {
        let res = self.inner.wait_for_notification(timeout);
        if let Ok(Some(data)) = &res {
            self.packet(PacketDirection::Rx, PacketKind::Notification, data);
        }
        res
    }

    fn is_alive(&self) -> bool {
        self.inner.is_alive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullObserver;
    use crate::events::testing::RecordingObserver;
    use crate::transport::{MockLink, SimulatedDevice};
    use tempfile::tempdir;

    #[test]
    fn test_config_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dfu.toml");
        let config = TransferConfig {
            dialect: Dialect::Legacy,
            packet_receipt_interval: 5,
            max_object_retries: Some(3),
            firmware_path: Some("app.hex".into()),
            ..Default::default()
        };
        config.save_to_file(&path).unwrap();
        assert_eq!(TransferConfig::load_from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: TransferConfig = toml::from_str("dialect = \"legacy\"\n").unwrap();
        assert_eq!(config.dialect, Dialect::Legacy);
        assert_eq!(config.packet_receipt_interval, 10);
        assert_eq!(config.segment_size, 20);
        assert_eq!(config.notification_timeout_ms, 30_000);
        assert_eq!(config.max_object_retries, None);
        assert_eq!(config.mode_switch_delay_ms, DEFAULT_MODE_SWITCH_DELAY_MS);
    }

    #[test]
    fn test_empty_inputs_rejected_before_any_write() {
        let link = MockLink::new();
        let session = DfuSession::with_observer(TransferConfig::default(), Arc::new(NullObserver));

        let err = session
            .run(&link, &FirmwareImage::new(vec![]), &InitData::new(vec![1]))
            .unwrap_err();
        assert!(matches!(err, TransferError::EmptyPayload("firmware image")));

        let err = session
            .run(&link, &FirmwareImage::new(vec![1]), &InitData::new(vec![]))
            .unwrap_err();
        assert!(matches!(err, TransferError::EmptyPayload("init packet")));
        assert!(link.get_writes().is_empty());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = TransferConfig {
            packet_receipt_interval: 0,
            ..Default::default()
        };
        let session = DfuSession::with_observer(config, Arc::new(NullObserver));
        let err = session
            .run(
                &MockLink::new(),
                &FirmwareImage::new(vec![1]),
                &InitData::new(vec![1]),
            )
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidConfig(_)));
    }

    #[test]
    fn test_enter_dfu_mode() {
        let config = TransferConfig {
            mode_switch_delay_ms: 0,
            ..Default::default()
        };
        let session = DfuSession::with_observer(config, Arc::new(NullObserver));

        let device = SimulatedDevice::secure();
        assert_eq!(session.enter_dfu_mode(&device).unwrap(), ModeSwitch::AlreadyInDfu);

        let device = SimulatedDevice::secure().in_application_mode();
        assert_eq!(
            session.enter_dfu_mode(&device).unwrap(),
            ModeSwitch::Rebooting { address_offset: 1 }
        );
        assert!(device.reboot_requested());
    }

    #[test]
    fn test_events_include_packets_and_completion() {
        let config = TransferConfig {
            activation_delay_ms: 0,
            ..Default::default()
        };
        let observer = Arc::new(RecordingObserver::default());
        let session = DfuSession::with_observer(config, observer.clone());
        let device = SimulatedDevice::secure();

        let completed = session
            .run(
                &device,
                &FirmwareImage::new(vec![0x5A; 50]),
                &InitData::new(vec![0x01; 8]),
            )
            .unwrap();
        assert_eq!(completed.bytes_sent, 50);

        let events = observer.events();
        assert!(events.iter().any(|e| matches!(
            e,
            DfuEvent::Packet {
                direction: PacketDirection::Tx,
                kind: PacketKind::Data,
                ..
            }
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            DfuEvent::Packet {
                direction: PacketDirection::Rx,
                kind: PacketKind::Notification,
                ..
            }
        )));
        assert!(matches!(
            events.last(),
            Some(DfuEvent::Complete { bytes_sent: 50 })
        ));
    }

    #[test]
    fn test_abort_before_start() {
        let session =
            DfuSession::with_observer(TransferConfig::default(), Arc::new(NullObserver));
        session.abort_handle().abort();
        let device = SimulatedDevice::secure();

        let err = session
            .run(
                &device,
                &FirmwareImage::new(vec![1; 40]),
                &InitData::new(vec![2; 4]),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::Cancelled {
                bytes_sent: 0,
                total: 40
            }
        ));
        assert_eq!(device.stats().data_writes, 0);
    }
}
