//! Simulated DFU target.
//!
//! A behavioural model of the Nordic bootloader for both dialects, driven
//! synchronously through the `DfuLink` interface: every write is processed
//! immediately and any notification it triggers is queued for the next
//! wait. Faults can be injected to exercise retransmit and error paths.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, trace};
use uuid::Uuid;

use super::traits::{DfuLink, LinkError};
use crate::protocol::command::{LegacyCommand, SecureCommand};
use crate::protocol::constants::*;
use crate::protocol::{
    Dialect, LegacyNotification, LegacyOpcode, LegacyResult, ObjectKind, SecureOpcode,
    SecureResponse, SecureResult,
};

/// Default per-object ceilings advertised on SELECT.
pub const SIM_MAX_COMMAND_SIZE: u32 = 256;
pub const SIM_MAX_DATA_SIZE: u32 = 4096;

/// Injected misbehaviour. Ordinals are 1-based and count across the whole
/// session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Report a wrong CRC in the n-th checksum notification (packet receipt
    /// or CALC_CHECKSUM response).
    CorruptChecksum(usize),
    /// Swallow the n-th packet receipt notification.
    DropReceipt(usize),
    /// Lose the n-th data write in the air.
    DropWrite(usize),
    /// Answer the first command with this opcode using `result`.
    RejectCommand { opcode: u8, result: u8 },
    /// Drop the link right after the n-th data write.
    DisconnectAfterWrite(usize),
}

/// Counters exposed for assertions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub command_writes: usize,
    pub data_writes: usize,
    pub data_bytes: usize,
    pub checksum_reports: usize,
    pub receipts: usize,
    /// CREATE commands per object kind: (command, data).
    pub creates: (usize, usize),
    /// EXECUTE commands that committed an object.
    pub executes: usize,
}

#[derive(Debug, Default)]
struct ObjectStore {
    max_size: u32,
    /// Everything received for this kind; `[0, committed)` is executed.
    data: Vec<u8>,
    committed: usize,
    /// End of the object currently open for writing.
    object_end: usize,
}

impl ObjectStore {
    fn new(max_size: u32) -> Self {
        Self {
            max_size,
            ..Default::default()
        }
    }

    fn crc(&self) -> u32 {
        crc32fast::hash(&self.data)
    }

    fn offset(&self) -> u32 {
        self.data.len() as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LegacyPhase {
    Idle,
    AwaitingSize,
    Ready,
    ReceivingInit,
    ReceivingFirmware,
    Received,
    Validated,
    Activated,
}

#[derive(Debug)]
struct DeviceState {
    dialect: Dialect,
    connected: bool,
    dfu_mode: bool,
    reboot_requested: bool,
    subscribed: HashSet<Uuid>,
    pending: VecDeque<Vec<u8>>,
    faults: Vec<Fault>,
    stats: DeviceStats,
    // secure
    prn: u16,
    packets_since_receipt: u16,
    selected: ObjectKind,
    command: ObjectStore,
    data: ObjectStore,
    /// Init packet most recently executed; a different one discards
    /// any firmware received under the old one.
    executed_init: Vec<u8>,
    // legacy
    legacy_phase: LegacyPhase,
    image_size: Option<u32>,
    init_packet: Vec<u8>,
}

/// Simulated bootloader reachable through `DfuLink`.
#[derive(Clone)]
pub struct SimulatedDevice {
    inner: Arc<Mutex<DeviceState>>,
}

impl SimulatedDevice {
    /// Secure bootloader with the default object ceilings.
    pub fn secure() -> Self {
        Self::secure_with_limits(SIM_MAX_COMMAND_SIZE, SIM_MAX_DATA_SIZE)
    }

    /// Secure bootloader advertising the given object ceilings.
    pub fn secure_with_limits(max_command_size: u32, max_data_size: u32) -> Self {
        Self::build(Dialect::Secure, max_command_size, max_data_size)
    }

    /// Legacy bootloader.
    pub fn legacy() -> Self {
        Self::build(Dialect::Legacy, 0, 0)
    }

    fn build(dialect: Dialect, max_command_size: u32, max_data_size: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(DeviceState {
                dialect,
                connected: true,
                dfu_mode: true,
                reboot_requested: false,
                subscribed: HashSet::new(),
                pending: VecDeque::new(),
                faults: Vec::new(),
                stats: DeviceStats::default(),
                prn: 0,
                packets_since_receipt: 0,
                selected: ObjectKind::Command,
                command: ObjectStore::new(max_command_size),
                data: ObjectStore::new(max_data_size),
                executed_init: Vec::new(),
                legacy_phase: LegacyPhase::Idle,
                image_size: None,
                init_packet: Vec::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start in application mode instead of the bootloader.
    pub fn in_application_mode(self) -> Self {
        self.state().dfu_mode = false;
        self
    }

    /// Inject a fault.
    pub fn inject(&self, fault: Fault) {
        self.state().faults.push(fault);
    }

    /// Pretend a previous session already delivered `bytes` of firmware,
    /// of which `committed` were executed.
    pub fn preload_firmware(&self, bytes: &[u8], committed: usize) {
        let mut s = self.state();
        s.data.data = bytes.to_vec();
        s.data.committed = committed.min(bytes.len());
        s.data.object_end = bytes.len();
    }

    /// Pretend a previous session already delivered and executed the init
    /// packet. Preloaded firmware survives only if this init packet is sent
    /// again.
    pub fn preload_init(&self, bytes: &[u8]) {
        let mut s = self.state();
        s.command.data = bytes.to_vec();
        s.command.committed = bytes.len();
        s.command.object_end = bytes.len();
        s.executed_init = bytes.to_vec();
    }

    pub fn stats(&self) -> DeviceStats {
        self.state().stats.clone()
    }

    /// Firmware bytes received (secure: all data objects; legacy: image).
    pub fn firmware(&self) -> Vec<u8> {
        self.state().data.data.clone()
    }

    /// Executed firmware bytes (secure dialect).
    pub fn committed_firmware(&self) -> usize {
        self.state().data.committed
    }

    /// Init packet received.
    pub fn init_packet(&self) -> Vec<u8> {
        let s = self.state();
        match s.dialect {
            Dialect::Secure => s.command.data.clone(),
            Dialect::Legacy => s.init_packet.clone(),
        }
    }

    /// Whether the legacy image was activated (device rebooted).
    pub fn is_activated(&self) -> bool {
        self.state().legacy_phase == LegacyPhase::Activated
    }

    pub fn is_in_dfu_mode(&self) -> bool {
        self.state().dfu_mode
    }

    /// Whether an application-mode switch into the bootloader was requested.
    pub fn reboot_requested(&self) -> bool {
        self.state().reboot_requested
    }

    /// Drop the link.
    pub fn disconnect(&self) {
        self.state().connected = false;
    }
}

impl DeviceState {
    fn control_point(&self) -> Uuid {
        match self.dialect {
            Dialect::Legacy => LEGACY_CONTROL_POINT_UUID,
            Dialect::Secure => SECURE_CONTROL_POINT_UUID,
        }
    }

    fn packet(&self) -> Uuid {
        match self.dialect {
            Dialect::Legacy => LEGACY_PACKET_UUID,
            Dialect::Secure => SECURE_PACKET_UUID,
        }
    }

    fn exposes(&self, characteristic: Uuid) -> bool {
        if characteristic == SECURE_BUTTONLESS_UUID {
            return self.dialect == Dialect::Secure && !self.dfu_mode;
        }
        if characteristic == LEGACY_VERSION_UUID {
            return self.dialect == Dialect::Legacy;
        }
        if self.dialect == Dialect::Legacy && characteristic == LEGACY_CONTROL_POINT_UUID {
            // present in both modes; the application uses it to enter DFU
            return true;
        }
        self.dfu_mode && (characteristic == self.control_point() || characteristic == self.packet())
    }

    fn notify(&mut self, raw: Vec<u8>) {
        if self.subscribed.contains(&self.control_point()) {
            trace!(raw = ?raw, "sim: notify");
            self.pending.push_back(raw);
        } else {
            debug!("sim: notification dropped, control point not subscribed");
        }
    }

    fn take_rejection(&mut self, opcode: u8) -> Option<u8> {
        let idx = self.faults.iter().position(
            |f| matches!(f, Fault::RejectCommand { opcode: o, .. } if *o == opcode),
        )?;
        match self.faults.remove(idx) {
            Fault::RejectCommand { result, .. } => Some(result),
            _ => None,
        }
    }

    fn has_fault(&self, fault: Fault) -> bool {
        self.faults.contains(&fault)
    }

    fn store(&mut self, kind: ObjectKind) -> &mut ObjectStore {
        match kind {
            ObjectKind::Command => &mut self.command,
            ObjectKind::Data => &mut self.data,
        }
    }

    fn checksum_report(&mut self, offset: u32, crc32: u32) -> Vec<u8> {
        self.stats.checksum_reports += 1;
        let crc32 = if self.has_fault(Fault::CorruptChecksum(self.stats.checksum_reports)) {
            !crc32
        } else {
            crc32
        };
        SecureResponse::checksum(offset, crc32).encode()
    }

    // ------------------------------------------------------------------------
    // Secure dialect
    // ------------------------------------------------------------------------

    fn secure_command(&mut self, raw: &[u8]) {
        let Ok(cmd) = SecureCommand::decode(raw) else {
            let opcode = raw.first().copied().unwrap_or(0);
            if let Some(op) = SecureOpcode::from_code(opcode) {
                self.notify(SecureResponse::status(op, SecureResult::InvalidParameter).encode());
            } else {
                self.notify(vec![
                    SecureOpcode::Response.code(),
                    opcode,
                    SecureResult::OpcodeNotSupported.code(),
                ]);
            }
            return;
        };

        let opcode = cmd.opcode();
        if let Some(result) = self.take_rejection(opcode.code()) {
            let result = SecureResult::from_code(result).unwrap_or(SecureResult::OperationFailed);
            self.notify(SecureResponse::status(opcode, result).encode());
            return;
        }

        let response = match cmd {
            SecureCommand::SetPrn { interval } => {
                self.prn = interval;
                self.packets_since_receipt = 0;
                SecureResponse::status(opcode, SecureResult::Success).encode()
            }
            SecureCommand::Select { kind } => {
                self.selected = kind;
                let store = self.store(kind);
                SecureResponse::select(store.max_size, store.offset(), store.crc()).encode()
            }
            SecureCommand::Create { kind, size } => {
                self.selected = kind;
                self.packets_since_receipt = 0;
                let store = self.store(kind);
                if size > store.max_size {
                    SecureResponse::status(opcode, SecureResult::InsufficientResources).encode()
                } else {
                    // the init packet is a single object; data objects
                    // append after the last executed one
                    if kind == ObjectKind::Command {
                        store.committed = 0;
                    }
                    let committed = store.committed;
                    store.data.truncate(committed);
                    store.object_end = committed + size as usize;
                    match kind {
                        ObjectKind::Command => self.stats.creates.0 += 1,
                        ObjectKind::Data => self.stats.creates.1 += 1,
                    }
                    SecureResponse::status(opcode, SecureResult::Success).encode()
                }
            }
            SecureCommand::CalcChecksum => {
                let kind = self.selected;
                let (offset, crc) = {
                    let store = self.store(kind);
                    (store.offset(), store.crc())
                };
                self.checksum_report(offset, crc)
            }
            SecureCommand::Execute => {
                let kind = self.selected;
                let store = self.store(kind);
                if store.data.len() != store.object_end {
                    SecureResponse::status(opcode, SecureResult::OperationNotPermitted).encode()
                } else {
                    store.committed = store.data.len();
                    self.stats.executes += 1;
                    if kind == ObjectKind::Command && self.command.data != self.executed_init {
                        debug!("sim: new init packet, discarding firmware progress");
                        self.executed_init = self.command.data.clone();
                        self.data.data.clear();
                        self.data.committed = 0;
                        self.data.object_end = 0;
                    }
                    SecureResponse::status(opcode, SecureResult::Success).encode()
                }
            }
        };
        self.notify(response);
    }

    fn secure_data(&mut self, bytes: &[u8], dropped: bool) {
        let kind = self.selected;
        if !dropped {
            let store = self.store(kind);
            let room = store.object_end.saturating_sub(store.data.len());
            let take = bytes.len().min(room);
            store.data.extend_from_slice(&bytes[..take]);
        }

        self.packets_since_receipt = self.packets_since_receipt.wrapping_add(1);
        if self.prn != 0 && self.packets_since_receipt >= self.prn {
            self.packets_since_receipt = 0;
            self.stats.receipts += 1;
            if self.has_fault(Fault::DropReceipt(self.stats.receipts)) {
                debug!(receipt = self.stats.receipts, "sim: receipt dropped");
                return;
            }
            let (offset, crc) = {
                let store = self.store(kind);
                (store.offset(), store.crc())
            };
            let report = self.checksum_report(offset, crc);
            self.notify(report);
        }
    }

    // ------------------------------------------------------------------------
    // Legacy dialect
    // ------------------------------------------------------------------------

    fn legacy_respond(&mut self, procedure: LegacyOpcode, result: LegacyResult) {
        let result = self
            .take_rejection(procedure.code())
            .and_then(LegacyResult::from_code)
            .unwrap_or(result);
        self.notify(LegacyNotification::Response { procedure, result }.encode());
    }

    fn legacy_command(&mut self, raw: &[u8]) {
        let Ok(cmd) = LegacyCommand::decode(raw) else {
            if let Some(op) = raw.first().copied().and_then(LegacyOpcode::from_code) {
                self.legacy_respond(op, LegacyResult::NotSupported);
            }
            return;
        };

        if !self.dfu_mode {
            // Application mode: only "START_DFU" on the control point, which
            // reboots into the bootloader.
            if matches!(cmd, LegacyCommand::StartDfu { .. }) {
                self.reboot_requested = true;
                self.dfu_mode = true;
            }
            return;
        }

        let phase = self.legacy_phase;
        match cmd {
            LegacyCommand::StartDfu { .. } if phase == LegacyPhase::Idle => {
                self.legacy_phase = LegacyPhase::AwaitingSize;
            }
            LegacyCommand::InitDfu { complete: false } if phase == LegacyPhase::Ready => {
                self.init_packet.clear();
                self.legacy_phase = LegacyPhase::ReceivingInit;
            }
            LegacyCommand::InitDfu { complete: true } if phase == LegacyPhase::ReceivingInit => {
                self.legacy_phase = LegacyPhase::Ready;
                self.legacy_respond(LegacyOpcode::InitDfu, LegacyResult::Success);
            }
            LegacyCommand::PrnRequest { interval } => {
                self.prn = interval;
            }
            LegacyCommand::ReceiveFirmwareImage if phase == LegacyPhase::Ready => {
                self.data.data.clear();
                self.packets_since_receipt = 0;
                self.legacy_phase = LegacyPhase::ReceivingFirmware;
            }
            LegacyCommand::ValidateFirmware if phase == LegacyPhase::Received => {
                self.legacy_phase = LegacyPhase::Validated;
                self.legacy_respond(LegacyOpcode::ValidateFirmware, LegacyResult::Success);
            }
            LegacyCommand::ActivateImageAndReset if phase == LegacyPhase::Validated => {
                self.legacy_phase = LegacyPhase::Activated;
                self.connected = false;
            }
            LegacyCommand::ResetSystem => {
                self.connected = false;
            }
            other => {
                self.legacy_respond(other.opcode(), LegacyResult::InvalidState);
            }
        }
    }

    fn legacy_data(&mut self, bytes: &[u8], dropped: bool) {
        match self.legacy_phase {
            LegacyPhase::AwaitingSize => {
                if bytes.len() == LEGACY_SIZE_PADDING + 4 {
                    let mut size = [0u8; 4];
                    size.copy_from_slice(&bytes[LEGACY_SIZE_PADDING..]);
                    self.image_size = Some(u32::from_le_bytes(size));
                    self.legacy_phase = LegacyPhase::Ready;
                    self.legacy_respond(LegacyOpcode::StartDfu, LegacyResult::Success);
                } else {
                    self.legacy_phase = LegacyPhase::Idle;
                    self.legacy_respond(LegacyOpcode::StartDfu, LegacyResult::DataSizeExceedsLimits);
                }
            }
            LegacyPhase::ReceivingInit => {
                if !dropped {
                    self.init_packet.extend_from_slice(bytes);
                }
            }
            LegacyPhase::ReceivingFirmware => {
                if !dropped {
                    self.data.data.extend_from_slice(bytes);
                }
                self.packets_since_receipt = self.packets_since_receipt.wrapping_add(1);
                if self.prn != 0 && self.packets_since_receipt >= self.prn {
                    self.packets_since_receipt = 0;
                    self.stats.receipts += 1;
                    if !self.has_fault(Fault::DropReceipt(self.stats.receipts)) {
                        let bytes_acked = self.data.data.len() as u32;
                        self.notify(LegacyNotification::PacketReceipt { bytes_acked }.encode());
                    }
                }
                let expected = self.image_size.unwrap_or(0) as usize;
                if self.data.data.len() >= expected {
                    self.legacy_phase = LegacyPhase::Received;
                    self.legacy_respond(LegacyOpcode::ReceiveFirmwareImage, LegacyResult::Success);
                }
            }
            _ => debug!(len = bytes.len(), "sim: unexpected data write ignored"),
        }
    }
}

impl DfuLink for SimulatedDevice {
    fn subscribe(&self, characteristic: Uuid) -> Result<(), LinkError> {
        let mut s = self.state();
        if !s.connected {
            return Err(LinkError::Disconnected);
        }
        if !s.exposes(characteristic) {
            return Err(LinkError::CharacteristicNotFound(characteristic));
        }
        s.subscribed.insert(characteristic);
        Ok(())
    }

    fn write_command(&self, characteristic: Uuid, value: &[u8]) -> Result<(), LinkError> {
        let mut s = self.state();
        if !s.connected {
            return Err(LinkError::Disconnected);
        }
        if !s.exposes(characteristic) {
            return Err(LinkError::CharacteristicNotFound(characteristic));
        }
        s.stats.command_writes += 1;

        if characteristic == SECURE_BUTTONLESS_UUID {
            if value.first() == Some(&SECURE_ENTER_BOOTLOADER) {
                s.reboot_requested = true;
                s.dfu_mode = true;
            }
            return Ok(());
        }

        match s.dialect {
            Dialect::Secure => s.secure_command(value),
            Dialect::Legacy => s.legacy_command(value),
        }
        Ok(())
    }

    fn write_data(&self, characteristic: Uuid, value: &[u8]) -> Result<(), LinkError> {
        let mut s = self.state();
        if !s.connected {
            return Err(LinkError::Disconnected);
        }
        if characteristic != s.packet() || !s.dfu_mode {
            return Err(LinkError::CharacteristicNotFound(characteristic));
        }
        s.stats.data_writes += 1;
        s.stats.data_bytes += value.len();
        let nth = s.stats.data_writes;
        let dropped = s.has_fault(Fault::DropWrite(nth));
        if dropped {
            debug!(write = nth, "sim: data write lost");
        }

        match s.dialect {
            Dialect::Secure => s.secure_data(value, dropped),
            Dialect::Legacy => s.legacy_data(value, dropped),
        }

        if s.has_fault(Fault::DisconnectAfterWrite(nth)) {
            s.connected = false;
        }
        Ok(())
    }

    fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, LinkError> {
        let s = self.state();
        if !s.connected {
            return Err(LinkError::Disconnected);
        }
        if characteristic == LEGACY_VERSION_UUID && s.dialect == Dialect::Legacy {
            return Ok(if s.dfu_mode {
                LEGACY_DFU_MODE_VERSION.to_vec()
            } else {
                vec![0x01, 0x00]
            });
        }
        Err(LinkError::CharacteristicNotFound(characteristic))
    }

    fn has_characteristic(&self, characteristic: Uuid) -> Result<bool, LinkError> {
        let s = self.state();
        if !s.connected {
            return Err(LinkError::Disconnected);
        }
        Ok(s.exposes(characteristic))
    }

    fn wait_for_notification(&self, _timeout: Duration) -> Result<Option<Vec<u8>>, LinkError> {
        let mut s = self.state();
        match s.pending.pop_front() {
            Some(raw) => Ok(Some(raw)),
            None if !s.connected => Err(LinkError::Disconnected),
            None => Ok(None),
        }
    }

    fn is_alive(&self) -> bool {
        self.state().connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout() -> Duration {
        Duration::from_millis(1)
    }

    fn next_secure(dev: &SimulatedDevice) -> SecureResponse {
        let raw = dev.wait_for_notification(timeout()).unwrap().unwrap();
        SecureResponse::decode(&raw).unwrap()
    }

    #[test]
    fn test_secure_object_lifecycle() {
        let dev = SimulatedDevice::secure_with_limits(64, 8);
        dev.subscribe(SECURE_CONTROL_POINT_UUID).unwrap();

        let select = SecureCommand::Select {
            kind: ObjectKind::Data,
        };
        dev.write_command(SECURE_CONTROL_POINT_UUID, &select.encode())
            .unwrap();
        assert_eq!(next_secure(&dev), SecureResponse::select(8, 0, 0));

        let create = SecureCommand::Create {
            kind: ObjectKind::Data,
            size: 6,
        };
        dev.write_command(SECURE_CONTROL_POINT_UUID, &create.encode())
            .unwrap();
        assert!(next_secure(&dev).result.is_success());

        dev.write_data(SECURE_PACKET_UUID, b"abcdef").unwrap();
        dev.write_command(SECURE_CONTROL_POINT_UUID, &SecureCommand::CalcChecksum.encode())
            .unwrap();
        assert_eq!(
            next_secure(&dev),
            SecureResponse::checksum(6, crc32fast::hash(b"abcdef"))
        );

        dev.write_command(SECURE_CONTROL_POINT_UUID, &SecureCommand::Execute.encode())
            .unwrap();
        assert!(next_secure(&dev).result.is_success());
        assert_eq!(dev.committed_firmware(), 6);
    }

    #[test]
    fn test_secure_execute_rejects_incomplete_object() {
        let dev = SimulatedDevice::secure();
        dev.subscribe(SECURE_CONTROL_POINT_UUID).unwrap();
        let create = SecureCommand::Create {
            kind: ObjectKind::Data,
            size: 10,
        };
        dev.write_command(SECURE_CONTROL_POINT_UUID, &create.encode())
            .unwrap();
        next_secure(&dev);
        dev.write_data(SECURE_PACKET_UUID, b"12345").unwrap();
        dev.write_command(SECURE_CONTROL_POINT_UUID, &SecureCommand::Execute.encode())
            .unwrap();
        assert_eq!(
            next_secure(&dev).result,
            SecureResult::OperationNotPermitted
        );
    }

    #[test]
    fn test_unsubscribed_notifications_are_lost() {
        let dev = SimulatedDevice::secure();
        dev.write_command(SECURE_CONTROL_POINT_UUID, &SecureCommand::CalcChecksum.encode())
            .unwrap();
        assert_eq!(dev.wait_for_notification(timeout()).unwrap(), None);
    }

    #[test]
    fn test_application_mode_characteristics() {
        let dev = SimulatedDevice::secure().in_application_mode();
        assert!(dev.has_characteristic(SECURE_BUTTONLESS_UUID).unwrap());
        assert!(!dev.has_characteristic(SECURE_CONTROL_POINT_UUID).unwrap());

        dev.write_command(SECURE_BUTTONLESS_UUID, &[SECURE_ENTER_BOOTLOADER])
            .unwrap();
        assert!(dev.reboot_requested());
        assert!(!dev.has_characteristic(SECURE_BUTTONLESS_UUID).unwrap());
    }

    #[test]
    fn test_legacy_version_read() {
        let dev = SimulatedDevice::legacy();
        assert_eq!(
            dev.read(LEGACY_VERSION_UUID).unwrap(),
            LEGACY_DFU_MODE_VERSION.to_vec()
        );
        let app = SimulatedDevice::legacy().in_application_mode();
        assert_ne!(
            app.read(LEGACY_VERSION_UUID).unwrap(),
            LEGACY_DFU_MODE_VERSION.to_vec()
        );
    }
}
