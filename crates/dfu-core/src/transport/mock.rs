//! Mock BLE link for testing.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use uuid::Uuid;

use super::traits::{DfuLink, LinkError};
use crate::protocol::{LegacyNotification, SecureResponse};

/// Kind of characteristic write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Command,
    Data,
}

/// A captured write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkWrite {
    pub characteristic: Uuid,
    pub kind: WriteKind,
    pub data: Vec<u8>,
}

/// Mock link for unit testing state machine logic.
///
/// Notifications are scripted up front; every write is captured.
pub struct MockLink {
    /// Queued notifications; `None` simulates a wait that times out.
    notifications: Arc<Mutex<VecDeque<Option<Vec<u8>>>>>,
    /// Captured writes.
    write_log: Arc<Mutex<Vec<LinkWrite>>>,
    /// Subscribed characteristics.
    subscriptions: Arc<Mutex<Vec<Uuid>>>,
    /// Characteristics the fake peer exposes.
    characteristics: Arc<Mutex<HashSet<Uuid>>>,
    /// Values returned on read.
    values: Arc<Mutex<HashMap<Uuid, Vec<u8>>>>,
    /// Whether command writes are acknowledged.
    command_ack: Arc<Mutex<bool>>,
    /// Whether the link is "connected".
    connected: Arc<Mutex<bool>>,
    /// Number of notification waits performed.
    waits: Arc<Mutex<usize>>,
}

impl MockLink {
    pub fn new() -> Self {
        Self {
            notifications: Arc::new(Mutex::new(VecDeque::new())),
            write_log: Arc::new(Mutex::new(Vec::new())),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            characteristics: Arc::new(Mutex::new(HashSet::new())),
            values: Arc::new(Mutex::new(HashMap::new())),
            command_ack: Arc::new(Mutex::new(true)),
            connected: Arc::new(Mutex::new(true)),
            waits: Arc::new(Mutex::new(0)),
        }
    }

    /// Queue a raw notification to be returned on the next wait.
    pub fn queue_notification(&self, raw: &[u8]) {
        self.notifications
            .lock()
            .unwrap()
            .push_back(Some(raw.to_vec()));
    }

    /// Queue a wait that elapses without a notification.
    pub fn queue_timeout(&self) {
        self.notifications.lock().unwrap().push_back(None);
    }

    /// Queue a secure dialect response.
    pub fn queue_secure(&self, response: SecureResponse) {
        self.queue_notification(&response.encode());
    }

    /// Queue a legacy dialect notification.
    pub fn queue_legacy(&self, notification: LegacyNotification) {
        self.queue_notification(&notification.encode());
    }

    /// Notifications not yet consumed.
    pub fn pending_notifications(&self) -> usize {
        self.notifications.lock().unwrap().len()
    }

    /// Number of notification waits performed so far.
    pub fn wait_count(&self) -> usize {
        *self.waits.lock().unwrap()
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<LinkWrite> {
        self.write_log.lock().unwrap().clone()
    }

    /// Captured writes of one kind, payload only.
    pub fn writes_of(&self, kind: WriteKind) -> Vec<Vec<u8>> {
        self.write_log
            .lock()
            .unwrap()
            .iter()
            .filter(|w| w.kind == kind)
            .map(|w| w.data.clone())
            .collect()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        self.write_log.lock().unwrap().clear();
    }

    /// Subscribed characteristics, in order.
    pub fn subscriptions(&self) -> Vec<Uuid> {
        self.subscriptions.lock().unwrap().clone()
    }

    /// Expose a characteristic.
    pub fn add_characteristic(&self, characteristic: Uuid) {
        self.characteristics.lock().unwrap().insert(characteristic);
    }

    /// Set the value returned when reading `characteristic`.
    pub fn set_value(&self, characteristic: Uuid, value: &[u8]) {
        self.add_characteristic(characteristic);
        self.values
            .lock()
            .unwrap()
            .insert(characteristic, value.to_vec());
    }

    /// Make command writes time out instead of being acknowledged.
    pub fn set_command_ack(&self, acked: bool) {
        *self.command_ack.lock().unwrap() = acked;
    }

    /// Simulate link loss.
    pub fn disconnect(&self) {
        *self.connected.lock().unwrap() = false;
    }

    /// Simulate reconnect.
    pub fn reconnect(&self) {
        *self.connected.lock().unwrap() = true;
    }

    fn record(&self, characteristic: Uuid, kind: WriteKind, data: &[u8]) -> Result<(), LinkError> {
        if !self.is_alive() {
            return Err(LinkError::Disconnected);
        }
        self.write_log.lock().unwrap().push(LinkWrite {
            characteristic,
            kind,
            data: data.to_vec(),
        });
        Ok(())
    }
}

impl Default for MockLink {
    fn default() -> Self {
        Self::new()
    }
}

impl DfuLink for MockLink {
    fn subscribe(&self, characteristic: Uuid) -> Result<(), LinkError> {
        if !self.is_alive() {
            return Err(LinkError::Disconnected);
        }
        self.subscriptions.lock().unwrap().push(characteristic);
        Ok(())
    }

    fn write_command(&self, characteristic: Uuid, value: &[u8]) -> Result<(), LinkError> {
        self.record(characteristic, WriteKind::Command, value)?;
        if *self.command_ack.lock().unwrap() {
            Ok(())
        } else {
            Err(LinkError::Timeout { timeout_ms: 10_000 })
        }
    }

    fn write_data(&self, characteristic: Uuid, value: &[u8]) -> Result<(), LinkError> {
        self.record(characteristic, WriteKind::Data, value)
    }

    fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, LinkError> {
        if !self.is_alive() {
            return Err(LinkError::Disconnected);
        }
        self.values
            .lock()
            .unwrap()
            .get(&characteristic)
            .cloned()
            .ok_or(LinkError::CharacteristicNotFound(characteristic))
    }

    fn has_characteristic(&self, characteristic: Uuid) -> Result<bool, LinkError> {
        if !self.is_alive() {
            return Err(LinkError::Disconnected);
        }
        Ok(self.characteristics.lock().unwrap().contains(&characteristic))
    }

    fn wait_for_notification(&self, _timeout: Duration) -> Result<Option<Vec<u8>>, LinkError> {
        *self.waits.lock().unwrap() += 1;
        if !self.is_alive() {
            return Err(LinkError::Disconnected);
        }
        Ok(self.notifications.lock().unwrap().pop_front().flatten())
    }

    fn is_alive(&self) -> bool {
        *self.connected.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::*;
    use crate::protocol::{SecureOpcode, SecureResult};

    #[test]
    fn test_mock_notification_queue() {
        let mock = MockLink::new();
        mock.queue_secure(SecureResponse::status(
            SecureOpcode::Execute,
            SecureResult::Success,
        ));
        mock.queue_timeout();

        let timeout = Duration::from_millis(10);
        let first = mock.wait_for_notification(timeout).unwrap();
        assert_eq!(first, Some(vec![0x60, 0x04, 0x01]));

        // Scripted timeout, then an empty queue also times out
        assert_eq!(mock.wait_for_notification(timeout).unwrap(), None);
        assert_eq!(mock.wait_for_notification(timeout).unwrap(), None);
        assert_eq!(mock.wait_count(), 3);
    }

    #[test]
    fn test_mock_write_capture() {
        let mock = MockLink::new();
        mock.write_command(SECURE_CONTROL_POINT_UUID, &[0x03]).unwrap();
        mock.write_data(SECURE_PACKET_UUID, b"Hello").unwrap();

        let writes = mock.get_writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].kind, WriteKind::Command);
        assert_eq!(writes[1].characteristic, SECURE_PACKET_UUID);
        assert_eq!(mock.writes_of(WriteKind::Data), vec![b"Hello".to_vec()]);
    }

    #[test]
    fn test_mock_disconnect() {
        let mock = MockLink::new();
        assert!(mock.is_alive());

        mock.disconnect();
        assert!(!mock.is_alive());
        assert!(matches!(
            mock.write_data(SECURE_PACKET_UUID, b"test"),
            Err(LinkError::Disconnected)
        ));
        assert!(matches!(
            mock.wait_for_notification(Duration::from_millis(1)),
            Err(LinkError::Disconnected)
        ));
    }

    #[test]
    fn test_mock_unacked_command() {
        let mock = MockLink::new();
        mock.set_command_ack(false);
        assert!(matches!(
            mock.write_command(LEGACY_CONTROL_POINT_UUID, &[0x04]),
            Err(LinkError::Timeout { .. })
        ));
        // still captured
        assert_eq!(mock.get_writes().len(), 1);
    }
}
