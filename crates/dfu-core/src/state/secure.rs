//! Secure (SDK >= 12) transfer: the init packet and the firmware are each
//! sent as checksummed objects bounded by CREATE / EXECUTE, resumable from
//! whatever the device already holds.

use tracing::{debug, info, instrument, warn};

use super::machine::{ObjectInfo, SecureState, SegmentCounter, TransferSession};
use super::{DfuTransfer, ModeSwitch, TransferContext, TransferStats};
use crate::error::TransferError;
use crate::events::{DfuEvent, DfuPhase, LogLevel};
use crate::payload::{
    FirmwareImage, InitData, ObjectPartition, ObjectSpan, PrefixCrc, SegmentIter, object_start,
};
use crate::protocol::constants::*;
use crate::protocol::{
    Dialect, Notification, ObjectKind, SecureCommand, SecureOpcode, SecurePayload, SecureResponse,
};

/// Result of one checksum report.
enum Checkpoint {
    Verified { offset: usize, crc32: u32 },
    Retransmit(String),
}

/// Result of one `send_object` attempt.
enum ObjectOutcome {
    /// Bytes advanced: the device's object ceiling.
    Advanced(usize),
    Retransmit(String),
}

#[derive(Debug, Default)]
pub struct SecureTransfer;

type Session = TransferSession<SecureState>;

fn size_u32(len: usize) -> Result<u32, TransferError> {
    u32::try_from(len).map_err(|_| TransferError::ImageTooLarge { size: len })
}

impl SecureTransfer {
    pub fn new() -> Self {
        Self
    }

    fn next(ctx: &TransferContext<'_>) -> Result<Option<SecureResponse>, TransferError> {
        match ctx.next_notification(Dialect::Secure)? {
            Some(Notification::Secure(r)) => Ok(Some(r)),
            Some(Notification::Legacy(n)) => Err(TransferError::UnexpectedResponse {
                expected: "secure response",
                actual: n.to_string(),
            }),
            None => Ok(None),
        }
    }

    /// Block until the device answers `procedure`. A late packet receipt
    /// left over from an abandoned object is discarded.
    fn await_response(
        &self,
        ctx: &TransferContext<'_>,
        procedure: SecureOpcode,
    ) -> Result<SecureResponse, TransferError> {
        loop {
            let response = Self::next(ctx)?.ok_or(TransferError::NotificationTimeout {
                timeout_ms: ctx.config.notification_timeout_ms,
            })?;

            if response.procedure == SecureOpcode::CalcChecksum
                && procedure != SecureOpcode::CalcChecksum
                && response.result.is_success()
            {
                debug!(expected = %procedure, "Discarding stale packet receipt");
                continue;
            }
            if response.procedure != procedure {
                return Err(TransferError::UnexpectedResponse {
                    expected: procedure.name(),
                    actual: response.procedure.name().to_string(),
                });
            }
            if !response.result.is_success() {
                return Err(TransferError::ProcedureFailed {
                    procedure: procedure.name(),
                    result: response.result.name(),
                    code: response.result.code(),
                });
            }
            return Ok(response);
        }
    }

    fn command(
        &self,
        ctx: &TransferContext<'_>,
        session: &Session,
        cmd: SecureCommand,
    ) -> Result<(), TransferError> {
        ctx.ensure_not_cancelled(session.bytes_sent, session.total)?;
        debug!(command = %cmd.opcode(), "Sending command");
        ctx.send_command(SECURE_CONTROL_POINT_UUID, &cmd.encode())
    }

    /// Send a command and wait for its successful response.
    fn exchange(
        &self,
        ctx: &TransferContext<'_>,
        session: &Session,
        cmd: SecureCommand,
    ) -> Result<SecureResponse, TransferError> {
        self.command(ctx, session, cmd)?;
        self.await_response(ctx, cmd.opcode())
    }

    fn select(
        &self,
        ctx: &TransferContext<'_>,
        session: &mut Session,
        kind: ObjectKind,
    ) -> Result<ObjectInfo, TransferError> {
        let response = self.exchange(ctx, session, SecureCommand::Select { kind })?;
        let SecurePayload::Select {
            max_size,
            offset,
            crc32,
        } = response.payload
        else {
            return Err(TransferError::ProtocolViolation(format!(
                "SELECT {kind} response without object info"
            )));
        };
        if max_size == 0 {
            return Err(TransferError::ProtocolViolation(format!(
                "device advertised a zero-sized {kind} object"
            )));
        }
        let info = ObjectInfo {
            kind,
            max_size: max_size as usize,
            offset: offset as usize,
            crc32,
        };
        debug!(%kind, max_size, offset, crc32 = %format!("0x{crc32:08X}"), "Object selected");
        session.object = Some(info);
        Ok(info)
    }

    /// Consume one checksum report and verify it against the local prefix
    /// CRC. `floor` is the last verified offset in this object.
    fn checkpoint(
        &self,
        ctx: &TransferContext<'_>,
        prefix: &mut PrefixCrc<'_>,
        floor: usize,
        end: usize,
    ) -> Result<Checkpoint, TransferError> {
        let Some(response) = Self::next(ctx)? else {
            return Ok(Checkpoint::Retransmit("no checksum notification".into()));
        };
        if response.procedure != SecureOpcode::CalcChecksum {
            return Err(TransferError::UnexpectedResponse {
                expected: SecureOpcode::CalcChecksum.name(),
                actual: response.procedure.name().to_string(),
            });
        }
        if !response.result.is_success() {
            return Ok(Checkpoint::Retransmit(format!(
                "checksum reported {}",
                response.result
            )));
        }
        let SecurePayload::Checksum { offset, crc32 } = response.payload else {
            return Err(TransferError::ProtocolViolation(
                "checksum response without offset".into(),
            ));
        };

        let offset = offset as usize;
        if offset < floor {
            return Ok(Checkpoint::Retransmit(format!(
                "offset went backwards from {floor} to {offset}"
            )));
        }
        if offset > end {
            return Ok(Checkpoint::Retransmit(format!(
                "offset {offset} past object end {end}"
            )));
        }
        let expected = prefix.crc_to(offset);
        if expected != crc32 {
            let mismatch = TransferError::ChecksumMismatch {
                offset,
                expected,
                actual: crc32,
            };
            return Ok(Checkpoint::Retransmit(mismatch.to_string()));
        }
        Ok(Checkpoint::Verified { offset, crc32 })
    }

    /// Stream one object's bytes with checkpoints, then CALC_CHECKSUM.
    /// Returns the retransmit reason if the object must be resent.
    fn stream_object(
        &self,
        ctx: &TransferContext<'_>,
        session: &mut Session,
        data: &[u8],
        prefix: &mut PrefixCrc<'_>,
        span: ObjectSpan,
        phase: DfuPhase,
    ) -> Result<Option<String>, TransferError> {
        let mut counter = SegmentCounter::new(session.packet_receipt_interval);
        let mut verified = span.offset;
        session.offset = span.offset;

        let record = |session: &mut Session, offset: usize, crc32: u32| {
            if let Some(object) = session.object.as_mut() {
                object.offset = offset;
                object.crc32 = crc32;
            }
            if phase == DfuPhase::Firmware {
                session.bytes_sent = offset;
                ctx.progress(phase, offset, session.total);
            } else {
                ctx.progress(phase, offset, data.len());
            }
        };

        for segment in SegmentIter::new(&data[span.offset..span.end()], ctx.config.segment_size) {
            ctx.send_data(SECURE_PACKET_UUID, segment)?;
            session.offset += segment.len();

            if counter.record() {
                match self.checkpoint(ctx, prefix, verified, span.end())? {
                    Checkpoint::Verified { offset, crc32 } => {
                        verified = offset;
                        record(session, offset, crc32);
                        ctx.ensure_not_cancelled(session.bytes_sent, session.total)?;
                    }
                    Checkpoint::Retransmit(reason) => return Ok(Some(reason)),
                }
            }
        }

        self.command(ctx, session, SecureCommand::CalcChecksum)?;
        match self.checkpoint(ctx, prefix, verified, span.end())? {
            Checkpoint::Verified { offset, crc32 } if offset == span.end() => {
                record(session, offset, crc32);
                Ok(None)
            }
            Checkpoint::Verified { offset, .. } => Ok(Some(format!(
                "device holds {offset} of {} bytes",
                span.end()
            ))),
            Checkpoint::Retransmit(reason) => Ok(Some(reason)),
        }
    }

    /// Account for a failed object attempt, enforcing the retry bound.
    fn retransmit(
        &self,
        ctx: &TransferContext<'_>,
        session: &mut Session,
        offset: usize,
        attempt: u32,
        reason: String,
    ) -> Result<(), TransferError> {
        session.retransmits += 1;
        warn!(offset, attempt, reason = %reason, "Object rejected, retransmitting");
        ctx.emit(DfuEvent::ObjectRetransmit {
            offset,
            attempt,
            reason,
        });
        if let Some(limit) = ctx.config.max_object_retries
            && attempt > limit
        {
            return Err(TransferError::RetriesExhausted {
                offset,
                attempts: attempt,
            });
        }
        ctx.ensure_not_cancelled(session.bytes_sent, session.total)
    }

    #[instrument(skip_all, fields(len = init.len()))]
    fn send_init(
        &self,
        ctx: &TransferContext<'_>,
        session: &mut Session,
        init: &InitData,
    ) -> Result<(), TransferError> {
        session.goto_state(SecureState::InitObject);
        ctx.phase(DfuPhase::InitPacket);

        let data = init.as_bytes();
        let len = data.len();
        let size = size_u32(len)?;
        let info = self.select(ctx, session, ObjectKind::Command)?;

        // A zero CRC at full length marks an init packet the device keeps.
        if info.offset == len && info.crc32 == 0 {
            info!("Init packet already on device");
            ctx.log(LogLevel::Info, "Init packet already on device, not resending");
        } else {
            let span = ObjectSpan { offset: 0, len };
            let mut prefix = PrefixCrc::new(data);
            let mut attempt = 0;
            loop {
                if attempt > 0 || info.offset == 0 || info.offset > len {
                    self.exchange(
                        ctx,
                        session,
                        SecureCommand::Create {
                            kind: ObjectKind::Command,
                            size,
                        },
                    )?;
                }
                match self.stream_object(ctx, session, data, &mut prefix, span, DfuPhase::InitPacket)? {
                    None => break,
                    Some(reason) => {
                        attempt += 1;
                        self.retransmit(ctx, session, 0, attempt, reason)?;
                    }
                }
            }
        }

        self.exchange(ctx, session, SecureCommand::Execute)?;
        ctx.log(LogLevel::Info, "Init packet executed");
        Ok(())
    }

    /// Send one data object, creating it unless the device already holds a matching prefix.
    fn send_object(
        &self,
        ctx: &TransferContext<'_>,
        session: &mut Session,
        image: &[u8],
        prefix: &mut PrefixCrc<'_>,
        span: ObjectSpan,
        force_create: bool,
    ) -> Result<ObjectOutcome, TransferError> {
        let Some(object) = session.object else {
            return Err(TransferError::ProtocolViolation(
                "data object used before SELECT".into(),
            ));
        };
        let needs_create = force_create
            || span.offset == 0
            || span.offset >= object.max_size
            || !prefix.matches(span.offset, object.crc32);
        if needs_create {
            self.exchange(
                ctx,
                session,
                SecureCommand::Create {
                    kind: ObjectKind::Data,
                    size: size_u32(span.len)?,
                },
            )?;
        }

        if let Some(reason) = self.stream_object(ctx, session, image, prefix, span, DfuPhase::Firmware)? {
            return Ok(ObjectOutcome::Retransmit(reason));
        }

        self.exchange(ctx, session, SecureCommand::Execute)?;
        session.objects += 1;
        debug!(offset = span.offset, len = span.len, "Object executed");
        Ok(ObjectOutcome::Advanced(object.max_size))
    }

    #[instrument(skip_all, fields(len = image.len()))]
    fn send_firmware(
        &self,
        ctx: &TransferContext<'_>,
        session: &mut Session,
        image: &FirmwareImage,
    ) -> Result<(), TransferError> {
        session.goto_state(SecureState::FirmwareObjects);
        ctx.phase(DfuPhase::Firmware);

        let data = image.as_bytes();
        let total = data.len();
        let info = self.select(ctx, session, ObjectKind::Data)?;
        let mut prefix = PrefixCrc::new(data);

        let resume = if info.offset <= total && prefix.matches(info.offset, info.crc32) {
            info.offset
        } else {
            warn!(
                offset = info.offset,
                crc32 = %format!("0x{:08X}", info.crc32),
                "Device data does not match this image, starting over"
            );
            0
        };
        let partition = ObjectPartition::new(total, info.max_size, resume);
        info!(
            max_size = info.max_size,
            resume,
            objects = partition.remaining(),
            "Sending firmware"
        );
        // A partial object is resent from its start.
        let acknowledged = if resume == total {
            total
        } else {
            object_start(resume, info.max_size)
        };
        session.bytes_sent = acknowledged;
        ctx.progress(DfuPhase::Firmware, acknowledged, total);

        if resume == total {
            // Everything already received; the final object only needs executing.
            self.exchange(ctx, session, SecureCommand::Execute)?;
            return Ok(());
        }

        for span in partition {
            let mut attempt = 0;
            loop {
                match self.send_object(ctx, session, data, &mut prefix, span, attempt > 0)? {
                    ObjectOutcome::Advanced(advanced) => {
                        debug!(advanced, end = span.end(), "Object complete");
                        break;
                    }
                    ObjectOutcome::Retransmit(reason) => {
                        attempt += 1;
                        self.retransmit(ctx, session, span.offset, attempt, reason)?;
                    }
                }
            }
        }
        Ok(())
    }
}

impl DfuTransfer for SecureTransfer {
    fn dialect(&self) -> Dialect {
        Dialect::Secure
    }

    fn check_device_mode(&self, ctx: &TransferContext<'_>) -> Result<bool, TransferError> {
        // The application exposes the buttonless service; the bootloader does not.
        Ok(!ctx.link.has_characteristic(SECURE_BUTTONLESS_UUID)?)
    }

    fn switch_to_dfu_mode(&self, ctx: &TransferContext<'_>) -> Result<ModeSwitch, TransferError> {
        ctx.link.subscribe(SECURE_BUTTONLESS_UUID)?;
        ctx.send_command(SECURE_BUTTONLESS_UUID, &[SECURE_ENTER_BOOTLOADER])?;
        Ok(ModeSwitch::Rebooting {
            address_offset: SECURE_BOOTLOADER_ADDRESS_OFFSET,
        })
    }

    #[instrument(skip_all, fields(image = image.len(), init = init.len()))]
    fn start(
        &mut self,
        ctx: &TransferContext<'_>,
        image: &FirmwareImage,
        init: &InitData,
    ) -> Result<TransferStats, TransferError> {
        size_u32(image.len())?;
        let mut session: Session = TransferSession::new(
            Dialect::Secure,
            image.len(),
            ctx.config.packet_receipt_interval,
        );

        ctx.link.subscribe(SECURE_CONTROL_POINT_UUID)?;

        session.goto_state(SecureState::Configuring);
        self.exchange(
            ctx,
            &session,
            SecureCommand::SetPrn {
                interval: session.packet_receipt_interval,
            },
        )?;

        self.send_init(ctx, &mut session, init)?;
        self.send_firmware(ctx, &mut session, image)?;

        session.bytes_sent = session.total;
        session.goto_state(SecureState::Complete);
        Ok(TransferStats {
            bytes_sent: session.bytes_sent,
            objects: session.objects,
            retransmits: session.retransmits,
        })
    }
}
