//! Legacy (SDK < 12) transfer: one continuous image stream framed by
//! START_DFU / INIT_DFU / RECEIVE_FIRMWARE_IMAGE / VALIDATE / ACTIVATE.

use tracing::{debug, info, instrument};

use super::machine::{LegacyState, SegmentCounter, TransferSession};
use super::{DfuTransfer, ModeSwitch, TransferContext, TransferStats};
use crate::error::TransferError;
use crate::events::{DfuPhase, LogLevel};
use crate::payload::{FirmwareImage, InitData, SegmentIter};
use crate::protocol::command::legacy_image_size_packet;
use crate::protocol::constants::*;
use crate::protocol::{Dialect, LegacyCommand, LegacyNotification, LegacyOpcode, Notification};

#[derive(Debug, Default)]
pub struct LegacyTransfer;

impl LegacyTransfer {
    pub fn new() -> Self {
        Self
    }

    fn command(&self, ctx: &TransferContext<'_>, cmd: LegacyCommand) -> Result<(), TransferError> {
        debug!(command = %cmd.opcode(), "Sending command");
        ctx.send_command(LEGACY_CONTROL_POINT_UUID, &cmd.encode())
    }

    fn next(ctx: &TransferContext<'_>) -> Result<LegacyNotification, TransferError> {
        match ctx.require_notification(Dialect::Legacy)? {
            Notification::Legacy(n) => Ok(n),
            // decode is keyed on the dialect
            Notification::Secure(r) => Err(TransferError::UnexpectedResponse {
                expected: "legacy notification",
                actual: r.to_string(),
            }),
        }
    }

    /// Block until the device answers `procedure`. Packet receipts that
    /// arrive first are progress only.
    fn await_response(
        &self,
        ctx: &TransferContext<'_>,
        procedure: LegacyOpcode,
    ) -> Result<(), TransferError> {
        loop {
            match Self::next(ctx)? {
                LegacyNotification::PacketReceipt { bytes_acked } => {
                    debug!(bytes_acked, expected = %procedure, "Skipping packet receipt");
                }
                LegacyNotification::Response { procedure: p, result } => {
                    if p != procedure {
                        return Err(TransferError::UnexpectedResponse {
                            expected: procedure.name(),
                            actual: p.name().to_string(),
                        });
                    }
                    if !result.is_success() {
                        return Err(TransferError::ProcedureFailed {
                            procedure: p.name(),
                            result: result.name(),
                            code: result.code(),
                        });
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Block for a packet receipt at a checkpoint. Returns the device's
    /// byte count.
    fn await_receipt(&self, ctx: &TransferContext<'_>) -> Result<u32, TransferError> {
        match Self::next(ctx)? {
            LegacyNotification::PacketReceipt { bytes_acked } => Ok(bytes_acked),
            LegacyNotification::Response { procedure, result } if !result.is_success() => {
                Err(TransferError::ProcedureFailed {
                    procedure: procedure.name(),
                    result: result.name(),
                    code: result.code(),
                })
            }
            LegacyNotification::Response { procedure, .. } => {
                Err(TransferError::UnexpectedResponse {
                    expected: LegacyOpcode::PacketReceiptNotification.name(),
                    actual: procedure.name().to_string(),
                })
            }
        }
    }

    fn stream_firmware(
        &self,
        ctx: &TransferContext<'_>,
        session: &mut TransferSession<LegacyState>,
        image: &FirmwareImage,
    ) -> Result<(), TransferError> {
        let segments = SegmentIter::new(image.as_bytes(), ctx.config.segment_size);
        let last = segments.total();
        let mut counter = SegmentCounter::new(session.packet_receipt_interval);

        for (index, segment) in segments.enumerate() {
            ctx.send_data(LEGACY_PACKET_UUID, segment)?;
            session.offset += segment.len();

            if index + 1 == last {
                info!(segments = last, "Image sent, waiting for transfer complete");
                self.await_response(ctx, LegacyOpcode::ReceiveFirmwareImage)?;
                session.bytes_sent = session.total;
                ctx.progress(DfuPhase::Firmware, session.bytes_sent, session.total);
            } else if counter.record() {
                let acked = self.await_receipt(ctx)? as usize;
                if acked != session.offset {
                    debug!(acked, sent = session.offset, "Receipt disagrees with bytes sent");
                }
                session.bytes_sent = acked.min(session.total);
                ctx.progress(DfuPhase::Firmware, session.bytes_sent, session.total);
                ctx.ensure_not_cancelled(session.bytes_sent, session.total)?;
            }
        }
        Ok(())
    }
}

impl DfuTransfer for LegacyTransfer {
    fn dialect(&self) -> Dialect {
        Dialect::Legacy
    }

    fn check_device_mode(&self, ctx: &TransferContext<'_>) -> Result<bool, TransferError> {
        let version = ctx.link.read(LEGACY_VERSION_UUID)?;
        debug!(version = %hex::encode(&version), "DFU version");
        Ok(version == LEGACY_DFU_MODE_VERSION)
    }

    fn switch_to_dfu_mode(&self, ctx: &TransferContext<'_>) -> Result<ModeSwitch, TransferError> {
        ctx.link.subscribe(LEGACY_CONTROL_POINT_UUID)?;
        self.command(
            ctx,
            LegacyCommand::StartDfu {
                image_type: LEGACY_IMAGE_TYPE_APPLICATION,
            },
        )?;
        Ok(ModeSwitch::Rebooting { address_offset: 0 })
    }

    #[instrument(skip_all, fields(image = image.len(), init = init.len()))]
    fn start(
        &mut self,
        ctx: &TransferContext<'_>,
        image: &FirmwareImage,
        init: &InitData,
    ) -> Result<TransferStats, TransferError> {
        let size = u32::try_from(image.len())
            .map_err(|_| TransferError::ImageTooLarge { size: image.len() })?;
        let mut session: TransferSession<LegacyState> = TransferSession::new(
            Dialect::Legacy,
            image.len(),
            ctx.config.packet_receipt_interval,
        );
        let total = session.total;

        ctx.link.subscribe(LEGACY_CONTROL_POINT_UUID)?;

        // START_DFU + image size
        ctx.ensure_not_cancelled(0, total)?;
        self.command(
            ctx,
            LegacyCommand::StartDfu {
                image_type: LEGACY_IMAGE_TYPE_APPLICATION,
            },
        )?;
        ctx.send_data(LEGACY_PACKET_UUID, &legacy_image_size_packet(size))?;
        session.goto_state(LegacyState::AwaitingSizeAck);
        self.await_response(ctx, LegacyOpcode::StartDfu)?;

        // Init packet, answered once flash erase completes
        ctx.phase(DfuPhase::InitPacket);
        ctx.ensure_not_cancelled(0, total)?;
        self.command(ctx, LegacyCommand::InitDfu { complete: false })?;
        for segment in SegmentIter::new(init.as_bytes(), ctx.config.segment_size) {
            ctx.send_data(LEGACY_PACKET_UUID, segment)?;
        }
        self.command(ctx, LegacyCommand::InitDfu { complete: true })?;
        session.goto_state(LegacyState::AwaitingInitAck);
        self.await_response(ctx, LegacyOpcode::InitDfu)?;
        ctx.log(LogLevel::Info, "Init packet accepted");

        // Firmware stream
        ctx.phase(DfuPhase::Firmware);
        ctx.ensure_not_cancelled(0, total)?;
        self.command(
            ctx,
            LegacyCommand::PrnRequest {
                interval: session.packet_receipt_interval,
            },
        )?;
        self.command(ctx, LegacyCommand::ReceiveFirmwareImage)?;
        session.goto_state(LegacyState::Streaming);
        self.stream_firmware(ctx, &mut session, image)?;

        // Validation
        ctx.phase(DfuPhase::Validation);
        ctx.ensure_not_cancelled(session.bytes_sent, total)?;
        self.command(ctx, LegacyCommand::ValidateFirmware)?;
        session.goto_state(LegacyState::AwaitingValidation);
        self.await_response(ctx, LegacyOpcode::ValidateFirmware)?;

        // Let the bootloader finish copying before it resets
        ctx.phase(DfuPhase::Activation);
        ctx.sleep_ms(ctx.config.activation_delay_ms);
        ctx.ensure_not_cancelled(session.bytes_sent, total)?;
        self.command(ctx, LegacyCommand::ActivateImageAndReset)?;
        session.goto_state(LegacyState::Activated);

        Ok(TransferStats {
            bytes_sent: session.bytes_sent,
            objects: 0,
            retransmits: 0,
        })
    }
}
