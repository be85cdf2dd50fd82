use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use dfu_core::{
    Dialect, DfuEvent, DfuObserver, DfuSession, Fault, ModeSwitch, ObjectPartition, PrefixCrc,
    SimulatedDevice, TracingObserver, TransferConfig,
};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Nordic BLE DFU transfer tool", long_about = None)]
struct Args {
    /// Transfer configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show how an image would be split into secure DFU objects
    Plan {
        /// Firmware image (.bin or .hex)
        #[arg(long)]
        firmware: Option<String>,

        /// Init packet (.dat)
        #[arg(long)]
        init: Option<String>,

        /// Maximum data object size advertised by the bootloader
        #[arg(long, default_value_t = 4096)]
        max_object_size: usize,
    },
    /// Run a full transfer against the built-in simulated bootloader
    Simulate {
        /// Firmware image (.bin or .hex)
        #[arg(long)]
        firmware: Option<String>,

        /// Init packet (.dat)
        #[arg(long)]
        init: Option<String>,

        /// Protocol dialect (legacy or secure)
        #[arg(long)]
        dialect: Option<Dialect>,

        /// Packet receipt interval in segments
        #[arg(long)]
        prn: Option<u16>,

        /// Maximum data object size the simulated bootloader advertises
        #[arg(long, default_value_t = 4096)]
        max_object_size: u32,

        /// Start the device in application mode
        #[arg(long)]
        from_application: bool,

        /// Corrupt the K-th checksum report (repeatable)
        #[arg(long = "corrupt-checkpoint", value_name = "K")]
        corrupt_checkpoint: Vec<usize>,
    },
    /// Write a default configuration file
    Config {
        #[arg(long)]
        output: PathBuf,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<TransferConfig> {
    match path {
        Some(path) => TransferConfig::load_from_file(path),
        None => Ok(TransferConfig::default()),
    }
}

fn plan(config: TransferConfig, max_object_size: usize) -> Result<()> {
    if max_object_size == 0 {
        bail!("--max-object-size must be greater than zero");
    }
    let session = DfuSession::new(config);
    let (image, init) = session.load_inputs()?;

    println!("init packet : {} bytes", init.len());
    println!("firmware    : {} bytes", image.len());
    println!("crc32       : 0x{:08X}", image.crc32());
    println!(
        "segments    : {} of {} bytes",
        image.len().div_ceil(session.config().segment_size),
        session.config().segment_size
    );

    let partition = ObjectPartition::new(image.len(), max_object_size, 0);
    println!("objects     : {}", partition.remaining());
    let mut prefix = PrefixCrc::new(image.as_bytes());
    for (index, span) in partition.enumerate() {
        // The device reports the running CRC of everything up to the object end.
        let crc = prefix.crc_to(span.end());
        println!(
            "  #{index:<3} offset {:>8}  len {:>6}  crc32 0x{crc:08X}",
            span.offset, span.len
        );
    }
    Ok(())
}

/// Logs through tracing and remembers how far a failed transfer got.
#[derive(Default)]
struct Reporter {
    failed_at: Mutex<Option<(u64, u64)>>,
}

impl Reporter {
    fn failed_at(&self) -> Option<(u64, u64)> {
        *self.failed_at.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl DfuObserver for Reporter {
    fn on_event(&self, event: &DfuEvent) {
        if let DfuEvent::Error {
            bytes_sent, total, ..
        } = event
        {
            let mut failed_at = self.failed_at.lock().unwrap_or_else(|e| e.into_inner());
            *failed_at = Some((*bytes_sent, *total));
        }
        TracingObserver.on_event(event);
    }
}

/// Whether the simulated bootloader ended up with the whole image. Only the
/// legacy dialect has an explicit activation step.
fn holds_image(dialect: Dialect, device: &SimulatedDevice, len: usize) -> bool {
    match dialect {
        Dialect::Legacy => device.is_activated(),
        Dialect::Secure => device.committed_firmware() == len,
    }
}

struct SimulateOptions {
    max_object_size: u32,
    from_application: bool,
    corrupt_checkpoint: Vec<usize>,
}

fn simulate(config: TransferConfig, options: SimulateOptions) -> Result<()> {
    let dialect = config.dialect;
    let reporter = Arc::new(Reporter::default());
    let session = DfuSession::with_observer(config, reporter.clone());
    let (image, init) = session.load_inputs()?;

    let device = match dialect {
        Dialect::Legacy => SimulatedDevice::legacy(),
        Dialect::Secure => SimulatedDevice::secure_with_limits(256, options.max_object_size),
    };
    let device = if options.from_application {
        device.in_application_mode()
    } else {
        device
    };
    for k in options.corrupt_checkpoint {
        device.inject(Fault::CorruptChecksum(k));
    }

    if let ModeSwitch::Rebooting { address_offset } = session.enter_dfu_mode(&device)? {
        info!(address_offset, "Bootloader advertises at the application address + offset");
    }

    let completed = match session.run(&device, &image, &init) {
        Ok(completed) => completed,
        Err(e) => {
            let (sent, total) = reporter.failed_at().unwrap_or((0, image.len() as u64));
            return Err(anyhow::Error::new(e).context(format!(
                "simulated transfer failed after {sent} of {total} firmware bytes"
            )));
        }
    };

    let stats = device.stats();
    println!(
        "{} transfer complete: {} bytes, {} objects, {} retransmits in {:.2?}",
        completed.dialect,
        completed.bytes_sent,
        completed.objects,
        completed.retransmits,
        completed.elapsed
    );
    println!(
        "device saw {} command writes, {} data writes ({} bytes), {} checksum reports",
        stats.command_writes, stats.data_writes, stats.data_bytes, stats.checksum_reports
    );
    if !holds_image(dialect, &device, image.len()) {
        warn!(%dialect, "Device did not end up with the whole image");
    }
    Ok(())
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let mut config = load_config(args.config.as_ref())?;

    match args.command {
        Command::Plan {
            firmware,
            init,
            max_object_size,
        } => {
            config.firmware_path = firmware.or(config.firmware_path);
            config.init_path = init.or(config.init_path);
            plan(config, max_object_size)
        }
        Command::Simulate {
            firmware,
            init,
            dialect,
            prn,
            max_object_size,
            from_application,
            corrupt_checkpoint,
        } => {
            config.firmware_path = firmware.or(config.firmware_path);
            config.init_path = init.or(config.init_path);
            if let Some(dialect) = dialect {
                config.dialect = dialect;
            }
            if let Some(prn) = prn {
                config.packet_receipt_interval = prn;
            }
            config.validate()?;
            simulate(
                config,
                SimulateOptions {
                    max_object_size,
                    from_application,
                    corrupt_checkpoint,
                },
            )
        }
        Command::Config { output } => {
            TransferConfig::default().save_to_file(&output)?;
            info!(path = %output.display(), "Wrote default configuration");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfu_core::{FirmwareImage, InitData};

    fn quiet(dialect: Dialect) -> TransferConfig {
        TransferConfig {
            dialect,
            activation_delay_ms: 0,
            notification_timeout_ms: 50,
            ..Default::default()
        }
    }

    #[test]
    fn test_holds_image_after_secure_transfer() {
        let session = DfuSession::with_observer(quiet(Dialect::Secure), Arc::new(Reporter::default()));
        let device = SimulatedDevice::secure_with_limits(256, 200);
        let image = FirmwareImage::new(vec![0x3C; 300]);
        session
            .run(&device, &image, &InitData::new(vec![1; 8]))
            .unwrap();

        assert!(!device.is_activated());
        assert!(holds_image(Dialect::Secure, &device, image.len()));
    }

    #[test]
    fn test_holds_image_after_legacy_transfer() {
        let session = DfuSession::with_observer(quiet(Dialect::Legacy), Arc::new(Reporter::default()));
        let device = SimulatedDevice::legacy();
        let image = FirmwareImage::new(vec![0x3C; 45]);
        session
            .run(&device, &image, &InitData::new(vec![1; 8]))
            .unwrap();

        assert!(holds_image(Dialect::Legacy, &device, image.len()));
        assert!(!holds_image(Dialect::Legacy, &SimulatedDevice::legacy(), image.len()));
    }

    #[test]
    fn test_reporter_keeps_failure_progress() {
        let reporter = Arc::new(Reporter::default());
        let session = DfuSession::with_observer(quiet(Dialect::Secure), reporter.clone());
        let device = SimulatedDevice::secure_with_limits(256, 200);
        device.inject(Fault::DisconnectAfterWrite(20));

        let image = FirmwareImage::new(vec![0x3C; 400]);
        assert!(session.run(&device, &image, &InitData::new(vec![1; 8])).is_err());

        let (sent, total) = reporter.failed_at().unwrap();
        assert_eq!(total, 400);
        assert!(sent < total);
    }
}
