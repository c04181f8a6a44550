use anyhow::{bail, Context, Result};
use clap::Parser;
use dfc_types::StreamDirection;
use dfc_usb::device::{DfcCommands, DfcUsb, EndpointInfo};
use dfc_usb::firmware::FirmwareImage;
use dfc_usb::rusb;
use dfc_usb::stream::{
    CaptureTransform, PlaybackTransform, StatisticsCollector, StreamConfig, StreamEngine,
    StreamStats, Transform,
};
use log::{error, info, warn};
use simplelog::{ColorChoice, CombinedLogger, Config, TermLogger, TerminalMode};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::{signal, task, time};

use crate::cli::Cli;
use crate::settings::Settings;

mod cli;
mod settings;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const EVENT_TIMEOUT: Duration = Duration::from_millis(100);

#[tokio::main]
async fn main() -> Result<()> {
    let args: Cli = Cli::parse();

    CombinedLogger::init(vec![TermLogger::new(
        args.log_level.into(),
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )])
    .context("Could not configure the logger")?;

    if let Err(error) = args.validate() {
        bail!(error);
    }

    info!("Starting DFC streaming client v{}", VERSION);
    let settings = match &args.config {
        Some(path) => Settings::read(path)?,
        None => Settings::default(),
    };

    let firmware = match &args.firmware {
        Some(path) => Some(FirmwareImage::load(path).context(format!(
            "Could not load firmware image at {}",
            path.to_string_lossy()
        ))?),
        None => None,
    };

    let context = rusb::Context::new().context("Could not initialise libusb")?;
    let mut device = DfcUsb::open(context, &settings.open_options(), firmware.as_ref())
        .context("Could not open the DFC device")?;

    let endpoint = device
        .claim_interfaces(
            args.control_interface,
            args.data_interface.interface,
            args.data_interface.alt_setting,
            args.endpoint,
        )
        .context("Could not claim the device interfaces")?;

    if !args.cypress_example {
        configure(&mut device, &args)?;
    }

    let result = if args.duration > 0.0 {
        stream(&device, &args, &settings, &endpoint).await
    } else {
        Ok(())
    };

    let result = stop_device(&mut device, !args.cypress_example, result);
    device.close();
    result
}

/// Stops the device after streaming. A failed stop fails the run, unless the
/// stream already failed, in which case that error wins.
fn stop_device<D: DfcCommands>(device: &mut D, stop: bool, streamed: Result<()>) -> Result<()> {
    let stopped = if stop {
        device.stop().context("Could not stop the device")
    } else {
        Ok(())
    };
    match (streamed, stopped) {
        (Err(error), Err(stop_error)) => {
            error!("{:#}", stop_error);
            Err(error)
        }
        (streamed, stopped) => streamed.and(stopped),
    }
}

fn configure(device: &mut DfcUsb<rusb::Context>, args: &Cli) -> Result<()> {
    if let Ok(descriptor) = device.get_descriptor() {
        info!(
            "{} {} ({:04x}:{:04x})",
            descriptor.device_manufacturer,
            descriptor.product_name,
            descriptor.vendor_id,
            descriptor.product_id
        );
    }

    let version = device
        .get_firmware_version()
        .context("Could not read the firmware version")?;
    info!("Firmware version: {}", version);

    let mode = args.mode();
    device
        .configure_mode(mode)
        .context(format!("Could not set mode {}", mode))?;
    info!("Device mode: {}", mode);

    if !mode.uses_internal_clock() {
        let program = device
            .start_clock(args.corrected_reference(), args.sample_rate)
            .context("Could not program the sample clock")?;
        info!("Sample clock: {}Hz", program.achieved_frequency());
    }

    device.start().context("Could not start the device")?;
    Ok(())
}

fn open_transform(args: &Cli) -> Result<Transform> {
    Ok(match args.direction() {
        StreamDirection::Capture => {
            let sink: Option<Box<dyn Write + Send>> = match args.output.as_deref() {
                None => None,
                Some(path) if path == Path::new("-") => Some(Box::new(BufWriter::new(io::stdout()))),
                Some(path) => Some(Box::new(BufWriter::new(File::create(path).context(
                    format!("Could not create output file at {}", path.to_string_lossy()),
                )?))),
            };
            Transform::Capture(CaptureTransform::new(sink))
        }
        StreamDirection::Playback => {
            let source: Box<dyn Read + Send> = match args.input.as_deref() {
                Some(path) if path != Path::new("-") => Box::new(BufReader::new(
                    File::open(path).context(format!(
                        "Could not open input file at {}",
                        path.to_string_lossy()
                    ))?,
                )),
                _ => Box::new(io::stdin()),
            };
            Transform::Playback(PlaybackTransform::new(source))
        }
    })
}

async fn stream(
    device: &DfcUsb<rusb::Context>,
    args: &Cli,
    settings: &Settings,
    endpoint: &EndpointInfo,
) -> Result<()> {
    let transport = device
        .bulk_transport(endpoint, settings.bulk_timeout())
        .context("Could not create the bulk transport")?;
    let transform = open_transform(args)?;
    let config = StreamConfig {
        packets_per_transfer: args.packets as usize,
        packet_size: endpoint.packet_size,
        queue_depth: args.queue_depth as usize,
        event_timeout: EVENT_TIMEOUT,
    };
    let histograms = args.histogram;

    // Transfers are bound to the thread pumping their events, so the engine
    // is built there and only the stop handle comes back.
    let (stop_tx, stop_rx) = oneshot::channel();
    let mut reactor = task::spawn_blocking(
        move || -> Result<(StreamStats, StatisticsCollector)> {
            let mut engine = StreamEngine::new(transport, &config, transform, histograms)
                .context("Could not allocate transfers")?;
            let _ = stop_tx.send(engine.stop_handle());

            let started = Instant::now();
            let result = engine.run();
            let stats = engine.stats(started.elapsed());
            result.context("Streaming failed")?;
            Ok((stats, engine.into_statistics()))
        },
    );

    let Ok(stop) = stop_rx.await else {
        reactor.await.context("Streaming task failed")??;
        bail!("Streaming task ended before starting");
    };

    let duration = Duration::from_secs_f64(args.duration);
    let finished = tokio::select! {
        result = &mut reactor => Some(result),
        _ = time::sleep(duration) => {
            info!("Streaming duration elapsed");
            None
        }
        _ = interrupted() => {
            info!("Interrupted, stopping");
            None
        }
    };

    let result = match finished {
        Some(result) => result,
        None => {
            stop.request_stop();
            reactor.await
        }
    };

    let (stats, statistics) = result.context("Streaming task failed")??;
    stats.log();

    if histograms {
        let mut stdout = io::stdout().lock();
        statistics
            .write_histograms(&mut stdout)
            .context("Could not write the histogram report")?;
    }
    Ok(())
}

async fn interrupted() {
    if let Err(error) = signal::ctrl_c().await {
        warn!("Unable to listen for interrupts: {}", error);
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfc_usb::commands::Command;
    use dfc_usb::device::ExecutableDfc;
    use dfc_usb::error::CommandError;

    #[derive(Default)]
    struct StopRecorder {
        stops: usize,
        refuse: bool,
    }

    impl ExecutableDfc for StopRecorder {
        fn read_control(&mut self, _command: Command, length: usize) -> Result<Vec<u8>, CommandError> {
            Ok(vec![0; length])
        }

        fn write_control(&mut self, command: Command, _payload: &[u8]) -> Result<(), CommandError> {
            if command == Command::Stop {
                self.stops += 1;
                if self.refuse {
                    return Err(CommandError::UsbError(rusb::Error::Pipe));
                }
            }
            Ok(())
        }
    }

    impl DfcCommands for StopRecorder {}

    #[test]
    fn failed_stop_fails_the_run() {
        let mut device = StopRecorder {
            refuse: true,
            ..Default::default()
        };
        let error = stop_device(&mut device, true, Ok(())).unwrap_err();
        assert_eq!(device.stops, 1);
        assert!(error.to_string().contains("Could not stop the device"));
    }

    #[test]
    fn stream_error_wins_over_stop_error() {
        let mut device = StopRecorder {
            refuse: true,
            ..Default::default()
        };
        let error = stop_device(&mut device, true, Err(anyhow::anyhow!("Streaming failed")))
            .unwrap_err();
        assert_eq!(error.to_string(), "Streaming failed");
    }

    #[test]
    fn stop_is_skipped_for_plain_firmware() {
        let mut device = StopRecorder::default();
        stop_device(&mut device, false, Ok(())).unwrap();
        assert_eq!(device.stops, 0);

        stop_device(&mut device, true, Ok(())).unwrap();
        assert_eq!(device.stops, 1);
    }
}
