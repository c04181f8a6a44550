use clap::{Parser, ValueEnum};
use dfc_types::{DfcMode, StreamDirection};
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Parser, Debug)]
#[clap(about, version, author)]
pub struct Cli {
    /// Firmware image to boot the device with, when it is in DFU mode
    #[clap(short = 'f', long)]
    pub firmware: Option<PathBuf>,

    /// Operating mode, defaults to SINGLE-ADC for capture and DAC for playback
    #[clap(short = 'm', long, value_enum)]
    pub mode: Option<DfcMode>,

    /// Sample rate in Hz
    #[clap(short = 's', long, default_value_t = 32e6)]
    pub sample_rate: f64,

    /// Reference clock frequency in Hz
    #[clap(short = 'x', long, default_value_t = 27e6)]
    pub reference: f64,

    /// Reference clock correction in ppm
    #[clap(short = 'c', long, default_value_t = 0.0, allow_negative_numbers = true)]
    pub ppm: f64,

    /// Interface used for vendor requests
    #[clap(long, default_value_t = 0)]
    pub control_interface: u8,

    /// Interface carrying the stream, optionally with an alternate setting (N[@ALT])
    #[clap(short = 'j', long, default_value = "0")]
    pub data_interface: InterfaceSelection,

    /// Endpoint index within the data interface
    #[clap(short = 'e', long, default_value_t = 0)]
    pub endpoint: u8,

    /// Packets per transfer
    #[clap(short = 'r', long, default_value_t = 16, value_parser = clap::value_parser!(u32).range(1..))]
    pub packets: u32,

    /// Number of transfers kept in flight
    #[clap(short = 'q', long, default_value_t = 16, value_parser = clap::value_parser!(u32).range(1..))]
    pub queue_depth: u32,

    /// Streaming duration in seconds, 0 only configures the device
    #[clap(short = 't', long, default_value_t = 100.0)]
    pub duration: f64,

    /// Write captured samples to a file, or '-' for stdout
    #[clap(short = 'o', long, conflicts_with = "input")]
    pub output: Option<PathBuf>,

    /// Play samples from a file, or '-' for stdin
    #[clap(short = 'i', long)]
    pub input: Option<PathBuf>,

    /// Print a histogram of the captured sample values to stdout
    #[clap(short = 'H', long, conflicts_with = "input")]
    pub histogram: bool,

    /// Stock streamer example firmware, skip every vendor request
    #[clap(short = 'C', long)]
    pub cypress_example: bool,

    /// Location of the device settings file
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// Minimum log level to print out
    #[clap(long, value_enum, default_value = "info")]
    pub log_level: LevelFilter,
}

impl Cli {
    pub fn direction(&self) -> StreamDirection {
        if self.input.is_some() {
            StreamDirection::Playback
        } else {
            StreamDirection::Capture
        }
    }

    pub fn mode(&self) -> DfcMode {
        self.mode
            .unwrap_or_else(|| DfcMode::default_for(self.direction()))
    }

    /// Checks the combinations clap cannot express on its own.
    pub fn validate(&self) -> Result<(), String> {
        let direction = self.direction();
        if !self.mode().supports(direction) {
            return Err(format!(
                "Mode {} cannot be used for {}",
                self.mode(),
                direction
            ));
        }
        if self.histogram && self.output.as_deref().and_then(|p| p.to_str()) == Some("-") {
            return Err("Histogram output cannot be combined with samples on stdout".to_string());
        }
        let reference = self.corrected_reference();
        if !reference.is_finite() || reference <= 0.0 {
            return Err(format!("Invalid reference clock: {}Hz", reference));
        }
        if !self.duration.is_finite() || self.duration < 0.0 {
            return Err(format!("Invalid duration: {}", self.duration));
        }
        Ok(())
    }

    pub fn corrected_reference(&self) -> f64 {
        self.reference * (1.0 + 1e-6 * self.ppm)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct InterfaceSelection {
    pub interface: u8,
    pub alt_setting: u8,
}

impl FromStr for InterfaceSelection {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parse = |part: &str| {
            part.trim()
                .parse::<u8>()
                .map_err(|e| format!("Invalid interface '{}': {}", value, e))
        };

        match value.split_once('@') {
            Some((interface, alt_setting)) => Ok(Self {
                interface: parse(interface)?,
                alt_setting: parse(alt_setting)?,
            }),
            None => Ok(Self {
                interface: parse(value)?,
                alt_setting: 0,
            }),
        }
    }
}

#[repr(usize)]
#[derive(ValueEnum, Copy, Clone, Eq, PartialEq, Debug)]
pub enum LevelFilter {
    /// A level lower than all log levels.
    Off,
    /// Corresponds to the `Error` log level.
    Error,
    /// Corresponds to the `Warn` log level.
    Warn,
    /// Corresponds to the `Info` log level.
    Info,
    /// Corresponds to the `Debug` log level.
    Debug,
    /// Corresponds to the `Trace` log level.
    Trace,
}

impl From<LevelFilter> for log::LevelFilter {
    fn from(level: LevelFilter) -> Self {
        match level {
            LevelFilter::Off => log::LevelFilter::Off,
            LevelFilter::Error => log::LevelFilter::Error,
            LevelFilter::Warn => log::LevelFilter::Warn,
            LevelFilter::Info => log::LevelFilter::Info,
            LevelFilter::Debug => log::LevelFilter::Debug,
            LevelFilter::Trace => log::LevelFilter::Trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("streaming-client").chain(args.iter().copied()))
    }

    #[test]
    fn defaults() {
        let cli = parse(&[]).unwrap();
        assert_eq!(cli.direction(), StreamDirection::Capture);
        assert_eq!(cli.mode(), DfcMode::SingleAdc);
        assert_eq!(cli.sample_rate, 32e6);
        assert_eq!(cli.data_interface, InterfaceSelection { interface: 0, alt_setting: 0 });
        assert_eq!(cli.packets, 16);
        assert_eq!(cli.queue_depth, 16);
        assert_eq!(cli.duration, 100.0);
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn input_selects_playback() {
        let cli = parse(&["-i", "samples.bin"]).unwrap();
        assert_eq!(cli.direction(), StreamDirection::Playback);
        assert_eq!(cli.mode(), DfcMode::Dac);
    }

    #[test]
    fn interface_with_alternate_setting() {
        let cli = parse(&["-j", "1@2"]).unwrap();
        assert_eq!(cli.data_interface, InterfaceSelection { interface: 1, alt_setting: 2 });
        assert!(parse(&["-j", "1@x"]).is_err());
    }

    #[test]
    fn exclusive_options() {
        assert!(parse(&["-i", "in.bin", "-o", "out.bin"]).is_err());
        assert!(parse(&["-i", "in.bin", "-H"]).is_err());

        let cli = parse(&["-H", "-o", "-"]).unwrap();
        assert!(cli.validate().is_err());
        let cli = parse(&["-H", "-o", "out.bin"]).unwrap();
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn mode_must_match_direction() {
        let cli = parse(&["-m", "dac"]).unwrap();
        assert!(cli.validate().is_err());
        let cli = parse(&["-m", "dac-fx3-clock", "-i", "-"]).unwrap();
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn reference_must_be_positive() {
        assert!(parse(&["-x", "0"]).unwrap().validate().is_err());
        assert!(parse(&["--reference=-27e6"]).unwrap().validate().is_err());
        assert!(parse(&["-c", "-1e6"]).unwrap().validate().is_err());
        assert!(parse(&["-x", "25e6"]).unwrap().validate().is_ok());
    }

    #[test]
    fn ppm_corrects_the_reference() {
        let cli = parse(&["-x", "10e6", "-c", "-2.5"]).unwrap();
        assert!((cli.corrected_reference() - 9_999_975.0).abs() < 1e-6);
    }
}
