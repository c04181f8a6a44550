use crate::commands::Command;
use crate::error::CommandError;
use byteorder::{ByteOrder, LittleEndian};
use dfc_clock::ClockProgram;
use dfc_types::DfcMode;
use log::{debug, info};
use std::thread::sleep;
use std::time::Duration;

const FIRMWARE_VERSION_LENGTH: usize = 64;
const MODE_SETTLE_TIME: Duration = Duration::from_millis(20);

// The raw vendor control channel, implemented per transport.
pub trait ExecutableDfc {
    fn read_control(&mut self, command: Command, length: usize) -> Result<Vec<u8>, CommandError>;
    fn write_control(&mut self, command: Command, payload: &[u8]) -> Result<(), CommandError>;
}

// These are commands that can be executed, but the control channel must be implemented..
pub trait DfcCommands: ExecutableDfc {
    fn get_firmware_version(&mut self) -> Result<String, CommandError> {
        let result = self.read_control(Command::GetFirmwareVersion, FIRMWARE_VERSION_LENGTH)?;
        let length = result.iter().position(|&c| c == 0).unwrap_or(result.len());
        Ok(String::from_utf8_lossy(&result[..length]).to_string())
    }

    fn get_mode(&mut self) -> Result<u8, CommandError> {
        let result = self.read_control(Command::GetMode, 1)?;
        result
            .first()
            .copied()
            .ok_or_else(|| CommandError::MalformedResponse("Empty mode response".to_string()))
    }

    fn set_mode(&mut self, mode: DfcMode) -> Result<(), CommandError> {
        self.write_control(Command::SetMode, &[mode.id()])
    }

    fn start(&mut self) -> Result<(), CommandError> {
        self.write_control(Command::Start, &[])
    }

    fn stop(&mut self) -> Result<(), CommandError> {
        self.write_control(Command::Stop, &[])
    }

    fn shutdown_adc(&mut self) -> Result<(), CommandError> {
        self.write_control(Command::ShutdownAdc, &[])
    }

    fn wakeup_adc(&mut self) -> Result<(), CommandError> {
        self.write_control(Command::WakeupAdc, &[])
    }

    fn shutdown_dac(&mut self) -> Result<(), CommandError> {
        self.write_control(Command::ShutdownDac, &[])
    }

    fn wakeup_dac(&mut self) -> Result<(), CommandError> {
        self.write_control(Command::WakeupDac, &[])
    }

    /// Validates the clock locally, then asks the firmware to program the
    /// synthesizer with the same parameters.
    fn start_clock(&mut self, reference: f64, frequency: f64) -> Result<ClockProgram, CommandError> {
        let program = ClockProgram::compute(reference, frequency)?;
        let feedback = program.feedback();
        info!(
            "Clock {}Hz from {}Hz: a={} b={} c={} output_ms={} rdiv={}",
            frequency,
            reference,
            feedback.integer,
            feedback.numerator,
            feedback.denominator,
            program.output_divider(),
            program.rdiv()
        );

        let mut payload = [0; 16];
        LittleEndian::write_f64(&mut payload[0..8], reference);
        LittleEndian::write_f64(&mut payload[8..16], frequency);
        self.write_control(Command::StartClock, &payload)?;
        Ok(program)
    }

    /// Switches the firmware to `mode`, checks it took, and powers up only
    /// the converter that mode uses.
    fn configure_mode(&mut self, mode: DfcMode) -> Result<(), CommandError> {
        if mode != DfcMode::UartOnly {
            self.set_mode(mode)?;
        }

        sleep(MODE_SETTLE_TIME);

        let current = self.get_mode()?;
        debug!("Device mode: {}", current);
        if current != mode.id() {
            return Err(CommandError::ModeMismatch {
                actual: current,
                expected: mode,
            });
        }

        match mode {
            DfcMode::SingleAdc | DfcMode::DualAdc => {
                self.wakeup_adc()?;
                self.shutdown_dac()?;
            }
            DfcMode::Dac | DfcMode::DacFx3Clock => {
                self.shutdown_adc()?;
                self.wakeup_dac()?;
            }
            DfcMode::SingleAdcFx3Clock => {
                info!("Shutting down ADC");
                self.shutdown_adc()?;
            }
            DfcMode::UartOnly => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingDevice {
        sent: Vec<(u8, Vec<u8>)>,
        mode: u8,
        version: Vec<u8>,
        fail_on: Option<u8>,
    }

    impl ExecutableDfc for RecordingDevice {
        fn read_control(&mut self, command: Command, length: usize) -> Result<Vec<u8>, CommandError> {
            self.sent.push((command.request(), vec![]));
            let mut response = match command {
                Command::GetFirmwareVersion => self.version.clone(),
                Command::GetMode => vec![self.mode],
                _ => vec![],
            };
            response.truncate(length);
            Ok(response)
        }

        fn write_control(&mut self, command: Command, payload: &[u8]) -> Result<(), CommandError> {
            if self.fail_on == Some(command.request()) {
                return Err(CommandError::UsbError(rusb::Error::Pipe));
            }
            if command == Command::SetMode {
                self.mode = payload[0];
            }
            self.sent.push((command.request(), payload.to_vec()));
            Ok(())
        }
    }

    impl DfcCommands for RecordingDevice {}

    fn requests(device: &RecordingDevice) -> Vec<u8> {
        device.sent.iter().map(|(request, _)| *request).collect()
    }

    #[test]
    fn firmware_version_stops_at_nul() {
        let mut device = RecordingDevice {
            version: b"DFC v1.4\0\0garbage".to_vec(),
            ..Default::default()
        };
        assert_eq!(device.get_firmware_version().unwrap(), "DFC v1.4");
    }

    #[test]
    fn capture_mode_wakes_the_adc_only() {
        let mut device = RecordingDevice::default();
        device.configure_mode(DfcMode::DualAdc).unwrap();
        assert_eq!(requests(&device), vec![0x90, 0x10, 0xc2, 0xc3]);
        assert_eq!(device.sent[0].1, vec![2]);
    }

    #[test]
    fn playback_mode_wakes_the_dac_only() {
        let mut device = RecordingDevice::default();
        device.configure_mode(DfcMode::Dac).unwrap();
        assert_eq!(requests(&device), vec![0x90, 0x10, 0xc1, 0xc4]);
    }

    #[test]
    fn uart_only_is_never_set() {
        let mut device = RecordingDevice::default();
        device.configure_mode(DfcMode::UartOnly).unwrap();
        assert_eq!(requests(&device), vec![0x10]);
    }

    #[test]
    fn mode_mismatch_is_reported() {
        let mut device = RecordingDevice {
            fail_on: None,
            mode: 3,
            ..Default::default()
        };
        let result = device.configure_mode(DfcMode::UartOnly);
        assert!(matches!(
            result,
            Err(CommandError::ModeMismatch {
                actual: 3,
                expected: DfcMode::UartOnly
            })
        ));
    }

    #[test]
    fn clock_request_carries_both_doubles() {
        let mut device = RecordingDevice::default();
        let program = device.start_clock(27e6, 32e6).unwrap();
        assert_eq!(program.rdiv(), 0);

        let (request, payload) = &device.sent[0];
        assert_eq!(*request, 0xb2);
        assert_eq!(payload.len(), 16);
        assert_eq!(LittleEndian::read_f64(&payload[0..8]), 27e6);
        assert_eq!(LittleEndian::read_f64(&payload[8..16]), 32e6);
    }

    #[test]
    fn invalid_clock_is_rejected_before_sending() {
        let mut device = RecordingDevice::default();
        assert!(matches!(
            device.start_clock(27e6, 1_000.0),
            Err(CommandError::Clock(_))
        ));
        assert!(device.sent.is_empty());
    }

    #[test]
    fn transport_failures_propagate() {
        let mut device = RecordingDevice {
            fail_on: Some(0xc3),
            ..Default::default()
        };
        assert!(matches!(
            device.configure_mode(DfcMode::SingleAdc),
            Err(CommandError::UsbError(rusb::Error::Pipe))
        ));
    }
}
