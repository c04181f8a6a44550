use dfc_clock::ClockError;
use dfc_types::DfcMode;

#[derive(thiserror::Error, Debug)]
pub enum ConnectError {
    #[error("No DFC streamer device was found")]
    DeviceNotFound,

    #[error("USB error: {0}")]
    UsbError(#[from] rusb::Error),

    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("A kernel driver is active on interface {0}")]
    KernelDriverActive(u8),

    #[error("Firmware upload failed: {0}")]
    FirmwareUploadFailed(#[from] FirmwareError),
}

#[derive(thiserror::Error, Debug)]
pub enum FirmwareError {
    #[error("No \"CY\" header prefix in firmware image")]
    BadMagic,

    #[error("Firmware image does not contain executable code")]
    NotExecutable,

    #[error("Firmware image type {0:#04x} is not FW w/ checksum")]
    BadImageType(u8),

    #[error("Firmware image is truncated at offset {0}")]
    Truncated(usize),

    #[error("Checksum error in firmware image: actual={actual:#010x} expecting={expected:#010x}")]
    ChecksumMismatch { actual: u32, expected: u32 },

    #[error("Device accepted 0 bytes at address {0:#010x}")]
    ShortWrite(u32),

    #[error("USB error: {0}")]
    UsbError(#[from] rusb::Error),

    #[error("Unable to read firmware image: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum CommandError {
    #[error("USB error: {0}")]
    UsbError(#[from] rusb::Error),

    #[error("Malformed response from device: {0}")]
    MalformedResponse(String),

    #[error("Clock programming failed: {0}")]
    Clock(#[from] ClockError),

    #[error("Device reports mode {actual}, expected {expected}")]
    ModeMismatch { actual: u8, expected: DfcMode },

    #[error("Device session is closed")]
    SessionClosed,
}

#[derive(thiserror::Error, Debug)]
pub enum StreamError {
    #[error("Unable to submit transfer {slot}: {source}")]
    SubmissionFailed { slot: usize, source: rusb::Error },

    #[error("{0} transfer cancellation(s) failed")]
    CancelFailed(usize),

    #[error("Unable to allocate transfer {slot}: {source}")]
    Allocation { slot: usize, source: rusb::Error },

    #[error("Stream is {0}, operation not permitted")]
    InvalidState(&'static str),

    #[error("USB error: {0}")]
    UsbError(#[from] rusb::Error),
}
