pub mod base;
pub mod descriptor;
pub mod libusb;

pub use base::{DfcCommands, ExecutableDfc};
pub use descriptor::EndpointInfo;
pub use libusb::device::{DfcUsb, OpenOptions, UsbData};
