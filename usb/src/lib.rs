pub use rusb;
pub mod commands;
pub mod device;
pub mod error;
pub mod firmware;
pub mod stream;
pub mod transfer;

pub const VID_CYPRESS: u16 = 0x04b4;
pub const PID_STREAMER: u16 = 0x00f1;
pub const PID_DFU: u16 = 0x00f3;
