pub mod libusb;
pub mod pool;
pub mod synthetic;

use std::time::Duration;

pub use pool::{SlotState, TransferPool, MAX_WAIT_ERRORS};

/// Why a transfer finished without completing.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransferError {
    Error,
    TimedOut,
    Stall,
    NoDevice,
    Overflow,
    Unknown(i32),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Cancelled,
    Failed(TransferError),
}

/// Delivered once for every submitted transfer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    pub slot: usize,
    pub status: TransferStatus,
    pub actual_length: usize,
}

pub trait TransferBuffer {
    fn as_slice(&self) -> &[u8];
    fn as_mut_slice(&mut self) -> &mut [u8];
}

/// An asynchronous bulk pipe. Submitted slots belong to the transport until
/// their completion has been returned from `wait`.
pub trait BulkTransport {
    type Slot: TransferBuffer;

    fn allocate(&mut self, index: usize, length: usize) -> Result<Self::Slot, rusb::Error>;
    fn submit(&mut self, slot: &mut Self::Slot) -> Result<(), rusb::Error>;

    /// Returns `rusb::Error::NotFound` when the transfer already finished.
    fn cancel(&mut self, slot: &mut Self::Slot) -> Result<(), rusb::Error>;

    /// Processes events for up to `timeout`, appending finished transfers.
    fn wait(&mut self, timeout: Duration, completions: &mut Vec<Completion>)
        -> Result<(), rusb::Error>;
}
