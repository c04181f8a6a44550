// Asynchronous bulk transfers through the libusb transfer API. rusb only
// wraps the synchronous calls, so this drives the raw bindings directly.
//
// Completions are sent from the libusb callback over a channel, and picked
// up by whoever is pumping events, so all slot bookkeeping happens outside
// the callback.
use crate::transfer::{
    BulkTransport, Completion, TransferBuffer, TransferError, TransferStatus,
};
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, warn};
use rusb::ffi::{self, constants::*};
use rusb::{DeviceHandle, UsbContext};
use std::os::raw::{c_int, c_uint, c_void};
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::time::Duration;

// Zero-copy buffers (libusb 1.0.21+). Not bound by libusb1-sys, the library
// itself is linked through it.
unsafe extern "system" {
    fn libusb_dev_mem_alloc(dev_handle: *mut ffi::libusb_device_handle, length: usize) -> *mut u8;
    fn libusb_dev_mem_free(
        dev_handle: *mut ffi::libusb_device_handle,
        buffer: *mut u8,
        length: usize,
    ) -> c_int;
}

pub struct LibusbTransport<T: UsbContext> {
    context: T,
    handle: Arc<DeviceHandle<T>>,
    endpoint: u8,
    timeout: Duration,
    sender: Sender<Completion>,
    receiver: Receiver<Completion>,
}

impl<T: UsbContext> LibusbTransport<T> {
    pub fn new(context: T, handle: Arc<DeviceHandle<T>>, endpoint: u8, timeout: Duration) -> Self {
        let (sender, receiver) = unbounded();
        Self {
            context,
            handle,
            endpoint,
            timeout,
            sender,
            receiver,
        }
    }

    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }
}

struct CallbackData {
    slot: usize,
    sender: Sender<Completion>,
}

enum Memory {
    // Allocated by the kernel and mapped for zero-copy DMA.
    Device,
    Heap,
}

/// One libusb transfer and its buffer. The pool guarantees it is never
/// dropped while submitted.
pub struct LibusbSlot<T: UsbContext> {
    transfer: NonNull<ffi::libusb_transfer>,
    buffer: NonNull<u8>,
    length: usize,
    memory: Memory,
    handle: Arc<DeviceHandle<T>>,
    // Referenced by the transfer's user_data, kept alive for as long as it is.
    _callback: Box<CallbackData>,
}

impl<T: UsbContext> TransferBuffer for LibusbSlot<T> {
    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.buffer.as_ptr(), self.length) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.buffer.as_ptr(), self.length) }
    }
}

impl<T: UsbContext> Drop for LibusbSlot<T> {
    fn drop(&mut self) {
        unsafe {
            ffi::libusb_free_transfer(self.transfer.as_ptr());
            match self.memory {
                Memory::Device => {
                    libusb_dev_mem_free(self.handle.as_raw(), self.buffer.as_ptr(), self.length);
                }
                Memory::Heap => {
                    drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                        self.buffer.as_ptr(),
                        self.length,
                    )));
                }
            }
        }
    }
}

extern "system" fn transfer_callback(transfer: *mut ffi::libusb_transfer) {
    let (data, status, actual_length) = unsafe {
        let transfer = &*transfer;
        (
            &*(transfer.user_data as *const CallbackData),
            transfer.status,
            transfer.actual_length,
        )
    };

    let completion = Completion {
        slot: data.slot,
        status: transfer_status(status),
        actual_length: actual_length.max(0) as usize,
    };

    // The receiver only goes away with the transport, after the pool drained.
    let _ = data.sender.send(completion);
}

impl<T: UsbContext> BulkTransport for LibusbTransport<T> {
    type Slot = LibusbSlot<T>;

    fn allocate(&mut self, index: usize, length: usize) -> Result<LibusbSlot<T>, rusb::Error> {
        let length_c = c_int::try_from(length).map_err(|_| rusb::Error::InvalidParam)?;
        let raw_handle = self.handle.as_raw();

        let transfer =
            NonNull::new(unsafe { ffi::libusb_alloc_transfer(0) }).ok_or(rusb::Error::NoMem)?;

        let (buffer, memory) =
            match NonNull::new(unsafe { libusb_dev_mem_alloc(raw_handle, length) }) {
                Some(buffer) => {
                    unsafe { ptr::write_bytes(buffer.as_ptr(), 0, length) };
                    (buffer, Memory::Device)
                }
                None => {
                    if index == 0 {
                        debug!("Zero-copy buffers unavailable, using heap memory");
                    }
                    let boxed = vec![0u8; length].into_boxed_slice();
                    let buffer = Box::into_raw(boxed) as *mut u8;
                    (NonNull::new(buffer).ok_or(rusb::Error::NoMem)?, Memory::Heap)
                }
            };

        let callback = Box::new(CallbackData {
            slot: index,
            sender: self.sender.clone(),
        });

        let timeout = self.timeout.as_millis().min(c_uint::MAX as u128) as c_uint;
        unsafe {
            let raw = &mut *transfer.as_ptr();
            raw.dev_handle = raw_handle;
            raw.endpoint = self.endpoint;
            raw.transfer_type = LIBUSB_TRANSFER_TYPE_BULK as u8;
            raw.timeout = timeout;
            raw.buffer = buffer.as_ptr();
            raw.length = length_c;
            raw.callback = transfer_callback;
            raw.user_data = &*callback as *const CallbackData as *mut c_void;
        }

        Ok(LibusbSlot {
            transfer,
            buffer,
            length,
            memory,
            handle: self.handle.clone(),
            _callback: callback,
        })
    }

    fn submit(&mut self, slot: &mut LibusbSlot<T>) -> Result<(), rusb::Error> {
        match unsafe { ffi::libusb_submit_transfer(slot.transfer.as_ptr()) } {
            0 => Ok(()),
            code => Err(from_libusb(code)),
        }
    }

    fn cancel(&mut self, slot: &mut LibusbSlot<T>) -> Result<(), rusb::Error> {
        match unsafe { ffi::libusb_cancel_transfer(slot.transfer.as_ptr()) } {
            0 => Ok(()),
            code => Err(from_libusb(code)),
        }
    }

    fn wait(
        &mut self,
        timeout: Duration,
        completions: &mut Vec<Completion>,
    ) -> Result<(), rusb::Error> {
        // Anything delivered during a previous call is returned first.
        if self.receiver.is_empty() {
            match self.context.handle_events(Some(timeout)) {
                Ok(()) | Err(rusb::Error::Interrupted) => {}
                Err(error) => {
                    warn!("Error handling USB events: {}", error);
                    return Err(error);
                }
            }
        }
        completions.extend(self.receiver.try_iter());
        Ok(())
    }
}

fn transfer_status(status: c_int) -> TransferStatus {
    match status {
        LIBUSB_TRANSFER_COMPLETED => TransferStatus::Completed,
        LIBUSB_TRANSFER_CANCELLED => TransferStatus::Cancelled,
        LIBUSB_TRANSFER_ERROR => TransferStatus::Failed(TransferError::Error),
        LIBUSB_TRANSFER_TIMED_OUT => TransferStatus::Failed(TransferError::TimedOut),
        LIBUSB_TRANSFER_STALL => TransferStatus::Failed(TransferError::Stall),
        LIBUSB_TRANSFER_NO_DEVICE => TransferStatus::Failed(TransferError::NoDevice),
        LIBUSB_TRANSFER_OVERFLOW => TransferStatus::Failed(TransferError::Overflow),
        other => TransferStatus::Failed(TransferError::Unknown(other)),
    }
}

fn from_libusb(code: c_int) -> rusb::Error {
    match code {
        LIBUSB_ERROR_IO => rusb::Error::Io,
        LIBUSB_ERROR_INVALID_PARAM => rusb::Error::InvalidParam,
        LIBUSB_ERROR_ACCESS => rusb::Error::Access,
        LIBUSB_ERROR_NO_DEVICE => rusb::Error::NoDevice,
        LIBUSB_ERROR_NOT_FOUND => rusb::Error::NotFound,
        LIBUSB_ERROR_BUSY => rusb::Error::Busy,
        LIBUSB_ERROR_TIMEOUT => rusb::Error::Timeout,
        LIBUSB_ERROR_OVERFLOW => rusb::Error::Overflow,
        LIBUSB_ERROR_PIPE => rusb::Error::Pipe,
        LIBUSB_ERROR_INTERRUPTED => rusb::Error::Interrupted,
        LIBUSB_ERROR_NO_MEM => rusb::Error::NoMem,
        LIBUSB_ERROR_NOT_SUPPORTED => rusb::Error::NotSupported,
        _ => rusb::Error::Other,
    }
}
