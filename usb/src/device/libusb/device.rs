use crate::commands::{Command, RW_INTERNAL};
use crate::device::base::{DfcCommands, ExecutableDfc};
use crate::device::descriptor::{ConfigurationSnapshot, EndpointInfo};
use crate::error::{CommandError, ConnectError};
use crate::firmware::{read_bootloader_version, upload, BootloaderRam, FirmwareImage};
use crate::transfer::libusb::LibusbTransport;
use crate::{PID_DFU, PID_STREAMER, VID_CYPRESS};
use log::{debug, error, info, warn};
use rusb::{DeviceHandle, Direction, Recipient, RequestType, UsbContext};
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub vendor_id: u16,
    pub product_id: u16,
    pub dfu_vendor_id: u16,
    pub dfu_product_id: u16,
    pub retries: u32,
    pub retry_delay: Duration,
    pub timeout: Duration,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            vendor_id: VID_CYPRESS,
            product_id: PID_STREAMER,
            dfu_vendor_id: VID_CYPRESS,
            dfu_product_id: PID_DFU,
            retries: 10,
            retry_delay: Duration::from_millis(100),
            timeout: Duration::from_millis(5000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbData {
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_version: (u8, u8, u8),
    pub device_manufacturer: String,
    pub product_name: String,
}

pub struct DfcUsb<T: UsbContext> {
    context: T,
    handle: Option<Arc<DeviceHandle<T>>>,
    claimed: Vec<u8>,
    timeout: Duration,
}

impl<T: UsbContext> DfcUsb<T> {
    /// Opens the streamer, booting it first when only the DFU bootloader is
    /// present and a firmware image was supplied.
    pub fn open(
        context: T,
        options: &OpenOptions,
        firmware: Option<&FirmwareImage>,
    ) -> Result<Self, ConnectError> {
        let handle = match context.open_device_with_vid_pid(options.vendor_id, options.product_id)
        {
            Some(handle) => handle,
            None => {
                let bootloader = context
                    .open_device_with_vid_pid(options.dfu_vendor_id, options.dfu_product_id)
                    .ok_or(ConnectError::DeviceNotFound)?;

                let Some(firmware) = firmware else {
                    error!("Device is in DFU mode, but no firmware image was provided");
                    return Err(ConnectError::DeviceNotFound);
                };

                info!("Found device in DFU mode, uploading firmware..");
                let mut ram = Bootloader {
                    handle: &bootloader,
                    timeout: options.timeout,
                };
                let version = read_bootloader_version(&mut ram)?;
                info!("Bootloader version: {:#010x}", version);
                upload(&mut ram, firmware)?;
                drop(bootloader);

                Self::wait_for_device(&context, options)?
            }
        };

        info!("Connected to DFC device at {:?}", handle.device());
        Ok(Self {
            context,
            handle: Some(Arc::new(handle)),
            claimed: vec![],
            timeout: options.timeout,
        })
    }

    fn wait_for_device(
        context: &T,
        options: &OpenOptions,
    ) -> Result<DeviceHandle<T>, ConnectError> {
        for attempt in 1..=options.retries {
            sleep(options.retry_delay);
            if let Some(handle) =
                context.open_device_with_vid_pid(options.vendor_id, options.product_id)
            {
                return Ok(handle);
            }
            debug!(
                "Device not yet available, sleeping and retrying (Attempt {} of {})",
                attempt, options.retries
            );
        }
        error!("Device did not appear after firmware upload");
        Err(ConnectError::DeviceNotFound)
    }

    fn handle(&self) -> Result<&Arc<DeviceHandle<T>>, CommandError> {
        self.handle.as_ref().ok_or(CommandError::SessionClosed)
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    pub fn context(&self) -> &T {
        &self.context
    }

    /// Claims the control and data interfaces, and resolves the bulk
    /// endpoint the stream will use.
    pub fn claim_interfaces(
        &mut self,
        control_interface: u8,
        data_interface: u8,
        alt_setting: u8,
        endpoint: u8,
    ) -> Result<EndpointInfo, ConnectError> {
        let handle = self
            .handle
            .clone()
            .ok_or(ConnectError::UsbError(rusb::Error::NoDevice))?;

        let config = handle.device().active_config_descriptor()?;
        let snapshot = ConfigurationSnapshot::from_config(&config);
        if control_interface as usize >= snapshot.interface_count() {
            return Err(ConnectError::InvalidDescriptor(format!(
                "Control interface {} not found, device has {} interface(s)",
                control_interface,
                snapshot.interface_count()
            )));
        }
        let info = snapshot.select(data_interface, alt_setting, endpoint)?;

        // Kernel drivers are not detached, if anything else holds the device we stop here.
        if handle.kernel_driver_active(control_interface).unwrap_or(false) {
            return Err(ConnectError::KernelDriverActive(control_interface));
        }

        handle.claim_interface(control_interface)?;
        self.claimed.push(control_interface);
        if data_interface != control_interface {
            handle.claim_interface(data_interface)?;
            self.claimed.push(data_interface);
        }
        if alt_setting != 0 {
            handle.set_alternate_setting(data_interface, alt_setting)?;
        }

        info!(
            "Endpoint {:#04x}: max packet size {}, max burst {}, packet size {}",
            info.address, info.max_packet_size, info.max_burst, info.packet_size
        );
        Ok(info)
    }

    pub fn bulk_transport(
        &self,
        endpoint: &EndpointInfo,
        timeout: Duration,
    ) -> Result<LibusbTransport<T>, CommandError> {
        let handle = self.handle()?.clone();
        Ok(LibusbTransport::new(
            self.context.clone(),
            handle,
            endpoint.address,
            timeout,
        ))
    }

    pub fn get_descriptor(&self) -> Result<UsbData, CommandError> {
        let handle = self.handle()?;
        let descriptor = handle.device().device_descriptor()?;
        let version = descriptor.usb_version();

        let device_manufacturer = handle
            .read_manufacturer_string_ascii(&descriptor)
            .unwrap_or_default();
        let product_name = handle
            .read_product_string_ascii(&descriptor)
            .unwrap_or_default();

        Ok(UsbData {
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            device_version: (version.major(), version.minor(), version.sub_minor()),
            device_manufacturer,
            product_name,
        })
    }

    /// Releases any claimed interfaces and the device handle. Calling this
    /// again does nothing.
    pub fn close(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        for interface in self.claimed.drain(..).rev() {
            if let Err(error) = handle.release_interface(interface) {
                warn!("Unable to release interface {}: {}", interface, error);
            }
        }
        if Arc::strong_count(&handle) > 1 {
            warn!("Closing device while transfers still hold the handle");
        }
        debug!("Device closed");
    }
}

impl<T: UsbContext> Drop for DfcUsb<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T: UsbContext> ExecutableDfc for DfcUsb<T> {
    fn read_control(&mut self, command: Command, length: usize) -> Result<Vec<u8>, CommandError> {
        let mut buf = vec![0; length];
        let response_length = self.handle()?.read_control(
            rusb::request_type(command.direction(), RequestType::Vendor, Recipient::Device),
            command.request(),
            0,
            0,
            &mut buf,
            self.timeout,
        )?;
        buf.truncate(response_length);
        Ok(buf)
    }

    fn write_control(&mut self, command: Command, payload: &[u8]) -> Result<(), CommandError> {
        self.handle()?.write_control(
            rusb::request_type(command.direction(), RequestType::Vendor, Recipient::Device),
            command.request(),
            0,
            0,
            payload,
            self.timeout,
        )?;
        Ok(())
    }
}

impl<T: UsbContext> DfcCommands for DfcUsb<T> {}

struct Bootloader<'a, T: UsbContext> {
    handle: &'a DeviceHandle<T>,
    timeout: Duration,
}

impl<T: UsbContext> BootloaderRam for Bootloader<'_, T> {
    fn write_ram(&mut self, address: u32, data: &[u8]) -> Result<usize, rusb::Error> {
        let result = self.handle.write_control(
            rusb::request_type(Direction::Out, RequestType::Vendor, Recipient::Device),
            RW_INTERNAL,
            (address & 0xffff) as u16,
            (address >> 16) as u16,
            data,
            self.timeout,
        );

        // The jump to the entry point may reset the device before it acks.
        match result {
            Err(rusb::Error::NoDevice | rusb::Error::Pipe | rusb::Error::Io) if data.is_empty() => {
                Ok(0)
            }
            other => other,
        }
    }

    fn read_ram(&mut self, address: u32, buffer: &mut [u8]) -> Result<usize, rusb::Error> {
        self.handle.read_control(
            rusb::request_type(Direction::In, RequestType::Vendor, Recipient::Device),
            RW_INTERNAL,
            (address & 0xffff) as u16,
            (address >> 16) as u16,
            buffer,
            self.timeout,
        )
    }
}

