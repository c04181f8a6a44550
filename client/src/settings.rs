use anyhow::{Context, Result};
use dfc_usb::device::OpenOptions;
use dfc_usb::{PID_DFU, PID_STREAMER, VID_CYPRESS};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

/// Device level defaults which rarely change between runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub vendor_id: u16,
    pub product_id: u16,
    pub dfu_vendor_id: u16,
    pub dfu_product_id: u16,
    pub open_retries: u32,
    pub open_retry_delay_ms: u64,
    pub control_timeout_ms: u64,
    pub bulk_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            vendor_id: VID_CYPRESS,
            product_id: PID_STREAMER,
            dfu_vendor_id: VID_CYPRESS,
            dfu_product_id: PID_DFU,
            open_retries: 10,
            open_retry_delay_ms: 100,
            control_timeout_ms: 5000,
            bulk_timeout_ms: 5000,
        }
    }
}

impl Settings {
    pub fn read(path: &Path) -> Result<Settings> {
        match File::open(path) {
            Ok(reader) => serde_json::from_reader(reader).context(format!(
                "Could not parse settings file at {}",
                path.to_string_lossy()
            )),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(Settings::default()),
            Err(error) => Err(error).context(format!(
                "Could not open settings file for reading at {}",
                path.to_string_lossy()
            )),
        }
    }

    pub fn open_options(&self) -> OpenOptions {
        OpenOptions {
            vendor_id: self.vendor_id,
            product_id: self.product_id,
            dfu_vendor_id: self.dfu_vendor_id,
            dfu_product_id: self.dfu_product_id,
            retries: self.open_retries,
            retry_delay: Duration::from_millis(self.open_retry_delay_ms),
            timeout: Duration::from_millis(self.control_timeout_ms),
        }
    }

    pub fn bulk_timeout(&self) -> Duration {
        Duration::from_millis(self.bulk_timeout_ms)
    }
}
