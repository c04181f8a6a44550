// A plain snapshot of the active configuration, so endpoint selection can be
// checked without holding libusb descriptor objects.
use crate::error::ConnectError;
use rusb::ConfigDescriptor;

const DESCRIPTOR_SS_ENDPOINT_COMPANION: u8 = 0x30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSummary {
    pub address: u8,
    pub max_packet_size: u16,
    /// bMaxBurst from the SuperSpeed companion descriptor, if one was present.
    pub max_burst: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    pub address: u8,
    pub max_packet_size: u16,
    pub max_burst: u8,
    /// Bytes per burst, the unit transfers are sized in.
    pub packet_size: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigurationSnapshot {
    // interface -> alternate setting -> endpoints
    interfaces: Vec<Vec<Vec<EndpointSummary>>>,
}

impl ConfigurationSnapshot {
    pub fn new(interfaces: Vec<Vec<Vec<EndpointSummary>>>) -> Self {
        Self { interfaces }
    }

    pub fn from_config(config: &ConfigDescriptor) -> Self {
        let interfaces = config
            .interfaces()
            .map(|interface| {
                interface
                    .descriptors()
                    .map(|setting| {
                        setting
                            .endpoint_descriptors()
                            .map(|endpoint| EndpointSummary {
                                address: endpoint.address(),
                                max_packet_size: endpoint.max_packet_size(),
                                max_burst: endpoint.extra().and_then(parse_max_burst),
                            })
                            .collect()
                    })
                    .collect()
            })
            .collect();
        Self { interfaces }
    }

    pub fn interface_count(&self) -> usize {
        self.interfaces.len()
    }

    pub fn select(
        &self,
        interface: u8,
        alt_setting: u8,
        endpoint: u8,
    ) -> Result<EndpointInfo, ConnectError> {
        let settings = self.interfaces.get(interface as usize).ok_or_else(|| {
            ConnectError::InvalidDescriptor(format!(
                "Interface {} not found, device has {} interface(s)",
                interface,
                self.interfaces.len()
            ))
        })?;
        let endpoints = settings.get(alt_setting as usize).ok_or_else(|| {
            ConnectError::InvalidDescriptor(format!(
                "Alternate setting {} not found on interface {}, it has {}",
                alt_setting,
                interface,
                settings.len()
            ))
        })?;
        let summary = endpoints.get(endpoint as usize).ok_or_else(|| {
            ConnectError::InvalidDescriptor(format!(
                "Endpoint {} not found on interface {} setting {}, it has {}",
                endpoint,
                interface,
                alt_setting,
                endpoints.len()
            ))
        })?;

        let max_burst = summary.max_burst.ok_or_else(|| {
            ConnectError::InvalidDescriptor(format!(
                "Endpoint {:#04x} has no SuperSpeed companion descriptor",
                summary.address
            ))
        })?;

        Ok(EndpointInfo {
            address: summary.address,
            max_packet_size: summary.max_packet_size,
            max_burst,
            packet_size: summary.max_packet_size as usize * (max_burst as usize + 1),
        })
    }
}

/// Walks the extra descriptor bytes following an endpoint descriptor and
/// returns bMaxBurst from the first SuperSpeed companion found.
pub fn parse_max_burst(extra: &[u8]) -> Option<u8> {
    let mut offset = 0;
    while offset + 2 <= extra.len() {
        let length = extra[offset] as usize;
        if length < 2 {
            return None;
        }
        if extra[offset + 1] == DESCRIPTOR_SS_ENDPOINT_COMPANION && length >= 3 {
            return extra.get(offset + 2).copied();
        }
        offset += length;
    }
    None
}
