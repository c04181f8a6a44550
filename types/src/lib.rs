#[cfg(feature = "clap")]
use clap::ValueEnum;

use enum_map::Enum;
use strum::{Display, EnumCount, EnumIter};

/// Firmware operating modes, numbered as the device reports them.
#[derive(Copy, Clone, Debug, Display, EnumIter, EnumCount, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(ValueEnum))]
pub enum DfcMode {
    #[strum(to_string = "UART-ONLY")]
    UartOnly = 0,
    #[strum(to_string = "SINGLE-ADC")]
    SingleAdc = 1,
    #[strum(to_string = "DUAL-ADC")]
    DualAdc = 2,
    #[strum(to_string = "DAC")]
    Dac = 3,
    #[strum(to_string = "SINGLE-ADC-FX3-CLOCK")]
    SingleAdcFx3Clock = 4,
    #[strum(to_string = "DAC-FX3-CLOCK")]
    DacFx3Clock = 5,
}

impl DfcMode {
    pub fn id(&self) -> u8 {
        *self as u8
    }

    pub fn from_id(id: u8) -> Option<DfcMode> {
        match id {
            0 => Some(DfcMode::UartOnly),
            1 => Some(DfcMode::SingleAdc),
            2 => Some(DfcMode::DualAdc),
            3 => Some(DfcMode::Dac),
            4 => Some(DfcMode::SingleAdcFx3Clock),
            5 => Some(DfcMode::DacFx3Clock),
            _ => None,
        }
    }

    /// The mode used when none was requested for a given direction.
    pub fn default_for(direction: StreamDirection) -> DfcMode {
        match direction {
            StreamDirection::Capture => DfcMode::SingleAdc,
            StreamDirection::Playback => DfcMode::Dac,
        }
    }

    pub fn supports(&self, direction: StreamDirection) -> bool {
        match direction {
            StreamDirection::Capture => matches!(
                self,
                DfcMode::SingleAdc | DfcMode::DualAdc | DfcMode::SingleAdcFx3Clock
            ),
            StreamDirection::Playback => matches!(self, DfcMode::Dac | DfcMode::DacFx3Clock),
        }
    }

    /// In these modes the device generates the sample clock itself, so the
    /// external synthesizer is left alone.
    pub fn uses_internal_clock(&self) -> bool {
        matches!(self, DfcMode::SingleAdcFx3Clock | DfcMode::DacFx3Clock)
    }
}

#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
pub enum StreamDirection {
    /// Device to host.
    Capture,
    /// Host to device.
    Playback,
}

/// Logical channels of the interleaved 16-bit sample stream.
#[derive(Copy, Clone, Debug, Display, Enum, EnumIter, PartialEq, Eq)]
pub enum Channel {
    Even,
    Odd,
}

impl Channel {
    pub fn for_sample_index(index: usize) -> Channel {
        if index % 2 == 0 {
            Channel::Even
        } else {
            Channel::Odd
        }
    }
}
