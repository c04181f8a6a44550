use rusb::Direction;

/// The vendor request set understood by the streamer firmware. All of them
/// are device-directed with `wValue = wIndex = 0`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    GetFirmwareVersion,
    GetMode,
    SetMode,
    Start,
    Stop,
    StartClock,
    ShutdownAdc,
    WakeupAdc,
    ShutdownDac,
    WakeupDac,
}

impl Command {
    pub fn request(&self) -> u8 {
        match self {
            Command::GetFirmwareVersion => 0x01,
            Command::GetMode => 0x10,
            Command::SetMode => 0x90,
            Command::Start => 0xaa,
            Command::Stop => 0xab,
            Command::StartClock => 0xb2,
            Command::ShutdownAdc => 0xc1,
            Command::WakeupAdc => 0xc2,
            Command::ShutdownDac => 0xc3,
            Command::WakeupDac => 0xc4,
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            Command::GetFirmwareVersion | Command::GetMode => Direction::In,
            _ => Direction::Out,
        }
    }
}

/// Bootloader request used to read and write internal RAM, and to jump to
/// an entry point (zero length write).
pub const RW_INTERNAL: u8 = 0xa0;

pub const BOOTLOADER_VERSION_ADDRESS: u32 = 0xffff0020;
