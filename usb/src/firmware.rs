// Loader for Cypress FX3 boot images, uploaded to RAM through the DFU mode
// bootloader.
//
// Layout: "CY", bImageCTL, bImageType (0xb0), then records of
// (u32 word count, u32 address, words...) ending with a zero word count
// record whose address is the entry point, followed by the checksum word.
use crate::commands::BOOTLOADER_VERSION_ADDRESS;
use crate::error::FirmwareError;
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use log::{debug, info};
use std::io::Cursor;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

const IMAGE_TYPE_CHECKSUMMED: u8 = 0xb0;
const MAX_WRITE_SIZE: usize = 4 * 1024;
const ENTRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareBlock {
    pub address: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    blocks: Vec<FirmwareBlock>,
    entry_point: u32,
    checksum: u32,
}

impl FirmwareImage {
    pub fn load(path: &Path) -> Result<FirmwareImage, FirmwareError> {
        let image = std::fs::read(path)?;
        FirmwareImage::parse(&image)
    }

    pub fn parse(image: &[u8]) -> Result<FirmwareImage, FirmwareError> {
        if image.len() < 2 || &image[0..2] != b"CY" {
            return Err(FirmwareError::BadMagic);
        }
        if image.len() < 3 || image[2] & 0x01 != 0 {
            return Err(FirmwareError::NotExecutable);
        }
        if image.len() < 4 {
            return Err(FirmwareError::Truncated(image.len()));
        }
        if image[3] != IMAGE_TYPE_CHECKSUMMED {
            return Err(FirmwareError::BadImageType(image[3]));
        }

        let mut cursor = Cursor::new(image);
        cursor.set_position(4);

        let truncated = |cursor: &Cursor<&[u8]>| FirmwareError::Truncated(cursor.position() as usize);

        let mut blocks = Vec::new();
        let mut checksum: u32 = 0;
        loop {
            let length = cursor
                .read_u32::<LittleEndian>()
                .map_err(|_| truncated(&cursor))?;
            let address = cursor
                .read_u32::<LittleEndian>()
                .map_err(|_| truncated(&cursor))?;

            if length == 0 {
                let expected = cursor
                    .read_u32::<LittleEndian>()
                    .map_err(|_| truncated(&cursor))?;
                if checksum != expected {
                    return Err(FirmwareError::ChecksumMismatch {
                        actual: checksum,
                        expected,
                    });
                }
                return Ok(FirmwareImage {
                    blocks,
                    entry_point: address,
                    checksum,
                });
            }

            let start = cursor.position() as usize;
            let end = start + length as usize * 4;
            if end > image.len() {
                return Err(FirmwareError::Truncated(image.len()));
            }

            let data = &image[start..end];
            for word in data.chunks_exact(4) {
                checksum = checksum.wrapping_add(LittleEndian::read_u32(word));
            }
            blocks.push(FirmwareBlock {
                address,
                data: data.to_vec(),
            });
            cursor.set_position(end as u64);
        }
    }

    pub fn blocks(&self) -> &[FirmwareBlock] {
        &self.blocks
    }

    pub fn entry_point(&self) -> u32 {
        self.entry_point
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }
}

/// Access to the bootloader's internal RAM.
pub trait BootloaderRam {
    /// Writes at `address`, returning how many bytes the device accepted. A
    /// zero length write transfers execution to `address`.
    fn write_ram(&mut self, address: u32, data: &[u8]) -> Result<usize, rusb::Error>;
    fn read_ram(&mut self, address: u32, buffer: &mut [u8]) -> Result<usize, rusb::Error>;
}

pub fn read_bootloader_version<R: BootloaderRam>(ram: &mut R) -> Result<u32, FirmwareError> {
    let mut version = [0; 4];
    ram.read_ram(BOOTLOADER_VERSION_ADDRESS, &mut version)?;
    Ok(LittleEndian::read_u32(&version))
}

pub fn upload<R: BootloaderRam>(ram: &mut R, image: &FirmwareImage) -> Result<(), FirmwareError> {
    for block in image.blocks() {
        debug!(
            "Writing {} bytes at {:#010x}",
            block.data.len(),
            block.address
        );

        let mut address = block.address;
        let mut remaining = &block.data[..];
        while !remaining.is_empty() {
            let chunk = remaining.len().min(MAX_WRITE_SIZE);
            let written = ram.write_ram(address, &remaining[..chunk])?;
            if written == 0 {
                return Err(FirmwareError::ShortWrite(address));
            }

            // The device may accept less than offered, continue from there.
            let written = written.min(chunk);
            address = address.wrapping_add(written as u32);
            remaining = &remaining[written..];
        }
    }

    sleep(ENTRY_DELAY);
    info!(
        "Transferring execution to Program Entry at {:#010x}",
        image.entry_point()
    );
    ram.write_ram(image.entry_point(), &[])?;
    Ok(())
}
