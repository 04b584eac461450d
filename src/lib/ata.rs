use log::{debug, trace};
use std::fmt::{self, Display, Formatter};

use crate::ports::PortIo;

// Task-file register offsets from the channel base.
pub const REG_DATA: u16 = 0;
pub const REG_FEATURES: u16 = 1;
pub const REG_SECTOR_COUNT: u16 = 2;
pub const REG_LBA_LOW: u16 = 3;
pub const REG_LBA_MID: u16 = 4;
pub const REG_LBA_HIGH: u16 = 5;
pub const REG_DEVICE: u16 = 6;
pub const REG_STATUS: u16 = 7; // Read.
pub const REG_COMMAND: u16 = 7; // Write.

// Bit flags for the status register.
pub const FLAG_ERROR: u8 = 0x01;
pub const FLAG_DATA_REQUEST: u8 = 0x08;
pub const FLAG_READY: u8 = 0x40;
pub const FLAG_BUSY: u8 = 0x80;

// Allowed commands.
pub const COMMAND_READ: u8 = 0x20;
pub const COMMAND_WRITE: u8 = 0x30;

// Device-select high nibble: master device, LBA addressing.
pub const SELECT_MASTER_LBA: u8 = 0xE0;

/// Status byte of a floating bus with nothing driving its lines. A
/// conventional sign of an absent device, not a guarantee.
pub const DEVICE_ABSENT: u8 = 0xFF;

/// Logical block addresses are 28 bits wide; higher bits are discarded.
pub const LBA_MASK: u32 = 0x0FFF_FFFF;

/// Bytes per sector. Transfers always move exactly one sector.
pub const SECTOR_SIZE: usize = 512;

/// A sector-sized transfer buffer.
pub type Sector = [u8; SECTOR_SIZE];

// The poll loop is bounded by iteration count rather than wall-clock time,
// so transfers stay deterministic under simulation.
pub const POLL_BUDGET: usize = 100_000;

/// One of the two legacy IDE channels, identified by its base I/O port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Primary,
    Secondary,
}

impl Channel {
    /// The channel's base port; the task-file registers sit at fixed
    /// offsets from here.
    pub fn base(self) -> u16 {
        match self {
            Channel::Primary => 0x1F0,
            Channel::Secondary => 0x170,
        }
    }
}

/// Possible failures of a single sector transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferError {
    /// The device raised its error flag before signalling data readiness.
    DeviceError,
    /// The polling budget ran out without the device becoming ready.
    Timeout,
}

pub type TransferResult = Result<(), TransferError>;

impl TransferError {
    /// The signed status code for this failure; success is 0.
    pub fn code(self) -> i32 {
        match self {
            TransferError::DeviceError => -1,
            TransferError::Timeout => -2,
        }
    }
}

impl Display for TransferError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::DeviceError => write!(f, "device error"),
            TransferError::Timeout => write!(f, "timed out waiting for device"),
        }
    }
}

/// Read the channel's raw status byte without issuing a command. Used as a
/// presence probe: a floating bus reads back as `DEVICE_ABSENT`.
pub fn probe<P: PortIo + ?Sized>(ports: &mut P, channel: Channel) -> u8 {
    ports.read8(channel.base() + REG_STATUS)
}

/// Read one sector at the given LBA into `buffer`.
///
/// On failure the buffer is untouched; the caller must check the result
/// before trusting its contents. The driver never retries.
pub fn read_sector<P: PortIo + ?Sized>(
    ports: &mut P,
    channel: Channel,
    lba: u32,
    buffer: &mut Sector,
) -> TransferResult {
    trace!("Reading LBA {:#09X} on the {:?} channel.", lba & LBA_MASK, channel);
    issue_command(ports, channel, lba, COMMAND_READ);

    let base = channel.base();
    for _ in 0..POLL_BUDGET {
        let status = ports.read8(base + REG_STATUS);
        if status & FLAG_BUSY == 0 && status & FLAG_DATA_REQUEST != 0 {
            // One contiguous burst of 256 words, low byte first. The
            // protocol does not allow re-polling mid-transfer.
            for i in 0..SECTOR_SIZE / 2 {
                let word = ports.read16(base + REG_DATA);
                buffer[i * 2] = word as u8;
                buffer[i * 2 + 1] = (word >> 8) as u8;
            }
            return Ok(());
        }
        if status & FLAG_ERROR != 0 {
            debug!("Device error reading LBA {:#09X} on the {:?} channel.",
                   lba & LBA_MASK, channel);
            return Err(TransferError::DeviceError);
        }
    }
    debug!("Timed out reading LBA {:#09X} on the {:?} channel.",
           lba & LBA_MASK, channel);
    Err(TransferError::Timeout)
}

/// Write one sector from `buffer` to the given LBA.
///
/// Mirror image of `read_sector`: same command block, same poll loop, with
/// the data words assembled from buffer byte pairs, low byte first.
pub fn write_sector<P: PortIo + ?Sized>(
    ports: &mut P,
    channel: Channel,
    lba: u32,
    buffer: &Sector,
) -> TransferResult {
    trace!("Writing LBA {:#09X} on the {:?} channel.", lba & LBA_MASK, channel);
    issue_command(ports, channel, lba, COMMAND_WRITE);

    let base = channel.base();
    for _ in 0..POLL_BUDGET {
        let status = ports.read8(base + REG_STATUS);
        if status & FLAG_BUSY == 0 && status & FLAG_DATA_REQUEST != 0 {
            for i in 0..SECTOR_SIZE / 2 {
                let word = u16::from_le_bytes([buffer[i * 2], buffer[i * 2 + 1]]);
                ports.write16(base + REG_DATA, word);
            }
            return Ok(());
        }
        if status & FLAG_ERROR != 0 {
            debug!("Device error writing LBA {:#09X} on the {:?} channel.",
                   lba & LBA_MASK, channel);
            return Err(TransferError::DeviceError);
        }
    }
    debug!("Timed out writing LBA {:#09X} on the {:?} channel.",
           lba & LBA_MASK, channel);
    Err(TransferError::Timeout)
}

/// Write the command block to the channel's task-file registers: feature
/// cleared, sector count fixed at one, the LBA split across three byte
/// registers with bits 24-27 packed into the device-select byte.
fn issue_command<P: PortIo + ?Sized>(ports: &mut P, channel: Channel, lba: u32, command: u8) {
    let base = channel.base();
    ports.write8(base + REG_FEATURES, 0);
    ports.write8(base + REG_SECTOR_COUNT, 1);
    ports.write8(base + REG_LBA_LOW, lba as u8);
    ports.write8(base + REG_LBA_MID, (lba >> 8) as u8);
    ports.write8(base + REG_LBA_HIGH, (lba >> 16) as u8);
    ports.write8(base + REG_DEVICE, SELECT_MASTER_LBA | ((lba >> 24) & 0x0F) as u8);
    ports.write8(base + REG_COMMAND, command);
}
