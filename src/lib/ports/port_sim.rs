use log::{debug, info, trace};
use std::convert::TryFrom;
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::mem;
use std::path::Path;

use super::port_interface::PortIo;
use crate::ata::{
    Channel, Sector, COMMAND_READ, COMMAND_WRITE, DEVICE_ABSENT, FLAG_BUSY, FLAG_DATA_REQUEST,
    FLAG_ERROR, FLAG_READY, REG_COMMAND, REG_DATA, REG_DEVICE, REG_FEATURES, REG_LBA_HIGH,
    REG_LBA_LOW, REG_LBA_MID, REG_SECTOR_COUNT, REG_STATUS, SECTOR_SIZE, SELECT_MASTER_LBA,
};
use crate::machine::{KBD_CONTROLLER_PORT, KBD_RESET_COMMAND};

const WORDS_PER_SECTOR: usize = SECTOR_SIZE / 2;

// Error register value reported after a rejected command.
const ERROR_ABORTED: u8 = 0x04;

/// Fault modes for exercising the driver's failure paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Behave normally.
    None,
    /// Answer every command with the error flag.
    CommandError,
    /// Stay busy forever and never signal data readiness.
    NeverReady,
}

/// In-flight PIO transfer state.
enum Transfer {
    Idle,
    Reading { buffer: Sector, word: usize },
    Writing { buffer: Sector, word: usize, lba: u32 },
}

/// A simulated IDE disk, backed by an image file on the host filesystem.
///
/// Emulates the task-file protocol: writes latch the command-block
/// registers, a command loads or drains a one-sector word FIFO through the
/// data port, and the status register reports readiness and errors.
pub struct SimDisk {
    file: fs::File,
    sectors: u32,
    sector_count: u8,
    lba_low: u8,
    lba_mid: u8,
    lba_high: u8,
    device: u8,
    error: bool,
    transfer: Transfer,
    fault: Fault,
}

impl SimDisk {
    /// Open a disk image. The image must be a regular file whose size is a
    /// positive multiple of the sector size.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let metadata = fs::metadata(path)?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "disk image is not a regular file",
            ));
        }
        let bytes = metadata.len();
        if bytes == 0 || bytes % SECTOR_SIZE as u64 != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "disk image size is not a positive multiple of the sector size",
            ));
        }
        let sectors = u32::try_from(bytes / SECTOR_SIZE as u64)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "disk image too large"))?;
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        info!("Opened disk image '{}' with {} sectors.", path.display(), sectors);
        Ok(SimDisk {
            file,
            sectors,
            sector_count: 0,
            lba_low: 0,
            lba_mid: 0,
            lba_high: 0,
            device: 0,
            error: false,
            transfer: Transfer::Idle,
            fault: Fault::None,
        })
    }

    /// Select a fault mode for subsequent commands.
    pub fn set_fault(&mut self, fault: Fault) {
        self.fault = fault;
    }

    /// Number of sectors in the backing image.
    pub fn sectors(&self) -> u32 {
        self.sectors
    }

    fn lba(&self) -> u32 {
        u32::from(self.lba_low)
            | u32::from(self.lba_mid) << 8
            | u32::from(self.lba_high) << 16
            | u32::from(self.device & 0x0F) << 24
    }

    fn status(&self) -> u8 {
        if self.fault == Fault::NeverReady {
            return FLAG_BUSY;
        }
        let mut status = FLAG_READY;
        if !matches!(self.transfer, Transfer::Idle) {
            status |= FLAG_DATA_REQUEST;
        }
        if self.error {
            status |= FLAG_ERROR;
        }
        status
    }

    fn handle_command(&mut self, command: u8) {
        // A new command clears the previous error state.
        self.error = false;
        self.transfer = Transfer::Idle;
        if self.fault == Fault::CommandError {
            self.error = true;
            return;
        }

        // Only single-sector master-device LBA transfers are understood.
        let lba = self.lba();
        let well_formed = self.sector_count == 1
            && self.device & 0xF0 == SELECT_MASTER_LBA
            && lba < self.sectors;
        match command {
            COMMAND_READ if well_formed => {
                let mut buffer = [0; SECTOR_SIZE];
                match self.load(lba, &mut buffer) {
                    Ok(()) => self.transfer = Transfer::Reading { buffer, word: 0 },
                    Err(e) => {
                        debug!("IO error reading disk image: {}.", e);
                        self.error = true;
                    }
                }
            }
            COMMAND_WRITE if well_formed => {
                self.transfer = Transfer::Writing {
                    buffer: [0; SECTOR_SIZE],
                    word: 0,
                    lba,
                };
            }
            _ => {
                debug!("Rejected command {:#04X} (LBA {:#09X}, count {}).",
                       command, lba, self.sector_count);
                self.error = true;
            }
        }
    }

    fn load(&mut self, lba: u32, buffer: &mut Sector) -> io::Result<()> {
        self.file
            .seek(SeekFrom::Start(u64::from(lba) * SECTOR_SIZE as u64))?;
        self.file.read_exact(buffer)
    }

    fn commit(&mut self, lba: u32, buffer: &Sector) -> io::Result<()> {
        self.file
            .seek(SeekFrom::Start(u64::from(lba) * SECTOR_SIZE as u64))?;
        self.file.write_all(buffer)
    }

    fn read_register(&mut self, offset: u16) -> u8 {
        match offset {
            REG_STATUS => self.status(),
            REG_FEATURES => {
                // Reads at this offset return the error register.
                if self.error {
                    ERROR_ABORTED
                } else {
                    0
                }
            }
            REG_SECTOR_COUNT => self.sector_count,
            REG_LBA_LOW => self.lba_low,
            REG_LBA_MID => self.lba_mid,
            REG_LBA_HIGH => self.lba_high,
            REG_DEVICE => self.device,
            _ => 0,
        }
    }

    fn write_register(&mut self, offset: u16, value: u8) {
        match offset {
            // The feature register is accepted but has no effect on the
            // commands this device understands.
            REG_FEATURES => {}
            REG_SECTOR_COUNT => self.sector_count = value,
            REG_LBA_LOW => self.lba_low = value,
            REG_LBA_MID => self.lba_mid = value,
            REG_LBA_HIGH => self.lba_high = value,
            REG_DEVICE => self.device = value,
            REG_COMMAND => self.handle_command(value),
            _ => trace!("Write of {:#04X} to register offset {} ignored.", value, offset),
        }
    }

    fn read_data_word(&mut self) -> u16 {
        let (value, finished) = match &mut self.transfer {
            Transfer::Reading { buffer, word } => {
                let i = *word * 2;
                let value = u16::from_le_bytes([buffer[i], buffer[i + 1]]);
                *word += 1;
                (value, *word == WORDS_PER_SECTOR)
            }
            _ => return 0,
        };
        if finished {
            self.transfer = Transfer::Idle;
        }
        value
    }

    fn write_data_word(&mut self, value: u16) {
        let finished = match &mut self.transfer {
            Transfer::Writing { buffer, word, .. } => {
                let i = *word * 2;
                let [low, high] = value.to_le_bytes();
                buffer[i] = low;
                buffer[i + 1] = high;
                *word += 1;
                *word == WORDS_PER_SECTOR
            }
            _ => return,
        };
        if finished {
            if let Transfer::Writing { buffer, lba, .. } =
                mem::replace(&mut self.transfer, Transfer::Idle)
            {
                if let Err(e) = self.commit(lba, &buffer) {
                    debug!("IO error writing disk image: {}.", e);
                    self.error = true;
                }
            }
        }
    }
}

/// A simulated I/O port bus: one optional disk per IDE channel plus the
/// keyboard-controller reset line. Unmapped ports float high, so an empty
/// channel probes as `DEVICE_ABSENT`.
pub struct SimBus {
    primary: Option<SimDisk>,
    secondary: Option<SimDisk>,
    reset_requested: bool,
}

impl SimBus {
    pub fn new() -> Self {
        SimBus {
            primary: None,
            secondary: None,
            reset_requested: false,
        }
    }

    /// Attach a disk to the given channel, replacing any previous one.
    pub fn attach(&mut self, channel: Channel, disk: SimDisk) {
        info!("Attached {}-sector disk to the {:?} channel.", disk.sectors(), channel);
        match channel {
            Channel::Primary => self.primary = Some(disk),
            Channel::Secondary => self.secondary = Some(disk),
        }
    }

    /// Mutable access to the disk on the given channel, if any.
    pub fn disk(&mut self, channel: Channel) -> Option<&mut SimDisk> {
        match channel {
            Channel::Primary => self.primary.as_mut(),
            Channel::Secondary => self.secondary.as_mut(),
        }
    }

    /// Whether a keyboard-controller reset has been requested.
    pub fn reset_requested(&self) -> bool {
        self.reset_requested
    }

    fn route(&mut self, port: u16) -> Option<(&mut SimDisk, u16)> {
        for channel in [Channel::Primary, Channel::Secondary] {
            let base = channel.base();
            if (base..base + 8).contains(&port) {
                return self.disk(channel).map(|disk| (disk, port - base));
            }
        }
        None
    }
}

impl Default for SimBus {
    fn default() -> Self {
        SimBus::new()
    }
}

impl PortIo for SimBus {
    fn read8(&mut self, port: u16) -> u8 {
        match self.route(port) {
            Some((disk, offset)) => disk.read_register(offset),
            None => {
                trace!("Read from unmapped port {:#06X} floats high.", port);
                DEVICE_ABSENT
            }
        }
    }

    fn write8(&mut self, port: u16, value: u8) {
        if port == KBD_CONTROLLER_PORT {
            if value == KBD_RESET_COMMAND {
                info!("Keyboard-controller reset requested.");
                self.reset_requested = true;
            }
            return;
        }
        match self.route(port) {
            Some((disk, offset)) => disk.write_register(offset, value),
            None => trace!("Write of {:#04X} to unmapped port {:#06X} ignored.", value, port),
        }
    }

    fn read16(&mut self, port: u16) -> u16 {
        match self.route(port) {
            Some((disk, REG_DATA)) => disk.read_data_word(),
            _ => 0xFFFF,
        }
    }

    fn write16(&mut self, port: u16, value: u16) {
        if let Some((disk, REG_DATA)) = self.route(port) {
            disk.write_data_word(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ntest::timeout;
    use std::path::PathBuf;

    use crate::ata::{self, TransferError};
    use crate::init_test_logging;

    /// A test fixture with a bus whose secondary channel carries a disk
    /// backed by a fresh temp image.
    struct SimBusFixture {
        bus: SimBus,
        image_path: PathBuf,
        _temp_dir: tempfile::TempDir,
    }

    impl SimBusFixture {
        fn new(sectors: u32) -> io::Result<Self> {
            init_test_logging();

            let temp_dir = tempfile::tempdir()?;
            let image_path = temp_dir.path().join("disk.img");
            let file = fs::File::create(&image_path)?;
            file.set_len(u64::from(sectors) * SECTOR_SIZE as u64)?;
            drop(file);

            let mut bus = SimBus::new();
            bus.attach(Channel::Secondary, SimDisk::open(&image_path)?);
            Ok(SimBusFixture {
                bus,
                image_path,
                _temp_dir: temp_dir,
            })
        }
    }

    /// Generate a sector of random bytes.
    fn random_sector() -> Sector {
        let mut sector = [0; SECTOR_SIZE];
        for byte in sector.iter_mut() {
            *byte = rand::random();
        }
        sector
    }

    #[test]
    fn test_round_trip() {
        let mut fixture = SimBusFixture::new(8).unwrap();

        // A fresh image reads back as zeroes.
        let mut original = [0xAA; SECTOR_SIZE];
        ata::read_sector(&mut fixture.bus, Channel::Secondary, 3, &mut original).unwrap();
        assert!(original.iter().all(|&b| b == 0));

        // Write random data, then read-write-read must reproduce it.
        let data = random_sector();
        ata::write_sector(&mut fixture.bus, Channel::Secondary, 3, &data).unwrap();
        let mut readback = [0; SECTOR_SIZE];
        ata::read_sector(&mut fixture.bus, Channel::Secondary, 3, &mut readback).unwrap();
        assert_eq!(readback, data);

        ata::write_sector(&mut fixture.bus, Channel::Secondary, 3, &readback).unwrap();
        let mut again = [0; SECTOR_SIZE];
        ata::read_sector(&mut fixture.bus, Channel::Secondary, 3, &mut again).unwrap();
        assert_eq!(again, data);

        // Neighbouring sectors stay untouched.
        let mut neighbour = [0xAA; SECTOR_SIZE];
        ata::read_sector(&mut fixture.bus, Channel::Secondary, 2, &mut neighbour).unwrap();
        assert!(neighbour.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_writes_reach_backing_file() {
        let mut fixture = SimBusFixture::new(4).unwrap();

        let data = random_sector();
        ata::write_sector(&mut fixture.bus, Channel::Secondary, 1, &data).unwrap();

        let image = fs::read(&fixture.image_path).unwrap();
        assert_eq!(&image[SECTOR_SIZE..2 * SECTOR_SIZE], &data[..]);
    }

    #[test]
    fn test_empty_channel_floats_high() {
        let mut fixture = SimBusFixture::new(1).unwrap();

        assert_eq!(ata::probe(&mut fixture.bus, Channel::Primary), DEVICE_ABSENT);
        assert_ne!(ata::probe(&mut fixture.bus, Channel::Secondary), DEVICE_ABSENT);

        // A transfer on the empty channel fails rather than hanging: the
        // floating status byte has the error flag set.
        let mut buffer = [0; SECTOR_SIZE];
        assert_eq!(
            ata::read_sector(&mut fixture.bus, Channel::Primary, 0, &mut buffer),
            Err(TransferError::DeviceError)
        );
    }

    #[test]
    fn test_out_of_range_lba_rejected() {
        let mut fixture = SimBusFixture::new(4).unwrap();

        let buffer = [0; SECTOR_SIZE];
        assert_eq!(
            ata::write_sector(&mut fixture.bus, Channel::Secondary, 4, &buffer),
            Err(TransferError::DeviceError)
        );

        // The channel recovers for the next in-range command.
        let mut readback = [0; SECTOR_SIZE];
        ata::read_sector(&mut fixture.bus, Channel::Secondary, 0, &mut readback).unwrap();
    }

    #[test]
    fn test_command_error_fault() {
        let mut fixture = SimBusFixture::new(2).unwrap();
        fixture.bus.disk(Channel::Secondary).unwrap().set_fault(Fault::CommandError);

        let mut buffer = [0x5A; SECTOR_SIZE];
        assert_eq!(
            ata::read_sector(&mut fixture.bus, Channel::Secondary, 0, &mut buffer),
            Err(TransferError::DeviceError)
        );
        assert!(buffer.iter().all(|&b| b == 0x5A));
    }

    #[test]
    #[timeout(30000)]
    fn test_never_ready_fault_times_out() {
        let mut fixture = SimBusFixture::new(2).unwrap();
        fixture.bus.disk(Channel::Secondary).unwrap().set_fault(Fault::NeverReady);

        let mut buffer = [0; SECTOR_SIZE];
        assert_eq!(
            ata::read_sector(&mut fixture.bus, Channel::Secondary, 0, &mut buffer),
            Err(TransferError::Timeout)
        );
    }

    #[test]
    fn test_reset_port_capture() {
        let mut fixture = SimBusFixture::new(1).unwrap();

        assert!(!fixture.bus.reset_requested());
        fixture.bus.write8(KBD_CONTROLLER_PORT, 0x00);
        assert!(!fixture.bus.reset_requested());
        fixture.bus.write8(KBD_CONTROLLER_PORT, KBD_RESET_COMMAND);
        assert!(fixture.bus.reset_requested());
    }

    #[test]
    fn test_rejects_bad_images() {
        init_test_logging();
        let temp_dir = tempfile::tempdir().unwrap();

        // Not a multiple of the sector size.
        let odd = temp_dir.path().join("odd.img");
        let file = fs::File::create(&odd).unwrap();
        file.set_len(SECTOR_SIZE as u64 - 1).unwrap();
        drop(file);
        assert!(SimDisk::open(&odd).is_err());

        // Empty.
        let empty = temp_dir.path().join("empty.img");
        fs::File::create(&empty).unwrap();
        assert!(SimDisk::open(&empty).is_err());

        // A directory.
        let dir = temp_dir.path().join("imadir");
        fs::create_dir(&dir).unwrap();
        assert!(SimDisk::open(&dir).is_err());
    }
}
