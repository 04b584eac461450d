use log::debug;

use crate::ata::{self, Channel, Sector, SECTOR_SIZE};
use crate::console::Reporter;
use crate::ports::PortIo;

/// A provisioning step invoked by the sequencer.
///
/// A negative return status means failure; zero or positive means success.
/// Steps report their own progress and are trusted without verification.
pub trait Procedure {
    /// Short step tag used in progress reports and failure reasons.
    fn name(&self) -> &'static str;

    /// Run the step to completion.
    fn perform(&mut self, ports: &mut dyn PortIo, reporter: &mut dyn Reporter) -> i32;
}

/// Format the target disk as FAT32. The on-disk structures are owned by
/// the filesystem layer.
pub struct FormatFat32;

impl Procedure for FormatFat32 {
    fn name(&self) -> &'static str {
        "DISK"
    }

    fn perform(&mut self, _ports: &mut dyn PortIo, reporter: &mut dyn Reporter) -> i32 {
        reporter.report_step("DISK", "Formatting FAT32...");
        reporter.report_success("Boot sector created");
        reporter.report_success("FAT tables initialized");
        reporter.report_success("Root directory created");
        0
    }
}

/// Copy the system payload onto the freshly formatted disk.
pub struct CopySystemFiles;

impl Procedure for CopySystemFiles {
    fn name(&self) -> &'static str {
        "FILES"
    }

    fn perform(&mut self, _ports: &mut dyn PortIo, reporter: &mut dyn Reporter) -> i32 {
        reporter.report_step("FILES", "Copying system files...");
        reporter.report_success("Kernel image (kernel.bin 2.1 MB)");
        reporter.report_success("Boot configuration (4 KB)");
        reporter.report_success("System libraries (512 KB)");
        0
    }
}

/// Install the bootloader by writing the boot record to the first sector
/// of the target disk. The record's contents are opaque to this step.
pub struct InstallMbr {
    channel: Channel,
    image: Sector,
}

impl InstallMbr {
    pub fn new(channel: Channel, image: Sector) -> Self {
        InstallMbr { channel, image }
    }

    /// A blank boot record carrying only the boot signature.
    pub fn blank_image() -> Sector {
        let mut image = [0; SECTOR_SIZE];
        image[510] = 0x55;
        image[511] = 0xAA;
        image
    }
}

impl Procedure for InstallMbr {
    fn name(&self) -> &'static str {
        "BOOT"
    }

    fn perform(&mut self, ports: &mut dyn PortIo, reporter: &mut dyn Reporter) -> i32 {
        reporter.report_step("BOOT", "Installing bootloader...");
        match ata::write_sector(ports, self.channel, 0, &self.image) {
            Ok(()) => {
                reporter.report_success("MBR installed");
                0
            }
            Err(e) => {
                debug!("MBR write failed: {}.", e);
                e.code()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use crate::init_test_logging;
    use crate::ports::{SimBus, SimDisk};

    /// A reporter that counts calls and remembers nothing else.
    #[derive(Default)]
    struct CountingReporter {
        steps: u32,
        successes: u32,
        failures: u32,
    }

    impl Reporter for CountingReporter {
        fn reset(&mut self) {}
        fn banner(&mut self, _text: &str) {}
        fn report_step(&mut self, _name: &str, _message: &str) {
            self.steps += 1;
        }
        fn report_success(&mut self, _message: &str) {
            self.successes += 1;
        }
        fn report_failure(&mut self, _message: &str) {
            self.failures += 1;
        }
    }

    #[test]
    fn test_placeholder_steps_succeed() {
        init_test_logging();

        let mut bus = SimBus::new();
        let mut reporter = CountingReporter::default();
        assert_eq!(FormatFat32.perform(&mut bus, &mut reporter), 0);
        assert_eq!(CopySystemFiles.perform(&mut bus, &mut reporter), 0);
        assert_eq!(reporter.steps, 2);
        assert_eq!(reporter.successes, 6);
        assert_eq!(reporter.failures, 0);
    }

    #[test]
    fn test_mbr_lands_on_first_sector() {
        init_test_logging();

        let temp_dir = tempfile::tempdir().unwrap();
        let image_path = temp_dir.path().join("disk.img");
        let file = fs::File::create(&image_path).unwrap();
        file.set_len(4 * SECTOR_SIZE as u64).unwrap();
        drop(file);

        let mut bus = SimBus::new();
        bus.attach(Channel::Secondary, SimDisk::open(&image_path).unwrap());
        let mut reporter = CountingReporter::default();
        let mut step = InstallMbr::new(Channel::Secondary, InstallMbr::blank_image());
        assert_eq!(step.perform(&mut bus, &mut reporter), 0);

        let image = fs::read(&image_path).unwrap();
        assert_eq!(image[510], 0x55);
        assert_eq!(image[511], 0xAA);
        assert!(image[..510].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_mbr_write_fails_without_device() {
        init_test_logging();

        let mut bus = SimBus::new();
        let mut reporter = CountingReporter::default();
        let mut step = InstallMbr::new(Channel::Secondary, InstallMbr::blank_image());
        assert!(step.perform(&mut bus, &mut reporter) < 0);
        assert_eq!(reporter.successes, 0);
    }
}
