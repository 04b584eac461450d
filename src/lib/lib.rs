mod ata;
mod console;
mod machine;
mod ports;
mod procedures;
mod sequencer;

use std::time::Duration;

// Public API.
pub use crate::ata::{
    probe, read_sector, write_sector, Channel, Sector, TransferError, TransferResult,
    DEVICE_ABSENT, SECTOR_SIZE,
};
pub use crate::console::{Reporter, TerminalReporter};
pub use crate::machine::{HostMachine, Machine, MetalMachine};
#[cfg(target_arch = "x86_64")]
pub use crate::ports::MetalPorts;
pub use crate::ports::{Fault, PortIo, SimBus, SimDisk};
pub use crate::procedures::{CopySystemFiles, FormatFat32, InstallMbr, Procedure};
pub use crate::sequencer::{FailReason, Installer, RunOutcome};

/// Run a simulated installation against the given disk image.
///
/// The image stands in for the target disk on the secondary IDE channel,
/// matching the disk the installer provisions on real hardware. Returns the
/// terminal outcome of the run, or a message if the image cannot be used.
pub fn run(image_path: &str, dwell: Duration) -> Result<RunOutcome, String> {
    let disk = SimDisk::open(image_path)
        .map_err(|e| format!("Failed to open disk image '{}': {}", image_path, e))?;
    let mut bus = SimBus::new();
    bus.attach(Channel::Secondary, disk);

    let mut installer = Installer::new(
        bus,
        Channel::Secondary,
        TerminalReporter::new(),
        HostMachine::new(),
        Box::new(FormatFat32),
        Box::new(CopySystemFiles),
        Box::new(InstallMbr::new(Channel::Secondary, InstallMbr::blank_image())),
        dwell,
    );
    Ok(installer.run())
}

/// Initialise logging for tests.
#[cfg(test)]
pub fn init_test_logging() {
    // The logger can only be initialised once, but we don't know the order of
    // tests. Therefore we ignore the result.
    let _ = simplelog::TestLogger::init(log::LevelFilter::Trace, simplelog::Config::default());
}
