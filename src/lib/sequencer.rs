use log::{debug, info, trace};
use std::fmt::{self, Display, Formatter};
use std::thread;
use std::time::Duration;

use crate::ata::{self, Channel, DEVICE_ABSENT};
use crate::console::Reporter;
use crate::machine::Machine;
use crate::ports::PortIo;
use crate::procedures::Procedure;

// Banner text.
const TITLE: &str = "CHRYSALIS OS - SYSTEM INSTALLER";
const COMPLETE_TITLE: &str = "INSTALLATION COMPLETE!";
const FAILED_TITLE: &str = "INSTALLATION FAILED - HALTING";

/// States of an installation run. Transitions are strictly linear, with
/// `Failed` reachable from every non-terminal state; nothing ever
/// transitions backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    Detect,
    Format,
    CopyFiles,
    InstallBootloader,
    Complete,
    Failed,
}

/// The provisioning step slots, in execution order.
#[derive(Debug, Clone, Copy)]
enum Slot {
    Format,
    CopyFiles,
    Bootloader,
}

/// Why a run failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailReason {
    /// The target channel's status lines floated high; no device answered.
    DeviceNotDetected,
    /// A provisioning step returned a negative status.
    StepFailed { step: &'static str, status: i32 },
}

impl Display for FailReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FailReason::DeviceNotDetected => write!(f, "Target disk not detected"),
            FailReason::StepFailed { step, status } => {
                write!(f, "Step {} failed with status {}", step, status)
            }
        }
    }
}

/// Terminal outcome of an installation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Complete,
    Failed(FailReason),
}

/// The installation sequencer: executes the fixed list of provisioning
/// steps exactly once, in order, and stops permanently on the first
/// failure. No retry, rollback or resumption.
pub struct Installer<P, R, M> {
    ports: P,
    channel: Channel,
    reporter: R,
    machine: M,
    format: Box<dyn Procedure>,
    copy_files: Box<dyn Procedure>,
    bootloader: Box<dyn Procedure>,
    dwell: Duration,
    reason: Option<FailReason>,
}

impl<P: PortIo, R: Reporter, M: Machine> Installer<P, R, M> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ports: P,
        channel: Channel,
        reporter: R,
        machine: M,
        format: Box<dyn Procedure>,
        copy_files: Box<dyn Procedure>,
        bootloader: Box<dyn Procedure>,
        dwell: Duration,
    ) -> Self {
        Installer {
            ports,
            channel,
            reporter,
            machine,
            format,
            copy_files,
            bootloader,
            dwell,
            reason: None,
        }
    }

    /// Drive the run to its terminal state.
    ///
    /// On real hardware this never returns: `Complete` ends in a reboot and
    /// `Failed` in a halted processor. With a machine implementation that
    /// hands control back, the terminal outcome is returned instead.
    pub fn run(&mut self) -> RunOutcome {
        let mut state = State::Init;
        loop {
            trace!("Installer entering state {:?}.", state);
            state = match state {
                State::Init => self.init(),
                State::Detect => self.detect(),
                State::Format => self.run_step(Slot::Format, State::CopyFiles),
                State::CopyFiles => self.run_step(Slot::CopyFiles, State::InstallBootloader),
                State::InstallBootloader => self.run_step(Slot::Bootloader, State::Complete),
                State::Complete => return self.complete(),
                State::Failed => return self.failed(),
            };
        }
    }

    fn init(&mut self) -> State {
        self.reporter.reset();
        self.reporter.banner(TITLE);
        self.reporter.report_step("INIT", "Starting installation process...");
        State::Detect
    }

    fn detect(&mut self) -> State {
        self.reporter.report_step("DETECT", "Detecting target disk...");
        let status = ata::probe(&mut self.ports, self.channel);
        debug!("Presence probe on the {:?} channel returned {:#04X}.", self.channel, status);
        // All lines floating high is the conventional signature of an empty
        // bus. A heuristic, not a guarantee.
        if status == DEVICE_ABSENT {
            self.fail(FailReason::DeviceNotDetected)
        } else {
            self.reporter.report_success("Target disk detected");
            State::Format
        }
    }

    fn run_step(&mut self, slot: Slot, next: State) -> State {
        let procedure: &mut dyn Procedure = match slot {
            Slot::Format => self.format.as_mut(),
            Slot::CopyFiles => self.copy_files.as_mut(),
            Slot::Bootloader => self.bootloader.as_mut(),
        };
        let status = procedure.perform(&mut self.ports, &mut self.reporter);
        let name = procedure.name();
        if status < 0 {
            debug!("Step {} returned status {}.", name, status);
            self.fail(FailReason::StepFailed { step: name, status })
        } else {
            next
        }
    }

    fn fail(&mut self, reason: FailReason) -> State {
        self.reason = Some(reason);
        State::Failed
    }

    fn complete(&mut self) -> RunOutcome {
        self.reporter.banner(COMPLETE_TITLE);
        self.reporter.report_step("REBOOT", "Restarting the machine...");
        info!("Installation complete; rebooting after {:?} dwell.", self.dwell);
        thread::sleep(self.dwell);
        self.machine.reboot();
        RunOutcome::Complete
    }

    fn failed(&mut self) -> RunOutcome {
        let reason = self
            .reason
            .take()
            .expect("Entered the Failed state without a recorded reason.");
        info!("Installation failed: {}.", reason);
        self.reporter.report_failure(&reason.to_string());
        self.reporter.banner(FAILED_TITLE);
        self.machine.halt();
        RunOutcome::Failed(reason)
    }
}
