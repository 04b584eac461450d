use log::info;

use crate::ports::PortIo;

// Keyboard-controller reset: the classic way to ask an AT machine to reset.
pub const KBD_CONTROLLER_PORT: u16 = 0x64;
pub const KBD_RESET_COMMAND: u8 = 0xFE;

/// Hardware control invoked at the end of an installation run.
pub trait Machine {
    /// Ask the machine to reset. Expected not to return on real hardware,
    /// but callers must tolerate the signal being ignored.
    fn reboot(&mut self);

    /// Stop executing permanently. The hardware implementation never
    /// returns; test doubles may, so the sequencer's outcome stays
    /// observable.
    fn halt(&mut self);
}

/// Machine control over real port I/O. Reboot pulses the keyboard
/// controller's reset line; both operations end in a `hlt` loop, so a
/// reset that is not honored stalls instead of falling through.
pub struct MetalMachine<P> {
    ports: P,
}

impl<P: PortIo> MetalMachine<P> {
    pub fn new(ports: P) -> Self {
        MetalMachine { ports }
    }
}

impl<P: PortIo> Machine for MetalMachine<P> {
    fn reboot(&mut self) {
        self.ports.write8(KBD_CONTROLLER_PORT, KBD_RESET_COMMAND);
        halt_loop();
    }

    fn halt(&mut self) {
        halt_loop();
    }
}

#[cfg(target_arch = "x86_64")]
fn halt_loop() -> ! {
    loop {
        unsafe {
            core::arch::asm!("hlt", options(nomem, nostack, preserves_flags));
        }
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn halt_loop() -> ! {
    loop {
        std::thread::park();
    }
}

/// Machine control for simulated runs: requests are logged and recorded,
/// and control returns to the caller.
#[derive(Debug, Default)]
pub struct HostMachine {
    reboot_requests: u32,
}

impl HostMachine {
    pub fn new() -> Self {
        HostMachine::default()
    }

    /// Number of reboot requests observed so far.
    pub fn reboot_requests(&self) -> u32 {
        self.reboot_requests
    }
}

impl Machine for HostMachine {
    fn reboot(&mut self) {
        self.reboot_requests += 1;
        info!("Reboot requested.");
    }

    fn halt(&mut self) {
        info!("Halt requested.");
    }
}
