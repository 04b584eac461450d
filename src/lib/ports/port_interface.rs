/// Raw I/O port capability.
///
/// The driver and the sequencer are written against this trait rather than
/// against inline port instructions, so the same code runs over real hardware
/// ports or over a simulated device.
pub trait PortIo {
    /// Read a byte from the given port.
    fn read8(&mut self, port: u16) -> u8;

    /// Write a byte to the given port.
    fn write8(&mut self, port: u16, value: u8);

    /// Read a 16-bit word from the given port.
    fn read16(&mut self, port: u16) -> u16;

    /// Write a 16-bit word to the given port.
    fn write16(&mut self, port: u16, value: u16);
}
