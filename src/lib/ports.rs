mod port_interface;
#[cfg(target_arch = "x86_64")]
mod port_metal;
mod port_sim;

pub use port_interface::PortIo;
#[cfg(target_arch = "x86_64")]
pub use port_metal::MetalPorts;
pub use port_sim::{Fault, SimBus, SimDisk};
