pub mod mock;
pub mod simulator;
pub mod transport;

pub use simulator::{RigConfig, SimulatedRig};
pub use transport::{LineConsumer, SharedConsumer, Transport};

/// Names of the serial ports currently present on this machine.
pub fn available_ports() -> Vec<String> {
    match serialport::available_ports() {
        Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
        Err(e) => {
            log::warn!("Port enumeration failed: {}", e);
            Vec::new()
        }
    }
}
