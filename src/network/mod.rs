//! Network subsystem for sACN control-frame reception

pub mod interfaces;
pub mod sacn;
pub mod transport;

pub use interfaces::{AddressChange, InterfaceMonitor};
pub use sacn::SacnPacket;
pub use transport::{EventHandler, FrameTransport, SacnTransport, TransportEvent};
