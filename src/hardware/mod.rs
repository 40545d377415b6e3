// src/hardware/mod.rs - Firmware communication: wire commands, line parsing, transports and the link
pub mod command;
pub mod link;
pub mod protocol;
pub mod serial;
pub mod sim;
pub mod transport;

pub use link::{FirmwareLink, LinkError, LinkEvent, LinkStatus};
pub use transport::{Transport, TransportError};
