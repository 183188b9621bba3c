//! Bean wire protocol - envelopes, packets, message types and update images
//!
//! Everything here is synchronous and free of I/O; `bean-ble-controller`
//! drives it over a GATT link.

pub mod ble;
pub mod crc;
pub mod envelope;
pub mod error;
pub mod firmware;
pub mod message;
pub mod packet;
pub mod sketch;

pub use envelope::{Frame, RESPONSE_FLAG};
pub use error::ProtoError;
pub use firmware::{FirmwareBundle, FirmwareHeader, FirmwareImage, ImageSlot};
pub use message::*;
pub use packet::{PacketHeader, Packetizer, Reassembler};
pub use sketch::{BootloaderState, BootloaderSubstate, SketchMetadata, Status, parse_intel_hex};
