//! Bean BLE Controller
//!
//! Client for LightBlue Bean devices: serial messaging, sensor and LED
//! commands, sketch programming and radio firmware updates over BLE.
//!
//! # Example
//!
//! ```ignore
//! use bean_ble_controller::{BeanConfig, Session, ble};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let adapter = ble::get_adapter().await?;
//!     let peripheral = ble::find_device(&adapter, None, Duration::from_secs(5)).await?;
//!
//!     let bean = Session::spawn(ble::BtleplugTransport::new(adapter, peripheral), BeanConfig::default());
//!     bean.connect().await?;
//!
//!     println!("{} C", bean.read_temperature().await?);
//!     bean.send_serial(b"hello").await?;
//!
//!     Ok(())
//! }
//! ```

pub mod ble;
mod commands;
pub mod config;
pub mod error;
pub mod firmware;
pub mod queue;
pub mod session;
pub mod sketch;
pub mod timer;
pub mod transport;
pub mod upload;

#[cfg(test)]
mod mock;

pub use config::{BeanConfig, BlockPacing, FirmwareConfig, GattProfile, SessionConfig, SketchConfig};
pub use error::{BeanError, TransportError, UploadStage};
pub use session::{BeanEvent, Connection, Session};
pub use transport::{Discovery, GattService, GattTransport, LinkEvent};
pub use upload::{Upload, UploadEvent, UploadKind, UploadOutcome, UploadProgress};
