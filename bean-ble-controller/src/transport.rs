//! The GATT link the session runs over
//!
//! [`crate::ble`] implements these traits with btleplug; tests use an in-memory
//! device.

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::TransportError;

/// A discovered service and the characteristics it holds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

/// Pushed by the transport while connected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Notification { characteristic: Uuid, value: Vec<u8> },
    Disconnected,
}

/// Raw GATT primitives for one peripheral.
///
/// Each call is one link operation. The session never issues a second call
/// before the previous one resolves.
#[async_trait]
pub trait GattTransport: Send + Sync + 'static {
    /// Connect and start pushing [`LinkEvent`]s into `events` until the link
    /// drops.
    async fn connect(&self, events: mpsc::UnboundedSender<LinkEvent>) -> Result<(), TransportError>;

    async fn discover_services(&self) -> Result<Vec<GattService>, TransportError>;

    async fn write(&self, characteristic: Uuid, value: Vec<u8>) -> Result<(), TransportError>;

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>, TransportError>;

    async fn enable_notifications(&self, characteristic: Uuid) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// Finds the peripheral again after it drops off the air, e.g. while it
/// reboots into a new firmware image.
#[async_trait]
pub trait Discovery: Send + Sync + 'static {
    /// Resolves once the device is advertising and can be connected again.
    async fn rediscover(&self) -> Result<(), TransportError>;
}

pub(crate) fn has_characteristic(services: &[GattService], service: Uuid, characteristic: Uuid) -> bool {
    services
        .iter()
        .filter(|s| s.uuid == service)
        .any(|s| s.characteristics.contains(&characteristic))
}
