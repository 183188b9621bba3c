//! Client configuration
//!
//! Every field has a default matching current Bean firmware, so an empty JSON
//! object (or no config file at all) is a valid configuration.

use std::time::Duration;

use bean_proto::ble;
use uuid::Uuid;

const fn uuid(s: &str) -> Uuid {
    match Uuid::try_parse(s) {
        Ok(uuid) => uuid,
        Err(_) => panic!("invalid UUID constant"),
    }
}

pub const SERIAL_SERVICE: Uuid = uuid(ble::SERIAL_SERVICE_UUID);
pub const SERIAL_CHAR: Uuid = uuid(ble::SERIAL_CHAR_UUID);
pub const SCRATCH_CHARS: [Uuid; 5] = [
    uuid(ble::SCRATCH_CHAR_UUIDS[0]),
    uuid(ble::SCRATCH_CHAR_UUIDS[1]),
    uuid(ble::SCRATCH_CHAR_UUIDS[2]),
    uuid(ble::SCRATCH_CHAR_UUIDS[3]),
    uuid(ble::SCRATCH_CHAR_UUIDS[4]),
];
pub const OAD_SERVICE: Uuid = uuid(ble::OAD_SERVICE_UUID);
pub const OAD_IDENTIFY: Uuid = uuid(ble::OAD_IDENTIFY_UUID);
pub const OAD_BLOCK: Uuid = uuid(ble::OAD_BLOCK_UUID);
pub const FIRMWARE_VERSION: Uuid = uuid(ble::FIRMWARE_VERSION_UUID);
pub const HARDWARE_VERSION: Uuid = uuid(ble::HARDWARE_VERSION_UUID);
pub const SOFTWARE_VERSION: Uuid = uuid(ble::SOFTWARE_VERSION_UUID);
pub const BATTERY_LEVEL: Uuid = uuid(ble::BATTERY_LEVEL_UUID);

/// GATT identifiers the client talks to
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct GattProfile {
    pub serial_service: Uuid,
    pub serial: Uuid,
    pub scratch: [Uuid; 5],
    pub oad_service: Uuid,
    pub oad_identify: Uuid,
    pub oad_block: Uuid,
    pub firmware_version: Uuid,
    pub hardware_version: Uuid,
    pub software_version: Uuid,
    pub battery_level: Uuid,
}

impl Default for GattProfile {
    fn default() -> Self {
        Self {
            serial_service: SERIAL_SERVICE,
            serial: SERIAL_CHAR,
            scratch: SCRATCH_CHARS,
            oad_service: OAD_SERVICE,
            oad_identify: OAD_IDENTIFY,
            oad_block: OAD_BLOCK,
            firmware_version: FIRMWARE_VERSION,
            hardware_version: HARDWARE_VERSION,
            software_version: SOFTWARE_VERSION,
            battery_level: BATTERY_LEVEL,
        }
    }
}

impl GattProfile {
    /// Scratch bank (1..=5) for a characteristic, if it is one
    pub fn scratch_bank(&self, characteristic: &Uuid) -> Option<u8> {
        self.scratch
            .iter()
            .position(|uuid| uuid == characteristic)
            .map(|i| i as u8 + 1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long one GATT operation may go unconfirmed before it is retried
    pub operation_timeout_ms: u64,
    /// Retries after the first attempt of an unconfirmed operation
    pub operation_retries: u32,
    /// Depth of the command channel into the session task
    pub command_buffer: usize,
    /// Events buffered per subscriber before slow subscribers lag
    pub event_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            operation_timeout_ms: 1000,
            operation_retries: 3,
            command_buffer: 64,
            event_buffer: 64,
        }
    }
}

impl SessionConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

/// How firmware blocks are paced against the device's block requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BlockPacing {
    /// Write exactly the block the device asked for
    OnRequest,
    /// Keep up to `blocks_in_flight` blocks written ahead of the last request
    Lookahead { blocks_in_flight: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct FirmwareConfig {
    pub pacing: BlockPacing,
    pub check_version_timeout_ms: u64,
    pub approval_timeout_ms: u64,
    pub offer_timeout_ms: u64,
    pub transfer_accept_timeout_ms: u64,
    pub block_request_timeout_ms: u64,
    /// Quiet period after the final block request that ends the update
    pub completion_timeout_ms: u64,
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            pacing: BlockPacing::OnRequest,
            check_version_timeout_ms: 3000,
            approval_timeout_ms: 60_000,
            offer_timeout_ms: 3000,
            transfer_accept_timeout_ms: 3000,
            block_request_timeout_ms: 3000,
            completion_timeout_ms: 1500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SketchConfig {
    pub state_timeout_ms: u64,
    pub block_interval_ms: u64,
}

impl Default for SketchConfig {
    fn default() -> Self {
        Self {
            state_timeout_ms: 3000,
            block_interval_ms: 200,
        }
    }
}

/// Everything a [`Session`](crate::session::Session) needs
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct BeanConfig {
    pub profile: GattProfile,
    pub session: SessionConfig,
    pub firmware: FirmwareConfig,
    pub sketch: SketchConfig,
}

pub(crate) fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}
