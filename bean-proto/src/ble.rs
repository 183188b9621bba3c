//! GATT identifiers exposed by the Bean
//!
//! All protocol traffic rides the serial characteristic. Firmware updates use
//! the TI OAD service, and a few plain SIG services report device state.

/// Serial service: a495ff10-c5b1-4b44-b512-1370f02d74de
pub const SERIAL_SERVICE_UUID: &str = "a495ff10-c5b1-4b44-b512-1370f02d74de";

/// Serial characteristic (write/notify), carries every framed message
pub const SERIAL_CHAR_UUID: &str = "a495ff11-c5b1-4b44-b512-1370f02d74de";

/// Scratch service, five 20-byte characteristics shared with the sketch
pub const SCRATCH_SERVICE_UUID: &str = "a495ff20-c5b1-4b44-b512-1370f02d74de";

/// Scratch characteristics 1 through 5 (read/notify)
pub const SCRATCH_CHAR_UUIDS: [&str; 5] = [
    "a495ff21-c5b1-4b44-b512-1370f02d74de",
    "a495ff22-c5b1-4b44-b512-1370f02d74de",
    "a495ff23-c5b1-4b44-b512-1370f02d74de",
    "a495ff24-c5b1-4b44-b512-1370f02d74de",
    "a495ff25-c5b1-4b44-b512-1370f02d74de",
];

/// OAD service
pub const OAD_SERVICE_UUID: &str = "f000ffc0-0451-4000-b000-000000000000";

/// OAD identify characteristic: image header exchange
pub const OAD_IDENTIFY_UUID: &str = "f000ffc1-0451-4000-b000-000000000000";

/// OAD block characteristic: block requests in, block records out
pub const OAD_BLOCK_UUID: &str = "f000ffc2-0451-4000-b000-000000000000";

/// Client characteristic configuration descriptor
pub const CCCD_UUID: &str = "00002902-0000-1000-8000-00805f9b34fb";

pub const DEVICE_INFO_SERVICE_UUID: &str = "0000180a-0000-1000-8000-00805f9b34fb";
pub const FIRMWARE_VERSION_UUID: &str = "00002a26-0000-1000-8000-00805f9b34fb";
pub const HARDWARE_VERSION_UUID: &str = "00002a27-0000-1000-8000-00805f9b34fb";
pub const SOFTWARE_VERSION_UUID: &str = "00002a28-0000-1000-8000-00805f9b34fb";

pub const BATTERY_SERVICE_UUID: &str = "0000180f-0000-1000-8000-00805f9b34fb";

/// Battery level characteristic (read/notify), percent
pub const BATTERY_LEVEL_UUID: &str = "00002a19-0000-1000-8000-00805f9b34fb";
