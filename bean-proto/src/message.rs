//! Message identifiers and typed payloads carried over the serial characteristic

use crate::error::ProtoError;

// Serial pass-through
pub const MSG_SERIAL_DATA: u16 = 0x0000;

// Radio configuration
pub const MSG_BT_SET_ADV: u16 = 0x0500;
pub const MSG_BT_SET_CONN: u16 = 0x0502;
pub const MSG_BT_SET_LOCAL_NAME: u16 = 0x0504;
pub const MSG_BT_SET_PIN: u16 = 0x0506;
pub const MSG_BT_SET_TX_PWR: u16 = 0x0508;
pub const MSG_BT_GET_CONFIG: u16 = 0x0510;
pub const MSG_BT_SET_CONFIG: u16 = 0x0511;
pub const MSG_BT_ADV_ONOFF: u16 = 0x0512;
pub const MSG_BT_SET_SCRATCH: u16 = 0x0514;
pub const MSG_BT_GET_SCRATCH: u16 = 0x0515;
pub const MSG_BT_RESTART: u16 = 0x0520;
pub const MSG_BT_SET_CONFIG_NOSAVE: u16 = 0x0540;
pub const MSG_BT_END_GATE: u16 = 0x0550;

// Sketch bootloader
pub const MSG_BL_CMD_START: u16 = 0x1000;
pub const MSG_BL_FW_BLOCK: u16 = 0x1001;
pub const MSG_BL_STATUS: u16 = 0x1002;
pub const MSG_BL_GET_META: u16 = 0x1003;

// Peripherals on the radio controller
pub const MSG_CC_LED_WRITE: u16 = 0x2000;
pub const MSG_CC_LED_WRITE_ALL: u16 = 0x2001;
pub const MSG_CC_LED_READ_ALL: u16 = 0x2002;
pub const MSG_CC_ACCEL_READ: u16 = 0x2010;
pub const MSG_CC_TEMP_READ: u16 = 0x2011;
pub const MSG_CC_BATT_READ: u16 = 0x2015;
pub const MSG_CC_POWER_ARDUINO: u16 = 0x2020;
pub const MSG_CC_GET_AR_POWER: u16 = 0x2021;
pub const MSG_CC_ACCEL_GET_RANGE: u16 = 0x2030;
pub const MSG_CC_ACCEL_SET_RANGE: u16 = 0x2035;

pub const MSG_AR_SLEEP: u16 = 0x3000;
pub const MSG_ERROR_CC: u16 = 0x4000;

// Debug
pub const MSG_DB_LOOPBACK: u16 = 0xFE00;
pub const MSG_DB_COUNTER: u16 = 0xFE01;
pub const MSG_DB_E2E_LOOPBACK: u16 = 0xFE02;
pub const MSG_DB_PTM: u16 = 0xFE03;

/// Number of scratch characteristics exposed by the device
pub const SCRATCH_BANKS: u8 = 5;

/// Largest value one scratch characteristic holds
pub const MAX_SCRATCH_LEN: usize = 20;

/// Human readable name of a message id, for logs
pub fn message_name(id: u16) -> Option<&'static str> {
    let name = match id {
        MSG_SERIAL_DATA => "SERIAL_DATA",
        MSG_BT_SET_ADV => "BT_SET_ADV",
        MSG_BT_SET_CONN => "BT_SET_CONN",
        MSG_BT_SET_LOCAL_NAME => "BT_SET_LOCAL_NAME",
        MSG_BT_SET_PIN => "BT_SET_PIN",
        MSG_BT_SET_TX_PWR => "BT_SET_TX_PWR",
        MSG_BT_GET_CONFIG => "BT_GET_CONFIG",
        MSG_BT_SET_CONFIG => "BT_SET_CONFIG",
        MSG_BT_ADV_ONOFF => "BT_ADV_ONOFF",
        MSG_BT_SET_SCRATCH => "BT_SET_SCRATCH",
        MSG_BT_GET_SCRATCH => "BT_GET_SCRATCH",
        MSG_BT_RESTART => "BT_RESTART",
        MSG_BT_SET_CONFIG_NOSAVE => "BT_SET_CONFIG_NOSAVE",
        MSG_BT_END_GATE => "BT_END_GATE",
        MSG_BL_CMD_START => "BL_CMD_START",
        MSG_BL_FW_BLOCK => "BL_FW_BLOCK",
        MSG_BL_STATUS => "BL_STATUS",
        MSG_BL_GET_META => "BL_GET_META",
        MSG_CC_LED_WRITE => "CC_LED_WRITE",
        MSG_CC_LED_WRITE_ALL => "CC_LED_WRITE_ALL",
        MSG_CC_LED_READ_ALL => "CC_LED_READ_ALL",
        MSG_CC_ACCEL_READ => "CC_ACCEL_READ",
        MSG_CC_TEMP_READ => "CC_TEMP_READ",
        MSG_CC_BATT_READ => "CC_BATT_READ",
        MSG_CC_POWER_ARDUINO => "CC_POWER_ARDUINO",
        MSG_CC_GET_AR_POWER => "CC_GET_AR_POWER",
        MSG_CC_ACCEL_GET_RANGE => "CC_ACCEL_GET_RANGE",
        MSG_CC_ACCEL_SET_RANGE => "CC_ACCEL_SET_RANGE",
        MSG_AR_SLEEP => "AR_SLEEP",
        MSG_ERROR_CC => "ERROR_CC",
        MSG_DB_LOOPBACK => "DB_LOOPBACK",
        MSG_DB_COUNTER => "DB_COUNTER",
        MSG_DB_E2E_LOOPBACK => "DB_E2E_LOOPBACK",
        MSG_DB_PTM => "DB_PTM",
        _ => return None,
    };
    Some(name)
}

/// Messages the device sends without being asked
pub fn is_unsolicited(id: u16) -> bool {
    matches!(id, MSG_SERIAL_DATA | MSG_BL_STATUS)
}

fn require(what: &'static str, data: &[u8], needed: usize) -> Result<(), ProtoError> {
    if data.len() < needed {
        return Err(ProtoError::PayloadTooShort {
            what,
            needed,
            got: data.len(),
        });
    }
    Ok(())
}

/// Accelerometer sample in g
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Acceleration {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Acceleration {
    /// Parse `[x:i16][y:i16][z:i16][sensitivity:u8]`, each axis scaled by
    /// `sensitivity / 512`.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtoError> {
        require("acceleration", data, 7)?;
        let scale = data[6] as f64 / 512.0;
        let axis = |i: usize| i16::from_le_bytes([data[i], data[i + 1]]) as f64 * scale;
        Ok(Self {
            x: axis(0),
            y: axis(2),
            z: axis(4),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LedColor {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl LedColor {
    pub fn new(red: u8, green: u8, blue: u8) -> Self {
        Self { red, green, blue }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        vec![self.red, self.green, self.blue]
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtoError> {
        require("led", data, 3)?;
        Ok(Self::new(data[0], data[1], data[2]))
    }
}

/// One of the five scratch characteristics, numbered from 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScratchBank(u8);

impl ScratchBank {
    pub fn new(bank: u8) -> Result<Self, ProtoError> {
        if bank == 0 || bank > SCRATCH_BANKS {
            return Err(ProtoError::InvalidScratchBank(bank));
        }
        Ok(Self(bank))
    }

    pub fn number(self) -> u8 {
        self.0
    }

    /// Payload of a `BT_SET_SCRATCH` request
    pub fn write_payload(self, data: &[u8]) -> Result<Vec<u8>, ProtoError> {
        if data.len() > MAX_SCRATCH_LEN {
            return Err(ProtoError::ScratchTooLong(data.len()));
        }
        let mut buf = Vec::with_capacity(1 + data.len());
        buf.push(self.0);
        buf.extend_from_slice(data);
        Ok(buf)
    }
}

/// Temperature in degrees Celsius from a `CC_TEMP_READ` response
pub fn parse_temperature(data: &[u8]) -> Result<i8, ProtoError> {
    require("temperature", data, 1)?;
    Ok(data[0] as i8)
}

/// Arduino power state from a `CC_GET_AR_POWER` response
pub fn parse_arduino_power(data: &[u8]) -> Result<bool, ProtoError> {
    require("arduino power", data, 1)?;
    Ok(data[0] == 1)
}

/// Single byte responses: accelerometer range, battery percentage
pub fn parse_byte(what: &'static str, data: &[u8]) -> Result<u8, ProtoError> {
    require(what, data, 1)?;
    Ok(data[0])
}
