//! Sketch (application image) programming messages

use crate::crc::crc32;
use crate::error::ProtoError;

/// Longest sketch name stored on the device
pub const MAX_SKETCH_NAME_LEN: usize = 20;

/// Sketch bytes carried by one `BL_FW_BLOCK` message
pub const SKETCH_BLOCK_SIZE: usize = 64;

const METADATA_LEN: usize = 4 + 4 + 4 + 1 + MAX_SKETCH_NAME_LEN;

/// Payload of `BL_CMD_START`, and of the `BL_GET_META` response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SketchMetadata {
    pub size: u32,
    pub crc32: u32,
    /// Seconds since the unix epoch
    pub timestamp: u32,
    pub name: String,
}

impl SketchMetadata {
    /// Describe `image`; names longer than 20 bytes are cut.
    pub fn for_image(name: &str, image: &[u8], timestamp: u32) -> Self {
        let mut name = name.to_string();
        while name.len() > MAX_SKETCH_NAME_LEN {
            name.pop();
        }
        Self {
            size: image.len() as u32,
            crc32: crc32(image),
            timestamp,
            name,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let name = self.name.as_bytes();
        let name = &name[..name.len().min(MAX_SKETCH_NAME_LEN)];

        let mut buf = Vec::with_capacity(METADATA_LEN);
        buf.extend_from_slice(&self.size.to_le_bytes());
        buf.extend_from_slice(&self.crc32.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.push(name.len() as u8);
        buf.extend_from_slice(name);
        buf.resize(METADATA_LEN, b' ');
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtoError> {
        if data.len() < METADATA_LEN {
            return Err(ProtoError::PayloadTooShort {
                what: "sketch metadata",
                needed: METADATA_LEN,
                got: data.len(),
            });
        }
        let word = |i: usize| u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        let name_len = (data[12] as usize).min(MAX_SKETCH_NAME_LEN);
        Ok(Self {
            size: word(0),
            crc32: word(4),
            timestamp: word(8),
            name: String::from_utf8_lossy(&data[13..13 + name_len]).into_owned(),
        })
    }
}

/// Split a sketch into `BL_FW_BLOCK` payloads
pub fn sketch_blocks(image: &[u8]) -> Vec<Vec<u8>> {
    image
        .chunks(SKETCH_BLOCK_SIZE)
        .map(|chunk| chunk.to_vec())
        .collect()
}

/// Bootloader state reported in `BL_STATUS`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootloaderState {
    Null,
    Init,
    Ready,
    Programming,
    Verify,
    Complete,
    Error,
    Unknown(u8),
}

impl From<u8> for BootloaderState {
    fn from(value: u8) -> Self {
        match value {
            0 => BootloaderState::Null,
            1 => BootloaderState::Init,
            2 => BootloaderState::Ready,
            3 => BootloaderState::Programming,
            4 => BootloaderState::Verify,
            5 => BootloaderState::Complete,
            6 => BootloaderState::Error,
            other => BootloaderState::Unknown(other),
        }
    }
}

/// Fine grained step of the bootloader programming the sketch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootloaderSubstate {
    Init,
    WriteAddress,
    WriteAddressAck,
    WriteChunk,
    WriteChunkAck,
    ReadAddress,
    ReadAddressAck,
    ReadChunk,
    ReadChunkAck,
    Verify,
    Done,
    DoneAck,
    Start,
    StartAck,
    Hello,
    HelloAck,
    StartRstAgain,
    DoneReset,
    ProgMode,
    ProgModeAck,
    DeviceSig,
    DeviceSigAck,
    WriteChunkTwo,
    Error,
    Unknown(u8),
}

impl From<u8> for BootloaderSubstate {
    fn from(value: u8) -> Self {
        use BootloaderSubstate::*;
        const ORDER: [BootloaderSubstate; 24] = [
            Init,
            WriteAddress,
            WriteAddressAck,
            WriteChunk,
            WriteChunkAck,
            ReadAddress,
            ReadAddressAck,
            ReadChunk,
            ReadChunkAck,
            Verify,
            Done,
            DoneAck,
            Start,
            StartAck,
            Hello,
            HelloAck,
            StartRstAgain,
            DoneReset,
            ProgMode,
            ProgModeAck,
            DeviceSig,
            DeviceSigAck,
            WriteChunkTwo,
            Error,
        ];
        ORDER
            .get(value as usize)
            .copied()
            .unwrap_or(Unknown(value))
    }
}

/// `BL_STATUS`: `[state][substate][blocks sent:u16 BE][bytes sent:u16 BE]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub state: BootloaderState,
    pub substate: BootloaderSubstate,
    pub blocks_sent: u16,
    pub bytes_sent: u16,
}

impl Status {
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtoError> {
        if data.len() < 6 {
            return Err(ProtoError::PayloadTooShort {
                what: "status",
                needed: 6,
                got: data.len(),
            });
        }
        Ok(Self {
            state: data[0].into(),
            substate: data[1].into(),
            blocks_sent: u16::from_be_bytes([data[2], data[3]]),
            bytes_sent: u16::from_be_bytes([data[4], data[5]]),
        })
    }
}

/// Flatten an Intel hex file into the raw sketch image.
///
/// Data records are concatenated in file order; parsing stops at the
/// end-of-file record. Address records are ignored since sketches are linked
/// at address 0 with no gaps.
pub fn parse_intel_hex(text: &str) -> Result<Vec<u8>, ProtoError> {
    let mut image = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line_no = index + 1;
        let invalid = |reason| ProtoError::InvalidHex {
            line: line_no,
            reason,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let digits = line.strip_prefix(':').ok_or(invalid("missing ':'"))?;
        if digits.len() % 2 != 0 || !digits.is_ascii() {
            return Err(invalid("odd number of hex digits"));
        }
        let bytes = (0..digits.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&digits[i..i + 2], 16))
            .collect::<Result<Vec<u8>, _>>()
            .map_err(|_| invalid("not a hex digit"))?;

        if bytes.len() < 5 || bytes.len() != bytes[0] as usize + 5 {
            return Err(invalid("record length mismatch"));
        }
        if bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b)) != 0 {
            return Err(invalid("bad record checksum"));
        }
        match bytes[3] {
            0x00 => image.extend_from_slice(&bytes[4..bytes.len() - 1]),
            0x01 => break,
            _ => {}
        }
    }
    Ok(image)
}
