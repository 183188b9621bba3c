//! Envelope framing: `[length][0x00][body][crc16 LE]`
//!
//! The body of every envelope is a [`Frame`]: a big-endian message type
//! followed by its payload.

use crate::crc::crc16;
use crate::error::ProtoError;

/// Bytes an envelope adds around its body (length, reserved, two CRC bytes)
pub const ENVELOPE_OVERHEAD: usize = 4;

/// Largest body the one-byte length field can describe
pub const MAX_BODY_LEN: usize = u8::MAX as usize;

/// Set on the message type of every response sent by the device
pub const RESPONSE_FLAG: u16 = 0x8000;

/// Wrap a body in a checksummed envelope.
pub fn encode(body: &[u8]) -> Result<Vec<u8>, ProtoError> {
    if body.len() > MAX_BODY_LEN {
        return Err(ProtoError::BodyTooLarge(body.len()));
    }

    let mut buf = Vec::with_capacity(body.len() + ENVELOPE_OVERHEAD);
    buf.push(body.len() as u8);
    buf.push(0x00);
    buf.extend_from_slice(body);
    let crc = crc16(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Verify an envelope and return its body.
///
/// The checksum is checked before the length byte so any corruption of the
/// header reports as [`ProtoError::Checksum`].
pub fn decode(raw: &[u8]) -> Result<Vec<u8>, ProtoError> {
    if raw.len() < ENVELOPE_OVERHEAD {
        return Err(ProtoError::Truncated {
            needed: ENVELOPE_OVERHEAD,
            got: raw.len(),
        });
    }

    let (covered, trailer) = raw.split_at(raw.len() - 2);
    let actual = u16::from_le_bytes([trailer[0], trailer[1]]);
    let expected = crc16(covered);
    if expected != actual {
        return Err(ProtoError::Checksum { expected, actual });
    }

    let declared = raw[0] as usize;
    let body = &covered[2..];
    if body.len() != declared {
        return Err(ProtoError::LengthMismatch {
            declared,
            actual: body.len(),
        });
    }
    Ok(body.to_vec())
}

/// Frame: a message type and its payload, the body of one envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: u16,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(msg_type: u16, payload: Vec<u8>) -> Self {
        Self { msg_type, payload }
    }

    /// Message type with the response flag cleared
    pub fn message_id(&self) -> u16 {
        self.msg_type & !RESPONSE_FLAG
    }

    pub fn is_response(&self) -> bool {
        self.msg_type & RESPONSE_FLAG != 0
    }

    pub fn to_body(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 + self.payload.len());
        buf.extend_from_slice(&self.msg_type.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn from_body(body: &[u8]) -> Result<Self, ProtoError> {
        if body.len() < 2 {
            return Err(ProtoError::PayloadTooShort {
                what: "frame",
                needed: 2,
                got: body.len(),
            });
        }
        Ok(Self {
            msg_type: u16::from_be_bytes([body[0], body[1]]),
            payload: body[2..].to_vec(),
        })
    }

    /// Encode this frame as a complete envelope
    pub fn to_envelope(&self) -> Result<Vec<u8>, ProtoError> {
        encode(&self.to_body())
    }
}
