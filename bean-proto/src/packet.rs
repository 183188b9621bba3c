//! Packet layer: fragment envelopes into 20-byte GATT writes and back
//!
//! Every packet starts with one header byte:
//!
//! ```text
//! bit 7     first packet of an envelope
//! bits 6-5  envelope sequence number (mod 4)
//! bits 4-0  packets still to come after this one
//! ```

use crate::envelope;
use crate::error::ProtoError;

/// Largest payload carried by one packet (the link MTU minus the header byte)
pub const MAX_PACKET_PAYLOAD: usize = 19;

/// Largest number of packets one envelope may span
pub const MAX_PACKETS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub first: bool,
    pub sequence: u8,
    pub pending: u8,
}

impl PacketHeader {
    pub fn to_byte(self) -> u8 {
        let first = if self.first { 0x80 } else { 0x00 };
        first | ((self.sequence & 0x03) << 5) | (self.pending & 0x1F)
    }

    pub fn from_byte(byte: u8) -> Self {
        Self {
            first: byte & 0x80 != 0,
            sequence: (byte >> 5) & 0x03,
            pending: byte & 0x1F,
        }
    }
}

/// Send side: owns the per-session outgoing envelope counter
#[derive(Debug, Default)]
pub struct Packetizer {
    sequence: u8,
}

impl Packetizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number the next envelope will carry
    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    /// Split one envelope into packets and advance the sequence counter.
    pub fn packetize(&mut self, envelope: &[u8]) -> Result<Vec<Vec<u8>>, ProtoError> {
        let count = envelope.len().div_ceil(MAX_PACKET_PAYLOAD).max(1);
        if count > MAX_PACKETS {
            return Err(ProtoError::BodyTooLarge(envelope.len()));
        }

        let sequence = self.sequence;
        self.sequence = (self.sequence + 1) % 4;

        let packets = envelope
            .chunks(MAX_PACKET_PAYLOAD)
            .enumerate()
            .map(|(i, chunk)| {
                let header = PacketHeader {
                    first: i == 0,
                    sequence,
                    pending: (count - i - 1) as u8,
                };
                let mut packet = Vec::with_capacity(1 + chunk.len());
                packet.push(header.to_byte());
                packet.extend_from_slice(chunk);
                packet
            })
            .collect();
        Ok(packets)
    }

    pub fn reset(&mut self) {
        self.sequence = 0;
    }
}

/// Receive side: rebuilds envelopes from notified packets
///
/// Inconsistent streams are reported, never patched up. After [`reset`]
/// (connect or reconnect) the first first-packet seen is taken as the sync
/// point; continuation packets before that are dropped.
///
/// [`reset`]: Reassembler::reset
#[derive(Debug, Default)]
pub struct Reassembler {
    synced: bool,
    in_progress: bool,
    expected_sequence: u8,
    remaining: u8,
    last_sequence: Option<u8>,
    buffer: Vec<u8>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Whether a partially received envelope is buffered
    pub fn in_progress(&self) -> bool {
        self.in_progress
    }

    /// Feed one packet. Returns the decoded body once the last packet of an
    /// envelope arrives.
    pub fn push(&mut self, packet: &[u8]) -> Result<Option<Vec<u8>>, ProtoError> {
        let (&header, payload) = packet.split_first().ok_or(ProtoError::EmptyPacket)?;
        let header = PacketHeader::from_byte(header);

        if header.first {
            if self.in_progress {
                let buffered = self.buffer.len();
                self.reset();
                return Err(ProtoError::UnexpectedFirstPacket { buffered });
            }
            if let Some(last) = self.last_sequence {
                let next = (last + 1) % 4;
                if header.sequence != next {
                    log::warn!(
                        "envelope sequence jumped from {} to {}",
                        last,
                        header.sequence
                    );
                }
            }
            self.synced = true;
            self.in_progress = true;
            self.expected_sequence = header.sequence;
            self.remaining = header.pending;
            self.buffer.clear();
        } else {
            if !self.synced {
                log::debug!("dropping continuation packet before sync");
                return Ok(None);
            }
            if !self.in_progress {
                self.reset();
                return Err(ProtoError::OrphanPacket);
            }
            if header.sequence != self.expected_sequence
                || self.remaining == 0
                || header.pending != self.remaining - 1
            {
                let detail = format!(
                    "expected sequence {} pending {}, got sequence {} pending {}",
                    self.expected_sequence,
                    self.remaining.saturating_sub(1),
                    header.sequence,
                    header.pending
                );
                self.reset();
                return Err(ProtoError::Desync(detail));
            }
            self.remaining = header.pending;
        }

        self.buffer.extend_from_slice(payload);
        if self.remaining > 0 {
            return Ok(None);
        }

        self.in_progress = false;
        self.last_sequence = Some(self.expected_sequence);
        let raw = std::mem::take(&mut self.buffer);
        envelope::decode(&raw).map(Some)
    }
}
