/// Errors raised while framing, reassembling or parsing Bean protocol data
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtoError {
    #[error("envelope checksum mismatch: expected 0x{expected:04x}, got 0x{actual:04x}")]
    Checksum { expected: u16, actual: u16 },

    #[error("envelope truncated: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("envelope length byte says {declared}, body has {actual} bytes")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("body too large for one envelope: {0} bytes")]
    BodyTooLarge(usize),

    #[error("packet stream desync: {0}")]
    Desync(String),

    #[error("first packet arrived while {buffered} bytes were still being reassembled")]
    UnexpectedFirstPacket { buffered: usize },

    #[error("continuation packet with no message in progress")]
    OrphanPacket,

    #[error("empty packet")]
    EmptyPacket,

    #[error("{what} payload too short: need {needed} bytes, got {got}")]
    PayloadTooShort {
        what: &'static str,
        needed: usize,
        got: usize,
    },

    #[error("firmware image too short: {0} bytes, header needs 16")]
    ImageTooShort(usize),

    #[error("firmware image too large: {0} bytes, blocks are indexed by u16")]
    ImageTooLarge(usize),

    #[error("unparsable firmware version: {0:?}")]
    UnparsableVersion(String),

    #[error("firmware bundle has no images")]
    EmptyBundle,

    #[error("scratch bank {0} out of range 1..=5")]
    InvalidScratchBank(u8),

    #[error("scratch data too long: {0} bytes, max 20")]
    ScratchTooLong(usize),

    #[error("invalid Intel hex on line {line}: {reason}")]
    InvalidHex { line: usize, reason: &'static str },
}
