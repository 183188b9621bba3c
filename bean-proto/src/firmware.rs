//! Over-the-air firmware images for the radio controller
//!
//! The device keeps two image slots, A and B, and always runs one of them. An
//! update offers the image built for the other slot, then streams it in
//! 16-byte blocks as the device asks for them.

use crate::error::ProtoError;

/// Bytes of image data per block record
pub const FW_BLOCK_SIZE: usize = 16;

/// Length of the header at the start of every raw image
pub const IMAGE_HEADER_LEN: usize = 16;

/// Length of the header record exchanged on the identify characteristic
pub const HEADER_RECORD_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSlot {
    A,
    B,
    Unknown([u8; 4]),
}

impl ImageSlot {
    pub fn from_id(id: [u8; 4]) -> Self {
        match &id {
            b"AAAA" => ImageSlot::A,
            b"BBBB" => ImageSlot::B,
            _ => ImageSlot::Unknown(id),
        }
    }

    pub fn id(self) -> [u8; 4] {
        match self {
            ImageSlot::A => *b"AAAA",
            ImageSlot::B => *b"BBBB",
            ImageSlot::Unknown(id) => id,
        }
    }

    /// The slot an update must target while this one is running
    pub fn opposite(self) -> Option<Self> {
        match self {
            ImageSlot::A => Some(ImageSlot::B),
            ImageSlot::B => Some(ImageSlot::A),
            ImageSlot::Unknown(_) => None,
        }
    }
}

/// Header record: `[version:u16][length:u16][image id:4]`, little-endian
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareHeader {
    pub version: u16,
    pub length: u16,
    pub slot: ImageSlot,
}

impl FirmwareHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_RECORD_LEN] {
        let mut buf = [0u8; HEADER_RECORD_LEN];
        buf[0..2].copy_from_slice(&self.version.to_le_bytes());
        buf[2..4].copy_from_slice(&self.length.to_le_bytes());
        buf[4..8].copy_from_slice(&self.slot.id());
        buf
    }

    /// Parse the record the device notifies on the identify characteristic.
    /// Trailing bytes (some firmware appends the reserved word) are ignored.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtoError> {
        if data.len() < HEADER_RECORD_LEN {
            return Err(ProtoError::PayloadTooShort {
                what: "firmware header",
                needed: HEADER_RECORD_LEN,
                got: data.len(),
            });
        }
        Ok(Self {
            version: u16::from_le_bytes([data[0], data[1]]),
            length: u16::from_le_bytes([data[2], data[3]]),
            slot: ImageSlot::from_id([data[4], data[5], data[6], data[7]]),
        })
    }
}

/// A raw image file for one slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    name: String,
    data: Vec<u8>,
    crc: u16,
    crc_shadow: u16,
    version: u16,
    length: u16,
    unique_id: [u8; 4],
}

impl FirmwareImage {
    pub fn parse(name: impl Into<String>, data: Vec<u8>) -> Result<Self, ProtoError> {
        if data.len() < IMAGE_HEADER_LEN {
            return Err(ProtoError::ImageTooShort(data.len()));
        }
        if data.len().div_ceil(FW_BLOCK_SIZE) > u16::MAX as usize {
            return Err(ProtoError::ImageTooLarge(data.len()));
        }
        let word = |i: usize| u16::from_le_bytes([data[i], data[i + 1]]);
        Ok(Self {
            name: name.into(),
            crc: word(0),
            crc_shadow: word(2),
            version: word(4),
            length: word(6),
            unique_id: [data[8], data[9], data[10], data[11]],
            data,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn crc(&self) -> u16 {
        self.crc
    }

    pub fn crc_shadow(&self) -> u16 {
        self.crc_shadow
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    /// Image length as declared in the header (device units, not bytes)
    pub fn length(&self) -> u16 {
        self.length
    }

    pub fn slot(&self) -> ImageSlot {
        ImageSlot::from_id(self.unique_id)
    }

    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }

    pub fn header(&self) -> FirmwareHeader {
        FirmwareHeader {
            version: self.version,
            length: self.length,
            slot: self.slot(),
        }
    }

    pub fn block_count(&self) -> u16 {
        self.data.len().div_ceil(FW_BLOCK_SIZE) as u16
    }

    /// Block record `[index:u16 LE][16 bytes]`, zero-padded at the end of the
    /// image
    pub fn block(&self, index: u16) -> Option<Vec<u8>> {
        let start = index as usize * FW_BLOCK_SIZE;
        if start >= self.data.len() {
            return None;
        }
        let end = (start + FW_BLOCK_SIZE).min(self.data.len());

        let mut record = Vec::with_capacity(2 + FW_BLOCK_SIZE);
        record.extend_from_slice(&index.to_le_bytes());
        record.extend_from_slice(&self.data[start..end]);
        record.resize(2 + FW_BLOCK_SIZE, 0);
        Some(record)
    }
}

/// Version encoded at the start of an image file name, as in
/// `201507230001_A.bin`
pub fn version_from_name(name: &str) -> Option<u64> {
    let stem = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let digits: String = stem.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// The set of images offered in one update
#[derive(Debug, Clone)]
pub struct FirmwareBundle {
    images: Vec<FirmwareImage>,
    version: u64,
    cursor: usize,
}

impl FirmwareBundle {
    /// Bundle versioned by the first image's header
    pub fn new(images: Vec<FirmwareImage>) -> Result<Self, ProtoError> {
        let version = images.first().ok_or(ProtoError::EmptyBundle)?.version() as u64;
        Ok(Self {
            images,
            version,
            cursor: 0,
        })
    }

    pub fn with_version(images: Vec<FirmwareImage>, version: u64) -> Result<Self, ProtoError> {
        let mut bundle = Self::new(images)?;
        bundle.version = version;
        Ok(bundle)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn images(&self) -> &[FirmwareImage] {
        &self.images
    }

    pub fn image_for(&self, slot: ImageSlot) -> Option<&FirmwareImage> {
        self.images.iter().find(|image| image.slot() == slot)
    }

    /// Round-robin through the images
    pub fn next_image(&mut self) -> &FirmwareImage {
        let index = self.cursor % self.images.len();
        self.cursor = index + 1;
        &self.images[index]
    }

    /// Pick the image to propose while the device runs `running`
    pub fn offer_for(&mut self, running: ImageSlot) -> &FirmwareImage {
        let target = running
            .opposite()
            .and_then(|slot| self.images.iter().position(|image| image.slot() == slot));
        match target {
            Some(index) => &self.images[index],
            None => {
                log::debug!("no image for the slot opposite {:?}, rotating", running);
                self.next_image()
            }
        }
    }
}

/// Whether a device reporting `device_version` should take a bundle of
/// `bundle_version`.
///
/// A device running its OAD loader reports a version starting with `OAD` and
/// always needs an image. Otherwise the first space separated token is the
/// build number.
pub fn needs_update(device_version: &str, bundle_version: u64) -> Result<bool, ProtoError> {
    let device_version = device_version.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    if device_version.starts_with("OAD") {
        return Ok(true);
    }
    let build: u64 = device_version
        .split(' ')
        .next()
        .and_then(|token| token.parse().ok())
        .ok_or_else(|| ProtoError::UnparsableVersion(device_version.to_string()))?;
    Ok(bundle_version > build)
}
