//! Checksums used on the wire

/// CRC16 as computed by the Bean firmware.
///
/// Initial value `0xFFFF`, byte-swap then xor-shift per input byte. This is
/// the table-less CCITT form the device implements, and the result must match
/// it bit for bit.
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0xFFFF, |crc, &b| crc16_update(crc, b))
}

/// Fold one byte into a running CRC16.
pub fn crc16_update(crc: u16, byte: u8) -> u16 {
    let mut crc = crc.rotate_left(8);
    crc ^= byte as u16;
    crc ^= (crc & 0xFF) >> 4;
    crc ^= crc << 12;
    crc ^= (crc & 0xFF) << 5;
    crc
}

/// IEEE CRC32 of a sketch image, sent in the program start command.
pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}
