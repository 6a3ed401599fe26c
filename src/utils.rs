use crc::{Crc, CRC_32_ISO_HDLC};

const MESSAGE_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Checksum of a v0 message body.
pub fn to_crc(data: &[u8]) -> u32 {
    MESSAGE_CRC.checksum(data)
}
