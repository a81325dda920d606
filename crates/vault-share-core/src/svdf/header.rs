use super::SvdfError;

pub const HEADER_SIZE: usize = 64;
pub const MAGIC_V5: &[u8; 4] = b"SVD5";
pub const MAGIC_V4: &[u8; 4] = b"SVD4";

/// The 64-byte SVDF header. Writers always emit version 5; readers accept
/// both 4 (no per-entry duration field) and 5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SvdfHeader {
    pub version: u16,
    pub active_file_count: u32,
    pub manifest_offset: u64,
    pub manifest_size: u32,
    pub metadata_offset: u64,
    pub metadata_size: u32,
}

impl SvdfHeader {
    pub const WRITER_VERSION: u16 = 5;

    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(MAGIC_V5);
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6..10].copy_from_slice(&self.active_file_count.to_le_bytes());
        buf[10..18].copy_from_slice(&self.manifest_offset.to_le_bytes());
        buf[18..22].copy_from_slice(&self.manifest_size.to_le_bytes());
        buf[22..30].copy_from_slice(&self.metadata_offset.to_le_bytes());
        buf[30..34].copy_from_slice(&self.metadata_size.to_le_bytes());
        // bytes 34..64 stay zero (reserved)
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, SvdfError> {
        if buf.len() < HEADER_SIZE {
            return Err(SvdfError::InvalidHeader);
        }
        if !is_valid_magic(&buf[0..4]) {
            return Err(SvdfError::InvalidMagic);
        }
        let version = u16::from_le_bytes(buf[4..6].try_into().unwrap());
        if version != 4 && version != 5 {
            return Err(SvdfError::InvalidMagic);
        }
        Ok(Self {
            version,
            active_file_count: u32::from_le_bytes(buf[6..10].try_into().unwrap()),
            manifest_offset: u64::from_le_bytes(buf[10..18].try_into().unwrap()),
            manifest_size: u32::from_le_bytes(buf[18..22].try_into().unwrap()),
            metadata_offset: u64::from_le_bytes(buf[22..30].try_into().unwrap()),
            metadata_size: u32::from_le_bytes(buf[30..34].try_into().unwrap()),
        })
    }
}

/// Constant-time check of the leading 4 magic bytes against either
/// supported magic value.
#[must_use]
pub fn is_valid_magic(prefix: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    if prefix.len() < 4 {
        return false;
    }
    let head = &prefix[0..4];
    bool::from(head.ct_eq(MAGIC_V5)) || bool::from(head.ct_eq(MAGIC_V4))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encode_decode() {
        let header = SvdfHeader {
            version: 5,
            active_file_count: 3,
            manifest_offset: 1000,
            manifest_size: 200,
            metadata_offset: 1200,
            metadata_size: 64,
        };
        let encoded = header.encode();
        assert_eq!(encoded.len(), HEADER_SIZE);
        let decoded = SvdfHeader::decode(&encoded).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(b"XXXX");
        assert!(matches!(SvdfHeader::decode(&buf), Err(SvdfError::InvalidMagic)));
    }

    #[test]
    fn rejects_short_buffer() {
        let buf = [0u8; 10];
        assert!(matches!(SvdfHeader::decode(&buf), Err(SvdfError::InvalidHeader)));
    }

    #[test]
    fn accepts_v4_magic() {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(MAGIC_V4);
        buf[4..6].copy_from_slice(&4u16.to_le_bytes());
        let decoded = SvdfHeader::decode(&buf).unwrap();
        assert_eq!(decoded.version, 4);
    }
}
