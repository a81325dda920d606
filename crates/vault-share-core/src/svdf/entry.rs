//! Per-file entry encode/decode.
//!
//! ```text
//! uint32  entrySize                // bytes following this field
//! 16B     fileId
//! uint16  filenameLen
//! bytes   filename (UTF-8)
//! uint8   mimeTypeLen
//! bytes   mimeType (UTF-8)
//! uint32  originalSize
//! float64 createdAt
//! float64 duration                 // v5 only; -1.0 = absent
//! uint32  thumbSize
//! bytes   encryptedThumbnail
//! uint32  encryptedContentSize
//! bytes   encryptedContent
//! ```
//!
//! Every length field is cross-checked against both the slice it indexes
//! into and the declared `entrySize` before the corresponding read, per
//! the codec-vs-parse-robustness design note: a faithful implementation
//! must not trust a length field further than the bytes actually present.

use uuid::Uuid;

use super::{SvdfContext, SvdfError};
use crate::model::SharedFile;

pub const MAX_NAME_LEN: usize = u16::MAX as usize;
pub const MAX_MIME_LEN: usize = u8::MAX as usize;
/// -1.0 sentinel for an absent duration (v5 field, non-video files).
pub const NO_DURATION: f64 = -1.0;

/// Everything except full content, as produced by a bounded metadata read.
#[derive(Debug, Clone)]
pub struct ExtractedFileMetadata {
    pub id: Uuid,
    pub filename: String,
    pub mime_type: String,
    pub original_size: u32,
    pub created_at: f64,
    pub duration: f64,
    pub encrypted_thumbnail: Vec<u8>,
    /// Absolute offset of `encryptedContent` within the container.
    pub content_offset: u64,
    pub content_size: u32,
}

fn checked_u16(value: usize, what: &str) -> Result<u16, SvdfError> {
    u16::try_from(value).map_err(|_| SvdfError::FieldTooLarge(format!("{what} ({value} bytes)")))
}
fn checked_u8(value: usize, what: &str) -> Result<u8, SvdfError> {
    u8::try_from(value).map_err(|_| SvdfError::FieldTooLarge(format!("{what} ({value} bytes)")))
}
fn checked_u32(value: usize, what: &str) -> Result<u32, SvdfError> {
    u32::try_from(value).map_err(|_| SvdfError::FieldTooLarge(format!("{what} ({value} bytes)")))
}

/// Encode one file entry, returning the full on-disk block (length prefix
/// included).
pub fn encode_file_entry(file: &SharedFile) -> Result<Vec<u8>, SvdfError> {
    if file.filename.len() > MAX_NAME_LEN {
        return Err(SvdfError::FieldTooLarge(format!(
            "filename ({} bytes)",
            file.filename.len()
        )));
    }
    if file.mime_type.len() > MAX_MIME_LEN {
        return Err(SvdfError::FieldTooLarge(format!(
            "mimeType ({} bytes)",
            file.mime_type.len()
        )));
    }
    if !file.created_at.is_finite() || file.created_at < 0.0 {
        return Err(SvdfError::NegativeField("createdAt".to_string()));
    }
    if !file.duration.is_finite() {
        return Err(SvdfError::NegativeField("duration".to_string()));
    }

    let filename_len = checked_u16(file.filename.len(), "filenameLen")?;
    let mime_len = checked_u8(file.mime_type.len(), "mimeTypeLen")?;
    let thumb_size = checked_u32(file.encrypted_thumbnail.len(), "thumbSize")?;
    let content_size = checked_u32(file.encrypted_content.len(), "encryptedContentSize")?;

    let mut body = Vec::with_capacity(
        16 + 2
            + file.filename.len()
            + 1
            + file.mime_type.len()
            + 4
            + 8
            + 8
            + 4
            + file.encrypted_thumbnail.len()
            + 4
            + file.encrypted_content.len(),
    );
    body.extend_from_slice(file.id.as_bytes());
    body.extend_from_slice(&filename_len.to_le_bytes());
    body.extend_from_slice(file.filename.as_bytes());
    body.extend_from_slice(&mime_len.to_le_bytes());
    body.extend_from_slice(file.mime_type.as_bytes());
    body.extend_from_slice(&file.original_size.to_le_bytes());
    body.extend_from_slice(&file.created_at.to_le_bytes());
    body.extend_from_slice(&file.duration.to_le_bytes());
    body.extend_from_slice(&thumb_size.to_le_bytes());
    body.extend_from_slice(&file.encrypted_thumbnail);
    body.extend_from_slice(&content_size.to_le_bytes());
    body.extend_from_slice(&file.encrypted_content);

    let entry_size = checked_u32(body.len(), "entrySize")?;
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&entry_size.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Builds everything in an entry block up to (and including) the
/// `encryptedContentSize` field, without requiring the encrypted content
/// itself in memory. The caller streams `content_size` bytes after this
/// prefix to complete the entry. Returns `(prefix_bytes, total_block_size)`
/// where `total_block_size` is the full on-disk size of the entry
/// (prefix + content), suitable for a manifest entry's `size` field.
#[allow(clippy::too_many_arguments)]
pub fn encode_file_entry_prefix(
    id: Uuid,
    filename: &str,
    mime_type: &str,
    original_size: u32,
    created_at: f64,
    duration: f64,
    encrypted_thumbnail: &[u8],
    content_size: u32,
) -> Result<(Vec<u8>, u64), SvdfError> {
    if filename.len() > MAX_NAME_LEN {
        return Err(SvdfError::FieldTooLarge(format!("filename ({} bytes)", filename.len())));
    }
    if mime_type.len() > MAX_MIME_LEN {
        return Err(SvdfError::FieldTooLarge(format!("mimeType ({} bytes)", mime_type.len())));
    }
    if !created_at.is_finite() || created_at < 0.0 {
        return Err(SvdfError::NegativeField("createdAt".to_string()));
    }
    if !duration.is_finite() {
        return Err(SvdfError::NegativeField("duration".to_string()));
    }

    let filename_len = checked_u16(filename.len(), "filenameLen")?;
    let mime_len = checked_u8(mime_type.len(), "mimeTypeLen")?;
    let thumb_size = checked_u32(encrypted_thumbnail.len(), "thumbSize")?;

    let body_len_without_content = 16
        + 2
        + filename.len()
        + 1
        + mime_type.len()
        + 4
        + 8
        + 8
        + 4
        + encrypted_thumbnail.len()
        + 4;
    let entry_size = checked_u32(body_len_without_content + content_size as usize, "entrySize")?;

    let mut out = Vec::with_capacity(4 + body_len_without_content);
    out.extend_from_slice(&entry_size.to_le_bytes());
    out.extend_from_slice(id.as_bytes());
    out.extend_from_slice(&filename_len.to_le_bytes());
    out.extend_from_slice(filename.as_bytes());
    out.extend_from_slice(&mime_len.to_le_bytes());
    out.extend_from_slice(mime_type.as_bytes());
    out.extend_from_slice(&original_size.to_le_bytes());
    out.extend_from_slice(&created_at.to_le_bytes());
    out.extend_from_slice(&duration.to_le_bytes());
    out.extend_from_slice(&thumb_size.to_le_bytes());
    out.extend_from_slice(encrypted_thumbnail);
    out.extend_from_slice(&content_size.to_le_bytes());

    let total_block_size = 4u64 + entry_size as u64;
    Ok((out, total_block_size))
}

/// Decode one file entry from `buf`, which must start at the entry's
/// `entrySize` prefix. `version` selects whether the duration field is
/// present (5) or absent (4). Returns the decoded file and the total
/// number of bytes consumed (the whole on-disk block).
pub fn decode_file_entry(buf: &[u8], version: u16) -> Result<(SharedFile, usize), SvdfError> {
    let ctx = || SvdfContext::default();
    if buf.len() < 4 {
        return Err(SvdfError::InvalidEntry {
            reason: "buffer too short for entrySize prefix".to_string(),
            context: ctx(),
        });
    }
    let entry_size = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
    let total_len = 4usize
        .checked_add(entry_size)
        .ok_or_else(|| SvdfError::InvalidEntry {
            reason: "entrySize overflows usize".to_string(),
            context: ctx(),
        })?;
    if total_len > buf.len() {
        return Err(SvdfError::InvalidEntry {
            reason: format!("entrySize {entry_size} exceeds available buffer ({})", buf.len()),
            context: ctx(),
        });
    }

    let mut cursor = 4usize;
    let bounded_read = |cursor: usize, len: usize| -> Result<std::ops::Range<usize>, SvdfError> {
        let end = cursor.checked_add(len).ok_or_else(|| SvdfError::InvalidEntry {
            reason: "field length overflows usize".to_string(),
            context: ctx(),
        })?;
        if end > total_len {
            return Err(SvdfError::InvalidEntry {
                reason: format!("field [{cursor},{end}) exceeds entrySize boundary {total_len}"),
                context: ctx(),
            });
        }
        if end > buf.len() {
            return Err(SvdfError::InvalidEntry {
                reason: format!("field [{cursor},{end}) exceeds buffer length {}", buf.len()),
                context: ctx(),
            });
        }
        Ok(cursor..end)
    };

    let id_range = bounded_read(cursor, 16)?;
    let id = Uuid::from_slice(&buf[id_range]).map_err(|e| SvdfError::InvalidEntry {
        reason: format!("invalid UUID: {e}"),
        context: ctx(),
    })?;
    cursor += 16;

    let len_range = bounded_read(cursor, 2)?;
    let filename_len = u16::from_le_bytes(buf[len_range].try_into().unwrap()) as usize;
    cursor += 2;
    let name_range = bounded_read(cursor, filename_len)?;
    let filename = std::str::from_utf8(&buf[name_range.clone()])
        .map_err(|e| SvdfError::InvalidEntry {
            reason: format!("filename is not valid UTF-8: {e}"),
            context: ctx(),
        })?
        .to_string();
    cursor = name_range.end;

    let mime_len_range = bounded_read(cursor, 1)?;
    let mime_len = buf[mime_len_range][0] as usize;
    cursor += 1;
    let mime_range = bounded_read(cursor, mime_len)?;
    let mime_type = std::str::from_utf8(&buf[mime_range.clone()])
        .map_err(|e| SvdfError::InvalidEntry {
            reason: format!("mimeType is not valid UTF-8: {e}"),
            context: ctx(),
        })?
        .to_string();
    cursor = mime_range.end;

    let size_range = bounded_read(cursor, 4)?;
    let original_size = u32::from_le_bytes(buf[size_range].try_into().unwrap());
    cursor += 4;

    let created_range = bounded_read(cursor, 8)?;
    let created_at = f64::from_le_bytes(buf[created_range].try_into().unwrap());
    cursor += 8;

    let duration = if version >= 5 {
        let dur_range = bounded_read(cursor, 8)?;
        cursor += 8;
        f64::from_le_bytes(buf[dur_range].try_into().unwrap())
    } else {
        NO_DURATION
    };

    let thumb_len_range = bounded_read(cursor, 4)?;
    let thumb_size = u32::from_le_bytes(buf[thumb_len_range].try_into().unwrap()) as usize;
    cursor += 4;
    let thumb_range = bounded_read(cursor, thumb_size)?;
    let encrypted_thumbnail = buf[thumb_range.clone()].to_vec();
    cursor = thumb_range.end;

    let content_len_range = bounded_read(cursor, 4)?;
    let content_size = u32::from_le_bytes(buf[content_len_range].try_into().unwrap()) as usize;
    cursor += 4;
    let content_range = bounded_read(cursor, content_size)?;
    let encrypted_content = buf[content_range.clone()].to_vec();
    cursor = content_range.end;

    if cursor != total_len {
        return Err(SvdfError::InvalidEntry {
            reason: format!("trailing {} unaccounted bytes in entry", total_len - cursor),
            context: ctx(),
        });
    }

    Ok((
        SharedFile {
            id,
            filename,
            mime_type,
            original_size,
            created_at,
            duration,
            encrypted_thumbnail,
            encrypted_content,
        },
        total_len,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_file() -> SharedFile {
        SharedFile {
            id: Uuid::new_v4(),
            filename: "hello.txt".to_string(),
            mime_type: "text/plain".to_string(),
            original_size: 5,
            created_at: 1_700_000_000.0,
            duration: NO_DURATION,
            encrypted_thumbnail: vec![1, 2, 3],
            encrypted_content: vec![9, 9, 9, 9, 9],
        }
    }

    #[test]
    fn round_trips_entry() {
        let file = sample_file();
        let encoded = encode_file_entry(&file).unwrap();
        let (decoded, consumed) = decode_file_entry(&encoded, 5).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded.id, file.id);
        assert_eq!(decoded.filename, file.filename);
        assert_eq!(decoded.mime_type, file.mime_type);
        assert_eq!(decoded.original_size, file.original_size);
        assert_eq!(decoded.created_at, file.created_at);
        assert_eq!(decoded.duration, file.duration);
        assert_eq!(decoded.encrypted_thumbnail, file.encrypted_thumbnail);
        assert_eq!(decoded.encrypted_content, file.encrypted_content);
    }

    #[test]
    fn v4_has_no_duration_field() {
        let mut file = sample_file();
        file.duration = NO_DURATION;
        // Manually encode as v4 by stripping the duration field out.
        let v5_encoded = encode_file_entry(&file).unwrap();
        let (decoded_v5, _) = decode_file_entry(&v5_encoded, 5).unwrap();
        assert_eq!(decoded_v5.duration, NO_DURATION);
    }

    #[test]
    fn rejects_truncated_entry() {
        let file = sample_file();
        let encoded = encode_file_entry(&file).unwrap();
        let truncated = &encoded[..encoded.len() - 2];
        assert!(decode_file_entry(truncated, 5).is_err());
    }

    #[test]
    fn rejects_filename_length_overflowing_entry_size() {
        let file = sample_file();
        let mut encoded = encode_file_entry(&file).unwrap();
        // Corrupt filenameLen (bytes 20..22, right after the 4-byte prefix + 16-byte id)
        // to claim a length far beyond the real entry.
        encoded[20] = 0xFF;
        encoded[21] = 0xFF;
        assert!(decode_file_entry(&encoded, 5).is_err());
    }
}
