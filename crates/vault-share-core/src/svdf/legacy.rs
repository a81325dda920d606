//! Decode-only support for the pre-SVDF "SharedVaultData" blob format.
//!
//! Before SVDF, a shared vault was a single encrypted blob whose plaintext
//! was either a JSON object or an Apple-style property list, each holding
//! an inline array of files with base64-encoded content. Recipients may
//! still hold links created before the SVDF cutover, so the import engine
//! falls back to this decoder when [`super::reader::is_svdf`] says the
//! decrypted container isn't SVDF. There is no writer: new shares are
//! always SVDF.

use base64::Engine;
use serde::Deserialize;
use tracing::instrument;
use uuid::Uuid;

use crate::model::SharedFile;

use super::entry::NO_DURATION;
use super::SvdfError;

/// Decoded legacy blob, already converted into the same [`SharedFile`]
/// shape the SVDF codec produces, so callers don't need a parallel code
/// path past this point.
#[derive(Debug, Clone)]
pub struct LegacySharedVaultData {
    pub owner_fingerprint: String,
    pub shared_at: f64,
    pub files: Vec<SharedFile>,
}

#[derive(Debug, Deserialize)]
struct JsonSharedVaultData {
    owner_fingerprint: String,
    shared_at: f64,
    files: Vec<JsonLegacyFile>,
}

#[derive(Debug, Deserialize)]
struct JsonLegacyFile {
    id: Uuid,
    filename: String,
    mime_type: String,
    original_size: u32,
    created_at: f64,
    #[serde(default)]
    encrypted_thumbnail: String,
    encrypted_content: String,
}

impl JsonLegacyFile {
    fn into_shared_file(self) -> Result<SharedFile, SvdfError> {
        let encrypted_thumbnail = decode_base64_field(&self.encrypted_thumbnail, "encryptedThumbnail")?;
        let encrypted_content = decode_base64_field(&self.encrypted_content, "encryptedContent")?;
        Ok(SharedFile {
            id: self.id,
            filename: self.filename,
            mime_type: self.mime_type,
            original_size: self.original_size,
            created_at: self.created_at,
            duration: NO_DURATION,
            encrypted_thumbnail,
            encrypted_content,
        })
    }
}

fn decode_base64_field(value: &str, field: &str) -> Result<Vec<u8>, SvdfError> {
    if value.is_empty() {
        return Ok(Vec::new());
    }
    base64::engine::general_purpose::STANDARD
        .decode(value)
        .map_err(|e| SvdfError::InvalidManifest(format!("legacy field {field} is not valid base64: {e}")))
}

/// Decodes a plaintext legacy "SharedVaultData" blob, trying JSON first and
/// falling back to the minimal plist-XML form. `plaintext` is the already
/// decrypted body (decryption itself is unchanged: legacy blobs use the
/// same [`crate::crypto::Crypto::decrypt`] envelope as everything else).
#[instrument(level = "debug", skip(plaintext))]
pub fn decode_shared_vault_data(plaintext: &[u8]) -> Result<LegacySharedVaultData, SvdfError> {
    if let Ok(json) = serde_json::from_slice::<JsonSharedVaultData>(plaintext) {
        let files = json
            .files
            .into_iter()
            .map(JsonLegacyFile::into_shared_file)
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(LegacySharedVaultData {
            owner_fingerprint: json.owner_fingerprint,
            shared_at: json.shared_at,
            files,
        });
    }
    decode_plist(plaintext)
}

/// A deliberately narrow plist-XML decoder: just enough structure to read
/// the flat `SharedVaultData` dictionary this format actually used
/// (`ownerFingerprint` string, `sharedAt` real, `files` array of file
/// dicts), not a general Apple plist implementation.
fn decode_plist(plaintext: &[u8]) -> Result<LegacySharedVaultData, SvdfError> {
    let text = std::str::from_utf8(plaintext)
        .map_err(|e| SvdfError::InvalidManifest(format!("legacy plist is not valid UTF-8: {e}")))?;

    let root = tag_body(text, "dict", 0)
        .ok_or_else(|| SvdfError::InvalidManifest("legacy plist missing root <dict>".to_string()))?;

    let owner_fingerprint = dict_string(root, "ownerFingerprint")
        .ok_or_else(|| SvdfError::InvalidManifest("legacy plist missing ownerFingerprint".to_string()))?;
    let shared_at = dict_real(root, "sharedAt")
        .ok_or_else(|| SvdfError::InvalidManifest("legacy plist missing sharedAt".to_string()))?;

    let files_array = dict_value_body(root, "files", "array")
        .ok_or_else(|| SvdfError::InvalidManifest("legacy plist missing files array".to_string()))?;

    let mut files = Vec::new();
    let mut cursor = 0;
    while let Some(file_dict) = tag_body(files_array, "dict", cursor) {
        let consumed_end = find_tag_end(files_array, "dict", cursor)
            .ok_or_else(|| SvdfError::InvalidManifest("unterminated legacy file dict".to_string()))?;
        files.push(decode_plist_file(file_dict)?);
        cursor = consumed_end;
    }

    Ok(LegacySharedVaultData { owner_fingerprint, shared_at, files })
}

fn decode_plist_file(dict: &str) -> Result<SharedFile, SvdfError> {
    let id_str = dict_string(dict, "id")
        .ok_or_else(|| SvdfError::InvalidManifest("legacy file missing id".to_string()))?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| SvdfError::InvalidManifest(format!("legacy file id is not a UUID: {e}")))?;
    let filename = dict_string(dict, "filename")
        .ok_or_else(|| SvdfError::InvalidManifest("legacy file missing filename".to_string()))?;
    let mime_type = dict_string(dict, "mimeType")
        .ok_or_else(|| SvdfError::InvalidManifest("legacy file missing mimeType".to_string()))?;
    let original_size = dict_real(dict, "originalSize")
        .ok_or_else(|| SvdfError::InvalidManifest("legacy file missing originalSize".to_string()))?
        as u32;
    let created_at = dict_real(dict, "createdAt")
        .ok_or_else(|| SvdfError::InvalidManifest("legacy file missing createdAt".to_string()))?;
    let encrypted_thumbnail = dict_data(dict, "encryptedThumbnail").unwrap_or_default();
    let encrypted_content = dict_data(dict, "encryptedContent")
        .ok_or_else(|| SvdfError::InvalidManifest("legacy file missing encryptedContent".to_string()))?;

    Ok(SharedFile {
        id,
        filename,
        mime_type,
        original_size,
        created_at,
        duration: NO_DURATION,
        encrypted_thumbnail,
        encrypted_content,
    })
}

/// Finds `<key>name</key>` at or after `from` and returns the byte range of
/// the immediately following value element's body, plus the tag name.
fn find_key_value<'a>(text: &'a str, key: &str) -> Option<(String, &'a str)> {
    let key_tag = format!("<key>{key}</key>");
    let key_pos = text.find(&key_tag)?;
    let after_key = key_pos + key_tag.len();
    let rest = &text[after_key..];
    let open_start = rest.find('<')?;
    let open_rest = &rest[open_start + 1..];
    let open_end = open_rest.find('>')?;
    let raw_tag = &open_rest[..open_end];
    let tag_name = raw_tag.trim_end_matches('/').to_string();

    if raw_tag.ends_with('/') {
        return Some((tag_name, ""));
    }

    let body_start = open_start + 1 + open_end + 1;
    let closing = format!("</{tag_name}>");
    let body = &rest[body_start..];
    let close_pos = body.find(&closing)?;
    Some((tag_name, &body[..close_pos]))
}

fn dict_string(dict: &str, key: &str) -> Option<String> {
    let (_, body) = find_key_value(dict, key)?;
    Some(body.to_string())
}

fn dict_real(dict: &str, key: &str) -> Option<f64> {
    let (_, body) = find_key_value(dict, key)?;
    body.trim().parse().ok()
}

fn dict_data(dict: &str, key: &str) -> Option<Vec<u8>> {
    let (_, body) = find_key_value(dict, key)?;
    let cleaned: String = body.chars().filter(|c| !c.is_whitespace()).collect();
    base64::engine::general_purpose::STANDARD.decode(cleaned).ok()
}

/// Returns the body of a named value's tag for `key`, checked against the
/// expected tag name (used for `<array>`/`<dict>`-valued keys).
fn dict_value_body<'a>(dict: &'a str, key: &str, expected_tag: &str) -> Option<&'a str> {
    let (tag, body) = find_key_value(dict, key)?;
    if tag == expected_tag {
        Some(body)
    } else {
        None
    }
}



/// Returns the body of the `tag_index`-th occurrence of `<tag>...</tag>`
/// starting the scan at byte offset `from`, using naive (non-nesting-aware)
/// matching of the *outermost* open/close pair found at that position —
/// sufficient for the flat, non-recursive dicts this format actually uses.
fn tag_body<'a>(text: &'a str, tag: &str, from: usize) -> Option<&'a str> {
    if from > text.len() {
        return None;
    }
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let search = &text[from..];
    let start = search.find(&open)? + from + open.len();
    let end = text[start..].find(&close)? + start;
    Some(&text[start..end])
}

fn find_tag_end(text: &str, tag: &str, from: usize) -> Option<usize> {
    let close = format!("</{tag}>");
    let search = &text[from..];
    let open = format!("<{tag}>");
    let start = search.find(&open)? + from;
    let end = text[start..].find(&close)? + start + close.len();
    Some(end)
}
