//! Mapping from decoded wire messages to typed records.
//!
//! Navigation uses the named field paths in [`crate::wire::fields`]. A
//! malformed individual item fails only that item; a malformed envelope
//! fails the whole page.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use thiserror::Error;
use tracing::warn;

use crate::index::{MediaItem, MediaKind, MediaOrigin};
use crate::wire::fields::{
    deletion, envelope, item, location, media_type, metadata, micro_video, photo, property, video,
};
use crate::wire::Message;

#[derive(Debug, Error)]
pub enum MapError {
    #[error("malformed envelope: {0}")]
    Envelope(String),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

/// One parsed page of a library-state response.
#[derive(Debug, Clone, Default)]
pub struct LibraryPage {
    /// State token for this point in the change history; may be empty on
    /// intermediate pages.
    pub state_token: String,
    /// Continuation token; empty on the final page.
    pub next_page_token: String,
    pub items: Vec<MediaItem>,
    pub deleted_keys: Vec<String>,
}

/// Derive a dedup key from raw content-hash bytes.
pub fn dedup_key_from_hash(hash: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(hash)
}

/// Parse a full library-state response body.
///
/// Individual item or deletion entries that fail to parse are skipped and
/// logged; the page survives. A body that does not decode, or that lacks
/// the envelope submessage entirely, is fatal to the page.
pub fn parse_library_update(body: &[u8]) -> Result<LibraryPage, MapError> {
    let outer = Message::decode(body).map_err(|e| MapError::Envelope(e.to_string()))?;
    let body = outer
        .message(envelope::BODY)
        .ok_or_else(|| MapError::Envelope("missing envelope body".into()))?;

    let state_token = body.str(envelope::STATE_TOKEN).unwrap_or_default().to_string();
    let next_page_token = body
        .str(envelope::NEXT_PAGE_TOKEN)
        .unwrap_or_default()
        .to_string();

    let mut items = Vec::new();
    for raw in body.bytes_all(envelope::ITEMS) {
        let parsed = Message::decode(raw)
            .map_err(|e| MapError::Envelope(e.to_string()))
            .and_then(|m| parse_media_item(&m));
        match parsed {
            Ok(item) => items.push(item),
            Err(e) => warn!(error = %e, "skipping unparseable media item"),
        }
    }

    let mut deleted_keys = Vec::new();
    for raw in body.bytes_all(envelope::DELETIONS) {
        match Message::decode(raw) {
            Ok(m) => {
                if let Some(key) = parse_deletion(&m) {
                    deleted_keys.push(key);
                }
            }
            Err(e) => warn!(error = %e, "skipping unparseable deletion entry"),
        }
    }

    Ok(LibraryPage {
        state_token,
        next_page_token,
        items,
        deleted_keys,
    })
}

/// Parse one media-item entry.
///
/// Required: media key, metadata submessage, type descriptor, file name.
/// Everything else is best-effort.
pub fn parse_media_item(msg: &Message) -> Result<MediaItem, MapError> {
    let media_key = msg
        .str(item::MEDIA_KEY)
        .ok_or(MapError::MissingField("media key"))?
        .to_string();
    let meta = msg
        .message(item::METADATA)
        .ok_or(MapError::MissingField("metadata"))?;
    let type_desc = msg
        .message(item::TYPE)
        .ok_or(MapError::MissingField("type descriptor"))?;
    let kind = MediaKind::from_code(
        type_desc
            .uint(media_type::CODE)
            .ok_or(MapError::MissingField("type code"))?,
    );

    let file_name = file_name_from(&meta).ok_or(MapError::MissingField("file name"))?;
    let dedup_key = dedup_key_from(&meta, &media_key);

    let mut out = MediaItem::new(media_key, file_name, dedup_key, kind);

    // Canonical status is not a flag; a property entry with a specific code
    // marks the non-canonical copies.
    for prop in meta.messages(metadata::PROPERTIES) {
        if prop.uint(property::CODE) == Some(property::CODE_NON_CANONICAL) {
            out.is_canonical = false;
        }
    }

    out.size_bytes = meta.int64(metadata::SIZE_BYTES).unwrap_or(0);
    out.utc_timestamp = meta.int64(metadata::UTC_TIMESTAMP).unwrap_or(0);
    out.timezone_offset = meta.int64(metadata::TIMEZONE_OFFSET).unwrap_or(0);
    out.server_creation_timestamp = meta
        .int64(metadata::SERVER_CREATION_TIMESTAMP)
        .unwrap_or(0);
    out.upload_status = meta.int64(metadata::UPLOAD_STATUS).unwrap_or(0);
    out.content_version = meta.int64(metadata::CONTENT_VERSION).unwrap_or(0);
    out.trash_timestamp = meta
        .message(metadata::TRASH)
        .and_then(|t| t.int64(metadata::TRASH_TIMESTAMP));

    if let Some(quota) = meta.message(metadata::QUOTA) {
        out.quota_charged_bytes = quota.int64(metadata::QUOTA_CHARGED_BYTES).unwrap_or(0);
        out.is_original_quality = quota.uint(metadata::QUOTA_QUALITY) == Some(2);
    }

    if let Some(code) = flag_value(&meta, metadata::ORIGIN) {
        out.origin = MediaOrigin::from_code(code);
    }
    out.is_archived = flag_value(&meta, metadata::ARCHIVED).unwrap_or(0) != 0;
    out.is_favorite = flag_value(&meta, metadata::FAVORITE).unwrap_or(0) != 0;
    out.is_locked = flag_value(&meta, metadata::LOCKED).unwrap_or(0) != 0;

    if let Some(p) = type_desc.message(media_type::PHOTO) {
        out.is_edited = p.has(photo::EDIT);
        if let Some(dims) = p.message_at(&[photo::CONTENT, photo::DIMENSIONS]) {
            out.width = dims.uint(photo::WIDTH).map(|v| v as u32);
            out.height = dims.uint(photo::HEIGHT).map(|v| v as u32);
            if let Some(exif) = dims.message(photo::EXIF) {
                out.camera_make = exif.str(photo::CAMERA_MAKE).map(str::to_string);
                out.camera_model = exif.str(photo::CAMERA_MODEL).map(str::to_string);
            }
        }
    }

    if let Some(v) = type_desc.message_at(&[media_type::VIDEO, video::PLAYBACK]) {
        out.duration_ms = v.int64(video::DURATION_MS);
        out.width = v.uint(video::WIDTH).map(|w| w as u32).or(out.width);
        out.height = v.uint(video::HEIGHT).map(|h| h as u32).or(out.height);
    }

    // A micro video is identified by its detail submessage, not by the
    // mere presence of the micro-video field.
    if let Some(detail) = type_desc.message_at(&[
        media_type::MICRO_VIDEO,
        micro_video::DETAIL,
        micro_video::DIMENSIONS,
    ]) {
        out.is_micro_video = true;
        out.duration_ms = detail.int64(micro_video::DURATION_MS).or(out.duration_ms);
        out.micro_video_width = detail.uint(micro_video::WIDTH).map(|v| v as u32);
        out.micro_video_height = detail.uint(micro_video::HEIGHT).map(|v| v as u32);
    }

    if let Some(loc) = msg.message(item::LOCATION) {
        if let Some(coords) = loc.message(location::COORDINATES) {
            // Coordinates ride in fixed32 fields as f32 bit patterns.
            out.latitude = coords
                .fixed32(location::LATITUDE)
                .map(|v| f64::from(f32::from_bits(v)));
            out.longitude = coords
                .fixed32(location::LONGITUDE)
                .map(|v| f64::from(f32::from_bits(v)));
        }
        if let Some(place) = loc.message(location::PLACE) {
            out.location_name = place
                .message(location::PLACE_NAME)
                .and_then(|n| n.str(location::PLACE_NAME_TEXT).map(str::to_string));
            out.location_id = place.str(location::PLACE_ID).map(str::to_string);
        }
    }

    Ok(out)
}

/// Parse one deletion entry. Only the media deletion type code yields a
/// key; other deletion types (albums, memories, ...) are ignored.
pub fn parse_deletion(msg: &Message) -> Option<String> {
    let body = msg.message(deletion::BODY)?;
    if body.uint(deletion::TYPE_CODE)? != deletion::TYPE_MEDIA {
        return None;
    }
    body.message(deletion::TARGET)?
        .str(deletion::TARGET_MEDIA_KEY)
        .map(str::to_string)
}

/// The file name is usually a plain string, but some items wrap it in a
/// submessage carrying the string at an inner field.
fn file_name_from(meta: &Message) -> Option<String> {
    if let Some(wrapper) = meta.message(metadata::FILE_NAME) {
        if let Some(name) = wrapper.str(metadata::FILE_NAME_NESTED) {
            return Some(name.to_string());
        }
    }
    meta.str(metadata::FILE_NAME).map(str::to_string)
}

/// Dedup key precedence: the explicit key submessage, else a key derived
/// from the content hash, else the media key itself.
///
/// Within the key submessage the string lives under an entry whose field
/// number starts with the digit 1; other entries are unrelated.
fn dedup_key_from(meta: &Message, media_key: &str) -> String {
    if let Some(wrapper) = meta.message(metadata::DEDUP_KEY) {
        for (field, _) in wrapper.iter() {
            if field.to_string().starts_with('1') {
                if let Some(key) = wrapper.str(field) {
                    return key.to_string();
                }
            }
        }
    }
    if let Some(hash) = meta
        .message(metadata::CONTENT_HASH)
        .and_then(|h| h.bytes(metadata::CONTENT_HASH_BYTES).map(|b| b.to_vec()))
    {
        if !hash.is_empty() {
            return dedup_key_from_hash(&hash);
        }
    }
    media_key.to_string()
}

fn flag_value(meta: &Message, field: u32) -> Option<u64> {
    meta.message(field).and_then(|m| m.uint(metadata::FLAG))
}
