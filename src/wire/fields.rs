//! Named field numbers for the messages this client consumes and builds.
//!
//! The protocol has no published schema; these constants were recovered by
//! observing live traffic. Only fields the client actually navigates are
//! named here. Everything else rides along as retained unknown fields.

/// Library-state response envelope.
pub mod envelope {
    /// Envelope body; everything else hangs off this submessage.
    pub const BODY: u32 = 1;

    // Fields within BODY:
    /// Continuation token for the next page (empty or absent on the last page).
    pub const NEXT_PAGE_TOKEN: u32 = 1;
    /// Repeated media-item entries.
    pub const ITEMS: u32 = 2;
    /// Opaque token for the library state this response represents.
    pub const STATE_TOKEN: u32 = 6;
    /// Repeated deletion entries.
    pub const DELETIONS: u32 = 9;
}

/// One media-item entry within the envelope.
pub mod item {
    pub const MEDIA_KEY: u32 = 1;
    pub const METADATA: u32 = 2;
    pub const TYPE: u32 = 5;
    pub const LOCATION: u32 = 17;
}

/// The metadata submessage of a media item (`item::METADATA`).
pub mod metadata {
    /// File name; either a string directly or a submessage carrying the
    /// string in `FILE_NAME_NESTED`.
    pub const FILE_NAME: u32 = 4;
    pub const FILE_NAME_NESTED: u32 = 14;
    /// Repeated property entries; see `property`.
    pub const PROPERTIES: u32 = 5;
    pub const UTC_TIMESTAMP: u32 = 7;
    pub const TIMEZONE_OFFSET: u32 = 8;
    pub const SERVER_CREATION_TIMESTAMP: u32 = 9;
    pub const SIZE_BYTES: u32 = 10;
    pub const UPLOAD_STATUS: u32 = 11;
    /// Content-hash submessage; raw hash bytes at field 1.
    pub const CONTENT_HASH: u32 = 13;
    pub const CONTENT_HASH_BYTES: u32 = 1;
    /// Trash submessage; trash timestamp at field 3.
    pub const TRASH: u32 = 16;
    pub const TRASH_TIMESTAMP: u32 = 3;
    /// Dedup-key submessage; the key string sits under an entry whose
    /// field number starts with the digit 1.
    pub const DEDUP_KEY: u32 = 21;
    pub const CONTENT_VERSION: u32 = 26;
    /// Flag submessages, each with the flag varint at field 1.
    pub const ARCHIVED: u32 = 29;
    pub const ORIGIN: u32 = 30;
    pub const FAVORITE: u32 = 31;
    /// Quota submessage: charged bytes at field 2, quality code at field 3.
    pub const QUOTA: u32 = 35;
    pub const QUOTA_CHARGED_BYTES: u32 = 2;
    pub const QUOTA_QUALITY: u32 = 3;
    pub const LOCKED: u32 = 39;
    /// Common inner field for single-flag submessages.
    pub const FLAG: u32 = 1;
}

/// One entry of `metadata::PROPERTIES`.
pub mod property {
    pub const CODE: u32 = 1;
    /// Property code marking a non-canonical (duplicate-resolved) item.
    pub const CODE_NON_CANONICAL: u64 = 27;
}

/// The type submessage of a media item (`item::TYPE`).
pub mod media_type {
    pub const CODE: u32 = 1;
    pub const PHOTO: u32 = 2;
    pub const VIDEO: u32 = 3;
    pub const MICRO_VIDEO: u32 = 5;

    pub const CODE_PHOTO: u64 = 1;
    pub const CODE_VIDEO: u64 = 2;
}

/// Photo details (`media_type::PHOTO`).
pub mod photo {
    /// Remote-content submessage; dimensions submessage lives at its field 9.
    pub const CONTENT: u32 = 1;
    pub const DIMENSIONS: u32 = 9;
    pub const WIDTH: u32 = 1;
    pub const HEIGHT: u32 = 2;
    /// Presence of this field marks an edited item.
    pub const EDIT: u32 = 4;
    /// Exif submessage nested inside the dimensions submessage.
    pub const EXIF: u32 = 5;
    pub const CAMERA_MAKE: u32 = 1;
    pub const CAMERA_MODEL: u32 = 2;
}

/// Video details (`media_type::VIDEO`).
pub mod video {
    pub const PLAYBACK: u32 = 4;
    pub const DURATION_MS: u32 = 1;
    pub const WIDTH: u32 = 4;
    pub const HEIGHT: u32 = 5;
}

/// Micro-video details (`media_type::MICRO_VIDEO`).
pub mod micro_video {
    /// A micro video is one whose 2 → 4 detail submessage is present.
    pub const DETAIL: u32 = 2;
    pub const DIMENSIONS: u32 = 4;
    pub const DURATION_MS: u32 = 1;
    pub const WIDTH: u32 = 4;
    pub const HEIGHT: u32 = 5;
}

/// Location submessage of a media item (`item::LOCATION`).
pub mod location {
    /// Coordinates submessage: fixed32 lat/lon carrying IEEE-754 single
    /// precision bit patterns, in degrees.
    pub const COORDINATES: u32 = 1;
    pub const LATITUDE: u32 = 1;
    pub const LONGITUDE: u32 = 2;
    /// Place submessage: name at 2→1, place id at 3.
    pub const PLACE: u32 = 5;
    pub const PLACE_NAME: u32 = 2;
    pub const PLACE_NAME_TEXT: u32 = 1;
    pub const PLACE_ID: u32 = 3;
}

/// One deletion entry within the envelope.
pub mod deletion {
    pub const BODY: u32 = 1;
    pub const TYPE_CODE: u32 = 1;
    /// Only this type code is a media deletion; others are ignored.
    pub const TYPE_MEDIA: u64 = 1;
    pub const TARGET: u32 = 2;
    pub const TARGET_MEDIA_KEY: u32 = 1;
}

/// Library-state request.
pub mod state_request {
    pub const BODY: u32 = 1;
    /// Within BODY: resume pagination from this token.
    pub const PAGE_TOKEN: u32 = 4;
    /// Within BODY: fetch changes since this state.
    pub const STATE_TOKEN: u32 = 6;
}

/// Find-by-content-hash request and response.
pub mod hash_lookup {
    pub const BODY: u32 = 1;
    pub const QUERY: u32 = 1;
    pub const HASH_BYTES: u32 = 1;
    pub const OPTIONS: u32 = 2;

    /// Response path to the media key: 1 → 2 → 2 → 1.
    pub const RESULT: u32 = 2;
    pub const RESULT_ITEM: u32 = 2;
    pub const RESULT_MEDIA_KEY: u32 = 1;
}

/// Upload commit request and response.
pub mod commit {
    pub const CONTENT: u32 = 1;
    pub const UPLOAD_RESPONSE: u32 = 1;
    pub const FILE_NAME: u32 = 2;
    pub const HASH_BYTES: u32 = 3;
    pub const TIMESTAMP: u32 = 4;
    pub const TIMESTAMP_SECONDS: u32 = 1;
    pub const TIMESTAMP_NANOS: u32 = 2;
    pub const QUALITY: u32 = 7;

    pub const DEVICE: u32 = 2;
    pub const DEVICE_MODEL: u32 = 3;
    pub const DEVICE_MAKE: u32 = 4;
    pub const DEVICE_API_LEVEL: u32 = 5;

    /// Response paths to the assigned media key.
    pub const RESPONSE_BODY: u32 = 1;
    pub const RESPONSE_MEDIA: u32 = 3;
    pub const RESPONSE_MEDIA_KEY: u32 = 1;
}

/// Trash request.
pub mod trash {
    pub const ACTION: u32 = 2;
    pub const ACTION_TRASH: u64 = 1;
    /// Repeated raw dedup-key bytes.
    pub const DEDUP_KEYS: u32 = 3;
    pub const SCOPE: u32 = 4;
    pub const SCOPE_ALL: u64 = 1;
}

/// Download-URL request and response.
pub mod download {
    pub const TARGET: u32 = 1;
    pub const TARGET_KEY: u32 = 1;
    pub const KEY: u32 = 1;
    pub const OPTIONS: u32 = 2;

    /// Response: body at 1, variants at 5, url submessage at 2 (fallback 3),
    /// nested 6 → 5 holds the url string.
    pub const RESPONSE_BODY: u32 = 1;
    pub const VARIANTS: u32 = 5;
    pub const VARIANT_PRIMARY: u32 = 2;
    pub const VARIANT_FALLBACK: u32 = 3;
    pub const URL_WRAPPER: u32 = 6;
    pub const URL: u32 = 5;
}
