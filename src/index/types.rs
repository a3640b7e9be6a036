//! Record types stored in the local index.

use serde::Serialize;

/// Kind of a media item, from the type code of its wire entry.
///
/// 1-byte enum; stored as a short string in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo = 0,
    Video = 1,
    /// Type code the client does not recognize; kept so listings stay complete.
    Unknown = 2,
}

impl MediaKind {
    /// Convert to the string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Photo => "photo",
            Self::Video => "video",
            Self::Unknown => "unknown",
        }
    }

    /// Parse from the string stored in the database.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "photo" => Some(Self::Photo),
            "video" => Some(Self::Video),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }

    /// Map the wire type code.
    pub fn from_code(code: u64) -> Self {
        match code {
            1 => Self::Photo,
            2 => Self::Video,
            _ => Self::Unknown,
        }
    }
}

/// How a media item entered the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
#[serde(rename_all = "snake_case")]
pub enum MediaOrigin {
    OwnUpload = 0,
    Partner = 1,
    Shared = 2,
    Unknown = 3,
}

impl MediaOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OwnUpload => "own_upload",
            Self::Partner => "partner",
            Self::Shared => "shared",
            Self::Unknown => "unknown",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "own_upload" => Some(Self::OwnUpload),
            "partner" => Some(Self::Partner),
            "shared" => Some(Self::Shared),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }

    /// Map the wire origin code (1 = own upload, 3 = partner, 4 = shared).
    pub fn from_code(code: u64) -> Self {
        match code {
            1 => Self::OwnUpload,
            3 => Self::Partner,
            4 => Self::Shared,
            _ => Self::Unknown,
        }
    }
}

/// One media item mirrored from the remote library.
///
/// Fields are ordered for memory layout: heap types first, then 8-byte
/// primitives, 4-byte primitives, 1-byte enums, and booleans at the end.
#[derive(Debug, Clone, Serialize)]
pub struct MediaItem {
    // Heap types
    /// Stable server-assigned identifier. Unique in the index.
    pub media_key: String,
    /// File name as uploaded; not unique.
    pub file_name: String,
    /// Content-derived key used for trash operations and name disambiguation.
    pub dedup_key: String,
    pub location_name: Option<String>,
    pub location_id: Option<String>,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,

    // 8-byte primitives
    pub size_bytes: i64,
    /// Capture time, milliseconds since epoch, as reported by the server.
    pub utc_timestamp: i64,
    pub timezone_offset: i64,
    pub server_creation_timestamp: i64,
    pub upload_status: i64,
    pub quota_charged_bytes: i64,
    pub content_version: i64,
    pub trash_timestamp: Option<i64>,
    pub duration_ms: Option<i64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,

    // 4-byte primitives
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub micro_video_width: Option<u32>,
    pub micro_video_height: Option<u32>,

    // 1-byte enums
    pub kind: MediaKind,
    pub origin: MediaOrigin,

    // Booleans grouped at the end
    pub is_canonical: bool,
    pub is_archived: bool,
    pub is_favorite: bool,
    pub is_locked: bool,
    pub is_original_quality: bool,
    pub is_edited: bool,
    pub is_micro_video: bool,
}

impl MediaItem {
    /// A minimal item with required identity fields; everything else defaulted.
    /// Mapping code fills in whatever the wire entry carries.
    pub fn new(media_key: String, file_name: String, dedup_key: String, kind: MediaKind) -> Self {
        Self {
            media_key,
            file_name,
            dedup_key,
            location_name: None,
            location_id: None,
            camera_make: None,
            camera_model: None,
            size_bytes: 0,
            utc_timestamp: 0,
            timezone_offset: 0,
            server_creation_timestamp: 0,
            upload_status: 0,
            quota_charged_bytes: 0,
            content_version: 0,
            trash_timestamp: None,
            duration_ms: None,
            latitude: None,
            longitude: None,
            width: None,
            height: None,
            micro_video_width: None,
            micro_video_height: None,
            kind,
            origin: MediaOrigin::Unknown,
            is_canonical: true,
            is_archived: false,
            is_favorite: false,
            is_locked: false,
            is_original_quality: false,
            is_edited: false,
            is_micro_video: false,
        }
    }

    /// True when the item sits in the remote trash.
    pub fn is_trashed(&self) -> bool {
        self.trash_timestamp.is_some()
    }
}

/// The singleton sync cursor persisted alongside the items.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncCursor {
    /// Opaque point in the remote change history; empty means "from the
    /// beginning".
    pub state_token: String,
    /// Pagination continuation from an interrupted multi-page response;
    /// empty when no pagination is in flight.
    pub page_token: String,
    /// Unix seconds of the last completed refresh; 0 when never synced.
    pub last_sync: i64,
    /// True once the initial full sync has drained every page.
    pub init_complete: bool,
}

/// A partial cursor update. `None` leaves the field unchanged; `Some`
/// sets it, including `Some(String::new())` to explicitly clear a token.
#[derive(Debug, Clone, Default)]
pub struct CursorUpdate {
    pub state_token: Option<String>,
    pub page_token: Option<String>,
    pub last_sync: Option<i64>,
    pub init_complete: Option<bool>,
}

impl CursorUpdate {
    /// Apply this update over an existing cursor.
    pub fn apply_to(&self, cursor: &mut SyncCursor) {
        if let Some(v) = &self.state_token {
            cursor.state_token = v.clone();
        }
        if let Some(v) = &self.page_token {
            cursor.page_token = v.clone();
        }
        if let Some(v) = self.last_sync {
            cursor.last_sync = v;
        }
        if let Some(v) = self.init_complete {
            cursor.init_complete = v;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.state_token.is_none()
            && self.page_token.is_none()
            && self.last_sync.is_none()
            && self.init_complete.is_none()
    }
}
