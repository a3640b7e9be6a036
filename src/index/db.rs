//! Local index trait and SQLite implementation.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::error::IndexError;
use super::schema;
use super::types::{CursorUpdate, MediaItem, MediaKind, MediaOrigin, SyncCursor};

/// Counts reported by `stats()`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexStats {
    pub total: u64,
    pub trashed: u64,
    pub photos: u64,
    pub videos: u64,
}

/// Trait for the durable media-item index.
///
/// Object-safe so the sync engine and CLI share it as `Arc<dyn LocalIndex>`.
#[async_trait]
pub trait LocalIndex: Send + Sync {
    /// Read the singleton sync cursor, creating the default row on first use.
    async fn cursor(&self) -> Result<SyncCursor, IndexError>;

    /// Apply a partial cursor update (see [`CursorUpdate`] semantics).
    async fn set_cursor(&self, update: CursorUpdate) -> Result<(), IndexError>;

    /// Apply one sync page atomically: upsert `items`, delete `deleted`,
    /// and update the cursor, all in a single transaction. The cursor is
    /// never persisted ahead of the data it points past.
    async fn apply_page(
        &self,
        items: &[MediaItem],
        deleted: &[String],
        cursor: CursorUpdate,
    ) -> Result<(), IndexError>;

    /// Insert-or-replace a batch of items keyed by media key, all-or-nothing.
    async fn upsert_items(&self, items: &[MediaItem]) -> Result<(), IndexError>;

    /// Delete items by media key, all-or-nothing. Returns rows removed.
    async fn delete_items(&self, keys: &[String]) -> Result<u64, IndexError>;

    /// Point lookup by media key.
    async fn get_by_media_key(&self, key: &str) -> Result<Option<MediaItem>, IndexError>;

    /// All items carrying this exact file name (names are not unique).
    async fn get_by_file_name(&self, name: &str) -> Result<Vec<MediaItem>, IndexError>;

    /// Non-trashed items ordered by capture recency.
    async fn list_recent(&self, limit: Option<u32>) -> Result<Vec<MediaItem>, IndexError>;

    async fn stats(&self) -> Result<IndexStats, IndexError>;
}

/// SQLite implementation of the local index.
pub struct SqliteIndex {
    /// Wrapped in Mutex because rusqlite::Connection is not Sync.
    /// All operations use spawn_blocking to avoid blocking the async runtime.
    conn: Arc<Mutex<Connection>>,
    /// Path to the database file (for error messages).
    path: PathBuf,
}

impl std::fmt::Debug for SqliteIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteIndex")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

const ITEM_COLUMNS: &str = "media_key, file_name, dedup_key, kind, origin, size_bytes, \
     utc_timestamp, timezone_offset, server_creation_timestamp, upload_status, \
     quota_charged_bytes, content_version, trash_timestamp, duration_ms, \
     latitude, longitude, location_name, location_id, camera_make, camera_model, \
     width, height, micro_video_width, micro_video_height, \
     is_canonical, is_archived, is_favorite, is_locked, is_original_quality, \
     is_edited, is_micro_video";

const UPSERT_ITEM: &str = "INSERT INTO media_items (\
     media_key, file_name, dedup_key, kind, origin, size_bytes, \
     utc_timestamp, timezone_offset, server_creation_timestamp, upload_status, \
     quota_charged_bytes, content_version, trash_timestamp, duration_ms, \
     latitude, longitude, location_name, location_id, camera_make, camera_model, \
     width, height, micro_video_width, micro_video_height, \
     is_canonical, is_archived, is_favorite, is_locked, is_original_quality, \
     is_edited, is_micro_video) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, \
     ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31) \
     ON CONFLICT(media_key) DO UPDATE SET \
     file_name = excluded.file_name, \
     dedup_key = excluded.dedup_key, \
     kind = excluded.kind, \
     origin = excluded.origin, \
     size_bytes = excluded.size_bytes, \
     utc_timestamp = excluded.utc_timestamp, \
     timezone_offset = excluded.timezone_offset, \
     server_creation_timestamp = excluded.server_creation_timestamp, \
     upload_status = excluded.upload_status, \
     quota_charged_bytes = excluded.quota_charged_bytes, \
     content_version = excluded.content_version, \
     trash_timestamp = excluded.trash_timestamp, \
     duration_ms = excluded.duration_ms, \
     latitude = excluded.latitude, \
     longitude = excluded.longitude, \
     location_name = excluded.location_name, \
     location_id = excluded.location_id, \
     camera_make = excluded.camera_make, \
     camera_model = excluded.camera_model, \
     width = excluded.width, \
     height = excluded.height, \
     micro_video_width = excluded.micro_video_width, \
     micro_video_height = excluded.micro_video_height, \
     is_canonical = excluded.is_canonical, \
     is_archived = excluded.is_archived, \
     is_favorite = excluded.is_favorite, \
     is_locked = excluded.is_locked, \
     is_original_quality = excluded.is_original_quality, \
     is_edited = excluded.is_edited, \
     is_micro_video = excluded.is_micro_video";

impl SqliteIndex {
    /// Open or create an index at the given path.
    pub async fn open(path: &Path) -> Result<Self, IndexError> {
        let path = path.to_path_buf();
        let path_clone = path.clone();

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path_clone).map_err(|e| IndexError::Open {
                path: path_clone.clone(),
                source: e,
            })?;

            // WAL keeps concurrent readers unblocked during sync writes;
            // NORMAL synchronous is safe under WAL.
            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(IndexError::Migration)?;
            conn.pragma_update(None, "synchronous", "NORMAL")
                .map_err(IndexError::Migration)?;

            schema::migrate(&conn)?;

            Ok::<_, IndexError>(conn)
        })
        .await??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Open an in-memory index (for testing).
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, IndexError> {
        let conn = Connection::open_in_memory().map_err(|e| IndexError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: PathBuf::from(":memory:"),
        })
    }

    /// Run a blocking database operation off the async runtime.
    async fn with_conn<T, F>(&self, op: F) -> Result<T, IndexError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, IndexError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|e| IndexError::Query(e.to_string()))?;
            op(&conn)
        })
        .await?
    }
}

fn row_to_media_item(row: &Row<'_>) -> rusqlite::Result<MediaItem> {
    let kind: String = row.get(3)?;
    let origin: String = row.get(4)?;
    Ok(MediaItem {
        media_key: row.get(0)?,
        file_name: row.get(1)?,
        dedup_key: row.get(2)?,
        kind: MediaKind::from_str(&kind).unwrap_or(MediaKind::Unknown),
        origin: MediaOrigin::from_str(&origin).unwrap_or(MediaOrigin::Unknown),
        size_bytes: row.get(5)?,
        utc_timestamp: row.get(6)?,
        timezone_offset: row.get(7)?,
        server_creation_timestamp: row.get(8)?,
        upload_status: row.get(9)?,
        quota_charged_bytes: row.get(10)?,
        content_version: row.get(11)?,
        trash_timestamp: row.get(12)?,
        duration_ms: row.get(13)?,
        latitude: row.get(14)?,
        longitude: row.get(15)?,
        location_name: row.get(16)?,
        location_id: row.get(17)?,
        camera_make: row.get(18)?,
        camera_model: row.get(19)?,
        width: row.get(20)?,
        height: row.get(21)?,
        micro_video_width: row.get(22)?,
        micro_video_height: row.get(23)?,
        is_canonical: row.get(24)?,
        is_archived: row.get(25)?,
        is_favorite: row.get(26)?,
        is_locked: row.get(27)?,
        is_original_quality: row.get(28)?,
        is_edited: row.get(29)?,
        is_micro_video: row.get(30)?,
    })
}

fn upsert_one(conn: &Connection, item: &MediaItem) -> Result<(), IndexError> {
    let mut stmt = conn.prepare_cached(UPSERT_ITEM).map_err(IndexError::query)?;
    stmt.execute(params![
        item.media_key,
        item.file_name,
        item.dedup_key,
        item.kind.as_str(),
        item.origin.as_str(),
        item.size_bytes,
        item.utc_timestamp,
        item.timezone_offset,
        item.server_creation_timestamp,
        item.upload_status,
        item.quota_charged_bytes,
        item.content_version,
        item.trash_timestamp,
        item.duration_ms,
        item.latitude,
        item.longitude,
        item.location_name,
        item.location_id,
        item.camera_make,
        item.camera_model,
        item.width,
        item.height,
        item.micro_video_width,
        item.micro_video_height,
        item.is_canonical,
        item.is_archived,
        item.is_favorite,
        item.is_locked,
        item.is_original_quality,
        item.is_edited,
        item.is_micro_video,
    ])
    .map_err(IndexError::query)?;
    Ok(())
}

fn delete_one(conn: &Connection, key: &str) -> Result<u64, IndexError> {
    let mut stmt = conn
        .prepare_cached("DELETE FROM media_items WHERE media_key = ?1")
        .map_err(IndexError::query)?;
    let n = stmt.execute([key]).map_err(IndexError::query)?;
    Ok(n as u64)
}

fn ensure_cursor_row(conn: &Connection) -> Result<(), IndexError> {
    conn.execute("INSERT OR IGNORE INTO sync_state (id) VALUES (1)", [])
        .map_err(IndexError::query)?;
    Ok(())
}

fn read_cursor(conn: &Connection) -> Result<SyncCursor, IndexError> {
    ensure_cursor_row(conn)?;
    conn.query_row(
        "SELECT state_token, page_token, last_sync, init_complete FROM sync_state WHERE id = 1",
        [],
        |row| {
            Ok(SyncCursor {
                state_token: row.get(0)?,
                page_token: row.get(1)?,
                last_sync: row.get(2)?,
                init_complete: row.get(3)?,
            })
        },
    )
    .map_err(IndexError::query)
}

fn write_cursor(conn: &Connection, update: &CursorUpdate) -> Result<(), IndexError> {
    if update.is_empty() {
        return Ok(());
    }
    let mut cursor = read_cursor(conn)?;
    update.apply_to(&mut cursor);
    conn.execute(
        "UPDATE sync_state SET state_token = ?1, page_token = ?2, last_sync = ?3, \
         init_complete = ?4 WHERE id = 1",
        params![
            cursor.state_token,
            cursor.page_token,
            cursor.last_sync,
            cursor.init_complete,
        ],
    )
    .map_err(IndexError::query)?;
    Ok(())
}

/// Run `body` inside an immediate transaction, committing on success and
/// rolling back on error.
fn in_transaction<T>(
    conn: &Connection,
    body: impl FnOnce(&Connection) -> Result<T, IndexError>,
) -> Result<T, IndexError> {
    conn.execute("BEGIN IMMEDIATE TRANSACTION", [])
        .map_err(IndexError::query)?;
    match body(conn) {
        Ok(value) => {
            conn.execute("COMMIT", []).map_err(IndexError::query)?;
            Ok(value)
        }
        Err(e) => {
            let _ = conn.execute("ROLLBACK", []);
            Err(e)
        }
    }
}

#[async_trait]
impl LocalIndex for SqliteIndex {
    async fn cursor(&self) -> Result<SyncCursor, IndexError> {
        self.with_conn(read_cursor).await
    }

    async fn set_cursor(&self, update: CursorUpdate) -> Result<(), IndexError> {
        self.with_conn(move |conn| in_transaction(conn, |conn| write_cursor(conn, &update)))
            .await
    }

    async fn apply_page(
        &self,
        items: &[MediaItem],
        deleted: &[String],
        cursor: CursorUpdate,
    ) -> Result<(), IndexError> {
        let items = items.to_vec();
        let deleted = deleted.to_vec();
        self.with_conn(move |conn| {
            in_transaction(conn, |conn| {
                for item in &items {
                    upsert_one(conn, item)?;
                }
                for key in &deleted {
                    delete_one(conn, key)?;
                }
                write_cursor(conn, &cursor)
            })
        })
        .await
    }

    async fn upsert_items(&self, items: &[MediaItem]) -> Result<(), IndexError> {
        if items.is_empty() {
            return Ok(());
        }
        let items = items.to_vec();
        self.with_conn(move |conn| {
            in_transaction(conn, |conn| {
                for item in &items {
                    upsert_one(conn, item)?;
                }
                Ok(())
            })
        })
        .await
    }

    async fn delete_items(&self, keys: &[String]) -> Result<u64, IndexError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let keys = keys.to_vec();
        self.with_conn(move |conn| {
            in_transaction(conn, |conn| {
                let mut removed = 0u64;
                for key in &keys {
                    removed += delete_one(conn, key)?;
                }
                Ok(removed)
            })
        })
        .await
    }

    async fn get_by_media_key(&self, key: &str) -> Result<Option<MediaItem>, IndexError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {ITEM_COLUMNS} FROM media_items WHERE media_key = ?1");
            conn.query_row(&sql, [key], row_to_media_item)
                .optional()
                .map_err(IndexError::query)
        })
        .await
    }

    async fn get_by_file_name(&self, name: &str) -> Result<Vec<MediaItem>, IndexError> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {ITEM_COLUMNS} FROM media_items WHERE file_name = ?1 ORDER BY media_key"
            );
            let mut stmt = conn.prepare_cached(&sql).map_err(IndexError::query)?;
            let rows = stmt
                .query_map([name], row_to_media_item)
                .map_err(IndexError::query)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(IndexError::query)
        })
        .await
    }

    async fn list_recent(&self, limit: Option<u32>) -> Result<Vec<MediaItem>, IndexError> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {ITEM_COLUMNS} FROM media_items WHERE trash_timestamp IS NULL \
                 ORDER BY utc_timestamp DESC, media_key LIMIT ?1"
            );
            let limit: i64 = limit.map(i64::from).unwrap_or(-1);
            let mut stmt = conn.prepare_cached(&sql).map_err(IndexError::query)?;
            let rows = stmt
                .query_map([limit], row_to_media_item)
                .map_err(IndexError::query)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(IndexError::query)
        })
        .await
    }

    async fn stats(&self) -> Result<IndexStats, IndexError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*), \
                 COUNT(trash_timestamp), \
                 SUM(CASE WHEN kind = 'photo' THEN 1 ELSE 0 END), \
                 SUM(CASE WHEN kind = 'video' THEN 1 ELSE 0 END) \
                 FROM media_items",
                [],
                |row| {
                    Ok(IndexStats {
                        total: row.get::<_, i64>(0)? as u64,
                        trashed: row.get::<_, i64>(1)? as u64,
                        photos: row.get::<_, Option<i64>>(2)?.unwrap_or(0) as u64,
                        videos: row.get::<_, Option<i64>>(3)?.unwrap_or(0) as u64,
                    })
                },
            )
            .map_err(IndexError::query)
        })
        .await
    }
}
