//! Database schema and migrations for the local index.

use rusqlite::Connection;

use super::error::IndexError;

/// Current schema version, stored in the SQLite `user_version` pragma.
pub const SCHEMA_VERSION: i32 = 1;

/// Version 1 schema.
///
/// `media_items` mirrors the remote library one row per media key.
/// `sync_state` holds exactly one row (id = 1) with the sync cursor.
const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS media_items (
    media_key TEXT PRIMARY KEY NOT NULL,
    file_name TEXT NOT NULL,
    dedup_key TEXT NOT NULL,
    kind TEXT NOT NULL,
    origin TEXT NOT NULL,
    size_bytes INTEGER NOT NULL DEFAULT 0,
    utc_timestamp INTEGER NOT NULL DEFAULT 0,
    timezone_offset INTEGER NOT NULL DEFAULT 0,
    server_creation_timestamp INTEGER NOT NULL DEFAULT 0,
    upload_status INTEGER NOT NULL DEFAULT 0,
    quota_charged_bytes INTEGER NOT NULL DEFAULT 0,
    content_version INTEGER NOT NULL DEFAULT 0,
    trash_timestamp INTEGER,
    duration_ms INTEGER,
    latitude REAL,
    longitude REAL,
    location_name TEXT,
    location_id TEXT,
    camera_make TEXT,
    camera_model TEXT,
    width INTEGER,
    height INTEGER,
    micro_video_width INTEGER,
    micro_video_height INTEGER,
    is_canonical INTEGER NOT NULL DEFAULT 1,
    is_archived INTEGER NOT NULL DEFAULT 0,
    is_favorite INTEGER NOT NULL DEFAULT 0,
    is_locked INTEGER NOT NULL DEFAULT 0,
    is_original_quality INTEGER NOT NULL DEFAULT 0,
    is_edited INTEGER NOT NULL DEFAULT 0,
    is_micro_video INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_media_items_file_name ON media_items(file_name);
CREATE INDEX IF NOT EXISTS idx_media_items_dedup_key ON media_items(dedup_key);

CREATE TABLE IF NOT EXISTS sync_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    state_token TEXT NOT NULL DEFAULT '',
    page_token TEXT NOT NULL DEFAULT '',
    last_sync INTEGER NOT NULL DEFAULT 0,
    init_complete INTEGER NOT NULL DEFAULT 0
);
"#;

/// Run pending migrations. Idempotent: checks `user_version` and applies
/// only the steps not yet present.
pub fn migrate(conn: &Connection) -> Result<(), IndexError> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if version > SCHEMA_VERSION {
        return Err(IndexError::UnsupportedSchemaVersion {
            found: version,
            expected: SCHEMA_VERSION,
        });
    }

    if version < 1 {
        conn.execute_batch(SCHEMA_V1)?;
        conn.pragma_update(None, "user_version", 1)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_fresh_database() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        let version: i32 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        // Tables exist and are usable after a double migration.
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM media_items", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn migrate_rejects_future_schema() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", 99).unwrap();
        let err = migrate(&conn).unwrap_err();
        assert!(matches!(
            err,
            IndexError::UnsupportedSchemaVersion { found: 99, .. }
        ));
    }
}
