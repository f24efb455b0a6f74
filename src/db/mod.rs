mod schema;

use std::fs;
use std::path::Path;

use chrono::NaiveDate;
use log::{info, warn};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::BellError;
use crate::models::{
    BellLogEntry, BellTemplate, DayRow, DayScheduleUpdate, Playlist, PlaylistMode, Track,
};
use crate::ring_spec;
use crate::store::BellStore;
use schema::{CREATE_SCHEMA_SQL, SCHEMA_VERSION};

const DATE_FORMAT: &str = "%Y-%m-%d";

pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// SQLite storage behind an r2d2 pool
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
}

impl Database {
    pub fn open(db_path: &Path) -> Result<Self, BellError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(db_path)
            .with_init(|c| c.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = Pool::builder().max_size(4).build(manager)?;

        let db = Self { pool };
        db.ensure_schema()?;

        info!("Database opened at: {}", db_path.display());
        Ok(db)
    }

    pub fn get_connection(&self) -> Result<DbConnection, BellError> {
        Ok(self.pool.get()?)
    }

    fn ensure_schema(&self) -> Result<(), BellError> {
        let conn = self.get_connection()?;
        conn.execute_batch(CREATE_SCHEMA_SQL)?;

        let stored_version: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match stored_version.as_deref() {
            Some(SCHEMA_VERSION) => Ok(()), // Schema is up to date
            Some(other) => Err(BellError::Error(format!(
                "Schema version mismatch: database has {}, expected {}",
                other, SCHEMA_VERSION
            ))),
            None => {
                conn.execute(
                    "INSERT INTO meta (key, value) VALUES ('schema_version', ?)",
                    [SCHEMA_VERSION],
                )?;
                Ok(())
            }
        }
    }

    // ========================================
    // Admin-side operations
    // ========================================

    /// Insert a bell template. The ring spec is validated strictly and stored
    /// in its normalized form.
    pub fn insert_template(
        &self,
        name: &str,
        description: Option<&str>,
        color: Option<&str>,
        json_spec: &str,
    ) -> Result<i64, BellError> {
        let spec = ring_spec::validate(json_spec)?;
        let normalized = serde_json::to_string(&spec)?;

        let conn = self.get_connection()?;
        let id = conn.query_row(
            "INSERT INTO bell_templates (name, description, color, json_spec)
             VALUES (?, ?, ?, ?)
             RETURNING id",
            params![name, description, color, normalized],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn get_template(&self, template_id: i64) -> Result<Option<BellTemplate>, BellError> {
        let conn = self.get_connection()?;
        conn.query_row(
            "SELECT id, name, description, color, json_spec FROM bell_templates WHERE id = ?",
            [template_id],
            |row| {
                Ok(BellTemplate {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    description: row.get(2)?,
                    color: row.get(3)?,
                    json_spec: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(BellError::DatabaseError)
    }

    /// Delete a template. Days referencing it keep their row with the
    /// reference nulled.
    pub fn delete_template(&self, template_id: i64) -> Result<bool, BellError> {
        let conn = self.get_connection()?;
        let deleted = conn.execute("DELETE FROM bell_templates WHERE id = ?", [template_id])?;
        Ok(deleted > 0)
    }

    pub fn upsert_day(&self, date: NaiveDate, update: &DayScheduleUpdate) -> Result<(), BellError> {
        let conn = self.get_connection()?;
        conn.execute(
            "INSERT INTO day_schedule (date, bell_template_id, playlist_id, is_holiday, note)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(date) DO UPDATE SET
                bell_template_id = excluded.bell_template_id,
                playlist_id      = excluded.playlist_id,
                is_holiday       = excluded.is_holiday,
                note             = excluded.note",
            params![
                date.format(DATE_FORMAT).to_string(),
                update.bell_template_id,
                update.playlist_id,
                update.is_holiday,
                update.note,
            ],
        )?;
        Ok(())
    }

    pub fn insert_playlist(
        &self,
        name: &str,
        mode: PlaylistMode,
        is_active: bool,
        is_default: bool,
    ) -> Result<i64, BellError> {
        let conn = self.get_connection()?;
        if is_default {
            let others = conn.query_row(
                "SELECT COUNT(*) FROM playlists WHERE is_default = 1 AND is_active = 1",
                [],
                |row| row.get::<_, i64>(0),
            )?;
            if others > 0 {
                warn!(
                    "Playlist '{}' is flagged default but {} other default playlist(s) exist",
                    name, others
                );
            }
        }

        let id = conn.query_row(
            "INSERT INTO playlists (name, mode, crossfade_s, is_active, is_default)
             VALUES (?, ?, 0, ?, ?)
             RETURNING id",
            params![name, mode.to_string(), is_active, is_default],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn delete_playlist(&self, playlist_id: i64) -> Result<bool, BellError> {
        let conn = self.get_connection()?;
        let deleted = conn.execute("DELETE FROM playlists WHERE id = ?", [playlist_id])?;
        Ok(deleted > 0)
    }

    pub fn insert_track(
        &self,
        playlist_id: i64,
        file_path: &str,
        title: Option<&str>,
        order_index: i64,
    ) -> Result<i64, BellError> {
        let conn = self.get_connection()?;
        let id = conn.query_row(
            "INSERT INTO tracks (playlist_id, file_path, title, order_index)
             VALUES (?, ?, ?, ?)
             RETURNING id",
            params![playlist_id, file_path, title, order_index],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Most recent bell log entries, newest first
    pub fn recent_bell_log(&self, limit: u32) -> Result<Vec<BellLogEntry>, BellError> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(
            "SELECT ts, action, duration_ms, result, message
             FROM bell_log
             ORDER BY id DESC
             LIMIT ?",
        )?;

        let rows = stmt.query_map([limit], |row| {
            let ts: String = row.get(0)?;
            let result: String = row.get(3)?;
            Ok(BellLogEntry {
                ts: chrono::DateTime::parse_from_rfc3339(&ts)
                    .map(|dt| dt.with_timezone(&chrono::Utc))
                    .map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            0,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?,
                action: row.get(1)?,
                duration_ms: row.get::<_, Option<i64>>(2)?.unwrap_or_default().max(0) as u64,
                result: result.parse().map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        3,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?,
                message: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>()
            .map_err(BellError::DatabaseError)
    }

    fn playlist_from_row(row: &Row) -> rusqlite::Result<Playlist> {
        let mode: String = row.get(2)?;
        Ok(Playlist {
            id: row.get(0)?,
            name: row.get(1)?,
            mode: PlaylistMode::from_db(&mode),
            crossfade_secs: row.get(3)?,
            is_active: row.get(4)?,
            is_default: row.get(5)?,
        })
    }

    fn query_playlist(
        conn: &Connection,
        where_clause: &str,
        params: impl rusqlite::Params,
    ) -> Result<Option<Playlist>, BellError> {
        let sql = format!(
            "SELECT id, name, mode, crossfade_s, is_active, is_default
             FROM playlists
             WHERE {}
             ORDER BY id ASC
             LIMIT 1",
            where_clause
        );
        conn.query_row(&sql, params, Self::playlist_from_row)
            .optional()
            .map_err(BellError::DatabaseError)
    }
}

impl BellStore for Database {
    fn day_row(&self, date: NaiveDate) -> Result<Option<DayRow>, BellError> {
        let conn = self.get_connection()?;
        conn.query_row(
            "SELECT ds.is_holiday, bt.json_spec, ds.playlist_id, ds.note
             FROM day_schedule ds
             LEFT JOIN bell_templates bt ON bt.id = ds.bell_template_id
             WHERE ds.date = ?",
            [date.format(DATE_FORMAT).to_string()],
            |row| {
                Ok(DayRow {
                    date,
                    is_holiday: row.get(0)?,
                    ring_spec_json: row.get(1)?,
                    playlist_id: row.get(2)?,
                    note: row.get(3)?,
                })
            },
        )
        .optional()
        .map_err(BellError::DatabaseError)
    }

    fn default_active_playlist(&self) -> Result<Option<Playlist>, BellError> {
        let conn = self.get_connection()?;
        Self::query_playlist(&conn, "is_default = 1 AND is_active = 1", params![])
    }

    fn playlist(&self, playlist_id: i64) -> Result<Option<Playlist>, BellError> {
        let conn = self.get_connection()?;
        Self::query_playlist(&conn, "id = ?", [playlist_id])
    }

    fn playlist_tracks(&self, playlist_id: i64) -> Result<Vec<Track>, BellError> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(
            "SELECT id, playlist_id, file_path, title, artist, duration_s, order_index
             FROM tracks
             WHERE playlist_id = ?
             ORDER BY order_index ASC, id ASC",
        )?;

        let rows = stmt.query_map([playlist_id], |row| {
            Ok(Track {
                id: row.get(0)?,
                playlist_id: row.get(1)?,
                file_path: row.get(2)?,
                title: row.get(3)?,
                artist: row.get(4)?,
                duration_secs: row.get(5)?,
                order_index: row.get(6)?,
            })
        })?;

        rows.collect::<Result<Vec<_>, _>>()
            .map_err(BellError::DatabaseError)
    }

    fn append_bell_log(&self, entry: &BellLogEntry) -> Result<(), BellError> {
        let conn = self.get_connection()?;
        conn.execute(
            "INSERT INTO bell_log (ts, action, duration_ms, result, message) VALUES (?, ?, ?, ?, ?)",
            params![
                entry.ts_string(),
                entry.action,
                entry.duration_ms as i64,
                entry.result.to_string(),
                entry.message,
            ],
        )?;
        Ok(())
    }
}
