use chrono::NaiveDate;

use crate::error::BellError;
use crate::models::{BellLogEntry, DayRow, Playlist, Track};

/// Storage queries the scheduling core depends on.
///
/// Implemented by [`crate::db::Database`]; tests use in-memory doubles.
pub trait BellStore: Send + Sync {
    /// The schedule row for `date`, joined with its template's ring spec
    fn day_row(&self, date: NaiveDate) -> Result<Option<DayRow>, BellError>;

    /// The playlist flagged default and active. If several are flagged, the
    /// lowest id wins.
    fn default_active_playlist(&self) -> Result<Option<Playlist>, BellError>;

    fn playlist(&self, playlist_id: i64) -> Result<Option<Playlist>, BellError>;

    /// Tracks of a playlist in `order_index` order
    fn playlist_tracks(&self, playlist_id: i64) -> Result<Vec<Track>, BellError>;

    fn append_bell_log(&self, entry: &BellLogEntry) -> Result<(), BellError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use crate::models::PlaylistMode;

    /// In-memory store for exercising the core without SQLite
    #[derive(Default)]
    pub struct MemoryStore {
        days: Mutex<HashMap<NaiveDate, DayRow>>,
        playlists: Mutex<Vec<Playlist>>,
        tracks: Mutex<Vec<Track>>,
        log: Mutex<Vec<BellLogEntry>>,
        fail_log_writes: AtomicBool,
    }

    impl MemoryStore {
        pub fn set_day(&self, date: NaiveDate, spec: Option<&str>, is_holiday: bool) {
            self.set_day_with_playlist(date, spec, is_holiday, None);
        }

        pub fn set_day_with_playlist(
            &self,
            date: NaiveDate,
            spec: Option<&str>,
            is_holiday: bool,
            playlist_id: Option<i64>,
        ) {
            self.days.lock().unwrap().insert(
                date,
                DayRow {
                    date,
                    is_holiday,
                    ring_spec_json: spec.map(str::to_string),
                    playlist_id,
                    note: None,
                },
            );
        }

        pub fn add_playlist(&self, id: i64, mode: PlaylistMode, is_default: bool, files: &[&str]) {
            self.playlists.lock().unwrap().push(Playlist {
                id,
                name: format!("playlist-{}", id),
                mode,
                crossfade_secs: 0,
                is_active: true,
                is_default,
            });
            let mut tracks = self.tracks.lock().unwrap();
            for (i, file) in files.iter().enumerate() {
                let next_id = tracks.len() as i64 + 1;
                tracks.push(Track {
                    id: next_id,
                    playlist_id: id,
                    file_path: file.to_string(),
                    title: None,
                    artist: None,
                    duration_secs: None,
                    order_index: i as i64,
                });
            }
        }

        pub fn log_entries(&self) -> Vec<BellLogEntry> {
            self.log.lock().unwrap().clone()
        }

        pub fn fail_log_writes(&self) {
            self.fail_log_writes.store(true, Ordering::SeqCst);
        }
    }

    impl BellStore for MemoryStore {
        fn day_row(&self, date: NaiveDate) -> Result<Option<DayRow>, BellError> {
            Ok(self.days.lock().unwrap().get(&date).cloned())
        }

        fn default_active_playlist(&self) -> Result<Option<Playlist>, BellError> {
            Ok(self
                .playlists
                .lock()
                .unwrap()
                .iter()
                .filter(|p| p.is_active && p.is_default)
                .min_by_key(|p| p.id)
                .cloned())
        }

        fn playlist(&self, playlist_id: i64) -> Result<Option<Playlist>, BellError> {
            Ok(self
                .playlists
                .lock()
                .unwrap()
                .iter()
                .find(|p| p.id == playlist_id)
                .cloned())
        }

        fn playlist_tracks(&self, playlist_id: i64) -> Result<Vec<Track>, BellError> {
            let mut tracks: Vec<_> = self
                .tracks
                .lock()
                .unwrap()
                .iter()
                .filter(|t| t.playlist_id == playlist_id)
                .cloned()
                .collect();
            tracks.sort_by_key(|t| t.order_index);
            Ok(tracks)
        }

        fn append_bell_log(&self, entry: &BellLogEntry) -> Result<(), BellError> {
            if self.fail_log_writes.load(Ordering::SeqCst) {
                return Err(BellError::Error("log table is locked".into()));
            }
            self.log.lock().unwrap().push(entry.clone());
            Ok(())
        }
    }
}
