use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Playback order of a playlist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "UPPERCASE")]
#[strum(ascii_case_insensitive)]
pub enum PlaylistMode {
    #[strum(to_string = "SHUFFLE")]
    Shuffle,
    // Older rows were written as SEQUENTIAL
    #[strum(to_string = "ORDERED", serialize = "SEQUENTIAL")]
    Ordered,
}

impl PlaylistMode {
    /// Unknown values are treated as shuffle, the column's default
    pub fn from_db(value: &str) -> Self {
        value.parse().unwrap_or(PlaylistMode::Shuffle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum BellResult {
    #[strum(to_string = "OK")]
    Ok,
    #[strum(to_string = "FAIL")]
    Fail,
}

/// Who asked for the bell to ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum TriggerSource {
    #[strum(to_string = "SCHEDULE")]
    Schedule,
    #[strum(to_string = "MANUAL")]
    Manual,
}

/// A calendar day's schedule row joined with its template's ring spec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayRow {
    pub date: NaiveDate,
    pub is_holiday: bool,
    pub ring_spec_json: Option<String>,
    pub playlist_id: Option<i64>,
    pub note: Option<String>,
}

/// Admin-side update of a day row (upsert by date)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DayScheduleUpdate {
    pub bell_template_id: Option<i64>,
    pub playlist_id: Option<i64>,
    pub is_holiday: bool,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BellTemplate {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub color: Option<String>,
    pub json_spec: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Playlist {
    pub id: i64,
    pub name: String,
    pub mode: PlaylistMode,
    pub crossfade_secs: i64,
    pub is_active: bool,
    pub is_default: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Track {
    pub id: i64,
    pub playlist_id: i64,
    pub file_path: String,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub duration_secs: Option<i64>,
    pub order_index: i64,
}

impl Track {
    pub fn display_name(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.file_path)
    }
}

/// One audit row per trigger attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BellLogEntry {
    pub ts: DateTime<Utc>,
    pub action: String,
    pub duration_ms: u64,
    pub result: BellResult,
    pub message: String,
}

impl BellLogEntry {
    pub const ACTION_TRIGGER: &'static str = "TRIGGER";

    pub fn trigger(ts: DateTime<Utc>, duration_ms: u64, result: BellResult, message: String) -> Self {
        Self {
            ts,
            action: Self::ACTION_TRIGGER.to_string(),
            duration_ms,
            result,
            message,
        }
    }

    pub fn ts_string(&self) -> String {
        self.ts.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}
