use chrono::NaiveDate;
use chrono_tz::Tz;
use serde::Serialize;
use strum::Display;
use tokio::time::Instant;

use crate::error::BellError;
use crate::events::RingView;
use crate::ring_spec::rings_on;
use crate::store::BellStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum Phase {
    /// Nothing left to ring today
    Idle,
    /// A ring timer is pending
    Armed,
    /// A scheduled ring is being pulsed
    Firing,
}

/// A pending deadline. Each armed timer gets a fresh generation so a wakeup
/// for a timer that has since been replaced can be recognized and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Timer {
    pub deadline: Instant,
    pub generation: u64,
}

/// Sleep until `timer` is due and yield its generation. Never completes
/// without a timer.
pub(crate) async fn expired(timer: Option<Timer>) -> u64 {
    match timer {
        Some(timer) => {
            tokio::time::sleep_until(timer.deadline).await;
            timer.generation
        }
        None => std::future::pending().await,
    }
}

/// Point-in-time view of the scheduler for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerSnapshot {
    pub phase: Phase,
    pub next_ring: Option<RingView>,
    pub ring_armed: bool,
    pub pre_stop_armed: bool,
    pub music_restart_armed: bool,
    pub music_active: bool,
    pub now_playing: Option<String>,
}

/// A calendar day as the scheduler sees it, past rings included
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DaySummary {
    pub date: NaiveDate,
    pub is_holiday: bool,
    pub playlist_id: Option<i64>,
    pub rings: Vec<RingView>,
}

/// Resolve `date`'s schedule row into its full, sorted ring list
pub fn resolve_day(store: &dyn BellStore, tz: Tz, date: NaiveDate) -> Result<DaySummary, BellError> {
    let summary = match store.day_row(date)? {
        Some(row) => DaySummary {
            date,
            is_holiday: row.is_holiday,
            playlist_id: row.playlist_id,
            rings: rings_on(row.ring_spec_json.as_deref(), tz, date)
                .iter()
                .map(RingView::from)
                .collect(),
        },
        None => DaySummary {
            date,
            is_holiday: false,
            playlist_id: None,
            rings: Vec::new(),
        },
    };
    Ok(summary)
}
