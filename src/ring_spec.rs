//! Interpretation of a day's ring spec.
//!
//! A ring spec is stored as JSON text on a bell template:
//!
//! ```json
//! { "rings": [ { "time": "08:00", "label": "Lesson 1" }, { "time": "08:45" } ] }
//! ```
//!
//! Interpretation is forgiving: malformed JSON, a missing `rings` array or
//! entries with unparseable times never produce an error, they simply yield
//! fewer (or no) ring events. Strict checking is available separately through
//! [`validate`] for callers saving a template.

use chrono::{DateTime, NaiveDate, NaiveTime};
use chrono_tz::Tz;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::local_time_on;
use crate::error::BellError;

/// A single ring instant resolved against a calendar day
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingEvent {
    pub ts: DateTime<Tz>,
    pub label: String,
}

/// Normalized, validated form of a ring spec
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingSpec {
    pub rings: Vec<RingEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingEntry {
    pub time: String,
    #[serde(default)]
    pub label: String,
}

/// Parse `"HH:MM"` (hours may be a single digit) into a time of day
pub fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    let (h, m) = s.trim().split_once(':')?;
    if h.is_empty() || h.len() > 2 || m.len() != 2 {
        return None;
    }
    let hours: u32 = h.parse().ok()?;
    let minutes: u32 = m.parse().ok()?;
    NaiveTime::from_hms_opt(hours, minutes, 0)
}

/// Parse stored ring spec text. Anything that isn't JSON yields `None`.
///
/// Templates saved by older admin builds hold the spec double-encoded (a JSON
/// string containing the JSON object), so one level of string wrapping is
/// unwrapped here.
pub fn parse_text(raw: &str) -> Option<Value> {
    let value: Value = serde_json::from_str(raw).ok()?;
    match value {
        Value::String(inner) => serde_json::from_str(&inner).ok(),
        other => Some(other),
    }
}

/// Extract `(time, label)` pairs from an already-parsed spec, dropping entries
/// whose time doesn't parse
fn entries(spec: &Value) -> Vec<(NaiveTime, String)> {
    let Some(rings) = spec.get("rings").and_then(Value::as_array) else {
        return Vec::new();
    };

    rings
        .iter()
        .filter_map(|ring| {
            let raw_time = ring.get("time").and_then(Value::as_str);
            let Some(time) = raw_time.and_then(parse_hhmm) else {
                debug!("Skipping ring entry with invalid time: {}", ring);
                return None;
            };
            let label = ring
                .get("label")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            Some((time, label))
        })
        .collect()
}

/// All rings of `date`, sorted ascending. Two entries at the same instant
/// collapse into the first one listed.
pub fn rings_on_value(spec: &Value, tz: Tz, date: NaiveDate) -> Vec<RingEvent> {
    let mut events: Vec<RingEvent> = entries(spec)
        .into_iter()
        .filter_map(|(time, label)| {
            local_time_on(tz, date, time).map(|ts| RingEvent { ts, label })
        })
        .collect();

    events.sort_by_key(|e| e.ts);
    events.dedup_by_key(|e| e.ts);
    events
}

pub fn rings_on(raw: Option<&str>, tz: Tz, date: NaiveDate) -> Vec<RingEvent> {
    match raw.and_then(parse_text) {
        Some(spec) => rings_on_value(&spec, tz, date),
        None => Vec::new(),
    }
}

/// Rings of `now`'s calendar day that are strictly after `now`, earliest first
pub fn upcoming_rings_value(spec: &Value, now: &DateTime<Tz>) -> Vec<RingEvent> {
    rings_on_value(spec, now.timezone(), now.date_naive())
        .into_iter()
        .filter(|e| e.ts > *now)
        .collect()
}

pub fn upcoming_rings(raw: Option<&str>, now: &DateTime<Tz>) -> Vec<RingEvent> {
    match raw.and_then(parse_text) {
        Some(spec) => upcoming_rings_value(&spec, now),
        None => Vec::new(),
    }
}

/// Strict check used when a template is saved. Rejects the whole spec if any
/// entry is malformed, and returns it normalized (sorted, `HH:MM` times).
pub fn validate(raw: &str) -> Result<RingSpec, BellError> {
    let spec = parse_text(raw)
        .ok_or_else(|| BellError::InvalidRingSpec("spec is not valid JSON".into()))?;

    let rings = spec
        .get("rings")
        .and_then(Value::as_array)
        .ok_or_else(|| BellError::InvalidRingSpec("spec has no 'rings' array".into()))?;

    let mut entries = Vec::with_capacity(rings.len());
    for (i, ring) in rings.iter().enumerate() {
        let raw_time = ring.get("time").and_then(Value::as_str).ok_or_else(|| {
            BellError::InvalidRingSpec(format!("ring {} has no 'time' string", i + 1))
        })?;
        let time = parse_hhmm(raw_time).ok_or_else(|| {
            BellError::InvalidRingSpec(format!(
                "ring {} has invalid time '{}' (expected HH:MM)",
                i + 1,
                raw_time
            ))
        })?;
        let label = ring
            .get("label")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        entries.push((time, label));
    }

    entries.sort_by_key(|(time, _)| *time);

    Ok(RingSpec {
        rings: entries
            .into_iter()
            .map(|(time, label)| RingEntry {
                time: time.format("%H:%M").to_string(),
                label,
            })
            .collect(),
    })
}
