use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Europe::Belgrade;
use pretty_assertions::assert_eq;

use super::*;
use crate::clock::testing::PausedClock;
use crate::events::testing::RecordingSink;
use crate::models::{BellResult, PlaylistMode};
use crate::music::{MusicSettings, PlayerCommand};
use crate::relay::{RelayBackend, RelaySettings, SimulatedLine};
use crate::store::testing::MemoryStore;

const SPEC: &str = r#"{"rings":[{"time":"08:45","label":"Lesson 2"},{"time":"08:00"}]}"#;

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 1, 15).unwrap()
}

fn local(date: NaiveDate, hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
    Belgrade
        .from_local_datetime(&date.and_hms_opt(hour, minute, second).unwrap())
        .single()
        .unwrap()
        .with_timezone(&Utc)
}

fn ring(ts: &str, label: &str) -> Option<RingView> {
    Some(RingView {
        ts: ts.into(),
        label: label.into(),
    })
}

async fn advance(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
}

struct Harness {
    scheduler: BellScheduler,
    store: Arc<MemoryStore>,
    events: Arc<RecordingSink>,
    relay: Arc<Relay>,
}

impl Harness {
    fn start(now: DateTime<Utc>, store: Arc<MemoryStore>) -> Self {
        Self::start_with_music(now, store, MusicSettings::default())
    }

    fn start_with_music(now: DateTime<Utc>, store: Arc<MemoryStore>, music: MusicSettings) -> Self {
        let events = Arc::new(RecordingSink::default());
        let relay_settings = RelaySettings::default();
        let line = SimulatedLine::new(relay_settings.pin);
        let relay = Arc::new(Relay::with_backend(
            relay_settings,
            RelayBackend::Simulated(line),
        ));

        let scheduler = BellScheduler::start(SchedulerDeps {
            settings: SchedulerSettings {
                time_zone: Belgrade,
                pulse_ms: 2500,
            },
            music,
            store: store.clone(),
            events: events.clone(),
            relay: relay.clone(),
            clock: Arc::new(PausedClock::starting_at(now)),
        });

        Self {
            scheduler,
            store,
            events,
            relay,
        }
    }

    fn line(&self) -> &SimulatedLine {
        self.relay.simulated().unwrap()
    }
}

fn store_with_spec() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::default());
    store.set_day(day(), Some(SPEC), false);
    store
}

#[tokio::test(start_paused = true)]
async fn test_next_ring_is_earliest_upcoming() {
    let h = Harness::start(local(day(), 7, 0, 0), store_with_spec());

    let next = h.scheduler.next_ring().await.unwrap();

    assert_eq!(next, ring("2025-01-15T08:00:00+01:00", ""));
    assert_eq!(h.events.last_next(), Some(next));

    let snapshot = h.scheduler.snapshot().await.unwrap();
    assert_eq!(snapshot.phase, Phase::Armed);
    assert!(snapshot.ring_armed);
    // Music is off by default, so no pre-stop
    assert!(!snapshot.pre_stop_armed);
}

#[tokio::test(start_paused = true)]
async fn test_no_ring_after_last_bell() {
    let h = Harness::start(local(day(), 8, 50, 0), store_with_spec());

    assert_eq!(h.scheduler.next_ring().await.unwrap(), None);
    assert_eq!(h.events.last_next(), Some(None));

    let snapshot = h.scheduler.snapshot().await.unwrap();
    assert_eq!(snapshot.phase, Phase::Idle);
    assert!(!snapshot.ring_armed);
}

#[tokio::test(start_paused = true)]
async fn test_holiday_is_idle_regardless_of_spec() {
    let store = Arc::new(MemoryStore::default());
    store.set_day(day(), Some(SPEC), true);
    let h = Harness::start(local(day(), 7, 0, 0), store);

    assert_eq!(h.scheduler.next_ring().await.unwrap(), None);
    assert!(!h.scheduler.snapshot().await.unwrap().ring_armed);
}

#[tokio::test(start_paused = true)]
async fn test_missing_day_row_is_idle() {
    let h = Harness::start(local(day(), 7, 0, 0), Arc::new(MemoryStore::default()));
    assert_eq!(h.scheduler.next_ring().await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_spec_is_idle() {
    let store = Arc::new(MemoryStore::default());
    store.set_day(day(), Some("{not json"), false);
    let h = Harness::start(local(day(), 7, 0, 0), store);
    assert_eq!(h.scheduler.next_ring().await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_ring_fires_and_rearms() {
    let h = Harness::start(local(day(), 7, 59, 0), store_with_spec());

    advance(65).await;

    let log = h.store.log_entries();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].result, BellResult::Ok);
    assert_eq!(log[0].message, "SCHEDULE");
    assert_eq!(log[0].duration_ms, 2500);
    assert_eq!(h.events.triggered_count(), 1);

    let levels: Vec<u8> = h.line().transitions().iter().map(|(l, _)| *l).collect();
    assert_eq!(levels, vec![0, 1, 0]);

    assert_eq!(
        h.scheduler.next_ring().await.unwrap(),
        ring("2025-01-15T08:45:00+01:00", "Lesson 2")
    );
}

#[tokio::test(start_paused = true)]
async fn test_all_rings_fire_then_idle() {
    let h = Harness::start(local(day(), 7, 59, 0), store_with_spec());

    advance(50 * 60).await;

    assert_eq!(h.store.log_entries().len(), 2);
    assert_eq!(h.events.triggered_count(), 2);
    assert_eq!(h.scheduler.next_ring().await.unwrap(), None);
    assert_eq!(h.scheduler.snapshot().await.unwrap().phase, Phase::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_rehydrate_is_idempotent() {
    let h = Harness::start(local(day(), 7, 59, 0), store_with_spec());

    for _ in 0..5 {
        assert_eq!(
            h.scheduler.rehydrate().await.unwrap(),
            ring("2025-01-15T08:00:00+01:00", "")
        );
    }
    assert!(h.scheduler.snapshot().await.unwrap().ring_armed);

    advance(65).await;

    // One ring, despite five re-arms
    assert_eq!(h.store.log_entries().len(), 1);
    assert_eq!(h.events.triggered_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rehydrate_picks_up_changes() {
    let store = Arc::new(MemoryStore::default());
    let h = Harness::start(local(day(), 7, 0, 0), store.clone());
    assert_eq!(h.scheduler.next_ring().await.unwrap(), None);

    store.set_day(day(), Some(SPEC), false);

    assert_eq!(
        h.scheduler.rehydrate().await.unwrap(),
        ring("2025-01-15T08:00:00+01:00", "")
    );

    store.set_day(day(), Some(SPEC), true);

    assert_eq!(h.scheduler.rehydrate().await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn test_manual_fire_leaves_schedule_alone() {
    let h = Harness::start(local(day(), 7, 0, 0), Arc::new(MemoryStore::default()));

    let result = h.scheduler.fire_now(Some(2500)).await.unwrap();

    assert_eq!(result, BellResult::Ok);
    let log = h.store.log_entries();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].result, BellResult::Ok);
    assert_eq!(log[0].message, "MANUAL");
    assert_eq!(log[0].duration_ms, 2500);
    assert_eq!(h.events.triggered_count(), 1);

    let transitions = h.line().transitions();
    assert!(transitions[2].1 - transitions[1].1 >= Duration::from_millis(2500));

    assert_eq!(h.scheduler.next_ring().await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn test_manual_fire_while_armed_keeps_next_ring() {
    let h = Harness::start(local(day(), 7, 0, 0), store_with_spec());

    assert_eq!(h.scheduler.fire_now(None).await.unwrap(), BellResult::Ok);

    assert_eq!(
        h.scheduler.next_ring().await.unwrap(),
        ring("2025-01-15T08:00:00+01:00", "")
    );
    assert!(h.scheduler.snapshot().await.unwrap().ring_armed);
}

#[tokio::test(start_paused = true)]
async fn test_relay_failure_is_logged_and_schedule_continues() {
    let h = Harness::start(local(day(), 7, 59, 0), store_with_spec());
    h.line().inject_fault();

    advance(65).await;

    let log = h.store.log_entries();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].result, BellResult::Fail);
    assert!(log[0].message.contains("simulated fault"));
    assert_eq!(h.events.triggered_count(), 0);
    assert_eq!(h.line().level(), Some(0));

    assert_eq!(
        h.scheduler.next_ring().await.unwrap(),
        ring("2025-01-15T08:45:00+01:00", "Lesson 2")
    );
}

#[tokio::test(start_paused = true)]
async fn test_log_failure_does_not_suppress_triggered() {
    let store = store_with_spec();
    store.fail_log_writes();
    let h = Harness::start(local(day(), 7, 59, 0), store);

    advance(65).await;

    assert!(h.store.log_entries().is_empty());
    assert_eq!(h.events.triggered_count(), 1);
    assert!(h.scheduler.snapshot().await.unwrap().ring_armed);
}

#[tokio::test(start_paused = true)]
async fn test_midnight_rollover_loads_tomorrow() {
    let tomorrow = day().succ_opt().unwrap();
    let store = Arc::new(MemoryStore::default());
    store.set_day(tomorrow, Some(SPEC), false);
    let h = Harness::start(local(day(), 23, 0, 0), store);

    assert_eq!(h.scheduler.next_ring().await.unwrap(), None);

    advance(61 * 60).await;

    assert_eq!(
        h.scheduler.next_ring().await.unwrap(),
        ring("2025-01-16T08:00:00+01:00", "")
    );
}

#[tokio::test(start_paused = true)]
async fn test_ring_inside_spring_forward_gap() {
    let date = NaiveDate::from_ymd_opt(2025, 3, 30).unwrap();
    let store = Arc::new(MemoryStore::default());
    store.set_day(date, Some(r#"{"rings":[{"time":"02:30"}]}"#), false);
    let h = Harness::start(local(date, 1, 30, 0), store);

    assert_eq!(
        h.scheduler.next_ring().await.unwrap(),
        ring("2025-03-30T03:00:00+02:00", "")
    );

    // 01:30 CET to 03:00 CEST is 30 real minutes
    advance(31 * 60).await;
    assert_eq!(h.store.log_entries().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_today_includes_past_rings() {
    let h = Harness::start(local(day(), 8, 50, 0), store_with_spec());

    let today = h.scheduler.today().await.unwrap();

    assert_eq!(today.date, day());
    assert!(!today.is_holiday);
    assert_eq!(
        today.rings,
        vec![
            RingView {
                ts: "2025-01-15T08:00:00+01:00".into(),
                label: String::new()
            },
            RingView {
                ts: "2025-01-15T08:45:00+01:00".into(),
                label: "Lesson 2".into()
            },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_leaves_relay_off() {
    let h = Harness::start(local(day(), 7, 0, 0), store_with_spec());
    h.relay.on().await.unwrap();

    h.scheduler.shutdown().await.unwrap();

    assert_eq!(h.line().level(), Some(0));
    assert!(matches!(
        h.scheduler.next_ring().await,
        Err(BellError::SchedulerGone)
    ));
}

#[cfg(unix)]
mod music {
    use super::*;
    use pretty_assertions::assert_eq;

    fn music_settings() -> MusicSettings {
        MusicSettings {
            enabled: true,
            player: PlayerCommand {
                program: "sh".into(),
                args: vec!["-c".into(), "sleep 3600".into(), "player".into()],
            },
            ..MusicSettings::default()
        }
    }

    fn store_with_music() -> Arc<MemoryStore> {
        let store = store_with_spec();
        store.add_playlist(1, PlaylistMode::Shuffle, true, &["a.mp3", "b.mp3"]);
        store
    }

    #[tokio::test(start_paused = true)]
    async fn test_music_stops_before_ring_and_resumes_after() {
        let h = Harness::start_with_music(local(day(), 7, 58, 0), store_with_music(), music_settings());

        assert!(h.scheduler.start_music(false).await.unwrap());
        let snapshot = h.scheduler.snapshot().await.unwrap();
        assert!(snapshot.music_active);
        assert!(snapshot.pre_stop_armed);

        // 07:59:40, past the pre-stop at 07:59:30
        advance(100).await;
        let snapshot = h.scheduler.snapshot().await.unwrap();
        assert!(!snapshot.music_active);
        assert!(!snapshot.pre_stop_armed);
        assert!(snapshot.ring_armed);

        // 08:00:10, the ring is over and the restart is pending
        advance(30).await;
        assert_eq!(h.store.log_entries().len(), 1);
        let snapshot = h.scheduler.snapshot().await.unwrap();
        assert!(!snapshot.music_active);
        assert!(snapshot.music_restart_armed);

        // 08:00:15, restarted
        advance(5).await;
        let snapshot = h.scheduler.snapshot().await.unwrap();
        assert!(snapshot.music_active);
        assert!(!snapshot.music_restart_armed);

        h.scheduler.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_music_not_started_right_before_ring() {
        let h = Harness::start_with_music(local(day(), 7, 59, 45), store_with_music(), music_settings());

        assert!(!h.scheduler.start_music(false).await.unwrap());
        assert!(h.scheduler.start_music(true).await.unwrap());
        assert!(h.scheduler.stop_music("test").await.unwrap());
        assert!(!h.scheduler.stop_music("test").await.unwrap());

        h.scheduler.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_ring_of_day_leaves_music_off() {
        let h = Harness::start_with_music(local(day(), 8, 44, 0), store_with_music(), music_settings());

        advance(60 + 30).await;

        let snapshot = h.scheduler.snapshot().await.unwrap();
        assert_eq!(snapshot.phase, Phase::Idle);
        assert!(!snapshot.music_restart_armed);
        assert!(!snapshot.music_active);

        h.scheduler.shutdown().await.unwrap();
    }
}
