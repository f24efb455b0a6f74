use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono_tz::Tz;
use log::{debug, error, info, warn, Level};
use logging_timer::timer;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::state::{expired, resolve_day, DaySummary, Phase, SchedulerSnapshot, Timer};
use super::{SchedulerDeps, SchedulerSettings};
use crate::clock::{next_local_midnight, now_in, Clock};
use crate::error::BellError;
use crate::events::{BellEvent, EventSink, RingView};
use crate::models::{BellLogEntry, BellResult, TriggerSource};
use crate::music::{MusicEvent, MusicSelector};
use crate::relay::Relay;
use crate::ring_spec::{upcoming_rings, RingEvent};
use crate::store::BellStore;

/// How long to wait before retrying after the day's schedule couldn't be read
const LOAD_RETRY: Duration = Duration::from_secs(60);

pub(crate) enum Command {
    Rehydrate {
        reply: oneshot::Sender<Option<RingView>>,
    },
    Fire {
        duration_ms: Option<u64>,
        reply: oneshot::Sender<BellResult>,
    },
    NextRing {
        reply: oneshot::Sender<Option<RingView>>,
    },
    Snapshot {
        reply: oneshot::Sender<SchedulerSnapshot>,
    },
    Today {
        reply: oneshot::Sender<Result<DaySummary, BellError>>,
    },
    StartMusic {
        force: bool,
        reply: oneshot::Sender<bool>,
    },
    StopMusic {
        reason: String,
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Sole owner of all scheduling state. Runs as one task; every mutation is
/// either a command or a timer expiring, so they never interleave.
pub(crate) struct SchedulerCore {
    settings: SchedulerSettings,
    store: Arc<dyn BellStore>,
    events: Arc<dyn EventSink>,
    relay: Arc<Relay>,
    clock: Arc<dyn Clock>,
    music: MusicSelector,

    phase: Phase,
    next_ring: Option<RingEvent>,
    last_fired: Option<DateTime<Tz>>,
    ring_timer: Option<Timer>,
    pre_stop_timer: Option<Timer>,
    restart_timer: Option<Timer>,
    rollover_timer: Option<Timer>,
    generation: u64,
}

impl SchedulerCore {
    pub fn new(deps: SchedulerDeps, music_events: mpsc::UnboundedSender<MusicEvent>) -> Self {
        let music = MusicSelector::new(deps.music, deps.store.clone(), music_events);
        Self {
            settings: deps.settings,
            store: deps.store,
            events: deps.events,
            relay: deps.relay,
            clock: deps.clock,
            music,
            phase: Phase::Idle,
            next_ring: None,
            last_fired: None,
            ring_timer: None,
            pre_stop_timer: None,
            restart_timer: None,
            rollover_timer: None,
            generation: 0,
        }
    }

    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut music_events: mpsc::UnboundedReceiver<MusicEvent>,
    ) {
        info!(
            "Bell scheduler started (zone={}, pulse={}ms)",
            self.settings.time_zone, self.settings.pulse_ms
        );
        self.schedule_next();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                generation = expired(self.ring_timer) => self.on_ring_timer(generation).await,
                generation = expired(self.pre_stop_timer) => self.on_pre_stop_timer(generation),
                generation = expired(self.restart_timer) => self.on_restart_timer(generation),
                generation = expired(self.rollover_timer) => self.on_rollover_timer(generation),
                Some(event) = music_events.recv() => self.on_music_event(event),
            }
        }

        info!("Bell scheduler stopped");
    }

    async fn handle(&mut self, command: Command) {
        // A dropped reply only means the caller stopped waiting
        match command {
            Command::Rehydrate { reply } => {
                info!("Rehydrating bell schedule");
                self.schedule_next();
                let _ = reply.send(self.next_ring_view());
            }
            Command::Fire { duration_ms, reply } => {
                let duration_ms = duration_ms
                    .unwrap_or(self.settings.pulse_ms)
                    .min(self.relay.pulse_max_ms());
                let result = self.trigger_bell(duration_ms, TriggerSource::Manual).await;
                let _ = reply.send(result);
            }
            Command::NextRing { reply } => {
                let _ = reply.send(self.next_ring_view());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Today { reply } => {
                let today = self.now().date_naive();
                let _ = reply.send(resolve_day(
                    self.store.as_ref(),
                    self.settings.time_zone,
                    today,
                ));
            }
            Command::StartMusic { force, reply } => {
                let _ = reply.send(self.start_music(force));
            }
            Command::StopMusic { reason, reply } => {
                let _ = reply.send(self.stop_music(&reason));
            }
            Command::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
            }
        }
    }

    fn now(&self) -> DateTime<Tz> {
        now_in(self.clock.as_ref(), self.settings.time_zone)
    }

    fn new_timer(&mut self, deadline: Instant) -> Timer {
        self.generation += 1;
        Timer {
            deadline,
            generation: self.generation,
        }
    }

    /// Whether `generation` belongs to the timer currently held in `slot`.
    /// Consumes the timer when it does.
    fn take_if_current(slot: &mut Option<Timer>, generation: u64, name: &str) -> bool {
        match *slot {
            Some(timer) if timer.generation == generation => {
                *slot = None;
                true
            }
            _ => {
                debug!("Ignoring stale {} timer #{}", name, generation);
                false
            }
        }
    }

    fn next_ring_view(&self) -> Option<RingView> {
        self.next_ring.as_ref().map(RingView::from)
    }

    fn until_next_ring(&self) -> Option<Duration> {
        self.ring_timer
            .map(|t| t.deadline.saturating_duration_since(Instant::now()))
    }

    fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            phase: self.phase,
            next_ring: self.next_ring_view(),
            ring_armed: self.ring_timer.is_some(),
            pre_stop_armed: self.pre_stop_timer.is_some(),
            music_restart_armed: self.restart_timer.is_some(),
            music_active: self.music.is_active(),
            now_playing: self.music.now_playing().map(str::to_string),
        }
    }

    /// Recompute the next ring from storage and re-arm. Replaces every ring
    /// related timer, so calling it repeatedly converges on the same state.
    fn schedule_next(&mut self) {
        let _tmr = timer!(Level::Trace; "schedule_next");

        self.ring_timer = None;
        self.pre_stop_timer = None;
        self.rollover_timer = None;

        let now = self.now();
        let today = now.date_naive();

        // Never re-ring an instant that already fired, even if the wall
        // clock stepped back
        let after = match self.last_fired {
            Some(fired) if fired > now => fired,
            _ => now,
        };

        let next = match self.store.day_row(today) {
            Ok(Some(row)) if row.is_holiday => {
                info!("{} is a holiday, no bells", today);
                None
            }
            Ok(Some(row)) => upcoming_rings(row.ring_spec_json.as_deref(), &after)
                .into_iter()
                .next(),
            Ok(None) => {
                debug!("No schedule for {}", today);
                None
            }
            Err(e) => {
                error!("Failed to load schedule for {}: {}", today, e);
                self.go_idle(&now);
                let retry = self.new_timer(Instant::now() + LOAD_RETRY);
                self.rollover_timer = Some(retry);
                return;
            }
        };

        match next {
            Some(event) => self.arm(event, &now),
            None => self.go_idle(&now),
        }
    }

    fn arm(&mut self, event: RingEvent, now: &DateTime<Tz>) {
        let delay = (event.ts - *now).to_std().unwrap_or(Duration::ZERO);
        let deadline = Instant::now() + delay;

        let ring_timer = self.new_timer(deadline);
        self.ring_timer = Some(ring_timer);
        self.phase = Phase::Armed;

        info!(
            "Next bell at {} '{}' ({}s)",
            event.ts.to_rfc3339(),
            event.label,
            delay.as_secs()
        );
        self.events.emit(BellEvent::Next(Some(RingView::from(&event))));
        self.next_ring = Some(event);

        if self.music.settings().enabled {
            let pre_stop = self.music.settings().pre_stop;
            if delay > pre_stop {
                let pre_stop_timer = self.new_timer(deadline - pre_stop);
                self.pre_stop_timer = Some(pre_stop_timer);
            } else {
                self.stop_music("bell imminent");
            }
        }
    }

    fn go_idle(&mut self, now: &DateTime<Tz>) {
        if self.phase != Phase::Idle {
            info!("No more bells today");
        }
        self.phase = Phase::Idle;
        self.next_ring = None;
        self.events.emit(BellEvent::Next(None));
        self.stop_music("no more bells today");

        match next_local_midnight(now) {
            Some(midnight) => {
                let delay = (midnight - *now).to_std().unwrap_or(Duration::ZERO);
                let rollover = self.new_timer(Instant::now() + delay);
                self.rollover_timer = Some(rollover);
            }
            None => warn!("Could not determine the next midnight after {}", now),
        }
    }

    async fn on_ring_timer(&mut self, generation: u64) {
        if !Self::take_if_current(&mut self.ring_timer, generation, "ring") {
            return;
        }

        self.phase = Phase::Firing;
        self.pre_stop_timer = None;
        self.last_fired = self.next_ring.take().map(|ring| ring.ts);
        self.stop_music("bell");

        self.trigger_bell(self.settings.pulse_ms, TriggerSource::Schedule)
            .await;

        if self.music.settings().enabled {
            let restart = self.new_timer(Instant::now() + self.music.settings().post_bell_restart);
            self.restart_timer = Some(restart);
        }

        self.schedule_next();
    }

    /// Pulse the relay and record the attempt.
    ///
    /// Never fails: relay errors become a FAIL log row, and a log write
    /// failure is reported without affecting the trigger or its event.
    async fn trigger_bell(&mut self, duration_ms: u64, source: TriggerSource) -> BellResult {
        let _tmr = timer!(Level::Trace; "trigger_bell", "{}", source);

        let outcome = self.relay.pulse(duration_ms).await;
        let ts = self.clock.now_utc();

        let (result, message) = match outcome {
            Ok(held) => {
                info!(
                    "Bell TRIGGER OK ({}ms, held {}ms, {})",
                    duration_ms,
                    held.as_millis(),
                    source
                );
                (BellResult::Ok, source.to_string())
            }
            Err(e) => {
                error!("Bell TRIGGER FAIL ({}): {}", source, e);
                (BellResult::Fail, e.to_string())
            }
        };

        let entry = BellLogEntry::trigger(ts, duration_ms, result, message);
        if let Err(e) = self.store.append_bell_log(&entry) {
            error!("Failed to record bell log entry: {}", e);
        }

        if result == BellResult::Ok {
            self.events.emit(BellEvent::triggered(ts, duration_ms));
            self.music.play_bell_sound();
        }

        result
    }

    fn on_pre_stop_timer(&mut self, generation: u64) {
        if Self::take_if_current(&mut self.pre_stop_timer, generation, "pre-stop") {
            self.stop_music("bell approaching");
        }
    }

    fn on_restart_timer(&mut self, generation: u64) {
        if Self::take_if_current(&mut self.restart_timer, generation, "music restart") {
            self.start_music(false);
        }
    }

    fn on_rollover_timer(&mut self, generation: u64) {
        if Self::take_if_current(&mut self.rollover_timer, generation, "rollover") {
            info!("Reloading bell schedule for {}", self.now().date_naive());
            self.schedule_next();
        }
    }

    fn on_music_event(&mut self, event: MusicEvent) {
        let today = self.now().date_naive();
        let until_next_ring = self.until_next_ring();
        self.music.on_track_ended(event, today, until_next_ring);
    }

    fn start_music(&mut self, force: bool) -> bool {
        let today = self.now().date_naive();
        let until_next_ring = self.until_next_ring();
        self.music.start_if_possible(today, force, until_next_ring)
    }

    /// Stop music and drop any pending restart. The pre-stop timer belongs
    /// to the armed ring and is left alone.
    fn stop_music(&mut self, reason: &str) -> bool {
        self.restart_timer = None;
        self.music.stop(reason)
    }

    async fn shutdown(&mut self) {
        info!("Shutting down bell scheduler");
        self.ring_timer = None;
        self.pre_stop_timer = None;
        self.rollover_timer = None;
        self.stop_music("shutdown");
        self.phase = Phase::Idle;
        self.next_ring = None;

        if let Err(e) = self.relay.off().await {
            error!("Failed to turn relay OFF at shutdown: {}", e);
        }
    }
}
