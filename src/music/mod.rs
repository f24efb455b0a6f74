mod cursor;
mod player;

pub use cursor::TrackCursor;
pub use player::{MusicEvent, Playback, PlayerCommand};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc;

use crate::error::BellError;
use crate::models::Playlist;
use crate::store::BellStore;

/// Consecutive failed tracks after which playback gives up until the next
/// explicit start
const MAX_FAILED_TRACKS: u32 = 3;

#[derive(Debug, Clone)]
pub struct MusicSettings {
    pub enabled: bool,
    pub player: PlayerCommand,
    /// Lead time before a ring at which music is stopped
    pub pre_stop: Duration,
    /// Extra margin on top of `pre_stop` when deciding whether a new track
    /// is worth starting
    pub near_bell_buffer: Duration,
    /// Delay after a ring before music resumes
    pub post_bell_restart: Duration,
    /// Played once after every successful ring
    pub bell_sound: Option<PathBuf>,
}

impl Default for MusicSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            player: PlayerCommand::default(),
            pre_stop: Duration::from_secs(30),
            near_bell_buffer: Duration::from_secs(5),
            post_bell_restart: Duration::from_secs(10),
            bell_sound: None,
        }
    }
}

impl MusicSettings {
    /// Below this much time to the next ring no track is started
    pub fn near_bell_threshold(&self) -> Duration {
        self.pre_stop + self.near_bell_buffer
    }
}

/// Background music between bells.
///
/// Owned by the scheduler task; nothing here is shared. Failures to start
/// music are logged and otherwise swallowed so they never reach bell
/// handling.
pub struct MusicSelector {
    settings: MusicSettings,
    store: Arc<dyn BellStore>,
    events: mpsc::UnboundedSender<MusicEvent>,
    cursor: Option<TrackCursor>,
    playing: Option<Playback>,
    generation: u64,
    failed_tracks: u32,
    rng: StdRng,
}

impl MusicSelector {
    pub fn new(
        settings: MusicSettings,
        store: Arc<dyn BellStore>,
        events: mpsc::UnboundedSender<MusicEvent>,
    ) -> Self {
        Self {
            settings,
            store,
            events,
            cursor: None,
            playing: None,
            generation: 0,
            failed_tracks: 0,
            rng: StdRng::from_entropy(),
        }
    }

    #[cfg(test)]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn settings(&self) -> &MusicSettings {
        &self.settings
    }

    pub fn is_active(&self) -> bool {
        self.playing.is_some()
    }

    pub fn now_playing(&self) -> Option<&str> {
        self.playing.as_ref().map(|p| p.track.as_str())
    }

    fn near_bell(&self, until_next_ring: Option<Duration>) -> bool {
        matches!(until_next_ring, Some(remaining) if remaining < self.settings.near_bell_threshold())
    }

    /// Start playing unless music is off, already playing or, without
    /// `force`, a ring is too close. Returns whether music is playing
    /// afterwards.
    pub fn start_if_possible(
        &mut self,
        today: NaiveDate,
        force: bool,
        until_next_ring: Option<Duration>,
    ) -> bool {
        if !self.settings.enabled {
            debug!("Music disabled");
            return false;
        }
        if self.playing.is_some() {
            return true;
        }
        if !force && self.near_bell(until_next_ring) {
            debug!("Next ring too close, not starting music");
            return false;
        }

        self.failed_tracks = 0;
        self.play_next(today)
    }

    fn play_next(&mut self, today: NaiveDate) -> bool {
        match self.try_play_next(today) {
            Ok(started) => started,
            Err(e) => {
                warn!("Music not started: {}", e);
                false
            }
        }
    }

    fn try_play_next(&mut self, today: NaiveDate) -> Result<bool, BellError> {
        let Some(playlist) = self.resolve_playlist(today)? else {
            debug!("No playlist for {}", today);
            return Ok(false);
        };

        let tracks = self.store.playlist_tracks(playlist.id)?;

        if !self
            .cursor
            .as_ref()
            .is_some_and(|c| c.matches(playlist.id, playlist.mode, today))
        {
            self.cursor = None;
        }
        let cursor = self
            .cursor
            .get_or_insert_with(|| TrackCursor::new(playlist.id, playlist.mode, today));

        let Some(index) = cursor.next_index(tracks.len(), &mut self.rng) else {
            debug!("Playlist '{}' has no tracks", playlist.name);
            return Ok(false);
        };
        let track = &tracks[index];

        let child = self.settings.player.spawn(Path::new(&track.file_path))?;
        self.generation += 1;
        info!(
            "Playing '{}' from playlist '{}' ({})",
            track.display_name(),
            playlist.name,
            playlist.mode
        );
        self.playing = Some(Playback::watch(
            child,
            self.generation,
            track.display_name().to_string(),
            self.events.clone(),
        ));

        Ok(true)
    }

    /// Today's explicit playlist if it still exists, else the default one
    pub fn resolve_playlist(&self, today: NaiveDate) -> Result<Option<Playlist>, BellError> {
        let assigned = self.store.day_row(today)?.and_then(|row| row.playlist_id);

        if let Some(playlist_id) = assigned {
            match self.store.playlist(playlist_id)? {
                Some(playlist) => return Ok(Some(playlist)),
                None => warn!(
                    "Playlist {} assigned to {} no longer exists",
                    playlist_id, today
                ),
            }
        }

        self.store.default_active_playlist()
    }

    /// Stop playback. Returns whether anything was playing.
    pub fn stop(&mut self, reason: &str) -> bool {
        match self.playing.take() {
            Some(playback) => {
                info!("Music stopped: {} (was '{}')", reason, playback.track);
                playback.stop();
                true
            }
            None => false,
        }
    }

    /// A player exited on its own. Moves on to the next track unless the exit
    /// is stale, a ring is close or tracks keep failing. Returns whether a
    /// new track started.
    pub fn on_track_ended(
        &mut self,
        event: MusicEvent,
        today: NaiveDate,
        until_next_ring: Option<Duration>,
    ) -> bool {
        let MusicEvent::TrackEnded {
            generation,
            success,
        } = event;

        match &self.playing {
            Some(playback) if playback.generation == generation => {}
            _ => {
                debug!("Ignoring exit of stale player #{}", generation);
                return false;
            }
        }
        self.playing = None;

        if success {
            self.failed_tracks = 0;
        } else {
            self.failed_tracks += 1;
            if self.failed_tracks >= MAX_FAILED_TRACKS {
                warn!(
                    "{} tracks in a row failed to play, music stopped",
                    self.failed_tracks
                );
                return false;
            }
        }

        if self.near_bell(until_next_ring) {
            info!("Next ring too close, not starting another track");
            return false;
        }

        self.play_next(today)
    }

    /// Play the configured bell sound once, if any
    pub fn play_bell_sound(&self) {
        if !self.settings.enabled {
            return;
        }
        if let Some(sound) = &self.settings.bell_sound {
            self.settings.player.play_detached(sound);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::models::PlaylistMode;
    use crate::store::testing::MemoryStore;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 15).unwrap()
    }

    /// Player that "plays" by running a shell snippet
    fn settings(script: &str) -> MusicSettings {
        MusicSettings {
            enabled: true,
            player: PlayerCommand {
                program: "sh".into(),
                args: vec!["-c".into(), script.into(), "player".into()],
            },
            ..MusicSettings::default()
        }
    }

    fn selector(
        store: Arc<MemoryStore>,
        script: &str,
    ) -> (MusicSelector, mpsc::UnboundedReceiver<MusicEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (MusicSelector::new(settings(script), store, tx).with_seed(9), rx)
    }

    fn store_with_default_playlist(mode: PlaylistMode) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::default());
        store.add_playlist(1, mode, true, &["a.mp3", "b.mp3", "c.mp3"]);
        store
    }

    #[tokio::test]
    async fn test_disabled_music_never_starts() {
        let store = store_with_default_playlist(PlaylistMode::Ordered);
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut music = MusicSelector::new(MusicSettings::default(), store, tx);

        assert!(!music.start_if_possible(day(), true, None));
        assert!(!music.is_active());
    }

    #[tokio::test]
    async fn test_no_playlist_means_no_music() {
        let (mut music, _rx) = selector(Arc::new(MemoryStore::default()), "sleep 30");
        assert!(!music.start_if_possible(day(), false, None));
        assert!(!music.is_active());
    }

    #[tokio::test]
    async fn test_empty_playlist_means_no_music() {
        let store = Arc::new(MemoryStore::default());
        store.add_playlist(1, PlaylistMode::Shuffle, true, &[]);
        let (mut music, _rx) = selector(store, "sleep 30");
        assert!(!music.start_if_possible(day(), false, None));
    }

    #[tokio::test]
    async fn test_spawn_failure_degrades_to_silence() {
        let store = store_with_default_playlist(PlaylistMode::Ordered);
        let (tx, _rx) = mpsc::unbounded_channel();
        let settings = MusicSettings {
            enabled: true,
            player: PlayerCommand {
                program: "/nonexistent/player".into(),
                args: vec![],
            },
            ..MusicSettings::default()
        };
        let mut music = MusicSelector::new(settings, store, tx);

        assert!(!music.start_if_possible(day(), false, None));
        assert!(!music.is_active());
    }

    #[tokio::test]
    async fn test_start_respects_near_bell_unless_forced() {
        let store = store_with_default_playlist(PlaylistMode::Ordered);
        let (mut music, _rx) = selector(store, "sleep 30");
        let close = Some(Duration::from_secs(20));

        assert!(!music.start_if_possible(day(), false, close));
        assert!(music.start_if_possible(day(), true, close));
        assert_eq!(music.now_playing(), Some("a.mp3"));

        music.stop("test");
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let store = store_with_default_playlist(PlaylistMode::Ordered);
        let (mut music, _rx) = selector(store, "sleep 30");

        assert!(music.start_if_possible(day(), false, None));
        assert!(music.stop("first"));
        assert!(!music.stop("second"));
        assert!(!music.is_active());
    }

    #[tokio::test]
    async fn test_track_end_advances_in_order() {
        let store = store_with_default_playlist(PlaylistMode::Ordered);
        let (mut music, mut rx) = selector(store, "exit 0");

        assert!(music.start_if_possible(day(), false, None));
        assert_eq!(music.now_playing(), Some("a.mp3"));

        let ended = rx.recv().await.unwrap();
        assert!(music.on_track_ended(ended, day(), None));
        assert_eq!(music.now_playing(), Some("b.mp3"));

        let ended = rx.recv().await.unwrap();
        assert!(music.on_track_ended(ended, day(), None));
        assert_eq!(music.now_playing(), Some("c.mp3"));

        music.stop("test");
    }

    #[tokio::test]
    async fn test_track_end_near_bell_stops() {
        let store = store_with_default_playlist(PlaylistMode::Ordered);
        let (mut music, mut rx) = selector(store, "exit 0");

        assert!(music.start_if_possible(day(), false, None));
        let ended = rx.recv().await.unwrap();

        assert!(!music.on_track_ended(ended, day(), Some(Duration::from_secs(34))));
        assert!(!music.is_active());
    }

    #[tokio::test]
    async fn test_stale_track_end_is_ignored() {
        let store = store_with_default_playlist(PlaylistMode::Ordered);
        let (mut music, _rx) = selector(store, "sleep 30");

        assert!(music.start_if_possible(day(), false, None));
        let stale = MusicEvent::TrackEnded {
            generation: 0,
            success: true,
        };

        assert!(!music.on_track_ended(stale, day(), None));
        assert_eq!(music.now_playing(), Some("a.mp3"));

        music.stop("test");
    }

    #[tokio::test]
    async fn test_repeated_failures_give_up() {
        let store = store_with_default_playlist(PlaylistMode::Ordered);
        let (mut music, mut rx) = selector(store, "exit 1");

        assert!(music.start_if_possible(day(), false, None));
        let mut restarts = 0;
        while let Some(ended) = rx.recv().await {
            if !music.on_track_ended(ended, day(), None) {
                break;
            }
            restarts += 1;
        }

        assert_eq!(restarts, MAX_FAILED_TRACKS - 1);
        assert!(!music.is_active());
    }

    #[tokio::test]
    async fn test_day_assignment_overrides_default() {
        let store = store_with_default_playlist(PlaylistMode::Ordered);
        store.add_playlist(2, PlaylistMode::Ordered, false, &["assembly.mp3"]);
        store.set_day_with_playlist(day(), None, false, Some(2));
        let (music, _rx) = selector(store.clone(), "sleep 30");

        assert_eq!(music.resolve_playlist(day()).unwrap().unwrap().id, 2);

        let tomorrow = day().succ_opt().unwrap();
        assert_eq!(music.resolve_playlist(tomorrow).unwrap().unwrap().id, 1);
    }

    #[tokio::test]
    async fn test_missing_day_assignment_falls_back_to_default() {
        let store = store_with_default_playlist(PlaylistMode::Ordered);
        store.set_day_with_playlist(day(), None, false, Some(99));
        let (music, _rx) = selector(store, "sleep 30");

        assert_eq!(music.resolve_playlist(day()).unwrap().unwrap().id, 1);
    }
}
