use chrono::NaiveDate;
use log::debug;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::models::PlaylistMode;

/// Position within one playlist's playback order for one day.
///
/// Shuffle mode walks a random permutation of the track indices and draws a
/// fresh one only when it is exhausted (or the track count changed). Ordered
/// mode cycles through `order_index` order.
#[derive(Debug)]
pub struct TrackCursor {
    playlist_id: i64,
    mode: PlaylistMode,
    day: NaiveDate,
    order: Vec<usize>,
    position: usize,
    permutations: usize,
}

impl TrackCursor {
    pub fn new(playlist_id: i64, mode: PlaylistMode, day: NaiveDate) -> Self {
        Self {
            playlist_id,
            mode,
            day,
            order: Vec::new(),
            position: 0,
            permutations: 0,
        }
    }

    /// Whether this cursor is still the one to use for the given playlist
    /// and day
    pub fn matches(&self, playlist_id: i64, mode: PlaylistMode, day: NaiveDate) -> bool {
        self.playlist_id == playlist_id && self.mode == mode && self.day == day
    }

    /// Number of shuffle permutations drawn so far
    #[cfg(test)]
    pub fn permutations(&self) -> usize {
        self.permutations
    }

    /// Index of the next track to play out of `len` tracks
    pub fn next_index<R: Rng + ?Sized>(&mut self, len: usize, rng: &mut R) -> Option<usize> {
        if len == 0 {
            return None;
        }

        match self.mode {
            PlaylistMode::Ordered => {
                let index = self.position % len;
                self.position = index + 1;
                Some(index)
            }
            PlaylistMode::Shuffle => {
                if self.order.len() != len || self.position >= self.order.len() {
                    self.order = (0..len).collect();
                    self.order.shuffle(rng);
                    self.position = 0;
                    self.permutations += 1;
                    debug!(
                        "Shuffled playlist {} ({} tracks, pass {})",
                        self.playlist_id, len, self.permutations
                    );
                }
                let index = self.order[self.position];
                self.position += 1;
                Some(index)
            }
        }
    }
}
