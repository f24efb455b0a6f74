//! The bell scheduler.
//!
//! A single task owns all scheduling state: the next ring, its timer, the
//! music timers around it and the music player itself. [`BellScheduler`] is a
//! cheap, cloneable handle that talks to that task over a channel, so HTTP
//! handlers, the CLI and timers never race each other for the state.

mod actor;
mod state;

#[cfg(test)]
mod tests;

pub use state::{resolve_day, DaySummary, Phase, SchedulerSnapshot};

use std::sync::Arc;

use chrono_tz::Tz;
use tokio::sync::{mpsc, oneshot};

use self::actor::{Command, SchedulerCore};
use crate::clock::Clock;
use crate::error::BellError;
use crate::events::{EventSink, RingView};
use crate::models::BellResult;
use crate::music::MusicSettings;
use crate::relay::Relay;
use crate::store::BellStore;

#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    pub time_zone: Tz,
    /// Pulse length for scheduled rings and the manual default
    pub pulse_ms: u64,
}

/// Everything the scheduler needs from the outside world
pub struct SchedulerDeps {
    pub settings: SchedulerSettings,
    pub music: MusicSettings,
    pub store: Arc<dyn BellStore>,
    pub events: Arc<dyn EventSink>,
    pub relay: Arc<Relay>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Clone)]
pub struct BellScheduler {
    commands: mpsc::Sender<Command>,
}

impl BellScheduler {
    /// Spawn the scheduler task and compute the first ring. Must be called
    /// from within a tokio runtime.
    pub fn start(deps: SchedulerDeps) -> Self {
        let (commands, commands_rx) = mpsc::channel(64);
        let (music_tx, music_rx) = mpsc::unbounded_channel();

        let core = SchedulerCore::new(deps, music_tx);
        tokio::spawn(core.run(commands_rx, music_rx));

        Self { commands }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, BellError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| BellError::SchedulerGone)?;
        response.await.map_err(|_| BellError::SchedulerGone)
    }

    /// Recompute the schedule after its inputs changed. Returns the new next
    /// ring.
    pub async fn rehydrate(&self) -> Result<Option<RingView>, BellError> {
        self.request(|reply| Command::Rehydrate { reply }).await
    }

    /// Ring the bell now, outside the schedule. `None` uses the configured
    /// pulse length. Resolves once the pulse is over and logged.
    pub async fn fire_now(&self, duration_ms: Option<u64>) -> Result<BellResult, BellError> {
        self.request(|reply| Command::Fire { duration_ms, reply })
            .await
    }

    pub async fn next_ring(&self) -> Result<Option<RingView>, BellError> {
        self.request(|reply| Command::NextRing { reply }).await
    }

    pub async fn snapshot(&self) -> Result<SchedulerSnapshot, BellError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub async fn today(&self) -> Result<DaySummary, BellError> {
        self.request(|reply| Command::Today { reply }).await?
    }

    /// Start background music. Without `force` nothing starts close to a
    /// ring.
    pub async fn start_music(&self, force: bool) -> Result<bool, BellError> {
        self.request(|reply| Command::StartMusic { force, reply })
            .await
    }

    pub async fn stop_music(&self, reason: &str) -> Result<bool, BellError> {
        let reason = reason.to_string();
        self.request(|reply| Command::StopMusic { reason, reply })
            .await
    }

    /// Stop every timer and the music, and leave the relay OFF. The task
    /// exits afterwards; later requests fail with `SchedulerGone`.
    pub async fn shutdown(&self) -> Result<(), BellError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}
