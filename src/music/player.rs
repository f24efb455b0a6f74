use std::path::Path;
use std::process::Stdio;

use log::{debug, warn};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};

use crate::error::BellError;

/// Sent by a playback watcher when its player process exits on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MusicEvent {
    TrackEnded { generation: u64, success: bool },
}

/// External audio player invoked as `program args... <file>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for PlayerCommand {
    fn default() -> Self {
        Self {
            program: "ffplay".to_string(),
            args: ["-nodisp", "-autoexit", "-loglevel", "quiet"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl PlayerCommand {
    pub fn spawn(&self, file: &Path) -> Result<Child, BellError> {
        Command::new(&self.program)
            .args(&self.args)
            .arg(file)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BellError::PlaybackError(format!("failed to start {}: {}", self.program, e))
            })
    }

    /// Play a file once without tracking it
    pub fn play_detached(&self, file: &Path) {
        match self.spawn(file) {
            Ok(mut child) => {
                tokio::spawn(async move {
                    if let Err(e) = child.wait().await {
                        warn!("Waiting on player failed: {}", e);
                    }
                });
            }
            Err(e) => warn!("{}", e),
        }
    }
}

/// A running track. Dropping it stops the player.
#[derive(Debug)]
pub struct Playback {
    pub generation: u64,
    pub track: String,
    kill: oneshot::Sender<()>,
}

impl Playback {
    /// Hand `child` to a watcher task that reports a natural exit on `events`
    /// and kills the process when this handle is stopped or dropped
    pub fn watch(
        child: Child,
        generation: u64,
        track: String,
        events: mpsc::UnboundedSender<MusicEvent>,
    ) -> Self {
        let (kill, kill_rx) = oneshot::channel();
        tokio::spawn(watch_player(child, generation, kill_rx, events));
        Self {
            generation,
            track,
            kill,
        }
    }

    pub fn stop(self) {
        // The watcher may already be gone if the process just exited
        let _ = self.kill.send(());
    }
}

async fn watch_player(
    mut child: Child,
    generation: u64,
    kill_rx: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<MusicEvent>,
) {
    tokio::select! {
        status = child.wait() => {
            let success = matches!(&status, Ok(s) if s.success());
            debug!("Player #{} exited: {:?}", generation, status);
            let _ = events.send(MusicEvent::TrackEnded { generation, success });
        }
        _ = kill_rx => {
            if let Err(e) = child.kill().await {
                warn!("Failed to stop player #{}: {}", generation, e);
            }
        }
    }
}
