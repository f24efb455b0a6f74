mod backend;

pub use backend::{BackendKind, RelayBackend, SimulatedLine};

use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::{Mutex, OnceCell};

use crate::error::BellError;

/// Relay wiring and backend preferences
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub pin: u32,
    pub chip: String,
    /// When set, a low level energizes the relay
    pub active_low: bool,
    /// Backends to try, in order
    pub backends: Vec<BackendKind>,
    pub setter_command: String,
    pub setter_args: Vec<String>,
    /// Single setter invocation that holds a level for `{ms}`/`{us}`; pulses
    /// use it instead of separate ON and OFF runs when not empty
    pub setter_hold_args: Vec<String>,
    /// Longest a setter run may take before it is killed
    pub setter_timeout: Duration,
    /// Pulses shorter than this are stretched to it
    pub pulse_floor_ms: u64,
    /// Pulses longer than this are cut to it
    pub pulse_max_ms: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            pin: 18,
            chip: "gpiochip0".to_string(),
            active_low: false,
            backends: vec![
                BackendKind::Chardev,
                BackendKind::Command,
                BackendKind::Simulated,
            ],
            setter_command: "gpioset".to_string(),
            setter_args: vec!["{chip}".to_string(), "{pin}={value}".to_string()],
            setter_hold_args: Vec::new(),
            setter_timeout: Duration::from_secs(2),
            pulse_floor_ms: 50,
            pulse_max_ms: 10_000,
        }
    }
}

/// Drives the bell relay.
///
/// The backend is resolved on first use and kept for the life of the
/// process; the line is driven OFF as part of resolution, before any pulse
/// is accepted. Pulses are serialized. Nothing here blocks the runtime: setter
/// processes are awaited with a deadline.
pub struct Relay {
    settings: RelaySettings,
    backend: OnceCell<RelayBackend>,
    pulse_lock: Mutex<()>,
}

impl Relay {
    pub fn new(settings: RelaySettings) -> Self {
        Self {
            settings,
            backend: OnceCell::new(),
            pulse_lock: Mutex::new(()),
        }
    }

    /// Use a specific backend instead of resolving one from the settings
    #[cfg(test)]
    pub fn with_backend(settings: RelaySettings, backend: RelayBackend) -> Self {
        let relay = Self {
            settings,
            backend: OnceCell::new_with(Some(backend)),
            pulse_lock: Mutex::new(()),
        };
        if let Some(backend) = relay.backend.get() {
            backend.set_level_detached(relay.level(false));
        }
        relay
    }

    async fn backend(&self) -> &RelayBackend {
        self.backend
            .get_or_init(|| async {
                let off = self.level(false);
                let backend = RelayBackend::resolve(&self.settings, off).await;
                info!(
                    "Relay backend '{}' selected (pin={}, active_low={})",
                    backend.kind(),
                    self.settings.pin,
                    self.settings.active_low
                );
                if let Err(e) = backend.set_level(off).await {
                    error!("Failed to force relay OFF: {}", e);
                }
                backend
            })
            .await
    }

    pub async fn backend_kind(&self) -> BackendKind {
        self.backend().await.kind()
    }

    /// The simulated line, when simulation is the active backend
    #[cfg(test)]
    pub fn simulated(&self) -> Option<&SimulatedLine> {
        match self.backend.get() {
            Some(RelayBackend::Simulated(line)) => Some(line),
            _ => None,
        }
    }

    /// Physical level for a logical state
    pub fn level(&self, on: bool) -> u8 {
        u8::from(on != self.settings.active_low)
    }

    pub async fn on(&self) -> Result<(), BellError> {
        self.backend().await.set_level(self.level(true)).await
    }

    pub async fn off(&self) -> Result<(), BellError> {
        self.backend().await.set_level(self.level(false)).await
    }

    /// OFF from a synchronous context, when the backend is already up
    fn off_detached(&self) {
        if let Some(backend) = self.backend.get() {
            backend.set_level_detached(self.level(false));
        }
    }

    /// Longest pulse this relay will hold
    pub fn pulse_max_ms(&self) -> u64 {
        self.settings.pulse_max_ms.max(self.settings.pulse_floor_ms)
    }

    /// Clamp a requested pulse length to the configured floor and ceiling
    pub fn effective_pulse(&self, duration_ms: u64) -> Duration {
        let max_ms = self.pulse_max_ms();
        if duration_ms > max_ms {
            warn!("Pulse of {}ms cut to the {}ms maximum", duration_ms, max_ms);
        }
        Duration::from_millis(duration_ms.clamp(self.settings.pulse_floor_ms, max_ms))
    }

    /// Energize the relay for `duration_ms` (clamped to floor and ceiling).
    ///
    /// The line is driven OFF when the hold ends, when switching ON fails and
    /// when the returned future is dropped mid-hold.
    pub async fn pulse(&self, duration_ms: u64) -> Result<Duration, BellError> {
        let hold = self.effective_pulse(duration_ms);
        let _serial = self.pulse_lock.lock().await;
        let backend = self.backend().await;

        let guard = OffGuard::new(self);
        match backend.hold_level(self.level(true), hold).await {
            Some(held) => held?,
            None => {
                backend.set_level(self.level(true)).await?;
                tokio::time::sleep(hold).await;
            }
        }
        guard.release().await?;

        Ok(hold)
    }
}

/// Drives the line OFF when dropped unless released explicitly
struct OffGuard<'a> {
    relay: &'a Relay,
    armed: bool,
}

impl<'a> OffGuard<'a> {
    fn new(relay: &'a Relay) -> Self {
        Self { relay, armed: true }
    }

    async fn release(mut self) -> Result<(), BellError> {
        self.armed = false;
        self.relay.off().await
    }
}

impl Drop for OffGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.relay.off_detached();
        }
    }
}
