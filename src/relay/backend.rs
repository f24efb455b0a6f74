use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tokio::process::Command;
use tokio::time::Instant;

use super::RelaySettings;
use crate::error::BellError;

/// Ways of driving the relay's output line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum BackendKind {
    /// Linux GPIO character device (`/dev/gpiochipN`)
    Chardev,
    /// External setter process such as `gpioset`
    Command,
    /// No hardware; the level is only recorded
    Simulated,
}

/// The resolved line driver. Levels passed in are physical (0/1); polarity
/// has already been applied by the caller.
pub enum RelayBackend {
    Chardev(ChardevLine),
    Command(CommandLine),
    Simulated(SimulatedLine),
}

impl RelayBackend {
    pub fn kind(&self) -> BackendKind {
        match self {
            RelayBackend::Chardev(_) => BackendKind::Chardev,
            RelayBackend::Command(_) => BackendKind::Command,
            RelayBackend::Simulated(_) => BackendKind::Simulated,
        }
    }

    pub async fn set_level(&self, level: u8) -> Result<(), BellError> {
        match self {
            RelayBackend::Chardev(line) => line.set_level(level),
            RelayBackend::Command(line) => line.set_level(level).await,
            RelayBackend::Simulated(line) => line.set_level(level),
        }
    }

    /// Drive the line to `level` for `hold`. Only the command backend can do
    /// this in one step, and only when a hold invocation is configured.
    pub async fn hold_level(&self, level: u8, hold: Duration) -> Option<Result<(), BellError>> {
        match self {
            RelayBackend::Command(line) if line.can_hold() => Some(line.hold_level(level, hold).await),
            _ => None,
        }
    }

    /// Best effort level change from a synchronous context. The command
    /// setter runs on a spawned task.
    pub fn set_level_detached(&self, level: u8) {
        let result = match self {
            RelayBackend::Chardev(line) => line.set_level(level),
            RelayBackend::Command(line) => line.set_level_detached(level),
            RelayBackend::Simulated(line) => line.set_level(level),
        };
        if let Err(e) = result {
            error!("Failed to set relay level {}: {}", level, e);
        }
    }

    /// Try each configured backend in order, returning the first that can be
    /// brought up with the line at `initial_level`. Simulation always
    /// succeeds and terminates the chain.
    pub async fn resolve(settings: &RelaySettings, initial_level: u8) -> RelayBackend {
        for kind in &settings.backends {
            let attempt = match kind {
                BackendKind::Chardev => {
                    ChardevLine::open(&settings.chip, settings.pin, initial_level)
                        .map(RelayBackend::Chardev)
                }
                BackendKind::Command => {
                    let line = CommandLine::new(settings);
                    line.set_level(initial_level)
                        .await
                        .map(|_| RelayBackend::Command(line))
                }
                BackendKind::Simulated => {
                    Ok(RelayBackend::Simulated(SimulatedLine::new(settings.pin)))
                }
            };

            match attempt {
                Ok(backend) => return backend,
                Err(e) => warn!("Relay backend '{}' unavailable: {}", kind, e),
            }
        }

        warn!("No relay backend available, using simulation");
        RelayBackend::Simulated(SimulatedLine::new(settings.pin))
    }
}

// ============================================================================
// Character device
// ============================================================================

pub struct ChardevLine {
    #[cfg(target_os = "linux")]
    handle: gpio_cdev::LineHandle,
}

impl ChardevLine {
    const CONSUMER: &'static str = "schoolbell";

    #[cfg(target_os = "linux")]
    pub fn open(chip: &str, pin: u32, initial_level: u8) -> Result<Self, BellError> {
        use gpio_cdev::{Chip, LineRequestFlags};

        let path = if chip.starts_with('/') {
            chip.to_string()
        } else {
            format!("/dev/{}", chip)
        };

        let gpio_err = |e: gpio_cdev::Error| BellError::RelayError(format!("{}: {}", path, e));

        let mut chip = Chip::new(&path).map_err(gpio_err)?;
        let line = chip.get_line(pin).map_err(gpio_err)?;
        let handle = line
            .request(LineRequestFlags::OUTPUT, initial_level, Self::CONSUMER)
            .map_err(gpio_err)?;

        info!("[GPIO] Using character device {}, pin={}", path, pin);
        Ok(Self { handle })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn open(_chip: &str, _pin: u32, _initial_level: u8) -> Result<Self, BellError> {
        Err(BellError::RelayError(
            "GPIO character devices are only available on Linux".into(),
        ))
    }

    #[cfg(target_os = "linux")]
    fn set_level(&self, level: u8) -> Result<(), BellError> {
        self.handle
            .set_value(level)
            .map_err(|e| BellError::RelayError(format!("set_value({}) failed: {}", level, e)))
    }

    #[cfg(not(target_os = "linux"))]
    fn set_level(&self, _level: u8) -> Result<(), BellError> {
        Err(BellError::RelayError("unsupported platform".into()))
    }
}

// ============================================================================
// External setter process
// ============================================================================

/// Invokes a setter program once per level change. `{chip}`, `{pin}` and
/// `{value}` in the argument templates are substituted, plus `{ms}` and
/// `{us}` in the hold template.
///
/// Every run is bounded by `timeout`; a setter that hangs is killed and the
/// change reported as failed.
pub struct CommandLine {
    program: String,
    args: Vec<String>,
    hold_args: Vec<String>,
    chip: String,
    pin: u32,
    timeout: Duration,
}

impl CommandLine {
    pub fn new(settings: &RelaySettings) -> Self {
        Self {
            program: settings.setter_command.clone(),
            args: settings.setter_args.clone(),
            hold_args: settings.setter_hold_args.clone(),
            chip: settings.chip.clone(),
            pin: settings.pin,
            timeout: settings.setter_timeout,
        }
    }

    fn render(&self, template: &[String], level: u8, hold: Duration) -> Vec<String> {
        template
            .iter()
            .map(|arg| {
                arg.replace("{chip}", &self.chip)
                    .replace("{pin}", &self.pin.to_string())
                    .replace("{value}", &level.to_string())
                    .replace("{ms}", &hold.as_millis().to_string())
                    .replace("{us}", &hold.as_micros().to_string())
            })
            .collect()
    }

    fn render_args(&self, level: u8) -> Vec<String> {
        self.render(&self.args, level, Duration::ZERO)
    }

    fn can_hold(&self) -> bool {
        !self.hold_args.is_empty()
    }

    async fn set_level(&self, level: u8) -> Result<(), BellError> {
        run_setter(self.program.clone(), self.render_args(level), self.timeout).await
    }

    /// One invocation that keeps the line at `level` for `hold` and exits.
    /// Separate ON and OFF runs don't keep a character-device line driven on
    /// every setter, so pulses use this when configured.
    async fn hold_level(&self, level: u8, hold: Duration) -> Result<(), BellError> {
        let args = self.render(&self.hold_args, level, hold);
        run_setter(self.program.clone(), args, hold + self.timeout).await
    }

    fn set_level_detached(&self, level: u8) -> Result<(), BellError> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| BellError::RelayError(format!("no runtime for {}: {}", self.program, e)))?;
        let run = run_setter(self.program.clone(), self.render_args(level), self.timeout);
        handle.spawn(async move {
            if let Err(e) = run.await {
                error!("Failed to set relay level {}: {}", level, e);
            }
        });
        Ok(())
    }
}

async fn run_setter(program: String, args: Vec<String>, limit: Duration) -> Result<(), BellError> {
    let child = Command::new(&program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| BellError::RelayError(format!("failed to run {}: {}", program, e)))?;

    let output = match tokio::time::timeout(limit, child.wait_with_output()).await {
        Ok(result) => {
            result.map_err(|e| BellError::RelayError(format!("failed to wait on {}: {}", program, e)))?
        }
        // Dropping the wait kills the child
        Err(_) => {
            return Err(BellError::RelayError(format!(
                "{} {} timed out after {}ms",
                program,
                args.join(" "),
                limit.as_millis()
            )))
        }
    };

    if output.status.success() {
        Ok(())
    } else {
        Err(BellError::RelayError(format!(
            "{} {} exited with {}: {}",
            program,
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

// ============================================================================
// Simulation
// ============================================================================

const LEVEL_UNKNOWN: u8 = u8::MAX;

/// Level changes kept by a simulated line
const TRANSITIONS_KEPT: usize = 64;

/// In-memory line. Keeps the recent history of level changes so diagnostics
/// (and tests) can see exactly what the hardware would have done.
pub struct SimulatedLine {
    pin: u32,
    level: AtomicU8,
    transitions: Mutex<VecDeque<(u8, Instant)>>,
    fail_next: AtomicBool,
}

impl SimulatedLine {
    pub fn new(pin: u32) -> Self {
        Self {
            pin,
            level: AtomicU8::new(LEVEL_UNKNOWN),
            transitions: Mutex::new(VecDeque::with_capacity(TRANSITIONS_KEPT)),
            fail_next: AtomicBool::new(false),
        }
    }

    /// Current physical level, `None` before the first write
    #[cfg(test)]
    pub fn level(&self) -> Option<u8> {
        match self.level.load(Ordering::Acquire) {
            LEVEL_UNKNOWN => None,
            level => Some(level),
        }
    }

    #[cfg(test)]
    pub fn transitions(&self) -> Vec<(u8, Instant)> {
        self.transitions.lock().unwrap().iter().copied().collect()
    }

    /// Make the next level change fail, as a flaky line would
    #[cfg(test)]
    pub fn inject_fault(&self) {
        self.fail_next.store(true, Ordering::Release);
    }

    fn set_level(&self, level: u8) -> Result<(), BellError> {
        if self.fail_next.swap(false, Ordering::AcqRel) {
            return Err(BellError::RelayError(format!(
                "simulated fault on pin {}",
                self.pin
            )));
        }

        let mut transitions = self
            .transitions
            .lock()
            .map_err(|_| BellError::RelayError(format!("simulated pin {} state poisoned", self.pin)))?;
        if transitions.len() == TRANSITIONS_KEPT {
            transitions.pop_front();
        }
        transitions.push_back((level, Instant::now()));
        self.level.store(level, Ordering::Release);
        info!("(SIMULATED GPIO) Relay on pin {} -> {}", self.pin, level);
        Ok(())
    }
}
