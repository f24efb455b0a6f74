use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono_tz::Tz;
use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::music::{MusicSettings, PlayerCommand};
use crate::relay::{BackendKind, RelaySettings};
use crate::scheduler::SchedulerSettings;

pub static CONFIG: OnceCell<Config> = OnceCell::new();

const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoggingConfig {
    pub schoolbell: String,
}

impl LoggingConfig {
    const SCHOOLBELL_LEVEL: &str = "info";

    fn default() -> Self {
        LoggingConfig {
            schoolbell: Self::SCHOOLBELL_LEVEL.to_string(),
        }
    }

    fn ensure_valid(&mut self) {
        let str_original = self.schoolbell.clone();
        self.schoolbell = self.schoolbell.trim().to_ascii_lowercase();
        if !LOG_LEVELS.contains(&self.schoolbell.as_str()) {
            eprintln!(
                "Config error: schoolbell log level of '{}' is invalid - using default of '{}'",
                str_original,
                Self::SCHOOLBELL_LEVEL
            );
            self.schoolbell = Self::SCHOOLBELL_LEVEL.to_owned();
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DatabaseConfig {
    /// Database file; defaults to `schoolbell.db` in the data directory
    pub path: Option<String>,
}

impl DatabaseConfig {
    const FILE_NAME: &str = "schoolbell.db";

    fn default() -> Self {
        DatabaseConfig { path: None }
    }

    pub fn resolve_path(&self, data_dir: &Path) -> PathBuf {
        match &self.path {
            Some(path) => PathBuf::from(path),
            None => data_dir.join(Self::FILE_NAME),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BellConfig {
    pub time_zone: String,
    pub pulse_ms: u64,
    pub pulse_floor_ms: u64,
    /// Longest pulse accepted from any caller
    pub pulse_max_ms: u64,
}

impl BellConfig {
    const TIME_ZONE: &str = "Europe/Belgrade";
    const PULSE_MS: u64 = 2500;
    const PULSE_FLOOR_MS: u64 = 50;
    const PULSE_MAX_MS: u64 = 10_000;

    fn default() -> Self {
        BellConfig {
            time_zone: Self::TIME_ZONE.to_string(),
            pulse_ms: Self::PULSE_MS,
            pulse_floor_ms: Self::PULSE_FLOOR_MS,
            pulse_max_ms: Self::PULSE_MAX_MS,
        }
    }

    fn ensure_valid(&mut self) {
        let str_original = self.time_zone.clone();
        self.time_zone = self.time_zone.trim().to_string();
        if self.time_zone.parse::<Tz>().is_err() {
            eprintln!(
                "Config error: time zone of '{}' is invalid - using default of '{}'",
                str_original,
                Self::TIME_ZONE
            );
            self.time_zone = Self::TIME_ZONE.to_owned();
        }

        if self.pulse_floor_ms == 0 {
            eprintln!(
                "Config error: pulse_floor_ms must be positive - using default of {}",
                Self::PULSE_FLOOR_MS
            );
            self.pulse_floor_ms = Self::PULSE_FLOOR_MS;
        }

        if self.pulse_max_ms < self.pulse_floor_ms {
            let fallback = Self::PULSE_MAX_MS.max(self.pulse_floor_ms);
            eprintln!(
                "Config error: pulse_max_ms of {} is below pulse_floor_ms - using {}",
                self.pulse_max_ms, fallback
            );
            self.pulse_max_ms = fallback;
        }

        if self.pulse_ms > self.pulse_max_ms {
            eprintln!(
                "Config error: pulse_ms of {} exceeds pulse_max_ms - using {}",
                self.pulse_ms, self.pulse_max_ms
            );
            self.pulse_ms = self.pulse_max_ms;
        }
    }

    pub fn time_zone(&self) -> Tz {
        // ensure_valid leaves a parseable zone behind
        self.time_zone.parse().unwrap_or(chrono_tz::Europe::Belgrade)
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            time_zone: self.time_zone(),
            pulse_ms: self.pulse_ms,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RelayConfig {
    pub pin: u32,
    pub chip: String,
    pub active_low: bool,
    /// Backends to try in order: chardev, command, simulated
    pub backends: Vec<String>,
    pub setter_command: String,
    pub setter_args: Vec<String>,
    /// Arguments for one run that holds the ON level for `{ms}` or `{us}`;
    /// empty means pulses use separate ON and OFF runs
    pub setter_hold_args: Vec<String>,
    pub setter_timeout_ms: u64,
}

impl RelayConfig {
    const SETTER_TIMEOUT_MS: u64 = 2000;

    fn default() -> Self {
        let defaults = RelaySettings::default();
        RelayConfig {
            pin: defaults.pin,
            chip: defaults.chip,
            active_low: defaults.active_low,
            backends: defaults.backends.iter().map(|b| b.to_string()).collect(),
            setter_command: defaults.setter_command,
            setter_args: defaults.setter_args,
            setter_hold_args: defaults.setter_hold_args,
            setter_timeout_ms: Self::SETTER_TIMEOUT_MS,
        }
    }

    fn ensure_valid(&mut self) {
        let mut valid = Vec::with_capacity(self.backends.len());
        for backend in &self.backends {
            match backend.trim().parse::<BackendKind>() {
                Ok(kind) => valid.push(kind.to_string()),
                Err(_) => eprintln!("Config error: relay backend '{}' is unknown - ignoring it", backend),
            }
        }

        // Simulation always closes the chain
        let simulated = BackendKind::Simulated.to_string();
        if !valid.contains(&simulated) {
            valid.push(simulated);
        }
        self.backends = valid;

        if self.setter_timeout_ms == 0 {
            eprintln!(
                "Config error: setter_timeout_ms must be positive - using default of {}",
                Self::SETTER_TIMEOUT_MS
            );
            self.setter_timeout_ms = Self::SETTER_TIMEOUT_MS;
        }
    }

    pub fn settings(&self, pulse_floor_ms: u64, pulse_max_ms: u64) -> RelaySettings {
        RelaySettings {
            pin: self.pin,
            chip: self.chip.clone(),
            active_low: self.active_low,
            backends: self
                .backends
                .iter()
                .filter_map(|b| b.parse().ok())
                .collect(),
            setter_command: self.setter_command.clone(),
            setter_args: self.setter_args.clone(),
            setter_hold_args: self.setter_hold_args.clone(),
            setter_timeout: Duration::from_millis(self.setter_timeout_ms),
            pulse_floor_ms,
            pulse_max_ms,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MusicConfig {
    pub enabled: bool,
    pub player_command: String,
    pub player_args: Vec<String>,
    pub pre_stop_secs: u64,
    pub near_bell_buffer_secs: u64,
    pub post_bell_restart_secs: u64,
    pub bell_sound: Option<String>,
}

impl MusicConfig {
    fn default() -> Self {
        let defaults = MusicSettings::default();
        MusicConfig {
            enabled: defaults.enabled,
            player_command: defaults.player.program,
            player_args: defaults.player.args,
            pre_stop_secs: defaults.pre_stop.as_secs(),
            near_bell_buffer_secs: defaults.near_bell_buffer.as_secs(),
            post_bell_restart_secs: defaults.post_bell_restart.as_secs(),
            bell_sound: None,
        }
    }

    fn ensure_valid(&mut self) {
        if let Some(sound) = &self.bell_sound {
            if sound.trim().is_empty() {
                self.bell_sound = None;
            }
        }
    }

    pub fn settings(&self) -> MusicSettings {
        MusicSettings {
            enabled: self.enabled,
            player: PlayerCommand {
                program: self.player_command.clone(),
                args: self.player_args.clone(),
            },
            pre_stop: Duration::from_secs(self.pre_stop_secs),
            near_bell_buffer: Duration::from_secs(self.near_bell_buffer_secs),
            post_bell_restart: Duration::from_secs(self.post_bell_restart_secs),
            bell_sound: self.bell_sound.as_ref().map(PathBuf::from),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub bell: BellConfig,
    pub relay: RelayConfig,
    pub music: MusicConfig,
}

impl Config {
    const ENV_PREFIX: &str = "SCHOOLBELL_";

    fn default() -> Self {
        Config {
            logging: LoggingConfig::default(),
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            bell: BellConfig::default(),
            relay: RelayConfig::default(),
            music: MusicConfig::default(),
        }
    }

    /// Loads the configuration from a TOML file located in the app's data directory,
    /// with `SCHOOLBELL_` environment variables layered on top (`__` separates
    /// sections, e.g. `SCHOOLBELL_BELL__PULSE_MS`).
    /// If the file is missing or fails to parse, defaults are used.
    /// Additionally, writes the default config to disk if no file exists.
    pub fn load_config(project_dirs: &ProjectDirs) -> Self {
        let config_path = project_dirs.data_local_dir().join("config.toml");

        if !config_path.exists() {
            Self::write_default(&config_path);
        }

        Self::load_from(&config_path)
    }

    fn write_default(config_path: &Path) {
        if let Some(parent) = config_path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                eprintln!(
                    "Failed to create configuration directory {}: {}",
                    parent.display(),
                    e
                );
            }
        }
        match toml::to_string_pretty(&Self::default()) {
            Ok(toml_string) => {
                if let Err(e) = fs::write(config_path, toml_string) {
                    eprintln!(
                        "Failed to write default config to {}: {}",
                        config_path.display(),
                        e
                    );
                }
            }
            Err(_) => eprintln!("Failed to serialize default config."),
        }
    }

    pub fn load_from(config_path: &Path) -> Self {
        let default_config = Self::default();

        let figment = Figment::from(Serialized::defaults(default_config.clone()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed(Self::ENV_PREFIX).split("__"));

        let mut config = figment.extract().unwrap_or_else(|err| {
            eprintln!(
                "Could not load config file {}: {}. Using default configuration.",
                config_path.display(),
                err
            );
            default_config
        });

        config.ensure_valid();

        config
    }

    fn ensure_valid(&mut self) {
        self.logging.ensure_valid();
        self.bell.ensure_valid();
        self.relay.ensure_valid();
        self.music.ensure_valid();
    }

    pub fn relay_settings(&self) -> RelaySettings {
        self.relay
            .settings(self.bell.pulse_floor_ms, self.bell.pulse_max_ms)
    }
}
