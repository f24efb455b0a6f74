use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use log::info;

use crate::api::state::AppState;
use crate::clock::{now_in, SystemClock};
use crate::config::{Config, CONFIG};
use crate::db::Database;
use crate::error::BellError;
use crate::events::{EventBroadcaster, EventSink};
use crate::models::{DayScheduleUpdate, PlaylistMode};
use crate::relay::Relay;
use crate::scheduler::{resolve_day, BellScheduler, SchedulerDeps};

/// Buffered events per display connection before it starts lagging
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Parser)]
#[command(
    name = "schoolbell",
    version,
    about = "schoolbell: school bell ringer and background music scheduler"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the bell scheduler and server (default if no command specified)
    Serve,

    /// Print today's ring schedule
    Today,

    /// Ring the bell once through the configured relay
    Fire {
        /// Pulse length in milliseconds (default: bell.pulse_ms from config)
        #[arg(long = "duration-ms", short = 'd')]
        duration_ms: Option<u64>,
    },

    /// Show the most recent bell log entries
    Log {
        /// Number of entries to show
        #[arg(long = "limit", short = 'n', default_value_t = 20)]
        limit: u32,
    },

    /// Manage bell templates
    Template {
        #[command(subcommand)]
        action: TemplateCommand,
    },

    /// Assign a template or playlist to a date, or mark it as a holiday
    Day {
        /// Date as YYYY-MM-DD
        date: NaiveDate,

        #[arg(long = "template", short = 't')]
        template_id: Option<i64>,

        #[arg(long = "playlist", short = 'p')]
        playlist_id: Option<i64>,

        #[arg(long = "holiday", default_value_t = false)]
        holiday: bool,

        #[arg(long = "note")]
        note: Option<String>,
    },

    /// Manage playlists
    Playlist {
        #[command(subcommand)]
        action: PlaylistCommand,
    },

    /// Add a track to a playlist
    Track {
        #[arg(long = "playlist", short = 'p')]
        playlist_id: i64,

        /// Audio file to play
        #[arg(long = "file", short = 'f')]
        file: PathBuf,

        #[arg(long = "title")]
        title: Option<String>,

        /// Position in ordered playback
        #[arg(long = "order", default_value_t = 0)]
        order_index: i64,
    },
}

#[derive(Subcommand)]
pub enum TemplateCommand {
    /// Add a template from a JSON ring spec file
    Add {
        #[arg(long = "name")]
        name: String,

        /// File holding `{"rings": [{"time": "HH:MM", "label": "..."}]}`
        #[arg(long = "file", short = 'f')]
        file: PathBuf,

        #[arg(long = "description")]
        description: Option<String>,

        #[arg(long = "color")]
        color: Option<String>,
    },

    /// Print a template
    Show { id: i64 },

    /// Delete a template; days using it keep their row without a template
    Delete { id: i64 },
}

#[derive(Subcommand)]
pub enum PlaylistCommand {
    /// Add a playlist
    Add {
        #[arg(long = "name")]
        name: String,

        /// SHUFFLE or ORDERED
        #[arg(long = "mode", default_value = "SHUFFLE")]
        mode: PlaylistMode,

        /// Use this playlist on days without their own
        #[arg(long = "default", default_value_t = false)]
        is_default: bool,

        #[arg(long = "inactive", default_value_t = false)]
        inactive: bool,
    },

    /// Delete a playlist and its tracks
    Delete { id: i64 },
}

impl Cli {
    pub fn handle_command_line() -> Result<(), BellError> {
        let args = Cli::parse();

        let project_dirs = ProjectDirs::from("", "", "schoolbell").ok_or_else(|| {
            BellError::Error("Could not determine project directories".into())
        })?;

        let config = CONFIG.get_or_init(|| Config::load_config(&project_dirs));
        let _logger = crate::setup_logging(&project_dirs, config)?;

        let db_path = config
            .database
            .resolve_path(project_dirs.data_local_dir());
        info!("Using database {}", db_path.display());
        let db = Arc::new(Database::open(&db_path)?);

        // Default to Serve if no command specified
        match args.command.unwrap_or(Command::Serve) {
            Command::Serve => Self::start_server(config, db),
            Command::Today => Self::print_today(config, &db),
            Command::Fire { duration_ms } => Self::fire(config, db, duration_ms),
            Command::Log { limit } => Self::print_log(&db, limit),
            Command::Template { action } => Self::template(&db, action),
            Command::Day {
                date,
                template_id,
                playlist_id,
                holiday,
                note,
            } => {
                let update = DayScheduleUpdate {
                    bell_template_id: template_id,
                    playlist_id,
                    is_holiday: holiday,
                    note,
                };
                db.upsert_day(date, &update)?;
                println!("Saved schedule for {}", date);
                Self::print_rehydrate_hint();
                Ok(())
            }
            Command::Playlist { action } => Self::playlist(&db, action),
            Command::Track {
                playlist_id,
                file,
                title,
                order_index,
            } => {
                let id = db.insert_track(
                    playlist_id,
                    &file.to_string_lossy(),
                    title.as_deref(),
                    order_index,
                )?;
                println!("Added track {} to playlist {}", id, playlist_id);
                Ok(())
            }
        }
    }

    fn print_rehydrate_hint() {
        println!("A running server picks this up after POST /api/bell/rehydrate or at midnight");
    }

    fn runtime() -> Result<tokio::runtime::Runtime, BellError> {
        tokio::runtime::Runtime::new()
            .map_err(|e| BellError::Error(format!("Failed to create runtime: {}", e)))
    }

    fn start_scheduler(
        config: &Config,
        db: Arc<Database>,
        events: Arc<dyn EventSink>,
        relay: Arc<Relay>,
    ) -> BellScheduler {
        BellScheduler::start(SchedulerDeps {
            settings: config.bell.scheduler_settings(),
            music: config.music.settings(),
            store: db,
            events,
            relay,
            clock: Arc::new(SystemClock),
        })
    }

    fn start_server(config: &Config, db: Arc<Database>) -> Result<(), BellError> {
        let host = config.server.host.clone();
        let port = config.server.port;

        info!("Starting server on {}:{}", host, port);

        Self::runtime()?.block_on(async {
            let events = Arc::new(EventBroadcaster::new(EVENT_CHANNEL_CAPACITY));
            let relay = Arc::new(Relay::new(config.relay_settings()));
            let scheduler = Self::start_scheduler(config, db, events.clone(), relay);

            let web_server =
                crate::server::WebServer::new(host, port, AppState::new(scheduler, events));
            web_server.start().await
        })
    }

    fn print_today(config: &Config, db: &Database) -> Result<(), BellError> {
        let tz = config.bell.time_zone();
        let today = now_in(&SystemClock, tz).date_naive();
        let day = resolve_day(db, tz, today)?;

        print!("{} ({})", day.date, tz);
        if day.is_holiday {
            print!(" - holiday, no bells");
        }
        println!();

        if day.rings.is_empty() {
            println!("  no rings scheduled");
        }
        for ring in &day.rings {
            println!("  {}  {}", ring.ts, ring.label);
        }
        Ok(())
    }

    fn fire(config: &Config, db: Arc<Database>, duration_ms: Option<u64>) -> Result<(), BellError> {
        Self::runtime()?.block_on(async {
            let events = Arc::new(EventBroadcaster::new(EVENT_CHANNEL_CAPACITY));
            let relay = Arc::new(Relay::new(config.relay_settings()));
            let scheduler = Self::start_scheduler(config, db, events, relay.clone());

            let result = scheduler.fire_now(duration_ms).await?;
            scheduler.shutdown().await?;

            println!("Bell trigger: {} (relay backend: {})", result, relay.backend_kind().await);
            Ok(())
        })
    }

    fn print_log(db: &Database, limit: u32) -> Result<(), BellError> {
        let entries = db.recent_bell_log(limit)?;
        if entries.is_empty() {
            println!("No bell log entries");
        }
        for entry in entries {
            println!(
                "{}  {:<7} {:>6}ms  {:<4}  {}",
                entry.ts_string(),
                entry.action,
                entry.duration_ms,
                entry.result,
                entry.message
            );
        }
        Ok(())
    }

    fn template(db: &Database, action: TemplateCommand) -> Result<(), BellError> {
        match action {
            TemplateCommand::Add {
                name,
                file,
                description,
                color,
            } => {
                let json_spec = fs::read_to_string(&file)?;
                let id = db.insert_template(
                    &name,
                    description.as_deref(),
                    color.as_deref(),
                    &json_spec,
                )?;
                println!("Added template {} ({})", id, name);
            }
            TemplateCommand::Show { id } => match db.get_template(id)? {
                Some(template) => {
                    println!("{}: {}", template.id, template.name);
                    if let Some(description) = &template.description {
                        println!("  {}", description);
                    }
                    println!("  {}", template.json_spec);
                }
                None => println!("No template with id {}", id),
            },
            TemplateCommand::Delete { id } => {
                if db.delete_template(id)? {
                    println!("Deleted template {}", id);
                    Self::print_rehydrate_hint();
                } else {
                    println!("No template with id {}", id);
                }
            }
        }
        Ok(())
    }

    fn playlist(db: &Database, action: PlaylistCommand) -> Result<(), BellError> {
        match action {
            PlaylistCommand::Add {
                name,
                mode,
                is_default,
                inactive,
            } => {
                let id = db.insert_playlist(&name, mode, !inactive, is_default)?;
                println!("Added playlist {} ({}, {})", id, name, mode);
            }
            PlaylistCommand::Delete { id } => {
                if db.delete_playlist(id)? {
                    println!("Deleted playlist {}", id);
                } else {
                    println!("No playlist with id {}", id);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_cli_parsing_no_command_defaults_to_serve() {
        let result = Cli::try_parse_from(["schoolbell"]);
        assert!(result.is_ok(), "Should accept no command");

        let cli = result.unwrap();
        assert!(cli.command.is_none());
        assert!(matches!(cli.command.unwrap_or(Command::Serve), Command::Serve));
    }

    #[test]
    fn test_cli_parsing_explicit_commands() {
        let cli = Cli::try_parse_from(["schoolbell", "serve"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Serve)));

        let cli = Cli::try_parse_from(["schoolbell", "today"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Today)));
    }

    #[test]
    fn test_cli_parsing_fire_duration() {
        let cli = Cli::try_parse_from(["schoolbell", "fire"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Fire { duration_ms: None })));

        let cli = Cli::try_parse_from(["schoolbell", "fire", "--duration-ms", "1200"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Command::Fire {
                duration_ms: Some(1200)
            })
        ));

        let result = Cli::try_parse_from(["schoolbell", "fire", "-d", "soon"]);
        assert!(result.is_err(), "Should reject a non-numeric duration");
    }

    #[test]
    fn test_cli_parsing_admin_commands() {
        let cli = Cli::try_parse_from([
            "schoolbell", "day", "2025-01-15", "--template", "3", "--holiday",
        ])
        .unwrap();
        match cli.command {
            Some(Command::Day {
                date,
                template_id,
                playlist_id,
                holiday,
                ..
            }) => {
                assert_eq!(date, NaiveDate::from_ymd_opt(2025, 1, 15).unwrap());
                assert_eq!(template_id, Some(3));
                assert_eq!(playlist_id, None);
                assert!(holiday);
            }
            _ => panic!("expected day command"),
        }

        let cli = Cli::try_parse_from([
            "schoolbell", "playlist", "add", "--name", "Calm", "--mode", "ordered",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Some(Command::Playlist {
                action: PlaylistCommand::Add {
                    mode: PlaylistMode::Ordered,
                    is_default: false,
                    ..
                }
            })
        ));

        assert!(Cli::try_parse_from(["schoolbell", "day", "15/01/2025"]).is_err());
        assert!(Cli::try_parse_from(["schoolbell", "log", "-n", "5"]).is_ok());
    }

    #[test]
    fn test_cli_parsing_invalid_arguments() {
        let result = Cli::try_parse_from(["schoolbell", "nonexistent-command"]);
        assert!(result.is_err(), "Should reject unknown commands");

        let result = Cli::try_parse_from(["schoolbell", "serve", "--invalid-flag"]);
        assert!(result.is_err(), "Should reject unknown flags on serve");
    }
}
