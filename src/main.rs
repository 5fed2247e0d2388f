use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod homeassistant;
mod scrobble;
mod service;
mod snapshot;

use crate::config::{
    Config, add_check_entity, add_media_player, default_config_path, load_config,
    remove_check_entity, remove_media_player, save_config, set_home_assistant, set_service_keys,
};
use crate::homeassistant::{HomeAssistantClient, StateSource, poll_gates, poll_players};
use crate::scrobble::{ScrobbleDecisionEngine, TickOutcome, gates_pass};
use crate::service::{DryRunService, ScrobbleClient, ScrobbleService, Service};

#[derive(Parser)]
#[command(
    name = "hass-scrobbler",
    version,
    about = "Scrobble Home Assistant media players to Last.fm"
)]
struct Cli {
    #[arg(short, long, global = true, help = "Log per-tick decisions")]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Service {
        #[command(subcommand)]
        command: ServiceCommand,
    },
    HomeAssistant {
        #[command(subcommand)]
        command: HomeAssistantCommand,
    },
    Player {
        #[command(subcommand)]
        command: EntityCommand,
    },
    Check {
        #[command(subcommand)]
        command: EntityCommand,
    },
    Options(OptionsArgs),
    Run(RunArgs),
}

#[derive(Subcommand)]
enum ServiceCommand {
    SetKeys {
        #[arg(help = "lastfm or librefm")]
        service: String,
        #[arg(long, help = "API key")]
        api_key: String,
        #[arg(long, help = "API secret")]
        api_secret: String,
        #[arg(long, help = "Session key for the scrobbling account")]
        session_key: Option<String>,
        #[arg(long, value_name = "PATH")]
        config_path: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum HomeAssistantCommand {
    Set {
        #[arg(long, help = "Base URL, e.g. http://homeassistant.local:8123")]
        url: String,
        #[arg(long, help = "Long-lived access token")]
        token: Option<String>,
        #[arg(long, value_name = "PATH")]
        config_path: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum EntityCommand {
    Add {
        entity_id: String,
        #[arg(long, help = "Priority slot, 1 is highest (players only)")]
        position: Option<usize>,
        #[arg(long, value_name = "PATH")]
        config_path: Option<PathBuf>,
    },
    Remove {
        entity_id: String,
        #[arg(long, value_name = "PATH")]
        config_path: Option<PathBuf>,
    },
    List {
        #[arg(long, value_name = "PATH")]
        config_path: Option<PathBuf>,
    },
}

#[derive(Parser)]
struct OptionsArgs {
    #[arg(
        long,
        value_parser = clap::value_parser!(u8).range(0..=100),
        help = "Percentage of a track that must be played"
    )]
    scrobble_percentage: Option<u8>,
    #[arg(long, help = "Send now playing updates")]
    update_now_playing: Option<bool>,
    #[arg(long, help = "Seconds between polls")]
    poll_interval: Option<u64>,
    #[arg(long, help = "Separator between artists from Music Assistant")]
    artist_delimiter: Option<String>,
    #[arg(
        long,
        value_delimiter = ',',
        help = "Artists never split, comma separated"
    )]
    artist_exemptions: Option<Vec<String>>,
    #[arg(long, value_name = "PATH")]
    config_path: Option<PathBuf>,
}

#[derive(Parser)]
struct RunArgs {
    #[arg(long, default_value_t = false, help = "Poll a single time and exit")]
    once: bool,
    #[arg(
        long,
        default_value_t = false,
        help = "Decide and log without contacting the scrobble service"
    )]
    dry_run: bool,
    #[arg(long, value_name = "PATH")]
    config_path: Option<PathBuf>,
}

#[derive(Clone, Copy)]
enum EntityList {
    Players,
    Checks,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    if let Err(err) = run(cli) {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose {
        "hass_scrobbler=debug"
    } else {
        "hass_scrobbler=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Service { command } => match command {
            ServiceCommand::SetKeys {
                service,
                api_key,
                api_secret,
                session_key,
                config_path,
            } => {
                let service = Service::parse(&service)?;
                let session_key = match session_key {
                    Some(value) => value,
                    None => prompt_secret("Session key")?,
                };
                let config_path = config_path.unwrap_or_else(default_config_path);
                let mut config = load_config(&config_path)?;
                set_service_keys(&mut config, service, &api_key, &api_secret, &session_key);
                save_config(&config, &config_path)?;
                println!("Saved {service:?} keys in {}", config_path.display());
            }
        },
        Commands::HomeAssistant { command } => match command {
            HomeAssistantCommand::Set {
                url,
                token,
                config_path,
            } => {
                let token = match token {
                    Some(value) => value,
                    None => prompt_secret("Access token")?,
                };
                let config_path = config_path.unwrap_or_else(default_config_path);
                let mut config = load_config(&config_path)?;
                set_home_assistant(&mut config, &url, &token);
                save_config(&config, &config_path)?;
                println!("Saved Home Assistant at {url} in {}", config_path.display());
            }
        },
        Commands::Player { command } => handle_entities(EntityList::Players, command)?,
        Commands::Check { command } => handle_entities(EntityList::Checks, command)?,
        Commands::Options(args) => handle_options(args)?,
        Commands::Run(args) => handle_run(args)?,
    }
    Ok(())
}

fn handle_entities(list: EntityList, command: EntityCommand) -> Result<()> {
    match command {
        EntityCommand::Add {
            entity_id,
            position,
            config_path,
        } => {
            let config_path = config_path.unwrap_or_else(default_config_path);
            let mut config = load_config(&config_path)?;
            match list {
                EntityList::Players => add_media_player(&mut config, &entity_id, position),
                EntityList::Checks => {
                    if position.is_some() {
                        bail!("Check entities have no priority.");
                    }
                    add_check_entity(&mut config, &entity_id)?;
                }
            }
            save_config(&config, &config_path)?;
            println!("Added {entity_id}");
        }
        EntityCommand::Remove {
            entity_id,
            config_path,
        } => {
            let config_path = config_path.unwrap_or_else(default_config_path);
            let mut config = load_config(&config_path)?;
            let removed = match list {
                EntityList::Players => remove_media_player(&mut config, &entity_id),
                EntityList::Checks => remove_check_entity(&mut config, &entity_id),
            };
            if !removed {
                bail!("{entity_id} is not configured");
            }
            save_config(&config, &config_path)?;
            println!("Removed {entity_id}");
        }
        EntityCommand::List { config_path } => {
            let config_path = config_path.unwrap_or_else(default_config_path);
            let config = load_config(&config_path)?;
            let entities = match list {
                EntityList::Players => &config.media_players,
                EntityList::Checks => &config.check_entities,
            };
            if entities.is_empty() {
                bail!("No entities configured.");
            }
            for (index, entity_id) in entities.iter().enumerate() {
                println!("{}\t{entity_id}", index + 1);
            }
        }
    }
    Ok(())
}

fn handle_options(args: OptionsArgs) -> Result<()> {
    let config_path = args.config_path.unwrap_or_else(default_config_path);
    let mut config = load_config(&config_path)?;
    let mut changed = false;
    if let Some(value) = args.scrobble_percentage {
        config.scrobble_percentage = value;
        changed = true;
    }
    if let Some(value) = args.update_now_playing {
        config.update_now_playing = value;
        changed = true;
    }
    if let Some(value) = args.poll_interval {
        if value == 0 {
            bail!("Poll interval must be at least one second.");
        }
        config.poll_interval_seconds = value;
        changed = true;
    }
    if let Some(value) = args.artist_delimiter {
        if value.is_empty() {
            bail!("Artist delimiter must not be empty.");
        }
        config.artist_split.delimiter = value;
        changed = true;
    }
    if let Some(values) = args.artist_exemptions {
        config.artist_split.exemptions = values;
        changed = true;
    }
    if changed {
        save_config(&config, &config_path)?;
    }
    println!("scrobble_percentage\t{}", config.scrobble_percentage);
    println!("update_now_playing\t{}", config.update_now_playing);
    println!("poll_interval_seconds\t{}", config.poll_interval_seconds);
    println!("artist_delimiter\t{:?}", config.artist_split.delimiter);
    println!(
        "artist_exemptions\t{}",
        config.artist_split.exemptions.join(",")
    );
    Ok(())
}

fn handle_run(args: RunArgs) -> Result<()> {
    let config_path = args.config_path.unwrap_or_else(default_config_path);
    let config = load_config(&config_path)?;
    config
        .validate()
        .with_context(|| format!("Invalid config at {}", config_path.display()))?;
    let (Some(home_assistant), Some(keys)) = (&config.home_assistant, &config.service) else {
        bail!("Incomplete config at {}", config_path.display());
    };

    let source = HomeAssistantClient::new(home_assistant)?;
    let service: Box<dyn ScrobbleService> = if args.dry_run {
        Box::new(DryRunService)
    } else {
        Box::new(ScrobbleClient::new(keys)?)
    };
    let mut engine = ScrobbleDecisionEngine::new(config.engine_config());
    let interval = Duration::from_secs(config.poll_interval_seconds);
    info!(
        "Watching {} media players every {}s",
        config.media_players.len(),
        interval.as_secs()
    );

    loop {
        let started = Instant::now();
        if let Err(err) = poll_once(&mut engine, &source, service.as_ref(), &config) {
            warn!("Skipping poll: {err:#}");
        }
        if args.once {
            return Ok(());
        }
        thread::sleep(interval.saturating_sub(started.elapsed()));
    }
}

fn poll_once(
    engine: &mut ScrobbleDecisionEngine,
    source: &dyn StateSource,
    service: &dyn ScrobbleService,
    config: &Config,
) -> Result<TickOutcome> {
    let gates = poll_gates(source, &config.check_entities)?;
    if !gates_pass(&gates) {
        debug!("A check entity prevents scrobbling");
        return Ok(TickOutcome::Idle);
    }
    let players = poll_players(source, &config.media_players)?;
    let outcome = engine.tick(&players, &gates, Utc::now(), service);
    if let Some(track) = &engine.state().last_scrobbled {
        debug!("Last scrobbled {track}");
    }
    Ok(outcome)
}

fn prompt_secret(label: &str) -> Result<String> {
    let value = rpassword::prompt_password(format!("{label}: "))?;
    if value.is_empty() {
        bail!("{label} must not be empty.");
    }
    Ok(value)
}
