use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::scrobble::{ArtistSplitRule, DEFAULT_SCROBBLE_PERCENTAGE, EngineConfig};
use crate::service::Service;
use crate::snapshot::GateKind;

pub const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceKeys {
    #[serde(default)]
    pub service: Service,
    pub api_key: String,
    pub api_secret: String,
    pub session_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HomeAssistant {
    pub url: String,
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub home_assistant: Option<HomeAssistant>,
    #[serde(default)]
    pub service: Option<ServiceKeys>,
    /// Media player entity ids, highest priority first.
    #[serde(default)]
    pub media_players: Vec<String>,
    /// Entities that must all agree before anything is sent.
    #[serde(default)]
    pub check_entities: Vec<String>,
    #[serde(default = "default_scrobble_percentage")]
    pub scrobble_percentage: u8,
    #[serde(default)]
    pub update_now_playing: bool,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    #[serde(default)]
    pub artist_split: ArtistSplitRule,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            home_assistant: None,
            service: None,
            media_players: Vec::new(),
            check_entities: Vec::new(),
            scrobble_percentage: DEFAULT_SCROBBLE_PERCENTAGE,
            update_now_playing: false,
            poll_interval_seconds: DEFAULT_POLL_INTERVAL_SECONDS,
            artist_split: ArtistSplitRule::default(),
        }
    }
}

impl Config {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            scrobble_percentage: self.scrobble_percentage,
            update_now_playing: self.update_now_playing,
            artist_split: self.artist_split.clone(),
        }
    }

    /// Checks everything `run` relies on.
    pub fn validate(&self) -> Result<()> {
        if self.home_assistant.is_none() {
            bail!("Home Assistant connection not configured.");
        }
        if self.service.is_none() {
            bail!("Scrobble service keys not configured.");
        }
        if self.media_players.is_empty() {
            bail!("No media players configured.");
        }
        if self.scrobble_percentage > 100 {
            bail!(
                "Scrobble percentage must be between 0 and 100, got {}",
                self.scrobble_percentage
            );
        }
        if self.poll_interval_seconds == 0 {
            bail!("Poll interval must be at least one second.");
        }
        if self.artist_split.delimiter.is_empty() {
            bail!("Artist split delimiter must not be empty.");
        }
        for entity_id in &self.check_entities {
            GateKind::for_entity(entity_id)?;
        }
        Ok(())
    }
}

fn default_scrobble_percentage() -> u8 {
    DEFAULT_SCROBBLE_PERCENTAGE
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECONDS
}

pub fn default_config_path() -> PathBuf {
    let fallback = PathBuf::from(".config/hass-scrobbler/config.json");
    dirs::home_dir().map_or(fallback, |home| {
        home.join(".config/hass-scrobbler/config.json")
    })
}

pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed reading config at {}", path.display()))?;
    let config = serde_json::from_str(&raw)
        .with_context(|| format!("Failed parsing config at {}", path.display()))?;
    Ok(config)
}

pub fn save_config(config: &Config, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed creating config directory {}", parent.display()))?;
    }
    let serialized =
        serde_json::to_string_pretty(config).context("Failed serializing config to JSON")?;
    fs::write(path, format!("{serialized}\n"))
        .with_context(|| format!("Failed writing config at {}", path.display()))?;
    Ok(())
}

pub fn set_service_keys(
    config: &mut Config,
    service: Service,
    api_key: &str,
    api_secret: &str,
    session_key: &str,
) {
    config.service = Some(ServiceKeys {
        service,
        api_key: api_key.to_string(),
        api_secret: api_secret.to_string(),
        session_key: session_key.to_string(),
    });
}

pub fn set_home_assistant(config: &mut Config, url: &str, token: &str) {
    config.home_assistant = Some(HomeAssistant {
        url: url.trim_end_matches('/').to_string(),
        token: token.to_string(),
    });
}

/// Inserts a player at `position` (1-based) or appends it; an already
/// configured player is moved.
pub fn add_media_player(config: &mut Config, entity_id: &str, position: Option<usize>) {
    config.media_players.retain(|player| player != entity_id);
    let index = position
        .map_or(config.media_players.len(), |position| position.saturating_sub(1))
        .min(config.media_players.len());
    config.media_players.insert(index, entity_id.to_string());
}

pub fn remove_media_player(config: &mut Config, entity_id: &str) -> bool {
    let original_len = config.media_players.len();
    config.media_players.retain(|player| player != entity_id);
    config.media_players.len() != original_len
}

pub fn add_check_entity(config: &mut Config, entity_id: &str) -> Result<()> {
    GateKind::for_entity(entity_id)?;
    if !config.check_entities.iter().any(|check| check == entity_id) {
        config.check_entities.push(entity_id.to_string());
    }
    Ok(())
}

pub fn remove_check_entity(config: &mut Config, entity_id: &str) -> bool {
    let original_len = config.check_entities.len();
    config.check_entities.retain(|check| check != entity_id);
    config.check_entities.len() != original_len
}
