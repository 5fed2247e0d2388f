use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::service::ScrobbleService;
use crate::snapshot::{GateSnapshot, Measure, PlayerSnapshot};

pub const DEFAULT_SCROBBLE_PERCENTAGE: u8 = 50;
/// Tracks count as played after four minutes whatever their length.
pub const SCROBBLE_AFTER_SECONDS: f64 = 240.0;

const RADIO_CONTENT_MARKER: &str = "radio";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackKey {
    pub artist: String,
    pub title: String,
    pub album: Option<String>,
}

impl std::fmt::Display for TrackKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} by {}", self.title, self.artist)
    }
}

/// How multi-artist strings from aggregated players are reduced to one artist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtistSplitRule {
    pub delimiter: String,
    /// Artist names that contain the delimiter but must be kept whole.
    #[serde(default)]
    pub exemptions: Vec<String>,
}

impl Default for ArtistSplitRule {
    fn default() -> Self {
        Self {
            delimiter: "/".to_string(),
            exemptions: vec!["AC/DC".to_string()],
        }
    }
}

impl ArtistSplitRule {
    pub fn primary_artist<'a>(&self, artist: &'a str) -> &'a str {
        if self.delimiter.is_empty() || !artist.contains(self.delimiter.as_str()) {
            return artist;
        }
        if self
            .exemptions
            .iter()
            .any(|exempt| exempt.eq_ignore_ascii_case(artist.trim()))
        {
            return artist;
        }
        let primary = artist
            .split(self.delimiter.as_str())
            .next()
            .unwrap_or_default()
            .trim();
        if primary.is_empty() { artist } else { primary }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub scrobble_percentage: u8,
    pub update_now_playing: bool,
    pub artist_split: ArtistSplitRule,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scrobble_percentage: DEFAULT_SCROBBLE_PERCENTAGE,
            update_now_playing: false,
            artist_split: ArtistSplitRule::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    NowPlaying {
        track: TrackKey,
        duration: Option<u32>,
    },
    Scrobble {
        track: TrackKey,
        duration: Option<u32>,
        timestamp: i64,
    },
}

impl Action {
    pub fn track(&self) -> &TrackKey {
        match self {
            Action::NowPlaying { track, .. } | Action::Scrobble { track, .. } => track,
        }
    }
}

/// Everything the engine remembers between ticks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineState {
    pub last_now_playing: Option<TrackKey>,
    pub last_scrobbled: Option<TrackKey>,
}

impl EngineState {
    /// Marks an action as accepted by the remote service.
    pub fn record(&mut self, action: &Action) {
        match action {
            Action::NowPlaying { track, .. } => self.last_now_playing = Some(track.clone()),
            Action::Scrobble { track, .. } => self.last_scrobbled = Some(track.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Idle,
    Accepted(Action),
    Failed(Action),
}

/// The active player's track after normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub track: TrackKey,
    pub duration: Measure,
    pub position: Measure,
}

impl Candidate {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn duration_hint(&self) -> Option<u32> {
        let duration = self.duration.value().filter(|value| *value >= 1.0)?;
        Some(duration.min(f64::from(u32::MAX)) as u32)
    }
}

pub struct ScrobbleDecisionEngine {
    config: EngineConfig,
    state: EngineState,
}

impl ScrobbleDecisionEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            state: EngineState::default(),
        }
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    /// Runs one poll tick: decides on at most one action and dispatches it.
    ///
    /// State only advances when the service accepts the call, so a failed
    /// action is decided again on the next tick.
    pub fn tick(
        &mut self,
        players: &[PlayerSnapshot],
        gates: &[GateSnapshot],
        now: DateTime<Utc>,
        service: &dyn ScrobbleService,
    ) -> TickOutcome {
        let Some(action) = decide(&self.state, &self.config, players, gates, now) else {
            return TickOutcome::Idle;
        };
        let result = match &action {
            Action::NowPlaying { track, duration } => {
                service.update_now_playing(track, *duration)
            }
            Action::Scrobble {
                track,
                duration,
                timestamp,
            } => service.scrobble(track, *duration, *timestamp),
        };
        let track = action.track();
        let is_scrobble = matches!(action, Action::Scrobble { .. });
        match result {
            Ok(()) if is_scrobble => info!("Successfully scrobbled {track}"),
            Ok(()) => info!("Now playing {track}"),
            Err(err) => {
                if is_scrobble {
                    error!("Failed to scrobble {track}: {err}");
                } else {
                    error!("Failed to update now playing to {track}: {err}");
                }
                return TickOutcome::Failed(action);
            }
        }
        self.state.record(&action);
        TickOutcome::Accepted(action)
    }
}

/// Picks the action for this tick without touching any state.
pub fn decide(
    state: &EngineState,
    config: &EngineConfig,
    players: &[PlayerSnapshot],
    gates: &[GateSnapshot],
    now: DateTime<Utc>,
) -> Option<Action> {
    if !gates_pass(gates) {
        return None;
    }
    let player = select_active_player(players)?;
    debug!("Highest priority active player: {}", player.entity_id);
    let mut candidate = normalize(player, &config.artist_split)?;
    candidate.position =
        effective_position(player.position_seconds, player.position_timestamp, now);

    if scrobble_due(&candidate, config.scrobble_percentage)
        && state.last_scrobbled.as_ref() != Some(&candidate.track)
    {
        return Some(Action::Scrobble {
            duration: candidate.duration_hint(),
            track: candidate.track,
            timestamp: now.timestamp(),
        });
    }
    if config.update_now_playing && state.last_now_playing.as_ref() != Some(&candidate.track) {
        return Some(Action::NowPlaying {
            duration: candidate.duration_hint(),
            track: candidate.track,
        });
    }
    None
}

pub fn gates_pass(gates: &[GateSnapshot]) -> bool {
    for gate in gates {
        if !gate.satisfied {
            debug!("{} prevents scrobbling", gate.entity_id);
            return false;
        }
    }
    true
}

/// First player in priority order that is playing and names a track.
pub fn select_active_player(players: &[PlayerSnapshot]) -> Option<&PlayerSnapshot> {
    players
        .iter()
        .filter(|player| player.is_playing)
        .find(|player| {
            let usable = player.has_track_metadata();
            if !usable {
                debug!(
                    "{} is playing but missing artist/track info",
                    player.entity_id
                );
            }
            usable
        })
}

pub fn normalize(player: &PlayerSnapshot, rule: &ArtistSplitRule) -> Option<Candidate> {
    let artist = player.artist.as_deref().filter(|value| !value.is_empty())?;
    let title = player.title.as_deref().filter(|value| !value.is_empty())?;
    let mut album = player.album.clone().filter(|value| !value.is_empty());
    let mut duration = player.duration_seconds;

    let artist = if player.is_assistant_aggregated {
        let primary = rule.primary_artist(artist);
        if primary != artist {
            debug!("Reduced multi-artist {artist:?} to {primary:?}");
        }
        primary
    } else {
        artist
    };

    let is_radio = player
        .raw_content_id
        .as_deref()
        .is_some_and(|content| content.contains(RADIO_CONTENT_MARKER));
    if player.is_assistant_aggregated && is_radio {
        debug!("Ignoring album and duration from radio playback");
        album = None;
        duration = Measure::Missing;
    }

    Some(Candidate {
        track: TrackKey {
            artist: artist.to_string(),
            title: title.to_string(),
            album,
        },
        duration,
        position: player.position_seconds,
    })
}

/// Reported position plus the wall-clock time since it was reported.
pub fn effective_position(
    position: Measure,
    updated_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Measure {
    let base = match position {
        Measure::Missing => 0.0,
        Measure::Value(value) => value,
        Measure::Malformed => return Measure::Malformed,
    };
    let Some(updated_at) = updated_at else {
        return Measure::Value(base);
    };
    #[allow(clippy::cast_precision_loss)]
    let elapsed = (now - updated_at).num_milliseconds().max(0) as f64 / 1000.0;
    Measure::Value(base + elapsed)
}

fn scrobble_due(candidate: &Candidate, scrobble_percentage: u8) -> bool {
    let Some(duration) = candidate.duration.value().filter(|value| *value > 0.0) else {
        return false;
    };
    let Some(position) = candidate.position.value() else {
        return false;
    };
    let percentage = position / duration * 100.0;
    debug!(
        "{} at {position:.0}/{duration:.0} ({percentage:.1}%)",
        candidate.track
    );
    percentage >= f64::from(scrobble_percentage) || position >= SCROBBLE_AFTER_SECONDS
}
