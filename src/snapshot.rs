use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};

pub const STATE_PLAYING: &str = "playing";
const STATE_ON: &str = "on";
const STATE_HOME: &str = "home";

/// A numeric media attribute as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Measure {
    #[default]
    Missing,
    Value(f64),
    Malformed,
}

impl Measure {
    pub fn from_value(value: Option<&Value>) -> Self {
        match value {
            None | Some(Value::Null) => Measure::Missing,
            Some(Value::Number(number)) => number
                .as_f64()
                .filter(|value| value.is_finite())
                .map_or(Measure::Malformed, Measure::Value),
            Some(_) => Measure::Malformed,
        }
    }

    pub fn value(self) -> Option<f64> {
        match self {
            Measure::Value(value) => Some(value),
            Measure::Missing | Measure::Malformed => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlayerSnapshot {
    pub entity_id: String,
    pub is_playing: bool,
    pub artist: Option<String>,
    pub title: Option<String>,
    pub album: Option<String>,
    pub duration_seconds: Measure,
    pub position_seconds: Measure,
    pub position_timestamp: Option<DateTime<Utc>>,
    /// Set for Music Assistant players, which report `mass_player_type`.
    pub is_assistant_aggregated: bool,
    pub raw_content_id: Option<String>,
}

impl PlayerSnapshot {
    /// Snapshot for an entity that does not exist in the state store.
    pub fn absent(entity_id: &str) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            ..Self::default()
        }
    }

    pub fn from_entity(entity: &EntityState) -> Self {
        let attrs = &entity.attributes;
        Self {
            entity_id: entity.entity_id.clone(),
            is_playing: entity.state == STATE_PLAYING,
            artist: string_attr(attrs, "media_artist"),
            title: string_attr(attrs, "media_title"),
            album: string_attr(attrs, "media_album_name"),
            duration_seconds: Measure::from_value(attrs.get("media_duration")),
            position_seconds: Measure::from_value(attrs.get("media_position")),
            position_timestamp: attrs
                .get("media_position_updated_at")
                .and_then(parse_timestamp),
            is_assistant_aggregated: attrs
                .get("mass_player_type")
                .is_some_and(is_truthy),
            raw_content_id: string_attr(attrs, "media_content_id"),
        }
    }

    pub fn has_track_metadata(&self) -> bool {
        is_present(self.artist.as_deref()) && is_present(self.title.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateKind {
    /// `input_boolean` and `switch` entities: pass when "on".
    Switch,
    /// `person` entities: pass when "home".
    Presence,
}

impl GateKind {
    pub fn for_entity(entity_id: &str) -> Result<Self> {
        let domain = entity_id.split('.').next().unwrap_or_default();
        match domain {
            "input_boolean" | "switch" => Ok(GateKind::Switch),
            "person" => Ok(GateKind::Presence),
            _ => bail!(
                "Unsupported check entity {entity_id}: expected input_boolean, switch or person"
            ),
        }
    }

    fn passing_state(self) -> &'static str {
        match self {
            GateKind::Switch => STATE_ON,
            GateKind::Presence => STATE_HOME,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateSnapshot {
    pub entity_id: String,
    pub kind: GateKind,
    pub satisfied: bool,
}

impl GateSnapshot {
    /// A missing entity (`state == None`) never satisfies its gate.
    pub fn new(entity_id: &str, kind: GateKind, state: Option<&str>) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            kind,
            satisfied: state == Some(kind.passing_state()),
        }
    }
}

/// Entity state as served by `GET /api/states/<entity_id>`.
#[derive(Debug, Clone, Deserialize)]
pub struct EntityState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

fn string_attr(attrs: &Map<String, Value>, key: &str) -> Option<String> {
    attrs
        .get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn is_present(value: Option<&str>) -> bool {
    value.is_some_and(|value| !value.is_empty())
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::String(text) => !text.is_empty(),
        Value::Number(number) => number.as_f64().is_some_and(|value| value != 0.0),
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(raw) => DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(number) => {
            let seconds = number.as_f64()?;
            if !seconds.is_finite() {
                return None;
            }
            #[allow(clippy::cast_possible_truncation)]
            let millis = (seconds * 1000.0).round() as i64;
            DateTime::<Utc>::from_timestamp_millis(millis)
        }
        _ => None,
    }
}
