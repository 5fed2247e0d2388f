use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use tracing::{debug, warn};

use crate::config::HomeAssistant;
use crate::snapshot::{EntityState, GateKind, GateSnapshot, PlayerSnapshot};

/// Read-only access to the smart-home entity store.
pub trait StateSource {
    /// Returns `None` when the entity does not exist.
    fn entity_state(&self, entity_id: &str) -> Result<Option<EntityState>>;
}

pub struct HomeAssistantClient {
    base_url: String,
    token: String,
    http: Client,
}

impl HomeAssistantClient {
    pub fn new(settings: &HomeAssistant) -> Result<Self> {
        if settings.token.is_empty() {
            bail!("Missing Home Assistant access token");
        }
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed building HTTP client")?;
        Ok(Self {
            base_url: settings.url.trim_end_matches('/').to_string(),
            token: settings.token.clone(),
            http,
        })
    }

    fn state_url(&self, entity_id: &str) -> String {
        format!("{}/api/states/{entity_id}", self.base_url)
    }
}

impl StateSource for HomeAssistantClient {
    fn entity_state(&self, entity_id: &str) -> Result<Option<EntityState>> {
        let url = self.state_url(entity_id);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .with_context(|| format!("Failed requesting {url}"))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response
            .error_for_status()
            .with_context(|| format!("Home Assistant refused state of {entity_id}"))?;
        let state = response
            .json::<EntityState>()
            .with_context(|| format!("Failed parsing state of {entity_id}"))?;
        Ok(Some(state))
    }
}

/// Snapshots of the configured players, in priority order.
pub fn poll_players(
    source: &dyn StateSource,
    entity_ids: &[String],
) -> Result<Vec<PlayerSnapshot>> {
    let mut players = Vec::with_capacity(entity_ids.len());
    for entity_id in entity_ids {
        let snapshot = match source.entity_state(entity_id)? {
            Some(state) => PlayerSnapshot::from_entity(&state),
            None => {
                debug!("Media player {entity_id} not found, treating it as idle");
                PlayerSnapshot::absent(entity_id)
            }
        };
        players.push(snapshot);
    }
    Ok(players)
}

pub fn poll_gates(source: &dyn StateSource, entity_ids: &[String]) -> Result<Vec<GateSnapshot>> {
    let mut gates = Vec::with_capacity(entity_ids.len());
    for entity_id in entity_ids {
        let kind = GateKind::for_entity(entity_id)?;
        let state = source.entity_state(entity_id)?;
        if state.is_none() {
            warn!("Check entity {entity_id} not found");
        }
        let gate = GateSnapshot::new(
            entity_id,
            kind,
            state.as_ref().map(|entity| entity.state.as_str()),
        );
        debug!(
            "Checking {entity_id} ({:?}): satisfied={}",
            gate.kind, gate.satisfied
        );
        gates.push(gate);
    }
    Ok(gates)
}
