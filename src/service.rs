use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::ServiceKeys;
use crate::scrobble::TrackKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    #[default]
    LastFm,
    LibreFm,
}

impl Service {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "lastfm" => Ok(Service::LastFm),
            "librefm" => Ok(Service::LibreFm),
            _ => bail!("Unsupported service: {value}"),
        }
    }

    pub fn base_url(self) -> &'static str {
        match self {
            Service::LastFm => "https://ws.audioscrobbler.com/2.0/",
            Service::LibreFm => "https://libre.fm/2.0/",
        }
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("API error {code}: {message}")]
    Api { code: u32, message: String },
    #[error("invalid API response: {0}")]
    InvalidResponse(#[from] serde_json::Error),
}

/// The two calls the scrobbler makes against a music-tracking service.
pub trait ScrobbleService {
    fn update_now_playing(
        &self,
        track: &TrackKey,
        duration: Option<u32>,
    ) -> Result<(), ServiceError>;

    fn scrobble(
        &self,
        track: &TrackKey,
        duration: Option<u32>,
        timestamp: i64,
    ) -> Result<(), ServiceError>;
}

pub struct ScrobbleClient {
    service: Service,
    api_key: String,
    api_secret: String,
    session_key: String,
    http: Client,
}

impl ScrobbleClient {
    pub fn new(keys: &ServiceKeys) -> Result<Self> {
        if keys.session_key.is_empty() {
            bail!("Missing session key for {:?}", keys.service);
        }
        let http = Client::builder()
            .user_agent(concat!("hass-scrobbler/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed building HTTP client")?;
        Ok(Self {
            service: keys.service,
            api_key: keys.api_key.clone(),
            api_secret: keys.api_secret.clone(),
            session_key: keys.session_key.clone(),
            http,
        })
    }

    fn now_playing_params(
        &self,
        track: &TrackKey,
        duration: Option<u32>,
    ) -> Vec<(String, String)> {
        let mut params = self.track_params("track.updateNowPlaying", track, duration);
        self.sign(&mut params);
        params
    }

    fn scrobble_params(
        &self,
        track: &TrackKey,
        duration: Option<u32>,
        timestamp: i64,
    ) -> Vec<(String, String)> {
        let mut params = self.track_params("track.scrobble", track, duration);
        params.push(("timestamp".to_string(), timestamp.to_string()));
        self.sign(&mut params);
        params
    }

    fn track_params(
        &self,
        method: &str,
        track: &TrackKey,
        duration: Option<u32>,
    ) -> Vec<(String, String)> {
        let mut params = vec![
            ("method".to_string(), method.to_string()),
            ("artist".to_string(), track.artist.clone()),
            ("track".to_string(), track.title.clone()),
            ("api_key".to_string(), self.api_key.clone()),
            ("sk".to_string(), self.session_key.clone()),
        ];
        if let Some(album) = &track.album {
            params.push(("album".to_string(), album.clone()));
        }
        if let Some(duration) = duration.filter(|value| *value > 0) {
            params.push(("duration".to_string(), duration.to_string()));
        }
        params
    }

    fn sign(&self, params: &mut Vec<(String, String)>) {
        let api_sig = sign_params(params, &self.api_secret);
        params.push(("api_sig".to_string(), api_sig));
        params.push(("format".to_string(), "json".to_string()));
    }

    fn post(&self, params: &[(String, String)]) -> Result<String, ServiceError> {
        let url = self.service.base_url();
        let text = self
            .http
            .post(url)
            .form(params)
            .send()
            .and_then(reqwest::blocking::Response::text)
            .map_err(|source| ServiceError::Http { url, source })?;
        debug!("Response from {url}: {text}");
        Ok(text)
    }
}

impl ScrobbleService for ScrobbleClient {
    fn update_now_playing(
        &self,
        track: &TrackKey,
        duration: Option<u32>,
    ) -> Result<(), ServiceError> {
        let text = self.post(&self.now_playing_params(track, duration))?;
        check_api_error(&text)
    }

    fn scrobble(
        &self,
        track: &TrackKey,
        duration: Option<u32>,
        timestamp: i64,
    ) -> Result<(), ServiceError> {
        let text = self.post(&self.scrobble_params(track, duration, timestamp))?;
        check_scrobble_response(&text)
    }
}

/// Logs instead of calling out; every call succeeds.
pub struct DryRunService;

impl ScrobbleService for DryRunService {
    fn update_now_playing(
        &self,
        track: &TrackKey,
        _duration: Option<u32>,
    ) -> Result<(), ServiceError> {
        info!("Would update now playing to {track}");
        Ok(())
    }

    fn scrobble(
        &self,
        track: &TrackKey,
        _duration: Option<u32>,
        timestamp: i64,
    ) -> Result<(), ServiceError> {
        info!("Would scrobble {track} at {timestamp}");
        Ok(())
    }
}

fn sign_params(params: &[(String, String)], secret: &str) -> String {
    let mut sorted = params.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    let mut signature = String::new();
    for (key, value) in sorted {
        signature.push_str(&key);
        signature.push_str(&value);
    }
    signature.push_str(secret);
    format!("{:x}", md5::compute(signature))
}

fn check_api_error(payload: &str) -> Result<(), ServiceError> {
    let json: Value = serde_json::from_str(payload)?;
    if let Some(error) = json.get("error") {
        let code = parse_u32_value(error).unwrap_or_default();
        let message = json
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("API error")
            .to_string();
        return Err(ServiceError::Api { code, message });
    }
    Ok(())
}

/// An ignored scrobble was still received, so only API errors fail the call.
pub(crate) fn check_scrobble_response(payload: &str) -> Result<(), ServiceError> {
    check_api_error(payload)?;
    if let Some((code, message)) = ignored_scrobble(payload) {
        warn!("Scrobble ignored by service (code {code}): {message}");
    }
    Ok(())
}

/// Code and message of an ignored scrobble, if the response reports one.
fn ignored_scrobble(payload: &str) -> Option<(String, String)> {
    let parsed = serde_json::from_str::<ScrobbleResponse>(payload).ok()?;
    let scrobbles = parsed.scrobbles?;
    let accepted = scrobbles.attr.as_ref().map_or(0, |attr| attr.accepted);
    let ignored = scrobbles.attr.as_ref().map_or(0, |attr| attr.ignored);
    if accepted > 0 && ignored == 0 {
        return None;
    }
    let reason = match scrobbles
        .scrobble
        .as_ref()
        .and_then(ScrobbleEntries::first_ignored_message)
    {
        Some(IgnoredMessageField::Object(message)) => (
            message.code.clone().unwrap_or_else(|| "unknown".to_string()),
            message
                .text
                .clone()
                .unwrap_or_else(|| "Scrobble ignored".to_string()),
        ),
        Some(IgnoredMessageField::Text(message)) => ("unknown".to_string(), message.clone()),
        Some(IgnoredMessageField::Number(code)) => {
            (code.to_string(), "Scrobble ignored".to_string())
        }
        None => ("unknown".to_string(), "Scrobble ignored".to_string()),
    };
    Some(reason)
}

fn parse_u32_value(value: &Value) -> Option<u32> {
    if let Some(value) = value.as_u64() {
        return u32::try_from(value).ok();
    }
    value.as_str().and_then(|raw| raw.parse::<u32>().ok())
}

#[derive(Debug, Deserialize)]
struct ScrobbleResponse {
    #[serde(default)]
    scrobbles: Option<Scrobbles>,
}

#[derive(Debug, Deserialize)]
struct Scrobbles {
    #[serde(rename = "@attr")]
    #[serde(default)]
    attr: Option<ScrobbleAttr>,
    #[serde(default)]
    scrobble: Option<ScrobbleEntries>,
}

#[derive(Debug, Deserialize)]
struct ScrobbleAttr {
    #[serde(deserialize_with = "deserialize_u32_string_or_number")]
    accepted: u32,
    #[serde(deserialize_with = "deserialize_u32_string_or_number")]
    ignored: u32,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ScrobbleEntries {
    // Structs also deserialize from sequences, so the list form must come first.
    Many(Vec<ScrobbleEntry>),
    One(ScrobbleEntry),
}

impl ScrobbleEntries {
    fn first_ignored_message(&self) -> Option<&IgnoredMessageField> {
        match self {
            ScrobbleEntries::One(entry) => entry.ignored_message.as_ref(),
            ScrobbleEntries::Many(entries) => entries
                .first()
                .and_then(|entry| entry.ignored_message.as_ref()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ScrobbleEntry {
    #[serde(rename = "ignoredMessage")]
    #[serde(default)]
    ignored_message: Option<IgnoredMessageField>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IgnoredMessageField {
    Object(IgnoredMessage),
    Text(String),
    Number(u32),
}

#[derive(Debug, Deserialize)]
struct IgnoredMessage {
    #[serde(rename = "#text")]
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

fn deserialize_u32_string_or_number<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrU32 {
        String(String),
        Number(u32),
    }
    match StringOrU32::deserialize(deserializer)? {
        StringOrU32::String(value) => value.parse::<u32>().map_err(serde::de::Error::custom),
        StringOrU32::Number(value) => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ScrobbleClient {
        ScrobbleClient::new(&ServiceKeys {
            service: Service::LastFm,
            api_key: "KEY".to_string(),
            api_secret: "SECRET".to_string(),
            session_key: "SK".to_string(),
        })
        .unwrap()
    }

    fn queen() -> TrackKey {
        TrackKey {
            artist: "Queen".to_string(),
            title: "Bohemian Rhapsody".to_string(),
            album: Some("A Night at the Opera".to_string()),
        }
    }

    fn param<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
        params
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    #[test]
    fn signature_covers_sorted_params_and_secret() {
        let params = vec![
            ("method".to_string(), "track.updateNowPlaying".to_string()),
            ("artist".to_string(), "Queen".to_string()),
            ("api_key".to_string(), "KEY".to_string()),
        ];
        assert_eq!(
            sign_params(&params, "SECRET"),
            "dde2c351aba0188fd444571de51b6a6e"
        );
    }

    #[test]
    fn scrobble_request_is_signed_before_format() {
        let params = client().scrobble_params(&queen(), Some(354), 1_714_593_600);
        assert_eq!(param(&params, "method"), Some("track.scrobble"));
        assert_eq!(param(&params, "timestamp"), Some("1714593600"));
        assert_eq!(param(&params, "duration"), Some("354"));
        assert_eq!(param(&params, "album"), Some("A Night at the Opera"));
        assert_eq!(param(&params, "sk"), Some("SK"));
        assert_eq!(param(&params, "format"), Some("json"));

        let signed: Vec<_> = params
            .iter()
            .filter(|(key, _)| key != "api_sig" && key != "format")
            .cloned()
            .collect();
        assert_eq!(
            param(&params, "api_sig"),
            Some(sign_params(&signed, "SECRET").as_str())
        );
    }

    #[test]
    fn now_playing_omits_unknown_album_and_duration() {
        let mut track = queen();
        track.album = None;
        let params = client().now_playing_params(&track, None);
        assert_eq!(param(&params, "method"), Some("track.updateNowPlaying"));
        assert_eq!(param(&params, "album"), None);
        assert_eq!(param(&params, "duration"), None);
        assert_eq!(param(&params, "timestamp"), None);
    }

    #[test]
    fn missing_session_key_is_rejected() {
        let keys = ServiceKeys {
            service: Service::LibreFm,
            api_key: "KEY".to_string(),
            api_secret: "SECRET".to_string(),
            session_key: String::new(),
        };
        assert!(ScrobbleClient::new(&keys).is_err());
    }

    #[test]
    fn api_errors_are_reported() {
        let err = check_api_error(r#"{"error": 9, "message": "Invalid session key"}"#)
            .unwrap_err();
        assert!(matches!(err, ServiceError::Api { code: 9, .. }));
        assert_eq!(err.to_string(), "API error 9: Invalid session key");
        assert!(check_api_error(r#"{"nowplaying": {}}"#).is_ok());
        assert!(matches!(
            check_api_error("<html>"),
            Err(ServiceError::InvalidResponse(_))
        ));
    }

    #[test]
    fn accepted_scrobble_passes() {
        let payload = r##"{"scrobbles": {"@attr": {"accepted": 1, "ignored": 0},
            "scrobble": {"ignoredMessage": {"code": "0", "#text": ""}}}}"##;
        assert_eq!(ignored_scrobble(payload), None);
        assert!(check_scrobble_response(payload).is_ok());
    }

    #[test]
    fn ignored_scrobble_keeps_code_and_message() {
        let payload = r##"{"scrobbles": {"@attr": {"accepted": "0", "ignored": "1"},
            "scrobble": [{"ignoredMessage": {"code": "1", "#text": "Artist was ignored"}}]}}"##;
        assert_eq!(
            ignored_scrobble(payload),
            Some(("1".to_string(), "Artist was ignored".to_string()))
        );
        assert!(check_scrobble_response(payload).is_ok());
    }

    #[test]
    fn single_ignored_entry_object() {
        let payload = r##"{"scrobbles": {"@attr": {"accepted": 0, "ignored": 1},
            "scrobble": {"ignoredMessage": {"code": "3", "#text": "Timestamp too old"}}}}"##;
        assert_eq!(
            ignored_scrobble(payload),
            Some(("3".to_string(), "Timestamp too old".to_string()))
        );
    }

    #[test]
    fn scrobble_response_with_api_error_fails() {
        let err = check_scrobble_response(r#"{"error": 29, "message": "Rate limit exceeded"}"#)
            .unwrap_err();
        assert!(matches!(err, ServiceError::Api { code: 29, .. }));
    }

    #[test]
    fn service_names() {
        assert_eq!(Service::parse("librefm").unwrap(), Service::LibreFm);
        assert!(Service::parse("listenbrainz").is_err());
        assert_eq!(
            serde_json::to_string(&Service::LastFm).unwrap(),
            "\"lastfm\""
        );
    }
}
