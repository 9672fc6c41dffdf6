//! Client for the meditation session service.
//!
//! The service hands out session ids and hosts the breath socket; this module
//! only starts sessions and reads their live stats.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ApiError;
use crate::net_link::Session;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const MEDITATION_PATH: [&str; 2] = ["api", "meditation"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Guided,
    #[default]
    FreePractice,
}

impl SessionType {
    /// Parse the config spelling; anything unrecognised is free practice.
    pub fn from_config(value: &str) -> Self {
        match value.trim() {
            "guided" => SessionType::Guided,
            _ => SessionType::FreePractice,
        }
    }
}

#[derive(Debug, Serialize)]
struct StartRequest<'a> {
    session_type: SessionType,
    target_breath_duration: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    content_id: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MeditationSession {
    pub session_id: String,
    pub user_id: String,
    pub session_type: SessionType,
    pub target_breath_duration: f64,
    pub started_at: String,
}

impl MeditationSession {
    pub fn to_session(&self) -> Session {
        Session::new(&self.session_id, &self.user_id, self.target_breath_duration)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SessionStats {
    pub session_id: String,
    pub live: bool,
    #[serde(default)]
    pub breath_count: Option<u32>,
    #[serde(default)]
    pub current_phase: Option<String>,
    #[serde(default)]
    pub avg_consistency: Option<f64>,
    #[serde(default)]
    pub is_calibrated: Option<bool>,
    #[serde(default)]
    pub completed: Option<bool>,
}

pub struct SessionService {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

impl SessionService {
    pub fn new(api_url: &str, token: &str) -> Result<Self, ApiError> {
        let base_url = Url::parse(api_url)?;
        if base_url.cannot_be_a_base() {
            return Err(ApiError::InvalidUrl(url::ParseError::RelativeUrlWithCannotBeABaseBase));
        }
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let token = Some(token.trim().to_string()).filter(|t| !t.is_empty());
        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    /// `api_url` + `/api/meditation/` + `segments`, keeping any path prefix of the base.
    /// Each segment is percent-encoded on its own.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        url.set_query(None);
        url.set_fragment(None);
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidUrl(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .pop_if_empty()
            .extend(MEDITATION_PATH)
            .extend(segments);
        Ok(url)
    }

    /// Duplex endpoint on the same host: http → ws, https → wss.
    pub fn breath_socket_url(&self) -> Result<Url, ApiError> {
        let mut url = self.endpoint(&["ws", "breath"])?;
        let scheme = if self.base_url.scheme() == "https" { "wss" } else { "ws" };
        // http(s) → ws(s) 都是 special scheme，set_scheme 不会失败
        let _ = url.set_scheme(scheme);
        Ok(url)
    }

    pub async fn start_session(
        &self,
        session_type: SessionType,
        target_breath_duration: f64,
        content_id: Option<&str>,
    ) -> Result<MeditationSession, ApiError> {
        let url = self.endpoint(&["sessions", "start"])?;
        let body = StartRequest {
            session_type,
            target_breath_duration,
            content_id,
        };

        log::info!("Starting {:?} session via {}", session_type, url);
        let response = self.authorized(self.client.post(url)).json(&body).send().await?;
        let session: MeditationSession = Self::check(response).await?.json().await?;
        log::info!("Session service issued session {}", session.session_id);
        Ok(session)
    }

    pub async fn session_stats(&self, session_id: &str) -> Result<SessionStats, ApiError> {
        let url = self.endpoint(&["sessions", session_id, "stats"])?;
        let response = self.authorized(self.client.get(url)).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::Status {
            status: status.as_u16(),
            body,
        })
    }
}
