//! REST side of a node: track resolution, node info, session settings.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header::AUTHORIZATION, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use super::connection::backoff;
use super::protocol::{PlayerUpdateState, Stats};
use crate::config::{NodeConfig, NodeOptions};
use crate::sources::{LoadResult, Track};
use crate::{Error, Result};

/// Anything able to turn an identifier into a [`LoadResult`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TrackLoader: Send + Sync {
    async fn load_tracks(&self, identifier: &str) -> Result<LoadResult>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct Version {
    pub semver: String,
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitInfo {
    pub branch: String,
    pub commit: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub commit_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub version: Version,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub build_time: DateTime<Utc>,
    pub git: GitInfo,
    pub jvm: String,
    pub lavaplayer: String,
    #[serde(default)]
    pub source_managers: Vec<String>,
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default)]
    pub plugins: Vec<PluginInfo>,
}

/// Player as the node sees it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemotePlayer {
    pub guild_id: String,
    #[serde(default)]
    pub track: Option<Track>,
    pub volume: u16,
    pub paused: bool,
    pub state: PlayerUpdateState,
    #[serde(default)]
    pub filters: Value,
}

pub struct RestClient {
    http: reqwest::Client,
    base: Url,
    password: String,
    node: String,
    retries: u32,
    retry_base: Duration,
    retry_max: Duration,
}

impl RestClient {
    pub fn new(config: &NodeConfig, options: &NodeOptions) -> Result<Self> {
        let base = Url::parse(&config.rest_url())
            .map_err(|e| Error::InvalidData(format!("bad node address for {}: {e}", config.name)))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http,
            base,
            password: config.password.clone(),
            node: config.name.clone(),
            retries: options.rest_retries,
            retry_base: options.backoff_base,
            retry_max: options.backoff_max,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| Error::InvalidData(format!("bad endpoint {path}: {e}")))
    }

    async fn check(&self, response: Response) -> Result<Response> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(Error::Authorization(self.node.clone()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Request(format!("{status}: {body}")));
        }
        Ok(response)
    }

    async fn get_once<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        let response = self
            .http
            .get(url)
            .header(AUTHORIZATION, &self.password)
            .send()
            .await?;
        Ok(self.check(response).await?.json().await?)
    }

    /// GET with exponential backoff on retryable failures.
    async fn get<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        let mut attempt = 0;
        loop {
            match self.get_once(url.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.retries => {
                    let delay = backoff(attempt, self.retry_base, self.retry_max);
                    attempt += 1;
                    warn!(
                        node = %self.node,
                        path = url.path(),
                        attempt,
                        ?delay,
                        error = %e,
                        "Petición REST fallida, reintentando"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn load_tracks(&self, identifier: &str) -> Result<LoadResult> {
        let mut url = self.endpoint("loadtracks")?;
        url.query_pairs_mut().append_pair("identifier", identifier);
        debug!(node = %self.node, identifier, "cargando tracks");
        LoadResult::from_value(self.get(url).await?)
    }

    pub async fn decode_track(&self, encoded: &str) -> Result<Track> {
        let mut url = self.endpoint("decodetrack")?;
        url.query_pairs_mut().append_pair("encodedTrack", encoded);
        self.get(url).await
    }

    /// Not retried: POST.
    pub async fn decode_tracks(&self, encoded: &[String]) -> Result<Vec<Track>> {
        let response = self
            .http
            .post(self.endpoint("decodetracks")?)
            .header(AUTHORIZATION, &self.password)
            .json(encoded)
            .send()
            .await?;
        Ok(self.check(response).await?.json().await?)
    }

    pub async fn info(&self) -> Result<NodeInfo> {
        self.get(self.endpoint("info")?).await
    }

    pub async fn stats(&self) -> Result<Stats> {
        self.get(self.endpoint("stats")?).await
    }

    pub async fn player(&self, session_id: &str, guild_id: &str) -> Result<RemotePlayer> {
        self.get(self.endpoint(&format!("sessions/{session_id}/players/{guild_id}"))?)
            .await
    }

    /// Enables or disables resuming for `session_id`.
    pub async fn update_session(&self, session_id: &str, resuming: bool, timeout: Duration) -> Result<()> {
        let response = self
            .http
            .patch(self.endpoint(&format!("sessions/{session_id}"))?)
            .header(AUTHORIZATION, &self.password)
            .json(&json!({ "resuming": resuming, "timeout": timeout.as_secs() }))
            .send()
            .await?;
        self.check(response).await?;
        debug!(node = %self.node, session_id, resuming, "sesión actualizada");
        Ok(())
    }
}

#[async_trait]
impl TrackLoader for RestClient {
    async fn load_tracks(&self, identifier: &str) -> Result<LoadResult> {
        RestClient::load_tracks(self, identifier).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn client() -> RestClient {
        let config = NodeConfig {
            name: "main".into(),
            host: "localhost".into(),
            port: 2333,
            password: "pw".into(),
            secure: false,
            region: None,
        };
        RestClient::new(&config, &NodeOptions::default()).unwrap()
    }

    #[test]
    fn test_endpoint_paths() {
        let rest = client();
        assert_eq!(
            rest.endpoint("sessions/abc/players/42").unwrap().as_str(),
            "http://localhost:2333/v4/sessions/abc/players/42"
        );

        let mut url = rest.endpoint("loadtracks").unwrap();
        url.query_pairs_mut().append_pair("identifier", "ytsearch:a b&c");
        assert_eq!(
            url.as_str(),
            "http://localhost:2333/v4/loadtracks?identifier=ytsearch%3Aa+b%26c"
        );
    }

    #[test]
    fn test_node_info_parses() {
        let info: NodeInfo = serde_json::from_value(json!({
            "version": { "semver": "4.0.8", "major": 4, "minor": 0, "patch": 8 },
            "buildTime": 1700000000000i64,
            "git": { "branch": "main", "commit": "abc", "commitTime": 1700000000000i64 },
            "jvm": "21",
            "lavaplayer": "2.2.1",
            "sourceManagers": ["youtube", "http"],
            "filters": ["volume", "equalizer"],
            "plugins": [{ "name": "lavasrc", "version": "4.0.0" }]
        }))
        .unwrap();
        assert_eq!(info.version.major, 4);
        assert_eq!(info.build_time.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(info.plugins[0].name, "lavasrc");
    }
}
