//! Stream registry client
//!
//! Thin client for the embedded stream server's control API (MediaMTX
//! wire format). The registry is the authority on path state; this client
//! only reads it and creates dynamic paths when needed. Every call is
//! bounded to two seconds, and callers treat unknown paths as not ready.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::StreamServerConfig;
use crate::error::{AppError, Result};

const REGISTRY_TIMEOUT: Duration = Duration::from_secs(2);

/// Logical path state on the stream server
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamPath {
    pub name: String,
    pub ready: bool,
    pub has_readers: bool,
    pub tracks: Vec<String>,
}

impl StreamPath {
    fn absent(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

/// Dynamic path kind for `ensure_path`
#[derive(Debug, Clone)]
pub enum PathKind {
    /// Accepts an RTSP/WHIP publisher
    Publisher,
    /// Pulls from an upstream URL
    Relay(String),
}

#[derive(Deserialize)]
struct ApiPath {
    name: String,
    #[serde(default)]
    ready: bool,
    #[serde(default)]
    readers: Vec<serde_json::Value>,
    #[serde(default)]
    tracks: Vec<String>,
}

impl From<ApiPath> for StreamPath {
    fn from(p: ApiPath) -> Self {
        Self {
            name: p.name,
            ready: p.ready,
            has_readers: !p.readers.is_empty(),
            tracks: p.tracks,
        }
    }
}

#[derive(Deserialize)]
struct ApiPathList {
    #[serde(default)]
    items: Vec<ApiPath>,
}

pub struct RegistryClient {
    http: reqwest::Client,
    api_base: String,
    rtsp_base: String,
    webrtc_base: String,
}

impl RegistryClient {
    pub fn new(config: &StreamServerConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REGISTRY_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self {
            http,
            api_base: config.api_url.trim_end_matches('/').to_string(),
            rtsp_base: config.rtsp_url.trim_end_matches('/').to_string(),
            webrtc_base: config.webrtc_url.trim_end_matches('/').to_string(),
        }
    }

    /// RTSP URL publishers push to
    pub fn publish_url(&self, name: &str) -> String {
        format!("{}/{}", self.rtsp_base, name)
    }

    /// RTSP URL subscribers (recording, mixer branches) read from
    pub fn read_url(&self, name: &str) -> String {
        format!("{}/{}", self.rtsp_base, name)
    }

    /// WHEP playback endpoint for external clients
    pub fn whep_url(&self, name: &str) -> String {
        format!("{}/{}/whep", self.webrtc_base, name)
    }

    /// WHIP ingestion endpoint for external guests
    pub fn whip_url(&self, name: &str) -> String {
        format!("{}/{}/whip", self.webrtc_base, name)
    }

    /// Fetch one path's state. An absent path is returned with
    /// `ready = false` rather than as an error.
    pub async fn get_path(&self, name: &str) -> Result<StreamPath> {
        let url = format!("{}/v3/paths/get/{}", self.api_base, name);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| AppError::RegistryUnavailable(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(StreamPath::absent(name));
        }
        let path: ApiPath = response
            .error_for_status()
            .map_err(|e| AppError::RegistryUnavailable(e.to_string()))?
            .json()
            .await
            .map_err(|e| AppError::RegistryUnavailable(e.to_string()))?;
        Ok(path.into())
    }

    /// List every path the server knows about
    pub async fn list_paths(&self) -> Result<Vec<StreamPath>> {
        let url = format!("{}/v3/paths/list", self.api_base);
        let list: ApiPathList = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| AppError::RegistryUnavailable(e.to_string()))?
            .error_for_status()
            .map_err(|e| AppError::RegistryUnavailable(e.to_string()))?
            .json()
            .await
            .map_err(|e| AppError::RegistryUnavailable(e.to_string()))?;
        Ok(list.items.into_iter().map(Into::into).collect())
    }

    /// Create a path configuration if the server does not already have one.
    /// Existing paths are left untouched.
    pub async fn ensure_path(&self, name: &str, kind: PathKind) -> Result<()> {
        let url = format!("{}/v3/config/paths/add/{}", self.api_base, name);
        let body = match kind {
            PathKind::Publisher => serde_json::json!({ "source": "publisher" }),
            PathKind::Relay(upstream) => serde_json::json!({ "source": upstream }),
        };

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::RegistryUnavailable(e.to_string()))?;

        // 400 with "already exists" is success for ensure semantics
        if response.status() == reqwest::StatusCode::BAD_REQUEST {
            let text = response.text().await.unwrap_or_default();
            if text.contains("already exists") {
                return Ok(());
            }
            return Err(AppError::RegistryUnavailable(text));
        }
        response
            .error_for_status()
            .map_err(|e| AppError::RegistryUnavailable(e.to_string()))?;
        Ok(())
    }

    /// `true` when the path currently has a publisher
    ///
    /// Registry failures degrade to `false`, never to an error: the
    /// authoritative state being unreachable means "not ready" for callers
    /// gating on publication.
    pub async fn is_ready(&self, name: &str) -> bool {
        self.get_path(name).await.map(|p| p.ready).unwrap_or(false)
    }

    /// Cheap health probe for the aggregate status endpoint
    pub async fn healthy(&self) -> bool {
        self.list_paths().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> RegistryClient {
        RegistryClient::new(&StreamServerConfig {
            api_url: "http://127.0.0.1:1".to_string(),
            rtsp_url: "rtsp://127.0.0.1:8554/".to_string(),
            webrtc_url: "http://127.0.0.1:8889".to_string(),
        })
    }

    #[test]
    fn test_url_construction() {
        let c = client();
        assert_eq!(c.publish_url("cam0"), "rtsp://127.0.0.1:8554/cam0");
        assert_eq!(c.whep_url("mixer_program"), "http://127.0.0.1:8889/mixer_program/whep");
        assert_eq!(c.whip_url("guest1"), "http://127.0.0.1:8889/guest1/whip");
    }

    #[tokio::test]
    async fn test_unreachable_registry_is_unavailable() {
        // port 1 refuses connections immediately
        let c = client();
        assert!(matches!(
            c.get_path("cam0").await,
            Err(AppError::RegistryUnavailable(_))
        ));
        assert!(!c.is_ready("cam0").await);
        assert!(!c.healthy().await);
    }

    #[test]
    fn test_api_path_mapping() {
        let api = ApiPath {
            name: "cam0".into(),
            ready: true,
            readers: vec![serde_json::json!({"type": "rtspSession"})],
            tracks: vec!["H264".into(), "Opus".into()],
        };
        let path: StreamPath = api.into();
        assert!(path.ready);
        assert!(path.has_readers);
        assert_eq!(path.tracks.len(), 2);
    }
}
