//! Catalogue API HTTP Client
//!
//! The sync engine's only use of the song catalogue is resolving a track id
//! to a playable stream URL. Search, browsing and artwork belong to the
//! presentation layer.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Connection timeout for catalogue requests
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Overall request timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that can occur when talking to the catalogue
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("track not found: {0}")]
    NotFound(String),

    #[error("catalogue rate limit hit")]
    RateLimited,

    #[error("catalogue API error: {0}")]
    Api(String),
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    url: String,
}

/// Client for the catalogue's stream-resolution endpoint
#[derive(Debug, Clone)]
pub struct CatalogClient {
    http: Client,
    base_url: String,
    api_token: Option<String>,
}

impl CatalogClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = Client::builder()
            .connect_timeout(CONNECTION_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("Failed to build HTTP client");

        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token: None,
        }
    }

    /// Set the API token for authenticated catalogues
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    /// Resolve a track id to a playable stream URL.
    pub async fn resolve_stream_url(&self, track_id: &str) -> Result<String, CatalogError> {
        let url = format!("{}/v1/tracks/{}/stream", self.base_url, track_id);
        let mut req = self.http.get(&url);
        if let Some(token) = &self.api_token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Err(CatalogError::NotFound(track_id.to_string())),
            StatusCode::TOO_MANY_REQUESTS => Err(CatalogError::RateLimited),
            status if status.is_success() => {
                let body: StreamResponse = resp.json().await?;
                debug!(track_id, "stream URL resolved");
                Ok(body.url)
            }
            status => Err(CatalogError::Api(format!(
                "unexpected status {status} for {track_id}"
            ))),
        }
    }
}
