use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use thiserror::Error;
use url::Url;

const API_KEY_HEADER: &str = "x-api-key";
/// Upper bound for one album request; kept below the coordinator tick.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(1500);

#[derive(Debug, Error)]
pub enum AlbumError {
    #[error("album request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("album '{0}' not found")]
    NotFound(String),
    #[error("album '{album_id}' lookup returned status {status}")]
    Status { album_id: String, status: StatusCode },
    #[error("album api url '{0}' cannot carry a path")]
    BaseUrl(String),
    #[error("invalid album api url: {0}")]
    Url(#[from] url::ParseError),
}

/// Remote album collaborator. Sizes are observed live on every rollover since
/// albums change underneath the coordinator.
#[async_trait]
pub trait AlbumSource: Send + Sync {
    async fn asset_count(&self, album_id: &str) -> Result<usize, AlbumError>;
    async fn asset_ids(&self, album_id: &str) -> Result<Vec<String>, AlbumError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlbumSummary {
    asset_count: usize,
}

#[derive(Debug, Deserialize)]
struct AlbumListing {
    assets: Vec<AlbumAsset>,
}

#[derive(Debug, Deserialize)]
struct AlbumAsset {
    id: String,
}

#[derive(Clone)]
pub struct ImmichAlbumClient {
    http: Client,
    base_url: Url,
    api_key: String,
}

impl ImmichAlbumClient {
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Result<Self, AlbumError> {
        Self::with_timeout(base_url, api_key, DEFAULT_REQUEST_TIMEOUT)
    }

    /// A stalled album server fails the request after `timeout` instead of
    /// holding up the tick that asked.
    pub fn with_timeout(
        base_url: &str,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, AlbumError> {
        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            return Err(AlbumError::BaseUrl(base_url.to_string()));
        }
        let http = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            base_url,
            api_key: api_key.into(),
        })
    }

    fn album_url(&self, album_id: &str) -> Result<Url, AlbumError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| AlbumError::BaseUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .push("albums")
            .push(album_id);
        Ok(url)
    }

    async fn fetch<T: DeserializeOwned>(&self, album_id: &str, url: Url) -> Result<T, AlbumError> {
        let response = self
            .http
            .get(url)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => Ok(response.json::<T>().await?),
            StatusCode::NOT_FOUND => Err(AlbumError::NotFound(album_id.to_string())),
            status => Err(AlbumError::Status {
                album_id: album_id.to_string(),
                status,
            }),
        }
    }
}

#[async_trait]
impl AlbumSource for ImmichAlbumClient {
    async fn asset_count(&self, album_id: &str) -> Result<usize, AlbumError> {
        let mut url = self.album_url(album_id)?;
        url.query_pairs_mut().append_pair("withoutAssets", "true");
        let summary: AlbumSummary = self.fetch(album_id, url).await?;
        Ok(summary.asset_count)
    }

    async fn asset_ids(&self, album_id: &str) -> Result<Vec<String>, AlbumError> {
        let url = self.album_url(album_id)?;
        let listing: AlbumListing = self.fetch(album_id, url).await?;
        Ok(listing.assets.into_iter().map(|asset| asset.id).collect())
    }
}

#[cfg(test)]
#[path = "tests/album_tests.rs"]
mod tests;
