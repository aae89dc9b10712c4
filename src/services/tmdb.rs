//! TMDB (The Movie Database) lookups used to cross-reference Plex items
//!
//! Only the `/find` endpoint is needed: it maps IMDb and TheTVDB ids to
//! TMDB ids for items whose Plex metadata lacks a `tmdb://` guid.
//!
//! Rate limiting: TMDB allows ~40 requests per 10 seconds.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::rate_limiter::{RateLimitedClient, ResponseExt, RetryConfig, retry_async};

/// Source namespace of an id passed to `/find`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalSource {
    Imdb,
    Tvdb,
}

impl ExternalSource {
    fn as_param(&self) -> &'static str {
        match self {
            ExternalSource::Imdb => "imdb_id",
            ExternalSource::Tvdb => "tvdb_id",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TmdbFindEntry {
    pub id: i64,
}

/// Response of `/find/{external_id}`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TmdbFindResult {
    #[serde(default)]
    pub movie_results: Vec<TmdbFindEntry>,
    #[serde(default)]
    pub tv_results: Vec<TmdbFindEntry>,
}

impl TmdbFindResult {
    /// First matching TMDB id, movies before shows
    pub fn first_id(&self) -> Option<i64> {
        self.movie_results
            .first()
            .or_else(|| self.tv_results.first())
            .map(|entry| entry.id)
    }
}

/// TMDB API client with rate limiting and retry logic
pub struct TmdbClient {
    client: Arc<RateLimitedClient>,
    base_url: String,
    api_key: String,
    retry_config: RetryConfig,
}

impl TmdbClient {
    /// Create a new TMDB client with the given API key
    pub fn new(api_key: String) -> Result<Self> {
        Ok(Self {
            client: Arc::new(RateLimitedClient::for_tmdb()?),
            base_url: "https://api.themoviedb.org/3".to_string(),
            api_key,
            retry_config: RetryConfig {
                max_retries: 3,
                initial_interval: Duration::from_millis(500),
                max_interval: Duration::from_secs(10),
                multiplier: 2.0,
            },
        })
    }

    /// Check if the client has a valid API key configured
    pub fn has_api_key(&self) -> bool {
        !self.api_key.is_empty()
    }

    /// Map an IMDb/TheTVDB id to a TMDB id
    pub async fn find_by_external_id(
        &self,
        external_id: &str,
        source: ExternalSource,
    ) -> Result<Option<i64>> {
        if !self.has_api_key() {
            anyhow::bail!("TMDB API key not configured");
        }

        debug!(external_id, source = source.as_param(), "Looking up TMDB id");

        let url = format!("{}/find/{}", self.base_url, external_id);
        let client = self.client.clone();
        let api_key = self.api_key.clone();

        let result = retry_async(
            || {
                let url = url.clone();
                let client = client.clone();
                let key = api_key.clone();
                async move {
                    let request = client.request(Method::GET, &url).query(&[
                        ("api_key", key.as_str()),
                        ("external_source", source.as_param()),
                    ]);
                    let response = client.send(request).await?;

                    if response.is_rate_limited() {
                        warn!("TMDB rate limit hit, will retry");
                        anyhow::bail!("Rate limited (429)");
                    }

                    if response.status().as_u16() == 401 {
                        anyhow::bail!("TMDB API key is invalid");
                    }

                    if !response.status().is_success() {
                        anyhow::bail!("TMDB find failed with status: {}", response.status());
                    }

                    let result: TmdbFindResult = response
                        .json()
                        .await
                        .context("Failed to parse TMDB find result")?;

                    Ok(result)
                }
            },
            &self.retry_config,
            "tmdb_find",
        )
        .await?;

        Ok(result.first_id())
    }
}
