//! Application configuration management

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database path or `sqlite://` URL
    pub database_url: String,

    /// Plex server base URL
    pub plex_url: String,

    /// Plex authentication token
    pub plex_token: String,

    /// Timeout for a single Plex request
    pub plex_timeout: Duration,

    /// TMDB API key, lookups through `/find` are disabled without it
    pub tmdb_api_key: Option<String>,

    /// Concurrent member operations within one batch
    pub member_concurrency: usize,

    /// Cron expression (with seconds) for the retention sweep
    pub retention_schedule: String,

    /// Cron expression (with seconds) for the empty collection cleanup
    pub cleanup_schedule: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Prefer DATABASE_PATH, fall back to DATABASE_URL
        let database_url = env::var("DATABASE_PATH")
            .or_else(|_| env::var("DATABASE_URL"))
            .unwrap_or_else(|_| "./data/curator.db".to_string());

        Ok(Self {
            database_url,

            plex_url: env::var("PLEX_URL").context("PLEX_URL is required")?,

            plex_token: env::var("PLEX_TOKEN").context("PLEX_TOKEN is required")?,

            plex_timeout: Duration::from_secs(
                env::var("PLEX_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .context("Invalid PLEX_TIMEOUT_SECS")?,
            ),

            tmdb_api_key: env::var("TMDB_API_KEY").ok().filter(|k| !k.is_empty()),

            member_concurrency: env::var("MEMBER_CONCURRENCY")
                .unwrap_or_else(|_| "4".to_string())
                .parse()
                .context("Invalid MEMBER_CONCURRENCY")?,

            retention_schedule: env::var("RETENTION_SCHEDULE")
                .unwrap_or_else(|_| "0 0 * * * *".to_string()),

            cleanup_schedule: env::var("CLEANUP_SCHEDULE")
                .unwrap_or_else(|_| "0 */30 * * * *".to_string()),
        })
    }
}
