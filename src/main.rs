//! Curator - Plex collection reconciliation service
//!
//! Runs the retention sweep and empty collection cleanup on a schedule
//! until interrupted.

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use curator::config::Config;
use curator::db::Database;
use curator::jobs;
use curator::services::{
    CollectionsService, CollectionsServiceConfig, PlexClient, PlexConfig, RetentionService,
    TmdbClient, TmdbIdService,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "curator=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!("Starting Curator");

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    let db = Database::connect_with_retry(
        &config.database_url,
        Duration::from_secs(2),
        Duration::from_secs(30),
    )
    .await?;
    tracing::info!("Database connected");

    let plex = Arc::new(PlexClient::new(PlexConfig {
        base_url: config.plex_url.clone(),
        token: config.plex_token.clone(),
        timeout: config.plex_timeout,
    })?);

    let tmdb = match config.tmdb_api_key.clone() {
        Some(key) => Some(TmdbClient::new(key)?),
        None => {
            tracing::warn!("TMDB_API_KEY not set, only tmdb:// guids will resolve");
            None
        }
    };
    let resolver = Arc::new(TmdbIdService::new(plex.clone(), tmdb));

    let collections = Arc::new(CollectionsService::new(
        Arc::new(db.collections()),
        plex,
        resolver,
        CollectionsServiceConfig {
            member_concurrency: config.member_concurrency,
        },
    ));
    tracing::info!("Collections service initialized");

    let retention = Arc::new(RetentionService::new(collections));
    let mut scheduler = jobs::start_scheduler(retention, &config).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    scheduler.shutdown().await?;
    db.close().await;

    Ok(())
}
