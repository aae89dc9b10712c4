//! Collection engine and external service integrations

pub mod collections;
pub mod plex;
pub mod rate_limiter;
pub mod retention;
pub mod tmdb;
pub mod tmdb_id;

pub use collections::{
    BatchReport, CleanupOutcome, CollectionState, CollectionsService, CollectionsServiceConfig,
    MemberOutcome, MemberResult, MembershipDrift,
};
pub use plex::{PlexClient, PlexCollectionApi, PlexConfig};
pub use retention::RetentionService;
pub use tmdb::TmdbClient;
pub use tmdb_id::{ExternalIdResolver, TmdbIdService};
