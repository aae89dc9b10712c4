//! Resolves Plex rating keys to TMDB ids
//!
//! Plex items carry external guids (`tmdb://603`, `imdb://tt0133093`,
//! `tvdb://81189`). Seasons and episodes are resolved through their show.
//! Results are cached for the lifetime of the service.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{CollectionError, Result};
use crate::services::plex::{PlexCollectionApi, PlexLibraryItem};
use crate::services::tmdb::{ExternalSource, TmdbClient};

/// Maps a local item key to a stable external identifier
#[async_trait]
pub trait ExternalIdResolver: Send + Sync {
    async fn resolve(&self, item_key: &str) -> Result<i64>;
}

/// An external id parsed from a Plex guid
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalGuid {
    Tmdb(i64),
    Imdb(String),
    Tvdb(String),
}

impl ExternalGuid {
    /// Parse `scheme://value`; legacy agent guids like
    /// `com.plexapp.agents.themoviedb://603?lang=en` are accepted too.
    pub fn parse(guid: &str) -> Option<Self> {
        let (scheme, rest) = guid.split_once("://")?;
        let value = rest.split(['?', '/']).next().filter(|v| !v.is_empty())?;

        match scheme.rsplit('.').next()? {
            "tmdb" | "themoviedb" => value.parse().ok().map(ExternalGuid::Tmdb),
            "imdb" => Some(ExternalGuid::Imdb(value.to_string())),
            "tvdb" | "thetvdb" => Some(ExternalGuid::Tvdb(value.to_string())),
            _ => None,
        }
    }
}

/// All guids of an item, newer `Guid` entries first
fn external_guids(item: &PlexLibraryItem) -> Vec<ExternalGuid> {
    item.guids
        .iter()
        .map(|g| g.id.as_str())
        .chain(item.guid.as_deref())
        .filter_map(ExternalGuid::parse)
        .collect()
}

/// Plex + TMDB backed [ExternalIdResolver]
pub struct TmdbIdService {
    plex: Arc<dyn PlexCollectionApi>,
    tmdb: Option<TmdbClient>,
    cache: RwLock<HashMap<String, i64>>,
}

impl TmdbIdService {
    pub fn new(plex: Arc<dyn PlexCollectionApi>, tmdb: Option<TmdbClient>) -> Self {
        Self {
            plex,
            tmdb,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Item whose guids identify the title (the show for seasons/episodes)
    async fn title_item(&self, item_key: &str) -> Result<PlexLibraryItem> {
        let item = self
            .plex
            .item_metadata(item_key)
            .await
            .map_err(|e| CollectionError::resolution(item_key, e.to_string()))?
            .ok_or_else(|| CollectionError::resolution(item_key, "unknown to Plex"))?;

        let parent_key = match item.item_type.as_str() {
            "episode" => item.grandparent_rating_key.clone(),
            "season" => item.parent_rating_key.clone(),
            _ => None,
        };

        match parent_key {
            Some(key) => self
                .plex
                .item_metadata(&key)
                .await
                .map_err(|e| CollectionError::resolution(item_key, e.to_string()))?
                .ok_or_else(|| CollectionError::resolution(item_key, "parent unknown to Plex")),
            None => Ok(item),
        }
    }

    async fn lookup(&self, item_key: &str) -> Result<i64> {
        let item = self.title_item(item_key).await?;
        let guids = external_guids(&item);

        if let Some(id) = guids.iter().find_map(|g| match g {
            ExternalGuid::Tmdb(id) => Some(*id),
            _ => None,
        }) {
            return Ok(id);
        }

        let Some(tmdb) = self.tmdb.as_ref() else {
            return Err(CollectionError::resolution(
                item_key,
                "no tmdb guid and TMDB lookups are disabled",
            ));
        };

        for guid in &guids {
            let (value, source) = match guid {
                ExternalGuid::Imdb(v) => (v, ExternalSource::Imdb),
                ExternalGuid::Tvdb(v) => (v, ExternalSource::Tvdb),
                ExternalGuid::Tmdb(_) => continue,
            };
            match tmdb.find_by_external_id(value, source).await {
                Ok(Some(id)) => return Ok(id),
                Ok(None) => continue,
                Err(e) => return Err(CollectionError::resolution(item_key, format!("{:#}", e))),
            }
        }

        Err(CollectionError::resolution(
            item_key,
            "no usable external guid",
        ))
    }
}

#[async_trait]
impl ExternalIdResolver for TmdbIdService {
    async fn resolve(&self, item_key: &str) -> Result<i64> {
        if let Some(id) = self.cache.read().get(item_key).copied() {
            return Ok(id);
        }

        let id = self.lookup(item_key).await?;
        debug!(item_key, tmdb_id = id, "Resolved TMDB id");
        self.cache.write().insert(item_key.to_string(), id);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::plex::{
        AddChildResponse, CreateRemoteCollection, PlexCollection, PlexGuid, RemoteStatus,
    };
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves canned metadata and counts lookups
    struct MetadataOnlyPlex {
        items: HashMap<String, PlexLibraryItem>,
        lookups: AtomicUsize,
    }

    fn item(key: &str, item_type: &str, guids: &[&str]) -> PlexLibraryItem {
        PlexLibraryItem {
            rating_key: key.to_string(),
            parent_rating_key: None,
            grandparent_rating_key: None,
            title: format!("Item {}", key),
            guid: None,
            item_type: item_type.to_string(),
            guids: guids
                .iter()
                .map(|id| PlexGuid { id: id.to_string() })
                .collect(),
            added_at: None,
        }
    }

    #[async_trait]
    impl PlexCollectionApi for MetadataOnlyPlex {
        async fn create_collection(&self, _: &CreateRemoteCollection) -> Result<PlexCollection> {
            unimplemented!()
        }
        async fn update_collection(
            &self,
            _: &str,
            _: &CreateRemoteCollection,
        ) -> Result<RemoteStatus> {
            unimplemented!()
        }
        async fn delete_collection(&self, _: &str) -> Result<RemoteStatus> {
            unimplemented!()
        }
        async fn add_child(&self, _: &str, _: &str) -> Result<AddChildResponse> {
            unimplemented!()
        }
        async fn remove_child(&self, _: &str, _: &str) -> Result<RemoteStatus> {
            unimplemented!()
        }
        async fn collection_children(&self, _: &str) -> Result<Vec<PlexLibraryItem>> {
            unimplemented!()
        }
        async fn item_metadata(&self, item_key: &str) -> Result<Option<PlexLibraryItem>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(self.items.get(item_key).cloned())
        }
    }

    fn service(items: Vec<PlexLibraryItem>) -> (TmdbIdService, Arc<MetadataOnlyPlex>) {
        let plex = Arc::new(MetadataOnlyPlex {
            items: items
                .into_iter()
                .map(|i| (i.rating_key.clone(), i))
                .collect(),
            lookups: AtomicUsize::new(0),
        });
        (TmdbIdService::new(plex.clone(), None), plex)
    }

    #[test]
    fn test_parse_guids() {
        assert_eq!(ExternalGuid::parse("tmdb://603"), Some(ExternalGuid::Tmdb(603)));
        assert_eq!(
            ExternalGuid::parse("imdb://tt0133093"),
            Some(ExternalGuid::Imdb("tt0133093".to_string()))
        );
        assert_eq!(
            ExternalGuid::parse("com.plexapp.agents.themoviedb://603?lang=en"),
            Some(ExternalGuid::Tmdb(603))
        );
        assert_eq!(
            ExternalGuid::parse("com.plexapp.agents.thetvdb://81189/1/1?lang=en"),
            Some(ExternalGuid::Tvdb("81189".to_string()))
        );
        assert_eq!(ExternalGuid::parse("plex://movie/5d776825880197001ec967c6"), None);
        assert_eq!(ExternalGuid::parse("tmdb://"), None);
        assert_eq!(ExternalGuid::parse("garbage"), None);
    }

    #[tokio::test]
    async fn test_resolves_tmdb_guid_and_caches() {
        let (service, plex) = service(vec![item("42", "movie", &["imdb://tt0133093", "tmdb://603"])]);

        assert_eq!(service.resolve("42").await.unwrap(), 603);
        assert_eq!(service.resolve("42").await.unwrap(), 603);
        assert_eq!(plex.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_episode_resolves_through_show() {
        let mut episode = item("300", "episode", &["tvdb://999"]);
        episode.grandparent_rating_key = Some("100".to_string());
        let show = item("100", "show", &["tmdb://1399"]);
        let (service, _) = service(vec![episode, show]);

        assert_eq!(service.resolve("300").await.unwrap(), 1399);
    }

    #[tokio::test]
    async fn test_unknown_item_is_resolution_error() {
        let (service, _) = service(vec![]);
        assert_matches!(
            service.resolve("404").await,
            Err(CollectionError::Resolution { ref item_key, .. }) if item_key == "404"
        );
    }

    #[tokio::test]
    async fn test_imdb_only_without_tmdb_client_fails() {
        let (service, _) = service(vec![item("42", "movie", &["imdb://tt0133093"])]);
        assert_matches!(
            service.resolve("42").await,
            Err(CollectionError::Resolution { .. })
        );
    }
}
