//! Collection reconciliation service
//!
//! Drives the Plex collection object and the local collection store to the
//! same state for every intent (create, add, remove, update, delete).
//!
//! Rules the service keeps:
//! - a member row is written only after Plex confirmed the add
//! - a member row is deleted only after Plex confirmed the removal
//! - the remote object is created lazily, on the first add
//! - a materialized collection left without members gets its remote object
//!   deleted; on success the remote id is cleared so the record can be reused
//! - per-item failures land in the [BatchReport], they never abort siblings

use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{debug, error, info, warn};

use crate::db::{CollectionKey, CollectionRecord, CollectionStore, UpsertCollection};
use crate::error::{CollectionError, Result};
use crate::services::plex::{CreateRemoteCollection, PlexCollectionApi, RemoteStatus};
use crate::services::tmdb_id::ExternalIdResolver;

use super::report::{BatchReport, CleanupOutcome, MemberOutcome, MemberResult};

/// Configuration for the collections service
#[derive(Debug, Clone)]
pub struct CollectionsServiceConfig {
    /// How many member operations of one batch may be in flight at once
    pub member_concurrency: usize,
}

impl Default for CollectionsServiceConfig {
    fn default() -> Self {
        Self {
            member_concurrency: 4,
        }
    }
}

/// Lifecycle state of a collection, derived from remote id and member count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionState {
    /// No remote object
    Empty,
    /// Remote object with members
    Materialized,
    /// Remote object without members; cleanup pending or failed
    MaterializedEmpty,
}

/// Differences between local bookkeeping and the remote collection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipDrift {
    /// In Plex but not recorded locally
    pub missing_locally: Vec<String>,
    /// Recorded locally but not in Plex
    pub missing_remotely: Vec<String>,
}

impl MembershipDrift {
    pub fn is_in_sync(&self) -> bool {
        self.missing_locally.is_empty() && self.missing_remotely.is_empty()
    }
}

/// Keeps local collections and Plex collections converged
pub struct CollectionsService {
    store: Arc<dyn CollectionStore>,
    plex: Arc<dyn PlexCollectionApi>,
    resolver: Arc<dyn ExternalIdResolver>,
    config: CollectionsServiceConfig,
}

impl CollectionsService {
    pub fn new(
        store: Arc<dyn CollectionStore>,
        plex: Arc<dyn PlexCollectionApi>,
        resolver: Arc<dyn ExternalIdResolver>,
        config: CollectionsServiceConfig,
    ) -> Self {
        Self {
            store,
            plex,
            resolver,
            config,
        }
    }

    /// Read access for reporting layers
    pub fn store(&self) -> &Arc<dyn CollectionStore> {
        &self.store
    }

    pub async fn get_collection(&self, key: &CollectionKey) -> Result<CollectionRecord> {
        self.store.get(key).await
    }

    pub async fn collection_state(&self, id: i64) -> Result<CollectionState> {
        let collection = self.store.get(&CollectionKey::Id(id)).await?;
        if !collection.is_materialized() {
            return Ok(CollectionState::Empty);
        }
        Ok(match self.store.count_members(id).await? {
            0 => CollectionState::MaterializedEmpty,
            _ => CollectionState::Materialized,
        })
    }

    /// Create a collection without members. Nothing is created in Plex.
    pub async fn create_collection(&self, mut input: UpsertCollection) -> Result<CollectionRecord> {
        input.id = None;
        let collection = self.store.upsert_collection(input).await?;
        info!(
            collection_id = collection.id,
            title = %collection.title,
            "Created empty collection"
        );
        Ok(collection)
    }

    /// Create a collection and add `items` to it.
    ///
    /// The Plex collection is created first; if that fails nothing is stored.
    /// Member adds are best effort and reported individually.
    pub async fn create_collection_with_children(
        &self,
        mut input: UpsertCollection,
        items: Vec<String>,
    ) -> Result<BatchReport> {
        let items = dedupe(items);
        if items.is_empty() {
            return Ok(BatchReport::new(self.create_collection(input).await?));
        }
        input.id = None;

        let remote_fields = CreateRemoteCollection {
            library_id: input.library_id,
            title: input.title.clone(),
            summary: input.description.clone(),
            media_type: input.media_type,
        };
        let remote = self.plex.create_collection(&remote_fields).await.map_err(|e| {
            error!(title = %input.title, error = %e, "Failed to create Plex collection");
            e
        })?;

        // Stored with its remote id in one write: never visible as Empty
        let collection = match self
            .store
            .insert_materialized(input, &remote.rating_key)
            .await
        {
            Ok(collection) => collection,
            Err(e) => {
                error!(remote_id = %remote.rating_key, error = %e, "Failed to store new collection");
                self.discard_remote(&remote.rating_key).await;
                return Err(e);
            }
        };
        info!(
            collection_id = collection.id,
            remote_id = %remote.rating_key,
            items = items.len(),
            "Created collection in Plex"
        );

        let mut report = self.add_children(collection, items).await;
        self.release_if_unused(&mut report).await;
        Ok(report)
    }

    /// Add `items` to a collection, creating the Plex collection first if the
    /// collection has none yet.
    pub async fn add_to_collection(&self, id: i64, items: Vec<String>) -> Result<BatchReport> {
        let collection = self.store.get(&CollectionKey::Id(id)).await?;
        let items = dedupe(items);
        if items.is_empty() {
            return Ok(BatchReport::new(collection));
        }

        let (collection, materialized_now) = if collection.is_materialized() {
            (collection, false)
        } else {
            self.materialize(&collection).await?
        };

        let mut report = self.add_children(collection, items).await;
        if materialized_now {
            self.release_if_unused(&mut report).await;
        }
        Ok(report)
    }

    /// Remove `items` from a collection. When the collection ends up without
    /// members its Plex collection is deleted after every removal was tried.
    pub async fn remove_from_collection(&self, id: i64, items: Vec<String>) -> Result<BatchReport> {
        let collection = self.store.get(&CollectionKey::Id(id)).await?;
        let items = dedupe(items);
        let remote_id = collection.remote_id.clone();

        let results: Vec<MemberResult> = stream::iter(items)
            .map(|item_key| self.remove_child(collection.id, remote_id.as_deref(), item_key))
            .buffered(self.config.member_concurrency.max(1))
            .collect()
            .await;

        let mut report = BatchReport::new(collection);
        report.results = results;

        let (collection, remaining) = match self.refresh(id).await {
            Ok(state) => state,
            Err(e) => {
                warn!(collection_id = id, error = %e, "Could not re-read membership after removal");
                report.cleanup = Some(CleanupOutcome::Failed(e));
                return Ok(report);
            }
        };

        if remaining == 0 && collection.is_materialized() {
            let (collection, outcome) = self.cascade_cleanup(collection).await;
            report.collection = collection;
            report.cleanup = Some(outcome);
        } else {
            report.collection = collection;
        }

        Ok(report)
    }

    /// Delete a collection. The local record is only deleted once Plex
    /// confirmed deleting its collection.
    pub async fn delete_collection(&self, id: i64) -> Result<()> {
        let collection = self.store.get(&CollectionKey::Id(id)).await?;

        if let Some(remote_id) = collection.remote_id.as_deref() {
            let status = self.plex.delete_collection(remote_id).await.map_err(|e| {
                error!(collection_id = id, remote_id, error = %e, "Plex collection delete failed");
                e
            })?;
            if !status.is_ok() {
                error!(collection_id = id, remote_id, "Plex refused to delete collection");
                return Err(CollectionError::remote("deleteCollection", "status NOK"));
            }
        }

        self.store.delete_collection(id).await.map_err(|e| {
            error!(collection_id = id, error = %e, "Failed to delete collection from database");
            e
        })?;

        info!(collection_id = id, title = %collection.title, "Deleted collection");
        Ok(())
    }

    /// Update collection settings. Title and description changes of a
    /// materialized collection are pushed to Plex first.
    ///
    /// Library and media type are fixed once the collection is materialized.
    pub async fn update_collection(
        &self,
        id: i64,
        mut input: UpsertCollection,
    ) -> Result<CollectionRecord> {
        let current = self.store.get(&CollectionKey::Id(id)).await?;
        input.id = Some(id);

        if let Some(remote_id) = current.remote_id.as_deref() {
            if input.library_id != current.library_id || input.media_type != current.media_type {
                warn!(
                    collection_id = id,
                    "Ignoring library/media type change of a materialized collection"
                );
                input.library_id = current.library_id;
                input.media_type = current.media_type;
            }

            if input.title != current.title || input.description != current.description {
                let fields = CreateRemoteCollection {
                    library_id: current.library_id,
                    title: input.title.clone(),
                    summary: input.description.clone(),
                    media_type: current.media_type,
                };
                let status = self.plex.update_collection(remote_id, &fields).await?;
                if !status.is_ok() {
                    return Err(CollectionError::remote("updateCollection", "status NOK"));
                }
            }
        }

        self.store.upsert_collection(input).await
    }

    /// Retry the remote deletion for every materialized collection without
    /// members
    pub async fn cleanup_empty_collections(&self) -> Result<Vec<(CollectionRecord, CleanupOutcome)>> {
        let mut outcomes = Vec::new();

        for collection in self.store.list().await? {
            if !collection.is_materialized() || self.store.count_members(collection.id).await? > 0 {
                continue;
            }
            outcomes.push(self.cascade_cleanup(collection).await);
        }

        Ok(outcomes)
    }

    /// Compare local membership with what Plex reports
    pub async fn membership_drift(&self, id: i64) -> Result<MembershipDrift> {
        let collection = self.store.get(&CollectionKey::Id(id)).await?;
        let local: Vec<String> = self
            .store
            .list_members(id)
            .await?
            .into_iter()
            .map(|m| m.local_item_key)
            .collect();
        let remote: Vec<String> = match collection.remote_id.as_deref() {
            Some(remote_id) => self
                .plex
                .collection_children(remote_id)
                .await?
                .into_iter()
                .map(|item| item.rating_key)
                .collect(),
            None => Vec::new(),
        };

        let local_set: HashSet<&str> = local.iter().map(String::as_str).collect();
        let remote_set: HashSet<&str> = remote.iter().map(String::as_str).collect();

        Ok(MembershipDrift {
            missing_locally: remote
                .iter()
                .filter(|k| !local_set.contains(k.as_str()))
                .cloned()
                .collect(),
            missing_remotely: local
                .iter()
                .filter(|k| !remote_set.contains(k.as_str()))
                .cloned()
                .collect(),
        })
    }

    /// Create the Plex collection for `collection` and record its id.
    ///
    /// When a concurrent call recorded its own Plex collection first, ours is
    /// discarded and the winner's record is returned with `false`.
    async fn materialize(&self, collection: &CollectionRecord) -> Result<(CollectionRecord, bool)> {
        let fields = CreateRemoteCollection {
            library_id: collection.library_id,
            title: collection.title.clone(),
            summary: collection.description.clone(),
            media_type: collection.media_type,
        };
        let remote = self.plex.create_collection(&fields).await.map_err(|e| {
            error!(collection_id = collection.id, error = %e, "Failed to create Plex collection");
            e
        })?;

        match self
            .store
            .claim_remote_id(collection.id, &remote.rating_key)
            .await
        {
            Ok(Some(updated)) => {
                info!(
                    collection_id = collection.id,
                    remote_id = %remote.rating_key,
                    "Materialized collection in Plex"
                );
                Ok((updated, true))
            }
            Ok(None) => {
                self.discard_remote(&remote.rating_key).await;
                let current = self.store.get(&CollectionKey::Id(collection.id)).await?;
                if !current.is_materialized() {
                    return Err(CollectionError::remote(
                        "createCollection",
                        "collection was materialized and released concurrently",
                    ));
                }
                debug!(
                    collection_id = collection.id,
                    remote_id = ?current.remote_id,
                    "Collection materialized concurrently, using existing Plex collection"
                );
                Ok((current, false))
            }
            Err(e) => {
                error!(collection_id = collection.id, error = %e, "Failed to record remote id");
                self.discard_remote(&remote.rating_key).await;
                Err(e)
            }
        }
    }

    /// Best-effort delete of a remote object the store never recorded
    async fn discard_remote(&self, remote_id: &str) {
        match self.plex.delete_collection(remote_id).await {
            Ok(RemoteStatus::Ok) => debug!(remote_id, "Discarded unrecorded Plex collection"),
            Ok(RemoteStatus::Nok) => {
                warn!(remote_id, "Plex refused to discard unrecorded collection")
            }
            Err(e) => warn!(remote_id, error = %e, "Failed to discard unrecorded Plex collection"),
        }
    }

    async fn add_children(&self, collection: CollectionRecord, items: Vec<String>) -> BatchReport {
        let results: Vec<MemberResult> = match collection.remote_id.as_deref() {
            Some(remote_id) => {
                stream::iter(items)
                    .map(|item_key| self.add_child(collection.id, remote_id, item_key))
                    .buffered(self.config.member_concurrency.max(1))
                    .collect()
                    .await
            }
            None => items
                .into_iter()
                .map(|item_key| MemberResult {
                    item_key,
                    outcome: MemberOutcome::Failed(CollectionError::remote(
                        "addChildToCollection",
                        "collection has no Plex collection",
                    )),
                })
                .collect(),
        };

        let mut report = BatchReport::new(collection);
        report.results = results;
        report
    }

    async fn add_child(&self, collection_id: i64, remote_id: &str, item_key: String) -> MemberResult {
        let outcome = match self.try_add_child(collection_id, remote_id, &item_key).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(collection_id, item_key = %item_key, error = %e, "Couldn't add media to collection");
                MemberOutcome::Failed(e)
            }
        };
        MemberResult { item_key, outcome }
    }

    async fn try_add_child(
        &self,
        collection_id: i64,
        remote_id: &str,
        item_key: &str,
    ) -> Result<MemberOutcome> {
        if self.store.find_member(collection_id, item_key).await?.is_some() {
            debug!(collection_id, item_key, "Item already in collection");
            return Ok(MemberOutcome::AlreadyPresent);
        }

        let external_id = match self.resolver.resolve(item_key).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(item_key, error = %e, "External id unresolved, adding without it");
                None
            }
        };

        let response = self.plex.add_child(remote_id, item_key).await?;
        if !response.is_success() {
            let reason = response
                .failure_reason()
                .unwrap_or_else(|| "add not confirmed".to_string());
            return Err(CollectionError::remote("addChildToCollection", reason));
        }

        match self
            .store
            .add_member(collection_id, item_key, external_id)
            .await
        {
            Ok(_) => {
                debug!(collection_id, item_key, "Added media to collection");
                Ok(MemberOutcome::Added { external_id })
            }
            Err(CollectionError::Conflict { .. }) => Ok(MemberOutcome::AlreadyPresent),
            Err(e) => Err(e),
        }
    }

    async fn remove_child(
        &self,
        collection_id: i64,
        remote_id: Option<&str>,
        item_key: String,
    ) -> MemberResult {
        let outcome = match self.try_remove_child(collection_id, remote_id, &item_key).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(collection_id, item_key = %item_key, error = %e, "Couldn't remove media from collection");
                MemberOutcome::Failed(e)
            }
        };
        MemberResult { item_key, outcome }
    }

    async fn try_remove_child(
        &self,
        collection_id: i64,
        remote_id: Option<&str>,
        item_key: &str,
    ) -> Result<MemberOutcome> {
        if self.store.find_member(collection_id, item_key).await?.is_none() {
            return Ok(MemberOutcome::AlreadyAbsent);
        }
        let Some(remote_id) = remote_id else {
            return Err(CollectionError::remote(
                "deleteChildFromCollection",
                "collection has no Plex collection",
            ));
        };

        let status = self.plex.remove_child(remote_id, item_key).await?;
        if !status.is_ok() {
            return Err(CollectionError::remote("deleteChildFromCollection", "status NOK"));
        }

        self.store.remove_member(collection_id, item_key).await?;
        debug!(collection_id, item_key, "Removed media from collection");
        Ok(MemberOutcome::Removed)
    }

    async fn refresh(&self, id: i64) -> Result<(CollectionRecord, i64)> {
        let collection = self.store.get(&CollectionKey::Id(id)).await?;
        let remaining = self.store.count_members(id).await?;
        Ok((collection, remaining))
    }

    /// Delete the Plex collection of a collection that has no members left
    async fn cascade_cleanup(&self, collection: CollectionRecord) -> (CollectionRecord, CleanupOutcome) {
        let Some(remote_id) = collection.remote_id.clone() else {
            return (collection, CleanupOutcome::RemoteDeleted);
        };

        // Plex answers a delete of an already missing collection with OK,
        // so a retry after a failed release clears the stale id
        let failure = match self.plex.delete_collection(&remote_id).await {
            Ok(RemoteStatus::Ok) => {
                match self.store.release_remote_id(collection.id, &remote_id).await {
                    Ok(Some(updated)) => {
                        info!(
                            collection_id = updated.id,
                            remote_id = %remote_id,
                            "Deleted empty Plex collection"
                        );
                        return (updated, CleanupOutcome::RemoteDeleted);
                    }
                    // Someone else already released or replaced it
                    Ok(None) => match self.store.get(&CollectionKey::Id(collection.id)).await {
                        Ok(current) => return (current, CleanupOutcome::RemoteDeleted),
                        Err(e) => e,
                    },
                    Err(e) => e,
                }
            }
            Ok(RemoteStatus::Nok) => CollectionError::remote("deleteCollection", "status NOK"),
            Err(e) => e,
        };

        warn!(
            collection_id = collection.id,
            remote_id = %remote_id,
            error = %failure,
            "Empty collection cleanup failed"
        );
        (collection, CleanupOutcome::Failed(failure))
    }

    /// After an add that materialized the collection: if nothing ended up in
    /// it, don't leave an empty Plex collection behind
    async fn release_if_unused(&self, report: &mut BatchReport) {
        match self.store.count_members(report.collection.id).await {
            Ok(0) => {
                let (collection, outcome) = self.cascade_cleanup(report.collection.clone()).await;
                report.collection = collection;
                report.cleanup = Some(outcome);
            }
            Ok(_) => {}
            Err(e) => {
                warn!(collection_id = report.collection.id, error = %e, "Could not count members");
                report.cleanup = Some(CleanupOutcome::Failed(e));
            }
        }
    }
}

/// Drop repeated keys, keeping first occurrence order
fn dedupe(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|key| seen.insert(key.clone()))
        .collect()
}
