//! Time-based retention for collection members
//!
//! Collections with `delete_after_days` drop members once they have been in
//! the collection that long. Removal goes through [CollectionsService], so a
//! collection emptied by retention loses its Plex collection as well.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::db::CollectionRecord;
use crate::error::Result;
use crate::services::collections::{BatchReport, CleanupOutcome, CollectionsService};

pub struct RetentionService {
    collections: Arc<CollectionsService>,
}

impl RetentionService {
    pub fn new(collections: Arc<CollectionsService>) -> Self {
        Self { collections }
    }

    /// Remove expired members from every active collection
    pub async fn sweep(&self) -> Result<Vec<BatchReport>> {
        self.sweep_at(Utc::now()).await
    }

    /// [Self::sweep] with an explicit clock
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<Vec<BatchReport>> {
        let store = self.collections.store();
        let mut reports = Vec::new();

        for collection in store.list().await? {
            if !collection.is_active || collection.delete_after_days.is_none() {
                continue;
            }

            let expired = match store.expired_members(collection.id, now).await {
                Ok(expired) => expired,
                Err(e) => {
                    warn!(collection_id = collection.id, error = %e, "Failed to list expired members");
                    continue;
                }
            };
            if expired.is_empty() {
                continue;
            }

            let keys: Vec<String> = expired.into_iter().map(|m| m.local_item_key).collect();
            info!(
                collection_id = collection.id,
                title = %collection.title,
                count = keys.len(),
                "Removing expired collection members"
            );

            match self
                .collections
                .remove_from_collection(collection.id, keys)
                .await
            {
                Ok(report) => {
                    if !report.is_complete() {
                        warn!(
                            collection_id = collection.id,
                            failed = report.failed_keys().len(),
                            "Retention sweep left members behind"
                        );
                    }
                    reports.push(report);
                }
                Err(e) => {
                    warn!(collection_id = collection.id, error = %e, "Retention sweep failed");
                }
            }
        }

        Ok(reports)
    }

    /// Retry deleting Plex collections of collections left without members
    pub async fn cleanup_empty(&self) -> Result<Vec<(CollectionRecord, CleanupOutcome)>> {
        let outcomes = self.collections.cleanup_empty_collections().await?;
        let failed = outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, CleanupOutcome::Failed(_)))
            .count();
        if !outcomes.is_empty() {
            info!(
                attempted = outcomes.len(),
                failed, "Empty collection cleanup finished"
            );
        }
        Ok(outcomes)
    }
}
