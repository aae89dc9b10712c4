//! Per-item results of batch collection operations

use crate::db::CollectionRecord;
use crate::error::CollectionError;

/// What happened to a single item in a batch
#[derive(Debug)]
pub enum MemberOutcome {
    /// Added remotely and recorded locally
    Added { external_id: Option<i64> },
    /// Already a member; nothing sent to Plex
    AlreadyPresent,
    /// Removed remotely and locally
    Removed,
    /// Not a member; nothing to do
    AlreadyAbsent,
    /// The item was left as it was
    Failed(CollectionError),
}

impl MemberOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, MemberOutcome::Failed(_))
    }
}

#[derive(Debug)]
pub struct MemberResult {
    pub item_key: String,
    pub outcome: MemberOutcome,
}

/// Result of deleting the remote object of a collection that ran out of members
#[derive(Debug)]
pub enum CleanupOutcome {
    /// Remote object deleted and the remote id cleared
    RemoteDeleted,
    /// Remote deletion (or clearing the remote id) failed; the collection
    /// stays materialized with zero members until the next cleanup
    Failed(CollectionError),
}

/// Summary of a batch add/remove, in input order
#[derive(Debug)]
pub struct BatchReport {
    /// Collection as persisted after the batch
    pub collection: CollectionRecord,
    pub results: Vec<MemberResult>,
    /// Set when the batch left the collection empty and cleanup ran
    pub cleanup: Option<CleanupOutcome>,
}

impl BatchReport {
    pub fn new(collection: CollectionRecord) -> Self {
        Self {
            collection,
            results: Vec::new(),
            cleanup: None,
        }
    }

    pub fn succeeded_keys(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| r.outcome.is_success())
            .map(|r| r.item_key.as_str())
            .collect()
    }

    /// Keys worth retrying
    pub fn failed_keys(&self) -> Vec<&str> {
        self.failures().map(|(key, _)| key).collect()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &CollectionError)> {
        self.results.iter().filter_map(|r| match &r.outcome {
            MemberOutcome::Failed(e) => Some((r.item_key.as_str(), e)),
            _ => None,
        })
    }

    pub fn outcome_of(&self, item_key: &str) -> Option<&MemberOutcome> {
        self.results
            .iter()
            .find(|r| r.item_key == item_key)
            .map(|r| &r.outcome)
    }

    /// True when every item succeeded and cleanup (if any) went through
    pub fn is_complete(&self) -> bool {
        self.results.iter().all(|r| r.outcome.is_success())
            && !matches!(self.cleanup, Some(CleanupOutcome::Failed(_)))
    }
}
