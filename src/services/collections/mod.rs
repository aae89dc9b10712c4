//! Collection reconciliation between the local store and Plex

pub mod report;
pub mod service;

pub use report::*;
pub use service::{CollectionState, CollectionsService, CollectionsServiceConfig, MembershipDrift};
