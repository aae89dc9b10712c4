//! Error taxonomy shared by the collection store, the Plex boundary and the
//! reconciliation engine.

use thiserror::Error;

/// Errors surfaced by collection reconciliation.
///
/// `Resolution` is never fatal to an engine operation: it is logged and the
/// member is stored with an unresolved external id.
#[derive(Debug, Error)]
pub enum CollectionError {
    /// A call to the media server failed, timed out or answered `NOK`.
    #[error("Plex {operation} failed: {message}")]
    Remote {
        operation: &'static str,
        message: String,
    },

    /// External id lookup failed for an item.
    #[error("Could not resolve external id for item {item_key}: {message}")]
    Resolution { item_key: String, message: String },

    /// The local store rejected or failed a write/read.
    #[error("Database error: {0}")]
    Persistence(#[source] sqlx::Error),

    /// Uniqueness violation on `(collection_id, local_item_key)`.
    #[error("Item {local_item_key} is already a member of collection {collection_id}")]
    Conflict {
        collection_id: i64,
        local_item_key: String,
    },

    /// The input was rejected before reaching the store.
    #[error("Invalid collection: {0}")]
    Invalid(String),

    /// No collection matched the lookup.
    #[error("Collection not found: {0}")]
    NotFound(String),
}

impl CollectionError {
    pub fn remote(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Remote {
            operation,
            message: message.into(),
        }
    }

    pub fn resolution(item_key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Resolution {
            item_key: item_key.into(),
            message: message.into(),
        }
    }

    /// Whether this error came from the media server side.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }
}

impl From<sqlx::Error> for CollectionError {
    fn from(err: sqlx::Error) -> Self {
        Self::Persistence(err)
    }
}

pub type Result<T, E = CollectionError> = std::result::Result<T, E>;
