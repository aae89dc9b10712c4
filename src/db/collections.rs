//! Collection store
//!
//! Persists curated collections and their membership. The unique index on
//! `(collection_id, local_item_key)` is the only concurrency control the
//! reconciliation engine relies on.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteRow;

use crate::db::sqlite_helpers::{bool_to_int, decode_datetime, int_to_bool, now_iso8601};
use crate::error::{CollectionError, Result};

const COLLECTION_COLUMNS: &str = "id, title, description, library_id, media_type, remote_id, \
     is_active, visible_on_home, delete_after_days, created_at, updated_at";

const MEMBER_COLUMNS: &str = "id, collection_id, local_item_key, external_id, added_at";

/// Kind of library items a collection groups
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    #[default]
    Movie,
    Show,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Movie => "movie",
            MediaType::Show => "show",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "movie" => Some(MediaType::Movie),
            "show" => Some(MediaType::Show),
            _ => None,
        }
    }

    /// Plex metadata type number used when creating collections
    pub fn plex_type(&self) -> u8 {
        match self {
            MediaType::Movie => 1,
            MediaType::Show => 2,
        }
    }
}

/// Collection record from database
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionRecord {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub library_id: i64,
    pub media_type: MediaType,
    /// Plex rating key of the collection, `None` until materialized
    pub remote_id: Option<String>,
    pub is_active: bool,
    pub visible_on_home: bool,
    pub delete_after_days: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CollectionRecord {
    pub fn is_materialized(&self) -> bool {
        self.remote_id.is_some()
    }
}

impl sqlx::FromRow<'_, SqliteRow> for CollectionRecord {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        use sqlx::Row;

        let media_type_str: String = row.try_get("media_type")?;
        let media_type = MediaType::parse(&media_type_str).ok_or_else(|| {
            sqlx::Error::Decode(format!("Unknown media type '{}'", media_type_str).into())
        })?;
        let created_str: String = row.try_get("created_at")?;
        let updated_str: String = row.try_get("updated_at")?;

        Ok(Self {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            library_id: row.try_get("library_id")?,
            media_type,
            remote_id: row.try_get("remote_id")?,
            is_active: int_to_bool(row.try_get("is_active")?),
            visible_on_home: int_to_bool(row.try_get("visible_on_home")?),
            delete_after_days: row.try_get("delete_after_days")?,
            created_at: decode_datetime(&created_str)?,
            updated_at: decode_datetime(&updated_str)?,
        })
    }
}

/// Collection membership record from database
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionMemberRecord {
    pub id: i64,
    pub collection_id: i64,
    /// Plex rating key of the item
    pub local_item_key: String,
    /// TMDB id, `None` when resolution failed
    pub external_id: Option<i64>,
    pub added_at: DateTime<Utc>,
}

impl sqlx::FromRow<'_, SqliteRow> for CollectionMemberRecord {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        use sqlx::Row;

        let added_str: String = row.try_get("added_at")?;

        Ok(Self {
            id: row.try_get("id")?,
            collection_id: row.try_get("collection_id")?,
            local_item_key: row.try_get("local_item_key")?,
            external_id: row.try_get("external_id")?,
            added_at: decode_datetime(&added_str)?,
        })
    }
}

/// Input for creating (no `id`) or updating (with `id`) a collection.
///
/// The remote id is absent: it is set by [CollectionStore::insert_materialized]
/// or [CollectionStore::claim_remote_id] and cleared by
/// [CollectionStore::release_remote_id].
#[derive(Debug, Clone)]
pub struct UpsertCollection {
    pub id: Option<i64>,
    pub title: String,
    pub description: Option<String>,
    pub library_id: i64,
    pub media_type: MediaType,
    pub is_active: bool,
    pub visible_on_home: bool,
    pub delete_after_days: Option<i32>,
}

impl UpsertCollection {
    pub fn new(title: impl Into<String>, library_id: i64) -> Self {
        Self {
            id: None,
            title: title.into(),
            description: None,
            library_id,
            media_type: MediaType::default(),
            is_active: true,
            visible_on_home: false,
            delete_after_days: None,
        }
    }

    /// Start an update from the currently persisted values
    pub fn from_record(record: &CollectionRecord) -> Self {
        Self {
            id: Some(record.id),
            title: record.title.clone(),
            description: record.description.clone(),
            library_id: record.library_id,
            media_type: record.media_type,
            is_active: record.is_active,
            visible_on_home: record.visible_on_home,
            delete_after_days: record.delete_after_days,
        }
    }
}

/// Lookup key for a single collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionKey {
    Id(i64),
    Title(String),
}

impl fmt::Display for CollectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectionKey::Id(id) => write!(f, "id {}", id),
            CollectionKey::Title(title) => write!(f, "title '{}'", title),
        }
    }
}

/// Persistent record of collections and their membership
#[async_trait]
pub trait CollectionStore: Send + Sync {
    /// Fetch one collection, `NotFound` when nothing matches
    async fn get(&self, key: &CollectionKey) -> Result<CollectionRecord>;

    async fn list(&self) -> Result<Vec<CollectionRecord>>;

    /// Members in insertion order
    async fn list_members(&self, collection_id: i64) -> Result<Vec<CollectionMemberRecord>>;

    async fn count_members(&self, collection_id: i64) -> Result<i64>;

    async fn find_member(
        &self,
        collection_id: i64,
        local_item_key: &str,
    ) -> Result<Option<CollectionMemberRecord>>;

    async fn upsert_collection(&self, input: UpsertCollection) -> Result<CollectionRecord>;

    /// Insert a collection whose Plex collection already exists
    async fn insert_materialized(
        &self,
        input: UpsertCollection,
        remote_id: &str,
    ) -> Result<CollectionRecord>;

    /// Set the remote id of a collection that has none.
    ///
    /// `None` when another writer materialized the collection first.
    async fn claim_remote_id(&self, id: i64, remote_id: &str) -> Result<Option<CollectionRecord>>;

    /// Clear the remote id if it still is `expected`; `None` when it changed
    async fn release_remote_id(
        &self,
        id: i64,
        expected: &str,
    ) -> Result<Option<CollectionRecord>>;

    /// Insert a member row. Duplicates fail with `Conflict`.
    async fn add_member(
        &self,
        collection_id: i64,
        local_item_key: &str,
        external_id: Option<i64>,
    ) -> Result<CollectionMemberRecord>;

    /// Delete a member row, returning rows affected (0 when absent)
    async fn remove_member(&self, collection_id: i64, local_item_key: &str) -> Result<u64>;

    /// Delete a collection and all of its members atomically
    async fn delete_collection(&self, id: i64) -> Result<()>;

    /// Members whose retention window has elapsed at `now`
    async fn expired_members(
        &self,
        collection_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<CollectionMemberRecord>> {
        let collection = self.get(&CollectionKey::Id(collection_id)).await?;
        let Some(window) = collection
            .delete_after_days
            .and_then(|days| Duration::try_days(i64::from(days)))
        else {
            return Ok(Vec::new());
        };

        // Windows reaching past the representable range never expire
        Ok(self
            .list_members(collection_id)
            .await?
            .into_iter()
            .filter(|member| {
                member
                    .added_at
                    .checked_add_signed(window)
                    .is_some_and(|expires_at| expires_at <= now)
            })
            .collect())
    }
}

/// SQLite-backed [CollectionStore]
#[derive(Clone)]
pub struct CollectionRepository {
    pool: SqlitePool,
}

impl CollectionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn insert(
        &self,
        input: UpsertCollection,
        remote_id: Option<&str>,
    ) -> Result<CollectionRecord> {
        validate(&input)?;
        let now = now_iso8601();

        let record = sqlx::query_as::<_, CollectionRecord>(&format!(
            r#"
            INSERT INTO collections (
                title, description, library_id, media_type, remote_id,
                is_active, visible_on_home, delete_after_days, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
            RETURNING {}
            "#,
            COLLECTION_COLUMNS
        ))
        .bind(&input.title)
        .bind(&input.description)
        .bind(input.library_id)
        .bind(input.media_type.as_str())
        .bind(remote_id)
        .bind(bool_to_int(input.is_active))
        .bind(bool_to_int(input.visible_on_home))
        .bind(input.delete_after_days)
        .bind(&now)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    /// `Ok(None)` for an existing collection, `NotFound` otherwise
    async fn unchanged(&self, id: i64) -> Result<Option<CollectionRecord>> {
        self.get(&CollectionKey::Id(id)).await.map(|_| None)
    }
}

fn validate(input: &UpsertCollection) -> Result<()> {
    if input.title.trim().is_empty() {
        return Err(CollectionError::Invalid("title must not be empty".to_string()));
    }
    if input.delete_after_days.is_some_and(|days| days < 0) {
        return Err(CollectionError::Invalid(
            "delete_after_days must not be negative".to_string(),
        ));
    }
    Ok(())
}

#[async_trait]
impl CollectionStore for CollectionRepository {
    async fn get(&self, key: &CollectionKey) -> Result<CollectionRecord> {
        let record = match key {
            CollectionKey::Id(id) => {
                sqlx::query_as::<_, CollectionRecord>(&format!(
                    "SELECT {} FROM collections WHERE id = ?1",
                    COLLECTION_COLUMNS
                ))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
            }
            CollectionKey::Title(title) => {
                sqlx::query_as::<_, CollectionRecord>(&format!(
                    "SELECT {} FROM collections WHERE title = ?1",
                    COLLECTION_COLUMNS
                ))
                .bind(title)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        record.ok_or_else(|| CollectionError::NotFound(key.to_string()))
    }

    async fn list(&self) -> Result<Vec<CollectionRecord>> {
        let records = sqlx::query_as::<_, CollectionRecord>(&format!(
            "SELECT {} FROM collections ORDER BY id",
            COLLECTION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn list_members(&self, collection_id: i64) -> Result<Vec<CollectionMemberRecord>> {
        let records = sqlx::query_as::<_, CollectionMemberRecord>(&format!(
            "SELECT {} FROM collection_media WHERE collection_id = ?1 ORDER BY id",
            MEMBER_COLUMNS
        ))
        .bind(collection_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn count_members(&self, collection_id: i64) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM collection_media WHERE collection_id = ?1")
                .bind(collection_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

    async fn find_member(
        &self,
        collection_id: i64,
        local_item_key: &str,
    ) -> Result<Option<CollectionMemberRecord>> {
        let record = sqlx::query_as::<_, CollectionMemberRecord>(&format!(
            "SELECT {} FROM collection_media WHERE collection_id = ?1 AND local_item_key = ?2",
            MEMBER_COLUMNS
        ))
        .bind(collection_id)
        .bind(local_item_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn upsert_collection(&self, input: UpsertCollection) -> Result<CollectionRecord> {
        let Some(id) = input.id else {
            return self.insert(input, None).await;
        };
        validate(&input)?;
        let now = now_iso8601();

        sqlx::query_as::<_, CollectionRecord>(&format!(
            r#"
            UPDATE collections SET
                title = ?2,
                description = ?3,
                library_id = ?4,
                media_type = ?5,
                is_active = ?6,
                visible_on_home = ?7,
                delete_after_days = ?8,
                updated_at = ?9
            WHERE id = ?1
            RETURNING {}
            "#,
            COLLECTION_COLUMNS
        ))
        .bind(id)
        .bind(&input.title)
        .bind(&input.description)
        .bind(input.library_id)
        .bind(input.media_type.as_str())
        .bind(bool_to_int(input.is_active))
        .bind(bool_to_int(input.visible_on_home))
        .bind(input.delete_after_days)
        .bind(&now)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CollectionError::NotFound(CollectionKey::Id(id).to_string()))
    }

    async fn insert_materialized(
        &self,
        input: UpsertCollection,
        remote_id: &str,
    ) -> Result<CollectionRecord> {
        self.insert(input, Some(remote_id)).await
    }

    async fn claim_remote_id(&self, id: i64, remote_id: &str) -> Result<Option<CollectionRecord>> {
        let claimed = sqlx::query_as::<_, CollectionRecord>(&format!(
            "UPDATE collections SET remote_id = ?2, updated_at = ?3 \
             WHERE id = ?1 AND remote_id IS NULL RETURNING {}",
            COLLECTION_COLUMNS
        ))
        .bind(id)
        .bind(remote_id)
        .bind(now_iso8601())
        .fetch_optional(&self.pool)
        .await?;

        match claimed {
            Some(record) => Ok(Some(record)),
            None => self.unchanged(id).await,
        }
    }

    async fn release_remote_id(
        &self,
        id: i64,
        expected: &str,
    ) -> Result<Option<CollectionRecord>> {
        let released = sqlx::query_as::<_, CollectionRecord>(&format!(
            "UPDATE collections SET remote_id = NULL, updated_at = ?3 \
             WHERE id = ?1 AND remote_id = ?2 RETURNING {}",
            COLLECTION_COLUMNS
        ))
        .bind(id)
        .bind(expected)
        .bind(now_iso8601())
        .fetch_optional(&self.pool)
        .await?;

        match released {
            Some(record) => Ok(Some(record)),
            None => self.unchanged(id).await,
        }
    }

    async fn add_member(
        &self,
        collection_id: i64,
        local_item_key: &str,
        external_id: Option<i64>,
    ) -> Result<CollectionMemberRecord> {
        sqlx::query_as::<_, CollectionMemberRecord>(&format!(
            r#"
            INSERT INTO collection_media (collection_id, local_item_key, external_id, added_at)
            VALUES (?1, ?2, ?3, ?4)
            RETURNING {}
            "#,
            MEMBER_COLUMNS
        ))
        .bind(collection_id)
        .bind(local_item_key)
        .bind(external_id)
        .bind(now_iso8601())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                CollectionError::Conflict {
                    collection_id,
                    local_item_key: local_item_key.to_string(),
                }
            }
            other => CollectionError::Persistence(other),
        })
    }

    async fn remove_member(&self, collection_id: i64, local_item_key: &str) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM collection_media WHERE collection_id = ?1 AND local_item_key = ?2",
        )
        .bind(collection_id)
        .bind(local_item_key)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn delete_collection(&self, id: i64) -> Result<()> {
        // Dropping the transaction without commit rolls both deletes back
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM collection_media WHERE collection_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let deleted = sqlx::query("DELETE FROM collections WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        if deleted.rows_affected() == 0 {
            return Err(CollectionError::NotFound(CollectionKey::Id(id).to_string()));
        }

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    async fn repo() -> CollectionRepository {
        Database::connect_in_memory().await.unwrap().collections()
    }

    #[tokio::test]
    async fn test_insert_and_get_by_id_and_title() {
        let repo = repo().await;
        let mut input = UpsertCollection::new("Kids", 1);
        input.description = Some("Family night".to_string());
        input.delete_after_days = Some(30);

        let created = repo.upsert_collection(input).await.unwrap();
        assert_eq!(created.remote_id, None);
        assert!(created.is_active);
        assert_eq!(created.delete_after_days, Some(30));

        let by_id = repo.get(&CollectionKey::Id(created.id)).await.unwrap();
        let by_title = repo
            .get(&CollectionKey::Title("Kids".to_string()))
            .await
            .unwrap();
        assert_eq!(by_id, created);
        assert_eq!(by_title, created);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let repo = repo().await;
        assert_matches!(
            repo.get(&CollectionKey::Id(404)).await,
            Err(CollectionError::NotFound(_))
        );
        assert_matches!(
            repo.get(&CollectionKey::Title("nope".to_string())).await,
            Err(CollectionError::NotFound(_))
        );
    }

    #[tokio::test]
    async fn test_update_keeps_remote_id() {
        let repo = repo().await;
        let created = repo
            .upsert_collection(UpsertCollection::new("Kids", 1))
            .await
            .unwrap();
        repo.claim_remote_id(created.id, "5001").await.unwrap();

        let mut update = UpsertCollection::from_record(&created);
        update.title = "Kids & Family".to_string();
        update.visible_on_home = true;
        let updated = repo.upsert_collection(update).await.unwrap();

        assert_eq!(updated.id, created.id);
        assert_eq!(updated.title, "Kids & Family");
        assert!(updated.visible_on_home);
        assert_eq!(updated.remote_id.as_deref(), Some("5001"));
    }

    #[tokio::test]
    async fn test_update_missing_collection_is_not_found() {
        let repo = repo().await;
        let mut update = UpsertCollection::new("Ghost", 1);
        update.id = Some(77);
        assert_matches!(
            repo.upsert_collection(update).await,
            Err(CollectionError::NotFound(_))
        );
    }

    #[tokio::test]
    async fn test_duplicate_title_is_persistence_error() {
        let repo = repo().await;
        repo.upsert_collection(UpsertCollection::new("Kids", 1))
            .await
            .unwrap();
        assert_matches!(
            repo.upsert_collection(UpsertCollection::new("Kids", 2)).await,
            Err(CollectionError::Persistence(_))
        );
        assert_eq!(repo.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_members_keep_insertion_order() {
        let repo = repo().await;
        let collection = repo
            .upsert_collection(UpsertCollection::new("Kids", 1))
            .await
            .unwrap();

        for key in ["42", "7", "19"] {
            repo.add_member(collection.id, key, None).await.unwrap();
        }

        let keys: Vec<String> = repo
            .list_members(collection.id)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.local_item_key)
            .collect();
        assert_eq!(keys, vec!["42", "7", "19"]);
        assert_eq!(repo.count_members(collection.id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_member_is_conflict() {
        let repo = repo().await;
        let collection = repo
            .upsert_collection(UpsertCollection::new("Kids", 1))
            .await
            .unwrap();

        repo.add_member(collection.id, "42", Some(603)).await.unwrap();
        let err = repo.add_member(collection.id, "42", None).await.unwrap_err();
        assert_matches!(
            err,
            CollectionError::Conflict { collection_id, ref local_item_key }
                if collection_id == collection.id && local_item_key == "42"
        );
    }

    #[tokio::test]
    async fn test_remove_absent_member_is_noop() {
        let repo = repo().await;
        let collection = repo
            .upsert_collection(UpsertCollection::new("Kids", 1))
            .await
            .unwrap();
        repo.add_member(collection.id, "42", None).await.unwrap();

        assert_eq!(repo.remove_member(collection.id, "99").await.unwrap(), 0);
        assert_eq!(repo.remove_member(collection.id, "42").await.unwrap(), 1);
        assert_eq!(repo.remove_member(collection.id, "42").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_collection_cascades_members() {
        let repo = repo().await;
        let collection = repo
            .upsert_collection(UpsertCollection::new("Kids", 1))
            .await
            .unwrap();
        repo.add_member(collection.id, "42", None).await.unwrap();
        repo.add_member(collection.id, "43", None).await.unwrap();

        repo.delete_collection(collection.id).await.unwrap();

        assert_matches!(
            repo.get(&CollectionKey::Id(collection.id)).await,
            Err(CollectionError::NotFound(_))
        );
        assert_eq!(repo.count_members(collection.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_delete_leaves_collection_and_members() {
        let db = Database::connect_in_memory().await.unwrap();
        let repo = db.collections();
        let collection = repo
            .upsert_collection(UpsertCollection::new("Kids", 1))
            .await
            .unwrap();
        repo.add_member(collection.id, "42", None).await.unwrap();

        sqlx::query(
            "CREATE TRIGGER block_collection_delete BEFORE DELETE ON collections \
             BEGIN SELECT RAISE(ABORT, 'delete blocked'); END",
        )
        .execute(db.pool())
        .await
        .unwrap();

        assert_matches!(
            repo.delete_collection(collection.id).await,
            Err(CollectionError::Persistence(_))
        );
        assert_eq!(repo.list_members(collection.id).await.unwrap().len(), 1);
        assert!(repo.get(&CollectionKey::Id(collection.id)).await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_members_respects_retention_window() {
        let db = Database::connect_in_memory().await.unwrap();
        let repo = db.collections();
        let mut input = UpsertCollection::new("Leaving soon", 1);
        input.delete_after_days = Some(10);
        let collection = repo.upsert_collection(input).await.unwrap();

        repo.add_member(collection.id, "old", None).await.unwrap();
        repo.add_member(collection.id, "new", None).await.unwrap();
        sqlx::query("UPDATE collection_media SET added_at = ?1 WHERE local_item_key = 'old'")
            .bind((Utc::now() - Duration::days(11)).to_rfc3339())
            .execute(db.pool())
            .await
            .unwrap();

        let expired = repo
            .expired_members(collection.id, Utc::now())
            .await
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].local_item_key, "old");
    }

    #[tokio::test]
    async fn test_no_retention_window_means_nothing_expires() {
        let repo = repo().await;
        let collection = repo
            .upsert_collection(UpsertCollection::new("Forever", 1))
            .await
            .unwrap();
        repo.add_member(collection.id, "42", None).await.unwrap();

        let far_future = Utc::now() + Duration::days(10_000);
        assert!(
            repo.expired_members(collection.id, far_future)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_claim_remote_id_only_once() {
        let repo = repo().await;
        let created = repo
            .upsert_collection(UpsertCollection::new("Kids", 1))
            .await
            .unwrap();

        let claimed = repo.claim_remote_id(created.id, "5001").await.unwrap();
        assert_eq!(claimed.unwrap().remote_id.as_deref(), Some("5001"));

        assert_eq!(repo.claim_remote_id(created.id, "5002").await.unwrap(), None);
        let current = repo.get(&CollectionKey::Id(created.id)).await.unwrap();
        assert_eq!(current.remote_id.as_deref(), Some("5001"));

        assert_matches!(
            repo.claim_remote_id(404, "5003").await,
            Err(CollectionError::NotFound(_))
        );
    }

    #[tokio::test]
    async fn test_release_remote_id_expects_current_value() {
        let repo = repo().await;
        let created = repo
            .insert_materialized(UpsertCollection::new("Kids", 1), "5001")
            .await
            .unwrap();
        assert_eq!(created.remote_id.as_deref(), Some("5001"));

        assert_eq!(repo.release_remote_id(created.id, "4999").await.unwrap(), None);
        let released = repo
            .release_remote_id(created.id, "5001")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(released.remote_id, None);
    }

    #[tokio::test]
    async fn test_negative_retention_is_rejected() {
        let repo = repo().await;
        let mut input = UpsertCollection::new("Kids", 1);
        input.delete_after_days = Some(-1);

        assert_matches!(
            repo.upsert_collection(input.clone()).await,
            Err(CollectionError::Invalid(_))
        );
        assert_matches!(
            repo.insert_materialized(input, "5001").await,
            Err(CollectionError::Invalid(_))
        );
        assert!(repo.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_huge_retention_window_never_expires() {
        let repo = repo().await;
        let mut input = UpsertCollection::new("Forever-ish", 1);
        input.delete_after_days = Some(i32::MAX);
        let collection = repo.upsert_collection(input).await.unwrap();
        repo.add_member(collection.id, "42", None).await.unwrap();

        assert!(
            repo.expired_members(collection.id, Utc::now())
                .await
                .unwrap()
                .is_empty()
        );
    }
}
