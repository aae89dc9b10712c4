//! Schema bootstrap for the collection tables
//!
//! Creates the `collections` and `collection_media` tables when they are
//! missing. Existing tables are left untouched; column changes require a
//! database wipe.

use sqlx::SqlitePool;
use tracing::{debug, info, warn};

/// Result of a schema sync operation
#[derive(Debug, Default)]
pub struct SchemaSyncResult {
    pub tables_created: Vec<String>,
    pub errors: Vec<String>,
}

const COLLECTIONS_SQL: &str = r#"
CREATE TABLE collections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    description TEXT,
    library_id INTEGER NOT NULL,
    media_type TEXT NOT NULL DEFAULT 'movie',
    remote_id TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    visible_on_home INTEGER NOT NULL DEFAULT 0,
    delete_after_days INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
"#;

const COLLECTION_MEDIA_SQL: &str = r#"
CREATE TABLE collection_media (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    collection_id INTEGER NOT NULL REFERENCES collections(id) ON DELETE CASCADE,
    local_item_key TEXT NOT NULL,
    external_id INTEGER,
    added_at TEXT NOT NULL
)
"#;

const INDEXES: &[&str] = &[
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_collections_title ON collections(title)",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_collection_media_member ON collection_media(collection_id, local_item_key)",
];

/// Check if a table exists in the database
async fn table_exists(pool: &SqlitePool, table_name: &str) -> Result<bool, sqlx::Error> {
    let result: Option<(String,)> =
        sqlx::query_as("SELECT name FROM sqlite_master WHERE type='table' AND name = ?")
            .bind(table_name)
            .fetch_optional(pool)
            .await?;

    Ok(result.is_some())
}

async fn create_table(
    pool: &SqlitePool,
    table_name: &str,
    create_sql: &str,
    result: &mut SchemaSyncResult,
) -> Result<(), sqlx::Error> {
    if table_exists(pool, table_name).await? {
        debug!(table = table_name, "Table already exists");
        return Ok(());
    }

    match sqlx::query(create_sql).execute(pool).await {
        Ok(_) => {
            info!("Created table: {}", table_name);
            result.tables_created.push(table_name.to_string());
        }
        Err(e) => {
            let msg = format!("Failed to create table {}: {}", table_name, e);
            warn!("{}", msg);
            result.errors.push(msg);
        }
    }
    Ok(())
}

/// Create any missing collection tables and indexes
pub async fn sync_collection_schema(pool: &SqlitePool) -> Result<SchemaSyncResult, sqlx::Error> {
    let mut result = SchemaSyncResult::default();

    create_table(pool, "collections", COLLECTIONS_SQL, &mut result).await?;
    create_table(pool, "collection_media", COLLECTION_MEDIA_SQL, &mut result).await?;

    for sql in INDEXES {
        if let Err(e) = sqlx::query(sql).execute(pool).await {
            let msg = format!("Failed to create index: {}", e);
            warn!("{}", msg);
            result.errors.push(msg);
        }
    }

    Ok(result)
}
