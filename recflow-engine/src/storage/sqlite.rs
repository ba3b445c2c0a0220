//! SQLite Storage Port implementation
//!
//! Records are stored one row per record with JSON text columns for the
//! opaque payloads (`data`, `features`, `classification`). All writes are
//! upserts keyed by the record's natural key.

use super::{Storage, StorageResult};
use crate::error::StorageError;
use crate::types::{Entity, Relation, User};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::time::Duration;

/// SQLite-backed storage
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a database file and ensure the schema exists
    pub async fn open(db_path: &Path) -> StorageResult<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StorageError::Backend(format!(
                        "Failed to create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        tracing::debug!("Connecting to database: {}", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, creating tables if missing
    pub async fn from_pool(pool: SqlitePool) -> StorageResult<Self> {
        init_tables(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Create recflow tables if they don't exist
async fn init_tables(pool: &SqlitePool) -> StorageResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entities (
            entity_type TEXT NOT NULL,
            id TEXT NOT NULL,
            data TEXT NOT NULL,
            features TEXT NOT NULL DEFAULT '{}',
            classification TEXT NOT NULL DEFAULT '{}',
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (entity_type, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            entity_type TEXT NOT NULL,
            id TEXT NOT NULL,
            features TEXT NOT NULL DEFAULT '{}',
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (entity_type, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS relations (
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            data TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (entity_type, entity_id, user_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS user_entity_classifications (
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            score REAL NOT NULL,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (entity_type, entity_id, user_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    tracing::info!(
        "Database tables initialized (entities, users, relations, user_entity_classifications)"
    );

    Ok(())
}

#[async_trait::async_trait]
impl Storage for SqliteStorage {
    async fn get_entity(&self, entity_type: &str, id: &str) -> StorageResult<Option<Entity>> {
        let row = sqlx::query(
            r#"
            SELECT id, data, features, classification
            FROM entities
            WHERE entity_type = ? AND id = ?
            "#,
        )
        .bind(entity_type)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let data: String = row.try_get("data")?;
                let features: String = row.try_get("features")?;
                let classification: String = row.try_get("classification")?;
                Ok(Some(Entity {
                    id: row.try_get("id")?,
                    data: serde_json::from_str(&data)?,
                    features: serde_json::from_str(&features)?,
                    classification: serde_json::from_str(&classification)?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn put_entity(&self, entity_type: &str, entity: &Entity) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO entities (entity_type, id, data, features, classification, updated_at)
            VALUES (?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(entity_type, id) DO UPDATE SET
                data = excluded.data,
                features = excluded.features,
                classification = excluded.classification,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(entity_type)
        .bind(&entity.id)
        .bind(serde_json::to_string(&entity.data)?)
        .bind(serde_json::to_string(&entity.features)?)
        .bind(serde_json::to_string(&entity.classification)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_users_related_to(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> StorageResult<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id
            FROM relations
            WHERE entity_type = ? AND entity_id = ?
            ORDER BY user_id
            "#,
        )
        .bind(entity_type)
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("user_id").map_err(StorageError::from))
            .collect()
    }

    async fn get_user(&self, entity_type: &str, user_id: &str) -> StorageResult<Option<User>> {
        let row = sqlx::query("SELECT id, features FROM users WHERE entity_type = ? AND id = ?")
            .bind(entity_type)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let features: String = row.try_get("features")?;
                Ok(Some(User {
                    id: row.try_get("id")?,
                    features: serde_json::from_str(&features)?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn put_user(&self, entity_type: &str, user: &User) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO users (entity_type, id, features, updated_at)
            VALUES (?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(entity_type, id) DO UPDATE SET
                features = excluded.features,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(entity_type)
        .bind(&user.id)
        .bind(serde_json::to_string(&user.features)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_relation(
        &self,
        entity_type: &str,
        entity_id: &str,
        user_id: &str,
    ) -> StorageResult<Option<Relation>> {
        let row = sqlx::query(
            r#"
            SELECT data
            FROM relations
            WHERE entity_type = ? AND entity_id = ? AND user_id = ?
            "#,
        )
        .bind(entity_type)
        .bind(entity_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let data: String = row.try_get("data")?;
                Ok(Some(Relation {
                    entity_id: entity_id.to_string(),
                    user_id: user_id.to_string(),
                    data: serde_json::from_str(&data)?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn put_relation(&self, entity_type: &str, relation: &Relation) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO relations (entity_type, entity_id, user_id, data, updated_at)
            VALUES (?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(entity_type, entity_id, user_id) DO UPDATE SET
                data = excluded.data,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(entity_type)
        .bind(&relation.entity_id)
        .bind(&relation.user_id)
        .bind(serde_json::to_string(&relation.data)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn put_user_entity_classification(
        &self,
        entity_type: &str,
        entity_id: &str,
        user_id: &str,
        score: f64,
    ) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO user_entity_classifications (entity_type, entity_id, user_id, score, updated_at)
            VALUES (?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(entity_type, entity_id, user_id) DO UPDATE SET
                score = excluded.score,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(entity_type)
        .bind(entity_id)
        .bind(user_id)
        .bind(score)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_user_entity_classification(
        &self,
        entity_type: &str,
        entity_id: &str,
        user_id: &str,
    ) -> StorageResult<Option<f64>> {
        let score: Option<(f64,)> = sqlx::query_as(
            r#"
            SELECT score
            FROM user_entity_classifications
            WHERE entity_type = ? AND entity_id = ? AND user_id = ?
            "#,
        )
        .bind(entity_type)
        .bind(entity_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(score.map(|(score,)| score))
    }
}
