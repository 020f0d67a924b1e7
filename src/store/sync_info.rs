use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use super::Store;
use crate::error::Result;

/// Per-`(user, folder)` sync cursor and materialized thread count.
#[derive(Debug, Clone, PartialEq)]
pub struct FolderSyncInfo {
    pub user_id: Uuid,
    pub folder_name: String,
    pub synced_at: DateTime<Utc>,
    /// Highest UID integrated; absent before the first successful sync.
    pub last_synced_uid: Option<i64>,
    /// Materialized count for pagination; NULL forces recomputation.
    pub thread_count: Option<i64>,
}

fn info_from_row(row: &PgRow) -> std::result::Result<FolderSyncInfo, sqlx::Error> {
    Ok(FolderSyncInfo {
        user_id: row.try_get("user_id")?,
        folder_name: row.try_get("folder_name")?,
        synced_at: row.try_get("synced_at")?,
        last_synced_uid: row.try_get("last_synced_uid")?,
        thread_count: row.try_get("thread_count")?,
    })
}

impl Store {
    pub async fn folder_sync_info(
        &self,
        user_id: Uuid,
        folder: &str,
    ) -> Result<Option<FolderSyncInfo>> {
        let row = sqlx::query(
            "SELECT * FROM folder_sync_info WHERE user_id = $1 AND folder_name = $2",
        )
        .bind(user_id)
        .bind(folder)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.as_ref().map(info_from_row).transpose()?)
    }

    /// Stamp a successful sync. `max_uid = None` (nothing new, or an empty
    /// folder) refreshes `synced_at` and leaves the cursor untouched; a
    /// value only ever advances the cursor (monotone, `GREATEST`).
    pub async fn record_sync(
        &self,
        user_id: Uuid,
        folder: &str,
        max_uid: Option<u32>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO folder_sync_info (user_id, folder_name, synced_at, last_synced_uid)
            VALUES ($1, $2, now(), $3)
            ON CONFLICT (user_id, folder_name) DO UPDATE SET
                synced_at = now(),
                last_synced_uid = CASE
                    WHEN EXCLUDED.last_synced_uid IS NULL
                        THEN folder_sync_info.last_synced_uid
                    ELSE GREATEST(
                        COALESCE(folder_sync_info.last_synced_uid, 0),
                        EXCLUDED.last_synced_uid
                    )
                END
            "#,
        )
        .bind(user_id)
        .bind(folder)
        .bind(max_uid.map(|u| u as i64))
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Recompute and materialize the folder's thread count.
    pub async fn refresh_thread_count(&self, user_id: Uuid, folder: &str) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(DISTINCT thread_id) AS cnt FROM messages
             WHERE user_id = $1 AND imap_folder_name = $2",
        )
        .bind(user_id)
        .bind(folder)
        .fetch_one(self.pool())
        .await?;
        let count: i64 = row.try_get("cnt")?;

        sqlx::query(
            r#"
            INSERT INTO folder_sync_info (user_id, folder_name, synced_at, thread_count)
            VALUES ($1, $2, now(), $3)
            ON CONFLICT (user_id, folder_name) DO UPDATE SET
                thread_count = EXCLUDED.thread_count
            "#,
        )
        .bind(user_id)
        .bind(folder)
        .bind(count)
        .execute(self.pool())
        .await?;

        Ok(count)
    }

    /// Materialized thread count, recomputing on demand when NULL.
    pub async fn thread_count(&self, user_id: Uuid, folder: &str) -> Result<i64> {
        let info = self.folder_sync_info(user_id, folder).await?;
        match info.and_then(|i| i.thread_count) {
            Some(count) => Ok(count),
            None => self.refresh_thread_count(user_id, folder).await,
        }
    }
}
