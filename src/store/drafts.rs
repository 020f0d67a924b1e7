use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use super::Store;
use crate::error::Result;

/// Local-first draft. `imap_uid` is 0 until the draft has been appended to
/// the server Drafts folder by a `sync_draft` job.
#[derive(Debug, Clone, PartialEq)]
pub struct Draft {
    pub id: i64,
    pub user_id: Uuid,
    pub to_addresses: Vec<String>,
    pub subject: String,
    pub body: String,
    pub in_reply_to: Option<String>,
    pub imap_uid: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewDraft {
    pub to_addresses: Vec<String>,
    pub subject: String,
    pub body: String,
    pub in_reply_to: Option<String>,
}

fn draft_from_row(row: &PgRow) -> std::result::Result<Draft, sqlx::Error> {
    Ok(Draft {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        to_addresses: row.try_get("to_addresses")?,
        subject: row.try_get("subject")?,
        body: row.try_get("body")?,
        in_reply_to: row.try_get("in_reply_to")?,
        imap_uid: row.try_get("imap_uid")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl Store {
    pub async fn create_draft(&self, user_id: Uuid, draft: &NewDraft) -> Result<Draft> {
        let row = sqlx::query(
            "INSERT INTO drafts (user_id, to_addresses, subject, body, in_reply_to)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING *",
        )
        .bind(user_id)
        .bind(&draft.to_addresses)
        .bind(&draft.subject)
        .bind(&draft.body)
        .bind(&draft.in_reply_to)
        .fetch_one(self.pool())
        .await?;

        Ok(draft_from_row(&row)?)
    }

    pub async fn update_draft(&self, user_id: Uuid, id: i64, draft: &NewDraft) -> Result<()> {
        sqlx::query(
            "UPDATE drafts
             SET to_addresses = $1, subject = $2, body = $3, in_reply_to = $4,
                 updated_at = now()
             WHERE id = $5 AND user_id = $6",
        )
        .bind(&draft.to_addresses)
        .bind(&draft.subject)
        .bind(&draft.body)
        .bind(&draft.in_reply_to)
        .bind(id)
        .bind(user_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn draft(&self, user_id: Uuid, id: i64) -> Result<Option<Draft>> {
        let row = sqlx::query("SELECT * FROM drafts WHERE id = $1 AND user_id = $2")
            .bind(id)
            .bind(user_id)
            .fetch_optional(self.pool())
            .await?;

        Ok(row.as_ref().map(draft_from_row).transpose()?)
    }

    pub async fn list_drafts(&self, user_id: Uuid) -> Result<Vec<Draft>> {
        let rows = sqlx::query(
            "SELECT * FROM drafts WHERE user_id = $1 ORDER BY updated_at DESC",
        )
        .bind(user_id)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .iter()
            .map(draft_from_row)
            .collect::<std::result::Result<_, _>>()?)
    }

    pub async fn delete_draft(&self, user_id: Uuid, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM drafts WHERE id = $1 AND user_id = $2")
            .bind(id)
            .bind(user_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn set_draft_uid(&self, user_id: Uuid, id: i64, imap_uid: u32) -> Result<()> {
        sqlx::query(
            "UPDATE drafts SET imap_uid = $1, updated_at = now()
             WHERE id = $2 AND user_id = $3",
        )
        .bind(imap_uid as i64)
        .bind(id)
        .bind(user_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
