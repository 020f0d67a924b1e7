use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

use super::Store;
use crate::error::{Error, Result};

/// The closed set of deferred user intents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionType {
    StarThread,
    MoveThread,
    SendEmail,
    SyncDraft,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::StarThread => "star_thread",
            ActionType::MoveThread => "move_thread",
            ActionType::SendEmail => "send_email",
            ActionType::SyncDraft => "sync_draft",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "star_thread" => Some(ActionType::StarThread),
            "move_thread" => Some(ActionType::MoveThread),
            "send_email" => Some(ActionType::SendEmail),
            "sync_draft" => Some(ActionType::SyncDraft),
            _ => None,
        }
    }
}

/// One durable queue row.
#[derive(Debug, Clone)]
pub struct ActionJob {
    pub id: i64,
    pub user_id: Uuid,
    pub action_type: ActionType,
    pub payload: serde_json::Value,
    pub process_at: DateTime<Utc>,
    pub attempts: i32,
}

fn job_from_row(row: &PgRow) -> std::result::Result<ActionJob, sqlx::Error> {
    let type_str: String = row.try_get("action_type")?;
    let action_type = ActionType::parse(&type_str).ok_or_else(|| {
        sqlx::Error::Decode(format!("unknown action_type: {}", type_str).into())
    })?;

    Ok(ActionJob {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        action_type,
        payload: row.try_get("payload")?,
        process_at: row.try_get("process_at")?,
        attempts: row.try_get("attempts")?,
    })
}

impl Store {
    /// Insert a user intent to run at `process_at`. Jobs are dispatched in
    /// `(process_at, id)` order, so same-instant jobs keep enqueue order.
    pub async fn enqueue_action(
        &self,
        user_id: Uuid,
        action_type: ActionType,
        payload: &serde_json::Value,
        process_at: DateTime<Utc>,
    ) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO action_queue (user_id, action_type, payload, process_at)
             VALUES ($1, $2, $3, $4)
             RETURNING id",
        )
        .bind(user_id)
        .bind(action_type.as_str())
        .bind(payload)
        .bind(process_at)
        .fetch_one(self.pool())
        .await?;

        Ok(row.try_get("id")?)
    }

    /// Undo: delete the row if it still exists and belongs to the caller.
    /// `Ok(false)` means the worker already took it (undo window expired);
    /// an ownership mismatch is a `Conflict`.
    pub async fn cancel_action(&self, user_id: Uuid, job_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM action_queue WHERE id = $1 AND user_id = $2")
            .bind(job_id)
            .bind(user_id)
            .execute(self.pool())
            .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        let exists = sqlx::query("SELECT 1 AS x FROM action_queue WHERE id = $1")
            .bind(job_id)
            .fetch_optional(self.pool())
            .await?;

        if exists.is_some() {
            // Row survives under another owner.
            return Err(Error::Conflict);
        }
        Ok(false)
    }

    /// Claim due rows inside the caller's transaction. `SKIP LOCKED` lets
    /// multiple worker processes coexist without double-dispatch: claimed
    /// rows stay locked until the transaction ends.
    pub async fn claim_due_actions(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ActionJob>> {
        let rows = sqlx::query(
            "SELECT id, user_id, action_type, payload, process_at, attempts
             FROM action_queue
             WHERE process_at <= $1
             ORDER BY process_at, id
             LIMIT $2
             FOR UPDATE SKIP LOCKED",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&mut **tx)
        .await?;

        Ok(rows
            .iter()
            .map(job_from_row)
            .collect::<std::result::Result<_, _>>()?)
    }

    /// Remove a completed job within the claiming transaction.
    pub async fn delete_action(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job_id: i64,
    ) -> Result<()> {
        sqlx::query("DELETE FROM action_queue WHERE id = $1")
            .bind(job_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Count a failed attempt; the row stays queued for the next poll.
    pub async fn record_attempt(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job_id: i64,
    ) -> Result<()> {
        sqlx::query("UPDATE action_queue SET attempts = attempts + 1 WHERE id = $1")
            .bind(job_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_type_roundtrip() {
        for ty in [
            ActionType::StarThread,
            ActionType::MoveThread,
            ActionType::SendEmail,
            ActionType::SyncDraft,
        ] {
            assert_eq!(ActionType::parse(ty.as_str()), Some(ty));
        }
        assert_eq!(ActionType::parse("defragment_mailbox"), None);
    }
}
