// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use chrono::{DateTime, Utc};
use log::debug;
use serde::Serialize;
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use super::Store;
use crate::error::{is_unique_violation, Error, Result};
use crate::mime::ParsedAttachment;

#[derive(Debug, Clone, PartialEq)]
pub struct Thread {
    pub id: i64,
    pub user_id: Uuid,
    pub stable_thread_id: String,
    pub subject: String,
}

/// A thread plus the newest message date among its messages in the listed
/// folder; the pagination sort key.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadSummary {
    pub thread: Thread,
    pub newest_sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedMessage {
    pub id: i64,
    pub thread_id: i64,
    pub user_id: Uuid,
    pub imap_uid: u32,
    pub imap_folder_name: String,
    pub message_id_header: String,
    pub from_address: String,
    pub to_addresses: Vec<String>,
    pub cc_addresses: Vec<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub subject: String,
    pub unsafe_body_html: Option<String>,
    pub body_text: Option<String>,
    pub is_read: bool,
    pub is_starred: bool,
}

impl CachedMessage {
    pub fn has_body(&self) -> bool {
        self.unsafe_body_html.is_some() || self.body_text.is_some()
    }
}

/// One message as produced by a sync pass. Body fields are absent by design:
/// bodies arrive through the lazy fetch path and survive envelope re-syncs.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub user_id: Uuid,
    pub thread_id: i64,
    pub imap_uid: u32,
    pub imap_folder_name: String,
    pub message_id_header: String,
    pub from_address: String,
    pub to_addresses: Vec<String>,
    pub cc_addresses: Vec<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub subject: String,
    pub is_read: bool,
    pub is_starred: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attachment {
    pub id: i64,
    pub message_id: i64,
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub is_inline: bool,
    pub content_id: Option<String>,
}

fn thread_from_row(row: &PgRow) -> std::result::Result<Thread, sqlx::Error> {
    Ok(Thread {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        stable_thread_id: row.try_get("stable_thread_id")?,
        subject: row.try_get("subject")?,
    })
}

fn message_from_row(row: &PgRow) -> std::result::Result<CachedMessage, sqlx::Error> {
    Ok(CachedMessage {
        id: row.try_get("id")?,
        thread_id: row.try_get("thread_id")?,
        user_id: row.try_get("user_id")?,
        imap_uid: row.try_get::<i64, _>("imap_uid")? as u32,
        imap_folder_name: row.try_get("imap_folder_name")?,
        message_id_header: row.try_get("message_id_header")?,
        from_address: row.try_get("from_address")?,
        to_addresses: row.try_get("to_addresses")?,
        cc_addresses: row.try_get("cc_addresses")?,
        sent_at: row.try_get("sent_at")?,
        subject: row.try_get("subject")?,
        unsafe_body_html: row.try_get("unsafe_body_html")?,
        body_text: row.try_get("body_text")?,
        is_read: row.try_get("is_read")?,
        is_starred: row.try_get("is_starred")?,
    })
}

fn attachment_from_row(row: &PgRow) -> std::result::Result<Attachment, sqlx::Error> {
    Ok(Attachment {
        id: row.try_get("id")?,
        message_id: row.try_get("message_id")?,
        filename: row.try_get("filename")?,
        mime_type: row.try_get("mime_type")?,
        size_bytes: row.try_get("size_bytes")?,
        is_inline: row.try_get("is_inline")?,
        content_id: row.try_get("content_id")?,
    })
}

impl Store {
    /// Get the thread for `stable_thread_id`, creating it with `subject` if
    /// absent. An existing thread keeps its subject (the root message, not a
    /// reply, names the conversation).
    pub async fn attach_thread(
        &self,
        user_id: Uuid,
        stable_thread_id: &str,
        subject: &str,
    ) -> Result<Thread> {
        let row = sqlx::query(
            r#"
            INSERT INTO threads (user_id, stable_thread_id, subject)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, stable_thread_id) DO UPDATE SET subject = threads.subject
            RETURNING id, user_id, stable_thread_id, subject
            "#,
        )
        .bind(user_id)
        .bind(stable_thread_id)
        .bind(subject)
        .fetch_one(self.pool())
        .await?;

        Ok(thread_from_row(&row)?)
    }

    /// Like [`Store::attach_thread`] but authoritative about the subject;
    /// used by the full sync where the subject comes from the root envelope.
    pub async fn upsert_thread(
        &self,
        user_id: Uuid,
        stable_thread_id: &str,
        subject: &str,
    ) -> Result<Thread> {
        let row = sqlx::query(
            r#"
            INSERT INTO threads (user_id, stable_thread_id, subject)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, stable_thread_id) DO UPDATE SET subject = EXCLUDED.subject
            RETURNING id, user_id, stable_thread_id, subject
            "#,
        )
        .bind(user_id)
        .bind(stable_thread_id)
        .bind(subject)
        .fetch_one(self.pool())
        .await?;

        Ok(thread_from_row(&row)?)
    }

    pub async fn thread_by_id(&self, user_id: Uuid, thread_id: i64) -> Result<Option<Thread>> {
        let row = sqlx::query(
            "SELECT id, user_id, stable_thread_id, subject FROM threads
             WHERE id = $1 AND user_id = $2",
        )
        .bind(thread_id)
        .bind(user_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.as_ref().map(thread_from_row).transpose()?)
    }

    pub async fn thread_by_stable_id(
        &self,
        user_id: Uuid,
        stable_thread_id: &str,
    ) -> Result<Option<Thread>> {
        let row = sqlx::query(
            "SELECT id, user_id, stable_thread_id, subject FROM threads
             WHERE user_id = $1 AND stable_thread_id = $2",
        )
        .bind(user_id)
        .bind(stable_thread_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.as_ref().map(thread_from_row).transpose()?)
    }

    /// Idempotent write keyed by `(user_id, folder, uid)`. Returns the row
    /// id. Bodies already fetched for the row are preserved.
    pub async fn upsert_message(&self, message: &NewMessage) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO messages (
                thread_id, user_id, imap_uid, imap_folder_name, message_id_header,
                from_address, to_addresses, cc_addresses, sent_at, subject,
                is_read, is_starred
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (user_id, imap_folder_name, imap_uid) DO UPDATE SET
                thread_id = EXCLUDED.thread_id,
                message_id_header = EXCLUDED.message_id_header,
                from_address = EXCLUDED.from_address,
                to_addresses = EXCLUDED.to_addresses,
                cc_addresses = EXCLUDED.cc_addresses,
                sent_at = EXCLUDED.sent_at,
                subject = EXCLUDED.subject,
                is_read = EXCLUDED.is_read,
                is_starred = EXCLUDED.is_starred
            RETURNING id
            "#,
        )
        .bind(message.thread_id)
        .bind(message.user_id)
        .bind(message.imap_uid as i64)
        .bind(&message.imap_folder_name)
        .bind(&message.message_id_header)
        .bind(&message.from_address)
        .bind(&message.to_addresses)
        .bind(&message.cc_addresses)
        .bind(message.sent_at)
        .bind(&message.subject)
        .bind(message.is_read)
        .bind(message.is_starred)
        .fetch_one(self.pool())
        .await;

        match result {
            Ok(row) => Ok(row.try_get("id")?),
            Err(e) if is_unique_violation(&e) => {
                // A concurrent upsert of the same natural key won the race.
                debug!(
                    "concurrent upsert won for {}/{}",
                    message.imap_folder_name, message.imap_uid
                );
                let row = sqlx::query(
                    "SELECT id FROM messages
                     WHERE user_id = $1 AND imap_folder_name = $2 AND imap_uid = $3",
                )
                .bind(message.user_id)
                .bind(&message.imap_folder_name)
                .bind(message.imap_uid as i64)
                .fetch_one(self.pool())
                .await?;
                Ok(row.try_get("id")?)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn message_by_uid(
        &self,
        user_id: Uuid,
        folder: &str,
        uid: u32,
    ) -> Result<Option<CachedMessage>> {
        let row = sqlx::query(
            "SELECT * FROM messages
             WHERE user_id = $1 AND imap_folder_name = $2 AND imap_uid = $3",
        )
        .bind(user_id)
        .bind(folder)
        .bind(uid as i64)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.as_ref().map(message_from_row).transpose()?)
    }

    /// Any cached copy of the message with this `Message-ID` header.
    pub async fn message_by_message_id_header(
        &self,
        user_id: Uuid,
        message_id_header: &str,
    ) -> Result<Option<CachedMessage>> {
        let row = sqlx::query(
            "SELECT * FROM messages
             WHERE user_id = $1 AND message_id_header = $2
             ORDER BY id LIMIT 1",
        )
        .bind(user_id)
        .bind(message_id_header)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.as_ref().map(message_from_row).transpose()?)
    }

    pub async fn messages_in_thread(
        &self,
        user_id: Uuid,
        stable_thread_id: &str,
    ) -> Result<Vec<CachedMessage>> {
        let rows = sqlx::query(
            "SELECT m.* FROM messages m
             JOIN threads t ON m.thread_id = t.id
             WHERE t.user_id = $1 AND t.stable_thread_id = $2
             ORDER BY m.sent_at ASC NULLS LAST, m.id ASC",
        )
        .bind(user_id)
        .bind(stable_thread_id)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .iter()
            .map(message_from_row)
            .collect::<std::result::Result<_, _>>()?)
    }

    /// Thread listing for one folder: threads with ≥ 1 message in the
    /// folder, newest message first, nulls last, ties by thread id. Backed
    /// by the `(user_id, imap_folder_name, sent_at DESC)` index.
    pub async fn list_threads(
        &self,
        user_id: Uuid,
        folder: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ThreadSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT t.id, t.user_id, t.stable_thread_id, t.subject, agg.newest_sent_at
            FROM threads t
            JOIN (
                SELECT thread_id, MAX(sent_at) AS newest_sent_at
                FROM messages
                WHERE user_id = $1 AND imap_folder_name = $2
                GROUP BY thread_id
            ) agg ON agg.thread_id = t.id
            ORDER BY agg.newest_sent_at DESC NULLS LAST, t.id ASC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(user_id)
        .bind(folder)
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool())
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ThreadSummary {
                    thread: thread_from_row(row)?,
                    newest_sent_at: row.try_get("newest_sent_at")?,
                })
            })
            .collect::<std::result::Result<_, sqlx::Error>>()
            .map_err(Error::from)
    }

    /// Retarget a message to another folder: delete-in-old plus
    /// insert-in-new inside one transaction, attachments carried over. The
    /// UID is kept until the destination folder's next sync corrects it; a
    /// key collision there means a sync already cached the moved message.
    pub async fn move_message(
        &self,
        user_id: Uuid,
        from_folder: &str,
        uid: u32,
        to_folder: &str,
    ) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        let old_id: Option<i64> = sqlx::query(
            "SELECT id FROM messages
             WHERE user_id = $1 AND imap_folder_name = $2 AND imap_uid = $3",
        )
        .bind(user_id)
        .bind(from_folder)
        .bind(uid as i64)
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| row.try_get("id"))
        .transpose()?;

        let Some(old_id) = old_id else {
            tx.rollback().await?;
            return Err(Error::NotFound);
        };

        let new_id: Option<i64> = sqlx::query(
            r#"
            INSERT INTO messages (
                thread_id, user_id, imap_uid, imap_folder_name, message_id_header,
                from_address, to_addresses, cc_addresses, sent_at, subject,
                unsafe_body_html, body_text, is_read, is_starred
            )
            SELECT thread_id, user_id, imap_uid, $1, message_id_header,
                   from_address, to_addresses, cc_addresses, sent_at, subject,
                   unsafe_body_html, body_text, is_read, is_starred
            FROM messages WHERE id = $2
            ON CONFLICT (user_id, imap_folder_name, imap_uid) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(to_folder)
        .bind(old_id)
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| row.try_get("id"))
        .transpose()?;

        if let Some(new_id) = new_id {
            sqlx::query("UPDATE attachments SET message_id = $1 WHERE message_id = $2")
                .bind(new_id)
                .bind(old_id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("DELETE FROM messages WHERE id = $1")
            .bind(old_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn mark_message_starred(&self, message_id: i64, starred: bool) -> Result<()> {
        sqlx::query("UPDATE messages SET is_starred = $1 WHERE id = $2")
            .bind(starred)
            .bind(message_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn update_message_flags(
        &self,
        user_id: Uuid,
        folder: &str,
        uid: u32,
        is_read: bool,
        is_starred: bool,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE messages SET is_read = $1, is_starred = $2
             WHERE user_id = $3 AND imap_folder_name = $4 AND imap_uid = $5",
        )
        .bind(is_read)
        .bind(is_starred)
        .bind(user_id)
        .bind(folder)
        .bind(uid as i64)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn update_message_body(
        &self,
        message_id: i64,
        unsafe_body_html: Option<&str>,
        body_text: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE messages SET unsafe_body_html = $1, body_text = $2 WHERE id = $3",
        )
        .bind(unsafe_body_html)
        .bind(body_text)
        .bind(message_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Replace the attachment metadata rows for a message.
    pub async fn replace_attachments(
        &self,
        message_id: i64,
        attachments: &[ParsedAttachment],
    ) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        sqlx::query("DELETE FROM attachments WHERE message_id = $1")
            .bind(message_id)
            .execute(&mut *tx)
            .await?;

        for att in attachments {
            sqlx::query(
                "INSERT INTO attachments (message_id, filename, mime_type, size_bytes, is_inline, content_id)
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(message_id)
            .bind(&att.filename)
            .bind(&att.mime_type)
            .bind(att.size_bytes)
            .bind(att.is_inline)
            .bind(&att.content_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn attachments_for_messages(
        &self,
        message_ids: &[i64],
    ) -> Result<Vec<Attachment>> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT * FROM attachments WHERE message_id = ANY($1) ORDER BY id",
        )
        .bind(message_ids)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .iter()
            .map(attachment_from_row)
            .collect::<std::result::Result<_, _>>()?)
    }

    /// A thread exists iff at least one message references it.
    pub async fn prune_empty_threads(&self, user_id: Uuid) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM threads t
             WHERE t.user_id = $1
               AND NOT EXISTS (SELECT 1 FROM messages m WHERE m.thread_id = t.id)",
        )
        .bind(user_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }
}
