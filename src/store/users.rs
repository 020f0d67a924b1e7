// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use super::Store;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

/// Per-user mail configuration. Passwords are opaque ciphertext; decryption
/// happens at the call sites that actually dial out.
#[derive(Debug, Clone)]
pub struct UserSettings {
    pub user_id: Uuid,
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub mail_username: String,
    pub encrypted_imap_password: Vec<u8>,
    pub encrypted_smtp_password: Vec<u8>,
    pub archive_folder: String,
    pub sent_folder: String,
    pub drafts_folder: String,
    pub trash_folder: String,
    pub spam_folder: String,
    pub undo_send_delay_seconds: u32,
    pub pagination_threads_per_page: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Settings as accepted from the outer layer, with passwords already
/// encrypted by the caller.
#[derive(Debug, Clone)]
pub struct NewSettings {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub mail_username: String,
    pub encrypted_imap_password: Vec<u8>,
    pub encrypted_smtp_password: Vec<u8>,
    pub archive_folder: String,
    pub sent_folder: String,
    pub drafts_folder: String,
    pub trash_folder: String,
    pub spam_folder: String,
    pub undo_send_delay_seconds: u32,
    pub pagination_threads_per_page: u32,
}

fn user_from_row(row: &PgRow) -> std::result::Result<User, sqlx::Error> {
    Ok(User {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        created_at: row.try_get("created_at")?,
    })
}

fn settings_from_row(row: &PgRow) -> std::result::Result<UserSettings, sqlx::Error> {
    Ok(UserSettings {
        user_id: row.try_get("user_id")?,
        imap_host: row.try_get("imap_host")?,
        imap_port: row.try_get::<i32, _>("imap_port")? as u16,
        smtp_host: row.try_get("smtp_host")?,
        smtp_port: row.try_get::<i32, _>("smtp_port")? as u16,
        mail_username: row.try_get("mail_username")?,
        encrypted_imap_password: row.try_get("encrypted_imap_password")?,
        encrypted_smtp_password: row.try_get("encrypted_smtp_password")?,
        archive_folder: row.try_get("archive_folder")?,
        sent_folder: row.try_get("sent_folder")?,
        drafts_folder: row.try_get("drafts_folder")?,
        trash_folder: row.try_get("trash_folder")?,
        spam_folder: row.try_get("spam_folder")?,
        undo_send_delay_seconds: row.try_get::<i32, _>("undo_send_delay_seconds")? as u32,
        pagination_threads_per_page: row.try_get::<i32, _>("pagination_threads_per_page")? as u32,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl Store {
    /// Get-or-create by email (case-folded unique). Users come into being on
    /// their first authenticated request and are never deleted here.
    pub async fn upsert_user(&self, email: &str) -> Result<User> {
        let row = sqlx::query(
            r#"
            INSERT INTO users (email) VALUES ($1)
            ON CONFLICT ((LOWER(email))) DO UPDATE SET email = users.email
            RETURNING id, email, created_at
            "#,
        )
        .bind(email)
        .fetch_one(self.pool())
        .await?;

        Ok(user_from_row(&row)?)
    }

    pub async fn user_by_email(&self, email: &str) -> Result<Option<User>> {
        let row = sqlx::query(
            "SELECT id, email, created_at FROM users WHERE LOWER(email) = LOWER($1)",
        )
        .bind(email)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.as_ref().map(user_from_row).transpose()?)
    }

    pub async fn user_by_id(&self, user_id: Uuid) -> Result<Option<User>> {
        let row = sqlx::query("SELECT id, email, created_at FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(self.pool())
            .await?;

        Ok(row.as_ref().map(user_from_row).transpose()?)
    }

    pub async fn settings(&self, user_id: Uuid) -> Result<Option<UserSettings>> {
        let row = sqlx::query("SELECT * FROM user_settings WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(self.pool())
            .await?;

        Ok(row.as_ref().map(settings_from_row).transpose()?)
    }

    pub async fn save_settings(&self, user_id: Uuid, settings: &NewSettings) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_settings (
                user_id, imap_host, imap_port, smtp_host, smtp_port,
                mail_username, encrypted_imap_password, encrypted_smtp_password,
                archive_folder, sent_folder, drafts_folder, trash_folder, spam_folder,
                undo_send_delay_seconds, pagination_threads_per_page
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (user_id) DO UPDATE SET
                imap_host = EXCLUDED.imap_host,
                imap_port = EXCLUDED.imap_port,
                smtp_host = EXCLUDED.smtp_host,
                smtp_port = EXCLUDED.smtp_port,
                mail_username = EXCLUDED.mail_username,
                encrypted_imap_password = EXCLUDED.encrypted_imap_password,
                encrypted_smtp_password = EXCLUDED.encrypted_smtp_password,
                archive_folder = EXCLUDED.archive_folder,
                sent_folder = EXCLUDED.sent_folder,
                drafts_folder = EXCLUDED.drafts_folder,
                trash_folder = EXCLUDED.trash_folder,
                spam_folder = EXCLUDED.spam_folder,
                undo_send_delay_seconds = EXCLUDED.undo_send_delay_seconds,
                pagination_threads_per_page = EXCLUDED.pagination_threads_per_page,
                updated_at = now()
            "#,
        )
        .bind(user_id)
        .bind(&settings.imap_host)
        .bind(settings.imap_port as i32)
        .bind(&settings.smtp_host)
        .bind(settings.smtp_port as i32)
        .bind(&settings.mail_username)
        .bind(&settings.encrypted_imap_password)
        .bind(&settings.encrypted_smtp_password)
        .bind(&settings.archive_folder)
        .bind(&settings.sent_folder)
        .bind(&settings.drafts_folder)
        .bind(&settings.trash_folder)
        .bind(&settings.spam_folder)
        .bind(settings.undo_send_delay_seconds as i32)
        .bind(settings.pagination_threads_per_page as i32)
        .execute(self.pool())
        .await?;

        Ok(())
    }
}
