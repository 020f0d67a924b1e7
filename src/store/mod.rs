// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The relational cache: single source of truth for everything except raw
//! message bodies, which also live on the IMAP server.
//!
//! `Store` is a passive value over a `PgPool`; the engine, worker, and
//! service layers each hold a handle. Writes are idempotent upserts keyed by
//! natural keys; a unique violation on an upsert path means a concurrent
//! upsert won and is absorbed.

mod drafts;
mod messages;
mod queue;
mod sync_info;
mod users;

pub use drafts::{Draft, NewDraft};
pub use messages::{Attachment, CachedMessage, NewMessage, Thread, ThreadSummary};
pub use queue::{ActionJob, ActionType};
pub use sync_info::FolderSyncInfo;
pub use users::{NewSettings, User, UserSettings};

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::error::Result;

#[derive(Clone, Debug)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and bring the schema up to date.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| crate::error::Error::StorageFailed(e.to_string()))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
