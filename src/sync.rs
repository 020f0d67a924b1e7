// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Folder reconciliation between the IMAP server and the cache.
//!
//! `sync_folder` picks the incremental path (UID delta above the stored
//! cursor) when a cursor exists, and the full path (server THREAD forest)
//! otherwise. Incremental threading attaches by `Message-ID` and may
//! misattribute a reply assembled from partial data; the next full sync is
//! the repair. Forward progress beats completeness: one bad message is
//! logged and skipped, never the batch.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::crypto::CredentialCipher;
use crate::error::{Error, Result};
use crate::imap::error::ImapError;
use crate::imap::session::{ImapEndpoint, MailSession};
use crate::imap::types::{forest_uids, MessageMeta, ThreadNode};
use crate::mime;
use crate::pool::ConnectionPool;
use crate::store::{CachedMessage, NewMessage, Store, UserSettings};

const FETCH_BATCH_SIZE: usize = 100;

/// Which reconciliation strategy a sync ended up using.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Incremental,
    FullThreaded,
    FullFlat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub mode: SyncMode,
    pub ingested: usize,
}

pub struct SyncEngine {
    store: Store,
    pool: Arc<ConnectionPool>,
    cipher: Arc<CredentialCipher>,
    cache_ttl: Duration,
    count_refresh_timeout: Duration,
}

impl SyncEngine {
    pub fn new(
        store: Store,
        pool: Arc<ConnectionPool>,
        cipher: Arc<CredentialCipher>,
        cache_ttl: Duration,
        count_refresh_timeout: Duration,
    ) -> Self {
        Self {
            store,
            pool,
            cipher,
            cache_ttl,
            count_refresh_timeout,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Decrypt the stored IMAP credentials into a transient endpoint.
    pub fn imap_endpoint(&self, settings: &UserSettings) -> Result<ImapEndpoint> {
        let password = self.cipher.decrypt(&settings.encrypted_imap_password)?;
        Ok(ImapEndpoint {
            host: settings.imap_host.clone(),
            port: settings.imap_port,
            username: settings.mail_username.clone(),
            password,
        })
    }

    async fn settings_for(&self, user_id: Uuid) -> Result<UserSettings> {
        self.store.settings(user_id).await?.ok_or(Error::NotFound)
    }

    /// True when the folder has never synced or its cache is stale.
    pub async fn should_sync(&self, user_id: Uuid, folder: &str) -> Result<bool> {
        match self.store.folder_sync_info(user_id, folder).await? {
            None => Ok(true),
            Some(info) => {
                let age = Utc::now().signed_duration_since(info.synced_at);
                Ok(age.num_seconds() >= self.cache_ttl.as_secs() as i64)
            }
        }
    }

    /// Reconcile one folder. Partial per-message progress is kept on error;
    /// the cursor only advances after every fetched UID has been committed.
    pub async fn sync_folder(
        &self,
        user_id: Uuid,
        folder: &str,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome> {
        let settings = self.settings_for(user_id).await?;
        let endpoint = self.imap_endpoint(&settings)?;
        let guard = self.pool.acquire_worker(user_id, &endpoint).await?;
        let session = guard.session();

        cancellable(cancel, async { Ok(session.select(folder).await?) }).await?;

        let info = self.store.folder_sync_info(user_id, folder).await?;
        let last_synced_uid = info.and_then(|i| i.last_synced_uid).unwrap_or(0);

        let outcome = if last_synced_uid > 0 {
            self.run_incremental(session, user_id, folder, last_synced_uid as u32, cancel)
                .await?
        } else {
            self.run_full(session, user_id, folder, cancel).await?
        };

        self.spawn_thread_count_refresh(user_id, folder);

        info!(
            "synced {}/{} via {:?}: {} messages ingested",
            user_id, folder, outcome.mode, outcome.ingested
        );
        Ok(outcome)
    }

    /// Ingest UIDs strictly above the cursor. The client library has no
    /// native range search, so this is a full UID SEARCH filtered locally;
    /// UID lists are small.
    async fn run_incremental(
        &self,
        session: &dyn MailSession,
        user_id: Uuid,
        folder: &str,
        last_synced_uid: u32,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome> {
        let all_uids =
            match cancellable(cancel, async { Ok(session.uid_search("ALL").await?) }).await {
                Ok(uids) => uids,
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    // Incremental search failed; the full path is the repair.
                    warn!(
                        "incremental search failed for {}/{} ({}); running full sync",
                        user_id, folder, e
                    );
                    return self.run_full(session, user_id, folder, cancel).await;
                }
            };

        let fresh = uids_above(&all_uids, last_synced_uid);
        if fresh.is_empty() {
            self.store.record_sync(user_id, folder, None).await?;
            return Ok(SyncOutcome {
                mode: SyncMode::Incremental,
                ingested: 0,
            });
        }

        debug!(
            "{} new UIDs above cursor {} in {}/{}",
            fresh.len(),
            last_synced_uid,
            user_id,
            folder
        );

        let mut ingested = 0;
        let mut max_uid = last_synced_uid;
        for chunk in fresh.chunks(FETCH_BATCH_SIZE) {
            let metas =
                cancellable(cancel, async { Ok(session.fetch_meta(chunk).await?) }).await?;
            for meta in &metas {
                match self.integrate_by_message_id(user_id, folder, meta).await {
                    Ok(()) => {
                        ingested += 1;
                        max_uid = max_uid.max(meta.uid);
                    }
                    Err(e) => warn!("skipping UID {} in {}: {}", meta.uid, folder, e),
                }
            }
        }

        self.store.record_sync(user_id, folder, Some(max_uid)).await?;
        Ok(SyncOutcome {
            mode: SyncMode::Incremental,
            ingested,
        })
    }

    /// First sync (or incremental repair): rebuild threading for the whole
    /// folder from the server-computed THREAD forest, falling back to a flat
    /// list when THREAD cannot be used.
    async fn run_full(
        &self,
        session: &dyn MailSession,
        user_id: Uuid,
        folder: &str,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome> {
        let forest = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = session.thread_references() => result,
        };

        match forest {
            Ok(forest) => {
                let ingested = self
                    .ingest_forest(session, user_id, folder, &forest, cancel)
                    .await?;
                let max_uid = forest_uids(&forest).into_iter().max();
                self.store.record_sync(user_id, folder, max_uid).await?;
                Ok(SyncOutcome {
                    mode: SyncMode::FullThreaded,
                    ingested,
                })
            }
            Err(ImapError::ThreadUnsupported) => {
                debug!(
                    "THREAD unavailable for {}/{}; treating folder as flat",
                    user_id, folder
                );
                self.run_full_flat(session, user_id, folder, cancel).await
            }
            Err(other) => Err(other.into()),
        }
    }

    async fn run_full_flat(
        &self,
        session: &dyn MailSession,
        user_id: Uuid,
        folder: &str,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome> {
        let uids = cancellable(cancel, async { Ok(session.uid_search("ALL").await?) }).await?;
        if uids.is_empty() {
            // Empty folder: stamp the sync, leave the cursor untouched.
            self.store.record_sync(user_id, folder, None).await?;
            return Ok(SyncOutcome {
                mode: SyncMode::FullFlat,
                ingested: 0,
            });
        }

        let mut ingested = 0;
        let mut max_uid = 0u32;
        for chunk in uids.chunks(FETCH_BATCH_SIZE) {
            let metas =
                cancellable(cancel, async { Ok(session.fetch_meta(chunk).await?) }).await?;
            for meta in &metas {
                match self.integrate_by_message_id(user_id, folder, meta).await {
                    Ok(()) => {
                        ingested += 1;
                        max_uid = max_uid.max(meta.uid);
                    }
                    Err(e) => warn!("skipping UID {} in {}: {}", meta.uid, folder, e),
                }
            }
        }

        self.store
            .record_sync(user_id, folder, (max_uid > 0).then_some(max_uid))
            .await?;
        Ok(SyncOutcome {
            mode: SyncMode::FullFlat,
            ingested,
        })
    }

    async fn ingest_forest(
        &self,
        session: &dyn MailSession,
        user_id: Uuid,
        folder: &str,
        forest: &[ThreadNode],
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let all_uids = forest_uids(forest);

        let mut metas: HashMap<u32, MessageMeta> = HashMap::with_capacity(all_uids.len());
        for chunk in all_uids.chunks(FETCH_BATCH_SIZE) {
            let batch =
                cancellable(cancel, async { Ok(session.fetch_meta(chunk).await?) }).await?;
            for meta in batch {
                metas.insert(meta.uid, meta);
            }
        }

        let mut ingested = 0;
        for (root_uid, members) in flatten_forest(forest) {
            let Some(root_meta) = metas.get(&root_uid) else {
                warn!("thread root UID {} missing from fetch; skipping thread", root_uid);
                continue;
            };
            let stable_id = stable_id_for(root_meta, folder);
            let root_subject = root_meta.subject.clone().unwrap_or_default();

            let thread = self
                .store
                .upsert_thread(user_id, &stable_id, &root_subject)
                .await?;

            for member_uid in members {
                let Some(meta) = metas.get(&member_uid) else {
                    debug!("UID {} in forest but not fetched; skipping", member_uid);
                    continue;
                };
                match self
                    .store
                    .upsert_message(&new_message(user_id, thread.id, folder, meta))
                    .await
                {
                    Ok(_) => ingested += 1,
                    Err(e) => warn!("skipping UID {} in {}: {}", member_uid, folder, e),
                }
            }
        }
        Ok(ingested)
    }

    /// Incremental-style threading from partial data: an existing thread
    /// with this `Message-ID` wins, then the thread of a cached message
    /// carrying it, then a brand-new thread rooted at this message.
    async fn integrate_by_message_id(
        &self,
        user_id: Uuid,
        folder: &str,
        meta: &MessageMeta,
    ) -> Result<()> {
        let stable_id = stable_id_for(meta, folder);
        let subject = meta.subject.clone().unwrap_or_default();

        let thread_id = if let Some(thread) =
            self.store.thread_by_stable_id(user_id, &stable_id).await?
        {
            thread.id
        } else if let Some(existing) = self
            .store
            .message_by_message_id_header(user_id, &stable_id)
            .await?
        {
            existing.thread_id
        } else {
            self.store
                .attach_thread(user_id, &stable_id, &subject)
                .await?
                .id
        };

        self.store
            .upsert_message(&new_message(user_id, thread_id, folder, meta))
            .await?;
        Ok(())
    }

    /// Two-step body fetch: envelope + structure first, then the full body
    /// section, parsed off-server and cached with its attachments.
    pub async fn fetch_body(
        &self,
        user_id: Uuid,
        folder: &str,
        uid: u32,
    ) -> Result<CachedMessage> {
        let settings = self.settings_for(user_id).await?;
        let endpoint = self.imap_endpoint(&settings)?;
        let guard = self.pool.acquire_worker(user_id, &endpoint).await?;
        let session = guard.session();

        session.select(folder).await?;

        let meta = session.fetch_structure(uid).await?;
        if self.store.message_by_uid(user_id, folder, uid).await?.is_none() {
            self.integrate_by_message_id(user_id, folder, &meta).await?;
        }

        let raw = session.fetch_body_section(uid).await?;
        let parsed = mime::parse(&raw)?;

        let message = self
            .store
            .message_by_uid(user_id, folder, uid)
            .await?
            .ok_or(Error::NotFound)?;

        self.store
            .update_message_body(
                message.id,
                parsed.html.as_deref(),
                parsed.text.as_deref(),
            )
            .await?;
        self.store
            .replace_attachments(message.id, &parsed.attachments)
            .await?;

        self.store
            .message_by_uid(user_id, folder, uid)
            .await?
            .ok_or(Error::NotFound)
    }

    /// Lightweight FLAGS-only pass realigning read/star state for every
    /// cached message of the folder.
    pub async fn resync_flags(&self, user_id: Uuid, folder: &str) -> Result<usize> {
        let settings = self.settings_for(user_id).await?;
        let endpoint = self.imap_endpoint(&settings)?;
        let guard = self.pool.acquire_worker(user_id, &endpoint).await?;
        let session = guard.session();

        session.select(folder).await?;

        let cached = sqlx::query_scalar::<_, i64>(
            "SELECT imap_uid FROM messages WHERE user_id = $1 AND imap_folder_name = $2",
        )
        .bind(user_id)
        .bind(folder)
        .fetch_all(self.store.pool())
        .await
        .map_err(Error::from)?;

        let cached: Vec<u32> = cached.into_iter().map(|u| u as u32).collect();
        if cached.is_empty() {
            return Ok(0);
        }

        let mut updated = 0;
        for chunk in cached.chunks(500) {
            let flags = session.fetch_flags(chunk).await?;
            for (uid, flags) in flags {
                let is_read = flags.iter().any(|f| f == "Seen");
                let is_starred = flags.iter().any(|f| f == "Flagged");
                match self
                    .store
                    .update_message_flags(user_id, folder, uid, is_read, is_starred)
                    .await
                {
                    Ok(()) => updated += 1,
                    Err(e) => warn!("flag update failed for UID {}: {}", uid, e),
                }
            }
        }

        info!("flag resync updated {} messages in {}/{}", updated, user_id, folder);
        Ok(updated)
    }

    /// Materialized-count refresh is off the sync's critical path: bounded
    /// by a deadline, failures logged and swallowed.
    fn spawn_thread_count_refresh(&self, user_id: Uuid, folder: &str) {
        let store = self.store.clone();
        let folder = folder.to_string();
        let deadline = self.count_refresh_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(deadline, store.refresh_thread_count(user_id, &folder))
                .await
            {
                Ok(Ok(count)) => debug!("thread count for {}/{} is {}", user_id, folder, count),
                Ok(Err(e)) => warn!("thread count refresh failed for {}: {}", folder, e),
                Err(_) => warn!("thread count refresh for {} exceeded {:?}", folder, deadline),
            }
        });
    }
}

/// Race a future against the caller's cancellation handle.
async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}

/// UIDs strictly greater than the cursor, ascending.
fn uids_above(all: &[u32], cursor: u32) -> Vec<u32> {
    let mut fresh: Vec<u32> = all.iter().copied().filter(|&u| u > cursor).collect();
    fresh.sort_unstable();
    fresh
}

/// Flatten the THREAD forest: each top-level node becomes
/// `(root_uid, members)` with every descendant mapped to that root.
fn flatten_forest(forest: &[ThreadNode]) -> Vec<(u32, Vec<u32>)> {
    forest
        .iter()
        .map(|root| (root.uid, root.descendants()))
        .collect()
}

/// The thread identity of a message: its `Message-ID` header. Messages
/// without one get a deterministic per-location placeholder so re-syncs stay
/// idempotent.
fn stable_id_for(meta: &MessageMeta, folder: &str) -> String {
    match meta.message_id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => format!("<missing-id-{}-{}>", folder, meta.uid),
    }
}

fn new_message(user_id: Uuid, thread_id: i64, folder: &str, meta: &MessageMeta) -> NewMessage {
    NewMessage {
        user_id,
        thread_id,
        imap_uid: meta.uid,
        imap_folder_name: folder.to_string(),
        message_id_header: stable_id_for(meta, folder),
        from_address: meta
            .from
            .first()
            .map(|a| a.email())
            .unwrap_or_default(),
        to_addresses: meta.to.iter().map(|a| a.email()).collect(),
        cc_addresses: meta.cc.iter().map(|a| a.email()).collect(),
        sent_at: meta.sent_at,
        subject: meta.subject.clone().unwrap_or_default(),
        is_read: meta.is_read(),
        is_starred: meta.is_starred(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imap::types::Address;

    fn meta(uid: u32, message_id: Option<&str>) -> MessageMeta {
        MessageMeta {
            uid,
            message_id: message_id.map(|s| s.to_string()),
            subject: Some("hello".to_string()),
            from: vec![Address {
                name: None,
                mailbox: Some("alice".to_string()),
                host: Some("example.com".to_string()),
            }],
            to: vec![],
            cc: vec![],
            in_reply_to: None,
            sent_at: None,
            internal_date: None,
            flags: vec!["Seen".to_string()],
        }
    }

    #[test]
    fn uids_above_filters_and_sorts() {
        assert_eq!(uids_above(&[3, 11, 7, 10, 1], 7), vec![10, 11]);
        assert!(uids_above(&[1, 2, 3], 3).is_empty());
    }

    #[test]
    fn flatten_forest_maps_descendants_to_root() {
        let forest = vec![
            ThreadNode::leaf(2),
            ThreadNode {
                uid: 3,
                children: vec![
                    ThreadNode::leaf(6),
                    ThreadNode {
                        uid: 4,
                        children: vec![ThreadNode::leaf(23)],
                    },
                ],
            },
        ];

        let flat = flatten_forest(&forest);
        assert_eq!(flat.len(), 2);
        assert_eq!(flat[0], (2, vec![2]));
        assert_eq!(flat[1], (3, vec![3, 6, 4, 23]));
    }

    #[test]
    fn stable_id_prefers_message_id() {
        assert_eq!(stable_id_for(&meta(5, Some("<a@x>")), "INBOX"), "<a@x>");
    }

    #[test]
    fn stable_id_placeholder_is_deterministic() {
        let a = stable_id_for(&meta(5, None), "INBOX");
        let b = stable_id_for(&meta(5, None), "INBOX");
        assert_eq!(a, b);
        assert_ne!(a, stable_id_for(&meta(6, None), "INBOX"));
        assert_ne!(a, stable_id_for(&meta(5, None), "Archive"));
    }

    #[test]
    fn stable_id_ignores_blank_header() {
        let id = stable_id_for(&meta(9, Some("   ")), "INBOX");
        assert!(id.starts_with("<missing-id-"));
    }

    #[tokio::test]
    async fn forest_from_the_session_seam_flattens() {
        use crate::imap::session::MockMailSession;

        let mut session = MockMailSession::new();
        session.expect_thread_references().returning(|| {
            Ok(vec![
                ThreadNode::leaf(2),
                ThreadNode {
                    uid: 3,
                    children: vec![ThreadNode::leaf(6)],
                },
            ])
        });

        let forest = session.thread_references().await.unwrap();
        assert_eq!(flatten_forest(&forest), vec![(2, vec![2]), (3, vec![3, 6])]);
    }

    #[test]
    fn new_message_maps_flags_and_addresses() {
        let m = meta(7, Some("<a@x>"));
        let row = new_message(Uuid::new_v4(), 1, "INBOX", &m);
        assert_eq!(row.imap_uid, 7);
        assert_eq!(row.from_address, "alice@example.com");
        assert!(row.is_read);
        assert!(!row.is_starred);
        assert_eq!(row.message_id_header, "<a@x>");
    }
}
