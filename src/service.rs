// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The service facade the outer HTTP/WebSocket layer calls.
//!
//! Everything here reads from the cache and defers mutations to the durable
//! action queue; the only synchronous IMAP traffic is folder listing, search
//! execution, and lazy body fetches.

use std::cmp::Reverse;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::actions::validate_payload;
use crate::crypto::CredentialCipher;
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::idle::IdleSupervisor;
use crate::imap::session::MailSession;
use crate::pool::ConnectionPool;
use crate::query::parse_query;
use crate::store::{ActionType, Attachment, CachedMessage, NewSettings, Store, UserSettings};
use crate::sync::SyncEngine;

const INBOX: &str = "INBOX";

#[derive(Debug, Clone, Serialize)]
pub struct AuthStatus {
    #[serde(rename = "isAuthenticated")]
    pub is_authenticated: bool,
    #[serde(rename = "isSetupComplete")]
    pub is_setup_complete: bool,
}

/// Folder role for client-side iconography and routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FolderRole {
    Inbox,
    Sent,
    Drafts,
    Spam,
    Trash,
    Archive,
    Other,
}

#[derive(Debug, Clone, Serialize)]
pub struct FolderEntry {
    pub name: String,
    pub role: FolderRole,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ThreadView {
    pub stable_thread_id: String,
    pub subject: String,
    pub newest_sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Pagination {
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadPage {
    pub threads: Vec<ThreadView>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadDetail {
    pub messages: Vec<CachedMessage>,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchPage {
    pub threads: Vec<ThreadView>,
    pub total: usize,
}

/// Settings as posted by the settings form; passwords arrive in plaintext
/// over the authenticated channel and are encrypted before they rest.
#[derive(Debug, Clone, Deserialize)]
pub struct SettingsInput {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub mail_username: String,
    pub imap_password: String,
    pub smtp_password: String,
    pub archive_folder: String,
    pub sent_folder: String,
    pub drafts_folder: String,
    pub trash_folder: String,
    pub spam_folder: String,
    pub undo_send_delay_seconds: u32,
    pub pagination_threads_per_page: u32,
}

/// Settings as returned to the client: everything but secrets.
#[derive(Debug, Clone, Serialize)]
pub struct SettingsView {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub mail_username: String,
    pub archive_folder: String,
    pub sent_folder: String,
    pub drafts_folder: String,
    pub trash_folder: String,
    pub spam_folder: String,
    pub undo_send_delay_seconds: u32,
    pub pagination_threads_per_page: u32,
}

impl From<&UserSettings> for SettingsView {
    fn from(s: &UserSettings) -> Self {
        Self {
            imap_host: s.imap_host.clone(),
            imap_port: s.imap_port,
            smtp_host: s.smtp_host.clone(),
            smtp_port: s.smtp_port,
            mail_username: s.mail_username.clone(),
            archive_folder: s.archive_folder.clone(),
            sent_folder: s.sent_folder.clone(),
            drafts_folder: s.drafts_folder.clone(),
            trash_folder: s.trash_folder.clone(),
            spam_folder: s.spam_folder.clone(),
            undo_send_delay_seconds: s.undo_send_delay_seconds,
            pagination_threads_per_page: s.pagination_threads_per_page,
        }
    }
}

/// A registered WebSocket: the receiving end plus the handle for
/// unregistration.
pub struct ClientSubscription {
    pub client_id: Uuid,
    pub receiver: mpsc::UnboundedReceiver<String>,
}

pub struct Mailroom {
    store: Store,
    pool: Arc<ConnectionPool>,
    engine: Arc<SyncEngine>,
    bus: Arc<EventBus>,
    cipher: Arc<CredentialCipher>,
    idle: Arc<IdleSupervisor>,
    default_undo_delay_seconds: u32,
}

impl Mailroom {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        pool: Arc<ConnectionPool>,
        engine: Arc<SyncEngine>,
        bus: Arc<EventBus>,
        cipher: Arc<CredentialCipher>,
        idle: Arc<IdleSupervisor>,
        default_undo_delay_seconds: u32,
    ) -> Self {
        Self {
            store,
            pool,
            engine,
            bus,
            cipher,
            idle,
            default_undo_delay_seconds,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Resolve the identity asserted by the outer auth layer, creating the
    /// user on first contact.
    pub async fn user_for_email(&self, email: &str) -> Result<Uuid> {
        Ok(self.store.upsert_user(email).await?.id)
    }

    pub async fn auth_status(&self, user_id: Uuid) -> Result<AuthStatus> {
        let settings = self.store.settings(user_id).await?;
        Ok(AuthStatus {
            is_authenticated: true,
            is_setup_complete: settings.is_some(),
        })
    }

    pub async fn get_settings(&self, user_id: Uuid) -> Result<Option<SettingsView>> {
        Ok(self
            .store
            .settings(user_id)
            .await?
            .as_ref()
            .map(SettingsView::from))
    }

    /// Encrypt-and-store; every pooled session for the user is invalidated
    /// because it may hold stale credentials.
    pub async fn save_settings(&self, user_id: Uuid, input: SettingsInput) -> Result<()> {
        if input.imap_host.is_empty() || input.smtp_host.is_empty() {
            return Err(Error::InvalidInput("mail server hosts are required".to_string()));
        }

        let settings = NewSettings {
            imap_host: input.imap_host,
            imap_port: input.imap_port,
            smtp_host: input.smtp_host,
            smtp_port: input.smtp_port,
            mail_username: input.mail_username,
            encrypted_imap_password: self.cipher.encrypt(&input.imap_password)?,
            encrypted_smtp_password: self.cipher.encrypt(&input.smtp_password)?,
            archive_folder: input.archive_folder,
            sent_folder: input.sent_folder,
            drafts_folder: input.drafts_folder,
            trash_folder: input.trash_folder,
            spam_folder: input.spam_folder,
            undo_send_delay_seconds: input.undo_send_delay_seconds,
            pagination_threads_per_page: input.pagination_threads_per_page,
        };

        self.store.save_settings(user_id, &settings).await?;
        self.pool.invalidate(user_id).await;
        Ok(())
    }

    async fn settings_for(&self, user_id: Uuid) -> Result<UserSettings> {
        self.store.settings(user_id).await?.ok_or(Error::NotFound)
    }

    /// Enumerate selectable folders with their roles. INBOX is matched
    /// case-insensitively; the special roles come from the user's settings.
    pub async fn list_folders(&self, user_id: Uuid) -> Result<Vec<FolderEntry>> {
        let settings = self.settings_for(user_id).await?;
        let endpoint = self.engine.imap_endpoint(&settings)?;
        let guard = self.pool.acquire_worker(user_id, &endpoint).await?;

        let folders = guard.session().list_folders().await?;
        Ok(folders
            .into_iter()
            .filter(|f| f.selectable)
            .map(|f| {
                let role = folder_role(&f.name, &settings);
                FolderEntry { name: f.name, role }
            })
            .collect())
    }

    /// Paginated thread listing served from the cache, refreshing the folder
    /// first when it is stale. Sync failures other than bad credentials are
    /// logged and the (possibly stale) cache is served.
    pub async fn list_threads(
        &self,
        user_id: Uuid,
        folder: &str,
        limit: i64,
        offset: i64,
    ) -> Result<ThreadPage> {
        if limit <= 0 || offset < 0 {
            return Err(Error::InvalidInput("bad pagination bounds".to_string()));
        }

        if self.engine.should_sync(user_id, folder).await? {
            let cancel = CancellationToken::new();
            match self.engine.sync_folder(user_id, folder, &cancel).await {
                Ok(_) => {}
                Err(e @ Error::AuthFailed(_)) => return Err(e),
                Err(e) => warn!("pre-read sync of {} failed, serving cache: {}", folder, e),
            }
        }

        let summaries = self.store.list_threads(user_id, folder, limit, offset).await?;
        let total = self.store.thread_count(user_id, folder).await?;

        Ok(ThreadPage {
            threads: summaries
                .into_iter()
                .map(|s| ThreadView {
                    stable_thread_id: s.thread.stable_thread_id,
                    subject: s.thread.subject,
                    newest_sent_at: s.newest_sent_at,
                })
                .collect(),
            pagination: Pagination {
                total,
                page: offset / limit + 1,
                per_page: limit,
            },
        })
    }

    /// Full conversation; bodies that have never been fetched are pulled
    /// lazily, one failure never hiding the rest of the thread.
    pub async fn get_thread(&self, user_id: Uuid, stable_thread_id: &str) -> Result<ThreadDetail> {
        let mut messages = self
            .store
            .messages_in_thread(user_id, stable_thread_id)
            .await?;
        if messages.is_empty() {
            return Err(Error::NotFound);
        }

        for message in &mut messages {
            if !message.has_body() {
                match self
                    .engine
                    .fetch_body(user_id, &message.imap_folder_name, message.imap_uid)
                    .await
                {
                    Ok(updated) => *message = updated,
                    Err(e) => warn!(
                        "lazy body fetch failed for {}/{}: {}",
                        message.imap_folder_name, message.imap_uid, e
                    ),
                }
            }
        }

        let ids: Vec<i64> = messages.iter().map(|m| m.id).collect();
        let attachments = self.store.attachments_for_messages(&ids).await?;

        Ok(ThreadDetail {
            messages,
            attachments,
        })
    }

    /// Execute a search on the IMAP server and resolve hits against the
    /// cache, deduplicating threads and paginating in memory.
    pub async fn search(
        &self,
        user_id: Uuid,
        query: &str,
        page: usize,
        limit: usize,
    ) -> Result<SearchPage> {
        if limit == 0 {
            return Err(Error::InvalidInput("limit must be positive".to_string()));
        }
        let parsed = parse_query(query)?;
        let folder = parsed.folder.as_deref().unwrap_or(INBOX);

        let settings = self.settings_for(user_id).await?;
        let endpoint = self.engine.imap_endpoint(&settings)?;
        let guard = self.pool.acquire_worker(user_id, &endpoint).await?;
        let session = guard.session();

        session.select(folder).await?;
        let uids = session
            .uid_search(&parsed.criteria.to_imap_string())
            .await?;
        if uids.is_empty() {
            return Ok(SearchPage {
                threads: Vec::new(),
                total: 0,
            });
        }

        let metas = session.fetch_meta(&uids).await?;

        // Resolve each hit to its cached thread; unknown messages simply
        // have not been synced yet and are skipped.
        let mut hits: Vec<(ThreadView, Option<DateTime<Utc>>)> = Vec::new();
        for meta in &metas {
            let Some(message_id) = meta.message_id.as_deref() else {
                continue;
            };
            let Some(cached) = self
                .store
                .message_by_message_id_header(user_id, message_id)
                .await?
            else {
                continue;
            };
            let Some(thread) = self.store.thread_by_id(user_id, cached.thread_id).await? else {
                continue;
            };
            hits.push((
                ThreadView {
                    stable_thread_id: thread.stable_thread_id,
                    subject: thread.subject,
                    newest_sent_at: meta.sent_at,
                },
                meta.sent_at,
            ));
        }

        let ranked = rank_thread_hits(hits);
        let total = ranked.len();
        let threads = paginate(ranked, page, limit);

        Ok(SearchPage { threads, total })
    }

    /// Validate and enqueue a user intent. `send_email` gets the user's
    /// undo window as its dispatch delay; everything else runs immediately.
    pub async fn enqueue_action(
        &self,
        user_id: Uuid,
        action_type: &str,
        payload: serde_json::Value,
    ) -> Result<i64> {
        let action_type = ActionType::parse(action_type)
            .ok_or_else(|| Error::InvalidInput(format!("unknown action type: {}", action_type)))?;
        validate_payload(action_type, &payload)?;

        let delay_seconds = match action_type {
            ActionType::SendEmail => match self.store.settings(user_id).await? {
                Some(settings) => settings.undo_send_delay_seconds,
                None => self.default_undo_delay_seconds,
            },
            _ => 0,
        };

        let process_at = Utc::now() + ChronoDuration::seconds(delay_seconds as i64);
        self.store
            .enqueue_action(user_id, action_type, &payload, process_at)
            .await
    }

    /// Undo. `Ok(false)` means the window already closed; ownership
    /// mismatches surface as `Conflict` (rendered 404 upstream).
    pub async fn cancel_action(&self, user_id: Uuid, job_id: i64) -> Result<bool> {
        self.store.cancel_action(user_id, job_id).await
    }

    /// Attach a WebSocket to the user's event stream and make sure an IDLE
    /// listener is running for them.
    pub async fn subscribe(&self, user_id: Uuid) -> ClientSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let client_id = self.bus.register(user_id, tx).await;
        self.idle.ensure_listener(user_id);
        ClientSubscription {
            client_id,
            receiver: rx,
        }
    }

    pub async fn unsubscribe(&self, user_id: Uuid, client_id: Uuid) {
        self.bus.unregister(user_id, client_id).await;
    }
}

fn folder_role(name: &str, settings: &UserSettings) -> FolderRole {
    if name.eq_ignore_ascii_case(INBOX) {
        FolderRole::Inbox
    } else if name == settings.sent_folder {
        FolderRole::Sent
    } else if name == settings.drafts_folder {
        FolderRole::Drafts
    } else if name == settings.spam_folder {
        FolderRole::Spam
    } else if name == settings.trash_folder {
        FolderRole::Trash
    } else if name == settings.archive_folder {
        FolderRole::Archive
    } else {
        FolderRole::Other
    }
}

/// Deduplicate by thread and order by the newest `sent_at` among the
/// thread's in-result messages, descending, nulls last.
fn rank_thread_hits(hits: Vec<(ThreadView, Option<DateTime<Utc>>)>) -> Vec<ThreadView> {
    use std::collections::HashMap;

    let mut best: HashMap<String, (ThreadView, Option<DateTime<Utc>>)> = HashMap::new();
    for (view, sent_at) in hits {
        match best.get_mut(&view.stable_thread_id) {
            Some((kept, kept_at)) => {
                if sent_at > *kept_at {
                    *kept_at = sent_at;
                    kept.newest_sent_at = sent_at;
                }
            }
            None => {
                let mut view = view;
                view.newest_sent_at = sent_at;
                best.insert(view.stable_thread_id.clone(), (view, sent_at));
            }
        }
    }

    let mut ranked: Vec<(ThreadView, Option<DateTime<Utc>>)> = best.into_values().collect();
    // `None` sorts before every `Some`, so wrapping in Reverse puts dated
    // threads first (newest leading) and undated ones last; ties break on
    // the stable id for determinism.
    ranked.sort_by(|a, b| {
        Reverse(a.1)
            .cmp(&Reverse(b.1))
            .then_with(|| a.0.stable_thread_id.cmp(&b.0.stable_thread_id))
    });
    ranked.into_iter().map(|(view, _)| view).collect()
}

fn paginate(threads: Vec<ThreadView>, page: usize, limit: usize) -> Vec<ThreadView> {
    let start = page.saturating_sub(1) * limit;
    threads.into_iter().skip(start).take(limit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn view(id: &str, at: Option<DateTime<Utc>>) -> (ThreadView, Option<DateTime<Utc>>) {
        (
            ThreadView {
                stable_thread_id: id.to_string(),
                subject: id.to_string(),
                newest_sent_at: at,
            },
            at,
        )
    }

    fn at(day: u32) -> Option<DateTime<Utc>> {
        Some(Utc.with_ymd_and_hms(2025, 3, day, 12, 0, 0).unwrap())
    }

    #[test]
    fn ranking_dedupes_and_orders_newest_first() {
        let ranked = rank_thread_hits(vec![
            view("<a@x>", at(1)),
            view("<b@x>", at(9)),
            view("<a@x>", at(5)),
            view("<c@x>", None),
        ]);

        let ids: Vec<&str> = ranked.iter().map(|t| t.stable_thread_id.as_str()).collect();
        assert_eq!(ids, vec!["<b@x>", "<a@x>", "<c@x>"]);
        // The dedup kept the newest date for <a@x>.
        assert_eq!(ranked[1].newest_sent_at, at(5));
    }

    #[test]
    fn nulls_sort_last() {
        let ranked = rank_thread_hits(vec![view("<a@x>", None), view("<b@x>", at(2))]);
        assert_eq!(ranked[0].stable_thread_id, "<b@x>");
        assert_eq!(ranked[1].stable_thread_id, "<a@x>");
    }

    fn settings() -> UserSettings {
        UserSettings {
            user_id: Uuid::new_v4(),
            imap_host: "imap.example.com".to_string(),
            imap_port: 993,
            smtp_host: "smtp.example.com".to_string(),
            smtp_port: 587,
            mail_username: "alice".to_string(),
            encrypted_imap_password: vec![1, 2, 3],
            encrypted_smtp_password: vec![4, 5, 6],
            archive_folder: "Archive".to_string(),
            sent_folder: "Sent".to_string(),
            drafts_folder: "Drafts".to_string(),
            trash_folder: "Trash".to_string(),
            spam_folder: "Junk".to_string(),
            undo_send_delay_seconds: 20,
            pagination_threads_per_page: 50,
            created_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            updated_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn folder_roles_resolve_from_settings() {
        let settings = settings();
        assert_eq!(folder_role("INBOX", &settings), FolderRole::Inbox);
        assert_eq!(folder_role("inbox", &settings), FolderRole::Inbox);
        assert_eq!(folder_role("Sent", &settings), FolderRole::Sent);
        assert_eq!(folder_role("Junk", &settings), FolderRole::Spam);
        assert_eq!(folder_role("Trash", &settings), FolderRole::Trash);
        assert_eq!(folder_role("Archive", &settings), FolderRole::Archive);
        assert_eq!(folder_role("Drafts", &settings), FolderRole::Drafts);
        assert_eq!(folder_role("Newsletters", &settings), FolderRole::Other);
    }

    #[test]
    fn settings_view_excludes_secrets() {
        let view = SettingsView::from(&settings());
        let rendered = serde_json::to_string(&view).unwrap();
        assert!(!rendered.contains("password"));
        assert_eq!(view.undo_send_delay_seconds, 20);
    }

    #[test]
    fn pagination_beyond_end_is_empty() {
        let ranked = rank_thread_hits(vec![view("<a@x>", at(1)), view("<b@x>", at(2))]);
        assert!(paginate(ranked, 5, 10).is_empty());
    }

    #[test]
    fn pagination_slices_pages() {
        let hits: Vec<_> = (1..=25)
            .map(|i| view(&format!("<t{}@x>", i), at((i % 28) as u32 + 1)))
            .collect();
        let ranked = rank_thread_hits(hits);

        let page1 = paginate(ranked.clone(), 1, 10);
        let page3 = paginate(ranked.clone(), 3, 10);
        assert_eq!(page1.len(), 10);
        assert_eq!(page3.len(), 5);
        assert_ne!(page1[0], page3[0]);
    }
}
