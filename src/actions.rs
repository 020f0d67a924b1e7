//! The durable action queue worker.
//!
//! User intents succeed instantly at enqueue time and are executed here,
//! asynchronously, with retry. Each poll tick claims due rows with
//! `FOR UPDATE SKIP LOCKED`, so several worker processes can coexist without
//! double-dispatch, then executes them and deletes a row only on total
//! success. A failed row keeps its place and its attempt count grows; user
//! intents are never dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::crypto::CredentialCipher;
use crate::error::{Error, Result};
use crate::imap::session::MailSession;
use crate::imap::types::FlagOperation;
use crate::pool::ConnectionPool;
use crate::smtp::{self, OutboundRequest, SmtpService};
use crate::store::{ActionJob, ActionType, Store, UserSettings};

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const CLAIM_BATCH: i64 = 16;

/// `star_thread` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StarThread {
    pub thread_stable_id: String,
    pub starred: bool,
}

/// `move_thread` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MoveThread {
    pub thread_stable_id: String,
    pub destination_folder: String,
}

/// `send_email` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SendEmail {
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub in_reply_to: Option<String>,
    #[serde(default)]
    pub draft_id: Option<i64>,
}

/// `sync_draft` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncDraft {
    pub draft_id: i64,
}

/// Validate a payload against its declared type before it is enqueued.
pub fn validate_payload(action_type: ActionType, payload: &serde_json::Value) -> Result<()> {
    let check = match action_type {
        ActionType::StarThread => serde_json::from_value::<StarThread>(payload.clone()).map(|_| ()),
        ActionType::MoveThread => serde_json::from_value::<MoveThread>(payload.clone()).map(|_| ()),
        ActionType::SendEmail => serde_json::from_value::<SendEmail>(payload.clone()).map(|_| ()),
        ActionType::SyncDraft => serde_json::from_value::<SyncDraft>(payload.clone()).map(|_| ()),
    };
    check.map_err(|e| Error::InvalidInput(format!("bad {} payload: {}", action_type.as_str(), e)))
}

pub struct ActionWorker {
    store: Store,
    pool: Arc<ConnectionPool>,
    cipher: Arc<CredentialCipher>,
    smtp: Arc<SmtpService>,
    shutdown: CancellationToken,
}

impl ActionWorker {
    pub fn new(
        store: Store,
        pool: Arc<ConnectionPool>,
        cipher: Arc<CredentialCipher>,
        smtp: Arc<SmtpService>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            pool,
            cipher,
            smtp,
            shutdown,
        }
    }

    /// Poll loop. Runs until the process token is cancelled.
    pub async fn run(self) {
        info!("action worker started");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }

            if let Err(e) = self.tick().await {
                error!("action worker tick failed: {}", e);
            }
        }
        info!("action worker stopped");
    }

    /// One tick: claim due jobs, run them, keep failures for the next poll.
    /// The claiming transaction stays open across job execution so the row
    /// locks shield the batch from sibling workers.
    pub async fn tick(&self) -> Result<usize> {
        let mut tx = self.store.pool().begin().await?;
        let jobs = self
            .store
            .claim_due_actions(&mut tx, Utc::now(), CLAIM_BATCH)
            .await?;
        if jobs.is_empty() {
            tx.rollback().await?;
            return Ok(0);
        }

        debug!("claimed {} due action(s)", jobs.len());
        let mut completed = 0;
        for job in &jobs {
            match self.dispatch(job).await {
                Ok(()) => {
                    self.store.delete_action(&mut tx, job.id).await?;
                    completed += 1;
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        "action {} ({}) attempt {} failed, will retry: {}",
                        job.id,
                        job.action_type.as_str(),
                        job.attempts + 1,
                        e
                    );
                    self.store.record_attempt(&mut tx, job.id).await?;
                }
                Err(e) => {
                    // Permanent failures also stay queued; an operator (or a
                    // future dead-letter pass) removes them. The intent is
                    // never silently dropped.
                    error!(
                        "action {} ({}) failed permanently-looking: {}",
                        job.id,
                        job.action_type.as_str(),
                        e
                    );
                    self.store.record_attempt(&mut tx, job.id).await?;
                }
            }
        }
        tx.commit().await?;
        Ok(completed)
    }

    async fn settings_for(&self, user_id: Uuid) -> Result<UserSettings> {
        self.store.settings(user_id).await?.ok_or(Error::NotFound)
    }

    async fn dispatch(&self, job: &ActionJob) -> Result<()> {
        match job.action_type {
            ActionType::StarThread => {
                let payload: StarThread = decode(&job.payload)?;
                self.star_thread(job.user_id, &payload).await
            }
            ActionType::MoveThread => {
                let payload: MoveThread = decode(&job.payload)?;
                self.move_thread(job.user_id, &payload).await
            }
            ActionType::SendEmail => {
                let payload: SendEmail = decode(&job.payload)?;
                self.send_email(job.user_id, &payload).await
            }
            ActionType::SyncDraft => {
                let payload: SyncDraft = decode(&job.payload)?;
                self.sync_draft(job.user_id, &payload).await
            }
        }
    }

    /// Flag or unflag every message of the thread on the server, then mirror
    /// the state into the cache. Messages are grouped by folder so each
    /// folder is selected once.
    async fn star_thread(&self, user_id: Uuid, payload: &StarThread) -> Result<()> {
        let messages = self
            .store
            .messages_in_thread(user_id, &payload.thread_stable_id)
            .await?;
        if messages.is_empty() {
            return Err(Error::NotFound);
        }

        let settings = self.settings_for(user_id).await?;
        let endpoint = self.endpoint(&settings)?;
        let guard = self.pool.acquire_worker(user_id, &endpoint).await?;
        let session = guard.session();

        let operation = if payload.starred {
            FlagOperation::Add
        } else {
            FlagOperation::Remove
        };

        for (folder, group) in by_folder(&messages) {
            session.select(&folder).await?;
            let uids: Vec<u32> = group.iter().map(|m| m.imap_uid).collect();
            session
                .store_flags(&uids, operation, "\\Flagged")
                .await?;
            // A mid-iteration failure leaves earlier folders flagged and the
            // row queued; the retry rolls forward and a later sync realigns.
            for message in group {
                self.store
                    .mark_message_starred(message.id, payload.starred)
                    .await?;
            }
        }
        Ok(())
    }

    /// `UID MOVE` every message of the thread, retargeting the cache rows as
    /// each folder group lands.
    async fn move_thread(&self, user_id: Uuid, payload: &MoveThread) -> Result<()> {
        let messages = self
            .store
            .messages_in_thread(user_id, &payload.thread_stable_id)
            .await?;
        if messages.is_empty() {
            return Err(Error::NotFound);
        }

        let settings = self.settings_for(user_id).await?;
        let endpoint = self.endpoint(&settings)?;
        let guard = self.pool.acquire_worker(user_id, &endpoint).await?;
        let session = guard.session();

        for (folder, group) in by_folder(&messages) {
            if folder == payload.destination_folder {
                continue;
            }
            session.select(&folder).await?;
            let uids: Vec<u32> = group.iter().map(|m| m.imap_uid).collect();
            session.uid_move(&uids, &payload.destination_folder).await?;

            for message in group {
                self.store
                    .move_message(
                        user_id,
                        &folder,
                        message.imap_uid,
                        &payload.destination_folder,
                    )
                    .await?;
            }
        }

        self.store.prune_empty_threads(user_id).await?;
        Ok(())
    }

    /// Compose, submit over SMTP, append to the Sent folder, and clean up
    /// the referenced draft. SMTP submission is the commit point; once it
    /// succeeds the row must not survive to a re-poll, so append and
    /// draft-delete failures are logged without failing the job.
    async fn send_email(&self, user_id: Uuid, payload: &SendEmail) -> Result<()> {
        let settings = self.settings_for(user_id).await?;
        let user = self
            .store
            .user_by_id(user_id)
            .await?
            .ok_or(Error::NotFound)?;

        let request = OutboundRequest {
            to: payload.to.clone(),
            cc: payload.cc.clone(),
            subject: payload.subject.clone(),
            body: payload.body.clone(),
            in_reply_to: payload.in_reply_to.clone(),
        };
        let email = smtp::compose(&user.email, &request)?;

        self.smtp.send(&settings, &email).await?;

        if let Err(e) = self.append_to_sent(user_id, &settings, &email.rfc5322_bytes).await {
            warn!("sent-folder append failed for {}: {}", email.message_id, e);
        }

        if let Some(draft_id) = payload.draft_id {
            if let Err(e) = self.store.delete_draft(user_id, draft_id).await {
                warn!("draft {} cleanup failed after send: {}", draft_id, e);
            }
        }
        Ok(())
    }

    async fn append_to_sent(
        &self,
        user_id: Uuid,
        settings: &UserSettings,
        rfc5322: &[u8],
    ) -> Result<()> {
        let endpoint = self.endpoint(settings)?;
        let guard = self.pool.acquire_worker(user_id, &endpoint).await?;
        guard
            .session()
            .append(&settings.sent_folder, Some("(\\Seen)"), rfc5322)
            .await?;
        Ok(())
    }

    /// Push a local draft to the server Drafts folder and record the UID it
    /// landed under, resolved by searching for the generated Message-ID.
    async fn sync_draft(&self, user_id: Uuid, payload: &SyncDraft) -> Result<()> {
        let draft = self
            .store
            .draft(user_id, payload.draft_id)
            .await?
            .ok_or(Error::NotFound)?;
        let settings = self.settings_for(user_id).await?;
        let user = self
            .store
            .user_by_id(user_id)
            .await?
            .ok_or(Error::NotFound)?;

        let request = OutboundRequest {
            to: draft.to_addresses.clone(),
            cc: vec![],
            subject: draft.subject.clone(),
            body: draft.body.clone(),
            in_reply_to: draft.in_reply_to.clone(),
        };
        let email = smtp::compose(&user.email, &request)?;

        let endpoint = self.endpoint(&settings)?;
        let guard = self.pool.acquire_worker(user_id, &endpoint).await?;
        let session = guard.session();

        session
            .append(&settings.drafts_folder, Some("(\\Draft)"), &email.rfc5322_bytes)
            .await?;

        session.select(&settings.drafts_folder).await?;
        let uids = session
            .uid_search(&format!("HEADER Message-ID \"{}\"", email.message_id))
            .await?;
        match uids.into_iter().max() {
            Some(uid) => {
                self.store
                    .set_draft_uid(user_id, payload.draft_id, uid)
                    .await?
            }
            None => warn!(
                "draft {} appended but not found by Message-ID search",
                payload.draft_id
            ),
        }
        Ok(())
    }

    fn endpoint(&self, settings: &UserSettings) -> Result<crate::imap::session::ImapEndpoint> {
        let password = self.cipher.decrypt(&settings.encrypted_imap_password)?;
        Ok(crate::imap::session::ImapEndpoint {
            host: settings.imap_host.clone(),
            port: settings.imap_port,
            username: settings.mail_username.clone(),
            password,
        })
    }
}

fn decode<T: serde::de::DeserializeOwned>(payload: &serde_json::Value) -> Result<T> {
    serde_json::from_value(payload.clone())
        .map_err(|e| Error::InvalidInput(format!("malformed payload: {}", e)))
}

/// Group thread messages by their current folder, preserving order.
fn by_folder(messages: &[crate::store::CachedMessage]) -> Vec<(String, Vec<&crate::store::CachedMessage>)> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<&crate::store::CachedMessage>> = HashMap::new();
    for message in messages {
        if !groups.contains_key(&message.imap_folder_name) {
            order.push(message.imap_folder_name.clone());
        }
        groups
            .entry(message.imap_folder_name.clone())
            .or_default()
            .push(message);
    }
    order
        .into_iter()
        .map(|folder| {
            let group = groups.remove(&folder).unwrap_or_default();
            (folder, group)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payloads_roundtrip_through_json() {
        let star = StarThread {
            thread_stable_id: "<a@x>".to_string(),
            starred: true,
        };
        let value = serde_json::to_value(&star).unwrap();
        assert_eq!(serde_json::from_value::<StarThread>(value).unwrap(), star);

        let send = SendEmail {
            to: vec!["bob@example.com".to_string()],
            cc: vec![],
            subject: "hi".to_string(),
            body: "hello".to_string(),
            in_reply_to: None,
            draft_id: Some(4),
        };
        let value = serde_json::to_value(&send).unwrap();
        assert_eq!(serde_json::from_value::<SendEmail>(value).unwrap(), send);
    }

    #[test]
    fn validate_payload_accepts_minimal_send() {
        let payload = json!({
            "to": ["bob@example.com"],
            "subject": "hi",
            "body": "hello"
        });
        assert!(validate_payload(ActionType::SendEmail, &payload).is_ok());
    }

    #[test]
    fn validate_payload_rejects_wrong_shape() {
        let payload = json!({"thread_stable_id": "<a@x>", "starred": true});
        assert!(validate_payload(ActionType::MoveThread, &payload).is_err());
        assert!(validate_payload(ActionType::StarThread, &payload).is_ok());
    }

    #[test]
    fn by_folder_groups_and_keeps_first_seen_order() {
        use crate::store::CachedMessage;
        use uuid::Uuid;

        let user = Uuid::new_v4();
        let msg = |folder: &str, uid: u32| CachedMessage {
            id: uid as i64,
            thread_id: 1,
            user_id: user,
            imap_uid: uid,
            imap_folder_name: folder.to_string(),
            message_id_header: format!("<{}@x>", uid),
            from_address: "a@x".to_string(),
            to_addresses: vec![],
            cc_addresses: vec![],
            sent_at: None,
            subject: String::new(),
            unsafe_body_html: None,
            body_text: None,
            is_read: false,
            is_starred: false,
        };

        let messages = vec![msg("INBOX", 1), msg("Archive", 2), msg("INBOX", 3)];
        let grouped = by_folder(&messages);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].0, "INBOX");
        assert_eq!(grouped[0].1.len(), 2);
        assert_eq!(grouped[1].0, "Archive");
    }
}
