// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Per-user IDLE listeners.
//!
//! One loop per user with at least one connected client: hold the dedicated
//! listener session in IDLE against INBOX, and on mailbox growth trigger an
//! INBOX sync on a worker session and push a `new_email` event to the user's
//! clients. With no clients connected, the loop sleeps instead of holding a
//! session. IDLE errors discard the listener session and retry after a
//! fixed backoff.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Error;
use crate::events::{EventBus, MailboxEvent};
use crate::imap::types::IdleOutcome;
use crate::pool::ConnectionPool;
use crate::sync::SyncEngine;

const INBOX: &str = "INBOX";
/// IDLE re-arm / heartbeat interval.
const REARM_INTERVAL: Duration = Duration::from_secs(5);
/// Backoff after a listener failure.
const RETRY_BACKOFF: Duration = Duration::from_secs(10);
/// Sleep between client-count checks while nobody is connected.
const NO_CLIENT_SLEEP: Duration = Duration::from_secs(5);

pub struct IdleSupervisor {
    pool: Arc<ConnectionPool>,
    engine: Arc<SyncEngine>,
    bus: Arc<EventBus>,
    shutdown: CancellationToken,
    running: DashMap<Uuid, ()>,
}

impl IdleSupervisor {
    pub fn new(
        pool: Arc<ConnectionPool>,
        engine: Arc<SyncEngine>,
        bus: Arc<EventBus>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            engine,
            bus,
            shutdown,
            running: DashMap::new(),
        })
    }

    /// Make sure a listener loop exists for the user. Called whenever a
    /// WebSocket registers; idempotent.
    pub fn ensure_listener(self: &Arc<Self>, user_id: Uuid) {
        if self.running.insert(user_id, ()).is_some() {
            return;
        }
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            supervisor.listen_loop(user_id).await;
            supervisor.running.remove(&user_id);
        });
    }

    async fn listen_loop(&self, user_id: Uuid) {
        info!("IDLE listener started for user {}", user_id);
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            // No clients: don't hold a session open for nobody.
            if self.bus.client_count(user_id).await == 0 {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(NO_CLIENT_SLEEP) => continue,
                }
            }

            if let Err(e) = self.idle_cycle(user_id).await {
                if matches!(e, Error::Cancelled) {
                    break;
                }
                warn!(
                    "IDLE listener error for user {}: {}; retrying in {:?}",
                    user_id, e, RETRY_BACKOFF
                );
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(RETRY_BACKOFF) => {}
                }
            }
        }
        info!("IDLE listener stopped for user {}", user_id);
    }

    /// Hold the listener session through IDLE cycles until an error or the
    /// last client leaves. The slot guard keeps the session across cycles.
    async fn idle_cycle(&self, user_id: Uuid) -> crate::error::Result<()> {
        let settings = self
            .engine
            .store()
            .settings(user_id)
            .await?
            .ok_or(Error::NotFound)?;
        let endpoint = self.engine.imap_endpoint(&settings)?;

        let mut slot = self.pool.acquire_listener(user_id, &endpoint).await?;
        {
            let listener = slot.as_mut().ok_or_else(|| {
                Error::ConnectFailed("listener session missing after acquire".to_string())
            })?;
            listener.select(INBOX).await.map_err(Error::from)?;
        }

        loop {
            if self.shutdown.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if self.bus.client_count(user_id).await == 0 {
                // Loop goes back to sleeping; session stays parked in the slot.
                return Ok(());
            }

            let listener = slot.as_mut().ok_or_else(|| {
                Error::ConnectFailed("listener session lost mid-cycle".to_string())
            })?;

            match listener.idle_wait(REARM_INTERVAL).await {
                Ok(IdleOutcome::NewMessages) => {
                    debug!("IDLE reported new mail for user {}", user_id);
                    let cancel = self.shutdown.child_token();
                    if let Err(e) = self.engine.sync_folder(user_id, INBOX, &cancel).await {
                        warn!("IDLE-triggered sync failed for {}: {}", user_id, e);
                    }
                    self.bus
                        .publish(user_id, &MailboxEvent::new_email(INBOX))
                        .await;
                }
                Ok(IdleOutcome::Timeout) => {}
                Err(e) => {
                    // Discard the broken session; the outer loop backs off
                    // and dials a fresh one.
                    *slot = None;
                    return Err(e.into());
                }
            }
        }
    }
}
