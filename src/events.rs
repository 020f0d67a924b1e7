// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Per-user fan-out of server-originated mailbox events.
//!
//! The outer layer registers one sender per WebSocket; `publish` walks the
//! user's set and evicts any client whose channel is gone. Registration and
//! removal are O(1); the registry is a concurrent map keyed by user with a
//! per-user mutex around the client set.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex as TokioMutex};
use uuid::Uuid;

/// Events pushed to connected clients, serialized as the wire JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MailboxEvent {
    NewEmail { folder: String },
}

impl MailboxEvent {
    pub fn new_email(folder: &str) -> Self {
        MailboxEvent::NewEmail {
            folder: folder.to_string(),
        }
    }
}

type ClientSet = Arc<TokioMutex<HashMap<Uuid, mpsc::UnboundedSender<String>>>>;

#[derive(Default)]
pub struct EventBus {
    clients: DashMap<Uuid, ClientSet>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client sink; returns the handle used to unregister.
    pub async fn register(&self, user_id: Uuid, sender: mpsc::UnboundedSender<String>) -> Uuid {
        let client_id = Uuid::new_v4();
        let set = self
            .clients
            .entry(user_id)
            .or_insert_with(|| Arc::new(TokioMutex::new(HashMap::new())))
            .clone();
        set.lock().await.insert(client_id, sender);
        debug!("client {} registered for user {}", client_id, user_id);
        client_id
    }

    pub async fn unregister(&self, user_id: Uuid, client_id: Uuid) {
        let set = self.clients.get(&user_id).map(|s| Arc::clone(s.value()));
        if let Some(set) = set {
            set.lock().await.remove(&client_id);
            debug!("client {} unregistered for user {}", client_id, user_id);
        }
    }

    /// Number of live clients for the user.
    pub async fn client_count(&self, user_id: Uuid) -> usize {
        let set = self.clients.get(&user_id).map(|s| Arc::clone(s.value()));
        match set {
            Some(set) => set.lock().await.len(),
            None => 0,
        }
    }

    /// Serialize and send to every client of the user; a failed write drops
    /// that client.
    pub async fn publish(&self, user_id: Uuid, event: &MailboxEvent) {
        let set = self.clients.get(&user_id).map(|s| Arc::clone(s.value()));
        let Some(set) = set else {
            return;
        };

        let payload = match serde_json::to_string(event) {
            Ok(p) => p,
            Err(e) => {
                warn!("event serialization failed: {}", e);
                return;
            }
        };

        let mut clients = set.lock().await;
        let mut dead = Vec::new();
        for (client_id, sender) in clients.iter() {
            if sender.send(payload.clone()).is_err() {
                dead.push(*client_id);
            }
        }
        for client_id in dead {
            clients.remove(&client_id);
            debug!("dropped dead client {} for user {}", client_id, user_id);
        }
    }
}
