// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// IMAP sessions are not concurrency-safe: every live session is owned either
// by a pool slot or by exactly one task, and the async-imap session itself is
// additionally wrapped in a mutex held for the duration of each operation.

use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use async_imap::extensions::idle::IdleResponse;
use async_imap::imap_proto::{self, NameAttribute, Response, Status};
use async_imap::types::Fetch;
use async_imap::Session;
use async_native_tls::TlsStream;
use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite};
use futures::StreamExt;
use log::{debug, warn};
use tokio::net::TcpStream;
use tokio::sync::Mutex as TokioMutex;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

use crate::imap::error::ImapError;
use crate::imap::types::{
    uid_set, FlagOperation, FolderInfo, IdleOutcome, MessageMeta, ThreadNode,
};

/// Bound on draining the reply to a raw THREAD command.
const THREAD_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// TLS or plaintext transport under one session type. Plaintext is for test
/// setups; the choice is made by pool configuration, not per call.
pub enum ImapTransport {
    Tls(TlsStream<Compat<TcpStream>>),
    Plain(Compat<TcpStream>),
}

impl AsyncRead for ImapTransport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ImapTransport::Tls(s) => Pin::new(s).poll_read(cx, buf),
            ImapTransport::Plain(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ImapTransport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ImapTransport::Tls(s) => Pin::new(s).poll_write(cx, buf),
            ImapTransport::Plain(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ImapTransport::Tls(s) => Pin::new(s).poll_flush(cx),
            ImapTransport::Plain(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ImapTransport::Tls(s) => Pin::new(s).poll_close(cx),
            ImapTransport::Plain(s) => Pin::new(s).poll_close(cx),
        }
    }
}

impl std::fmt::Debug for ImapTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImapTransport::Tls(_) => write!(f, "ImapTransport::Tls"),
            ImapTransport::Plain(_) => write!(f, "ImapTransport::Plain"),
        }
    }
}

unsafe impl Send for ImapTransport {}
impl Unpin for ImapTransport {}

type ImapSession = Session<ImapTransport>;

/// Where and how to authenticate one user's IMAP account. The decrypted
/// password lives only as long as this value.
#[derive(Clone)]
pub struct ImapEndpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for ImapEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Dial, TLS-wrap per configuration, and LOGIN.
pub async fn connect(
    endpoint: &ImapEndpoint,
    use_tls: bool,
    dial_timeout: Duration,
) -> Result<ImapSession, ImapError> {
    let addr = format!("{}:{}", endpoint.host, endpoint.port);
    let tcp = tokio::time::timeout(dial_timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| ImapError::Timeout(format!("dial {} exceeded {:?}", addr, dial_timeout)))?
        .map_err(|e| ImapError::Connection(e.to_string()))?;

    let stream = if use_tls {
        let tls = async_native_tls::TlsConnector::new();
        let tls_stream = tls
            .connect(&endpoint.host, tcp.compat())
            .await
            .map_err(|e| ImapError::Tls(e.to_string()))?;
        ImapTransport::Tls(tls_stream)
    } else {
        ImapTransport::Plain(tcp.compat())
    };

    let client = async_imap::Client::new(stream);
    let session = client
        .login(&endpoint.username, &endpoint.password)
        .await
        .map_err(|(err, _client)| ImapError::Auth(format!("login failed: {}", err)))?;

    Ok(session)
}

/// The operations the sync engine, action worker, and service layer run over
/// a worker session. The seam exists so tests can substitute a mock.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MailSession: Send + Sync {
    /// SELECT a folder; returns the EXISTS count.
    async fn select(&self, folder: &str) -> Result<u32, ImapError>;

    /// UID SEARCH with a raw criteria string.
    async fn uid_search(&self, criteria: &str) -> Result<Vec<u32>, ImapError>;

    /// Envelope + flags + internal date for a UID set.
    async fn fetch_meta(&self, uids: &[u32]) -> Result<Vec<MessageMeta>, ImapError>;

    /// First step of a body fetch: envelope and body structure for one UID.
    async fn fetch_structure(&self, uid: u32) -> Result<MessageMeta, ImapError>;

    /// Second step: the full body section.
    async fn fetch_body_section(&self, uid: u32) -> Result<Vec<u8>, ImapError>;

    /// FLAGS-only fetch for a UID set.
    async fn fetch_flags(&self, uids: &[u32]) -> Result<Vec<(u32, Vec<String>)>, ImapError>;

    /// `UID STORE ±FLAGS.SILENT (<flag>)`.
    async fn store_flags(
        &self,
        uids: &[u32],
        operation: FlagOperation,
        flag: &str,
    ) -> Result<(), ImapError>;

    /// `UID MOVE` to another folder. Requires the MOVE capability (§6).
    async fn uid_move(&self, uids: &[u32], destination: &str) -> Result<(), ImapError>;

    /// APPEND a full message, optionally with a flag list like `(\Seen)`.
    #[cfg_attr(test, mockall::concretize)]
    async fn append(
        &self,
        folder: &str,
        flags: Option<&str>,
        content: &[u8],
    ) -> Result<(), ImapError>;

    /// `UID THREAD REFERENCES` for the selected folder.
    /// `Err(ThreadUnsupported)` when the server lacks the capability or the
    /// reply cannot be transported; callers fall back to flat mode.
    async fn thread_references(&self) -> Result<Vec<ThreadNode>, ImapError>;

    /// LIST all folders.
    async fn list_folders(&self) -> Result<Vec<FolderInfo>, ImapError>;

    /// NOOP health probe.
    async fn noop(&self) -> Result<(), ImapError>;

    /// Best-effort LOGOUT.
    async fn logout(&self) -> Result<(), ImapError>;
}

/// Pooled request-driven session.
pub struct WorkerSession {
    session: TokioMutex<ImapSession>,
}

impl WorkerSession {
    pub fn new(session: ImapSession) -> Self {
        Self {
            session: TokioMutex::new(session),
        }
    }

    pub async fn establish(
        endpoint: &ImapEndpoint,
        use_tls: bool,
        dial_timeout: Duration,
    ) -> Result<Self, ImapError> {
        Ok(Self::new(connect(endpoint, use_tls, dial_timeout).await?))
    }

    async fn collect_fetches(
        stream: impl futures::Stream<Item = async_imap::error::Result<Fetch>>,
    ) -> Result<Vec<Fetch>, ImapError> {
        let mut fetches = Vec::new();
        tokio::pin!(stream);
        while let Some(item) = stream.next().await {
            fetches.push(item.map_err(ImapError::from)?);
        }
        Ok(fetches)
    }
}

impl std::fmt::Debug for WorkerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSession").finish_non_exhaustive()
    }
}

#[async_trait]
impl MailSession for WorkerSession {
    async fn select(&self, folder: &str) -> Result<u32, ImapError> {
        let mut session = self.session.lock().await;
        let mailbox = session.select(folder).await.map_err(ImapError::from)?;
        Ok(mailbox.exists)
    }

    async fn uid_search(&self, criteria: &str) -> Result<Vec<u32>, ImapError> {
        let mut session = self.session.lock().await;
        let uids = session.uid_search(criteria).await.map_err(ImapError::from)?;
        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn fetch_meta(&self, uids: &[u32]) -> Result<Vec<MessageMeta>, ImapError> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let mut session = self.session.lock().await;
        let sequence = uid_set(uids);
        let stream = session
            .uid_fetch(&sequence, "(FLAGS ENVELOPE INTERNALDATE)")
            .await
            .map_err(ImapError::from)?;
        let fetches = Self::collect_fetches(stream).await?;

        let mut metas = Vec::with_capacity(fetches.len());
        for fetch in &fetches {
            match MessageMeta::from_fetch(fetch) {
                Some(meta) => metas.push(meta),
                // A fetch item without a UID cannot be integrated; skip it.
                None => debug!("fetch item without UID ignored"),
            }
        }
        if metas.len() != uids.len() {
            warn!(
                "fetch returned {} of {} requested UIDs",
                metas.len(),
                uids.len()
            );
        }
        Ok(metas)
    }

    async fn fetch_structure(&self, uid: u32) -> Result<MessageMeta, ImapError> {
        let mut session = self.session.lock().await;
        let sequence = uid.to_string();
        let stream = session
            .uid_fetch(&sequence, "(FLAGS ENVELOPE INTERNALDATE BODYSTRUCTURE)")
            .await
            .map_err(ImapError::from)?;
        let fetches = Self::collect_fetches(stream).await?;

        fetches
            .iter()
            .find_map(MessageMeta::from_fetch)
            .ok_or_else(|| ImapError::MissingData(format!("no envelope for UID {}", uid)))
    }

    async fn fetch_body_section(&self, uid: u32) -> Result<Vec<u8>, ImapError> {
        let mut session = self.session.lock().await;
        let sequence = uid.to_string();
        let stream = session
            .uid_fetch(&sequence, "BODY[]")
            .await
            .map_err(ImapError::from)?;
        let fetches = Self::collect_fetches(stream).await?;

        fetches
            .iter()
            .find_map(|f| f.body().map(|b| b.to_vec()))
            .ok_or_else(|| ImapError::MissingData(format!("no body for UID {}", uid)))
    }

    async fn fetch_flags(&self, uids: &[u32]) -> Result<Vec<(u32, Vec<String>)>, ImapError> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let mut session = self.session.lock().await;
        let sequence = uid_set(uids);
        let stream = session
            .uid_fetch(&sequence, "FLAGS")
            .await
            .map_err(ImapError::from)?;
        let fetches = Self::collect_fetches(stream).await?;

        Ok(fetches
            .iter()
            .filter_map(|f| {
                let uid = f.uid?;
                let flags = f.flags().map(|fl| format!("{:?}", fl)).collect();
                Some((uid, flags))
            })
            .collect())
    }

    async fn store_flags(
        &self,
        uids: &[u32],
        operation: FlagOperation,
        flag: &str,
    ) -> Result<(), ImapError> {
        if uids.is_empty() {
            return Ok(());
        }
        let mut session = self.session.lock().await;
        let sequence = uid_set(uids);
        let sign = match operation {
            FlagOperation::Add => '+',
            FlagOperation::Remove => '-',
        };
        let command = format!("{}FLAGS.SILENT ({})", sign, flag);
        let stream = session
            .uid_store(&sequence, &command)
            .await
            .map_err(ImapError::from)?;
        Self::collect_fetches(stream).await?;
        Ok(())
    }

    async fn uid_move(&self, uids: &[u32], destination: &str) -> Result<(), ImapError> {
        if uids.is_empty() {
            return Ok(());
        }
        let mut session = self.session.lock().await;
        let sequence = uid_set(uids);
        session
            .uid_mv(&sequence, destination)
            .await
            .map_err(ImapError::from)
    }

    async fn append(
        &self,
        folder: &str,
        flags: Option<&str>,
        content: &[u8],
    ) -> Result<(), ImapError> {
        let mut session = self.session.lock().await;
        session
            .append(folder, flags, None::<&str>, content)
            .await
            .map_err(ImapError::from)
    }

    async fn thread_references(&self) -> Result<Vec<ThreadNode>, ImapError> {
        let mut session = self.session.lock().await;

        let capabilities = session.capabilities().await.map_err(ImapError::from)?;
        if !capabilities.has_str("THREAD=REFERENCES") {
            return Err(ImapError::ThreadUnsupported);
        }

        let request_id = session
            .run_command("UID THREAD REFERENCES US-ASCII ALL")
            .await
            .map_err(ImapError::from)?;

        // Drain the reply. The protocol parser in async-imap has no RFC 5256
        // support, so a data line it cannot represent surfaces as a read
        // error; that downgrades the folder to flat mode rather than failing
        // the sync.
        let drain = async {
            let mut forest: Vec<ThreadNode> = Vec::new();
            loop {
                match session.read_response().await {
                    Some(Ok(data)) => match data.parsed() {
                        Response::Done { tag, status, .. } if *tag == request_id => {
                            if matches!(status, Status::Ok) {
                                return Ok(forest);
                            }
                            return Err(ImapError::Command(format!(
                                "THREAD command rejected: {:?}",
                                status
                            )));
                        }
                        other => {
                            debug!("ignoring response during THREAD: {:?}", other);
                        }
                    },
                    Some(Err(err)) => {
                        debug!("THREAD reply not transportable: {}", err);
                        return Err(ImapError::ThreadUnsupported);
                    }
                    None => {
                        return Err(ImapError::Connection(
                            "connection closed during THREAD".to_string(),
                        ));
                    }
                }
            }
        };

        let forest = tokio::time::timeout(THREAD_RESPONSE_TIMEOUT, drain)
            .await
            .map_err(|_| ImapError::Timeout("THREAD response".to_string()))??;

        if forest.is_empty() {
            // Nothing decodable came back; let the caller run flat mode.
            return Err(ImapError::ThreadUnsupported);
        }
        Ok(forest)
    }

    async fn list_folders(&self) -> Result<Vec<FolderInfo>, ImapError> {
        let mut session = self.session.lock().await;
        let stream = session.list(None, Some("*")).await.map_err(ImapError::from)?;

        let mut folders = Vec::new();
        tokio::pin!(stream);
        while let Some(item) = stream.next().await {
            let name = item.map_err(ImapError::from)?;
            let selectable = !name
                .attributes()
                .iter()
                .any(|attr| matches!(attr, NameAttribute::NoSelect));
            folders.push(FolderInfo {
                name: name.name().to_string(),
                selectable,
            });
        }
        Ok(folders)
    }

    async fn noop(&self) -> Result<(), ImapError> {
        let mut session = self.session.lock().await;
        session.noop().await.map_err(ImapError::from)
    }

    async fn logout(&self) -> Result<(), ImapError> {
        let mut session = self.session.lock().await;
        session.logout().await.map_err(ImapError::from)
    }
}

/// The dedicated IDLE session. Owned by one listener task at a time, so the
/// async-imap session moves through the IDLE handle without extra locking.
pub struct ListenerSession {
    session: Option<ImapSession>,
}

impl ListenerSession {
    pub fn new(session: ImapSession) -> Self {
        Self {
            session: Some(session),
        }
    }

    pub async fn establish(
        endpoint: &ImapEndpoint,
        use_tls: bool,
        dial_timeout: Duration,
    ) -> Result<Self, ImapError> {
        Ok(Self::new(connect(endpoint, use_tls, dial_timeout).await?))
    }

    pub async fn select(&mut self, folder: &str) -> Result<u32, ImapError> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| ImapError::Connection("listener session lost".to_string()))?;
        let mailbox = session.select(folder).await.map_err(ImapError::from)?;
        Ok(mailbox.exists)
    }

    /// One IDLE cycle: arm, wait up to `rearm` (the heartbeat interval), and
    /// translate what arrived. Growth of the mailbox is the only update we
    /// act on.
    pub async fn idle_wait(&mut self, rearm: Duration) -> Result<IdleOutcome, ImapError> {
        let session = self
            .session
            .take()
            .ok_or_else(|| ImapError::Connection("listener session lost".to_string()))?;

        let mut idle = session.idle();
        idle.init().await.map_err(ImapError::from)?;

        let (wait_fut, _interrupt) = idle.wait_with_timeout(rearm);
        let response = wait_fut.await.map_err(ImapError::from)?;

        let outcome = match response {
            IdleResponse::NewData(data) => match data.parsed() {
                Response::MailboxData(imap_proto::MailboxDatum::Exists(n)) if *n > 0 => {
                    IdleOutcome::NewMessages
                }
                other => {
                    debug!("IDLE update not translated: {:?}", other);
                    IdleOutcome::Timeout
                }
            },
            IdleResponse::Timeout | IdleResponse::ManualInterrupt => IdleOutcome::Timeout,
        };

        let session = idle.done().await.map_err(ImapError::from)?;
        self.session = Some(session);
        Ok(outcome)
    }

    pub async fn logout(&mut self) -> Result<(), ImapError> {
        if let Some(mut session) = self.session.take() {
            session.logout().await.map_err(ImapError::from)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ListenerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSession")
            .field("connected", &self.session.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_debug_redacts_password() {
        let endpoint = ImapEndpoint {
            host: "imap.example.com".to_string(),
            port: 993,
            username: "alice".to_string(),
            password: "hunter2".to_string(),
        };
        let rendered = format!("{:?}", endpoint);
        assert!(rendered.contains("imap.example.com"));
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
