// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Per-user IMAP session pooling.
//!
//! Two disjoint pools per user: a capacity-limited worker set for
//! request-driven operations and at most one listener session dedicated to
//! IDLE. Sessions are expensive (dial + TLS + LOGIN) and not concurrency-safe,
//! so acquisition hands out exclusive ownership and release is an RAII guard.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::{Mutex as TokioMutex, OwnedMutexGuard, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::PoolSettings;
use crate::error::{Error, Result};
use crate::imap::error::ImapError;
use crate::imap::session::{ImapEndpoint, ListenerSession, MailSession, WorkerSession};

/// Configuration for the connection pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Worker sessions allowed per user.
    pub max_workers: usize,
    /// Idle age beyond which a worker session is NOOP-probed before reuse.
    pub health_check_threshold: Duration,
    /// Idle age at which the janitor retires a worker session.
    pub worker_idle_timeout: Duration,
    /// Janitor cadence.
    pub janitor_interval: Duration,
    /// TCP dial timeout.
    pub dial_timeout: Duration,
    /// TLS vs plaintext, chosen by configuration rather than per call.
    pub use_tls: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 3,
            health_check_threshold: Duration::from_secs(60),
            worker_idle_timeout: Duration::from_secs(600),
            janitor_interval: Duration::from_secs(60),
            dial_timeout: Duration::from_secs(5),
            use_tls: true,
        }
    }
}

impl From<&PoolSettings> for PoolConfig {
    fn from(settings: &PoolSettings) -> Self {
        Self {
            max_workers: settings.max_workers,
            health_check_threshold: Duration::from_secs(settings.health_check_threshold_seconds),
            worker_idle_timeout: Duration::from_secs(settings.worker_idle_timeout_seconds),
            janitor_interval: Duration::from_secs(60),
            dial_timeout: Duration::from_secs(settings.dial_timeout_seconds),
            use_tls: settings.use_tls,
        }
    }
}

/// Dials and authenticates sessions on the pool's behalf. The seam exists so
/// pool behavior is testable without a live server.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn worker(&self, endpoint: &ImapEndpoint) -> std::result::Result<Arc<dyn MailSession>, ImapError>;

    async fn listener(&self, endpoint: &ImapEndpoint) -> std::result::Result<ListenerSession, ImapError>;
}

/// The production factory: TCP + optional TLS + LOGIN.
pub struct DialingFactory {
    use_tls: bool,
    dial_timeout: Duration,
}

impl DialingFactory {
    pub fn new(use_tls: bool, dial_timeout: Duration) -> Self {
        Self {
            use_tls,
            dial_timeout,
        }
    }

    pub fn from_config(config: &PoolConfig) -> Self {
        Self::new(config.use_tls, config.dial_timeout)
    }
}

#[async_trait]
impl SessionFactory for DialingFactory {
    async fn worker(&self, endpoint: &ImapEndpoint) -> std::result::Result<Arc<dyn MailSession>, ImapError> {
        let session = WorkerSession::establish(endpoint, self.use_tls, self.dial_timeout).await?;
        Ok(Arc::new(session))
    }

    async fn listener(&self, endpoint: &ImapEndpoint) -> std::result::Result<ListenerSession, ImapError> {
        ListenerSession::establish(endpoint, self.use_tls, self.dial_timeout).await
    }
}

/// An unlocked worker session parked in the pool.
struct IdleWorker {
    session: Arc<dyn MailSession>,
    last_used: Instant,
}

/// One user's worker set: a semaphore bounding live sessions and the parked
/// idle ones. Sessions currently handed out are represented only by their
/// held permits.
struct UserWorkers {
    semaphore: Arc<Semaphore>,
    idle: TokioMutex<Vec<IdleWorker>>,
}

impl UserWorkers {
    fn new(max_workers: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_workers)),
            idle: TokioMutex::new(Vec::new()),
        }
    }
}

/// Exclusive lease on a worker session. Dropping the guard returns the
/// session to the pool and frees its capacity slot; release is idempotent by
/// construction. Call [`WorkerGuard::discard`] when the session state is
/// known bad so it is not parked again.
impl std::fmt::Debug for WorkerGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerGuard")
            .field("user_id", &self.user_id)
            .finish()
    }
}

pub struct WorkerGuard {
    session: Option<Arc<dyn MailSession>>,
    user_id: Uuid,
    workers: Arc<UserWorkers>,
    _permit: OwnedSemaphorePermit,
}

impl WorkerGuard {
    pub fn session(&self) -> &dyn MailSession {
        self.session
            .as_deref()
            .expect("session present until drop")
    }

    /// Drop the session instead of parking it (protocol state is broken or
    /// credentials changed mid-flight).
    pub fn discard(mut self) {
        if let Some(session) = self.session.take() {
            tokio::spawn(async move {
                let _ = session.logout().await;
            });
        }
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            let workers = Arc::clone(&self.workers);
            let user_id = self.user_id;
            // Parking needs the idle-list lock; do it off the destructor.
            tokio::spawn(async move {
                let mut idle = workers.idle.lock().await;
                idle.push(IdleWorker {
                    session,
                    last_used: Instant::now(),
                });
                debug!("worker session returned to pool for user {}", user_id);
            });
        }
        // The permit releases with the guard, freeing the capacity slot.
    }
}

/// The per-user session pools plus their janitor.
pub struct ConnectionPool {
    workers: RwLock<HashMap<Uuid, Arc<UserWorkers>>>,
    listeners: RwLock<HashMap<Uuid, Arc<TokioMutex<Option<ListenerSession>>>>>,
    factory: Arc<dyn SessionFactory>,
    config: PoolConfig,
    shutdown: CancellationToken,
}

impl ConnectionPool {
    /// Create the pool and start its janitor. The janitor stops when
    /// `shutdown` (the process-scoped token) is cancelled.
    pub fn new(
        config: PoolConfig,
        factory: Arc<dyn SessionFactory>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            workers: RwLock::new(HashMap::new()),
            listeners: RwLock::new(HashMap::new()),
            factory,
            config,
            shutdown,
        });

        let janitor_pool = Arc::clone(&pool);
        tokio::spawn(async move {
            janitor_pool.janitor().await;
        });

        pool
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    async fn user_workers(&self, user_id: Uuid) -> Arc<UserWorkers> {
        if let Some(existing) = self.workers.read().await.get(&user_id) {
            return Arc::clone(existing);
        }
        let mut map = self.workers.write().await;
        Arc::clone(
            map.entry(user_id)
                .or_insert_with(|| Arc::new(UserWorkers::new(self.config.max_workers))),
        )
    }

    /// Lease a worker session for `user_id`, blocking while the user is at
    /// capacity. Reuses a parked session when one is healthy, otherwise
    /// dials and authenticates a new one.
    pub async fn acquire_worker(
        &self,
        user_id: Uuid,
        endpoint: &ImapEndpoint,
    ) -> Result<WorkerGuard> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let workers = self.user_workers(user_id).await;
        let permit = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(Error::Cancelled),
            permit = Arc::clone(&workers.semaphore).acquire_owned() => {
                permit.map_err(|_| Error::Cancelled)?
            }
        };

        // Prefer a parked session; probe it when it has been idle long
        // enough that the server may have dropped it.
        loop {
            let candidate = {
                let mut idle = workers.idle.lock().await;
                idle.pop()
            };
            let Some(worker) = candidate else { break };

            if worker.last_used.elapsed() >= self.config.health_check_threshold {
                if let Err(e) = worker.session.noop().await {
                    debug!("discarding stale worker session for {}: {}", user_id, e);
                    continue;
                }
            }
            return Ok(WorkerGuard {
                session: Some(worker.session),
                user_id,
                workers,
                _permit: permit,
            });
        }

        let session = self.factory.worker(endpoint).await.map_err(Error::from)?;
        debug!("dialed new worker session for user {}", user_id);

        Ok(WorkerGuard {
            session: Some(session),
            user_id,
            workers,
            _permit: permit,
        })
    }

    /// Lock the user's listener slot, creating and authenticating the
    /// session if the slot is empty. The guard holds the slot until dropped;
    /// set it to `None` to discard a broken listener.
    pub async fn acquire_listener(
        &self,
        user_id: Uuid,
        endpoint: &ImapEndpoint,
    ) -> Result<OwnedMutexGuard<Option<ListenerSession>>> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let slot = {
            if let Some(existing) = self.listeners.read().await.get(&user_id) {
                Arc::clone(existing)
            } else {
                let mut map = self.listeners.write().await;
                Arc::clone(
                    map.entry(user_id)
                        .or_insert_with(|| Arc::new(TokioMutex::new(None))),
                )
            }
        };

        let mut guard = slot.lock_owned().await;
        if guard.is_none() {
            let session = self.factory.listener(endpoint).await.map_err(Error::from)?;
            info!("listener session established for user {}", user_id);
            *guard = Some(session);
        }
        Ok(guard)
    }

    /// Discard every session for the user. Used when credentials change.
    pub async fn invalidate(&self, user_id: Uuid) {
        let workers = self.workers.write().await.remove(&user_id);
        if let Some(workers) = workers {
            let mut idle = workers.idle.lock().await;
            for worker in idle.drain(..) {
                let session = worker.session;
                tokio::spawn(async move {
                    let _ = session.logout().await;
                });
            }
        }

        let listener = self.listeners.write().await.remove(&user_id);
        if let Some(slot) = listener {
            if let Ok(mut guard) = slot.try_lock() {
                if let Some(mut session) = guard.take() {
                    tokio::spawn(async move {
                        let _ = session.logout().await;
                    });
                }
            }
            // A locked slot belongs to a running listener loop; it will fail
            // on its next cycle and re-authenticate with fresh credentials.
        }
        info!("invalidated sessions for user {}", user_id);
    }

    /// Retire worker sessions idle past `worker_idle_timeout`.
    async fn janitor(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.janitor_interval) => {}
            }
            self.retire_idle_workers().await;
        }
        debug!("pool janitor stopped");
    }

    async fn retire_idle_workers(&self) {
        let user_pools: Vec<(Uuid, Arc<UserWorkers>)> = {
            let map = self.workers.read().await;
            map.iter().map(|(id, w)| (*id, Arc::clone(w))).collect()
        };

        for (user_id, workers) in user_pools {
            let mut retired = Vec::new();
            {
                let mut idle = workers.idle.lock().await;
                let mut keep = Vec::with_capacity(idle.len());
                for worker in idle.drain(..) {
                    if worker.last_used.elapsed() >= self.config.worker_idle_timeout {
                        retired.push(worker.session);
                    } else {
                        keep.push(worker);
                    }
                }
                *idle = keep;
            }
            for session in retired {
                debug!("janitor retiring idle worker session for user {}", user_id);
                let _ = session.logout().await;
            }
        }
    }

    /// Log out every parked session. In-flight guards finish on their own;
    /// their sessions are dropped on return because acquisition is refused
    /// after shutdown.
    pub async fn shutdown(&self) {
        info!("shutting down connection pool");
        self.shutdown.cancel();

        let worker_map = {
            let mut map = self.workers.write().await;
            map.drain().collect::<Vec<_>>()
        };
        for (_, workers) in worker_map {
            let mut idle = workers.idle.lock().await;
            for worker in idle.drain(..) {
                let _ = worker.session.logout().await;
            }
        }

        let listener_map = {
            let mut map = self.listeners.write().await;
            map.drain().collect::<Vec<_>>()
        };
        for (_, slot) in listener_map {
            if let Ok(mut guard) = slot.try_lock() {
                if let Some(mut session) = guard.take() {
                    let _ = session.logout().await;
                }
            }
        }
        info!("connection pool shutdown complete");
    }

    /// Parked (unlocked) worker sessions for a user. Diagnostic.
    pub async fn idle_worker_count(&self, user_id: Uuid) -> usize {
        match self.workers.read().await.get(&user_id) {
            Some(workers) => workers.idle.lock().await.len(),
            None => 0,
        }
    }

    /// Free capacity slots for a user; `max_workers` when nothing is leased.
    pub async fn available_worker_slots(&self, user_id: Uuid) -> usize {
        match self.workers.read().await.get(&user_id) {
            Some(workers) => workers.semaphore.available_permits(),
            None => self.config.max_workers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imap::session::MockMailSession;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Hands out mock sessions and counts dials; optionally fails the first
    /// `noop_failures` health probes across its sessions.
    struct MockFactory {
        dials: AtomicUsize,
        noop_fails: Arc<AtomicUsize>,
    }

    impl MockFactory {
        fn new() -> Self {
            Self {
                dials: AtomicUsize::new(0),
                noop_fails: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn with_failing_probes(count: usize) -> Self {
            let factory = Self::new();
            factory.noop_fails.store(count, Ordering::SeqCst);
            factory
        }

        fn dial_count(&self) -> usize {
            self.dials.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SessionFactory for MockFactory {
        async fn worker(
            &self,
            _endpoint: &ImapEndpoint,
        ) -> std::result::Result<Arc<dyn MailSession>, ImapError> {
            self.dials.fetch_add(1, Ordering::SeqCst);

            let mut session = MockMailSession::new();
            let fails = Arc::clone(&self.noop_fails);
            session.expect_noop().returning(move || {
                if fails
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    Err(ImapError::Connection("probe failed".to_string()))
                } else {
                    Ok(())
                }
            });
            session.expect_logout().returning(|| Ok(()));
            Ok(Arc::new(session))
        }

        async fn listener(
            &self,
            _endpoint: &ImapEndpoint,
        ) -> std::result::Result<ListenerSession, ImapError> {
            Err(ImapError::Connection("no listener in tests".to_string()))
        }
    }

    struct FailingFactory;

    #[async_trait]
    impl SessionFactory for FailingFactory {
        async fn worker(
            &self,
            _endpoint: &ImapEndpoint,
        ) -> std::result::Result<Arc<dyn MailSession>, ImapError> {
            Err(ImapError::Connection("dial refused".to_string()))
        }

        async fn listener(
            &self,
            _endpoint: &ImapEndpoint,
        ) -> std::result::Result<ListenerSession, ImapError> {
            Err(ImapError::Connection("dial refused".to_string()))
        }
    }

    fn endpoint() -> ImapEndpoint {
        ImapEndpoint {
            host: "imap.example.com".to_string(),
            port: 993,
            username: "alice".to_string(),
            password: "secret".to_string(),
        }
    }

    fn pool_with(
        factory: Arc<dyn SessionFactory>,
        max_workers: usize,
        health_threshold: Duration,
    ) -> Arc<ConnectionPool> {
        let config = PoolConfig {
            max_workers,
            health_check_threshold: health_threshold,
            ..PoolConfig::default()
        };
        ConnectionPool::new(config, factory, CancellationToken::new())
    }

    async fn let_parking_settle() {
        // Guard drops park their session on a spawned task.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn capacity_is_bounded_per_user() {
        let factory = Arc::new(MockFactory::new());
        let pool = pool_with(factory, 2, Duration::from_secs(60));
        let user = Uuid::new_v4();

        let first = pool.acquire_worker(user, &endpoint()).await.unwrap();
        let _second = pool.acquire_worker(user, &endpoint()).await.unwrap();
        assert_eq!(pool.available_worker_slots(user).await, 0);

        // At capacity: a third acquisition must block.
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), pool.acquire_worker(user, &endpoint()))
                .await;
        assert!(blocked.is_err(), "third acquire should block at capacity");

        drop(first);
        let third = tokio::time::timeout(
            Duration::from_millis(500),
            pool.acquire_worker(user, &endpoint()),
        )
        .await;
        assert!(third.is_ok_and(|r| r.is_ok()), "slot frees on guard drop");
    }

    #[tokio::test]
    async fn parked_sessions_are_reused() {
        let factory = Arc::new(MockFactory::new());
        let pool = pool_with(Arc::clone(&factory) as Arc<dyn SessionFactory>, 3, Duration::from_secs(60));
        let user = Uuid::new_v4();

        let guard = pool.acquire_worker(user, &endpoint()).await.unwrap();
        drop(guard);
        let_parking_settle().await;
        assert_eq!(pool.idle_worker_count(user).await, 1);

        let _guard = pool.acquire_worker(user, &endpoint()).await.unwrap();
        assert_eq!(factory.dial_count(), 1, "parked session reused, no new dial");
    }

    #[tokio::test]
    async fn stale_parked_sessions_are_probed_and_replaced() {
        // Zero threshold: every reuse is probed; the first probe fails.
        let factory = Arc::new(MockFactory::with_failing_probes(1));
        let pool = pool_with(
            Arc::clone(&factory) as Arc<dyn SessionFactory>,
            3,
            Duration::from_secs(0),
        );
        let user = Uuid::new_v4();

        drop(pool.acquire_worker(user, &endpoint()).await.unwrap());
        let_parking_settle().await;

        let _guard = pool.acquire_worker(user, &endpoint()).await.unwrap();
        assert_eq!(
            factory.dial_count(),
            2,
            "failed probe discards the session and dials fresh"
        );
    }

    #[tokio::test]
    async fn dial_failure_maps_to_connect_failed_and_frees_capacity() {
        let pool = pool_with(Arc::new(FailingFactory), 1, Duration::from_secs(60));
        let user = Uuid::new_v4();

        for _ in 0..3 {
            let err = pool.acquire_worker(user, &endpoint()).await.unwrap_err();
            assert!(matches!(err, Error::ConnectFailed(_)), "got {:?}", err);
        }
        assert_eq!(pool.available_worker_slots(user).await, 1);
    }

    #[tokio::test]
    async fn janitor_retires_idle_sessions() {
        let factory = Arc::new(MockFactory::new());
        let pool = pool_with(Arc::clone(&factory) as Arc<dyn SessionFactory>, 3, Duration::from_secs(60));
        let user = Uuid::new_v4();

        drop(pool.acquire_worker(user, &endpoint()).await.unwrap());
        let_parking_settle().await;
        assert_eq!(pool.idle_worker_count(user).await, 1);

        // Zero idle timeout: one sweep retires the parked session.
        let sweeper = ConnectionPool {
            workers: RwLock::new(HashMap::new()),
            listeners: RwLock::new(HashMap::new()),
            factory: Arc::clone(&factory) as Arc<dyn SessionFactory>,
            config: PoolConfig {
                worker_idle_timeout: Duration::from_secs(0),
                ..PoolConfig::default()
            },
            shutdown: CancellationToken::new(),
        };
        // Move the user's worker set into the sweeper and run a sweep.
        {
            let parked = pool.workers.read().await.get(&user).cloned().unwrap();
            sweeper.workers.write().await.insert(user, parked);
        }
        sweeper.retire_idle_workers().await;
        assert_eq!(pool.idle_worker_count(user).await, 0);
    }

    #[tokio::test]
    async fn invalidate_drops_parked_sessions() {
        let factory = Arc::new(MockFactory::new());
        let pool = pool_with(Arc::clone(&factory) as Arc<dyn SessionFactory>, 3, Duration::from_secs(60));
        let user = Uuid::new_v4();

        drop(pool.acquire_worker(user, &endpoint()).await.unwrap());
        let_parking_settle().await;
        assert_eq!(pool.idle_worker_count(user).await, 1);

        pool.invalidate(user).await;
        assert_eq!(pool.idle_worker_count(user).await, 0);

        // The next acquisition dials fresh.
        let _guard = pool.acquire_worker(user, &endpoint()).await.unwrap();
        assert_eq!(factory.dial_count(), 2);
    }

    #[tokio::test]
    async fn shutdown_refuses_new_acquisitions() {
        let pool = pool_with(Arc::new(MockFactory::new()), 2, Duration::from_secs(60));
        pool.shutdown().await;

        let err = pool
            .acquire_worker(Uuid::new_v4(), &endpoint())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
