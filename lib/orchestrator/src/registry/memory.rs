// SPDX-License-Identifier: Apache-2.0

//! In-memory registry adapter.
//!
//! Satisfies the same contracts as the etcd adapter, for tests and
//! single-process development. Registry mutexes are backed by per-name
//! `tokio::sync::Mutex` cells, the action mailbox by an in-process queue with
//! an optional scripted agent. The scripted agent takes the session mutex
//! before answering, so tests exercise the same release-before-await
//! discipline the real brick-host agents rely on.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex as StateMutex, RwLock};
use tokio::sync::{oneshot, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use super::{
    keys, ActionResponse, AllocationRegistry, DistributedMutex, PoolRegistry, SessionActions,
    SessionRegistry, LOCK_ACQUIRE_TIMEOUT,
};
use crate::datamodel::{
    Allocation, Brick, Pool, PoolInfo, PoolName, BrickHostName, Session, SessionAction,
    SessionActionType, SessionName,
};
use crate::error::{ErrorKind, OrchestratorError, Result};

/// Scripted agent behaviour: given the request envelope, return the error to
/// report, or `None` for success.
pub type AgentScript = dyn Fn(&SessionAction) -> Option<String> + Send + Sync;

#[derive(Default)]
struct Inner {
    sessions: RwLock<HashMap<SessionName, Session>>,
    pools: RwLock<HashMap<PoolName, Pool>>,
    allocations: RwLock<HashMap<SessionName, Vec<Allocation>>>,
    live_hosts: RwLock<HashSet<BrickHostName>>,
    mutexes: StateMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    revision: AtomicI64,
    fail_next_session_create: AtomicBool,
    agent: RwLock<Option<Arc<AgentScript>>>,
    posted: StateMutex<Vec<SessionAction>>,
    pending: StateMutex<Vec<(SessionAction, oneshot::Sender<SessionAction>)>>,
}

impl Inner {
    fn mutex_cell(&self, name: &str) -> Arc<AsyncMutex<()>> {
        let mut mutexes = self.mutexes.lock();
        mutexes
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn next_revision(&self) -> i64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// In-memory implementation of all four registry ports.
#[derive(Clone, Default)]
pub struct MemoryRegistry {
    inner: Arc<Inner>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pool with its free bricks and mark every brick host live.
    pub fn add_pool(&self, name: impl Into<PoolName>, granularity_bytes: u64, bricks: Vec<Brick>) {
        let name = name.into();
        {
            let mut live = self.inner.live_hosts.write();
            for brick in &bricks {
                live.insert(brick.host.clone());
            }
        }
        self.inner.pools.write().insert(
            name.clone(),
            Pool {
                name,
                granularity_bytes,
                available_bricks: bricks,
            },
        );
    }

    pub fn set_host_live(&self, host: impl Into<BrickHostName>, live: bool) {
        let host = host.into();
        let mut hosts = self.inner.live_hosts.write();
        if live {
            hosts.insert(host);
        } else {
            hosts.remove(&host);
        }
    }

    /// Install the scripted agent used to answer dispatched actions.
    pub fn set_agent(
        &self,
        script: impl Fn(&SessionAction) -> Option<String> + Send + Sync + 'static,
    ) {
        *self.inner.agent.write() = Some(Arc::new(script));
    }

    /// Remove the scripted agent; later dispatches queue as pending.
    pub fn clear_agent(&self) {
        *self.inner.agent.write() = None;
    }

    /// Make the next `SessionRegistry::create` fail as if the registry were
    /// unavailable.
    pub fn fail_next_session_create(&self) {
        self.inner
            .fail_next_session_create
            .store(true, Ordering::SeqCst);
    }

    /// Every action envelope ever posted, in dispatch order.
    pub fn posted_actions(&self) -> Vec<SessionAction> {
        self.inner.posted.lock().clone()
    }

    /// Requests waiting for a manual response (no scripted agent installed).
    pub fn take_pending(&self) -> Vec<(SessionAction, oneshot::Sender<SessionAction>)> {
        std::mem::take(&mut self.inner.pending.lock())
    }

    /// Current free bricks of a pool, for conservation checks.
    pub fn free_bricks(&self, name: &PoolName) -> Vec<Brick> {
        self.inner
            .pools
            .read()
            .get(name)
            .map(|p| p.available_bricks.clone())
            .unwrap_or_default()
    }

    fn dispatch(
        &self,
        action: SessionActionType,
        session: &Session,
    ) -> Result<ActionResponse> {
        let host = session.primary_host().cloned().ok_or_else(|| {
            OrchestratorError::invalid_session(&session.name, "no primary brick host")
        })?;
        if !self.inner.live_hosts.read().contains(&host) {
            return Err(OrchestratorError::host_unreachable(&host));
        }

        let request = SessionAction::request(action, session.name.clone(), session.revision);
        let (tx, rx) = oneshot::channel();
        self.inner.posted.lock().push(request.clone());

        let script = self.inner.agent.read().clone();
        match script {
            Some(script) => {
                let inner = self.inner.clone();
                let mutex_name = keys::session_mutex(&session.name);
                tokio::spawn(async move {
                    // The agent claims the session mutex before working, so a
                    // coordinator that forgot to release it would deadlock
                    // here instead of passing silently.
                    let cell = inner.mutex_cell(&mutex_name);
                    let _guard = cell.lock().await;
                    let error = script(&request);
                    let _ = tx.send(request.into_response(error));
                });
            }
            None => self.inner.pending.lock().push((request, tx)),
        }
        Ok(rx)
    }
}

struct MemoryMutex {
    name: String,
    cell: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

#[async_trait]
impl DistributedMutex for MemoryMutex {
    async fn lock(&mut self, ctx: &CancellationToken) -> Result<()> {
        if self.guard.is_some() {
            return Err(OrchestratorError::new(
                ErrorKind::RegistryUnavailable,
                format!("mutex {} already held by this handle", self.name),
            ));
        }
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(OrchestratorError::cancelled()),
            acquired = tokio::time::timeout(LOCK_ACQUIRE_TIMEOUT, self.cell.clone().lock_owned()) => {
                match acquired {
                    Ok(guard) => {
                        self.guard = Some(guard);
                        Ok(())
                    }
                    Err(_) => Err(OrchestratorError::lock_timeout(&self.name)),
                }
            }
        }
    }

    async fn unlock(&mut self, _ctx: &CancellationToken) -> Result<()> {
        self.guard.take();
        Ok(())
    }
}

#[async_trait]
impl SessionRegistry for MemoryRegistry {
    async fn session_mutex(&self, name: &SessionName) -> Result<Box<dyn DistributedMutex>> {
        let mutex_name = keys::session_mutex(name);
        Ok(Box::new(MemoryMutex {
            cell: self.inner.mutex_cell(&mutex_name),
            name: mutex_name,
            guard: None,
        }))
    }

    async fn create(&self, mut session: Session) -> Result<Session> {
        if self
            .inner
            .fail_next_session_create
            .swap(false, Ordering::SeqCst)
        {
            return Err(OrchestratorError::new(
                ErrorKind::RegistryUnavailable,
                "injected registry failure",
            ));
        }
        let mut sessions = self.inner.sessions.write();
        if sessions.contains_key(&session.name) {
            return Err(OrchestratorError::conflict(&session.name));
        }
        session.revision = self.inner.next_revision();
        sessions.insert(session.name.clone(), session.clone());
        Ok(session)
    }

    async fn update(&self, mut session: Session) -> Result<Session> {
        let mut sessions = self.inner.sessions.write();
        match sessions.get(&session.name) {
            Some(stored) if stored.revision == session.revision => {
                session.revision = self.inner.next_revision();
                sessions.insert(session.name.clone(), session.clone());
                Ok(session)
            }
            _ => Err(OrchestratorError::conflict(&session.name)),
        }
    }

    async fn get(&self, name: &SessionName) -> Result<Option<Session>> {
        Ok(self.inner.sessions.read().get(name).cloned())
    }

    async fn get_all(&self) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> = self.inner.sessions.read().values().cloned().collect();
        sessions.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(sessions)
    }

    async fn delete(&self, name: &SessionName) -> Result<()> {
        self.inner.sessions.write().remove(name);
        Ok(())
    }
}

#[async_trait]
impl PoolRegistry for MemoryRegistry {
    async fn pool(&self, name: &PoolName) -> Result<Option<Pool>> {
        Ok(self.inner.pools.read().get(name).cloned())
    }

    async fn pools(&self) -> Result<Vec<Pool>> {
        let mut pools: Vec<Pool> = self.inner.pools.read().values().cloned().collect();
        pools.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(pools)
    }
}

#[async_trait]
impl AllocationRegistry for MemoryRegistry {
    async fn allocation_mutex(&self) -> Result<Box<dyn DistributedMutex>> {
        Ok(Box::new(MemoryMutex {
            cell: self.inner.mutex_cell(keys::ALLOCATION_MUTEX),
            name: keys::ALLOCATION_MUTEX.to_string(),
            guard: None,
        }))
    }

    async fn pool_info(&self, name: &PoolName) -> Result<PoolInfo> {
        let pool = self
            .inner
            .pools
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| {
                OrchestratorError::new(ErrorKind::InvalidSession, format!("pool {name} not found"))
            })?;
        let allocated = self
            .inner
            .allocations
            .read()
            .values()
            .flatten()
            .filter(|a| a.brick.pool == *name)
            .cloned()
            .collect();
        Ok(PoolInfo { pool, allocated })
    }

    async fn create_allocations(
        &self,
        session: &SessionName,
        bricks: Vec<Brick>,
    ) -> Result<Vec<Allocation>> {
        let mut pools = self.inner.pools.write();
        // A brick must be free in its pool to be bound; anything else is a
        // ledger inconsistency.
        for brick in &bricks {
            let pool = pools.get(&brick.pool).ok_or_else(|| {
                OrchestratorError::new(
                    ErrorKind::RegistryUnavailable,
                    format!("pool {} not found", brick.pool),
                )
            })?;
            if !pool.available_bricks.contains(brick) {
                return Err(OrchestratorError::new(
                    ErrorKind::RegistryUnavailable,
                    format!("brick {}:{} is not free", brick.host, brick.device),
                ));
            }
        }

        let mut created = Vec::with_capacity(bricks.len());
        for (index, brick) in bricks.into_iter().enumerate() {
            if let Some(pool) = pools.get_mut(&brick.pool) {
                pool.available_bricks.retain(|b| b != &brick);
            }
            created.push(Allocation {
                session: session.clone(),
                brick,
                index: index as u32,
            });
        }
        self.inner
            .allocations
            .write()
            .insert(session.clone(), created.clone());
        Ok(created)
    }

    async fn delete_allocations(&self, allocations: &[Allocation]) -> Result<()> {
        let mut pools = self.inner.pools.write();
        let mut stored = self.inner.allocations.write();
        for allocation in allocations {
            if let Some(list) = stored.get_mut(&allocation.session) {
                list.retain(|a| a.index != allocation.index);
                if list.is_empty() {
                    stored.remove(&allocation.session);
                }
            }
            if let Some(pool) = pools.get_mut(&allocation.brick.pool) {
                if !pool.available_bricks.contains(&allocation.brick) {
                    pool.available_bricks.push(allocation.brick.clone());
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SessionActions for MemoryRegistry {
    async fn create_session_volume(
        &self,
        _ctx: &CancellationToken,
        session: &SessionName,
    ) -> Result<ActionResponse> {
        let stored = self
            .inner
            .sessions
            .read()
            .get(session)
            .cloned()
            .ok_or_else(|| OrchestratorError::invalid_session(session, "unknown session"))?;
        self.dispatch(SessionActionType::CreateVolume, &stored)
    }

    async fn send_session_action(
        &self,
        _ctx: &CancellationToken,
        action: SessionActionType,
        session: &Session,
    ) -> Result<ActionResponse> {
        self.dispatch(action, session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datamodel::{FsType, VolumeRequest};

    fn request(pool: &str) -> VolumeRequest {
        VolumeRequest {
            pool: pool.into(),
            total_capacity_bytes: 0,
            fs_type: FsType::Lustre,
        }
    }

    #[tokio::test]
    async fn create_is_first_write_only() {
        let registry = MemoryRegistry::new();
        let session = Session::new("job1", request("nvme"));
        let stored = registry.create(session.clone()).await.unwrap();
        assert!(stored.revision > 0);

        let err = registry.create(session).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn update_rejects_stale_revision() {
        let registry = MemoryRegistry::new();
        let stored = registry
            .create(Session::new("job1", request("nvme")))
            .await
            .unwrap();

        let fresh = registry.update(stored.clone()).await.unwrap();
        assert!(fresh.revision > stored.revision);

        // The first handle now holds a stale revision.
        let err = registry.update(stored).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn session_mutex_is_exclusive() {
        let registry = MemoryRegistry::new();
        let name = SessionName::from("job1");
        let ctx = CancellationToken::new();

        let mut first = registry.session_mutex(&name).await.unwrap();
        first.lock(&ctx).await.unwrap();

        let mut second = registry.session_mutex(&name).await.unwrap();
        let contender = CancellationToken::new();
        contender.cancel();
        let err = second.lock(&contender).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);

        first.unlock(&ctx).await.unwrap();
        second.lock(&ctx).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn contended_mutex_times_out() {
        let registry = MemoryRegistry::new();
        let name = SessionName::from("job1");
        let ctx = CancellationToken::new();

        let mut holder = registry.session_mutex(&name).await.unwrap();
        holder.lock(&ctx).await.unwrap();

        // The clock is paused, so the acquisition deadline elapses without
        // a real 30s wait.
        let mut contender = registry.session_mutex(&name).await.unwrap();
        let err = contender.lock(&ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockTimeout);
    }

    #[tokio::test]
    async fn allocations_move_bricks_out_and_back() {
        let registry = MemoryRegistry::new();
        let bricks = vec![
            Brick::new("dac1", "nvme1n1", "nvme"),
            Brick::new("dac2", "nvme1n1", "nvme"),
        ];
        registry.add_pool("nvme", 1024, bricks.clone());

        let session = SessionName::from("job1");
        let allocations = registry
            .create_allocations(&session, bricks.clone())
            .await
            .unwrap();
        assert_eq!(allocations.len(), 2);
        assert_eq!(allocations[0].index, 0);
        assert!(registry.free_bricks(&"nvme".into()).is_empty());

        // Binding an already-bound brick is an inconsistency.
        let err = registry
            .create_allocations(&"job2".into(), bricks.clone())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RegistryUnavailable);

        registry.delete_allocations(&allocations).await.unwrap();
        let mut free = registry.free_bricks(&"nvme".into());
        free.sort_by(|a, b| a.host.cmp(&b.host));
        assert_eq!(free, bricks);
    }

    #[tokio::test]
    async fn dispatch_requires_live_host() {
        let registry = MemoryRegistry::new();
        registry.add_pool("nvme", 1024, vec![Brick::new("dac1", "nvme1n1", "nvme")]);

        let mut session = Session::new("job1", request("nvme"));
        session.allocations = vec![Allocation {
            session: "job1".into(),
            brick: Brick::new("dac1", "nvme1n1", "nvme"),
            index: 0,
        }];
        let ctx = CancellationToken::new();

        registry.set_host_live("dac1", false);
        let err = registry
            .send_session_action(&ctx, SessionActionType::Mount, &session)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HostUnreachable);

        registry.set_host_live("dac1", true);
        registry.set_agent(|_| None);
        let response = registry
            .send_session_action(&ctx, SessionActionType::Mount, &session)
            .await
            .unwrap();
        let envelope = response.await.unwrap();
        assert_eq!(envelope.action, SessionActionType::Mount);
        assert!(envelope.error.is_none());
    }
}
