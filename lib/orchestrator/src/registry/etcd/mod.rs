// SPDX-License-Identifier: Apache-2.0

//! etcd registry adapter.
//!
//! Session and allocation records are JSON values under the key layout in
//! [`super::keys`]. Record creation and optimistic updates use transactions
//! comparing key versions, registry mutexes use the etcd lock RPC under a
//! short-lived lease, and host liveness is the presence of a leased
//! `hosts/<host>/register` key maintained by the brick-host agent. The action
//! mailbox posts request envelopes and watches the matching response key.

use std::sync::Arc;

use async_trait::async_trait;
use etcd_client::{Compare, CompareOp, EventType, GetOptions, LockOptions, Txn, TxnOp};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::{
    keys, ActionResponse, AllocationRegistry, DistributedMutex, PoolRegistry, SessionActions,
    SessionRegistry, LOCK_ACQUIRE_TIMEOUT,
};
use crate::config::RegistryConfig;
use crate::datamodel::{
    Allocation, Brick, BrickHostName, Pool, PoolInfo, PoolName, Session, SessionAction,
    SessionActionType, SessionName,
};
use crate::error::{OrchestratorError, Result};

mod connector;
pub use connector::Connector;

/// TTL of the lease backing a registry mutex, so a crashed holder cannot
/// wedge the cluster.
const MUTEX_LEASE_TTL_SECS: i64 = 30;

/// etcd implementation of all four registry ports.
#[derive(Clone)]
pub struct EtcdRegistry {
    connector: Arc<Connector>,
}

impl EtcdRegistry {
    pub async fn connect(config: &RegistryConfig) -> Result<Self> {
        let connector = Connector::new(config)
            .await
            .map_err(OrchestratorError::registry)?;
        Ok(Self { connector })
    }

    pub fn from_connector(connector: Arc<Connector>) -> Self {
        Self { connector }
    }

    fn client(&self) -> etcd_client::Client {
        self.connector.client()
    }

    async fn mutex(&self, name: String) -> Result<Box<dyn DistributedMutex>> {
        Ok(Box::new(EtcdMutex {
            client: self.client(),
            name,
            held: None,
        }))
    }

    async fn host_is_live(&self, session: &Session) -> Result<BrickHostName> {
        let host = session.primary_host().cloned().ok_or_else(|| {
            OrchestratorError::invalid_session(&session.name, "no primary brick host")
        })?;
        let mut kv = self.client().kv_client();
        let resp = kv
            .get(keys::host_register(&host), None)
            .await
            .map_err(registry_err)?;
        match resp.kvs().first() {
            Some(entry) if entry.lease() != 0 => Ok(host),
            _ => Err(OrchestratorError::host_unreachable(&host)),
        }
    }

    /// Post an action envelope to the primary brick host's mailbox and start
    /// a watch task that forwards the single response. The watch is armed
    /// before the request is posted, so a fast agent cannot race it.
    async fn dispatch(
        &self,
        ctx: &CancellationToken,
        action: SessionActionType,
        session: &Session,
    ) -> Result<ActionResponse> {
        let host = self.host_is_live(session).await?;
        let request = SessionAction::request(action, session.name.clone(), session.revision);
        let response_key = keys::action_response(&host, &session.name, &request.correlation);
        let action_key = keys::action(&host, &session.name, &request.correlation);

        let mut watch_client = self.client().watch_client();
        let (watcher, mut stream) = watch_client
            .watch(response_key.as_str(), None)
            .await
            .map_err(registry_err)?;

        let mut kv = self.client().kv_client();
        let payload = serde_json::to_vec(&request)
            .map_err(|e| OrchestratorError::registry(e.into()))?;
        kv.put(action_key, payload, None).await.map_err(registry_err)?;

        let (tx, rx) = oneshot::channel();
        let ctx = ctx.clone();
        let mut response_kv = self.client().kv_client();
        tokio::spawn(async move {
            // Keep the watcher alive for the duration of the wait.
            let _watcher = watcher;
            loop {
                tokio::select! {
                    // Cancellation stops the wait but leaves the posted
                    // action in place; the agent may still process it and
                    // the late response is dropped with the sender.
                    _ = ctx.cancelled() => return,
                    message = stream.message() => {
                        let response = match message {
                            Ok(Some(response)) => response,
                            _ => return,
                        };
                        for event in response.events() {
                            if event.event_type() != EventType::Put {
                                continue;
                            }
                            let Some(entry) = event.kv() else { continue };
                            let envelope: SessionAction =
                                match serde_json::from_slice(entry.value()) {
                                    Ok(envelope) => envelope,
                                    Err(e) => {
                                        tracing::warn!(error = %e, "undecodable action response");
                                        continue;
                                    }
                                };
                            // The response is consumed exactly once.
                            let _ = response_kv.delete(response_key.as_str(), None).await;
                            let _ = tx.send(envelope);
                            return;
                        }
                    }
                }
            }
        });
        Ok(rx)
    }
}

/// A mutex backed by the etcd lock RPC. The lock key lives under a
/// short-lived lease so that a crashed holder releases it automatically.
struct EtcdMutex {
    client: etcd_client::Client,
    name: String,
    /// `(lease id, lock ownership key)` while held.
    held: Option<(i64, Vec<u8>)>,
}

#[async_trait]
impl DistributedMutex for EtcdMutex {
    async fn lock(&mut self, ctx: &CancellationToken) -> Result<()> {
        if self.held.is_some() {
            return Err(OrchestratorError::registry(anyhow::anyhow!(
                "mutex {} already held by this handle",
                self.name
            )));
        }
        let lease = self
            .client
            .lease_client()
            .grant(MUTEX_LEASE_TTL_SECS, None)
            .await
            .map_err(registry_err)?;
        let mut lock_client = self.client.lock_client();
        let options = LockOptions::new().with_lease(lease.id());
        tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                // Drop the lease so a lock granted after we stopped waiting
                // expires on its own.
                let _ = self.client.lease_client().revoke(lease.id()).await;
                Err(OrchestratorError::cancelled())
            }
            acquired = tokio::time::timeout(
                LOCK_ACQUIRE_TIMEOUT,
                lock_client.lock(self.name.as_str(), Some(options)),
            ) => {
                match acquired {
                    Ok(response) => {
                        let response = response.map_err(registry_err)?;
                        self.held = Some((lease.id(), response.key().to_vec()));
                        Ok(())
                    }
                    Err(_) => {
                        let _ = self.client.lease_client().revoke(lease.id()).await;
                        Err(OrchestratorError::lock_timeout(&self.name))
                    }
                }
            }
        }
    }

    async fn unlock(&mut self, _ctx: &CancellationToken) -> Result<()> {
        let Some((lease, key)) = self.held.take() else {
            return Ok(());
        };
        self.client
            .lock_client()
            .unlock(key)
            .await
            .map_err(registry_err)?;
        let _ = self.client.lease_client().revoke(lease).await;
        Ok(())
    }
}

#[async_trait]
impl SessionRegistry for EtcdRegistry {
    async fn session_mutex(&self, name: &SessionName) -> Result<Box<dyn DistributedMutex>> {
        self.mutex(keys::session_mutex(name)).await
    }

    async fn create(&self, mut session: Session) -> Result<Session> {
        let key = keys::session(&session.name);
        let payload = encode(&session)?;
        let txn = Txn::new()
            .when(vec![Compare::version(key.as_str(), CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(key.as_str(), payload, None)]);
        let resp = self.client().kv_client().txn(txn).await.map_err(registry_err)?;
        if !resp.succeeded() {
            return Err(OrchestratorError::conflict(&session.name));
        }
        session.revision = resp.header().map(|h| h.revision()).unwrap_or_default();
        Ok(session)
    }

    async fn update(&self, mut session: Session) -> Result<Session> {
        let key = keys::session(&session.name);
        let payload = encode(&session)?;
        let txn = Txn::new()
            .when(vec![Compare::mod_revision(
                key.as_str(),
                CompareOp::Equal,
                session.revision,
            )])
            .and_then(vec![TxnOp::put(key.as_str(), payload, None)]);
        let resp = self.client().kv_client().txn(txn).await.map_err(registry_err)?;
        if !resp.succeeded() {
            return Err(OrchestratorError::conflict(&session.name));
        }
        session.revision = resp.header().map(|h| h.revision()).unwrap_or_default();
        Ok(session)
    }

    async fn get(&self, name: &SessionName) -> Result<Option<Session>> {
        let resp = self
            .client()
            .kv_client()
            .get(keys::session(name), None)
            .await
            .map_err(registry_err)?;
        match resp.kvs().first() {
            Some(entry) => {
                let mut session: Session = decode(entry.value())?;
                session.revision = entry.mod_revision();
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    async fn get_all(&self) -> Result<Vec<Session>> {
        let resp = self
            .client()
            .kv_client()
            .get(keys::SESSIONS_PREFIX, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(registry_err)?;
        let mut sessions = Vec::with_capacity(resp.kvs().len());
        for entry in resp.kvs() {
            let mut session: Session = decode(entry.value())?;
            session.revision = entry.mod_revision();
            sessions.push(session);
        }
        Ok(sessions)
    }

    async fn delete(&self, name: &SessionName) -> Result<()> {
        self.client()
            .kv_client()
            .delete(keys::session(name), None)
            .await
            .map_err(registry_err)?;
        Ok(())
    }
}

#[async_trait]
impl PoolRegistry for EtcdRegistry {
    async fn pool(&self, name: &PoolName) -> Result<Option<Pool>> {
        let mut kv = self.client().kv_client();
        let resp = kv
            .get(keys::pool(name), None)
            .await
            .map_err(registry_err)?;
        let Some(entry) = resp.kvs().first() else {
            return Ok(None);
        };
        let mut pool: Pool = decode(entry.value())?;

        let bricks = kv
            .get(
                keys::pool_bricks(name),
                Some(GetOptions::new().with_prefix()),
            )
            .await
            .map_err(registry_err)?;
        pool.available_bricks = bricks
            .kvs()
            .iter()
            .map(|entry| decode(entry.value()))
            .collect::<Result<_>>()?;
        Ok(Some(pool))
    }

    async fn pools(&self) -> Result<Vec<Pool>> {
        let resp = self
            .client()
            .kv_client()
            .get(keys::POOLS_PREFIX, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(registry_err)?;
        let mut pools = Vec::new();
        for entry in resp.kvs() {
            let key = entry.key_str().map_err(registry_err)?;
            if !key.ends_with("/record") {
                continue;
            }
            let record: Pool = decode(entry.value())?;
            if let Some(pool) = self.pool(&record.name).await? {
                pools.push(pool);
            }
        }
        pools.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(pools)
    }
}

#[async_trait]
impl AllocationRegistry for EtcdRegistry {
    async fn allocation_mutex(&self) -> Result<Box<dyn DistributedMutex>> {
        self.mutex(keys::ALLOCATION_MUTEX.to_string()).await
    }

    async fn pool_info(&self, name: &PoolName) -> Result<PoolInfo> {
        let pool = self.pool(name).await?.ok_or_else(|| {
            OrchestratorError::new(
                crate::error::ErrorKind::InvalidSession,
                format!("pool {name} not found"),
            )
        })?;
        let resp = self
            .client()
            .kv_client()
            .get(
                keys::ALLOCATIONS_PREFIX,
                Some(GetOptions::new().with_prefix()),
            )
            .await
            .map_err(registry_err)?;
        let mut allocated = Vec::new();
        for entry in resp.kvs() {
            let allocation: Allocation = decode(entry.value())?;
            if allocation.brick.pool == *name {
                allocated.push(allocation);
            }
        }
        Ok(PoolInfo { pool, allocated })
    }

    async fn create_allocations(
        &self,
        session: &SessionName,
        bricks: Vec<Brick>,
    ) -> Result<Vec<Allocation>> {
        let mut allocations = Vec::with_capacity(bricks.len());
        let mut ops = Vec::with_capacity(bricks.len() * 2);
        for (index, brick) in bricks.into_iter().enumerate() {
            let allocation = Allocation {
                session: session.clone(),
                brick,
                index: index as u32,
            };
            ops.push(TxnOp::put(
                keys::allocation(session, allocation.index),
                encode(&allocation)?,
                None,
            ));
            ops.push(TxnOp::delete(
                keys::pool_brick(
                    &allocation.brick.pool,
                    &allocation.brick.host,
                    &allocation.brick.device,
                ),
                None,
            ));
            allocations.push(allocation);
        }
        self.client()
            .kv_client()
            .txn(Txn::new().and_then(ops))
            .await
            .map_err(registry_err)?;
        Ok(allocations)
    }

    async fn delete_allocations(&self, allocations: &[Allocation]) -> Result<()> {
        let mut ops = Vec::with_capacity(allocations.len() * 2);
        for allocation in allocations {
            ops.push(TxnOp::delete(
                keys::allocation(&allocation.session, allocation.index),
                None,
            ));
            ops.push(TxnOp::put(
                keys::pool_brick(
                    &allocation.brick.pool,
                    &allocation.brick.host,
                    &allocation.brick.device,
                ),
                encode(&allocation.brick)?,
                None,
            ));
        }
        self.client()
            .kv_client()
            .txn(Txn::new().and_then(ops))
            .await
            .map_err(registry_err)?;
        Ok(())
    }
}

#[async_trait]
impl SessionActions for EtcdRegistry {
    async fn create_session_volume(
        &self,
        ctx: &CancellationToken,
        session: &SessionName,
    ) -> Result<ActionResponse> {
        let stored = self
            .get(session)
            .await?
            .ok_or_else(|| OrchestratorError::invalid_session(session, "unknown session"))?;
        self.dispatch(ctx, SessionActionType::CreateVolume, &stored).await
    }

    async fn send_session_action(
        &self,
        ctx: &CancellationToken,
        action: SessionActionType,
        session: &Session,
    ) -> Result<ActionResponse> {
        self.dispatch(ctx, action, session).await
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| OrchestratorError::registry(e.into()))
}

fn decode<T: serde::de::DeserializeOwned>(value: &[u8]) -> Result<T> {
    serde_json::from_slice(value).map_err(|e| OrchestratorError::registry(e.into()))
}

fn registry_err(err: impl Into<anyhow::Error>) -> OrchestratorError {
    OrchestratorError::registry(err.into())
}
