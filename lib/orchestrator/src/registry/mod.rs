// SPDX-License-Identifier: Apache-2.0

//! Contracts the coordinator consumes from the distributed registry.
//!
//! The registry is the only synchronisation authority in the system: it
//! provides compare-and-swap record updates, session-scoped leases for host
//! liveness, context-bound mutexes, and watches. Two adapters satisfy these
//! contracts: [`memory::MemoryRegistry`] for tests and single-process
//! development, and [`etcd::EtcdRegistry`] for production.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::datamodel::{
    Allocation, Brick, Pool, PoolInfo, PoolName, Session, SessionAction, SessionActionType,
    SessionName,
};
use crate::error::Result;

pub mod etcd;
pub mod keys;
pub mod memory;

/// Upper bound on acquiring any registry mutex. A wedged lock surfaces as
/// `LockTimeout` instead of an unbounded wait; an explicit cancellation of
/// the caller's context surfaces as `Cancelled`.
pub const LOCK_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Single-shot channel carrying the agent's response to a dispatched action.
///
/// The sender side is dropped without a value if the registry loses the
/// watch; callers must bound their wait with the context they dispatched
/// under.
pub type ActionResponse = oneshot::Receiver<SessionAction>;

/// A registry-backed mutex. Acquisition and release are both fallible and
/// both honour the supplied cancellation context; no implicit unbounded
/// waits.
#[async_trait]
pub trait DistributedMutex: Send {
    async fn lock(&mut self, ctx: &CancellationToken) -> Result<()>;
    async fn unlock(&mut self, ctx: &CancellationToken) -> Result<()>;
}

/// Authoritative store of session records.
#[async_trait]
pub trait SessionRegistry: Send + Sync {
    /// Mutex scoped to one session name, serialising lifecycle operations
    /// against the agents.
    async fn session_mutex(&self, name: &SessionName) -> Result<Box<dyn DistributedMutex>>;

    /// First persist of a session record. Fails with `Conflict` if the
    /// record already exists. The returned session carries the stamped
    /// revision.
    async fn create(&self, session: Session) -> Result<Session>;

    /// Optimistic update; fails with `Conflict` when the stored revision no
    /// longer matches `session.revision`.
    async fn update(&self, session: Session) -> Result<Session>;

    async fn get(&self, name: &SessionName) -> Result<Option<Session>>;

    async fn get_all(&self) -> Result<Vec<Session>>;

    /// Hard-delete the record. Deleting an absent record is not an error.
    async fn delete(&self, name: &SessionName) -> Result<()>;
}

/// Read-only view of the configured pools.
#[async_trait]
pub trait PoolRegistry: Send + Sync {
    async fn pool(&self, name: &PoolName) -> Result<Option<Pool>>;
    async fn pools(&self) -> Result<Vec<Pool>>;
}

/// Brick ownership ledger. All mutations happen while the pool-wide
/// allocation mutex is held.
#[async_trait]
pub trait AllocationRegistry: Send + Sync {
    /// The pool-wide allocation mutex. Always acquired *after* the session
    /// mutex, never before it.
    async fn allocation_mutex(&self) -> Result<Box<dyn DistributedMutex>>;

    /// Pool plus its live allocations, the allocator's input.
    async fn pool_info(&self, name: &PoolName) -> Result<PoolInfo>;

    /// Bind the given bricks to a session, in order, removing them from the
    /// pool's free inventory. Position 0 of the result designates the
    /// primary brick host.
    async fn create_allocations(
        &self,
        session: &SessionName,
        bricks: Vec<Brick>,
    ) -> Result<Vec<Allocation>>;

    /// Release the given allocations and return their bricks to the pool's
    /// free inventory.
    async fn delete_allocations(&self, allocations: &[Allocation]) -> Result<()>;
}

/// Asynchronous mailbox towards the brick-host agents.
///
/// Dispatch posts an action envelope under the target session's primary
/// brick host and returns a channel that yields exactly one response
/// envelope. Dispatch fails with `HostUnreachable` when the host holds no
/// live lease. Cancelling the context stops the wait but does not retract a
/// posted action; a late response is dropped.
#[async_trait]
pub trait SessionActions: Send + Sync {
    async fn create_session_volume(
        &self,
        ctx: &CancellationToken,
        session: &SessionName,
    ) -> Result<ActionResponse>;

    async fn send_session_action(
        &self,
        ctx: &CancellationToken,
        action: SessionActionType,
        session: &Session,
    ) -> Result<ActionResponse>;
}
