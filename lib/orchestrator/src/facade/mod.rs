// SPDX-License-Identifier: Apache-2.0

//! Session lifecycle coordinator.
//!
//! Single entry point for everything the batch scheduler's prolog/epilog
//! hooks do to a session. Every operation observes the same discipline:
//!
//! ```text
//! acquire session_mutex(session_name)
//!   read-modify-write session state
//!   post action (if any)
//! release session_mutex
//! wait for response (if an action was posted)
//! ```
//!
//! The session mutex is always taken before the pool-wide allocation mutex,
//! never the reverse; the agents take only the session mutex, so this
//! ordering cannot deadlock against them. The mutex is released *before* the
//! response wait so the target agent can claim it.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio_util::sync::CancellationToken;

use crate::allocator;
use crate::datamodel::{
    PoolInfo, Session, SessionActionType, SessionName, SessionState,
};
use crate::error::{OrchestratorError, Result};
use crate::registry::{
    ActionResponse, AllocationRegistry, PoolRegistry, SessionActions, SessionRegistry,
};

/// The session lifecycle facade.
///
/// Holds the four registry ports; cheap to clone.
#[derive(Clone)]
pub struct SessionLifecycle {
    sessions: Arc<dyn SessionRegistry>,
    pools: Arc<dyn PoolRegistry>,
    allocations: Arc<dyn AllocationRegistry>,
    actions: Arc<dyn SessionActions>,
}

impl SessionLifecycle {
    pub fn new(
        sessions: Arc<dyn SessionRegistry>,
        pools: Arc<dyn PoolRegistry>,
        allocations: Arc<dyn AllocationRegistry>,
        actions: Arc<dyn SessionActions>,
    ) -> Self {
        Self {
            sessions,
            pools,
            allocations,
            actions,
        }
    }

    /// Admit a new session: validate, allocate bricks, persist the record,
    /// and direct the primary brick host to stage the filesystem.
    ///
    /// A request for zero bytes registers a valid no-op session: no bricks,
    /// no action dispatch.
    pub async fn create_session(&self, ctx: &CancellationToken, session: Session) -> Result<()> {
        self.validate_session(&session).await?;
        let name = session.name.clone();

        let mut session_mutex = self
            .sessions
            .session_mutex(&name)
            .await
            .map_err(|e| e.wrap("create", &name))?;
        session_mutex.lock(ctx).await.map_err(|e| e.wrap("create", &name))?;

        let session = match self.do_session_allocation(ctx, session).await {
            Ok(session) => session,
            Err(e) => {
                let _ = session_mutex.unlock(ctx).await;
                return Err(e);
            }
        };

        if session.actual_size_bytes == 0 {
            tracing::info!(session = %name, "created zero-capacity session");
            return session_mutex.unlock(ctx).await;
        }

        tracing::info!(
            session = %name,
            size_bytes = session.actual_size_bytes,
            primary = ?session.primary_host(),
            "dispatching volume creation"
        );
        let response = self.actions.create_session_volume(ctx, &name).await;

        // Drop the mutex so the brick host can take it, then look at the
        // dispatch result.
        session_mutex.unlock(ctx).await?;
        let response = response.map_err(|e| e.wrap("create", &name))?;
        self.await_response(ctx, response, SessionActionType::CreateVolume, &name)
            .await?;
        self.advance_state(ctx, &name, SessionState::VolumeCreated).await
    }

    /// Allocate bricks and persist the initial session record.
    ///
    /// The allocation mutex is held across the whole pick→record→persist
    /// critical section and is not released until a failed persist has been
    /// compensated, so no brick can leak out of the free inventory.
    async fn do_session_allocation(
        &self,
        ctx: &CancellationToken,
        mut session: Session,
    ) -> Result<Session> {
        if session.volume_request.total_capacity_bytes == 0 {
            // No bricks to allocate; just register the record.
            let name = session.name.clone();
            return self
                .sessions
                .create(session)
                .await
                .map_err(|e| e.wrap("create", &name));
        }

        let name = session.name.clone();
        let mut allocation_mutex = self
            .allocations
            .allocation_mutex()
            .await
            .map_err(|e| e.wrap("create", &name))?;
        allocation_mutex.lock(ctx).await.map_err(|e| e.wrap("create", &name))?;

        let result = self.allocate_and_persist(&mut session).await;

        // Even on failure (including cancellation mid-way) the compensation
        // inside allocate_and_persist has already run; only now is it safe
        // to let other allocators in.
        let unlock = allocation_mutex.unlock(ctx).await;
        let session = result?;
        unlock?;
        Ok(session)
    }

    async fn allocate_and_persist(&self, session: &mut Session) -> Result<Session> {
        let name = session.name.clone();
        let pool_name = session.volume_request.pool.clone();
        let pool_info = self
            .allocations
            .pool_info(&pool_name)
            .await
            .map_err(|e| e.wrap("allocate", &name))?;

        // Fresh local source per invocation; tests reach the allocator
        // directly with a seeded rng.
        let mut rng = StdRng::from_entropy();
        let (actual_size_bytes, bricks) =
            allocator::pick_bricks(&pool_info, session.volume_request.total_capacity_bytes, &mut rng)
                .map_err(|e| e.wrap("allocate", &name))?;

        let allocations = self
            .allocations
            .create_allocations(&name, bricks)
            .await
            .map_err(|e| e.wrap("allocate", &name))?;

        session.actual_size_bytes = actual_size_bytes;
        session.allocations = allocations;
        session.status.state = SessionState::BricksAllocated;

        match self.sessions.create(session.clone()).await {
            Ok(stored) => Ok(stored),
            Err(e) => {
                // Compensate: the written allocations must not outlive the
                // failed persist. The original error is what the caller sees.
                if let Err(cleanup) = self
                    .allocations
                    .delete_allocations(&session.allocations)
                    .await
                {
                    tracing::error!(
                        session = %name,
                        error = %cleanup,
                        "failed to clean up allocations after persist failure"
                    );
                }
                Err(e.wrap("create", &name))
            }
        }
    }

    async fn validate_session(&self, session: &Session) -> Result<()> {
        if session.name.is_empty() {
            return Err(OrchestratorError::invalid_session(
                &session.name,
                "empty session name",
            ));
        }
        let pool_name = &session.volume_request.pool;
        match self.pools.pool(pool_name).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(OrchestratorError::invalid_session(
                &session.name,
                format!("unable to find pool {pool_name}"),
            )),
            Err(e) => Err(e.wrap("validate", &session.name)),
        }
    }

    /// Tear the session down and release its bricks.
    ///
    /// Idempotent: deleting an unknown session succeeds. With `hurry` set
    /// the agent skips the data copy-out before teardown.
    pub async fn delete_session(
        &self,
        ctx: &CancellationToken,
        name: &SessionName,
        hurry: bool,
    ) -> Result<()> {
        let mut session_mutex = self
            .sessions
            .session_mutex(name)
            .await
            .map_err(|e| e.wrap("delete", name))?;
        session_mutex.lock(ctx).await.map_err(|e| e.wrap("delete", name))?;

        let Some(session) = self
            .sessions
            .get(name)
            .await
            .map_err(|e| e.wrap("delete", name))?
        else {
            tracing::debug!(session = %name, "delete of unknown session");
            return session_mutex.unlock(ctx).await;
        };

        // Record the intent first. The flag is sticky so an offline host's
        // sessions can be reaped when it comes back.
        let session = match self
            .update_status(session, |s| {
                s.status.delete_requested = true;
                s.status.delete_skip_copy_data_out = hurry;
                s.status.state = SessionState::DeleteRequested;
            })
            .await
        {
            Ok(session) => session,
            Err(e) => {
                let _ = session_mutex.unlock(ctx).await;
                return Err(e.wrap("delete", name));
            }
        };

        if session.actual_size_bytes == 0 {
            // Nothing was ever staged on a brick host.
            let result = self.finalize_delete(ctx, &session).await;
            session_mutex.unlock(ctx).await?;
            return result;
        }

        let response = self
            .actions
            .send_session_action(ctx, SessionActionType::Delete, &session)
            .await;
        session_mutex.unlock(ctx).await?;
        let response = response.map_err(|e| e.wrap("delete", name))?;
        self.await_response(ctx, response, SessionActionType::Delete, name)
            .await?;

        self.finalize_delete(ctx, &session).await
    }

    /// Return the bricks to their pool and hard-delete the record.
    ///
    /// The record passes through `BricksDeallocated` and `Deleted` before it
    /// disappears, so watchers observe the full chain.
    async fn finalize_delete(&self, ctx: &CancellationToken, session: &Session) -> Result<()> {
        let mut session = session.clone();
        if !session.allocations.is_empty() {
            let mut allocation_mutex = self
                .allocations
                .allocation_mutex()
                .await
                .map_err(|e| e.wrap("delete", &session.name))?;
            allocation_mutex
                .lock(ctx)
                .await
                .map_err(|e| e.wrap("delete", &session.name))?;
            let result = self
                .allocations
                .delete_allocations(&session.allocations)
                .await;
            let unlock = allocation_mutex.unlock(ctx).await;
            result.map_err(|e| e.wrap("delete", &session.name))?;
            unlock?;

            let session_name = session.name.clone();
            session = self
                .update_status(session, |s| {
                    s.status.state = SessionState::BricksDeallocated;
                })
                .await
                .map_err(|e| e.wrap("delete", &session_name))?;
        }

        let name = session.name.clone();
        self.update_status(session, |s| s.status.state = SessionState::Deleted)
            .await
            .map_err(|e| e.wrap("delete", &name))?;
        self.sessions
            .delete(&name)
            .await
            .map_err(|e| e.wrap("delete", &name))?;
        tracing::info!(session = %name, "session deleted");
        Ok(())
    }

    pub async fn mount(&self, ctx: &CancellationToken, name: &SessionName) -> Result<()> {
        self.run_session_action(ctx, name, SessionActionType::Mount).await
    }

    pub async fn unmount(&self, ctx: &CancellationToken, name: &SessionName) -> Result<()> {
        self.run_session_action(ctx, name, SessionActionType::Unmount).await
    }

    pub async fn copy_data_in(&self, ctx: &CancellationToken, name: &SessionName) -> Result<()> {
        self.run_session_action(ctx, name, SessionActionType::CopyIn).await
    }

    pub async fn copy_data_out(&self, ctx: &CancellationToken, name: &SessionName) -> Result<()> {
        self.run_session_action(ctx, name, SessionActionType::CopyOut).await
    }

    /// Shared read-dispatch-await path for the agent-executed operations.
    async fn run_session_action(
        &self,
        ctx: &CancellationToken,
        name: &SessionName,
        action: SessionActionType,
    ) -> Result<()> {
        let op = action.to_string();
        let mut session_mutex = self
            .sessions
            .session_mutex(name)
            .await
            .map_err(|e| e.wrap(&op, name))?;
        session_mutex
            .lock(ctx)
            .await
            .map_err(|e| e.wrap(&op, name))?;

        let session = match self.sessions.get(name).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                let _ = session_mutex.unlock(ctx).await;
                return Err(OrchestratorError::invalid_session(name, "unknown session"));
            }
            Err(e) => {
                let _ = session_mutex.unlock(ctx).await;
                return Err(e.wrap(&op, name));
            }
        };

        if session.actual_size_bytes == 0 {
            // Zero-capacity sessions have no filesystem; nothing to ask an
            // agent to do.
            tracing::debug!(session = %name, action = %action, "skipping for zero-capacity session");
            return session_mutex.unlock(ctx).await;
        }

        let response = self.actions.send_session_action(ctx, action, &session).await;
        session_mutex.unlock(ctx).await?;
        let response = response.map_err(|e| e.wrap(&op, name))?;
        self.await_response(ctx, response, action, name).await?;

        match action {
            SessionActionType::Mount => {
                self.advance_state(ctx, name, SessionState::Mounted).await
            }
            SessionActionType::Unmount => {
                self.advance_state(ctx, name, SessionState::Unmounted).await
            }
            _ => Ok(()),
        }
    }

    /// Persist a state transition acknowledged by the agent, under the
    /// session mutex like every other read-modify-write.
    async fn advance_state(
        &self,
        ctx: &CancellationToken,
        name: &SessionName,
        state: SessionState,
    ) -> Result<()> {
        let mut session_mutex = self
            .sessions
            .session_mutex(name)
            .await
            .map_err(|e| e.wrap("advance", name))?;
        session_mutex.lock(ctx).await.map_err(|e| e.wrap("advance", name))?;

        let result = match self.sessions.get(name).await {
            Ok(Some(session)) => self
                .update_status(session, |s| s.status.state = state)
                .await
                .map(|_| ()),
            // Reaped concurrently; nothing left to advance.
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };
        let unlock = session_mutex.unlock(ctx).await;
        result.map_err(|e| e.wrap("advance", name))?;
        unlock
    }

    pub async fn get_session(&self, name: &SessionName) -> Result<Session> {
        self.sessions
            .get(name)
            .await
            .map_err(|e| e.wrap("get", name))?
            .ok_or_else(|| OrchestratorError::invalid_session(name, "unknown session"))
    }

    pub async fn get_all_sessions(&self) -> Result<Vec<Session>> {
        self.sessions.get_all().await
    }

    pub async fn get_pools(&self) -> Result<Vec<PoolInfo>> {
        let pools = self.pools.pools().await?;
        let mut infos = Vec::with_capacity(pools.len());
        for pool in pools {
            infos.push(self.allocations.pool_info(&pool.name).await?);
        }
        Ok(infos)
    }

    /// Optimistic update with a single refresh-and-retry on `Conflict`; all
    /// other errors surface immediately.
    async fn update_status(
        &self,
        mut session: Session,
        apply: impl Fn(&mut Session),
    ) -> Result<Session> {
        apply(&mut session);
        match self.sessions.update(session.clone()).await {
            Err(e) if e.is_conflict() => {
                let mut fresh = self
                    .sessions
                    .get(&session.name)
                    .await?
                    .ok_or_else(|| OrchestratorError::conflict(&session.name))?;
                apply(&mut fresh);
                self.sessions.update(fresh).await
            }
            result => result,
        }
    }

    /// Wait for the agent's single response envelope, bounded by the
    /// caller's context. An agent error is surfaced verbatim.
    async fn await_response(
        &self,
        ctx: &CancellationToken,
        response: ActionResponse,
        action: SessionActionType,
        name: &SessionName,
    ) -> Result<()> {
        let envelope = tokio::select! {
            envelope = response => envelope.map_err(|_| {
                OrchestratorError::registry(anyhow::anyhow!(
                    "response channel closed before {action} completed"
                ))
            })?,
            _ = ctx.cancelled() => return Err(OrchestratorError::cancelled()),
        };
        match envelope.error {
            Some(message) => Err(OrchestratorError::agent_failure(name, action, message)),
            None => {
                tracing::debug!(session = %name, action = %action, "agent acknowledged");
                Ok(())
            }
        }
    }
}

