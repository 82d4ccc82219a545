// SPDX-License-Identifier: Apache-2.0

//! Stash burst-buffer orchestrator.
//!
//! Provisions ephemeral parallel filesystems (Lustre or BeeGFS) over pools of
//! NVMe bricks attached to a fleet of storage hosts, bound to the lifecycle of
//! a batch job. The heart of the crate is the [`facade::SessionLifecycle`]
//! coordinator, which mediates three concurrent actors:
//!
//! 1. the client-side workflow invoked from scheduler prolog/epilog hooks,
//! 2. the distributed registry holding all authoritative state, and
//! 3. the brick-host agents that watch for work and report results.
//!
//! All synchronisation authority lives in the registry: per-session mutexes
//! serialise lifecycle operations, a pool-wide allocation mutex guards brick
//! selection, and an asynchronous mailbox carries actions to brick hosts.

pub mod allocator;
pub mod config;
pub mod datamodel;
pub mod error;
pub mod facade;
pub mod inventory;
pub mod logging;
pub mod registry;

pub use config::{FilesystemConfig, RegistryConfig};
pub use error::{ErrorKind, OrchestratorError, Result};
pub use facade::SessionLifecycle;
pub use tokio_util::sync::CancellationToken;
