// SPDX-License-Identifier: Apache-2.0

//! Typed records shared between the coordinator, the registry adapters, and
//! the brick-host agents.
//!
//! Cyclic references (session ↔ allocation ↔ brick) are modelled as indices
//! plus name lookups in the registry; records never hold owning back-pointers.

use std::fmt;

use serde::{Deserialize, Serialize};

mod action;
mod brick;
mod session;

pub use action::{SessionAction, SessionActionType};
pub use brick::{Allocation, Brick, Pool, PoolInfo};
pub use session::{FsType, Session, SessionState, SessionStatus, VolumeRequest};

/// Name of a session, matching the batch job it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionName(String);

impl SessionName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for SessionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for SessionName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Name of a pool of homogeneous bricks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoolName(String);

impl PoolName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PoolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PoolName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for PoolName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Hostname of a storage server carrying bricks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BrickHostName(String);

impl BrickHostName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BrickHostName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BrickHostName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for BrickHostName {
    fn from(name: String) -> Self {
        Self(name)
    }
}
