// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{Allocation, BrickHostName, PoolName, SessionName};

/// Filesystem flavour staged on the allocated bricks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsType {
    Lustre,
    #[serde(rename = "beegfs")]
    BeeGFS,
}

impl fmt::Display for FsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsType::Lustre => write!(f, "lustre"),
            FsType::BeeGFS => write!(f, "beegfs"),
        }
    }
}

/// What the batch job asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRequest {
    pub pool: PoolName,
    pub total_capacity_bytes: u64,
    pub fs_type: FsType,
}

/// Where a session sits in its lifecycle.
///
/// `Registered → BricksAllocated → VolumeCreated → Mounted ↔ Unmounted →
/// DeleteRequested → BricksDeallocated → Deleted`. The facade drives every
/// transition, persisting it once the owning agent acknowledges the action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Registered,
    BricksAllocated,
    VolumeCreated,
    Mounted,
    Unmounted,
    DeleteRequested,
    BricksDeallocated,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Sticky: once set it survives restarts, so an offline host's sessions
    /// can be reaped when the host returns.
    pub delete_requested: bool,
    pub delete_skip_copy_data_out: bool,
    /// Last agent-reported error, if any.
    pub error: Option<String>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: SessionState::Registered,
            delete_requested: false,
            delete_skip_copy_data_out: false,
            error: None,
        }
    }
}

/// The job-scoped logical volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Unique, non-empty.
    pub name: SessionName,
    pub volume_request: VolumeRequest,
    /// Granularity-rounded size. Zero for a no-op session that never
    /// allocates bricks.
    pub actual_size_bytes: u64,
    /// Ordered; position 0 designates the primary brick host.
    pub allocations: Vec<Allocation>,
    pub status: SessionStatus,
    /// Owner revision token returned by the registry for optimistic
    /// concurrency. Zero means the record was never persisted.
    #[serde(default)]
    pub revision: i64,
}

impl Session {
    pub fn new(name: impl Into<SessionName>, volume_request: VolumeRequest) -> Self {
        Self {
            name: name.into(),
            volume_request,
            actual_size_bytes: 0,
            allocations: Vec::new(),
            status: SessionStatus::default(),
            revision: 0,
        }
    }

    /// Host owning allocation position 0, the target of all lifecycle
    /// actions.
    pub fn primary_host(&self) -> Option<&BrickHostName> {
        self.allocations.first().map(|a| &a.brick.host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datamodel::Brick;

    #[test]
    fn primary_host_follows_first_allocation() {
        let mut session = Session::new(
            "job1",
            VolumeRequest {
                pool: "nvme".into(),
                total_capacity_bytes: 1024,
                fs_type: FsType::Lustre,
            },
        );
        assert!(session.primary_host().is_none());

        session.allocations = vec![
            Allocation {
                session: "job1".into(),
                brick: Brick::new("dac2", "nvme3n1", "nvme"),
                index: 0,
            },
            Allocation {
                session: "job1".into(),
                brick: Brick::new("dac1", "nvme1n1", "nvme"),
                index: 1,
            },
        ];
        assert_eq!(session.primary_host(), Some(&"dac2".into()));
    }

    #[test]
    fn fs_type_wire_names() {
        assert_eq!(serde_json::to_string(&FsType::Lustre).unwrap(), "\"lustre\"");
        assert_eq!(serde_json::to_string(&FsType::BeeGFS).unwrap(), "\"beegfs\"");
    }
}
