// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

use super::{BrickHostName, PoolName, SessionName};

/// A storage device on a brick host, the unit of allocation.
///
/// A brick is either free in its pool's inventory or bound to exactly one
/// allocation, never both and never neither.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Brick {
    pub host: BrickHostName,
    /// Device identifier on the host, e.g. `nvme1n1`.
    pub device: String,
    pub pool: PoolName,
    /// Capacity in granularity units. Always 1 with current hardware, but the
    /// protocol permits larger bricks.
    pub capacity_units: u64,
}

impl Brick {
    pub fn new(host: impl Into<BrickHostName>, device: impl Into<String>, pool: impl Into<PoolName>) -> Self {
        Self {
            host: host.into(),
            device: device.into(),
            pool: pool.into(),
            capacity_units: 1,
        }
    }
}

/// A named set of homogeneous bricks offered as a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub name: PoolName,
    /// Minimum allocatable unit in bytes; every allocation is an integral
    /// multiple.
    pub granularity_bytes: u64,
    /// Bricks currently free. Unique by `(host, device)`.
    pub available_bricks: Vec<Brick>,
}

/// A pool together with its live allocations, for capacity reporting and for
/// the allocator's view of the world.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolInfo {
    pub pool: Pool,
    pub allocated: Vec<Allocation>,
}

/// The binding of one brick to one session at an ordered position.
///
/// Positions within a session form a contiguous `[0..N)` sequence; the
/// allocation at position 0 designates the primary brick host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub session: SessionName,
    pub brick: Brick,
    pub index: u32,
}
