// SPDX-License-Identifier: Apache-2.0

//! Key layout shared by the registry adapters.
//!
//! Brick-host agents watch their own `hosts/<host>/actions/` prefix and the
//! coordinator watches `hosts/<host>/responses/`; both sides must agree on
//! these paths byte for byte.

use uuid::Uuid;

use crate::datamodel::{BrickHostName, PoolName, SessionName};

pub fn session(name: &SessionName) -> String {
    format!("sessions/{name}")
}

pub const SESSIONS_PREFIX: &str = "sessions/";

pub fn allocation(session: &SessionName, index: u32) -> String {
    format!("allocations/{session}/{index}")
}

pub const ALLOCATIONS_PREFIX: &str = "allocations/";

pub fn pool(name: &PoolName) -> String {
    format!("pools/{name}/record")
}

pub const POOLS_PREFIX: &str = "pools/";

pub fn pool_bricks(pool: &PoolName) -> String {
    format!("pools/{pool}/bricks/")
}

/// Free-brick marker; present while the brick sits in the pool's inventory.
pub fn pool_brick(pool: &PoolName, host: &BrickHostName, device: &str) -> String {
    format!("pools/{pool}/bricks/{host}/{device}")
}

/// Held under a live lease while the brick host is up.
pub fn host_register(host: &BrickHostName) -> String {
    format!("hosts/{host}/register")
}

pub fn action(host: &BrickHostName, session: &SessionName, correlation: &Uuid) -> String {
    format!("hosts/{host}/actions/{session}/{correlation}")
}

pub fn action_response(host: &BrickHostName, session: &SessionName, correlation: &Uuid) -> String {
    format!("hosts/{host}/responses/{session}/{correlation}")
}

pub fn session_mutex(name: &SessionName) -> String {
    format!("locks/sessions/{name}")
}

pub const ALLOCATION_MUTEX: &str = "locks/allocations";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mailbox_paths() {
        let host = BrickHostName::from("dac1");
        let session = SessionName::from("job7");
        let correlation = Uuid::nil();
        assert_eq!(
            action(&host, &session, &correlation),
            "hosts/dac1/actions/job7/00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(
            action_response(&host, &session, &correlation),
            "hosts/dac1/responses/job7/00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn record_paths() {
        assert_eq!(session(&"job7".into()), "sessions/job7");
        assert_eq!(allocation(&"job7".into(), 2), "allocations/job7/2");
        assert_eq!(
            pool_brick(&"nvme".into(), &"dac3".into(), "nvme2n1"),
            "pools/nvme/bricks/dac3/nvme2n1"
        );
    }
}
