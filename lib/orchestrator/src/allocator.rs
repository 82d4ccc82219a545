// SPDX-License-Identifier: Apache-2.0

//! Brick selection.
//!
//! The allocator is stateless: each invocation takes a uniform random walk
//! over the pool's free bricks and keeps the first `bricks_required` distinct
//! ones. Randomised placement spreads sessions across hosts and devices
//! without maintaining any load state. The order of the returned vector
//! matters: it becomes the allocation positions, and position 0 decides the
//! primary brick host.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::datamodel::{Brick, PoolInfo};
use crate::error::{OrchestratorError, Result};

/// Select bricks from `pool_info` to satisfy `requested_bytes`.
///
/// Returns the granularity-rounded size and an ordered vector of exactly
/// `ceil(requested_bytes / granularity)` distinct free bricks. Fails with
/// `InsufficientCapacity` when the pool cannot supply that many.
///
/// The random source is supplied by the caller so tests can seed it; the
/// facade passes a fresh `StdRng` per invocation.
pub fn pick_bricks(
    pool_info: &PoolInfo,
    requested_bytes: u64,
    rng: &mut impl Rng,
) -> Result<(u64, Vec<Brick>)> {
    let pool = &pool_info.pool;
    let granularity = pool.granularity_bytes;
    debug_assert!(granularity > 0);

    let bricks_required = requested_bytes.div_ceil(granularity) as usize;
    let actual_size_bytes = bricks_required as u64 * granularity;

    let available = &pool.available_bricks;
    if bricks_required > available.len() {
        return Err(OrchestratorError::insufficient_capacity(
            &pool.name,
            bricks_required,
            available.len(),
        ));
    }

    let mut walk: Vec<usize> = (0..available.len()).collect();
    walk.shuffle(rng);

    let mut chosen: Vec<Brick> = Vec::with_capacity(bricks_required);
    for i in walk {
        let candidate = &available[i];
        // The permutation already guarantees distinctness; this guard stays
        // so a substituted selection policy cannot hand back duplicates.
        let good_candidate = !chosen
            .iter()
            .any(|b| b.host == candidate.host && b.device == candidate.device);
        if good_candidate {
            chosen.push(candidate.clone());
        }
        if chosen.len() >= bricks_required {
            break;
        }
    }

    if chosen.len() != bricks_required {
        return Err(OrchestratorError::insufficient_capacity(
            &pool.name,
            bricks_required,
            chosen.len(),
        ));
    }
    Ok((actual_size_bytes, chosen))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datamodel::Pool;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const GIB: u64 = 1 << 30;

    fn pool_of(n: usize, granularity: u64) -> PoolInfo {
        let bricks = (0..n)
            .map(|i| Brick::new(format!("dac{}", i / 4 + 1), format!("nvme{}n1", i % 4 + 1), "nvme"))
            .collect();
        PoolInfo {
            pool: Pool {
                name: "nvme".into(),
                granularity_bytes: granularity,
                available_bricks: bricks,
            },
            allocated: Vec::new(),
        }
    }

    #[test]
    fn rounds_up_to_granularity() {
        let pool = pool_of(8, 200 * GIB);
        let mut rng = StdRng::seed_from_u64(7);
        let (actual, bricks) = pick_bricks(&pool, 300 * GIB, &mut rng).unwrap();
        assert_eq!(actual, 400 * GIB);
        assert_eq!(bricks.len(), 2);
    }

    #[test]
    fn exact_multiple_is_not_rounded() {
        let pool = pool_of(8, 200 * GIB);
        let mut rng = StdRng::seed_from_u64(7);
        let (actual, bricks) = pick_bricks(&pool, 600 * GIB, &mut rng).unwrap();
        assert_eq!(actual, 600 * GIB);
        assert_eq!(bricks.len(), 3);
    }

    #[test]
    fn chosen_bricks_are_distinct() {
        let pool = pool_of(16, GIB);
        for seed in 0..32 {
            let mut rng = StdRng::seed_from_u64(seed);
            let (_, bricks) = pick_bricks(&pool, 12 * GIB, &mut rng).unwrap();
            let mut seen = std::collections::HashSet::new();
            for brick in &bricks {
                assert!(seen.insert((brick.host.clone(), brick.device.clone())));
            }
        }
    }

    #[test]
    fn insufficient_capacity_is_reported() {
        let pool = pool_of(2, 200 * GIB);
        let mut rng = StdRng::seed_from_u64(7);
        let err = pick_bricks(&pool, 1000 * GIB, &mut rng).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InsufficientCapacity);
    }

    #[test]
    fn seeded_walk_is_reproducible() {
        let pool = pool_of(12, GIB);
        let mut a = StdRng::seed_from_u64(99);
        let mut b = StdRng::seed_from_u64(99);
        let picked_a = pick_bricks(&pool, 5 * GIB, &mut a).unwrap();
        let picked_b = pick_bricks(&pool, 5 * GIB, &mut b).unwrap();
        assert_eq!(picked_a, picked_b);
    }

    #[test]
    fn zero_bytes_selects_nothing() {
        let pool = pool_of(4, GIB);
        let mut rng = StdRng::seed_from_u64(1);
        let (actual, bricks) = pick_bricks(&pool, 0, &mut rng).unwrap();
        assert_eq!(actual, 0);
        assert!(bricks.is_empty());
    }
}
