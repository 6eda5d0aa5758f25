//! Mode Planner: picks seed-parallel or space-parallel execution and
//! partitions the work.

use crate::config::PlannerConfig;
use crate::slices::SeedSlice;
use crate::volume::LabelVolume;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

/// Parallelization strategy for one job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Every worker sees the whole region and a subset of the seed slices;
    /// per-label responses are summed.
    SeedParallel,
    /// Every worker owns a Z-block plus ghost planes; results are
    /// concatenated along Z.
    SpaceParallel,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::SeedParallel => write!(f, "seed-parallel"),
            Mode::SpaceParallel => write!(f, "space-parallel"),
        }
    }
}

/// Bytes of one f32 channel of the region
pub fn channel_bytes(shape: [usize; 3]) -> u128 {
    shape.iter().map(|&d| d as u128).product::<u128>() * 4
}

/// Seed-parallel only when all label channels and a single channel both
/// stay strictly below their limits.
pub fn select_mode(region_shape: [usize; 3], nol: usize, config: &PlannerConfig) -> Mode {
    let nbytes = channel_bytes(region_shape);
    if nbytes * (nol as u128) < config.total_bytes_limit as u128
        && nbytes < config.channel_bytes_limit as u128
    {
        Mode::SeedParallel
    } else {
        Mode::SpaceParallel
    }
}

/// Active workers in seed-parallel mode
pub fn seed_worker_count(groups: usize, world: usize) -> usize {
    groups.min(world).max(1)
}

/// Active workers in space-parallel mode
pub fn space_worker_count(dz: usize, world: usize, granularity: usize) -> usize {
    (dz / granularity.max(1)).min(world).max(1)
}

/// Deal `items` round-robin into `n` shards: shard `k` gets items
/// `k, k+n, k+2n, ...`.
pub fn split_indices<T: Clone>(items: &[T], n: usize) -> Vec<Vec<T>> {
    let n = n.max(1);
    let mut shards = vec![Vec::new(); n];
    for (i, item) in items.iter().enumerate() {
        shards[i % n].push(item.clone());
    }
    shards
}

/// Z-range owned by one space-parallel worker
///
/// `blockmin..blockmax` is the core the worker reports on;
/// `datablockmin..datablockmax` adds ghost planes clamped to the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub index: usize,
    pub blockmin: usize,
    pub blockmax: usize,
    pub datablockmin: usize,
    pub datablockmax: usize,
}

impl Block {
    /// Core range relative to the start of the ghosted block
    pub fn local_core(&self) -> (usize, usize) {
        (
            self.blockmin - self.datablockmin,
            self.blockmax - self.datablockmin,
        )
    }

    pub fn core_len(&self) -> usize {
        self.blockmax - self.blockmin
    }
}

/// Split `dz` planes into `n` blocks of `dz / n` planes; the last block
/// takes the remainder.
pub fn split_blocks(dz: usize, n: usize, ghost: usize) -> Vec<Block> {
    let n = n.max(1);
    let size = dz / n;
    (0..n)
        .map(|index| {
            let blockmin = index * size;
            let blockmax = if index + 1 == n { dz } else { (index + 1) * size };
            Block {
                index,
                blockmin,
                blockmax,
                datablockmin: blockmin.saturating_sub(ghost),
                datablockmax: (blockmax + ghost).min(dz),
            }
        })
        .collect()
}

/// Remove labels outside a block's core so ghost planes carry image context
/// only. Z-only jobs clear them to background, all-axis jobs mark them
/// erased (-1) so the other orientations do not seed from them either.
pub fn mask_ghost(labels: &mut LabelVolume, block: &Block, allaxis: bool) {
    let (core_lo, core_hi) = block.local_core();
    let fill = if allaxis { -1 } else { 0 };
    let plane = labels.plane_len();
    let dz = labels.shape()[0];
    for z in (0..core_lo).chain(core_hi.min(dz)..dz) {
        labels.data_mut()[z * plane..(z + 1) * plane].fill(fill);
    }
}

/// Work assignment for one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub mode: Mode,
    /// Active ranks `0..workers`
    pub workers: usize,
    /// Seed slices per worker (seed-parallel)
    pub seed_shards: Vec<Vec<SeedSlice>>,
    /// Z-blocks per worker (space-parallel)
    pub blocks: Vec<Block>,
}

impl Plan {
    pub fn build(
        region_shape: [usize; 3],
        nol: usize,
        slices: &[SeedSlice],
        world: usize,
        config: &PlannerConfig,
    ) -> Self {
        let mode = select_mode(region_shape, nol, config);
        let plan = match mode {
            Mode::SeedParallel => {
                let workers = seed_worker_count(slices.len(), world);
                Plan {
                    mode,
                    workers,
                    seed_shards: split_indices(slices, workers),
                    blocks: Vec::new(),
                }
            }
            Mode::SpaceParallel => {
                let workers =
                    space_worker_count(region_shape[0], world, config.block_granularity);
                Plan {
                    mode,
                    workers,
                    seed_shards: Vec::new(),
                    blocks: split_blocks(region_shape[0], workers, config.ghost),
                }
            }
        };
        info!(
            mode = %plan.mode,
            workers = plan.workers,
            world,
            region = ?region_shape,
            nol,
            "Execution plan selected"
        );
        plan
    }
}
