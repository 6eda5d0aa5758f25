//! Diffusion Worker: runs one shard through the kernel.
//!
//! Every active rank, the coordinator included, does `prepare → mask → walk
//! → package` exactly once per job. Seed-parallel shards come back as float
//! response maps for summation; space-parallel shards are reduced to label
//! blocks on the worker and trimmed to the core.

use crate::aggregate::{BlockResult, ResultStatus};
use crate::device::DeviceHandle;
use crate::dispatch::WorkerJob;
use crate::errors::{EngineError, Result};
use crate::kernel::{DiffusionKernel, Feature, WalkOutput, WalkRequest};
use crate::planner::{mask_ghost, Block, Mode, Plan};
use crate::postprocess::{derive, uncertainty_to_u8, MemoryBudget};
use crate::slices::{labeled_slices, SeedSlice};
use crate::transport::{
    check_chunkable, recv_array, send_array, send_value, Group, MessageKind, Stream, Tag,
};
use crate::volume::{Array3, ElementType, LabelVolume, VolumeData};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Description of one worker's share of the region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardSpec {
    /// Seed slices to walk from (seed-parallel)
    pub seeds: Vec<SeedSlice>,
    /// Z-block with ghost planes (space-parallel)
    pub block: Option<Block>,
    /// Offset of the shard inside the region
    pub origin: [usize; 3],
    /// Element type of the image stream that follows
    pub image: ElementType,
}

/// A shard with its data
#[derive(Debug, Clone)]
pub struct Shard {
    pub spec: ShardSpec,
    pub image: VolumeData,
    /// Dense labels, unmasked
    pub labels: LabelVolume,
}

/// Cut `rank`'s shard out of the region-cropped image and dense labels
pub fn cut_shard(plan: &Plan, rank: usize, image: &VolumeData, labels: &LabelVolume) -> Result<Shard> {
    match plan.mode {
        Mode::SeedParallel => {
            let seeds = plan.seed_shards.get(rank).cloned().ok_or_else(|| {
                EngineError::Execution(format!("no seed shard for rank {}", rank))
            })?;
            Ok(Shard {
                spec: ShardSpec {
                    seeds,
                    block: None,
                    origin: [0, 0, 0],
                    image: image.element(),
                },
                image: image.clone(),
                labels: labels.clone(),
            })
        }
        Mode::SpaceParallel => {
            let block = plan.blocks.get(rank).copied().ok_or_else(|| {
                EngineError::Execution(format!("no block for rank {}", rank))
            })?;
            Ok(Shard {
                spec: ShardSpec {
                    seeds: Vec::new(),
                    block: Some(block),
                    origin: [block.datablockmin, 0, 0],
                    image: image.element(),
                },
                image: image.slab(block.datablockmin, block.datablockmax)?,
                labels: labels.slab(block.datablockmin, block.datablockmax)?,
            })
        }
    }
}

/// First message of a shard handoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ShardNotice {
    Assigned(ShardSpec),
    /// Distribution failed; report a failed status instead of walking
    Withdrawn,
}

/// Send a shard to member `dest`.
///
/// Nothing is sent when the shard cannot be chunked under `max_elements`,
/// so the member is still waiting for a notice.
pub async fn send_shard(group: &Group, dest: usize, shard: &Shard, max_elements: usize) -> Result<()> {
    check_chunkable(shard.image.shape(), max_elements)?;
    check_chunkable(shard.labels.shape(), max_elements)?;

    let comm = group.comm();
    let notice = ShardNotice::Assigned(shard.spec.clone());
    send_value(comm, dest, Tag::new(MessageKind::ShardSpec), &notice).await?;
    match &shard.image {
        VolumeData::U8(a) => send_array(comm, dest, Stream::Image, 0, a, max_elements).await?,
        VolumeData::F32(a) => send_array(comm, dest, Stream::Image, 0, a, max_elements).await?,
    }
    send_array(comm, dest, Stream::Labels, 0, &shard.labels, max_elements).await?;
    debug!(dest, shape = ?shard.labels.shape(), "Shard sent");
    Ok(())
}

/// Tell member `dest` that no shard is coming
pub async fn withdraw_shard(group: &Group, dest: usize) -> Result<()> {
    send_value(
        group.comm(),
        dest,
        Tag::new(MessageKind::ShardSpec),
        &ShardNotice::Withdrawn,
    )
    .await
}

/// Receive this member's shard from the root; `None` if it was withdrawn
pub async fn recv_shard(group: &Group) -> Result<Option<Shard>> {
    let comm = group.comm();
    let spec = match group.recv_from_root(Tag::new(MessageKind::ShardSpec)).await? {
        ShardNotice::Assigned(spec) => spec,
        ShardNotice::Withdrawn => return Ok(None),
    };
    let image = match spec.image {
        ElementType::U8 => VolumeData::U8(recv_array(comm, 0, Stream::Image, 0).await?),
        ElementType::F32 => VolumeData::F32(recv_array(comm, 0, Stream::Image, 0).await?),
        other => {
            return Err(EngineError::Protocol(format!(
                "image stream of {:?} is not supported",
                other
            )))
        }
    };
    let labels: LabelVolume = recv_array(comm, 0, Stream::Labels, 0).await?;
    if labels.shape() != image.shape() {
        return Err(EngineError::Shape(format!(
            "shard labels {:?} do not match image {:?}",
            labels.shape(),
            image.shape()
        )));
    }
    Ok(Some(Shard { spec, image, labels }))
}

/// What a shard produced
#[derive(Debug, Clone)]
pub enum ShardResult {
    /// Per-channel response maps over the whole region
    Responses {
        responses: Vec<Array3<f32>>,
        degraded: Vec<Feature>,
    },
    /// Dense label block over the core
    Block {
        block: BlockResult,
        degraded: Vec<Feature>,
    },
    /// The kernel's core working set did not fit the device
    OutOfMemory,
}

impl ShardResult {
    pub fn status(&self, rank: usize) -> ResultStatus {
        match self {
            ShardResult::OutOfMemory => ResultStatus::out_of_memory(rank),
            ShardResult::Responses { degraded, .. } | ShardResult::Block { degraded, .. } => {
                ResultStatus {
                    degraded: degraded.clone(),
                    ..ResultStatus::ok(rank)
                }
            }
        }
    }
}

/// Turn a shard into the kernel request: image to f32, ghost labels
/// masked, seeds re-read from the masked block in space-parallel mode.
pub fn prepare(job: &WorkerJob, shard: Shard) -> WalkRequest {
    let image = shard.image.to_f32();
    let mut labels = shard.labels;
    let (seeds, on_device) = match shard.spec.block {
        Some(block) => {
            mask_ghost(&mut labels, &block, job.allaxis);
            (labeled_slices(&labels, job.allaxis), true)
        }
        None => (shard.spec.seeds, false),
    };
    WalkRequest {
        image,
        labels,
        seeds,
        nol: job.nol,
        nbrw: job.nbrw,
        sorw: job.sorw,
        origin: shard.spec.origin,
        // seed-parallel maps are partial sums; features come after reduction
        uncertainty: on_device && job.uncertainty,
        smooth: if on_device { job.smooth } else { 0 },
    }
}

/// Run one shard on `device`. The kernel runs on a blocking thread.
#[instrument(skip_all, fields(rank = device.rank(), mode = %job.mode))]
pub async fn run_shard(
    kernel: Arc<dyn DiffusionKernel>,
    device: Arc<DeviceHandle>,
    job: &WorkerJob,
    shard: Shard,
) -> Result<ShardResult> {
    let block = shard.spec.block;
    let request = prepare(job, shard);
    info!(
        kernel = kernel.name(),
        voxels = request.voxels(),
        seeds = request.seeds.len(),
        "Running diffusion"
    );

    let dev = device.clone();
    let (request, output) = tokio::task::spawn_blocking(move || {
        let output = kernel.walk(&request, &dev);
        (request, output)
    })
    .await
    .map_err(|e| EngineError::Execution(format!("diffusion task failed: {}", e)))?;
    let output = output?;

    if output.memory_exhausted {
        warn!("Out of device memory for the walk");
        return Ok(ShardResult::OutOfMemory);
    }
    if output.responses.len() != job.nol {
        return Err(EngineError::Execution(format!(
            "kernel returned {} response maps for {} labels",
            output.responses.len(),
            job.nol
        )));
    }

    match block {
        None => Ok(ShardResult::Responses {
            responses: output.responses,
            degraded: output.degraded,
        }),
        Some(block) => package_block(job, &block, &request, output, &device),
    }
}

/// Label a ghosted block and trim it to the core
fn package_block(
    job: &WorkerJob,
    block: &Block,
    request: &WalkRequest,
    output: WalkOutput,
    device: &DeviceHandle,
) -> Result<ShardResult> {
    let budget = MemoryBudget::new(device.memory_bytes());
    let kernel_dropped = |f: Feature| output.degraded.contains(&f);

    let want_uncertainty =
        job.uncertainty && output.uncertainty.is_none() && !kernel_dropped(Feature::Uncertainty);
    let smooth = if output.smoothed.is_none() && !kernel_dropped(Feature::Smoothing) {
        job.smooth
    } else {
        0
    };

    let derived = derive(
        &output.responses,
        Some((&request.labels, &request.seeds)),
        want_uncertainty,
        smooth,
        &budget,
    )?;

    let uncertainty = match output.uncertainty {
        Some(ref u) if job.uncertainty => Some(uncertainty_to_u8(u)),
        _ => derived.uncertainty,
    };
    let smoothed = match output.smoothed {
        Some(s) if job.smooth > 0 => Some(s),
        _ => derived.smoothed,
    };

    let mut degraded = output.degraded;
    for f in derived.degraded {
        if !degraded.contains(&f) {
            degraded.push(f);
        }
    }

    let (lo, hi) = block.local_core();
    let trim = |a: Array3<u8>| a.slab(lo, hi);
    let result = BlockResult {
        segmentation: Some(trim(derived.segmentation)?),
        uncertainty: uncertainty.map(trim).transpose()?,
        smoothed: smoothed.map(trim).transpose()?,
    };
    debug!(block = block.index, core = block.core_len(), ?degraded, "Block packaged");
    Ok(ShardResult::Block { block: result, degraded })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{bind, Backend, StaticDevices};
    use crate::kernel::ReferenceWalk;
    use crate::planner::split_blocks;
    use crate::slices::Orientation;

    fn device(memory: u64) -> Arc<DeviceHandle> {
        let provider = StaticDevices::new().with(Backend::OpenclCpu, 1, memory);
        Arc::new(bind(&provider, Backend::OpenclCpu, 0).unwrap())
    }

    fn job(mode: Mode) -> WorkerJob {
        WorkerJob {
            backend: Backend::OpenclCpu,
            mode,
            nbrw: 2,
            sorw: 5,
            allaxis: false,
            nol: 3,
            uncertainty: true,
            smooth: 0,
            max_chunk_elements: 64,
        }
    }

    fn volume() -> (VolumeData, LabelVolume) {
        let image = VolumeData::U8(Array3::filled([20, 6, 6], 50));
        let mut labels = Array3::zeros([20, 6, 6]);
        labels.set(4, 2, 2, 1);
        labels.set(15, 3, 3, 2);
        (image, labels)
    }

    fn seed_plan() -> Plan {
        Plan {
            mode: Mode::SeedParallel,
            workers: 2,
            seed_shards: vec![
                vec![SeedSlice::new(Orientation::Z, 4)],
                vec![SeedSlice::new(Orientation::Z, 15)],
            ],
            blocks: Vec::new(),
        }
    }

    fn space_plan() -> Plan {
        Plan {
            mode: Mode::SpaceParallel,
            workers: 2,
            seed_shards: Vec::new(),
            blocks: split_blocks(20, 2, 6),
        }
    }

    // ============== Shard Tests ==============

    #[test]
    fn test_cut_seed_shard() {
        let (image, labels) = volume();
        let shard = cut_shard(&seed_plan(), 1, &image, &labels).unwrap();
        assert_eq!(shard.spec.seeds, vec![SeedSlice::new(Orientation::Z, 15)]);
        assert_eq!(shard.image.shape(), [20, 6, 6]);
        assert!(cut_shard(&seed_plan(), 2, &image, &labels).is_err());
    }

    #[test]
    fn test_cut_space_shard() {
        let (image, labels) = volume();
        let shard = cut_shard(&space_plan(), 1, &image, &labels).unwrap();
        let block = shard.spec.block.unwrap();
        assert_eq!((block.datablockmin, block.datablockmax), (4, 20));
        assert_eq!(shard.spec.origin, [4, 0, 0]);
        assert_eq!(shard.labels.shape(), [16, 6, 6]);
        assert_eq!(shard.labels.get(0, 2, 2), 1);
    }

    #[test]
    fn test_prepare_masks_ghost_and_rereads_seeds() {
        let (image, labels) = volume();
        let shard = cut_shard(&space_plan(), 1, &image, &labels).unwrap();
        let request = prepare(&job(Mode::SpaceParallel), shard);
        // label at global z=4 sits in this block's ghost
        assert_eq!(request.labels.get(0, 2, 2), 0);
        assert_eq!(request.seeds, vec![SeedSlice::new(Orientation::Z, 11)]);
        assert!(request.uncertainty);
    }

    #[test]
    fn test_prepare_seed_shard_defers_features() {
        let (image, labels) = volume();
        let shard = cut_shard(&seed_plan(), 0, &image, &labels).unwrap();
        let request = prepare(&job(Mode::SeedParallel), shard);
        assert!(!request.uncertainty);
        assert_eq!(request.smooth, 0);
        assert_eq!(request.seeds.len(), 1);
    }

    // ============== Run Tests ==============

    #[tokio::test]
    async fn test_run_seed_shard_returns_responses() {
        let (image, labels) = volume();
        let shard = cut_shard(&seed_plan(), 0, &image, &labels).unwrap();
        let result = run_shard(
            Arc::new(ReferenceWalk::default()),
            device(1 << 30),
            &job(Mode::SeedParallel),
            shard,
        )
        .await
        .unwrap();

        match result {
            ShardResult::Responses { responses, degraded } => {
                assert_eq!(responses.len(), 3);
                assert!(responses[1].data().iter().sum::<f32>() > 0.0);
                assert_eq!(responses[2].data().iter().sum::<f32>(), 0.0);
                assert!(degraded.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_space_shard_trims_to_core() {
        let (image, labels) = volume();
        let plan = space_plan();
        let shard = cut_shard(&plan, 1, &image, &labels).unwrap();
        let result = run_shard(
            Arc::new(ReferenceWalk::default()),
            device(1 << 30),
            &job(Mode::SpaceParallel),
            shard,
        )
        .await
        .unwrap();

        match result {
            ShardResult::Block { block, .. } => {
                let seg = block.segmentation.unwrap();
                assert_eq!(seg.shape(), [plan.blocks[1].core_len(), 6, 6]);
                // seed at global z=15 keeps its label
                assert_eq!(seg.get(5, 3, 3), 2);
                assert_eq!(block.uncertainty.unwrap().shape(), seg.shape());
                assert!(block.smoothed.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_reports_core_memory_exhaustion() {
        let (image, labels) = volume();
        let shard = cut_shard(&seed_plan(), 0, &image, &labels).unwrap();
        let result = run_shard(
            Arc::new(ReferenceWalk::default()),
            device(1024),
            &job(Mode::SeedParallel),
            shard,
        )
        .await
        .unwrap();
        assert!(matches!(result, ShardResult::OutOfMemory));
        assert!(result.status(3).memory_exhausted);
        assert_eq!(result.status(3).rank, 3);
    }

    #[tokio::test]
    async fn test_shard_travels_between_ranks() {
        use crate::transport::{Communicator, LocalCluster};

        let comms = LocalCluster::new(2);
        let groups: Vec<Group> = comms
            .into_iter()
            .map(|c| Group::new(c as Arc<dyn Communicator>, 2).unwrap())
            .collect();
        let (image, labels) = volume();
        let shard = cut_shard(&space_plan(), 1, &image, &labels).unwrap();

        send_shard(&groups[0], 1, &shard, 50).await.unwrap();
        let received = recv_shard(&groups[1]).await.unwrap().unwrap();
        assert_eq!(received.spec, shard.spec);
        assert_eq!(received.image, shard.image);
        assert_eq!(received.labels, shard.labels);
    }

    #[tokio::test]
    async fn test_unsendable_shard_can_be_withdrawn() {
        use crate::transport::{Communicator, LocalCluster};

        let comms = LocalCluster::new(2);
        let groups: Vec<Group> = comms
            .into_iter()
            .map(|c| Group::new(c as Arc<dyn Communicator>, 2).unwrap())
            .collect();
        let (image, labels) = volume();
        let shard = cut_shard(&seed_plan(), 1, &image, &labels).unwrap();

        // rows longer than the ceiling fail before anything goes out
        assert!(send_shard(&groups[0], 1, &shard, 2).await.is_err());
        withdraw_shard(&groups[0], 1).await.unwrap();
        assert!(recv_shard(&groups[1]).await.unwrap().is_none());
    }
}
