//! Aggregator: combines worker results at the coordinator.
//!
//! Every active rank first reports a [`ResultStatus`]. The coordinator
//! answers with one [`CollectPlan`] so all ranks agree on whether arrays
//! move at all and which optional streams come along. Seed-parallel
//! responses are summed per channel; space-parallel blocks are concatenated
//! along Z. Both walk the ranks in order.

use crate::errors::{EngineError, Result};
use crate::kernel::Feature;
use crate::planner::Mode;
use crate::region::Region;
use crate::transport::{Group, MessageKind, Stream, Tag};
use crate::volume::{Array3, Element};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// What a rank reports after its kernel call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultStatus {
    pub rank: usize,
    pub memory_exhausted: bool,
    /// Optional features this rank could not produce
    pub degraded: Vec<Feature>,
    /// Kernel or preparation failure
    pub error: Option<String>,
}

impl ResultStatus {
    pub fn ok(rank: usize) -> Self {
        Self {
            rank,
            memory_exhausted: false,
            degraded: Vec::new(),
            error: None,
        }
    }

    pub fn failed(rank: usize, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::ok(rank)
        }
    }

    pub fn out_of_memory(rank: usize) -> Self {
        Self {
            memory_exhausted: true,
            ..Self::ok(rank)
        }
    }
}

/// The coordinator's decision after gathering every status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectPlan {
    pub proceed: bool,
    /// Some rank ran out of device memory for its walk
    pub memory_exhausted: bool,
    pub uncertainty: bool,
    pub smoothed: bool,
}

impl CollectPlan {
    /// Proceed only if no rank failed; keep an optional stream only if
    /// every rank produced it.
    pub fn decide(statuses: &[ResultStatus], uncertainty: bool, smoothed: bool) -> Self {
        let proceed = statuses
            .iter()
            .all(|s| !s.memory_exhausted && s.error.is_none());
        let dropped = |f: Feature| statuses.iter().any(|s| s.degraded.contains(&f));
        Self {
            proceed,
            memory_exhausted: statuses.iter().any(|s| s.memory_exhausted),
            uncertainty: uncertainty && !dropped(Feature::Uncertainty),
            smoothed: smoothed && !dropped(Feature::Smoothing),
        }
    }
}

/// One space-parallel worker's core-block result
#[derive(Debug, Clone, Default)]
pub struct BlockResult {
    pub segmentation: Option<Array3<u8>>,
    pub uncertainty: Option<Array3<u8>>,
    pub smoothed: Option<Array3<u8>>,
}

/// Coordinator-side view of the job's combined result
#[derive(Debug, Clone)]
pub enum Combined {
    /// Summed per-channel response maps over the region
    Responses(Vec<Array3<f32>>),
    /// Concatenated dense label blocks over the region
    Segmented {
        segmentation: Array3<u8>,
        uncertainty: Option<Array3<u8>>,
        smoothed: Option<Array3<u8>>,
    },
}

impl Combined {
    pub fn mode(&self) -> Mode {
        match self {
            Combined::Responses(_) => Mode::SeedParallel,
            Combined::Segmented { .. } => Mode::SpaceParallel,
        }
    }
}

/// Rank-ordered status exchange. The root returns the plan it broadcast;
/// other ranks return the plan they received.
pub async fn agree(
    group: &Group,
    status: ResultStatus,
    want_uncertainty: bool,
    want_smoothed: bool,
) -> Result<CollectPlan> {
    let status_tag = Tag::new(MessageKind::ResultStatus);
    let plan_tag = Tag::new(MessageKind::Collect);

    if !group.is_root() {
        group.send_to_root(status_tag, &status).await?;
        return group.recv_from_root(plan_tag).await;
    }

    let statuses = group.gather(status_tag, status).await?;
    for (rank, s) in statuses.iter().enumerate() {
        if s.rank != rank {
            return Err(EngineError::Protocol(format!(
                "status from rank {} claims rank {}",
                rank, s.rank
            )));
        }
    }
    for s in statuses.iter().filter(|s| s.error.is_some()) {
        warn!(rank = s.rank, error = s.error.as_deref().unwrap_or(""), "Rank failed");
    }
    let plan = CollectPlan::decide(&statuses, want_uncertainty, want_smoothed);
    debug!(?plan, "Collect plan decided");
    group.broadcast(plan_tag, &plan).await?;
    Ok(plan)
}

/// Sum response maps at the root (seed-parallel)
pub async fn collect_responses(
    group: &Group,
    responses: Vec<Array3<f32>>,
    max_elements: usize,
) -> Result<Option<Combined>> {
    let summed = group
        .reduce_sum(Stream::Response, responses, max_elements)
        .await?;
    if let Some(ref channels) = summed {
        info!(channels = channels.len(), ranks = group.size(), "Responses reduced");
    }
    Ok(summed.map(Combined::Responses))
}

/// Concatenate core blocks at the root (space-parallel)
pub async fn collect_blocks(
    group: &Group,
    block: BlockResult,
    plan: &CollectPlan,
    max_elements: usize,
) -> Result<Option<Combined>> {
    let segmentation = block
        .segmentation
        .ok_or_else(|| EngineError::Execution("missing block segmentation".into()))?;
    let segmentation = group
        .gather_concat(Stream::Segmentation, segmentation, max_elements)
        .await?;

    let uncertainty = if plan.uncertainty {
        let own = block
            .uncertainty
            .ok_or_else(|| EngineError::Execution("missing block uncertainty".into()))?;
        group
            .gather_concat(Stream::Uncertainty, own, max_elements)
            .await?
    } else {
        None
    };

    let smoothed = if plan.smoothed {
        let own = block
            .smoothed
            .ok_or_else(|| EngineError::Execution("missing block smoothing".into()))?;
        group
            .gather_concat(Stream::Smoothed, own, max_elements)
            .await?
    } else {
        None
    };

    Ok(segmentation.map(|segmentation| {
        info!(shape = ?segmentation.shape(), ranks = group.size(), "Blocks concatenated");
        Combined::Segmented {
            segmentation,
            uncertainty,
            smoothed,
        }
    }))
}

/// Place a region-shaped result into a zeroed volume of `full_shape`
pub fn scatter<T: Element>(
    region: &Region,
    full_shape: [usize; 3],
    values: &Array3<T>,
) -> Result<Array3<T>> {
    if values.shape() != region.shape() {
        return Err(EngineError::Shape(format!(
            "result {:?} does not match region {:?}",
            values.shape(),
            region.shape()
        )));
    }
    let mut full = Array3::zeros(full_shape);
    full.paste(values, region.start)?;
    Ok(full)
}
