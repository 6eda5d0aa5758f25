//! The diffusion capability: random walks from seed voxels producing one
//! response map per label.
//!
//! Kernels are opaque to the engine. A kernel may compute uncertainty or
//! smoothed labels itself; whatever it leaves out, the diffusion worker
//! derives from the response maps.

pub mod reference;

pub use reference::ReferenceWalk;

use crate::device::{Backend, DeviceHandle};
use crate::errors::Result;
use crate::slices::SeedSlice;
use crate::volume::{Array3, LabelVolume};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Optional capabilities a kernel may lack on some backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Uncertainty,
    Smoothing,
    AllAxis,
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Feature::Uncertainty => write!(f, "uncertainty"),
            Feature::Smoothing => write!(f, "smoothing"),
            Feature::AllAxis => write!(f, "allaxis"),
        }
    }
}

/// Input of one kernel invocation
#[derive(Debug, Clone)]
pub struct WalkRequest {
    /// Intensities of the shard
    pub image: Array3<f32>,
    /// Dense label channels; -1 marks erased voxels
    pub labels: LabelVolume,
    /// Seed slices this worker starts walks from
    pub seeds: Vec<SeedSlice>,
    /// Number of label channels
    pub nol: usize,
    pub nbrw: u32,
    pub sorw: u32,
    /// Position of the shard inside the region
    pub origin: [usize; 3],
    /// Features the caller would like computed on the device
    pub uncertainty: bool,
    pub smooth: u32,
}

impl WalkRequest {
    /// Voxels in the shard
    pub fn voxels(&self) -> usize {
        self.image.len()
    }
}

/// Result of one kernel invocation
#[derive(Debug, Clone, Default)]
pub struct WalkOutput {
    /// The core working set did not fit the device
    pub memory_exhausted: bool,
    /// One map per label channel, shaped like the request image
    pub responses: Vec<Array3<f32>>,
    /// Uncertainty in `[0, 1]`, if the kernel computed it
    pub uncertainty: Option<Array3<f32>>,
    /// Smoothed dense labels, if the kernel computed them
    pub smoothed: Option<Array3<u8>>,
    /// Requested features the kernel had to drop
    pub degraded: Vec<Feature>,
}

impl WalkOutput {
    pub fn out_of_memory() -> Self {
        Self {
            memory_exhausted: true,
            ..Default::default()
        }
    }
}

/// A random-walk diffusion implementation
pub trait DiffusionKernel: Send + Sync {
    fn name(&self) -> &str;

    /// Whether `feature` is available on `backend`
    fn supports(&self, _feature: Feature, _backend: Backend) -> bool {
        true
    }

    /// Run every walk of `request` on `device`. Blocking.
    fn walk(&self, request: &WalkRequest, device: &DeviceHandle) -> Result<WalkOutput>;
}
