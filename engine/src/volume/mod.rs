//! Volume containers and input preprocessing

pub mod array;
pub mod preprocess;

pub use array::{Array3, Element, ElementType};
pub use preprocess::{prepare, LabelMap, PreparedInput};

use crate::errors::Result;
use serde::{Deserialize, Serialize};

/// Sparse user labels, one integer label ID per voxel. 0 is unlabeled
/// background; -1 marks voxels explicitly removed from the seed set.
pub type LabelVolume = Array3<i32>;

/// Image volume as loaded, before normalization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RawVolume {
    U8(Array3<u8>),
    I8(Array3<i8>),
    U16(Array3<u16>),
    F32(Array3<f32>),
}

impl RawVolume {
    pub fn shape(&self) -> [usize; 3] {
        match self {
            RawVolume::U8(a) => a.shape(),
            RawVolume::I8(a) => a.shape(),
            RawVolume::U16(a) => a.shape(),
            RawVolume::F32(a) => a.shape(),
        }
    }
}

/// Normalized image intensities as handed to workers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VolumeData {
    U8(Array3<u8>),
    F32(Array3<f32>),
}

impl VolumeData {
    pub fn shape(&self) -> [usize; 3] {
        match self {
            VolumeData::U8(a) => a.shape(),
            VolumeData::F32(a) => a.shape(),
        }
    }

    pub fn element(&self) -> ElementType {
        match self {
            VolumeData::U8(_) => ElementType::U8,
            VolumeData::F32(_) => ElementType::F32,
        }
    }

    /// Size of the volume in megabytes
    pub fn size_mb(&self) -> f64 {
        let bytes = match self {
            VolumeData::U8(a) => a.nbytes(),
            VolumeData::F32(a) => a.nbytes(),
        };
        bytes as f64 / 1e6
    }

    pub fn crop(&self, start: [usize; 3], end: [usize; 3]) -> Result<Self> {
        Ok(match self {
            VolumeData::U8(a) => VolumeData::U8(a.crop(start, end)?),
            VolumeData::F32(a) => VolumeData::F32(a.crop(start, end)?),
        })
    }

    pub fn slab(&self, z0: usize, z1: usize) -> Result<Self> {
        Ok(match self {
            VolumeData::U8(a) => VolumeData::U8(a.slab(z0, z1)?),
            VolumeData::F32(a) => VolumeData::F32(a.slab(z0, z1)?),
        })
    }

    pub fn pad(&self, n: usize) -> Self {
        match self {
            VolumeData::U8(a) => VolumeData::U8(a.pad(n)),
            VolumeData::F32(a) => VolumeData::F32(a.pad(n)),
        }
    }

    /// Intensities as f32, the form the diffusion kernel consumes
    pub fn to_f32(&self) -> Array3<f32> {
        match self {
            VolumeData::U8(a) => a.map(f32::from),
            VolumeData::F32(a) => a.clone(),
        }
    }
}
