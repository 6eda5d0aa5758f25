//! Post-Processor: turns response maps into label volumes.
//!
//! Consensus is an arg-max over label channels with seed voxels held at
//! their own label. Uncertainty and smoothing are optional and each is
//! dropped on its own when its working set does not fit the device.

use crate::errors::{EngineError, Result};
use crate::kernel::Feature;
use crate::slices::SeedSlice;
use crate::volume::{Array3, Element, LabelVolume};
use tracing::{debug, warn};

/// Time step of the explicit curvature flow
pub const SMOOTH_DT: f32 = 0.1;

/// Memory available to optional features on the bound device
#[derive(Debug, Clone, Copy)]
pub struct MemoryBudget {
    bytes: u64,
}

impl MemoryBudget {
    pub fn new(bytes: u64) -> Self {
        Self { bytes }
    }

    pub fn unlimited() -> Self {
        Self { bytes: u64::MAX }
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Whether a working set of `bytes` fits
    pub fn fits(&self, bytes: u64) -> bool {
        bytes <= self.bytes
    }

    /// Allocate a zeroed buffer of `elements` for `feature`
    pub fn allocate<T: Element>(&self, feature: Feature, elements: usize) -> Result<Vec<T>> {
        let bytes = elements as u64 * T::TYPE.size_bytes() as u64;
        if !self.fits(bytes) {
            return Err(EngineError::MemoryExhausted(format!(
                "{} needs {} bytes, {} available",
                feature, bytes, self.bytes
            )));
        }
        let mut buf = Vec::new();
        buf.try_reserve_exact(elements).map_err(|e| {
            EngineError::MemoryExhausted(format!("{}: {}", feature, e))
        })?;
        buf.resize(elements, T::default());
        Ok(buf)
    }
}

/// Arg-max over channels; ties go to the lowest channel.
pub fn consensus(responses: &[Array3<f32>]) -> Result<Array3<u8>> {
    let first = responses
        .first()
        .ok_or_else(|| EngineError::Execution("no response maps".into()))?;
    if responses.len() > 256 {
        return Err(EngineError::Execution(format!(
            "{} channels do not fit u8 labels",
            responses.len()
        )));
    }
    let shape = first.shape();
    if let Some(bad) = responses.iter().find(|r| r.shape() != shape) {
        return Err(EngineError::Shape(format!(
            "response {:?} differs from {:?}",
            bad.shape(),
            shape
        )));
    }

    let data = (0..first.len())
        .map(|i| {
            let mut best = 0usize;
            let mut best_value = responses[0].data()[i];
            for (k, r) in responses.iter().enumerate().skip(1) {
                if r.data()[i] > best_value {
                    best = k;
                    best_value = r.data()[i];
                }
            }
            best as u8
        })
        .collect();
    Ok(Array3::new(data, shape))
}

/// Hold every seed voxel at its own (dense) label
pub fn apply_seeds(segmentation: &mut Array3<u8>, labels: &LabelVolume, slices: &[SeedSlice]) {
    for slice in slices {
        for (p, label) in slice.voxels(labels) {
            segmentation.set(p[0], p[1], p[2], label as u8);
        }
    }
}

/// Ratio of the second-largest to the largest response, in `[0, 1]`
pub fn uncertainty(responses: &[Array3<f32>], budget: &MemoryBudget) -> Result<Array3<f32>> {
    let first = responses
        .first()
        .ok_or_else(|| EngineError::Execution("no response maps".into()))?;
    let mut out = budget.allocate::<f32>(Feature::Uncertainty, first.len())?;

    for (i, u) in out.iter_mut().enumerate() {
        let (mut m1, mut m2) = (0.0f32, 0.0f32);
        for r in responses {
            let v = r.data()[i];
            if v > m1 {
                m2 = m1;
                m1 = v;
            } else if v > m2 {
                m2 = v;
            }
        }
        *u = if m1 > 0.0 { m2 / m1 } else { 0.0 };
    }
    Array3::from_vec(out, first.shape())
}

/// Scale `[0, 1]` uncertainty to bytes
pub fn uncertainty_to_u8(u: &Array3<f32>) -> Array3<u8> {
    u.map(|v| (v.clamp(0.0, 1.0) * 255.0) as u8)
}

/// Mean-curvature flow on every channel, then arg-max.
///
/// Boundary voxels are held fixed.
pub fn smooth(responses: &[Array3<f32>], iterations: u32, budget: &MemoryBudget) -> Result<Array3<u8>> {
    let first = responses
        .first()
        .ok_or_else(|| EngineError::Execution("no response maps".into()))?;
    let len = first.len();
    let shape = first.shape();

    // every channel plus one scratch buffer
    let mut pool = budget.allocate::<f32>(Feature::Smoothing, len * (responses.len() + 1))?;
    let (channels, scratch) = pool.split_at_mut(len * responses.len());

    for (k, r) in responses.iter().enumerate() {
        channels[k * len..(k + 1) * len].copy_from_slice(r.data());
    }
    for k in 0..responses.len() {
        let phi = &mut channels[k * len..(k + 1) * len];
        for _ in 0..iterations {
            curvature_step(phi, scratch, shape);
            phi.copy_from_slice(scratch);
        }
    }
    debug!(iterations, channels = responses.len(), "Smoothing finished");

    let smoothed: Vec<Array3<f32>> = channels
        .chunks(len.max(1))
        .map(|c| Array3::new(c.to_vec(), shape))
        .collect();
    consensus(&smoothed)
}

/// One explicit step of `φ_t = |∇φ| κ` from `phi` into `out`.
///
/// `|∇φ| κ = Δφ - ∇φᵀHφ∇φ / |∇φ|²`, evaluated with central differences.
fn curvature_step(phi: &[f32], out: &mut [f32], shape: [usize; 3]) {
    let [dz, dy, dx] = shape;
    out.copy_from_slice(phi);
    if dz < 3 || dy < 3 || dx < 3 {
        return;
    }
    let (sz, sy) = (dy * dx, dx);
    let at = |i: usize| phi[i];

    for z in 1..dz - 1 {
        for y in 1..dy - 1 {
            for x in 1..dx - 1 {
                let i = z * sz + y * sy + x;
                let c = at(i);
                let fx = (at(i + 1) - at(i - 1)) * 0.5;
                let fy = (at(i + sy) - at(i - sy)) * 0.5;
                let fz = (at(i + sz) - at(i - sz)) * 0.5;
                let fxx = at(i + 1) - 2.0 * c + at(i - 1);
                let fyy = at(i + sy) - 2.0 * c + at(i - sy);
                let fzz = at(i + sz) - 2.0 * c + at(i - sz);
                let fxy = (at(i + sy + 1) - at(i + sy - 1) - at(i - sy + 1) + at(i - sy - 1)) * 0.25;
                let fxz = (at(i + sz + 1) - at(i + sz - 1) - at(i - sz + 1) + at(i - sz - 1)) * 0.25;
                let fyz = (at(i + sz + sy) - at(i + sz - sy) - at(i - sz + sy) + at(i - sz - sy)) * 0.25;

                let grad2 = fx * fx + fy * fy + fz * fz;
                if grad2 <= f32::EPSILON {
                    // flat point: curvature averaged over gradient directions
                    out[i] = c + SMOOTH_DT * (2.0 / 3.0) * (fxx + fyy + fzz);
                    continue;
                }
                let num = fxx * (fy * fy + fz * fz) + fyy * (fx * fx + fz * fz) + fzz * (fx * fx + fy * fy)
                    - 2.0 * (fx * fy * fxy + fx * fz * fxz + fy * fz * fyz);
                out[i] = c + SMOOTH_DT * num / grad2;
            }
        }
    }
}

/// Dense results derived from response maps
#[derive(Debug, Clone)]
pub struct Derived {
    pub segmentation: Array3<u8>,
    pub uncertainty: Option<Array3<u8>>,
    pub smoothed: Option<Array3<u8>>,
    /// Features dropped because their working set did not fit
    pub degraded: Vec<Feature>,
}

/// Consensus plus whichever optional features were requested.
///
/// A feature whose allocation fails is disabled with a warning; the
/// consensus result is never affected.
pub fn derive(
    responses: &[Array3<f32>],
    seeds: Option<(&LabelVolume, &[SeedSlice])>,
    want_uncertainty: bool,
    smooth_iterations: u32,
    budget: &MemoryBudget,
) -> Result<Derived> {
    let mut segmentation = consensus(responses)?;
    if let Some((labels, slices)) = seeds {
        apply_seeds(&mut segmentation, labels, slices);
    }
    let mut degraded = Vec::new();

    let uncertainty = if want_uncertainty {
        match uncertainty(responses, budget) {
            Ok(u) => Some(uncertainty_to_u8(&u)),
            Err(EngineError::MemoryExhausted(reason)) => {
                warn!(%reason, "Out of memory for uncertainty. Continuing without uncertainty.");
                degraded.push(Feature::Uncertainty);
                None
            }
            Err(e) => return Err(e),
        }
    } else {
        None
    };

    let smoothed = if smooth_iterations > 0 {
        match smooth(responses, smooth_iterations, budget) {
            Ok(s) => Some(s),
            Err(EngineError::MemoryExhausted(reason)) => {
                warn!(%reason, "Out of memory for smoothing. Continuing without smoothing.");
                degraded.push(Feature::Smoothing);
                None
            }
            Err(e) => return Err(e),
        }
    } else {
        None
    };

    Ok(Derived {
        segmentation,
        uncertainty,
        smoothed,
        degraded,
    })
}
