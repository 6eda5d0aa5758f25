//! Portable CPU implementation of the diffusion kernel.
//!
//! Each seed voxel starts `nbrw` walks of `sorw` steps. A walk moves to one
//! of its six face neighbours with probability proportional to
//! `exp(-(ΔI)² / 2σ²)` and deposits one hit per visited voxel into the
//! seed's label channel. Every seed draws from its own RNG stream keyed by
//! its position in the region, so the hits a seed produces do not depend on
//! which worker runs it.

use super::{DiffusionKernel, WalkOutput, WalkRequest};
use crate::device::DeviceHandle;
use crate::errors::{EngineError, Result};
use crate::volume::Array3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::{debug, info, instrument, warn};

/// Default intensity scale of the edge weights
pub const DEFAULT_SIGMA: f32 = 12.0;

#[derive(Debug, Clone)]
pub struct ReferenceWalk {
    sigma: f32,
}

impl Default for ReferenceWalk {
    fn default() -> Self {
        Self::new(DEFAULT_SIGMA)
    }
}

impl ReferenceWalk {
    pub fn new(sigma: f32) -> Self {
        Self { sigma }
    }

    /// Bytes needed to run a request of `voxels` voxels and `nol` channels
    pub fn working_set_bytes(voxels: usize, nol: usize) -> u64 {
        let accumulators = rayon::current_num_threads() as u64 + 1;
        // image + cumulative transition table + hit counters per accumulator
        voxels as u64 * (4 + 6 * 4 + 4 * nol as u64 * accumulators)
    }

    /// Cumulative neighbour weights per voxel, in the order
    /// -z, +z, -y, +y, -x, +x. Out-of-volume neighbours weigh zero.
    fn transitions(&self, image: &Array3<f32>) -> Vec<[f32; 6]> {
        let [dz, dy, dx] = image.shape();
        let inv = 1.0 / (2.0 * self.sigma * self.sigma);
        let weight = |a: f32, b: f32| (-(a - b) * (a - b) * inv).exp();

        (0..image.len())
            .into_par_iter()
            .map(|idx| {
                let (z, y, x) = (idx / (dy * dx), (idx / dx) % dy, idx % dx);
                let here = image.data()[idx];
                let neighbours = [
                    (z > 0).then(|| image.get(z - 1, y, x)),
                    (z + 1 < dz).then(|| image.get(z + 1, y, x)),
                    (y > 0).then(|| image.get(z, y - 1, x)),
                    (y + 1 < dy).then(|| image.get(z, y + 1, x)),
                    (x > 0).then(|| image.get(z, y, x - 1)),
                    (x + 1 < dx).then(|| image.get(z, y, x + 1)),
                ];
                let mut cum = [0.0f32; 6];
                let mut total = 0.0;
                for (d, n) in neighbours.iter().enumerate() {
                    if let Some(v) = n {
                        total += weight(here, *v);
                    }
                    cum[d] = total;
                }
                cum
            })
            .collect()
    }
}

/// splitmix64 of the seed's region coordinate
fn voxel_seed(p: [usize; 3]) -> u64 {
    let mut z = ((p[0] as u64) << 42) ^ ((p[1] as u64) << 21) ^ (p[2] as u64);
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

struct Walker<'a> {
    table: &'a [[f32; 6]],
    strides: [isize; 6],
    len: usize,
    nbrw: u32,
    sorw: u32,
}

impl Walker<'_> {
    fn run(&self, start: usize, channel: usize, key: [usize; 3], hits: &mut [u32]) {
        let mut rng = StdRng::seed_from_u64(voxel_seed(key));
        let base = channel * self.len;
        for _ in 0..self.nbrw {
            let mut idx = start;
            hits[base + idx] += 1;
            for _ in 0..self.sorw {
                let cum = &self.table[idx];
                let total = cum[5];
                if total > 0.0 {
                    let r = rng.gen::<f32>() * total;
                    let dir = cum
                        .iter()
                        .position(|&c| r < c)
                        .unwrap_or_else(|| last_open(cum));
                    idx = (idx as isize + self.strides[dir]) as usize;
                }
                hits[base + idx] += 1;
            }
        }
    }
}

/// Last direction with nonzero weight
fn last_open(cum: &[f32; 6]) -> usize {
    (0..6)
        .rev()
        .find(|&d| cum[d] > if d == 0 { 0.0 } else { cum[d - 1] })
        .unwrap_or(0)
}

impl DiffusionKernel for ReferenceWalk {
    fn name(&self) -> &str {
        "reference-cpu"
    }

    #[instrument(skip_all, fields(rank = device.rank(), seeds = request.seeds.len()))]
    fn walk(&self, request: &WalkRequest, device: &DeviceHandle) -> Result<WalkOutput> {
        let shape = request.image.shape();
        if request.labels.shape() != shape {
            return Err(EngineError::Shape(format!(
                "labels {:?} do not match image {:?}",
                request.labels.shape(),
                shape
            )));
        }

        let len = request.voxels();
        let nol = request.nol;
        let required = Self::working_set_bytes(len, nol);
        if required > device.memory_bytes() {
            warn!(
                required,
                available = device.memory_bytes(),
                "Walk working set does not fit the device"
            );
            return Ok(WalkOutput::out_of_memory());
        }

        let mut seeds = Vec::new();
        for slice in &request.seeds {
            for (p, label) in slice.voxels(&request.labels) {
                if label as usize >= nol {
                    return Err(EngineError::Execution(format!(
                        "seed label {} outside {} channels",
                        label, nol
                    )));
                }
                seeds.push((p, label as usize));
            }
        }
        debug!(seed_voxels = seeds.len(), voxels = len, "Starting walks");

        let table = self.transitions(&request.image);
        let [_, dy, dx] = shape;
        let plane = (dy * dx) as isize;
        let walker = Walker {
            table: &table,
            strides: [-plane, plane, -(dx as isize), dx as isize, -1, 1],
            len,
            nbrw: request.nbrw,
            sorw: request.sorw,
        };

        let chunk = seeds.len().div_ceil(rayon::current_num_threads()).max(1);
        let origin = request.origin;
        let hits = seeds
            .par_chunks(chunk)
            .map(|chunk| {
                let mut acc = vec![0u32; nol * len];
                for &(p, channel) in chunk {
                    let start = (p[0] * dy + p[1]) * dx + p[2];
                    let key = [origin[0] + p[0], origin[1] + p[1], origin[2] + p[2]];
                    walker.run(start, channel, key, &mut acc);
                }
                acc
            })
            .reduce(
                || vec![0u32; nol * len],
                |mut a, b| {
                    for (x, y) in a.iter_mut().zip(b) {
                        *x += y;
                    }
                    a
                },
            );

        let responses = hits
            .chunks(len.max(1))
            .take(nol)
            .map(|c| Array3::new(c.iter().map(|&h| h as f32).collect(), shape))
            .collect::<Vec<_>>();

        info!(
            seed_voxels = seeds.len(),
            walks = seeds.len() as u64 * request.nbrw as u64,
            "Walks finished"
        );

        Ok(WalkOutput {
            responses,
            ..Default::default()
        })
    }
}
