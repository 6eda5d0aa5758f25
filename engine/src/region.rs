//! Region Selector: the bounding box of all labeled voxels plus a margin.

use crate::volume::LabelVolume;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Half-open box `[start, end)` on each axis (z, y, x)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub start: [usize; 3],
    pub end: [usize; 3],
}

impl Region {
    /// The whole volume
    pub fn full(shape: [usize; 3]) -> Self {
        Self {
            start: [0, 0, 0],
            end: shape,
        }
    }

    pub fn shape(&self) -> [usize; 3] {
        [
            self.end[0] - self.start[0],
            self.end[1] - self.start[1],
            self.end[2] - self.start[2],
        ]
    }

    pub fn contains(&self, z: usize, y: usize, x: usize) -> bool {
        let p = [z, y, x];
        (0..3).all(|a| p[a] >= self.start[a] && p[a] < self.end[a])
    }
}

/// Compute the region of interest.
///
/// Bounds are the min/max coordinates of nonzero labels, widened by
/// `margin` and clamped to the volume. A volume without labels yields the
/// full volume.
pub fn select_region(labels: &LabelVolume, margin: [usize; 3]) -> Region {
    let shape = labels.shape();
    let mut lo = shape;
    let mut hi = [0usize; 3];
    let mut found = false;

    for z in 0..shape[0] {
        let plane = labels.plane(z);
        if plane.iter().all(|&v| v == 0) {
            continue;
        }
        for (i, &v) in plane.iter().enumerate() {
            if v == 0 {
                continue;
            }
            let p = [z, i / shape[2], i % shape[2]];
            for a in 0..3 {
                lo[a] = lo[a].min(p[a]);
                hi[a] = hi[a].max(p[a]);
            }
            found = true;
        }
    }

    if !found {
        debug!(?shape, "No labels found, using full volume");
        return Region::full(shape);
    }

    let mut region = Region::full(shape);
    for a in 0..3 {
        region.start[a] = lo[a].saturating_sub(margin[a]);
        region.end[a] = (hi[a] + 1 + margin[a]).min(shape[a]);
    }
    debug!(start = ?region.start, end = ?region.end, "Region selected");
    region
}
