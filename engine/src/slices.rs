//! Labeled-slice detection.
//!
//! A seed slice is a 2-D slice of the label volume that carries user labels.
//! Without `allaxis` only Z-slices are considered. With `allaxis` the label
//! volume is also read along Y and X; a voxel that forms a one-voxel-thin line
//! inside such a slice belongs to a slice drawn in another orientation and is
//! not counted.

use crate::volume::{Array3, LabelVolume};
use serde::{Deserialize, Serialize};

/// Axis a seed slice is taken across
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    Z,
    Y,
    X,
}

impl Orientation {
    pub const ALL: [Orientation; 3] = [Orientation::Z, Orientation::Y, Orientation::X];

    /// Axis order that puts this orientation's slicing axis first
    pub fn axes(&self) -> [usize; 3] {
        match self {
            Orientation::Z => [0, 1, 2],
            Orientation::Y => [1, 0, 2],
            Orientation::X => [2, 0, 1],
        }
    }

    /// Slicing axis in (z, y, x) terms
    pub fn axis(&self) -> usize {
        self.axes()[0]
    }
}

/// One labeled slice
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeedSlice {
    pub orientation: Orientation,
    pub index: usize,
}

impl SeedSlice {
    pub fn new(orientation: Orientation, index: usize) -> Self {
        Self { orientation, index }
    }

    /// Global coordinates and labels of the seed voxels on this slice.
    ///
    /// The outer shell of the slice is skipped and erased voxels (label < 0)
    /// are not seeds.
    pub fn voxels(&self, labels: &LabelVolume) -> Vec<([usize; 3], i32)> {
        let shape = labels.shape();
        let axis = self.orientation.axis();
        if self.index >= shape[axis] {
            return Vec::new();
        }
        let [_, a, b] = self.orientation.axes();
        let mut out = Vec::new();
        for i in 1..shape[a].saturating_sub(1) {
            for j in 1..shape[b].saturating_sub(1) {
                let mut p = [0usize; 3];
                p[axis] = self.index;
                p[a] = i;
                p[b] = j;
                let label = labels.get(p[0], p[1], p[2]);
                if label >= 0 {
                    out.push((p, label));
                }
            }
        }
        out
    }
}

/// Labeled slices of `labels` in orientation then index order.
pub fn labeled_slices(labels: &LabelVolume, allaxis: bool) -> Vec<SeedSlice> {
    if !allaxis {
        return (0..labels.shape()[0])
            .filter(|&z| labels.plane(z).iter().any(|&v| v > 0))
            .map(|z| SeedSlice::new(Orientation::Z, z))
            .collect();
    }

    let mut out = Vec::new();
    for orientation in Orientation::ALL {
        let oriented = if orientation == Orientation::Z {
            labels.clone()
        } else {
            labels.permute(orientation.axes())
        };
        for k in 0..oriented.shape()[0] {
            if has_thick_labels(&oriented, k) {
                out.push(SeedSlice::new(orientation, k));
            }
        }
    }
    out
}

/// Whether any labeled voxel of plane `k` survives the thin-line filter.
fn has_thick_labels(oriented: &Array3<i32>, k: usize) -> bool {
    let [_, rows, cols] = oriented.shape();
    let plane = oriented.plane(k);
    if !plane.iter().any(|&v| v > 0) {
        return false;
    }
    let mut mask: Vec<u8> = plane.iter().map(|&v| u8::from(v > 0)).collect();

    let at = |m: &[u8], r: isize, c: isize| -> i32 {
        if r < 0 || c < 0 || r >= rows as isize || c >= cols as isize {
            0
        } else {
            m[r as usize * cols + c as usize] as i32
        }
    };

    // along rows, then along columns on the filtered mask
    for (dr, dc) in [(1isize, 0isize), (0, 1)] {
        let prev = mask.clone();
        for r in 0..rows as isize {
            for c in 0..cols as isize {
                let here = at(&prev, r, c);
                if here == 0 {
                    continue;
                }
                let gradient = (at(&prev, r - dr, c - dc) - here).abs()
                    + (here - at(&prev, r + dr, c + dc)).abs();
                if gradient == 2 {
                    mask[r as usize * cols + c as usize] = 0;
                }
            }
        }
    }
    mask.iter().any(|&v| v > 0)
}

/// First pair of labeled slices of one orientation that touch.
pub fn adjacent_pair(slices: &[SeedSlice]) -> Option<(SeedSlice, SeedSlice)> {
    let mut sorted = slices.to_vec();
    sorted.sort();
    sorted
        .windows(2)
        .find(|w| w[0].orientation == w[1].orientation && w[1].index == w[0].index + 1)
        .map(|w| (w[0], w[1]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels_with_planes(shape: [usize; 3], planes: &[(usize, i32)]) -> LabelVolume {
        let mut labels = Array3::zeros(shape);
        for &(z, label) in planes {
            for y in 2..shape[1] - 2 {
                for x in 2..shape[2] - 2 {
                    labels.set(z, y, x, label);
                }
            }
        }
        labels
    }

    #[test]
    fn test_z_only_slices() {
        let labels = labels_with_planes([10, 8, 8], &[(3, 1), (7, 2)]);
        let slices = labeled_slices(&labels, false);
        assert_eq!(
            slices,
            vec![SeedSlice::new(Orientation::Z, 3), SeedSlice::new(Orientation::Z, 7)]
        );
    }

    #[test]
    fn test_allaxis_ignores_cross_sections_of_z_slices() {
        let labels = labels_with_planes([10, 8, 8], &[(3, 1)]);
        let slices = labeled_slices(&labels, true);
        assert_eq!(slices, vec![SeedSlice::new(Orientation::Z, 3)]);
    }

    #[test]
    fn test_allaxis_finds_y_slice() {
        let mut labels = Array3::<i32>::zeros([10, 8, 8]);
        for z in 2..8 {
            for x in 2..6 {
                labels.set(z, 4, x, 1);
            }
        }
        let slices = labeled_slices(&labels, true);
        assert_eq!(slices, vec![SeedSlice::new(Orientation::Y, 4)]);
    }

    #[test]
    fn test_erased_voxels_are_not_labels() {
        let mut labels = labels_with_planes([6, 6, 6], &[(2, 1)]);
        for v in labels.data_mut() {
            if *v == 1 {
                *v = -1;
            }
        }
        assert!(labeled_slices(&labels, false).is_empty());
        assert!(labeled_slices(&labels, true).is_empty());
    }

    #[test]
    fn test_adjacent_pair_detection() {
        let slices = vec![
            SeedSlice::new(Orientation::Z, 25),
            SeedSlice::new(Orientation::Z, 24),
        ];
        assert_eq!(
            adjacent_pair(&slices),
            Some((SeedSlice::new(Orientation::Z, 24), SeedSlice::new(Orientation::Z, 25)))
        );

        let apart = vec![
            SeedSlice::new(Orientation::Z, 23),
            SeedSlice::new(Orientation::Y, 24),
            SeedSlice::new(Orientation::Z, 25),
        ];
        assert_eq!(adjacent_pair(&apart), None);
    }

    #[test]
    fn test_slice_voxels_skip_shell() {
        let mut labels = Array3::<i32>::zeros([4, 4, 4]);
        labels.set(1, 1, 2, 2);
        labels.set(1, 0, 0, 5);
        labels.set(1, 2, 2, -1);
        let voxels = SeedSlice::new(Orientation::Z, 1).voxels(&labels);
        // 2x2 interior, minus the erased voxel
        assert_eq!(voxels.len(), 3);
        assert!(voxels.contains(&([1, 1, 2], 2)));
        assert!(!voxels.iter().any(|(p, _)| *p == [1, 0, 0]));

        let across = SeedSlice::new(Orientation::X, 2).voxels(&labels);
        assert!(across.contains(&([1, 1, 2], 2)));
        assert!(!across.iter().any(|(p, _)| *p == [1, 2, 2]));
    }
}
