//! Input normalization, label validation and padding.

use super::{Array3, LabelVolume, RawVolume, VolumeData};
use crate::config::{JobConfig, LabelFilter};
use crate::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Voxels of zero padding added around both volumes before region selection
pub const PADDING: usize = 1;

/// Largest label ID that fits the u8 outputs
pub const MAX_LABEL: i32 = 255;

/// Image and labels ready for region selection
#[derive(Debug, Clone)]
pub struct PreparedInput {
    /// Padded, normalized image
    pub image: VolumeData,
    /// Padded labels, raw IDs
    pub labels: LabelVolume,
    pub label_map: LabelMap,
    /// Shape before padding
    pub original_shape: [usize; 3],
}

/// Validate, filter, normalize and pad one job's input.
pub fn prepare(image: RawVolume, labels: LabelVolume, config: &JobConfig) -> Result<PreparedInput> {
    let original_shape = image.shape();
    if labels.shape() != original_shape {
        return Err(EngineError::Validation(format!(
            "Dimensions of image {:?} and labels {:?} do not match.",
            original_shape,
            labels.shape()
        )));
    }

    if let Some(bad) = labels.data().iter().find(|&&v| !(0..=MAX_LABEL).contains(&v)) {
        return Err(EngineError::Validation(format!(
            "Label id {} outside 0..={}",
            bad, MAX_LABEL
        )));
    }

    let labels = filter_labels(labels, &config.ignore, &config.only);

    let mut image = normalize(image);
    if config.denoise {
        debug!("Denoising image");
        image = VolumeData::F32(denoise(&image));
    }

    let image = image.pad(PADDING);
    let labels = labels.pad(PADDING);
    let label_map = LabelMap::from_labels(&labels);

    info!(
        shape = ?original_shape,
        labels = ?label_map.labels(),
        element = ?image.element(),
        "Input prepared"
    );

    Ok(PreparedInput {
        image,
        labels,
        label_map,
        original_shape,
    })
}

/// Apply the `ignore` and `only` filters. Removed labels become background.
pub fn filter_labels(mut labels: LabelVolume, ignore: &LabelFilter, only: &LabelFilter) -> LabelVolume {
    for v in labels.data_mut() {
        if *v > 0 && (ignore.contains(*v) || !only.contains(*v)) {
            *v = 0;
        }
    }
    labels
}

/// Map raw intensities to the types the kernel understands.
///
/// `u8` is kept, `i8` is shifted into `u8`, everything else is min-max scaled
/// to `[0, 255]` as `f32`.
pub fn normalize(raw: RawVolume) -> VolumeData {
    match raw {
        RawVolume::U8(a) => VolumeData::U8(a),
        RawVolume::I8(a) => VolumeData::U8(a.map(|v| (v as i16 + 128) as u8)),
        RawVolume::U16(a) => VolumeData::F32(min_max_scale(&a.map(f32::from))),
        RawVolume::F32(a) => VolumeData::F32(min_max_scale(&a)),
    }
}

fn min_max_scale(a: &Array3<f32>) -> Array3<f32> {
    let (lo, hi) = a
        .data()
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let range = hi - lo;
    if !range.is_finite() || range <= 0.0 {
        return Array3::zeros(a.shape());
    }
    a.map(|v| (v - lo) / range * 255.0)
}

/// In-plane 3x3 mean filter; borders use the nearest valid neighbours.
pub fn denoise(image: &VolumeData) -> Array3<f32> {
    let src = image.to_f32();
    let [dz, dy, dx] = src.shape();
    let mut out = Array3::zeros(src.shape());
    for z in 0..dz {
        for y in 0..dy {
            for x in 0..dx {
                let mut sum = 0.0;
                let mut count = 0.0;
                for ny in y.saturating_sub(1)..=(y + 1).min(dy - 1) {
                    for nx in x.saturating_sub(1)..=(x + 1).min(dx - 1) {
                        sum += src.get(z, ny, nx);
                        count += 1.0;
                    }
                }
                out.set(z, y, x, sum / count);
            }
        }
    }
    out
}

/// Sorted set of raw label IDs and the dense channel index of each.
///
/// Background `0` is always present (the padding guarantees it), so channel
/// 0 is always background.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelMap {
    labels: Vec<i32>,
}

impl LabelMap {
    pub fn from_labels(labels: &LabelVolume) -> Self {
        let mut present = [false; (MAX_LABEL + 1) as usize];
        present[0] = true;
        for &v in labels.data() {
            if (0..=MAX_LABEL).contains(&v) {
                present[v as usize] = true;
            }
        }
        let labels = (0..=MAX_LABEL).filter(|&v| present[v as usize]).collect();
        Self { labels }
    }

    pub fn from_ids(mut ids: Vec<i32>) -> Self {
        ids.push(0);
        ids.sort_unstable();
        ids.dedup();
        Self { labels: ids }
    }

    /// Raw IDs in channel order
    pub fn labels(&self) -> &[i32] {
        &self.labels
    }

    /// Number of label channels, background included
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn dense(&self, raw: i32) -> Option<usize> {
        self.labels.binary_search(&raw).ok()
    }

    pub fn raw(&self, dense: usize) -> Option<i32> {
        self.labels.get(dense).copied()
    }

    /// Raw IDs to channel indices; negative markers pass through.
    pub fn to_dense(&self, labels: &LabelVolume) -> Result<LabelVolume> {
        let mut out = labels.clone();
        for v in out.data_mut() {
            if *v >= 0 {
                *v = self.dense(*v).ok_or_else(|| {
                    EngineError::Validation(format!("Label id {} not in label map", v))
                })? as i32;
            }
        }
        Ok(out)
    }

    /// Channel indices back to raw IDs
    pub fn to_raw(&self, dense: &Array3<u8>) -> Result<Array3<u8>> {
        let mut out = dense.clone();
        for v in out.data_mut() {
            let raw = self.raw(*v as usize).ok_or_else(|| {
                EngineError::Validation(format!("Channel {} not in label map", v))
            })?;
            *v = raw as u8;
        }
        Ok(out)
    }
}
