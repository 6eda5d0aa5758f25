//! Output naming, persistence traits and completion reporting.

use crate::errors::Result;
use crate::volume::{Array3, LabelVolume, RawVolume};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

/// Metadata carried from the input image to every output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeHeader {
    /// Voxel spacing (z, y, x)
    pub spacing: [f32; 3],
}

impl Default for VolumeHeader {
    fn default() -> Self {
        Self {
            spacing: [1.0, 1.0, 1.0],
        }
    }
}

/// Reads input volumes
pub trait VolumeSource: Send + Sync {
    fn load_image(&self, path: &Path) -> Result<(RawVolume, VolumeHeader)>;
    fn load_labels(&self, path: &Path) -> Result<LabelVolume>;
}

/// Writes label volumes
pub trait VolumeSink: Send + Sync {
    fn save(&self, path: &Path, volume: &Array3<u8>, header: &VolumeHeader, compress: bool) -> Result<()>;
}

/// Where the outputs of a file-based job go
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputPaths {
    pub final_labels: PathBuf,
    pub smoothed: PathBuf,
    pub uncertainty: PathBuf,
}

impl OutputPaths {
    /// Derive output paths next to `image`.
    ///
    /// `dir/brain.tif` gives `dir/final.brain.tif`, `dir/final.brain.smooth.tif`
    /// and `dir/final.brain.uncertainty.tif`. A `.gz` suffix counts as part of
    /// the extension (`scan.nii.gz` gives `final.scan.nii.gz`).
    ///
    /// Every output keeps the input's extension, the uncertainty map
    /// included, since the sink writes all outputs in the input's format.
    pub fn derive(image: &Path) -> Self {
        let dir = image.parent().map(Path::to_path_buf).unwrap_or_default();
        let name = image
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (stem, ext) = split_extension(&name);

        let base = format!("final.{}", stem);
        Self {
            final_labels: dir.join(format!("{}{}", base, ext)),
            smoothed: dir.join(format!("{}.smooth{}", base, ext)),
            uncertainty: dir.join(format!("{}.uncertainty{}", base, ext)),
        }
    }
}

/// Split `name` into stem and extension; `.gz` takes the extension before it along.
fn split_extension(name: &str) -> (&str, &str) {
    let split = |s: &str| match s.rfind('.') {
        Some(i) if i > 0 => i,
        _ => s.len(),
    };
    let mut cut = split(name);
    if &name[cut..] == ".gz" {
        cut = split(&name[..cut]);
    }
    (&name[..cut], &name[cut..])
}

/// Caller-supplied identifiers echoed back in reports
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobContext {
    pub user: Option<String>,
    pub label_id: Option<String>,
}

/// What the coordinator hands to the reporter when a job completes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionReport {
    pub job_id: Uuid,
    pub context: JobContext,
    /// Written outputs; empty for in-memory jobs
    pub outputs: Option<OutputPaths>,
    pub uncertainty: bool,
    pub smoothed: bool,
    pub elapsed_secs: u64,
    pub elapsed: String,
    pub image_size_mb: f64,
    pub finished_at: String,
}

/// Completion/failure callbacks for the surrounding application
pub trait JobReporter: Send + Sync {
    fn completed(&self, report: &CompletionReport);
    fn failed(&self, job_id: Uuid, context: &JobContext, reason: &str);
}

/// Reports through structured log events
#[derive(Debug, Clone, Default)]
pub struct LogReporter;

impl JobReporter for LogReporter {
    fn completed(&self, report: &CompletionReport) {
        tracing::info!(
            job_id = %report.job_id,
            user = report.context.user.as_deref().unwrap_or("-"),
            elapsed = %report.elapsed,
            image_mb = report.image_size_mb,
            output = ?report.outputs.as_ref().map(|o| o.final_labels.display().to_string()),
            "Segmentation completed"
        );
    }

    fn failed(&self, job_id: Uuid, context: &JobContext, reason: &str) {
        tracing::error!(
            job_id = %job_id,
            user = context.user.as_deref().unwrap_or("-"),
            reason,
            "Segmentation failed"
        );
    }
}

/// Human form of an elapsed time: `N sec`, `M min N sec`, `H h M min N sec`
pub fn time_string(secs: u64) -> String {
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{} h {} min {} sec", h, m, s)
    } else if m > 0 {
        format!("{} min {} sec", m, s)
    } else {
        format!("{} sec", s)
    }
}

/// Keeps saved volumes in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    saved: Mutex<HashMap<PathBuf, Array3<u8>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &Path) -> Option<Array3<u8>> {
        self.saved.lock().ok()?.get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.saved.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl VolumeSink for MemorySink {
    fn save(&self, path: &Path, volume: &Array3<u8>, _header: &VolumeHeader, _compress: bool) -> Result<()> {
        let mut saved = self
            .saved
            .lock()
            .map_err(|e| crate::errors::EngineError::Execution(e.to_string()))?;
        saved.insert(path.to_path_buf(), volume.clone());
        Ok(())
    }
}
