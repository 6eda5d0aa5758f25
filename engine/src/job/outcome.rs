//! Job inputs and results.

use crate::config::JobConfig;
use crate::errors::EngineError;
use crate::output::{JobContext, OutputPaths};
use crate::planner::Mode;
use crate::region::Region;
use crate::volume::{Array3, LabelVolume, RawVolume};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Where a job's volumes come from
#[derive(Debug, Clone)]
pub enum JobSource {
    /// Read through the volume source; outputs are written next to the image
    Files { image: PathBuf, labels: PathBuf },
    /// Volumes already in memory; nothing is written
    InMemory { image: RawVolume, labels: LabelVolume },
}

/// A segmentation request
#[derive(Debug, Clone)]
pub struct JobInput {
    pub job_id: Uuid,
    pub source: JobSource,
    pub config: JobConfig,
    pub context: JobContext,
}

impl JobInput {
    /// Create a new job with default parameters
    pub fn new(source: JobSource) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            source,
            config: JobConfig::default(),
            context: JobContext::default(),
        }
    }

    /// Set the job parameters
    pub fn with_config(mut self, config: JobConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the caller identifiers
    pub fn with_context(mut self, context: JobContext) -> Self {
        self.context = context;
        self
    }
}

/// Why a job stopped without output
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
    #[error("{0}")]
    Validation(String),

    #[error("At least one empty slice between labels required.")]
    LabelsAdjacent,

    #[error("No {0} device found.")]
    NoDevice(String),

    #[error("GPU out of memory. Image too large.")]
    MemoryExhausted,

    #[error("Communication failure: {0}")]
    Communication(String),

    #[error("Execution failed: {0}")]
    Execution(String),
}

impl From<EngineError> for AbortReason {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Validation(msg) => AbortReason::Validation(msg),
            EngineError::DeviceNotFound(platform) => AbortReason::NoDevice(platform),
            EngineError::MemoryExhausted(_) => AbortReason::MemoryExhausted,
            EngineError::Io(_)
            | EngineError::Transport(_)
            | EngineError::Protocol(_)
            | EngineError::Serialization(_) => AbortReason::Communication(e.to_string()),
            EngineError::Config(_) | EngineError::Shape(_) | EngineError::Execution(_) => {
                AbortReason::Execution(e.to_string())
            }
        }
    }
}

/// Label volumes produced by a successful job, all shaped like the input
#[derive(Debug, Clone)]
pub struct Segmentation {
    pub final_labels: Array3<u8>,
    pub uncertainty: Option<Array3<u8>>,
    pub smoothed: Option<Array3<u8>>,
    /// Summed hit map per dense label channel, shaped like the input
    /// (seed-parallel, on request)
    pub hits: Option<Vec<Array3<f32>>>,
    /// Region of interest in padded coordinates
    pub region: Region,
    pub mode: Mode,
    pub workers: usize,
    /// Files written, for file-based jobs
    pub outputs: Option<OutputPaths>,
}

/// Result of a job
#[derive(Debug, Clone)]
pub struct JobOutcome {
    /// Job ID this result corresponds to
    pub job_id: Uuid,
    /// Whether the job completed
    pub success: bool,
    /// Outputs (if successful)
    pub result: Option<Segmentation>,
    /// Abort reason (if failed)
    pub failure: Option<AbortReason>,
    /// Features dropped along the way
    pub warnings: Vec<String>,
    /// Total execution time in milliseconds
    pub execution_time_ms: u64,
}

impl JobOutcome {
    /// Create a successful outcome
    pub fn success(job_id: Uuid, result: Segmentation, execution_time_ms: u64) -> Self {
        Self {
            job_id,
            success: true,
            result: Some(result),
            failure: None,
            warnings: Vec::new(),
            execution_time_ms,
        }
    }

    /// Create a failed outcome
    pub fn failure(job_id: Uuid, reason: AbortReason, execution_time_ms: u64) -> Self {
        Self {
            job_id,
            success: false,
            result: None,
            failure: Some(reason),
            warnings: Vec::new(),
            execution_time_ms,
        }
    }

    /// Attach warnings
    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }
}
