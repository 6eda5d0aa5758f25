//! walkseg: distributed random-walk segmentation of 3-D volumes.
//!
//! A coordinator crops the volume to the labeled region, picks seed-parallel
//! or space-parallel execution, hands shards to workers over a
//! message-passing transport and turns the combined random-walk responses
//! into a label volume.

pub mod aggregate;
pub mod config;
pub mod device;
pub mod diffusion;
pub mod dispatch;
pub mod errors;
pub mod job;
pub mod kernel;
pub mod observability;
pub mod output;
pub mod planner;
pub mod postprocess;
pub mod region;
pub mod slices;
pub mod store;
pub mod transport;
pub mod volume;

pub use config::{EngineConfig, JobConfig, LabelFilter, LoggingConfig, PlannerConfig, TransportConfig};
pub use device::{Backend, DeviceInfo, DeviceProvider, Platform, StaticDevices, SystemDevices};
pub use errors::{EngineError, Result};
pub use job::{
    AbortReason, Engine, JobInput, JobOutcome, JobParticipant, JobSource, Participation, Segmentation,
    Services, WorkerStage,
};
pub use kernel::{DiffusionKernel, Feature, ReferenceWalk, WalkOutput, WalkRequest};
pub use observability::{init_production_logging, init_simple_logging, init_test_logging};
pub use output::{
    CompletionReport, JobContext, JobReporter, LogReporter, MemorySink, OutputPaths, VolumeHeader,
    VolumeSink, VolumeSource,
};
pub use planner::Mode;
pub use store::CborVolumeStore;
pub use transport::{Communicator, LocalCluster, TcpCommunicator};
pub use volume::{Array3, LabelVolume, RawVolume};
