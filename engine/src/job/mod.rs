//! Segmentation jobs: the coordinator and worker roles, their state and
//! their results.
//!
//! One participant runs per rank. Rank 0 is the [`Coordinator`], every
//! other rank a [`Worker`]; [`Engine::participant`] picks the role once.

pub mod coordinator;
pub mod outcome;
pub mod state;
pub mod worker;

pub use coordinator::Coordinator;
pub use outcome::{AbortReason, JobInput, JobOutcome, JobSource, Segmentation};
pub use state::{JobState, Stage, WorkerStage};
pub use worker::Worker;

use crate::config::EngineConfig;
use crate::device::{DeviceProvider, SystemDevices};
use crate::errors::{EngineError, Result};
use crate::kernel::{DiffusionKernel, ReferenceWalk};
use crate::output::{JobReporter, LogReporter, VolumeSink, VolumeSource};
use crate::store::CborVolumeStore;
use crate::transport::{Communicator, LocalCluster};
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long `run_local` waits for workers once the coordinator is done
const WORKER_GRACE: Duration = Duration::from_secs(10);

/// What a participant did in a job
#[derive(Debug)]
pub enum Participation {
    Coordinated(Box<JobOutcome>),
    Served(WorkerStage),
}

/// One rank's part in a job
#[async_trait]
pub trait JobParticipant: Send + Sync {
    fn rank(&self) -> usize;

    /// Take part in one job. Only the coordinator uses `input`.
    async fn participate(&self, input: Option<JobInput>) -> Result<Participation>;
}

/// Collaborators shared by every participant
#[derive(Clone)]
pub struct Services {
    pub kernel: Arc<dyn DiffusionKernel>,
    pub devices: Arc<dyn DeviceProvider>,
    pub source: Arc<dyn VolumeSource>,
    pub sink: Arc<dyn VolumeSink>,
    pub reporter: Arc<dyn JobReporter>,
}

impl Services {
    /// Reference kernel, detected devices, CBOR store, log reporter
    pub fn detect() -> Self {
        let store = Arc::new(CborVolumeStore::new());
        Self {
            kernel: Arc::new(ReferenceWalk::default()),
            devices: Arc::new(SystemDevices::detect()),
            source: store.clone(),
            sink: store,
            reporter: Arc::new(LogReporter),
        }
    }
}

/// Entry point for running jobs
pub struct Engine {
    config: EngineConfig,
    services: Services,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_services(config, Services::detect())
    }

    pub fn with_services(config: EngineConfig, services: Services) -> Self {
        Self { config, services }
    }

    pub fn with_kernel(mut self, kernel: Arc<dyn DiffusionKernel>) -> Self {
        self.services.kernel = kernel;
        self
    }

    pub fn with_devices(mut self, devices: Arc<dyn DeviceProvider>) -> Self {
        self.services.devices = devices;
        self
    }

    pub fn with_source(mut self, source: Arc<dyn VolumeSource>) -> Self {
        self.services.source = source;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn VolumeSink>) -> Self {
        self.services.sink = sink;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn JobReporter>) -> Self {
        self.services.reporter = reporter;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn coordinator(&self, comm: Arc<dyn Communicator>) -> Coordinator {
        Coordinator::new(comm, self.services.clone(), self.config.clone())
    }

    pub fn worker(&self, comm: Arc<dyn Communicator>) -> Worker {
        Worker::new(comm, self.services.clone())
    }

    /// The role for `comm`'s rank
    pub fn participant(&self, comm: Arc<dyn Communicator>) -> Box<dyn JobParticipant> {
        if comm.rank() == 0 {
            Box::new(self.coordinator(comm))
        } else {
            Box::new(self.worker(comm))
        }
    }

    /// Run one job on `world` in-process ranks
    pub async fn run_local(&self, input: JobInput, world: usize) -> Result<JobOutcome> {
        if world == 0 {
            return Err(EngineError::Config("world size must be at least 1".into()));
        }
        let mut comms = LocalCluster::new(world).into_iter();
        let root = comms
            .next()
            .ok_or_else(|| EngineError::Config("empty cluster".into()))?;

        let workers: Vec<_> = comms
            .map(|comm| {
                let rank = comm.rank();
                let worker = self.worker(comm);
                (rank, tokio::spawn(async move { worker.serve().await }))
            })
            .collect();

        info!(world, job_id = %input.job_id, "Running job in-process");
        let outcome = self.coordinator(root).run(input).await;

        join_all(workers.into_iter().map(|(rank, handle)| async move {
            let abort = handle.abort_handle();
            match tokio::time::timeout(WORKER_GRACE, handle).await {
                Ok(Ok(Ok(stage))) => debug!(rank, ?stage, "Worker finished"),
                Ok(Ok(Err(e))) => warn!(rank, error = %e, "Worker failed"),
                Ok(Err(e)) => warn!(rank, error = %e, "Worker task panicked"),
                Err(_) => {
                    warn!(rank, "Worker did not finish, cancelling");
                    abort.abort();
                }
            }
        }))
        .await;
        Ok(outcome)
    }
}
