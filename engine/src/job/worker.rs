//! Ranks 1..W: wait for the announcement, bind, walk, return.

use super::state::WorkerStage;
use super::{JobParticipant, Participation, Services};
use crate::aggregate::{agree, collect_blocks, collect_responses, ResultStatus};
use crate::diffusion::{recv_shard, run_shard, ShardResult};
use crate::dispatch::{await_announcement, join_group, Announcement};
use crate::errors::{EngineError, Result};
use crate::job::JobInput;
use crate::transport::{Communicator, Group};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

pub struct Worker {
    comm: Arc<dyn Communicator>,
    services: Services,
}

impl Worker {
    pub fn new(comm: Arc<dyn Communicator>, services: Services) -> Self {
        Self { comm, services }
    }

    /// Take part in one job; returns the stage the worker ended in.
    #[instrument(skip_all, fields(rank = self.comm.rank()))]
    pub async fn serve(&self) -> Result<WorkerStage> {
        let rank = self.comm.rank();
        debug!(stage = ?WorkerStage::IdleWait, "Waiting for job");

        let (mode, workers) = match await_announcement(self.comm.as_ref()).await? {
            Announcement::NotExecutable => {
                info!("Job not executable");
                return Ok(WorkerStage::Aborted);
            }
            Announcement::Run { mode, workers } if rank < workers => (mode, workers),
            Announcement::Run { workers, .. } => {
                info!(workers, "Not needed for this job");
                return Ok(WorkerStage::Skipped);
            }
        };

        let group = Group::new(self.comm.clone(), workers)?;
        let (job, device) = match join_group(&group, self.services.devices.as_ref()).await? {
            Some(bound) => bound,
            None => {
                info!("Coordinator called the job off after binding");
                return Ok(WorkerStage::Aborted);
            }
        };
        if job.mode != mode {
            return Err(EngineError::Protocol(format!(
                "announced {} but the worker job says {}",
                mode, job.mode
            )));
        }
        debug!(stage = ?WorkerStage::Bound, device = %device.info().name, "Device bound");

        // a missing shard still reports a status so the agreement completes
        let result = match recv_shard(&group).await {
            Ok(Some(shard)) => {
                debug!(stage = ?WorkerStage::Compute, shape = ?shard.labels.shape(), "Shard received");
                run_shard(self.services.kernel.clone(), Arc::new(device), &job, shard).await
            }
            Ok(None) => Err(EngineError::Execution("shard withdrawn by the coordinator".into())),
            Err(e) => Err(e),
        };

        debug!(stage = ?WorkerStage::Return, "Reporting status");
        let status = match &result {
            Ok(r) => r.status(rank),
            Err(e) => {
                warn!(error = %e, "Shard failed");
                ResultStatus::failed(rank, e.to_string())
            }
        };
        let plan = agree(&group, status, job.uncertainty, job.smooth > 0).await?;
        if !plan.proceed {
            info!("Job aborted after compute");
            return Ok(WorkerStage::Aborted);
        }

        let max = job.max_chunk_elements;
        match result? {
            ShardResult::Responses { responses, .. } => {
                collect_responses(&group, responses, max).await?;
            }
            ShardResult::Block { block, .. } => {
                collect_blocks(&group, block, &plan, max).await?;
            }
            ShardResult::OutOfMemory => {
                return Err(EngineError::Protocol(
                    "told to proceed after running out of memory".into(),
                ))
            }
        }

        info!("Results returned");
        Ok(WorkerStage::Done)
    }
}

#[async_trait]
impl JobParticipant for Worker {
    fn rank(&self) -> usize {
        self.comm.rank()
    }

    async fn participate(&self, _input: Option<JobInput>) -> Result<Participation> {
        Ok(Participation::Served(self.serve().await?))
    }
}
