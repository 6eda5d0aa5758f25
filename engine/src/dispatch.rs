//! Dispatcher: tells every rank whether the job runs, in which mode and on
//! how many workers, then binds one device per active rank.
//!
//! Announcements go to the whole world; everything from the worker job on is
//! scoped to the active [`Group`].

use crate::device::{bind, Backend, DeviceHandle, DeviceInfo, DeviceProvider};
use crate::errors::{EngineError, Result};
use crate::planner::Mode;
use crate::transport::{recv_value, send_value, Communicator, Group, MessageKind, Tag};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Parameters every active worker needs for its walk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerJob {
    pub backend: Backend,
    pub mode: Mode,
    pub nbrw: u32,
    pub sorw: u32,
    pub allaxis: bool,
    /// Number of label channels
    pub nol: usize,
    pub uncertainty: bool,
    pub smooth: u32,
    pub max_chunk_elements: usize,
}

/// A rank's answer to the bind request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindStatus {
    pub rank: usize,
    pub device: Option<DeviceInfo>,
    pub error: Option<String>,
}

impl BindStatus {
    fn from_result(rank: usize, bound: &Result<DeviceHandle>) -> Self {
        match bound {
            Ok(handle) => Self {
                rank,
                device: Some(handle.info().clone()),
                error: None,
            },
            Err(e) => Self {
                rank,
                device: None,
                error: Some(e.to_string()),
            },
        }
    }
}

/// What a worker learns from the announcement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Announcement {
    /// The coordinator could not start the job
    NotExecutable,
    /// The job runs on ranks `0..workers`
    Run { mode: Mode, workers: usize },
}

impl Announcement {
    /// Whether `rank` takes part in the job
    pub fn is_active(&self, rank: usize) -> bool {
        match self {
            Announcement::NotExecutable => false,
            Announcement::Run { workers, .. } => rank < *workers,
        }
    }
}

/// Tell every worker rank that the job will not run
pub async fn announce_abort(comm: &dyn Communicator) -> Result<()> {
    for rank in 1..comm.size() {
        send_value(comm, rank, Tag::new(MessageKind::Executable), &false).await?;
    }
    debug!(world = comm.size(), "Job announced as not executable");
    Ok(())
}

/// Broadcast executability, mode and active worker count to every rank
pub async fn announce(comm: &dyn Communicator, mode: Mode, workers: usize) -> Result<()> {
    for rank in 1..comm.size() {
        send_value(comm, rank, Tag::new(MessageKind::Executable), &true).await?;
        send_value(comm, rank, Tag::new(MessageKind::Mode), &mode).await?;
        send_value(comm, rank, Tag::new(MessageKind::WorkerCount), &workers).await?;
    }
    info!(%mode, workers, world = comm.size(), "Job announced");
    Ok(())
}

/// Worker side of [`announce`] / [`announce_abort`]
pub async fn await_announcement(comm: &dyn Communicator) -> Result<Announcement> {
    let executable: bool = recv_value(comm, 0, Tag::new(MessageKind::Executable)).await?;
    if !executable {
        return Ok(Announcement::NotExecutable);
    }
    let mode: Mode = recv_value(comm, 0, Tag::new(MessageKind::Mode)).await?;
    let workers: usize = recv_value(comm, 0, Tag::new(MessageKind::WorkerCount)).await?;
    if workers == 0 || workers > comm.size() {
        return Err(EngineError::Protocol(format!(
            "announced {} workers in a world of {}",
            workers,
            comm.size()
        )));
    }
    Ok(Announcement::Run { mode, workers })
}

/// Root side: send the worker job, bind the root's own device, gather every
/// bind status and broadcast whether to proceed.
///
/// # Errors
/// `DeviceNotFound` for the backend when any member failed to bind. The
/// members have been told not to proceed by then.
pub async fn bind_group(
    group: &Group,
    provider: &dyn DeviceProvider,
    job: &WorkerJob,
) -> Result<DeviceHandle> {
    group.broadcast(Tag::new(MessageKind::WorkerJob), job).await?;

    let own = bind(provider, job.backend, group.rank());
    let statuses = group
        .gather(
            Tag::new(MessageKind::BindStatus),
            BindStatus::from_result(group.rank(), &own),
        )
        .await?;

    let failed: Vec<&BindStatus> = statuses.iter().filter(|s| s.error.is_some()).collect();
    let proceed = failed.is_empty();
    group.broadcast(Tag::new(MessageKind::Proceed), &proceed).await?;

    if !proceed {
        for s in &failed {
            warn!(rank = s.rank, error = s.error.as_deref().unwrap_or(""), "Device bind failed");
        }
        return Err(EngineError::DeviceNotFound(job.backend.to_string()));
    }

    info!(
        backend = %job.backend,
        devices = ?statuses
            .iter()
            .filter_map(|s| s.device.as_ref().map(|d| d.ordinal))
            .collect::<Vec<_>>(),
        "All ranks bound"
    );
    own
}

/// Member side of [`bind_group`]. Returns `None` when the root called the
/// job off; the device, if any, is released on return.
pub async fn join_group(
    group: &Group,
    provider: &dyn DeviceProvider,
) -> Result<Option<(WorkerJob, DeviceHandle)>> {
    let job: WorkerJob = group.recv_from_root(Tag::new(MessageKind::WorkerJob)).await?;

    let bound = bind(provider, job.backend, group.rank());
    group
        .send_to_root(
            Tag::new(MessageKind::BindStatus),
            &BindStatus::from_result(group.rank(), &bound),
        )
        .await?;

    let proceed: bool = group.recv_from_root(Tag::new(MessageKind::Proceed)).await?;
    match (proceed, bound) {
        (true, Ok(handle)) => Ok(Some((job, handle))),
        (true, Err(e)) => Err(EngineError::Protocol(format!(
            "told to proceed after failing to bind: {}",
            e
        ))),
        (false, _) => Ok(None),
    }
}
