//! Rank 0: prepares the job, plans it, hands out shards, runs its own shard
//! and turns the combined result into output volumes.

use super::outcome::{AbortReason, JobInput, JobOutcome, JobSource, Segmentation};
use super::state::{JobState, Stage};
use super::{JobParticipant, Participation, Services};
use crate::aggregate::{agree, collect_blocks, collect_responses, scatter, Combined, ResultStatus};
use crate::config::{EngineConfig, JobConfig};
use crate::device::{resolve_platform, Backend, DeviceHandle};
use crate::diffusion::{cut_shard, run_shard, send_shard, withdraw_shard, ShardResult};
use crate::dispatch::{announce, announce_abort, bind_group, WorkerJob};
use crate::errors::{EngineError, Result};
use crate::kernel::Feature;
use crate::output::{time_string, CompletionReport, OutputPaths, VolumeHeader};
use crate::planner::Plan;
use crate::postprocess::{derive, MemoryBudget};
use crate::region::{select_region, Region};
use crate::slices::{adjacent_pair, labeled_slices, SeedSlice};
use crate::transport::{Communicator, Group};
use crate::volume::preprocess::PADDING;
use crate::volume::{prepare, Array3, LabelMap, LabelVolume, VolumeData};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

type Abort<T> = std::result::Result<T, AbortReason>;

/// Validated input, ready for region selection
struct Loaded {
    image: VolumeData,
    labels: LabelVolume,
    label_map: LabelMap,
    original_shape: [usize; 3],
    header: VolumeHeader,
    outputs: Option<OutputPaths>,
    backend: Backend,
    /// Job parameters after capability checks
    config: JobConfig,
}

/// The region-cropped problem and its plan
struct Planned {
    region: Region,
    padded_shape: [usize; 3],
    image: VolumeData,
    /// Dense label channels over the region
    labels: LabelVolume,
    slices: Vec<SeedSlice>,
    plan: Plan,
}

/// Combined result at the root, dense labels over the region
struct Reduced {
    segmentation: Array3<u8>,
    uncertainty: Option<Array3<u8>>,
    smoothed: Option<Array3<u8>>,
    hits: Option<Vec<Array3<f32>>>,
}

pub struct Coordinator {
    comm: Arc<dyn Communicator>,
    services: Services,
    config: EngineConfig,
}

impl Coordinator {
    pub fn new(comm: Arc<dyn Communicator>, services: Services, config: EngineConfig) -> Self {
        Self {
            comm,
            services,
            config,
        }
    }

    /// Run one job to completion or abort. Failures are reported, not
    /// returned.
    #[instrument(skip_all, fields(job_id = %input.job_id, world = self.comm.size()))]
    pub async fn run(&self, input: JobInput) -> JobOutcome {
        let mut state = JobState::new();
        info!(
            user = input.context.user.as_deref().unwrap_or("-"),
            label_id = input.context.label_id.as_deref().unwrap_or("-"),
            "Segmentation job started"
        );

        match self.execute(&input, &mut state).await {
            Ok(result) => {
                let elapsed = state.elapsed_ms();
                JobOutcome::success(input.job_id, result, elapsed).with_warnings(state.take_warnings())
            }
            Err(reason) => {
                let stage = state.abort();
                error!(%stage, %reason, "Segmentation job aborted");
                self.services
                    .reporter
                    .failed(input.job_id, &input.context, &reason.to_string());
                let elapsed = state.elapsed_ms();
                JobOutcome::failure(input.job_id, reason, elapsed).with_warnings(state.take_warnings())
            }
        }
    }

    async fn execute(&self, input: &JobInput, state: &mut JobState) -> Abort<Segmentation> {
        state.advance(Stage::Preprocess)?;
        let loaded = match self.preprocess(input, state) {
            Ok(loaded) => loaded,
            Err(reason) => {
                self.cancel().await;
                return Err(reason);
            }
        };

        state.advance(Stage::ModeSelect)?;
        let planned = match self.select_mode(&loaded) {
            Ok(planned) => planned,
            Err(e) => {
                self.cancel().await;
                return Err(e.into());
            }
        };

        state.advance(Stage::Dispatch)?;
        let plan = &planned.plan;
        announce(self.comm.as_ref(), plan.mode, plan.workers).await?;
        let group = Group::new(self.comm.clone(), plan.workers)?;
        let job = WorkerJob {
            backend: loaded.backend,
            mode: plan.mode,
            nbrw: loaded.config.nbrw,
            sorw: loaded.config.sorw,
            allaxis: loaded.config.allaxis,
            nol: loaded.label_map.len(),
            uncertainty: loaded.config.uncertainty,
            smooth: loaded.config.smooth,
            max_chunk_elements: self.config.transport.max_chunk_elements,
        };
        let device = Arc::new(bind_group(&group, self.services.devices.as_ref(), &job).await?);

        state.advance(Stage::Compute)?;
        let result = self.compute(&group, &job, &planned, device.clone()).await;

        state.advance(Stage::Aggregate)?;
        let reduced = self
            .aggregate(&group, &job, &planned, result, &device, loaded.config.return_hits, state)
            .await?;

        state.advance(Stage::Postprocess)?;
        let padded_shape = planned.padded_shape;
        let region = planned.region;
        let restore = |dense: &Array3<u8>, remap: bool| -> Result<Array3<u8>> {
            let values = if remap {
                loaded.label_map.to_raw(dense)?
            } else {
                dense.clone()
            };
            scatter(&region, padded_shape, &values)?.unpad(PADDING)
        };
        let final_labels = restore(&reduced.segmentation, true)?;
        let uncertainty = reduced.uncertainty.as_ref().map(|u| restore(u, false)).transpose()?;
        let smoothed = reduced.smoothed.as_ref().map(|s| restore(s, true)).transpose()?;
        let hits = reduced
            .hits
            .map(|maps| {
                maps.iter()
                    .map(|h| -> Result<Array3<f32>> {
                        scatter(&region, padded_shape, h)?.unpad(PADDING)
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?;
        debug!(shape = ?final_labels.shape(), "Outputs restored to input geometry");
        if final_labels.shape() != loaded.original_shape {
            return Err(AbortReason::Execution(format!(
                "output {:?} does not match input {:?}",
                final_labels.shape(),
                loaded.original_shape
            )));
        }

        state.advance(Stage::Persist)?;
        let result = Segmentation {
            final_labels,
            uncertainty,
            smoothed,
            hits,
            region,
            mode: plan.mode,
            workers: plan.workers,
            outputs: loaded.outputs.clone(),
        };
        self.persist(input, &loaded, &result, state)?;

        state.advance(Stage::Done)?;
        Ok(result)
    }

    /// Tell every worker the job will not run. Errors are logged only; the
    /// job is already failing.
    async fn cancel(&self) {
        if let Err(e) = announce_abort(self.comm.as_ref()).await {
            warn!(error = %e, "Could not notify workers of abort");
        }
    }

    fn preprocess(&self, input: &JobInput, state: &mut JobState) -> Abort<Loaded> {
        let mut config = input.config.clone();
        config
            .validate()
            .map_err(|e| AbortReason::Validation(e.to_string()))?;

        let (raw, labels, header, outputs) = match &input.source {
            JobSource::Files { image, labels } => {
                let unreadable = |path: &std::path::Path, e: EngineError| {
                    AbortReason::Validation(format!("Cannot read {}: {}", path.display(), e))
                };
                let (raw, header) = self
                    .services
                    .source
                    .load_image(image)
                    .map_err(|e| unreadable(image.as_path(), e))?;
                let labels = self
                    .services
                    .source
                    .load_labels(labels)
                    .map_err(|e| unreadable(labels.as_path(), e))?;
                (raw, labels, header, Some(OutputPaths::derive(image)))
            }
            JobSource::InMemory { image, labels } => {
                (image.clone(), labels.clone(), VolumeHeader::default(), None)
            }
        };

        let prepared = prepare(raw, labels, &config)?;

        let slices = labeled_slices(&prepared.labels, config.allaxis);
        if slices.is_empty() {
            return Err(AbortReason::Validation("No labeled slices found.".into()));
        }
        if config.allaxis {
            if let Some((a, b)) = adjacent_pair(&slices) {
                warn!(?a, ?b, "Labeled slices touch");
                return Err(AbortReason::LabelsAdjacent);
            }
        }

        let backend = resolve_platform(self.services.devices.as_ref(), config.platform)?;
        let kernel = &self.services.kernel;
        if config.allaxis && !kernel.supports(Feature::AllAxis, backend) {
            return Err(AbortReason::Validation(format!(
                "Seeding from all axes is not supported on {}.",
                backend
            )));
        }
        if config.uncertainty && !kernel.supports(Feature::Uncertainty, backend) {
            warn!(%backend, "Uncertainty not supported. Continuing without uncertainty.");
            state.warn(format!("uncertainty is not supported on {}", backend));
            config.uncertainty = false;
        }
        if config.smooth > 0 && !kernel.supports(Feature::Smoothing, backend) {
            warn!(%backend, "Smoothing not supported. Continuing without smoothing.");
            state.warn(format!("smoothing is not supported on {}", backend));
            config.smooth = 0;
        }

        Ok(Loaded {
            image: prepared.image,
            labels: prepared.labels,
            label_map: prepared.label_map,
            original_shape: prepared.original_shape,
            header,
            outputs,
            backend,
            config,
        })
    }

    fn select_mode(&self, loaded: &Loaded) -> Result<Planned> {
        let padded_shape = loaded.labels.shape();
        let region = select_region(&loaded.labels, self.config.planner.margin);
        let image = loaded.image.crop(region.start, region.end)?;
        let labels = loaded
            .label_map
            .to_dense(&loaded.labels.crop(region.start, region.end)?)?;
        let slices = labeled_slices(&labels, loaded.config.allaxis);
        let plan = Plan::build(
            region.shape(),
            loaded.label_map.len(),
            &slices,
            self.comm.size(),
            &self.config.planner,
        );
        Ok(Planned {
            region,
            padded_shape,
            image,
            labels,
            slices,
            plan,
        })
    }

    /// Hand every member its shard, then run the root's own.
    ///
    /// After the first failed handoff the remaining members are withdrawn,
    /// so every member still reaches the status agreement.
    async fn compute(
        &self,
        group: &Group,
        job: &WorkerJob,
        planned: &Planned,
        device: Arc<DeviceHandle>,
    ) -> Result<ShardResult> {
        let mut failure = None;
        for rank in 1..group.size() {
            if failure.is_none() {
                let sent = match cut_shard(&planned.plan, rank, &planned.image, &planned.labels) {
                    Ok(shard) => send_shard(group, rank, &shard, job.max_chunk_elements).await,
                    Err(e) => Err(e),
                };
                match sent {
                    Ok(()) => continue,
                    Err(e) => {
                        warn!(rank, error = %e, "Shard handoff failed, withdrawing the rest");
                        failure = Some(e);
                    }
                }
            }
            if let Err(e) = withdraw_shard(group, rank).await {
                warn!(rank, error = %e, "Could not withdraw shard");
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }

        let own = cut_shard(&planned.plan, 0, &planned.image, &planned.labels)?;
        run_shard(self.services.kernel.clone(), device, job, own).await
    }

    async fn aggregate(
        &self,
        group: &Group,
        job: &WorkerJob,
        planned: &Planned,
        result: Result<ShardResult>,
        device: &DeviceHandle,
        return_hits: bool,
        state: &mut JobState,
    ) -> Abort<Reduced> {
        let status = match &result {
            Ok(r) => r.status(0),
            Err(e) => ResultStatus::failed(0, e.to_string()),
        };
        let collect = agree(group, status, job.uncertainty, job.smooth > 0).await?;

        if !collect.proceed {
            return Err(match result {
                Err(e) => e.into(),
                Ok(_) if collect.memory_exhausted => AbortReason::MemoryExhausted,
                Ok(_) => AbortReason::Execution("a worker failed to run its shard".into()),
            });
        }
        if job.uncertainty && !collect.uncertainty {
            state.warn("uncertainty disabled: out of device memory");
        }
        if job.smooth > 0 && !collect.smoothed {
            state.warn("smoothing disabled: out of device memory");
        }

        let max = job.max_chunk_elements;
        let combined = match result? {
            ShardResult::Responses { responses, .. } => {
                collect_responses(group, responses, max).await?
            }
            ShardResult::Block { block, .. } => collect_blocks(group, block, &collect, max).await?,
            ShardResult::OutOfMemory => return Err(AbortReason::MemoryExhausted),
        };
        let combined =
            combined.ok_or_else(|| EngineError::Protocol("root received no result".into()))?;

        match combined {
            Combined::Responses(responses) => {
                let budget = MemoryBudget::new(device.memory_bytes());
                let smooth = if collect.smoothed { job.smooth } else { 0 };
                let derived = derive(
                    &responses,
                    Some((&planned.labels, &planned.slices)),
                    collect.uncertainty,
                    smooth,
                    &budget,
                )?;
                for feature in &derived.degraded {
                    state.warn(format!("{} disabled: out of device memory", feature));
                }
                Ok(Reduced {
                    segmentation: derived.segmentation,
                    uncertainty: derived.uncertainty,
                    smoothed: derived.smoothed,
                    hits: return_hits.then_some(responses),
                })
            }
            Combined::Segmented {
                segmentation,
                uncertainty,
                smoothed,
            } => Ok(Reduced {
                segmentation,
                uncertainty,
                smoothed,
                hits: None,
            }),
        }
    }

    fn persist(
        &self,
        input: &JobInput,
        loaded: &Loaded,
        result: &Segmentation,
        state: &JobState,
    ) -> Abort<()> {
        let compress = loaded.config.compression;
        if let Some(paths) = &result.outputs {
            let sink = &self.services.sink;
            sink.save(&paths.final_labels, &result.final_labels, &loaded.header, compress)?;
            if let Some(smoothed) = &result.smoothed {
                sink.save(&paths.smoothed, smoothed, &loaded.header, compress)?;
            }
            if let Some(uncertainty) = &result.uncertainty {
                sink.save(&paths.uncertainty, uncertainty, &loaded.header, compress)?;
            }
            info!(path = %paths.final_labels.display(), "Outputs written");
        }

        let elapsed_secs = state.elapsed_secs();
        let report = CompletionReport {
            job_id: input.job_id,
            context: input.context.clone(),
            outputs: result.outputs.clone(),
            uncertainty: result.uncertainty.is_some(),
            smoothed: result.smoothed.is_some(),
            elapsed_secs,
            elapsed: time_string(elapsed_secs),
            image_size_mb: loaded.image.size_mb(),
            finished_at: chrono::Utc::now().to_rfc3339(),
        };
        self.services.reporter.completed(&report);
        Ok(())
    }
}

#[async_trait]
impl JobParticipant for Coordinator {
    fn rank(&self) -> usize {
        self.comm.rank()
    }

    async fn participate(&self, input: Option<JobInput>) -> Result<Participation> {
        let input = input
            .ok_or_else(|| EngineError::Config("the coordinator needs a job to run".into()))?;
        Ok(Participation::Coordinated(Box::new(self.run(input).await)))
    }
}
