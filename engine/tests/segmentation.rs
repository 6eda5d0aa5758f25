//! End-to-end segmentation jobs on an in-process cluster.
//!
//! Covers the successful path (in memory and file based) and every way a
//! job can stop before producing output.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;
use walkseg::device::DeviceHandle;
use walkseg::store::{StoredData, StoredVolume};
use walkseg::{
    init_test_logging, AbortReason, Array3, Backend, CborVolumeStore, CompletionReport,
    DiffusionKernel, Engine, EngineConfig, Feature, JobConfig, JobContext, JobInput, JobReporter,
    JobSource, LabelVolume, MemorySink, Mode, OutputPaths, Platform, RawVolume, ReferenceWalk,
    Services, StaticDevices, VolumeHeader, VolumeSource, WalkOutput, WalkRequest,
};

#[derive(Default)]
struct RecordingReporter {
    completed: Mutex<Vec<CompletionReport>>,
    failed: Mutex<Vec<String>>,
}

impl JobReporter for RecordingReporter {
    fn completed(&self, report: &CompletionReport) {
        self.completed.lock().unwrap().push(report.clone());
    }

    fn failed(&self, _job_id: Uuid, _context: &JobContext, reason: &str) {
        self.failed.lock().unwrap().push(reason.to_string());
    }
}

struct Harness {
    engine: Engine,
    sink: Arc<MemorySink>,
    reporter: Arc<RecordingReporter>,
}

fn harness(config: EngineConfig, devices: StaticDevices, kernel: Arc<dyn DiffusionKernel>) -> Harness {
    init_test_logging();
    let sink = Arc::new(MemorySink::new());
    let reporter = Arc::new(RecordingReporter::default());
    let services = Services {
        kernel,
        devices: Arc::new(devices),
        source: Arc::new(CborVolumeStore::new()),
        sink: sink.clone(),
        reporter: reporter.clone(),
    };
    Harness {
        engine: Engine::with_services(config, services),
        sink,
        reporter,
    }
}

fn cpu(memory: u64) -> StaticDevices {
    StaticDevices::new().with(Backend::OpenclCpu, 2, memory)
}

fn default_harness() -> Harness {
    harness(
        EngineConfig::default(),
        cpu(1 << 34),
        Arc::new(ReferenceWalk::default()),
    )
}

/// Image with a bright half (x >= half) and a dark half
fn two_tone(shape: [usize; 3]) -> Array3<u8> {
    let [dz, dy, dx] = shape;
    let mut image = Array3::zeros(shape);
    for z in 0..dz {
        for y in 0..dy {
            for x in 0..dx {
                image.set(z, y, x, if x >= dx / 2 { 200 } else { 40 });
            }
        }
    }
    image
}

/// One fully labeled Z-slice: label 1 on the dark half, 2 on the bright half
fn labeled_plane(shape: [usize; 3], z: usize) -> LabelVolume {
    let [_, dy, dx] = shape;
    let mut labels = Array3::zeros(shape);
    for y in 0..dy {
        for x in 0..dx {
            labels.set(z, y, x, if x >= dx / 2 { 2 } else { 1 });
        }
    }
    labels
}

fn in_memory(image: Array3<u8>, labels: LabelVolume, config: JobConfig) -> JobInput {
    JobInput::new(JobSource::InMemory {
        image: RawVolume::U8(image),
        labels,
    })
    .with_config(config)
}

fn quick() -> JobConfig {
    JobConfig {
        nbrw: 4,
        sorw: 40,
        ..JobConfig::default()
    }
}

// ============== Successful Jobs ==============

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_single_labeled_slice_end_to_end() {
    let shape = [50, 50, 50];
    let labels = labeled_plane(shape, 25);
    let config = JobConfig {
        nbrw: 10,
        sorw: 4000,
        ..JobConfig::default()
    };
    let h = default_harness();

    let outcome = h
        .engine
        .run_local(in_memory(two_tone(shape), labels.clone(), config), 2)
        .await
        .unwrap();

    assert!(outcome.success, "{:?}", outcome.failure);
    let result = outcome.result.unwrap();
    assert_eq!(result.final_labels.shape(), shape);
    assert_eq!(result.mode, Mode::SeedParallel);
    // one labeled slice keeps the second rank idle
    assert_eq!(result.workers, 1);
    assert!(result.final_labels.data().iter().all(|&v| v <= 2));

    let expected: Vec<u8> = labels.plane(25).iter().map(|&v| v as u8).collect();
    assert_eq!(result.final_labels.plane(25), expected.as_slice());

    // nothing written for in-memory jobs, but completion is reported
    assert!(h.sink.is_empty());
    let reports = h.reporter.completed.lock().unwrap();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].outputs.is_none());
}

#[tokio::test]
async fn test_labels_follow_intensity_edge() {
    let shape = [12, 16, 16];
    let labels = labeled_plane(shape, 6);
    let h = default_harness();

    let outcome = h
        .engine
        .run_local(
            in_memory(two_tone(shape), labels, JobConfig {
                nbrw: 8,
                sorw: 200,
                ..JobConfig::default()
            }),
            1,
        )
        .await
        .unwrap();

    let result = outcome.result.unwrap();
    // away from the labeled slice the dark half stays 1 and the bright half 2
    assert_eq!(result.final_labels.get(3, 8, 2), 1);
    assert_eq!(result.final_labels.get(9, 8, 13), 2);
}

#[tokio::test]
async fn test_optional_outputs_and_raw_label_ids() {
    let shape = [10, 12, 12];
    let mut labels = labeled_plane(shape, 5);
    for v in labels.data_mut() {
        if *v == 2 {
            *v = 7;
        }
    }
    let h = default_harness();
    let config = JobConfig {
        uncertainty: true,
        smooth: 5,
        return_hits: true,
        ..quick()
    };

    let outcome = h
        .engine
        .run_local(in_memory(two_tone(shape), labels, config), 1)
        .await
        .unwrap();
    let result = outcome.result.unwrap();

    // dense channels are mapped back to the raw label ids
    assert!(result.final_labels.data().contains(&7));
    assert!(result.final_labels.data().iter().all(|v| [0, 1, 7].contains(v)));

    let uncertainty = result.uncertainty.unwrap();
    assert_eq!(uncertainty.shape(), shape);
    let smoothed = result.smoothed.unwrap();
    assert!(smoothed.data().iter().all(|v| [0, 1, 7].contains(v)));

    // channels 0, 1 and 7, aligned with the label volume
    let hits = result.hits.unwrap();
    assert_eq!(hits.len(), 3);
    for h in &hits {
        assert_eq!(h.shape(), result.final_labels.shape());
    }
    // every seed voxel of the labeled slice starts walks on its own channel
    assert!(hits[1].get(5, 4, 2) > 0.0);
    assert!(hits[2].get(5, 4, 9) > 0.0);
    assert!(outcome.warnings.is_empty());
}

#[tokio::test]
async fn test_file_job_writes_outputs() {
    let dir = TempDir::new().unwrap();
    let image_path = dir.path().join("scan.vol");
    let labels_path = dir.path().join("scan.labels.vol");
    let store = CborVolumeStore::new();
    let shape = [10, 12, 12];
    let header = VolumeHeader {
        spacing: [2.0, 0.5, 0.5],
    };

    store
        .write(
            &image_path,
            &StoredVolume {
                header: header.clone(),
                data: StoredData::U8(two_tone(shape)),
            },
            false,
        )
        .unwrap();
    store
        .write(
            &labels_path,
            &StoredVolume {
                header: VolumeHeader::default(),
                data: StoredData::U8(labeled_plane(shape, 4).map(|v| v as u8)),
            },
            true,
        )
        .unwrap();

    let reporter = Arc::new(RecordingReporter::default());
    let engine = Engine::with_services(
        EngineConfig::default(),
        Services {
            kernel: Arc::new(ReferenceWalk::default()),
            devices: Arc::new(cpu(1 << 34)),
            source: Arc::new(store.clone()),
            sink: Arc::new(store.clone()),
            reporter: reporter.clone(),
        },
    );

    let input = JobInput::new(JobSource::Files {
        image: image_path.clone(),
        labels: labels_path,
    })
    .with_config(JobConfig {
        uncertainty: true,
        ..quick()
    })
    .with_context(JobContext {
        user: Some("alice".into()),
        label_id: Some("42".into()),
    });

    let outcome = engine.run_local(input, 2).await.unwrap();
    assert!(outcome.success, "{:?}", outcome.failure);
    let result = outcome.result.unwrap();

    let paths = OutputPaths::derive(&image_path);
    assert_eq!(result.outputs.as_ref(), Some(&paths));
    assert!(paths.final_labels.exists());
    assert!(paths.uncertainty.exists());
    assert!(!paths.smoothed.exists());

    let (written, written_header) = store.load_image(&paths.final_labels).unwrap();
    assert_eq!(written, RawVolume::U8(result.final_labels.clone()));
    assert_eq!(written_header, header);

    let reports = reporter.completed.lock().unwrap();
    assert_eq!(reports[0].context.user.as_deref(), Some("alice"));
    assert!(reports[0].uncertainty);
    assert!(!reports[0].smoothed);
}

// ============== Aborted Jobs ==============

#[tokio::test]
async fn test_adjacent_slices_abort_allaxis() {
    let dir = TempDir::new().unwrap();
    let image_path = dir.path().join("brain.vol");
    let labels_path = dir.path().join("brain.labels.vol");
    let store = CborVolumeStore::new();
    let shape = [50, 50, 50];

    let mut labels = labeled_plane(shape, 24);
    let upper = labeled_plane(shape, 25);
    for (a, b) in labels.data_mut().iter_mut().zip(upper.data()) {
        *a = (*a).max(*b);
    }
    store
        .write(
            &image_path,
            &StoredVolume {
                header: VolumeHeader::default(),
                data: StoredData::U8(two_tone(shape)),
            },
            false,
        )
        .unwrap();
    store
        .write(
            &labels_path,
            &StoredVolume {
                header: VolumeHeader::default(),
                data: StoredData::I32(labels),
            },
            false,
        )
        .unwrap();

    let h = default_harness();
    let input = JobInput::new(JobSource::Files {
        image: image_path.clone(),
        labels: labels_path,
    })
    .with_config(JobConfig {
        allaxis: true,
        ..quick()
    });

    let outcome = h.engine.run_local(input, 3).await.unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.failure, Some(AbortReason::LabelsAdjacent));
    assert_eq!(
        outcome.failure.unwrap().to_string(),
        "At least one empty slice between labels required."
    );

    let paths = OutputPaths::derive(&image_path);
    assert!(!paths.final_labels.exists());
    assert!(h.sink.is_empty());
    assert_eq!(h.reporter.failed.lock().unwrap().len(), 1);
    assert!(h.reporter.completed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_no_labeled_slices() {
    let shape = [8, 8, 8];
    let h = default_harness();
    let outcome = h
        .engine
        .run_local(in_memory(two_tone(shape), Array3::zeros(shape), quick()), 2)
        .await
        .unwrap();
    assert_eq!(
        outcome.failure,
        Some(AbortReason::Validation("No labeled slices found.".into()))
    );
}

#[tokio::test]
async fn test_shape_mismatch() {
    let h = default_harness();
    let outcome = h
        .engine
        .run_local(
            in_memory(two_tone([8, 8, 8]), labeled_plane([8, 8, 9], 4), quick()),
            1,
        )
        .await
        .unwrap();
    match outcome.failure {
        Some(AbortReason::Validation(msg)) => assert!(msg.contains("do not match")),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_label_out_of_range() {
    let shape = [8, 8, 8];
    let mut labels = labeled_plane(shape, 4);
    labels.set(4, 3, 3, 300);
    let h = default_harness();
    let outcome = h
        .engine
        .run_local(in_memory(two_tone(shape), labels, quick()), 1)
        .await
        .unwrap();
    assert!(matches!(outcome.failure, Some(AbortReason::Validation(_))));
}

#[tokio::test]
async fn test_missing_platform() {
    let shape = [8, 8, 8];
    let h = default_harness();
    let config = JobConfig {
        platform: Platform::Cuda,
        ..quick()
    };
    let outcome = h
        .engine
        .run_local(in_memory(two_tone(shape), labeled_plane(shape, 4), config), 2)
        .await
        .unwrap();
    let reason = outcome.failure.unwrap();
    assert_eq!(reason, AbortReason::NoDevice("cuda".into()));
    assert_eq!(reason.to_string(), "No cuda device found.");
}

#[tokio::test]
async fn test_core_memory_exhaustion_aborts() {
    let shape = [12, 10, 10];
    let mut labels = labeled_plane(shape, 3);
    let second = labeled_plane(shape, 8);
    for (a, b) in labels.data_mut().iter_mut().zip(second.data()) {
        *a = (*a).max(*b);
    }
    let h = harness(
        EngineConfig::default(),
        cpu(4096),
        Arc::new(ReferenceWalk::default()),
    );

    let outcome = h
        .engine
        .run_local(in_memory(two_tone(shape), labels, quick()), 2)
        .await
        .unwrap();
    assert_eq!(outcome.failure, Some(AbortReason::MemoryExhausted));
    assert_eq!(
        outcome.failure.unwrap().to_string(),
        "GPU out of memory. Image too large."
    );
    assert!(h.sink.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_shard_handoff_aborts() {
    let shape = [15, 12, 12];
    let mut labels = labeled_plane(shape, 2);
    for z in [7, 12] {
        let more = labeled_plane(shape, z);
        for (a, b) in labels.data_mut().iter_mut().zip(more.data()) {
            *a = (*a).max(*b);
        }
    }
    // valid, but shorter than one padded row
    let mut config = EngineConfig::default();
    config.transport.max_chunk_elements = 4;
    assert!(config.validate().is_ok());
    let h = harness(config, cpu(1 << 34), Arc::new(ReferenceWalk::default()));

    let outcome = tokio::time::timeout(
        Duration::from_secs(20),
        h.engine.run_local(in_memory(two_tone(shape), labels, quick()), 3),
    )
    .await
    .expect("job must finish after a failed handoff")
    .unwrap();

    assert!(!outcome.success);
    match outcome.failure {
        Some(AbortReason::Communication(msg)) => assert!(msg.contains("chunk ceiling")),
        other => panic!("unexpected {:?}", other),
    }
    assert!(outcome.result.is_none());
    assert!(h.sink.is_empty());
    assert_eq!(h.reporter.failed.lock().unwrap().len(), 1);
}

// ============== Feature Degradation ==============

/// Reference walk on a backend that cannot compute uncertainty
struct NoUncertainty(ReferenceWalk);

impl DiffusionKernel for NoUncertainty {
    fn name(&self) -> &str {
        "no-uncertainty"
    }

    fn supports(&self, feature: Feature, _backend: Backend) -> bool {
        feature != Feature::Uncertainty
    }

    fn walk(&self, request: &WalkRequest, device: &DeviceHandle) -> walkseg::Result<WalkOutput> {
        self.0.walk(request, device)
    }
}

/// Reference walk that runs out of memory for smoothing
struct SmoothingExhausted(ReferenceWalk);

impl DiffusionKernel for SmoothingExhausted {
    fn name(&self) -> &str {
        "smoothing-exhausted"
    }

    fn walk(&self, request: &WalkRequest, device: &DeviceHandle) -> walkseg::Result<WalkOutput> {
        let mut output = self.0.walk(request, device)?;
        if request.smooth > 0 {
            output.degraded.push(Feature::Smoothing);
        }
        Ok(output)
    }
}

#[tokio::test]
async fn test_unsupported_feature_is_dropped_with_warning() {
    let shape = [10, 12, 12];
    let h = harness(
        EngineConfig::default(),
        cpu(1 << 34),
        Arc::new(NoUncertainty(ReferenceWalk::default())),
    );
    let config = JobConfig {
        uncertainty: true,
        ..quick()
    };

    let outcome = h
        .engine
        .run_local(in_memory(two_tone(shape), labeled_plane(shape, 5), config), 1)
        .await
        .unwrap();
    assert!(outcome.success);
    assert!(outcome.result.unwrap().uncertainty.is_none());
    assert_eq!(outcome.warnings.len(), 1);
    assert!(outcome.warnings[0].contains("uncertainty"));
}

#[tokio::test]
async fn test_feature_memory_exhaustion_keeps_core_result() {
    let shape = [30, 8, 8];
    let mut config = EngineConfig::default();
    // force space-parallel with two blocks
    config.planner.total_bytes_limit = 1;
    config.planner.block_granularity = 10;
    config.planner.ghost = 4;
    let h = harness(config, cpu(1 << 34), Arc::new(SmoothingExhausted(ReferenceWalk::default())));

    let mut labels = labeled_plane(shape, 5);
    let second = labeled_plane(shape, 24);
    for (a, b) in labels.data_mut().iter_mut().zip(second.data()) {
        *a = (*a).max(*b);
    }
    let job = JobConfig {
        uncertainty: true,
        smooth: 3,
        nbrw: 2,
        sorw: 3,
        ..JobConfig::default()
    };

    let outcome = h
        .engine
        .run_local(in_memory(two_tone(shape), labels, job), 2)
        .await
        .unwrap();
    assert!(outcome.success, "{:?}", outcome.failure);
    let result = outcome.result.unwrap();
    assert_eq!(result.mode, Mode::SpaceParallel);
    assert_eq!(result.workers, 2);
    assert!(result.smoothed.is_none());
    assert!(result.uncertainty.is_some());
    assert!(outcome.warnings.iter().any(|w| w.contains("smoothing")));
}

#[test]
fn test_store_source_reads_label_files() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("labels.vol");
    let store = CborVolumeStore::new();
    let labels = labeled_plane([4, 4, 4], 2).map(|v| v as u8);
    store
        .write(
            &path,
            &StoredVolume {
                header: VolumeHeader::default(),
                data: StoredData::U8(labels.clone()),
            },
            true,
        )
        .unwrap();
    assert_eq!(
        store.load_labels(Path::new(&path)).unwrap(),
        labels.map(i32::from)
    );
}
