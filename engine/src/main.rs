//! walkseg - Command Line Interface
//!
//! Random-walk segmentation of 3-D volumes from sparse slice labels.
//!
//! ## Commands
//!
//! - `run` - Run a job on an in-process cluster
//! - `coordinator` - Run a job as rank 0 of a TCP cluster
//! - `worker` - Serve one job as a worker rank of a TCP cluster
//! - `devices` - List detected compute devices
//! - `generate-config` - Write a default configuration file

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use walkseg::{
    init_production_logging, init_simple_logging, Backend, Communicator, DeviceProvider, Engine,
    EngineConfig, JobConfig, JobContext, JobInput, JobOutcome, JobSource, LabelFilter, Participation,
    Platform, SystemDevices, TcpCommunicator,
};

/// walkseg - distributed random-walk segmentation
#[derive(Parser, Debug)]
#[command(name = "walkseg")]
#[command(about = "Random-walk segmentation of 3-D volumes", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (default: ~/.walkseg/engine.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a job on an in-process cluster
    Run {
        #[command(flatten)]
        job: JobArgs,

        /// Number of ranks, coordinator included
        #[arg(short, long, default_value = "1")]
        workers: usize,
    },

    /// Run a job as rank 0 of a TCP cluster
    Coordinator {
        #[command(flatten)]
        job: JobArgs,

        /// Number of ranks, coordinator included (default: from config)
        #[arg(short, long)]
        world: Option<usize>,

        /// Address to accept workers on (default: from config)
        #[arg(long)]
        listen: Option<String>,
    },

    /// Serve one job as a worker rank of a TCP cluster
    Worker {
        /// This worker's rank (1..world)
        #[arg(short, long)]
        rank: usize,

        /// Number of ranks, coordinator included (default: from config)
        #[arg(short, long)]
        world: Option<usize>,

        /// Coordinator address (default: from config)
        #[arg(long)]
        coordinator: Option<String>,
    },

    /// List detected compute devices
    Devices,

    /// Write a default configuration file
    GenerateConfig {
        /// Destination (default: ~/.walkseg/engine.toml)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Job parameters shared by `run` and `coordinator`
#[derive(Args, Debug)]
struct JobArgs {
    /// Image volume
    image: PathBuf,

    /// Label volume (same shape as the image)
    labels: PathBuf,

    /// Random walks per seed voxel
    #[arg(long, default_value = "10")]
    nbrw: u32,

    /// Steps per random walk
    #[arg(long, default_value = "4000")]
    sorw: u32,

    /// Read seeds from all three orientations
    #[arg(long)]
    allaxis: bool,

    /// Smooth the input image before walking
    #[arg(long)]
    denoise: bool,

    /// Write an uncertainty volume
    #[arg(long)]
    uncertainty: bool,

    /// Labels to drop: "none" or a comma list such as "2,5"
    #[arg(long, default_value = "none")]
    ignore: LabelFilter,

    /// Labels to keep: "all" or a comma list such as "1,3"
    #[arg(long, default_value = "all")]
    only: LabelFilter,

    /// Write a smoothed result; the optional value sets the iterations
    #[arg(long, num_args = 0..=1, default_missing_value = "100")]
    smooth: Option<u32>,

    /// Write outputs uncompressed
    #[arg(long)]
    no_compression: bool,

    /// Compute platform (auto, cuda, opencl-gpu, opencl-cpu)
    #[arg(long, default_value = "auto")]
    platform: Platform,

    /// Keep the per-label hit maps (seed-parallel only)
    #[arg(long)]
    return_hits: bool,

    /// Caller identifier echoed in reports
    #[arg(long)]
    user: Option<String>,

    /// Label set identifier echoed in reports
    #[arg(long)]
    label_id: Option<String>,
}

impl JobArgs {
    fn into_input(self) -> JobInput {
        let config = JobConfig {
            nbrw: self.nbrw,
            sorw: self.sorw,
            allaxis: self.allaxis,
            ignore: self.ignore,
            only: self.only,
            smooth: self.smooth.unwrap_or(0),
            uncertainty: self.uncertainty,
            denoise: self.denoise,
            compression: !self.no_compression,
            platform: self.platform,
            return_hits: self.return_hits,
        };
        JobInput::new(JobSource::Files {
            image: self.image,
            labels: self.labels,
        })
        .with_config(config)
        .with_context(JobContext {
            user: self.user,
            label_id: self.label_id,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { job, workers } => {
            let config = load_config(cli.config.as_deref(), cli.log_level.as_deref())?;
            init_simple_logging(&config.logging.level)?;
            cmd_run(config, job, workers).await?;
        }

        Commands::Coordinator {
            job,
            world,
            listen,
        } => {
            let config = load_config(cli.config.as_deref(), cli.log_level.as_deref())?;
            init_logging(&config, 0)?;
            cmd_coordinator(config, job, world, listen).await?;
        }

        Commands::Worker {
            rank,
            world,
            coordinator,
        } => {
            let config = load_config(cli.config.as_deref(), cli.log_level.as_deref())?;
            init_logging(&config, rank)?;
            cmd_worker(config, rank, world, coordinator).await?;
        }

        Commands::Devices => {
            // No logging for devices (pure display)
            cmd_devices();
        }

        Commands::GenerateConfig { output, force } => {
            init_simple_logging(cli.log_level.as_deref().unwrap_or("info"))?;
            cmd_generate_config(output, force)?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&std::path::Path>, log_level: Option<&str>) -> Result<EngineConfig> {
    let mut config =
        EngineConfig::load_or_default(path).context("Failed to load configuration")?;
    if let Some(level) = log_level {
        config.logging.level = level.to_string();
        config.validate()?;
    }
    Ok(config)
}

fn init_logging(config: &EngineConfig, rank: usize) -> Result<()> {
    if config.logging.log_to_file {
        init_production_logging(&config.logging.level, Some(config.log_dir()), rank)
    } else {
        init_simple_logging(&config.logging.level)
    }
}

/// Run a job on an in-process cluster
async fn cmd_run(config: EngineConfig, job: JobArgs, workers: usize) -> Result<()> {
    let engine = Engine::new(config);
    let outcome = engine.run_local(job.into_input(), workers).await?;
    print_outcome(&outcome)
}

/// Run a job as rank 0 of a TCP cluster
async fn cmd_coordinator(
    config: EngineConfig,
    job: JobArgs,
    world: Option<usize>,
    listen: Option<String>,
) -> Result<()> {
    let world = world.unwrap_or(config.transport.world_size);
    let listen = listen.unwrap_or_else(|| config.transport.listen_addr.clone());

    println!("Waiting for {} worker(s) on {}...", world.saturating_sub(1), listen);
    let comm: Arc<dyn Communicator> = Arc::new(
        TcpCommunicator::coordinator(&listen, world)
            .await
            .context("Failed to assemble the cluster")?,
    );

    let engine = Engine::new(config);
    let participant = engine.participant(comm);
    match participant.participate(Some(job.into_input())).await? {
        Participation::Coordinated(outcome) => print_outcome(&outcome),
        Participation::Served(stage) => {
            anyhow::bail!("rank 0 acted as a worker (ended {:?})", stage)
        }
    }
}

/// Serve one job as a worker rank
async fn cmd_worker(
    config: EngineConfig,
    rank: usize,
    world: Option<usize>,
    coordinator: Option<String>,
) -> Result<()> {
    let world = world.unwrap_or(config.transport.world_size);
    let addr = coordinator.unwrap_or_else(|| config.transport.coordinator_addr.clone());
    let timeout = Duration::from_secs(config.transport.connect_timeout_secs);

    let comm: Arc<dyn Communicator> = Arc::new(
        TcpCommunicator::worker(&addr, rank, world, timeout)
            .await
            .with_context(|| format!("Failed to join the cluster at {}", addr))?,
    );

    let engine = Engine::new(config);
    match engine.participant(comm).participate(None).await {
        Ok(Participation::Served(stage)) => {
            info!(rank, ?stage, "Worker finished");
            Ok(())
        }
        Ok(Participation::Coordinated(_)) => anyhow::bail!("worker rank {} coordinated a job", rank),
        Err(e) => {
            error!(rank, error = %e, "Worker failed");
            Err(e.into())
        }
    }
}

/// List detected compute devices
fn cmd_devices() {
    let devices = SystemDevices::detect();
    let host = devices.host();

    println!("Host");
    println!("   CPU: {} ({} cores)", host.cpu_brand, host.cpu_cores);
    println!("   RAM: {} MB", host.ram_bytes / (1024 * 1024));
    println!("   OS: {} ({})", host.os, host.arch);

    for backend in Backend::PREFERENCE {
        let list = devices.devices(backend);
        println!("\n{} ({} device(s))", backend, list.len());
        for d in list {
            println!("   [{}] {}", d.ordinal, d.name);
        }
    }
}

/// Write a default configuration file
fn cmd_generate_config(output: Option<PathBuf>, force: bool) -> Result<()> {
    let path = match output {
        Some(p) => p,
        None => EngineConfig::default_path()?,
    };
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    EngineConfig::default().save(&path)?;
    println!("Configuration written to {}", path.display());
    Ok(())
}

fn print_outcome(outcome: &JobOutcome) -> Result<()> {
    for warning in &outcome.warnings {
        println!("warning: {}", warning);
    }

    match (&outcome.result, &outcome.failure) {
        (Some(result), _) => {
            println!(
                "Segmentation finished in {} ms ({}, {} worker(s))",
                outcome.execution_time_ms, result.mode, result.workers
            );
            if let Some(paths) = &result.outputs {
                println!("   Labels: {}", paths.final_labels.display());
                if result.smoothed.is_some() {
                    println!("   Smoothed: {}", paths.smoothed.display());
                }
                if result.uncertainty.is_some() {
                    println!("   Uncertainty: {}", paths.uncertainty.display());
                }
            }
            Ok(())
        }
        (None, Some(reason)) => anyhow::bail!("{}", reason),
        (None, None) => anyhow::bail!("job {} produced no result", outcome.job_id),
    }
}
