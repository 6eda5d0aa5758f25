use super::{Backend, DeviceInfo, DeviceProvider};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use sysinfo::System;

/// Host hardware summary.
///
/// Detected at runtime using the `sysinfo` crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostCapabilities {
    /// Number of logical CPU cores
    pub cpu_cores: usize,

    /// CPU model name
    pub cpu_brand: String,

    /// Total RAM in bytes
    pub ram_bytes: u64,

    /// Operating system
    pub os: String,

    /// CPU architecture
    pub arch: String,
}

impl HostCapabilities {
    /// Detect current host capabilities.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        let cpu_cores = sys.cpus().len();
        let cpu_brand = sys
            .cpus()
            .first()
            .map(|c| c.brand().trim().to_string())
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| "host cpu".to_string());

        Self {
            cpu_cores,
            cpu_brand,
            ram_bytes: sys.total_memory(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

/// Devices found on this machine.
///
/// CUDA devices are the `/dev/nvidiaN` nodes, OpenCL GPUs the DRM render
/// nodes, and the host CPU is always available as an OpenCL CPU device.
/// Device memory cannot be queried without a vendor runtime, so host RAM is
/// used as the memory budget for every device.
#[derive(Debug, Clone)]
pub struct SystemDevices {
    host: HostCapabilities,
    cuda_nodes: usize,
    render_nodes: usize,
}

impl SystemDevices {
    pub fn detect() -> Self {
        let host = HostCapabilities::detect();
        let cuda_nodes = count_nodes(Path::new("/dev"), |name| {
            name.strip_prefix("nvidia")
                .map(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
                .unwrap_or(false)
        });
        let render_nodes = count_nodes(Path::new("/dev/dri"), |name| name.starts_with("renderD"));

        tracing::debug!(
            cpu = %host.cpu_brand,
            cores = host.cpu_cores,
            cuda_nodes,
            render_nodes,
            "Devices detected"
        );

        Self {
            host,
            cuda_nodes,
            render_nodes,
        }
    }

    pub fn host(&self) -> &HostCapabilities {
        &self.host
    }

    /// Every detected device across backends
    pub fn all(&self) -> Vec<DeviceInfo> {
        Backend::PREFERENCE
            .iter()
            .flat_map(|&b| self.devices(b))
            .collect()
    }
}

fn count_nodes(dir: &Path, matches: impl Fn(&str) -> bool) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_str().map(&matches).unwrap_or(false))
                .count()
        })
        .unwrap_or(0)
}

impl DeviceProvider for SystemDevices {
    fn devices(&self, backend: Backend) -> Vec<DeviceInfo> {
        let (count, name) = match backend {
            Backend::Cuda => (self.cuda_nodes, "nvidia gpu"),
            Backend::OpenclGpu => (self.render_nodes, "render node"),
            Backend::OpenclCpu => (1, self.host.cpu_brand.as_str()),
        };
        (0..count)
            .map(|ordinal| DeviceInfo {
                backend,
                ordinal,
                name: name.to_string(),
                memory_bytes: self.host.ram_bytes,
            })
            .collect()
    }
}

/// Fixed device table, for tests and for pinning a deployment
#[derive(Debug, Clone, Default)]
pub struct StaticDevices {
    devices: HashMap<Backend, Vec<DeviceInfo>>,
}

impl StaticDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `count` devices of `backend`, each with `memory_bytes`
    pub fn with(mut self, backend: Backend, count: usize, memory_bytes: u64) -> Self {
        let list = self.devices.entry(backend).or_default();
        for _ in 0..count {
            let ordinal = list.len();
            list.push(DeviceInfo {
                backend,
                ordinal,
                name: format!("{}:{}", backend, ordinal),
                memory_bytes,
            });
        }
        self
    }
}

impl DeviceProvider for StaticDevices {
    fn devices(&self, backend: Backend) -> Vec<DeviceInfo> {
        self.devices.get(&backend).cloned().unwrap_or_default()
    }
}
