//! Compute device discovery and per-rank binding.

pub mod capabilities;

pub use capabilities::{HostCapabilities, StaticDevices, SystemDevices};

use crate::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

/// Requested compute platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Platform {
    /// First available of cuda, opencl-gpu, opencl-cpu
    Auto,
    Cuda,
    OpenclGpu,
    OpenclCpu,
}

/// A concrete backend, the result of resolving a [`Platform`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    Cuda,
    OpenclGpu,
    OpenclCpu,
}

impl Backend {
    /// Preference order used by `Platform::Auto`
    pub const PREFERENCE: [Backend; 3] = [Backend::Cuda, Backend::OpenclGpu, Backend::OpenclCpu];
}

impl From<Backend> for Platform {
    fn from(b: Backend) -> Self {
        match b {
            Backend::Cuda => Platform::Cuda,
            Backend::OpenclGpu => Platform::OpenclGpu,
            Backend::OpenclCpu => Platform::OpenclCpu,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Platform::Auto => "auto",
            Platform::Cuda => "cuda",
            Platform::OpenclGpu => "opencl-gpu",
            Platform::OpenclCpu => "opencl-cpu",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Platform::from(*self).fmt(f)
    }
}

impl FromStr for Platform {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "auto" => Ok(Platform::Auto),
            "cuda" => Ok(Platform::Cuda),
            "opencl-gpu" => Ok(Platform::OpenclGpu),
            "opencl-cpu" => Ok(Platform::OpenclCpu),
            other => Err(EngineError::Config(format!(
                "Unknown platform '{}' (expected auto, cuda, opencl-gpu or opencl-cpu)",
                other
            ))),
        }
    }
}

/// One device a rank can bind to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub backend: Backend,
    pub ordinal: usize,
    pub name: String,
    /// Memory budget for allocations on this device
    pub memory_bytes: u64,
}

/// Source of device listings
pub trait DeviceProvider: Send + Sync {
    /// Devices of `backend`, ordered by ordinal
    fn devices(&self, backend: Backend) -> Vec<DeviceInfo>;
}

/// A device bound to one rank for the duration of a job.
///
/// Released when dropped, on success and failure paths alike.
#[derive(Debug)]
pub struct DeviceHandle {
    info: DeviceInfo,
    rank: usize,
}

impl DeviceHandle {
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn memory_bytes(&self) -> u64 {
        self.info.memory_bytes
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        debug!(
            rank = self.rank,
            backend = %self.info.backend,
            ordinal = self.info.ordinal,
            "Device released"
        );
    }
}

/// Pick the backend for `platform`.
///
/// # Errors
/// `DeviceNotFound` when the platform (or, for `auto`, every platform) has
/// no devices.
pub fn resolve_platform(provider: &dyn DeviceProvider, platform: Platform) -> Result<Backend> {
    let candidates: Vec<Backend> = match platform {
        Platform::Auto => Backend::PREFERENCE.to_vec(),
        Platform::Cuda => vec![Backend::Cuda],
        Platform::OpenclGpu => vec![Backend::OpenclGpu],
        Platform::OpenclCpu => vec![Backend::OpenclCpu],
    };

    for backend in candidates {
        let count = provider.devices(backend).len();
        if count > 0 {
            info!(%platform, %backend, devices = count, "Platform resolved");
            return Ok(backend);
        }
    }
    Err(EngineError::DeviceNotFound(platform.to_string()))
}

/// Bind `rank` to device `rank % count` of `backend`
pub fn bind(provider: &dyn DeviceProvider, backend: Backend, rank: usize) -> Result<DeviceHandle> {
    let devices = provider.devices(backend);
    if devices.is_empty() {
        return Err(EngineError::DeviceNotFound(backend.to_string()));
    }
    let info = devices[rank % devices.len()].clone();
    debug!(rank, %backend, ordinal = info.ordinal, name = %info.name, "Device bound");
    Ok(DeviceHandle { info, rank })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_parsing() {
        assert_eq!("auto".parse::<Platform>().unwrap(), Platform::Auto);
        assert_eq!("CUDA".parse::<Platform>().unwrap(), Platform::Cuda);
        assert_eq!("opencl_gpu".parse::<Platform>().unwrap(), Platform::OpenclGpu);
        assert_eq!("opencl-cpu".parse::<Platform>().unwrap(), Platform::OpenclCpu);
        assert!("metal".parse::<Platform>().is_err());
        assert_eq!(Platform::OpenclGpu.to_string(), "opencl-gpu");
    }

    #[test]
    fn test_auto_prefers_cuda() {
        let provider = StaticDevices::new()
            .with(Backend::OpenclCpu, 1, 1 << 30)
            .with(Backend::Cuda, 2, 1 << 30);
        assert_eq!(resolve_platform(&provider, Platform::Auto).unwrap(), Backend::Cuda);
    }

    #[test]
    fn test_auto_falls_back() {
        let provider = StaticDevices::new().with(Backend::OpenclCpu, 1, 1 << 30);
        assert_eq!(
            resolve_platform(&provider, Platform::Auto).unwrap(),
            Backend::OpenclCpu
        );
    }

    #[test]
    fn test_missing_platform() {
        let provider = StaticDevices::new().with(Backend::OpenclCpu, 1, 1 << 30);
        let err = resolve_platform(&provider, Platform::Cuda).unwrap_err();
        assert_eq!(err.to_string(), "No cuda device found.");

        let none = StaticDevices::new();
        assert!(resolve_platform(&none, Platform::Auto).is_err());
    }

    #[test]
    fn test_bind_round_robin() {
        let provider = StaticDevices::new().with(Backend::Cuda, 2, 1 << 30);
        let a = bind(&provider, Backend::Cuda, 0).unwrap();
        let b = bind(&provider, Backend::Cuda, 3).unwrap();
        assert_eq!(a.info().ordinal, 0);
        assert_eq!(b.info().ordinal, 1);
        assert_eq!(b.rank(), 3);
        assert!(bind(&provider, Backend::OpenclGpu, 0).is_err());
    }
}
