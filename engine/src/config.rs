use crate::device::Platform;
use crate::errors::{EngineError, Result};
use crate::transport::MAX_CHUNK_ELEMENTS;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Engine-wide configuration loaded from `~/.walkseg/engine.toml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub planner: PlannerConfig,
    pub transport: TransportConfig,
    pub logging: LoggingConfig,
}

/// Scheduling and decomposition constants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Seed-parallel requires `bytes * labels` strictly below this
    pub total_bytes_limit: u64,
    /// Seed-parallel requires one channel strictly below this
    pub channel_bytes_limit: u64,
    /// Region margin per axis (z, y, x)
    pub margin: [usize; 3],
    /// Ghost planes added on each side of a space-parallel block
    pub ghost: usize,
    /// Minimum planes per space-parallel worker
    pub block_granularity: usize,
}

/// Message-passing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Largest number of array elements carried by one chunk message
    pub max_chunk_elements: usize,
    /// Number of ranks, coordinator included
    pub world_size: usize,
    pub listen_addr: String,
    pub coordinator_addr: String,
    pub connect_timeout_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub log_to_file: bool,
    pub log_dir: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            planner: PlannerConfig::default(),
            transport: TransportConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                log_to_file: false,
                log_dir: "~/.walkseg/logs".to_string(),
            },
        }
    }
}

impl Default for PlannerConfig {
    fn default() -> Self {
        PlannerConfig {
            total_bytes_limit: 10_000_000_000,
            channel_bytes_limit: 2_000_000_000,
            margin: [100, 100, 100],
            ghost: 100,
            block_granularity: 100,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            max_chunk_elements: 4_194_304,
            world_size: 1,
            listen_addr: "0.0.0.0:7400".to_string(),
            coordinator_addr: "127.0.0.1:7400".to_string(),
            connect_timeout_secs: 30,
        }
    }
}

impl EngineConfig {
    /// Get default configuration file path: `~/.walkseg/engine.toml`
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Cannot determine home directory".into()))?;
        Ok(home.join(".walkseg").join("engine.toml"))
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "Loading configuration");

        let content = std::fs::read_to_string(path).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "Failed to read config file");
            e
        })?;

        let config: EngineConfig = toml::from_str(&content)?;

        config.validate()?;

        tracing::info!("Configuration loaded successfully");
        Ok(config)
    }

    /// Load from `path` if given, else from the default path when it exists,
    /// else fall back to defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => {
                let default = Self::default_path()?;
                if default.exists() {
                    Self::load(&default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.planner.total_bytes_limit == 0 || self.planner.channel_bytes_limit == 0 {
            return Err(EngineError::Config(
                "planner byte limits must be positive".into(),
            ));
        }

        if self.planner.block_granularity == 0 {
            return Err(EngineError::Config(
                "block_granularity must be at least 1".into(),
            ));
        }

        if self.transport.max_chunk_elements == 0 {
            return Err(EngineError::Config(
                "max_chunk_elements must be at least 1".into(),
            ));
        }

        if self.transport.max_chunk_elements > MAX_CHUNK_ELEMENTS {
            return Err(EngineError::Config(format!(
                "max_chunk_elements must be at most {} to fit one frame",
                MAX_CHUNK_ELEMENTS
            )));
        }

        if self.transport.world_size == 0 {
            return Err(EngineError::Config(
                "world_size must be at least 1".into(),
            ));
        }

        self.transport
            .listen_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|e| EngineError::Config(format!("Invalid listen address: {}", e)))?;

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(EngineError::Config(
                    "log level must be one of: trace, debug, info, warn, error".into(),
                ))
            }
        }

        Ok(())
    }

    /// Expanded log directory (`~` resolved)
    pub fn log_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.logging.log_dir).into_owned())
    }

    /// Save configuration to file (atomic write)
    pub fn save(&self, path: &Path) -> Result<()> {
        tracing::info!(path = %path.display(), "Saving configuration");

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                tracing::error!(
                    path = %parent.display(),
                    error = %e,
                    "Failed to create config directory"
                );
                e
            })?;
        }

        let toml_string = toml::to_string_pretty(self)?;

        // Atomic write: write to temp file, then rename
        let temp_path = path.with_extension("toml.tmp");
        std::fs::write(&temp_path, &toml_string).map_err(|e| {
            tracing::error!(
                path = %temp_path.display(),
                error = %e,
                "Failed to write temp config file"
            );
            e
        })?;

        std::fs::rename(&temp_path, path).map_err(|e| {
            tracing::error!(
                from = %temp_path.display(),
                to = %path.display(),
                error = %e,
                "Failed to rename temp config file"
            );
            e
        })?;

        tracing::info!(path = %path.display(), "Configuration saved successfully");
        Ok(())
    }
}

/// Label subset used by the `ignore` and `only` options.
///
/// Parsed from `"none"`, `"all"` or a comma separated list such as `"2,5,6"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LabelFilter {
    None,
    All,
    Ids(Vec<i32>),
}

impl LabelFilter {
    /// Whether `label` is selected by this filter
    pub fn contains(&self, label: i32) -> bool {
        match self {
            LabelFilter::None => false,
            LabelFilter::All => true,
            LabelFilter::Ids(ids) => ids.contains(&label),
        }
    }
}

impl FromStr for LabelFilter {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "none" | "" => Ok(LabelFilter::None),
            "all" => Ok(LabelFilter::All),
            list => {
                let ids = list
                    .split(',')
                    .map(|part| {
                        part.trim().parse::<i32>().map_err(|_| {
                            EngineError::Config(format!("Invalid label id '{}'", part.trim()))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(LabelFilter::Ids(ids))
            }
        }
    }
}

impl TryFrom<String> for LabelFilter {
    type Error = EngineError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<LabelFilter> for String {
    fn from(f: LabelFilter) -> String {
        f.to_string()
    }
}

impl fmt::Display for LabelFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelFilter::None => write!(f, "none"),
            LabelFilter::All => write!(f, "all"),
            LabelFilter::Ids(ids) => {
                let parts: Vec<String> = ids.iter().map(|i| i.to_string()).collect();
                write!(f, "{}", parts.join(","))
            }
        }
    }
}

/// Per-job parameters. Immutable once the job starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Number of random walks started per seed voxel
    pub nbrw: u32,
    /// Steps per random walk
    pub sorw: u32,
    /// Read seeds from all three orientations
    pub allaxis: bool,
    pub ignore: LabelFilter,
    pub only: LabelFilter,
    /// Smoothing iterations, 0 disables smoothing
    pub smooth: u32,
    pub uncertainty: bool,
    pub denoise: bool,
    pub compression: bool,
    pub platform: Platform,
    /// Return per-label hit maps (seed-parallel only)
    pub return_hits: bool,
}

impl Default for JobConfig {
    fn default() -> Self {
        JobConfig {
            nbrw: 10,
            sorw: 4000,
            allaxis: false,
            ignore: LabelFilter::None,
            only: LabelFilter::All,
            smooth: 0,
            uncertainty: false,
            denoise: false,
            compression: true,
            platform: Platform::Auto,
            return_hits: false,
        }
    }
}

impl JobConfig {
    /// Smoothing iterations used when smoothing is requested without a value
    pub const DEFAULT_SMOOTH: u32 = 100;

    pub fn validate(&self) -> Result<()> {
        if self.nbrw == 0 {
            return Err(EngineError::Config("nbrw must be at least 1".into()));
        }
        if self.sorw == 0 {
            return Err(EngineError::Config("sorw must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();

        assert_eq!(config.planner.total_bytes_limit, 10_000_000_000);
        assert_eq!(config.planner.channel_bytes_limit, 2_000_000_000);
        assert_eq!(config.planner.margin, [100, 100, 100]);
        assert_eq!(config.planner.ghost, 100);
        assert_eq!(config.transport.max_chunk_elements, 4_194_304);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_config_validation() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_limits() {
        let mut config = EngineConfig::default();
        config.transport.max_chunk_elements = 0;
        assert!(config.validate().is_err());

        config.transport.max_chunk_elements = 16;
        config.planner.block_granularity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_chunk_ceiling_must_fit_a_frame() {
        let mut config = EngineConfig::default();
        config.transport.max_chunk_elements = MAX_CHUNK_ELEMENTS;
        assert!(config.validate().is_ok());

        config.transport.max_chunk_elements = 13_500_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_listen_addr() {
        let mut config = EngineConfig::default();
        config.transport.listen_addr = "not-an-address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = EngineConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("engine.toml");

        let mut original = EngineConfig::default();
        original.transport.world_size = 4;
        original.save(&config_path).expect("save should succeed");

        assert!(config_path.exists());

        let loaded = EngineConfig::load(&config_path).expect("load should succeed");
        assert_eq!(original, loaded);
    }

    #[test]
    fn test_atomic_write() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("engine.toml");

        EngineConfig::default().save(&config_path).unwrap();

        let temp_path = config_path.with_extension("toml.tmp");
        assert!(!temp_path.exists(), "Temp file should be cleaned up");
    }

    #[test]
    fn test_default_path() {
        let path = EngineConfig::default_path().unwrap();
        assert!(path.to_string_lossy().contains(".walkseg"));
        assert!(path.to_string_lossy().ends_with("engine.toml"));
    }

    #[test]
    fn test_label_filter_parsing() {
        assert_eq!("none".parse::<LabelFilter>().unwrap(), LabelFilter::None);
        assert_eq!("ALL".parse::<LabelFilter>().unwrap(), LabelFilter::All);
        assert_eq!(
            "2, 5,6".parse::<LabelFilter>().unwrap(),
            LabelFilter::Ids(vec![2, 5, 6])
        );
        assert!("2,x".parse::<LabelFilter>().is_err());
        assert_eq!(LabelFilter::Ids(vec![2, 5]).to_string(), "2,5");
    }

    #[test]
    fn test_job_config_defaults() {
        let job = JobConfig::default();
        assert_eq!(job.nbrw, 10);
        assert_eq!(job.sorw, 4000);
        assert!(job.compression);
        assert_eq!(job.platform, Platform::Auto);
        assert!(job.validate().is_ok());
    }

    #[test]
    fn test_job_config_from_partial_toml() {
        let job: JobConfig = toml::from_str("nbrw = 3\nonly = \"1,2\"\n").unwrap();
        assert_eq!(job.nbrw, 3);
        assert_eq!(job.sorw, 4000);
        assert_eq!(job.only, LabelFilter::Ids(vec![1, 2]));
    }
}
