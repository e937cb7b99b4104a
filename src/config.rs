use std::{str::FromStr, time::Duration};

use candle_core::Device;

use crate::{
    config_db::ConfigDb,
    error::{Error, Result},
};

pub const DEFAULT_MODEL_ID: &str = "lightonai/GTE-ModernColBERT-v1";
pub const MODEL_ENV_VAR: &str = "PAGEBERT_MODEL";

pub const DEFAULT_CANDIDATE_LIMIT: usize = 100;
pub const DEFAULT_TOP_K: usize = 10;
pub const DEFAULT_STORAGE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_ACCELERATORS: usize = 1;

// Keys in the config database's settings table.
pub const SETTING_MODEL: &str = "model";
pub const SETTING_DEVICE: &str = "device";
pub const SETTING_PRECISION: &str = "precision";
pub const SETTING_CANDIDATE_LIMIT: &str = "candidate_limit";
pub const SETTING_TOP_K: &str = "top_k";
pub const SETTING_STORAGE_TIMEOUT_MS: &str = "storage_timeout_ms";
pub const SETTING_WORKERS: &str = "workers";
pub const SETTING_ACCELERATORS: &str = "accelerators";

pub const SETTING_KEYS: [&str; 8] = [
    SETTING_MODEL,
    SETTING_DEVICE,
    SETTING_PRECISION,
    SETTING_CANDIDATE_LIMIT,
    SETTING_TOP_K,
    SETTING_STORAGE_TIMEOUT_MS,
    SETTING_WORKERS,
    SETTING_ACCELERATORS,
];

/// Numeric precision used for late-interaction scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precision {
    #[default]
    Full,
    Half,
}

impl FromStr for Precision {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" | "f32" => Ok(Precision::Full),
            "half" | "f16" => Ok(Precision::Half),
            other => Err(Error::Config(format!(
                "unknown precision '{other}' (expected full or half)"
            ))),
        }
    }
}

impl std::fmt::Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Precision::Full => "full",
            Precision::Half => "half",
        })
    }
}

/// Which accelerator the model runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceChoice {
    /// CUDA when compiled with `cuda`, Metal with `metal`, CPU otherwise.
    #[default]
    Auto,
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl DeviceChoice {
    /// Resolve to a candle device, falling back to CPU when the requested
    /// accelerator is unavailable.
    pub fn resolve(self) -> Device {
        match self {
            DeviceChoice::Cpu => Device::Cpu,
            DeviceChoice::Cuda(ordinal) => Device::new_cuda(ordinal)
                .unwrap_or_else(|e| {
                    tracing::warn!(ordinal, error = %e, "CUDA unavailable, using CPU");
                    Device::Cpu
                }),
            DeviceChoice::Metal(ordinal) => Device::new_metal(ordinal)
                .unwrap_or_else(|e| {
                    tracing::warn!(ordinal, error = %e, "Metal unavailable, using CPU");
                    Device::Cpu
                }),
            DeviceChoice::Auto => default_device(),
        }
    }
}

fn default_device() -> Device {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
    }

    Device::Cpu
}

impl FromStr for DeviceChoice {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        let parse_ordinal = |rest: &str| -> Result<usize> {
            if rest.is_empty() {
                return Ok(0);
            }
            rest.strip_prefix(':')
                .and_then(|n| n.parse().ok())
                .ok_or_else(|| Error::Config(format!("bad device ordinal in '{s}'")))
        };
        if s == "auto" {
            Ok(DeviceChoice::Auto)
        } else if s == "cpu" {
            Ok(DeviceChoice::Cpu)
        } else if let Some(rest) = s.strip_prefix("cuda") {
            Ok(DeviceChoice::Cuda(parse_ordinal(rest)?))
        } else if let Some(rest) = s.strip_prefix("metal") {
            Ok(DeviceChoice::Metal(parse_ordinal(rest)?))
        } else {
            Err(Error::Config(format!(
                "unknown device '{s}' (expected auto, cpu, cuda[:N] or metal[:N])"
            )))
        }
    }
}

impl std::fmt::Display for DeviceChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceChoice::Auto => f.write_str("auto"),
            DeviceChoice::Cpu => f.write_str("cpu"),
            DeviceChoice::Cuda(n) => write!(f, "cuda:{n}"),
            DeviceChoice::Metal(n) => write!(f, "metal:{n}"),
        }
    }
}

/// Runtime knobs for the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub model_id: String,
    pub device: DeviceChoice,
    pub precision: Precision,
    /// Stage 1 candidate cap (`N`).
    pub candidate_limit: usize,
    pub default_top_k: usize,
    pub storage_timeout: Duration,
    /// Documents processed concurrently by the coordinator.
    pub workers: usize,
    /// Engine handles in the embedding pool.
    pub accelerators: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL_ID.to_string(),
            device: DeviceChoice::default(),
            precision: Precision::default(),
            candidate_limit: DEFAULT_CANDIDATE_LIMIT,
            default_top_k: DEFAULT_TOP_K,
            storage_timeout: DEFAULT_STORAGE_TIMEOUT,
            workers: DEFAULT_WORKERS,
            accelerators: DEFAULT_ACCELERATORS,
        }
    }
}

impl EngineConfig {
    /// Resolve the configuration. Per knob, in order of priority:
    /// 1. A value persisted in the config database
    /// 2. For the model only, the `PAGEBERT_MODEL` environment variable
    /// 3. The built-in default
    pub fn load(config_db: &ConfigDb) -> Result<Self> {
        let mut config = Self::default();

        if let Ok(model) = std::env::var(MODEL_ENV_VAR) {
            config.model_id = model;
        }
        if let Some(model) = config_db.get_setting(SETTING_MODEL)? {
            config.model_id = model;
        }
        if let Some(v) = config_db.get_setting(SETTING_DEVICE)? {
            config.device = v.parse()?;
        }
        if let Some(v) = config_db.get_setting(SETTING_PRECISION)? {
            config.precision = v.parse()?;
        }
        if let Some(v) = config_db.get_setting(SETTING_CANDIDATE_LIMIT)? {
            config.candidate_limit = parse_positive(SETTING_CANDIDATE_LIMIT, &v)?;
        }
        if let Some(v) = config_db.get_setting(SETTING_TOP_K)? {
            config.default_top_k = parse_positive(SETTING_TOP_K, &v)?;
        }
        if let Some(v) = config_db.get_setting(SETTING_STORAGE_TIMEOUT_MS)? {
            config.storage_timeout = Duration::from_millis(
                parse_positive(SETTING_STORAGE_TIMEOUT_MS, &v)? as u64,
            );
        }
        if let Some(v) = config_db.get_setting(SETTING_WORKERS)? {
            config.workers = parse_positive(SETTING_WORKERS, &v)?;
        }
        if let Some(v) = config_db.get_setting(SETTING_ACCELERATORS)? {
            config.accelerators = parse_positive(SETTING_ACCELERATORS, &v)?;
        }

        Ok(config)
    }

    /// Validate a value for `key` before it is persisted.
    pub fn validate_setting(key: &str, value: &str) -> Result<()> {
        match key {
            SETTING_MODEL => {
                if value.trim().is_empty() {
                    return Err(Error::Config("model id is empty".to_string()));
                }
            }
            SETTING_DEVICE => {
                value.parse::<DeviceChoice>()?;
            }
            SETTING_PRECISION => {
                value.parse::<Precision>()?;
            }
            SETTING_CANDIDATE_LIMIT
            | SETTING_TOP_K
            | SETTING_STORAGE_TIMEOUT_MS
            | SETTING_WORKERS
            | SETTING_ACCELERATORS => {
                parse_positive(key, value)?;
            }
            other => {
                return Err(Error::Config(format!(
                    "unknown setting '{other}' (known: {})",
                    SETTING_KEYS.join(", ")
                )));
            }
        }
        Ok(())
    }
}

fn parse_positive(key: &str, value: &str) -> Result<usize> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(Error::Config(format!(
            "setting '{key}' must be a positive integer, got '{value}'"
        ))),
    }
}
