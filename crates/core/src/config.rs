use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::detection::infrastructure::onnx_model_factory::ModelThresholds;
use crate::gateway::gateway::GatewayConfig;
use crate::pool::pool_manager::PoolConfig;
use crate::shared::constants::DEFAULT_EVIDENCE_DIR;
use crate::state::infrastructure::redis_state_store::DEFAULT_KEY_PREFIX;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("{name} must be in (0, 1], got {value}")]
    OutOfRange { name: &'static str, value: f64 },
    #[error("registry directory does not exist: {0}")]
    MissingRegistry(PathBuf),
    #[error("{max_pool_size} workers of {capacity} clients overflows the client ceiling")]
    CeilingOverflow { max_pool_size: usize, capacity: usize },
    #[error("gateway ceiling {gateway} differs from pool ceiling {pool}")]
    CeilingMismatch { gateway: usize, pool: usize },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StateBackend {
    InMemory,
    Redis { url: String, prefix: String },
}

impl StateBackend {
    pub fn redis(url: impl Into<String>) -> Self {
        StateBackend::Redis {
            url: url.into(),
            prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GpuProbeKind {
    NvidiaSmi,
    Cpu,
}

/// Everything needed to start a server.
#[derive(Clone, Debug, PartialEq)]
pub struct ServerConfig {
    pub gateway: GatewayConfig,
    pub pool: PoolConfig,
    pub registry_dir: PathBuf,
    pub allow_list: Option<Vec<String>>,
    pub deny_list: Vec<String>,
    pub evidence_root: PathBuf,
    pub model_dir: Option<PathBuf>,
    pub thresholds: ModelThresholds,
    pub state: StateBackend,
    pub gpu_probe: GpuProbeKind,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let pool = PoolConfig::default();
        Self {
            gateway: GatewayConfig {
                ceiling: pool.ceiling(),
                ..GatewayConfig::default()
            },
            pool,
            registry_dir: PathBuf::from("users"),
            allow_list: None,
            deny_list: Vec::new(),
            evidence_root: PathBuf::from(DEFAULT_EVIDENCE_DIR),
            model_dir: None,
            thresholds: ModelThresholds::default(),
            state: StateBackend::InMemory,
            gpu_probe: GpuProbeKind::NvidiaSmi,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let pool = &self.pool;
        if pool.max_pool_size == 0 {
            return Err(ConfigError::Zero("max pool size"));
        }
        if pool.worker.capacity == 0 {
            return Err(ConfigError::Zero("per-worker capacity"));
        }
        if pool.max_pool_size.checked_mul(pool.worker.capacity).is_none() {
            return Err(ConfigError::CeilingOverflow {
                max_pool_size: pool.max_pool_size,
                capacity: pool.worker.capacity,
            });
        }

        let intervals = [
            ("assignment interval", pool.assign_interval),
            ("unassignment interval", pool.unassign_interval),
            ("monitor interval", self.gateway.monitor_interval),
            ("idle timeout", self.gateway.idle_timeout),
            ("worker idle sleep", pool.worker.idle_sleep),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, d)| *d == Duration::ZERO) {
            return Err(ConfigError::Zero(name));
        }

        let fractions = [
            ("GPU memory threshold", pool.gpu_memory_threshold),
            ("face confidence", self.thresholds.face_confidence),
            ("object confidence", self.thresholds.object_confidence),
            ("identity similarity", self.thresholds.identity_similarity),
            (
                "live probability",
                f64::from(self.thresholds.live_probability),
            ),
        ];
        for (name, value) in fractions {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigError::OutOfRange { name, value });
            }
        }

        if self.gateway.ceiling != pool.ceiling() {
            return Err(ConfigError::CeilingMismatch {
                gateway: self.gateway.ceiling,
                pool: pool.ceiling(),
            });
        }

        if !self.registry_dir.is_dir() {
            return Err(ConfigError::MissingRegistry(self.registry_dir.clone()));
        }
        Ok(())
    }
}
