use thiserror::Error;

use crate::detection::domain::model_factory::ExecutionTarget;

/// Memory usage of one device, in MiB.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceUsage {
    pub index: usize,
    pub used_mb: u64,
    pub total_mb: u64,
}

impl DeviceUsage {
    /// Fraction of memory in use. A device reporting no memory counts as full.
    pub fn utilization(&self) -> f64 {
        if self.total_mb == 0 {
            return 1.0;
        }
        self.used_mb as f64 / self.total_mb as f64
    }
}

#[derive(Error, Debug)]
pub enum GpuProbeError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{command} exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("unparseable device line {line:?}")]
    Parse { line: String },
}

/// Source of device memory headroom for worker placement.
///
/// Claims are advisory bookkeeping for probes that cannot observe memory
/// directly; real probes ignore them.
pub trait GpuProbe: Send + Sync {
    fn snapshot(&self) -> Result<Vec<DeviceUsage>, GpuProbeError>;

    /// Execution target for workers placed on `device`.
    fn target(&self, device: usize) -> ExecutionTarget;

    fn claim(&self, _device: usize) {}

    fn release(&self, _device: usize) {}
}

/// First device whose utilization is below `threshold`.
pub fn select_device(devices: &[DeviceUsage], threshold: f64) -> Option<usize> {
    devices
        .iter()
        .find(|d| d.utilization() < threshold)
        .map(|d| d.index)
}
