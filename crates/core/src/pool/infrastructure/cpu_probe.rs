use crate::detection::domain::model_factory::ExecutionTarget;
use crate::pool::domain::gpu_probe::{DeviceUsage, GpuProbe, GpuProbeError};

/// A single virtual device that always has headroom.
///
/// Used on hosts without GPUs; the pool size limit is then the only bound.
pub struct CpuProbe;

impl GpuProbe for CpuProbe {
    fn snapshot(&self) -> Result<Vec<DeviceUsage>, GpuProbeError> {
        Ok(vec![DeviceUsage {
            index: 0,
            used_mb: 0,
            total_mb: 1,
        }])
    }

    fn target(&self, _device: usize) -> ExecutionTarget {
        ExecutionTarget::Cpu
    }
}
