use std::sync::{Mutex, PoisonError};

use crate::detection::domain::model_factory::ExecutionTarget;
use crate::pool::domain::gpu_probe::{DeviceUsage, GpuProbe, GpuProbeError};

/// Devices whose usage grows by a fixed amount per claimed worker.
///
/// Lets tests and dry runs exercise GPU-full handling without hardware.
pub struct SimulatedGpuProbe {
    total_mb: Vec<u64>,
    per_worker_mb: u64,
    used_mb: Mutex<Vec<u64>>,
}

impl SimulatedGpuProbe {
    pub fn new(total_mb: Vec<u64>, per_worker_mb: u64) -> Self {
        let used = vec![0; total_mb.len()];
        Self {
            total_mb,
            per_worker_mb,
            used_mb: Mutex::new(used),
        }
    }

    /// Overrides a device's usage, e.g. to emulate another tenant.
    pub fn set_used(&self, device: usize, used_mb: u64) {
        if let Some(slot) = self
            .used_mb
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(device)
        {
            *slot = used_mb;
        }
    }
}

impl GpuProbe for SimulatedGpuProbe {
    fn snapshot(&self) -> Result<Vec<DeviceUsage>, GpuProbeError> {
        let used = self.used_mb.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self
            .total_mb
            .iter()
            .zip(used.iter())
            .enumerate()
            .map(|(index, (&total_mb, &used_mb))| DeviceUsage {
                index,
                used_mb,
                total_mb,
            })
            .collect())
    }

    fn target(&self, _device: usize) -> ExecutionTarget {
        ExecutionTarget::Cpu
    }

    fn claim(&self, device: usize) {
        let mut used = self.used_mb.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = used.get_mut(device) {
            *slot += self.per_worker_mb;
        }
    }

    fn release(&self, device: usize) {
        let mut used = self.used_mb.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = used.get_mut(device) {
            *slot = slot.saturating_sub(self.per_worker_mb);
        }
    }
}
