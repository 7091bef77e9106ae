use std::process::Command;

use crate::detection::domain::model_factory::ExecutionTarget;
use crate::pool::domain::gpu_probe::{DeviceUsage, GpuProbe, GpuProbeError};

const COMMAND: &str = "nvidia-smi";

/// Reads per-device memory usage from `nvidia-smi`.
pub struct NvidiaSmiProbe;

impl NvidiaSmiProbe {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NvidiaSmiProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuProbe for NvidiaSmiProbe {
    fn snapshot(&self) -> Result<Vec<DeviceUsage>, GpuProbeError> {
        let output = Command::new(COMMAND)
            .args([
                "--query-gpu=index,memory.used,memory.total",
                "--format=csv,noheader,nounits",
            ])
            .output()
            .map_err(|e| GpuProbeError::Spawn {
                command: COMMAND.into(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(GpuProbeError::Failed {
                command: COMMAND.into(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        parse_query_output(&String::from_utf8_lossy(&output.stdout))
    }

    fn target(&self, device: usize) -> ExecutionTarget {
        ExecutionTarget::Cuda { device }
    }
}

/// Parses `index, used, total` CSV lines.
fn parse_query_output(stdout: &str) -> Result<Vec<DeviceUsage>, GpuProbeError> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            let parse_err = || GpuProbeError::Parse {
                line: line.to_string(),
            };
            if fields.len() != 3 {
                return Err(parse_err());
            }
            Ok(DeviceUsage {
                index: fields[0].parse().map_err(|_| parse_err())?,
                used_mb: fields[1].parse().map_err(|_| parse_err())?,
                total_mb: fields[2].parse().map_err(|_| parse_err())?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_multiple_devices() {
        let out = "0, 1024, 24576\n1, 23000, 24576\n";
        let devices = parse_query_output(out).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(
            devices[1],
            DeviceUsage {
                index: 1,
                used_mb: 23000,
                total_mb: 24576
            }
        );
    }

    #[test]
    fn test_parse_skips_blank_lines() {
        assert!(parse_query_output("\n  \n").unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_query_output("0, N/A, 24576"),
            Err(GpuProbeError::Parse { .. })
        ));
        assert!(parse_query_output("0, 1").is_err());
    }

    #[test]
    fn test_target_is_cuda_device() {
        assert_eq!(
            NvidiaSmiProbe::new().target(2),
            ExecutionTarget::Cuda { device: 2 }
        );
    }
}
