pub mod cpu_probe;
pub mod nvidia_smi_probe;
pub mod simulated_gpu_probe;
