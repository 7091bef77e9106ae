pub mod gpu_probe;
