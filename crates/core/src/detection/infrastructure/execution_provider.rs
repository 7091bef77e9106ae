use crate::detection::domain::model_factory::ExecutionTarget;

/// Execution providers for a worker's target device.
///
/// ONNX Runtime falls back to CPU if a listed provider is unavailable, so a
/// CUDA target on a machine without CUDA still produces working sessions.
pub fn preferred_execution_providers(
    target: ExecutionTarget,
) -> Vec<ort::execution_providers::ExecutionProviderDispatch> {
    match target {
        ExecutionTarget::Cuda { device } => vec![
            ort::execution_providers::CUDAExecutionProvider::default()
                .with_device_id(device as i32)
                .build(),
        ],
        ExecutionTarget::Cpu => platform_providers(),
    }
}

fn platform_providers() -> Vec<ort::execution_providers::ExecutionProviderDispatch> {
    #[cfg(target_os = "macos")]
    {
        vec![ort::execution_providers::CoreMLExecutionProvider::default().build()]
    }
    #[cfg(target_os = "windows")]
    {
        vec![ort::execution_providers::DirectMLExecutionProvider::default().build()]
    }
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        vec![]
    }
}

/// Session builder configured for single-frame, latency-bound inference.
pub fn session_builder(target: ExecutionTarget) -> ort::Result<ort::session::builder::SessionBuilder> {
    ort::session::Session::builder()?
        .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)?
        .with_inter_threads(1)?
        .with_execution_providers(preferred_execution_providers(target))
}
