pub mod execution_provider;
pub mod model_resolver;
pub mod onnx_face_detector;
pub mod onnx_identity_verifier;
pub mod onnx_model_factory;
pub mod onnx_object_detector;
pub mod onnx_spoof_checker;
pub mod yolo;
