pub mod face_detector;
pub mod identity_verifier;
pub mod model_factory;
pub mod object_detector;
pub mod spoof_checker;
