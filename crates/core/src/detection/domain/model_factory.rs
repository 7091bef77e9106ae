use std::fmt;

use super::face_detector::FaceDetector;
use super::identity_verifier::IdentityVerifier;
use super::object_detector::ObjectDetector;
use super::spoof_checker::SpoofChecker;

/// Where a worker's models execute. Resolved once when the worker starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionTarget {
    Cpu,
    Cuda { device: usize },
}

impl fmt::Display for ExecutionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionTarget::Cpu => write!(f, "cpu"),
            ExecutionTarget::Cuda { device } => write!(f, "cuda:{device}"),
        }
    }
}

/// The four models one worker needs, split by lane ownership.
pub struct ModelSuite {
    pub object_detector: Box<dyn ObjectDetector>,
    pub face_detector: Box<dyn FaceDetector>,
    pub spoof_checker: Box<dyn SpoofChecker>,
    pub identity_verifier: Box<dyn IdentityVerifier>,
}

/// Builds a fresh [`ModelSuite`] for a worker.
///
/// Each worker gets its own sessions so lanes never contend across workers.
pub trait ModelFactory: Send + Sync {
    fn build(
        &self,
        target: ExecutionTarget,
    ) -> Result<ModelSuite, Box<dyn std::error::Error + Send + Sync>>;
}
