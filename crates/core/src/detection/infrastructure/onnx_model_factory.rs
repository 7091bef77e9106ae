use std::path::{Path, PathBuf};

use crate::detection::domain::model_factory::{ExecutionTarget, ModelFactory, ModelSuite};
use crate::shared::constants::{
    EMBEDDING_MODEL_NAME, FACE_MODEL_NAME, OBJECT_MODEL_NAME, SPOOF_MODEL_NAME,
};

use super::model_resolver::{self, ModelResolveError};
use super::onnx_face_detector::{self, OnnxFaceDetector};
use super::onnx_identity_verifier::{self, OnnxIdentityVerifier};
use super::onnx_object_detector::{self, OnnxObjectDetector};
use super::onnx_spoof_checker::{self, OnnxSpoofChecker};

/// Detection thresholds shared by every worker's models.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelThresholds {
    pub face_confidence: f64,
    pub object_confidence: f64,
    pub identity_similarity: f64,
    pub live_probability: f32,
}

impl Default for ModelThresholds {
    fn default() -> Self {
        Self {
            face_confidence: onnx_face_detector::DEFAULT_CONFIDENCE,
            object_confidence: onnx_object_detector::DEFAULT_CONFIDENCE,
            identity_similarity: onnx_identity_verifier::DEFAULT_THRESHOLD,
            live_probability: onnx_spoof_checker::DEFAULT_LIVE_THRESHOLD,
        }
    }
}

/// Builds ONNX Runtime sessions for each new worker.
///
/// Model paths are resolved once up front so a missing file fails the
/// server at startup rather than on the first worker creation.
pub struct OnnxModelFactory {
    face_model: PathBuf,
    object_model: PathBuf,
    embedding_model: PathBuf,
    spoof_model: PathBuf,
    thresholds: ModelThresholds,
}

impl OnnxModelFactory {
    pub fn new(
        model_dir: Option<&Path>,
        thresholds: ModelThresholds,
    ) -> Result<Self, ModelResolveError> {
        Ok(Self {
            face_model: model_resolver::resolve(FACE_MODEL_NAME, model_dir)?,
            object_model: model_resolver::resolve(OBJECT_MODEL_NAME, model_dir)?,
            embedding_model: model_resolver::resolve(EMBEDDING_MODEL_NAME, model_dir)?,
            spoof_model: model_resolver::resolve(SPOOF_MODEL_NAME, model_dir)?,
            thresholds,
        })
    }
}

impl ModelFactory for OnnxModelFactory {
    fn build(
        &self,
        target: ExecutionTarget,
    ) -> Result<ModelSuite, Box<dyn std::error::Error + Send + Sync>> {
        log::debug!("Loading models on {target}");
        let t = &self.thresholds;
        Ok(ModelSuite {
            object_detector: Box::new(OnnxObjectDetector::new(
                &self.object_model,
                target,
                t.object_confidence,
            )?),
            face_detector: Box::new(OnnxFaceDetector::new(
                &self.face_model,
                target,
                t.face_confidence,
            )?),
            spoof_checker: Box::new(OnnxSpoofChecker::new(
                &self.spoof_model,
                target,
                t.live_probability,
            )?),
            identity_verifier: Box::new(OnnxIdentityVerifier::new(
                &self.embedding_model,
                target,
                t.identity_similarity,
            )?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_fails_when_models_missing() {
        let tmp = tempfile::TempDir::new().unwrap();
        let result = OnnxModelFactory::new(Some(tmp.path()), ModelThresholds::default());
        // The per-user cache may hold a real model, so only assert on the
        // error shape when resolution fails.
        if let Err(e) = result {
            assert!(matches!(e, ModelResolveError::NotFound { .. }));
        }
    }

    #[test]
    fn test_default_thresholds() {
        let t = ModelThresholds::default();
        assert!((t.identity_similarity - 0.4).abs() < 1e-9);
        assert!((t.live_probability - 0.5).abs() < 1e-6);
    }
}
