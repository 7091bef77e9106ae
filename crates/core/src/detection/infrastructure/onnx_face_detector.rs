/// YOLO face detector using ONNX Runtime via `ort`.
///
/// Runs letterbox preprocessing, inference and NMS, then reports the
/// largest surviving face.
use std::path::Path;

use crate::detection::domain::face_detector::FaceDetector;
use crate::detection::domain::model_factory::ExecutionTarget;
use crate::shared::frame::Frame;
use crate::shared::region::Region;

use super::execution_provider::session_builder;
use super::yolo::{self, RawDetection, NMS_IOU_THRESH};

/// Default confidence threshold for face detection.
pub const DEFAULT_CONFIDENCE: f64 = 0.5;

pub struct OnnxFaceDetector {
    session: ort::session::Session,
    confidence: f64,
    input_size: u32,
}

impl OnnxFaceDetector {
    pub fn new(
        model_path: &Path,
        target: ExecutionTarget,
        confidence: f64,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let session = session_builder(target)?.commit_from_file(model_path)?;
        let input_size = yolo::input_size(&session);
        Ok(Self {
            session,
            confidence,
            input_size,
        })
    }
}

impl FaceDetector for OnnxFaceDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Option<Region>, Box<dyn std::error::Error>> {
        let (input, lb) = yolo::letterbox(frame, self.input_size);
        let input_value = ort::value::Tensor::from_array(input)?;
        let outputs = self.session.run(ort::inputs![input_value])?;
        if outputs.len() == 0 {
            return Err("YOLO face model produced no outputs".into());
        }
        let tensor = outputs[0].try_extract_array::<f32>()?;
        let data = tensor.as_slice().ok_or("Cannot get tensor slice")?;
        let rows = yolo::rows(data, tensor.shape())?;

        let mut dets = parse_face_rows(&rows, self.confidence, &lb);
        let kept = yolo::nms(&mut dets, NMS_IOU_THRESH);
        Ok(largest(&kept, frame))
    }
}

/// Row format: `[cx, cy, w, h, conf, keypoints...]`; keypoints are ignored.
fn parse_face_rows(rows: &[Vec<f32>], confidence: f64, lb: &yolo::Letterbox) -> Vec<RawDetection> {
    rows.iter()
        .filter(|row| row.len() >= 5 && row[4] as f64 >= confidence)
        .map(|row| RawDetection {
            bbox: lb.to_frame(row[0] as f64, row[1] as f64, row[2] as f64, row[3] as f64),
            confidence: row[4] as f64,
        })
        .collect()
}

/// Largest visible face, which is the one closest to the camera.
fn largest(dets: &[RawDetection], frame: &Frame) -> Option<Region> {
    dets.iter()
        .filter_map(|d| d.region().clamp_to(frame.width(), frame.height()))
        .max_by_key(|r| r.area())
}
