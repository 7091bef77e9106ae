/// YOLO (COCO) object detector using ONNX Runtime via `ort`.
///
/// Only the requested class is scored; everything else in the output is
/// ignored, so one model serves any single-class query.
use std::path::Path;

use crate::detection::domain::model_factory::ExecutionTarget;
use crate::detection::domain::object_detector::{Detection, ObjectDetector};
use crate::shared::frame::Frame;

use super::execution_provider::session_builder;
use super::yolo::{self, RawDetection, NMS_IOU_THRESH};

/// Default confidence threshold for object detection.
pub const DEFAULT_CONFIDENCE: f64 = 0.4;

/// Box coordinates preceding the per-class scores in each output row.
const BOX_FEATURES: usize = 4;

pub struct OnnxObjectDetector {
    session: ort::session::Session,
    confidence: f64,
    input_size: u32,
}

impl OnnxObjectDetector {
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

impl ObjectDetector for OnnxObjectDetector {
    fn detect(
        &mut self,
        frame: &Frame,
        target_class: usize,
    ) -> Result<Option<Detection>, Box<dyn std::error::Error>> {
        let (input, lb) = yolo::letterbox(frame, self.input_size);
        let input_value = ort::value::Tensor::from_array(input)?;
        let outputs = self.session.run(ort::inputs![input_value])?;
        if outputs.len() == 0 {
            return Err("YOLO object model produced no outputs".into());
        }
        let tensor = outputs[0].try_extract_array::<f32>()?;
        let data = tensor.as_slice().ok_or("Cannot get tensor slice")?;
        let rows = yolo::rows(data, tensor.shape())?;

        let mut dets = parse_class_rows(&rows, target_class, self.confidence, &lb);
        let kept = yolo::nms(&mut dets, NMS_IOU_THRESH);
        Ok(best_visible(&kept, frame))
    }
}

/// Row format: `[cx, cy, w, h, score_0, score_1, ...]`.
fn parse_class_rows(
    rows: &[Vec<f32>],
    target_class: usize,
    confidence: f64,
    lb: &yolo::Letterbox,
) -> Vec<RawDetection> {
    let column = BOX_FEATURES + target_class;
    rows.iter()
        .filter(|row| row.len() > column && row[column] as f64 >= confidence)
        .map(|row| RawDetection {
            bbox: lb.to_frame(row[0] as f64, row[1] as f64, row[2] as f64, row[3] as f64),
            confidence: row[column] as f64,
        })
        .collect()
}

/// NMS output is sorted by confidence, so the first visible box wins.
fn best_visible(dets: &[RawDetection], frame: &Frame) -> Option<Detection> {
    dets.iter().find_map(|d| {
        d.region()
            .clamp_to(frame.width(), frame.height())
            .map(|region| Detection {
                region,
                confidence: d.confidence as f32,
            })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::region::Region;

    fn frame() -> Frame {
        Frame::new(vec![0u8; 100 * 100 * 3], 100, 100, 3, 0)
    }

    fn lb() -> yolo::Letterbox {
        yolo::letterbox(&frame(), 100).1
    }

    #[test]
    fn test_parse_reads_only_target_class_column() {
        // two classes: class 0 strong, class 1 weak
        let rows = vec![vec![50.0, 50.0, 20.0, 20.0, 0.9, 0.1]];
        assert_eq!(parse_class_rows(&rows, 0, 0.5, &lb()).len(), 1);
        assert!(parse_class_rows(&rows, 1, 0.5, &lb()).is_empty());
    }

    #[test]
    fn test_parse_ignores_rows_without_target_column() {
        let rows = vec![vec![50.0, 50.0, 20.0, 20.0, 0.9]];
        assert!(parse_class_rows(&rows, 67, 0.1, &lb()).is_empty());
    }

    #[test]
    fn test_best_visible_prefers_first_onscreen() {
        let dets = vec![
            RawDetection {
                bbox: [200.0, 200.0, 300.0, 300.0],
                confidence: 0.95,
            },
            RawDetection {
                bbox: [10.0, 10.0, 30.0, 40.0],
                confidence: 0.7,
            },
        ];
        let hit = best_visible(&dets, &frame()).unwrap();
        assert_eq!(hit.region, Region::new(10, 10, 20, 30));
        assert!((hit.confidence - 0.7).abs() < 1e-6);
    }
}
