/// MiniFASNet-style anti-spoof classifier using ONNX Runtime.
///
/// The face box is widened to include the surroundings (screen bezels, paper
/// edges) before being resized to the model input. Output is three logits;
/// index 1 is a live face.
use std::path::Path;

use crate::detection::domain::model_factory::ExecutionTarget;
use crate::detection::domain::spoof_checker::SpoofChecker;
use crate::shared::frame::Frame;
use crate::shared::region::Region;

use super::execution_provider::session_builder;

/// Context multiplier applied to the face box.
pub const DEFAULT_CONTEXT_SCALE: f64 = 2.7;

/// Minimum live probability for a face to pass.
pub const DEFAULT_LIVE_THRESHOLD: f32 = 0.5;

const INPUT_SIZE: usize = 80;
const LIVE_CLASS: usize = 1;

pub struct OnnxSpoofChecker {
    session: ort::session::Session,
    context_scale: f64,
    live_threshold: f32,
}

impl OnnxSpoofChecker {
    pub fn new(
        model_path: &Path,
        target: ExecutionTarget,
        live_threshold: f32,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let session = session_builder(target)?.commit_from_file(model_path)?;
        Ok(Self {
            session,
            context_scale: DEFAULT_CONTEXT_SCALE,
            live_threshold,
        })
    }
}

impl SpoofChecker for OnnxSpoofChecker {
    fn is_spoof(
        &mut self,
        frame: &Frame,
        face: &Region,
    ) -> Result<bool, Box<dyn std::error::Error>> {
        let crop = frame
            .crop(&face.expand(self.context_scale))
            .ok_or("Face region lies outside the frame")?;
        let tensor = preprocess(&crop);
        let input_value = ort::value::Tensor::from_array(tensor)?;
        let outputs = self.session.run(ort::inputs![input_value])?;
        let logits = outputs[0].try_extract_array::<f32>()?;
        let logits = logits.as_slice().ok_or("Cannot get logits slice")?;
        if logits.len() <= LIVE_CLASS {
            return Err(format!("Anti-spoof model produced {} logits", logits.len()).into());
        }

        let probs = softmax(logits);
        Ok(probs[LIVE_CLASS] < self.live_threshold)
    }
}

/// Nearest-neighbour resize to 80x80, BGR channel order, raw 0-255 values.
fn preprocess(crop: &Frame) -> ndarray::Array4<f32> {
    let src = crop.as_ndarray();
    let src_w = crop.width() as usize;
    let src_h = crop.height() as usize;

    let mut tensor = ndarray::Array4::<f32>::zeros((1, 3, INPUT_SIZE, INPUT_SIZE));
    for y in 0..INPUT_SIZE {
        let src_y = (y * src_h / INPUT_SIZE).min(src_h - 1);
        for x in 0..INPUT_SIZE {
            let src_x = (x * src_w / INPUT_SIZE).min(src_w - 1);
            for c in 0..3 {
                tensor[[0, c, y, x]] = src[[src_y, src_x, 2 - c]] as f32;
            }
        }
    }
    tensor
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|v| v / sum).collect()
}
