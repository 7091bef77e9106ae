/// ArcFace embedding-based identity verifier using ONNX Runtime.
///
/// Compares the cosine similarity of the live face crop's embedding with
/// the enrolled reference photo's embedding. Reference embeddings are
/// computed once per user and cached for the worker's lifetime.
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::detection::domain::identity_verifier::{IdentityVerifier, ReferenceImage};
use crate::detection::domain::model_factory::ExecutionTarget;
use crate::shared::frame::Frame;

use super::execution_provider::session_builder;

pub const DEFAULT_THRESHOLD: f64 = 0.4;

const INPUT_SIZE: usize = 112;
/// ArcFace maps pixel values as `(v - 127.5) / 127.5`.
const PIXEL_CENTER: f32 = 127.5;

pub struct OnnxIdentityVerifier {
    session: ort::session::Session,
    threshold: f64,
    references: HashMap<String, (Arc<Frame>, Vec<f32>)>,
}

impl OnnxIdentityVerifier {
    pub fn new(
        model_path: &Path,
        target: ExecutionTarget,
        threshold: f64,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let session = session_builder(target)?.commit_from_file(model_path)?;
        Ok(Self {
            session,
            threshold,
            references: HashMap::new(),
        })
    }

    fn embed(&mut self, frame: &Frame) -> Result<Vec<f32>, Box<dyn std::error::Error>> {
        let input = ort::value::Tensor::from_array(to_input_tensor(frame))?;
        let outputs = self.session.run(ort::inputs![input])?;
        let raw = outputs[0].try_extract_array::<f32>()?;
        let mut embedding: Vec<f32> = raw.iter().copied().collect();
        if embedding.is_empty() {
            return Err("embedding model returned an empty output".into());
        }
        l2_normalize(&mut embedding);
        Ok(embedding)
    }

    fn reference_embedding(
        &mut self,
        reference: &ReferenceImage,
    ) -> Result<Vec<f32>, Box<dyn std::error::Error>> {
        if let Some((frame, embedding)) = self.references.get(&reference.username) {
            if Arc::ptr_eq(frame, &reference.frame) {
                return Ok(embedding.clone());
            }
        }
        let embedding = self.embed(&reference.frame)?;
        self.references.insert(
            reference.username.clone(),
            (reference.frame.clone(), embedding.clone()),
        );
        Ok(embedding)
    }
}

impl IdentityVerifier for OnnxIdentityVerifier {
    fn verify(
        &mut self,
        face_crop: &Frame,
        reference: &ReferenceImage,
    ) -> Result<bool, Box<dyn std::error::Error>> {
        let expected = self.reference_embedding(reference)?;
        let live = self.embed(face_crop)?;
        Ok(cosine_similarity(&live, &expected) >= self.threshold)
    }
}

/// Bilinear resize to the ArcFace input, scaled to [-1, 1], NCHW.
fn to_input_tensor(frame: &Frame) -> ndarray::Array4<f32> {
    let side = INPUT_SIZE as u32;
    let rgb = image::RgbImage::from_raw(frame.width(), frame.height(), frame.data().to_vec())
        .filter(|img| img.width() > 0 && img.height() > 0);
    let Some(rgb) = rgb else {
        return ndarray::Array4::zeros((1, 3, INPUT_SIZE, INPUT_SIZE));
    };
    let resized = image::imageops::resize(&rgb, side, side, image::imageops::FilterType::Triangle);
    ndarray::Array4::from_shape_fn((1, 3, INPUT_SIZE, INPUT_SIZE), |(_, c, y, x)| {
        let value = resized.get_pixel(x as u32, y as u32)[c];
        (f32::from(value) - PIXEL_CENTER) / PIXEL_CENTER
    })
}

/// Scales `v` to unit length in place; the zero vector is left untouched.
pub fn l2_normalize(v: &mut [f32]) {
    let length = v.iter().fold(0.0f32, |acc, x| acc + x * x).sqrt();
    if length > f32::EPSILON {
        v.iter_mut().for_each(|x| *x /= length);
    }
}

/// Inputs are unit vectors, so the dot product is the cosine.
fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .fold(0.0, |acc, (x, y)| acc + f64::from(*x) * f64::from(*y))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn uniform(value: u8, w: u32, h: u32) -> Frame {
        Frame::new(vec![value; (w * h * 3) as usize], w, h, 3, 0)
    }

    #[test]
    fn test_normalized_vector_has_unit_length() {
        let mut v = vec![1.0, 2.0, 2.0];
        l2_normalize(&mut v);
        assert_relative_eq!(v[0], 1.0 / 3.0, epsilon = 1e-6);
        assert_relative_eq!(v.iter().map(|x| x * x).sum::<f32>(), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_zero_embedding_stays_zero() {
        let mut v = vec![0.0; 4];
        l2_normalize(&mut v);
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_similarity_of_same_and_opposite_faces() {
        let mut a = vec![0.2, -0.4, 0.9];
        l2_normalize(&mut a);
        let b: Vec<f32> = a.iter().map(|x| -x).collect();
        assert_relative_eq!(cosine_similarity(&a, &a), 1.0, epsilon = 1e-6);
        assert_relative_eq!(cosine_similarity(&a, &b), -1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_input_tensor_is_fixed_size_for_any_crop() {
        for (w, h) in [(40, 60), (200, 120), (112, 112)] {
            let tensor = to_input_tensor(&uniform(100, w, h));
            assert_eq!(tensor.shape(), &[1, 3, INPUT_SIZE, INPUT_SIZE]);
        }
    }

    #[test]
    fn test_input_tensor_range() {
        let bright = to_input_tensor(&uniform(255, 20, 20));
        let dark = to_input_tensor(&uniform(0, 20, 20));
        assert_relative_eq!(bright[[0, 2, 50, 50]], 1.0, epsilon = 1e-3);
        assert_relative_eq!(dark[[0, 0, 10, 90]], -1.0, epsilon = 1e-3);
    }

    #[test]
    fn test_degenerate_crop_gives_zero_tensor() {
        let tensor = to_input_tensor(&Frame::new(Vec::new(), 0, 0, 3, 0));
        assert!(tensor.iter().all(|v| *v == 0.0));
    }
}
