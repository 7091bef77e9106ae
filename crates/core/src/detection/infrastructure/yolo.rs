//! Shared YOLO plumbing for the face and object detectors.
//!
//! Covers letterbox preprocessing, output-layout handling and greedy NMS.
//! Model-specific row parsing stays with each detector.

use crate::shared::frame::Frame;
use crate::shared::region::Region;

/// Fallback input resolution when the model doesn't specify dimensions.
pub const DEFAULT_INPUT_SIZE: u32 = 640;

/// NMS IoU threshold.
pub const NMS_IOU_THRESH: f64 = 0.45;

/// The transform between letterbox and frame coordinates.
#[derive(Clone, Copy, Debug)]
pub struct Letterbox {
    pub scale: f64,
    pub pad_x: u32,
    pub pad_y: u32,
}

impl Letterbox {
    /// Maps a `(cx, cy, w, h)` box in letterbox coordinates back to frame corners.
    pub fn to_frame(&self, cx: f64, cy: f64, w: f64, h: f64) -> [f64; 4] {
        let px = self.pad_x as f64;
        let py = self.pad_y as f64;
        [
            ((cx - w / 2.0) - px) / self.scale,
            ((cy - h / 2.0) - py) / self.scale,
            ((cx + w / 2.0) - px) / self.scale,
            ((cy + h / 2.0) - py) / self.scale,
        ]
    }
}

/// Reads the square input size from a session's first input (NCHW).
pub fn input_size(session: &ort::session::Session) -> u32 {
    session
        .inputs()
        .first()
        .and_then(|input| {
            if let ort::value::ValueType::Tensor { ref shape, .. } = input.dtype() {
                if shape.len() >= 4 && shape[2] > 0 {
                    Some(shape[2] as u32)
                } else {
                    None
                }
            } else {
                None
            }
        })
        .unwrap_or(DEFAULT_INPUT_SIZE)
}

/// Gray used for letterbox bars (114/255).
const PAD_VALUE: f32 = 114.0 / 255.0;

/// Fits a frame into a `target_size` square, keeping its aspect ratio.
///
/// Returns the NCHW float32 tensor in [0, 1] and the transform back to
/// frame space. Bars are filled with [`PAD_VALUE`].
pub fn letterbox(frame: &Frame, target_size: u32) -> (ndarray::Array4<f32>, Letterbox) {
    let side = target_size as usize;
    let (fw, fh) = (frame.width(), frame.height());
    let scale = f64::from(target_size) / f64::from(fw.max(fh).max(1));
    let fitted_w = ((f64::from(fw) * scale).round() as u32).clamp(1, target_size);
    let fitted_h = ((f64::from(fh) * scale).round() as u32).clamp(1, target_size);
    let lb = Letterbox {
        scale,
        pad_x: (target_size - fitted_w) / 2,
        pad_y: (target_size - fitted_h) / 2,
    };

    let mut tensor = ndarray::Array4::<f32>::from_elem((1, 3, side, side), PAD_VALUE);
    let Some(rgb) = image::RgbImage::from_raw(fw, fh, frame.data().to_vec())
        .filter(|img| img.width() > 0 && img.height() > 0)
    else {
        return (tensor, lb);
    };
    let fitted = image::imageops::resize(
        &rgb,
        fitted_w,
        fitted_h,
        image::imageops::FilterType::Triangle,
    );

    for (x, y, pixel) in fitted.enumerate_pixels() {
        let (tx, ty) = ((lb.pad_x + x) as usize, (lb.pad_y + y) as usize);
        for (c, value) in pixel.0.iter().enumerate() {
            tensor[[0, c, ty, tx]] = f32::from(*value) / 255.0;
        }
    }
    (tensor, lb)
}

/// Splits a raw YOLO output into per-detection feature rows.
///
/// YOLO exports either `[1, features, detections]` (transposed) or
/// `[1, detections, features]`; both are handled.
pub fn rows(data: &[f32], shape: &[usize]) -> Result<Vec<Vec<f32>>, String> {
    if shape.len() != 3 {
        return Err(format!("Unexpected YOLO output shape: {shape:?}"));
    }
    let transposed = shape[1] < shape[2];
    let (num_dets, num_feats) = if transposed {
        (shape[2], shape[1])
    } else {
        (shape[1], shape[2])
    };
    if data.len() < num_dets * num_feats {
        return Err(format!(
            "YOLO output has {} values, expected {}",
            data.len(),
            num_dets * num_feats
        ));
    }

    Ok((0..num_dets)
        .map(|i| {
            if transposed {
                (0..num_feats).map(|f| data[f * num_dets + i]).collect()
            } else {
                data[i * num_feats..(i + 1) * num_feats].to_vec()
            }
        })
        .collect())
}

#[derive(Clone, Debug)]
pub struct RawDetection {
    pub bbox: [f64; 4],
    pub confidence: f64,
}

impl RawDetection {
    pub fn region(&self) -> Region {
        Region::from_corners(self.bbox[0], self.bbox[1], self.bbox[2], self.bbox[3])
    }
}

/// Greedy non-maximum suppression.
///
/// Returns the survivors ordered by descending confidence.
pub fn nms(dets: &mut [RawDetection], iou_thresh: f64) -> Vec<RawDetection> {
    dets.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<RawDetection> = Vec::with_capacity(dets.len());
    for candidate in dets.iter() {
        if kept
            .iter()
            .all(|k| bbox_iou(&k.bbox, &candidate.bbox) <= iou_thresh)
        {
            kept.push(candidate.clone());
        }
    }
    kept
}

/// IoU between two `[x1, y1, x2, y2]` boxes; 0 for disjoint or empty boxes.
pub fn bbox_iou(a: &[f64; 4], b: &[f64; 4]) -> f64 {
    let area = |r: &[f64; 4]| (r[2] - r[0]).max(0.0) * (r[3] - r[1]).max(0.0);
    let overlap = [a[0].max(b[0]), a[1].max(b[1]), a[2].min(b[2]), a[3].min(b[3])];
    let inter = area(&overlap);
    let union = area(a) + area(b) - inter;
    if inter <= 0.0 || union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}
