use crate::shared::frame::Frame;
use crate::shared::region::Region;

/// Domain interface for face detection.
///
/// Returns the most prominent face, if any. Implementations may hold
/// inference sessions that need exclusive access, hence `&mut self`.
pub trait FaceDetector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Option<Region>, Box<dyn std::error::Error>>;
}
