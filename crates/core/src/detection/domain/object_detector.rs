use crate::shared::frame::Frame;
use crate::shared::region::Region;

/// A single object hit for the requested class.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Detection {
    pub region: Region,
    pub confidence: f32,
}

/// Domain interface for class-targeted object detection.
pub trait ObjectDetector: Send {
    /// Returns the highest-confidence detection of `target_class`, if any
    /// passes the detector's threshold.
    fn detect(
        &mut self,
        frame: &Frame,
        target_class: usize,
    ) -> Result<Option<Detection>, Box<dyn std::error::Error>>;
}
