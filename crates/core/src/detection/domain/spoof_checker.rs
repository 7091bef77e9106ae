use crate::shared::frame::Frame;
use crate::shared::region::Region;

/// Domain interface for presentation-attack (anti-spoof) classification.
///
/// Receives the full frame plus the face box so implementations can take
/// as much surrounding context as their model expects.
pub trait SpoofChecker: Send {
    fn is_spoof(&mut self, frame: &Frame, face: &Region)
        -> Result<bool, Box<dyn std::error::Error>>;
}
