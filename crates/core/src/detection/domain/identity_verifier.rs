use std::sync::Arc;

use crate::shared::frame::Frame;

/// The enrolled photo a live face is compared against.
#[derive(Clone, Debug)]
pub struct ReferenceImage {
    pub username: String,
    pub frame: Arc<Frame>,
}

/// Domain interface for face identity verification.
pub trait IdentityVerifier: Send {
    /// Whether `face_crop` shows the person in `reference`.
    fn verify(
        &mut self,
        face_crop: &Frame,
        reference: &ReferenceImage,
    ) -> Result<bool, Box<dyn std::error::Error>>;
}
