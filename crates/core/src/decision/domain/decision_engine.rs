use std::sync::Arc;

use crate::detection::domain::object_detector::Detection;
use crate::shared::frame::Frame;
use crate::shared::region::Region;

use super::action::{Action, Reason};

/// Joined output of both lanes for one client in one cycle.
#[derive(Clone, Debug)]
pub struct InferenceResult {
    pub face: Option<Region>,
    pub phone: Option<Detection>,
    pub is_spoof: bool,
    pub identity_matches: bool,
    pub frame: Arc<Frame>,
}

/// The rule outcome plus the box that justifies it, if any.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Verdict {
    pub action: Action,
    pub reason: Reason,
    pub evidence_box: Option<Region>,
}

/// The decision sent back to a client for one frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Decision {
    pub action: Action,
    pub reason: Reason,
    pub username: String,
    pub sent_at: f64,
    pub finished_at: f64,
}

/// First matching rule wins: phone, no face, spoof, wrong user.
pub fn decide(result: &InferenceResult) -> Verdict {
    if let Some(phone) = result.phone {
        return verdict(Action::SignOut, Reason::PhoneDetection, Some(phone.region));
    }
    let Some(face) = result.face else {
        return verdict(Action::LockScreen, Reason::NoFace, None);
    };
    if result.is_spoof {
        return verdict(Action::SignOut, Reason::SpoofImage, Some(face));
    }
    if !result.identity_matches {
        return verdict(Action::LockScreen, Reason::WrongUser, Some(face));
    }
    verdict(Action::None, Reason::Empty, None)
}

fn verdict(action: Action, reason: Reason, evidence_box: Option<Region>) -> Verdict {
    Verdict {
        action,
        reason,
        evidence_box,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn face() -> Region {
        Region::new(10, 10, 40, 40)
    }

    fn phone() -> Detection {
        Detection {
            region: Region::new(60, 60, 20, 30),
            confidence: 0.8,
        }
    }

    fn result(
        face: Option<Region>,
        phone: Option<Detection>,
        is_spoof: bool,
        identity_matches: bool,
    ) -> InferenceResult {
        InferenceResult {
            face,
            phone,
            is_spoof,
            identity_matches,
            frame: Arc::new(Frame::new(vec![0; 100 * 100 * 3], 100, 100, 3, 0)),
        }
    }

    #[rstest]
    // phone wins over everything
    #[case(Some(face()), Some(phone()), true, false, Action::SignOut, Reason::PhoneDetection)]
    #[case(None, Some(phone()), false, false, Action::SignOut, Reason::PhoneDetection)]
    #[case(None, None, false, false, Action::LockScreen, Reason::NoFace)]
    #[case(None, None, true, true, Action::LockScreen, Reason::NoFace)]
    #[case(Some(face()), None, true, false, Action::SignOut, Reason::SpoofImage)]
    #[case(Some(face()), None, true, true, Action::SignOut, Reason::SpoofImage)]
    #[case(Some(face()), None, false, false, Action::LockScreen, Reason::WrongUser)]
    #[case(Some(face()), None, false, true, Action::None, Reason::Empty)]
    fn test_precedence(
        #[case] face: Option<Region>,
        #[case] phone: Option<Detection>,
        #[case] is_spoof: bool,
        #[case] identity_matches: bool,
        #[case] action: Action,
        #[case] reason: Reason,
    ) {
        let v = decide(&result(face, phone, is_spoof, identity_matches));
        assert_eq!((v.action, v.reason), (action, reason));
    }

    #[test]
    fn test_phone_evidence_box_is_phone_region() {
        let v = decide(&result(Some(face()), Some(phone()), false, true));
        assert_eq!(v.evidence_box, Some(phone().region));
    }

    #[test]
    fn test_no_face_has_no_evidence_box() {
        assert_eq!(decide(&result(None, None, false, false)).evidence_box, None);
    }

    #[test]
    fn test_spoof_and_wrong_user_box_the_face() {
        assert_eq!(
            decide(&result(Some(face()), None, true, true)).evidence_box,
            Some(face())
        );
        assert_eq!(
            decide(&result(Some(face()), None, false, false)).evidence_box,
            Some(face())
        );
    }
}
