use super::protocol::CloseCode;
use crate::decision::domain::action::Reason;

/// Facts gathered about a connection's first message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AdmissionRequest {
    pub system_full: bool,
    pub live_sessions: usize,
    pub ceiling: usize,
    pub known: bool,
    pub allowed: bool,
    pub deactivated: bool,
    pub blocked: bool,
    pub denied: bool,
    pub duplicate: bool,
    pub paused: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// Close with `code`, after a response carrying `notice` if present.
    Refuse {
        code: CloseCode,
        notice: Option<Reason>,
    },
    /// Known and allowed, but answered with "paused" instead of inference.
    Paused,
    Accept,
}

impl Admission {
    fn refuse(code: CloseCode, notice: Option<Reason>) -> Self {
        Admission::Refuse { code, notice }
    }
}

/// Applies the admission checks in order: capacity, availability, blocking,
/// duplicate sessions, pause.
pub fn admit(request: &AdmissionRequest) -> Admission {
    if request.system_full || request.live_sessions >= request.ceiling {
        return Admission::refuse(CloseCode::ServerFull, None);
    }
    if !request.known || !request.allowed || request.deactivated {
        return Admission::refuse(CloseCode::NotAvailable, Some(Reason::Unavailable));
    }
    if request.blocked || request.denied {
        return Admission::refuse(CloseCode::Blocked, Some(Reason::Blocked));
    }
    if request.duplicate {
        return Admission::refuse(CloseCode::DuplicateSession, None);
    }
    if request.paused {
        return Admission::Paused;
    }
    Admission::Accept
}
