use std::fmt;

use serde::{Deserialize, Serialize};

/// What the client should do in response to one inference cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    #[serde(rename = "no-action")]
    None,
    LockScreen,
    SignOut,
    Warning,
    Error,
}

impl Action {
    /// Anything other than `None` is forwarded to the evidence writer.
    pub fn is_actionable(self) -> bool {
        self != Action::None
    }

    /// Directory and file-name segment used for evidence files.
    pub fn evidence_name(self) -> &'static str {
        match self {
            Action::None => "No_action",
            Action::LockScreen => "Lock_screen",
            Action::SignOut => "Sign_out",
            Action::Warning => "Warning",
            Action::Error => "Error",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.evidence_name())
    }
}

/// Why an [`Action`] was chosen.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Reason {
    Empty,
    NoFace,
    #[serde(alias = "spoof")]
    SpoofImage,
    WrongUser,
    #[serde(alias = "phone-detected")]
    PhoneDetection,
    Paused,
    Blocked,
    Unavailable,
}

impl Reason {
    pub fn evidence_name(self) -> &'static str {
        match self {
            Reason::Empty => "Empty",
            Reason::NoFace => "No_face",
            Reason::SpoofImage => "Spoof_image",
            Reason::WrongUser => "Wrong_user",
            Reason::PhoneDetection => "Phone_detection",
            Reason::Paused => "Paused",
            Reason::Blocked => "Blocked",
            Reason::Unavailable => "Unavailable",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.evidence_name())
    }
}
