use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use crate::decision::domain::action::{Action, Reason};
use crate::shared::constants::{EVIDENCE_NAME_SEPARATOR, EVIDENCE_TIMESTAMP_FORMAT};
use crate::shared::frame::Frame;

/// An annotated frame justifying one non-trivial decision.
#[derive(Clone, Debug)]
pub struct EvidenceRecord {
    pub username: String,
    pub action: Action,
    pub reason: Reason,
    pub image: Frame,
    pub timestamp: DateTime<Local>,
}

impl EvidenceRecord {
    pub fn new(username: impl Into<String>, action: Action, reason: Reason, image: Frame) -> Self {
        Self {
            username: username.into(),
            action,
            reason,
            image,
            timestamp: Local::now(),
        }
    }

    /// `<root>/<Action>/<username>/`
    pub fn directory(&self, root: &Path) -> PathBuf {
        root.join(self.action.evidence_name()).join(&self.username)
    }

    /// `<DD_MM_YYYY-HH_MM>[-N]___<Action>___<Reason>.jpg`
    ///
    /// `collision` is 0 for the first file in a minute; later files get a
    /// `-N` suffix on the timestamp.
    pub fn file_name(&self, collision: u32) -> String {
        let mut stamp = self.timestamp.format(EVIDENCE_TIMESTAMP_FORMAT).to_string();
        if collision > 0 {
            stamp.push_str(&format!("-{collision}"));
        }
        format!(
            "{stamp}{sep}{action}{sep}{reason}.jpg",
            sep = EVIDENCE_NAME_SEPARATOR,
            action = self.action.evidence_name(),
            reason = self.reason.evidence_name(),
        )
    }

    pub fn path(&self, root: &Path, collision: u32) -> PathBuf {
        self.directory(root).join(self.file_name(collision))
    }
}
