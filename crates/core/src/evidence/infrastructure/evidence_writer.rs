use std::fs;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use thiserror::Error;

use crate::evidence::domain::evidence_record::EvidenceRecord;

#[derive(Error, Debug)]
pub enum EvidenceError {
    #[error("failed to create evidence directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("frame buffer does not match {width}x{height}")]
    InvalidFrame { width: u32, height: u32 },
    #[error("failed to encode evidence image {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

enum Message {
    Record(EvidenceRecord),
    Stop,
}

/// Cloneable, non-blocking handle for queueing evidence.
#[derive(Clone)]
pub struct EvidenceSender {
    tx: crossbeam_channel::Sender<Message>,
}

impl EvidenceSender {
    /// Queues a record. Records with no action are ignored.
    ///
    /// Returns `false` once the writer has shut down.
    pub fn submit(&self, record: EvidenceRecord) -> bool {
        if !record.action.is_actionable() {
            return true;
        }
        self.tx.send(Message::Record(record)).is_ok()
    }
}

/// Totals reported when the writer thread exits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub written: usize,
    pub failed: usize,
}

/// Single consumer thread that persists evidence in arrival order.
pub struct EvidenceWriter {
    tx: crossbeam_channel::Sender<Message>,
    handle: Option<JoinHandle<WriterStats>>,
}

impl EvidenceWriter {
    pub fn spawn(root: PathBuf) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded::<Message>();
        let handle = std::thread::Builder::new()
            .name("evidence-writer".into())
            .spawn(move || run(&root, rx));
        let handle = match handle {
            Ok(h) => Some(h),
            Err(e) => {
                log::error!("Failed to start evidence writer thread: {e}");
                None
            }
        };
        Self { tx, handle }
    }

    pub fn sender(&self) -> EvidenceSender {
        EvidenceSender {
            tx: self.tx.clone(),
        }
    }

    /// Writes everything queued so far, then stops the thread.
    pub fn shutdown(mut self) -> WriterStats {
        let _ = self.tx.send(Message::Stop);
        match self.handle.take().map(|h| h.join()) {
            Some(Ok(stats)) => stats,
            Some(Err(_)) => {
                log::error!("Evidence writer thread panicked");
                WriterStats::default()
            }
            None => WriterStats::default(),
        }
    }
}

fn run(root: &Path, rx: crossbeam_channel::Receiver<Message>) -> WriterStats {
    let mut stats = WriterStats::default();
    for message in rx {
        let record = match message {
            Message::Record(record) => record,
            Message::Stop => break,
        };
        match write_record(root, &record) {
            Ok(path) => {
                stats.written += 1;
                log::debug!("Evidence written to {}", path.display());
            }
            Err(e) => {
                stats.failed += 1;
                log::error!("Dropping evidence for {}: {e}", record.username);
            }
        }
    }
    log::info!(
        "Evidence writer stopped ({} written, {} failed)",
        stats.written,
        stats.failed
    );
    stats
}

/// Writes one record as JPEG, picking the first free collision suffix.
pub fn write_record(root: &Path, record: &EvidenceRecord) -> Result<PathBuf, EvidenceError> {
    let dir = record.directory(root);
    fs::create_dir_all(&dir).map_err(|e| EvidenceError::CreateDir {
        path: dir.clone(),
        source: e,
    })?;

    let mut collision = 0;
    let path = loop {
        let candidate = record.path(root, collision);
        if !candidate.exists() {
            break candidate;
        }
        collision += 1;
    };

    let frame = &record.image;
    let img = image::RgbImage::from_raw(frame.width(), frame.height(), frame.data().to_vec())
        .ok_or(EvidenceError::InvalidFrame {
            width: frame.width(),
            height: frame.height(),
        })?;
    img.save(&path).map_err(|e| EvidenceError::Encode {
        path: path.clone(),
        source: e,
    })?;
    Ok(path)
}
