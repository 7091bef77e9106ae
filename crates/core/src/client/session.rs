use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use crate::decision::domain::decision_engine::Decision;
use crate::detection::domain::identity_verifier::ReferenceImage;
use crate::gateway::domain::protocol::CloseCode;
use crate::pipeline::worker::WorkerId;
use crate::shared::clock::unix_now;
use crate::shared::frame::Frame;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientStatus {
    Active,
    Paused,
    Blocked,
    Deactivated,
    ConnectionError,
}

/// What the connection's response task should do next.
#[derive(Clone, Debug, PartialEq)]
pub enum Outbound {
    Response(Decision),
    Close(CloseCode),
}

/// A decoded frame waiting for the next worker cycle.
#[derive(Debug)]
pub struct PendingFrame {
    pub frame: Frame,
    pub sent_at: f64,
}

/// The gateway's record of one admitted client.
///
/// Shared between the connection task (writes frames), the assigned worker
/// (takes frames, sends decisions) and the pool manager (assignment).
#[derive(Debug)]
pub struct Session {
    username: String,
    joined_at: f64,
    reference: ReferenceImage,
    outbound: mpsc::UnboundedSender<Outbound>,
    status: Mutex<ClientStatus>,
    slot: Mutex<Option<PendingFrame>>,
    assigned_worker: Mutex<Option<WorkerId>>,
    frames_received: AtomicU64,
    frames_dropped: AtomicU64,
    closed: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Session {
    pub fn new(reference: ReferenceImage, outbound: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            username: reference.username.clone(),
            joined_at: unix_now(),
            reference,
            outbound,
            status: Mutex::new(ClientStatus::Active),
            slot: Mutex::new(None),
            assigned_worker: Mutex::new(None),
            frames_received: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn joined_at(&self) -> f64 {
        self.joined_at
    }

    pub fn reference(&self) -> &ReferenceImage {
        &self.reference
    }

    pub fn status(&self) -> ClientStatus {
        *lock(&self.status)
    }

    pub fn set_status(&self, status: ClientStatus) {
        *lock(&self.status) = status;
    }

    /// Sequence number for the next inbound frame.
    pub fn next_frame_index(&self) -> u64 {
        self.frames_received.fetch_add(1, Ordering::Relaxed)
    }

    /// Stores `frame` as the latest pending frame.
    ///
    /// Returns `true` if an unprocessed older frame was overwritten.
    pub fn submit_frame(&self, frame: Frame, sent_at: f64) -> bool {
        let replaced = lock(&self.slot)
            .replace(PendingFrame { frame, sent_at })
            .is_some();
        if replaced {
            self.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }
        replaced
    }

    pub fn take_frame(&self) -> Option<PendingFrame> {
        lock(&self.slot).take()
    }

    pub fn has_pending_frame(&self) -> bool {
        lock(&self.slot).is_some()
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    pub fn assigned_worker(&self) -> Option<WorkerId> {
        *lock(&self.assigned_worker)
    }

    pub fn set_assigned_worker(&self, worker: Option<WorkerId>) {
        *lock(&self.assigned_worker) = worker;
    }

    /// Clears the assignment only if it still points at `worker`.
    pub fn release_from(&self, worker: WorkerId) {
        let mut assigned = lock(&self.assigned_worker);
        if *assigned == Some(worker) {
            *assigned = None;
        }
    }

    /// Queues a response. Returns `false` once the connection is gone.
    pub fn respond(&self, decision: Decision) -> bool {
        !self.is_closed() && self.outbound.send(Outbound::Response(decision)).is_ok()
    }

    /// Asks the response task to close the socket with `code`.
    ///
    /// Only the first close request is forwarded.
    pub fn close(&self, code: CloseCode) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.outbound.send(Outbound::Close(code));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
