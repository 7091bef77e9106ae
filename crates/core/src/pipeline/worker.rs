use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::client::session::Session;
use crate::decision::domain::decision_engine::{decide, Decision, InferenceResult};
use crate::detection::domain::face_detector::FaceDetector;
use crate::detection::domain::identity_verifier::IdentityVerifier;
use crate::detection::domain::model_factory::{ExecutionTarget, ModelSuite};
use crate::detection::domain::object_detector::{Detection, ObjectDetector};
use crate::detection::domain::spoof_checker::SpoofChecker;
use crate::evidence::domain::evidence_record::EvidenceRecord;
use crate::evidence::infrastructure::evidence_writer::EvidenceSender;
use crate::evidence::infrastructure::frame_annotator;
use crate::pipeline::pipeline_logger::PipelineLogger;
use crate::shared::clock::unix_now;
use crate::shared::constants::PHONE_CLASS_ID;
use crate::shared::frame::Frame;
use crate::shared::region::Region;

pub type WorkerId = u64;

const LANE_CHANNEL_CAPACITY: usize = 1;
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Consecutive model panics after which a lane gives up, crashing the
/// worker so its clients move to fresh models.
const LANE_PANIC_LIMIT: usize = 3;

#[derive(Clone, Debug, PartialEq)]
pub struct WorkerConfig {
    pub capacity: usize,
    pub idle_sleep: Duration,
    pub target_class: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            capacity: 30,
            idle_sleep: Duration::from_millis(10),
            target_class: PHONE_CLASS_ID,
        }
    }
}

/// How a worker's coordinator thread ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerExit {
    Stopped,
    Crashed(String),
}

/// One client's frame within a cycle.
struct Job {
    session: Arc<Session>,
    frame: Arc<Frame>,
    sent_at: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct FaceOutcome {
    face: Option<Region>,
    is_spoof: bool,
    identity_matches: bool,
}

type Batch = Arc<Vec<Job>>;
type LaneOutput<T> = (Vec<T>, f64);

struct Shared {
    clients: Mutex<BTreeMap<String, Arc<Session>>>,
    stop: AtomicBool,
}

impl Shared {
    fn clients(&self) -> MutexGuard<'_, BTreeMap<String, Arc<Session>>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bounded-capacity actor running inference for its assigned clients.
///
/// Layout: `coordinator → {phone lane, face lane} → coordinator [decide]`
///
/// The coordinator collects one pending frame per client, fans the batch
/// out to both lanes, joins their outputs per client and dispatches
/// decisions to clients and the evidence writer.
pub struct PipelineWorker {
    id: WorkerId,
    capacity: usize,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<WorkerExit>>,
}

impl PipelineWorker {
    pub fn spawn(
        id: WorkerId,
        target: ExecutionTarget,
        config: WorkerConfig,
        models: ModelSuite,
        evidence: EvidenceSender,
        logger: Box<dyn PipelineLogger>,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            clients: Mutex::new(BTreeMap::new()),
            stop: AtomicBool::new(false),
        });
        let capacity = config.capacity;
        let thread_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name(format!("worker-{id}"))
            .spawn(move || {
                run_coordinator(id, target, thread_shared, config, models, evidence, logger)
            })?;

        Ok(Self {
            id,
            capacity,
            shared,
            handle: Some(handle),
        })
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Adds a client. Fails at capacity, if already present, or once the
    /// worker is stopping or gone.
    pub fn try_assign(&self, session: Arc<Session>) -> bool {
        if self.shared.stop.load(Ordering::Acquire) || self.has_exited() {
            return false;
        }
        let mut clients = self.shared.clients();
        if clients.len() >= self.capacity || clients.contains_key(session.username()) {
            return false;
        }
        session.set_assigned_worker(Some(self.id));
        clients.insert(session.username().to_string(), session);
        true
    }

    /// Removes a client. Fails if it was not assigned here.
    pub fn unassign(&self, username: &str) -> bool {
        match self.shared.clients().remove(username) {
            Some(session) => {
                session.release_from(self.id);
                true
            }
            None => false,
        }
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.shared.clients().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.shared.clients().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_capacity(&self) -> bool {
        self.len() < self.capacity
    }

    pub fn has_exited(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// The worker finishes its current cycle, releases its clients and exits.
    pub fn request_stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
    }

    /// Waits up to `grace` for the coordinator to exit.
    ///
    /// A worker still running after the grace period is abandoned and
    /// reported as crashed.
    pub fn join(mut self, grace: Duration) -> WorkerExit {
        let Some(handle) = self.handle.take() else {
            return WorkerExit::Crashed("worker was already joined".into());
        };
        let deadline = Instant::now() + grace;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                release_all(self.id, &self.shared);
                return WorkerExit::Crashed(format!(
                    "did not stop within {:.1}s",
                    grace.as_secs_f64()
                ));
            }
            std::thread::sleep(JOIN_POLL_INTERVAL);
        }
        let exit = match handle.join() {
            Ok(exit) => exit,
            Err(payload) => WorkerExit::Crashed(panic_message(payload.as_ref())),
        };
        // a coordinator panic skips its own cleanup
        release_all(self.id, &self.shared);
        exit
    }
}

impl Drop for PipelineWorker {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
    }
}

fn release_all(id: WorkerId, shared: &Shared) {
    let released = std::mem::take(&mut *shared.clients());
    for session in released.values() {
        session.release_from(id);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn run_coordinator(
    id: WorkerId,
    target: ExecutionTarget,
    shared: Arc<Shared>,
    config: WorkerConfig,
    models: ModelSuite,
    evidence: EvidenceSender,
    mut logger: Box<dyn PipelineLogger>,
) -> WorkerExit {
    let ModelSuite {
        object_detector,
        face_detector,
        spoof_checker,
        identity_verifier,
    } = models;

    let (phone_tx, phone_rx) = crossbeam_channel::bounded::<Batch>(LANE_CHANNEL_CAPACITY);
    let (phone_out_tx, phone_out_rx) =
        crossbeam_channel::bounded::<LaneOutput<Option<Detection>>>(LANE_CHANNEL_CAPACITY);
    let (face_tx, face_rx) = crossbeam_channel::bounded::<Batch>(LANE_CHANNEL_CAPACITY);
    let (face_out_tx, face_out_rx) =
        crossbeam_channel::bounded::<LaneOutput<FaceOutcome>>(LANE_CHANNEL_CAPACITY);

    let phone_handle = spawn_phone_lane(
        id,
        object_detector,
        config.target_class,
        phone_rx,
        phone_out_tx,
    );
    let face_handle = spawn_face_lane(
        id,
        face_detector,
        spoof_checker,
        identity_verifier,
        face_rx,
        face_out_tx,
    );

    let mut exit = match (&phone_handle, &face_handle) {
        (Ok(_), Ok(_)) => None,
        _ => Some(WorkerExit::Crashed("failed to start lane threads".into())),
    };
    if exit.is_none() {
        logger.info(&format!("started on {target} (capacity {})", config.capacity));
    }

    while exit.is_none() {
        if shared.stop.load(Ordering::Acquire) {
            exit = Some(WorkerExit::Stopped);
            break;
        }

        let batch = collect_batch(&shared);
        if batch.is_empty() {
            std::thread::sleep(config.idle_sleep);
            continue;
        }

        let started = Instant::now();
        let batch: Batch = Arc::new(batch);
        if phone_tx.send(batch.clone()).is_err() {
            exit = Some(WorkerExit::Crashed("phone lane terminated".into()));
            break;
        }
        if face_tx.send(batch.clone()).is_err() {
            exit = Some(WorkerExit::Crashed("face lane terminated".into()));
            break;
        }
        let Ok((phones, phone_ms)) = phone_out_rx.recv() else {
            exit = Some(WorkerExit::Crashed("phone lane terminated".into()));
            break;
        };
        let Ok((faces, face_ms)) = face_out_rx.recv() else {
            exit = Some(WorkerExit::Crashed("face lane terminated".into()));
            break;
        };
        logger.timing("phone", phone_ms);
        logger.timing("face", face_ms);

        for ((job, phone), face) in batch.iter().zip(phones).zip(faces) {
            dispatch(job, phone, face, &evidence, logger.as_mut());
        }
        logger.cycle(batch.len(), started.elapsed().as_secs_f64() * 1000.0);
    }

    drop(phone_tx);
    drop(face_tx);
    let mut exit = exit.unwrap_or(WorkerExit::Stopped);
    for (lane, handle) in [("phone", phone_handle), ("face", face_handle)] {
        if let Ok(handle) = handle {
            if let Err(payload) = handle.join() {
                let message = panic_message(payload.as_ref());
                log::error!("Worker {id} {lane} lane panicked: {message}");
                exit = WorkerExit::Crashed(format!("{lane} lane panicked: {message}"));
            }
        }
    }

    release_all(id, &shared);
    logger.summary();
    match &exit {
        WorkerExit::Stopped => logger.info("stopped"),
        WorkerExit::Crashed(reason) => log::error!("Worker {id} crashed: {reason}"),
    }
    exit
}

/// Takes at most one pending frame per client, in client-id order.
fn collect_batch(shared: &Shared) -> Vec<Job> {
    let clients = shared.clients();
    let mut batch = Vec::new();
    for session in clients.values() {
        if session.is_closed() {
            continue;
        }
        if let Some(pending) = session.take_frame() {
            let dropped = session.frames_dropped();
            if dropped > 0 {
                log::debug!("{}: {dropped} frames dropped so far", session.username());
            }
            batch.push(Job {
                session: session.clone(),
                frame: Arc::new(pending.frame),
                sent_at: pending.sent_at,
            });
        }
    }
    batch
}

fn dispatch(
    job: &Job,
    phone: Option<Detection>,
    face: FaceOutcome,
    evidence: &EvidenceSender,
    logger: &mut dyn PipelineLogger,
) {
    let result = InferenceResult {
        face: face.face,
        phone,
        is_spoof: face.is_spoof,
        identity_matches: face.identity_matches,
        frame: job.frame.clone(),
    };
    let verdict = decide(&result);
    logger.decision(verdict.action, verdict.reason);
    if !verdict.action.is_actionable() {
        return;
    }

    let username = job.session.username();
    let annotated = frame_annotator::annotate(&result.frame, verdict.evidence_box, verdict.reason);
    if !evidence.submit(EvidenceRecord::new(
        username,
        verdict.action,
        verdict.reason,
        annotated,
    )) {
        log::warn!("Evidence writer is gone; dropping record for {username}");
    }

    job.session.respond(Decision {
        action: verdict.action,
        reason: verdict.reason,
        username: username.to_string(),
        sent_at: job.sent_at,
        finished_at: unix_now(),
    });
}

fn spawn_phone_lane(
    id: WorkerId,
    mut detector: Box<dyn ObjectDetector>,
    target_class: usize,
    batch_rx: crossbeam_channel::Receiver<Batch>,
    out_tx: crossbeam_channel::Sender<LaneOutput<Option<Detection>>>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("worker-{id}-phone"))
        .spawn(move || {
            let mut panics = PanicCounter::default();
            for batch in batch_rx {
                let started = Instant::now();
                let mut results = Vec::with_capacity(batch.len());
                for job in batch.iter() {
                    let username = job.session.username();
                    let outcome =
                        catch_unwind(AssertUnwindSafe(|| detector.detect(&job.frame, target_class)));
                    let hit = match panics.observe(id, "phone", username, outcome) {
                        Some(Ok(hit)) => hit,
                        Some(Err(e)) => {
                            log::warn!("{username}: object detection failed: {e}");
                            None
                        }
                        None => None,
                    };
                    results.push(hit);
                }
                if panics.exhausted() {
                    return;
                }
                let elapsed = started.elapsed().as_secs_f64() * 1000.0;
                if out_tx.send((results, elapsed)).is_err() {
                    break;
                }
            }
        })
}

fn spawn_face_lane(
    id: WorkerId,
    mut detector: Box<dyn FaceDetector>,
    mut spoof_checker: Box<dyn SpoofChecker>,
    mut verifier: Box<dyn IdentityVerifier>,
    batch_rx: crossbeam_channel::Receiver<Batch>,
    out_tx: crossbeam_channel::Sender<LaneOutput<FaceOutcome>>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("worker-{id}-face"))
        .spawn(move || {
            let mut panics = PanicCounter::default();
            for batch in batch_rx {
                let started = Instant::now();
                let mut results = Vec::with_capacity(batch.len());
                for job in batch.iter() {
                    let outcome = catch_unwind(AssertUnwindSafe(|| {
                        analyze_face(job, detector.as_mut(), spoof_checker.as_mut(), verifier.as_mut())
                    }));
                    results.push(
                        panics
                            .observe(id, "face", job.session.username(), outcome)
                            .unwrap_or_default(),
                    );
                }
                if panics.exhausted() {
                    return;
                }
                let elapsed = started.elapsed().as_secs_f64() * 1000.0;
                if out_tx.send((results, elapsed)).is_err() {
                    break;
                }
            }
        })
}

/// Tracks consecutive model panics within one lane.
///
/// A panic counts as a failed call for that client only; a lane whose
/// models keep panicking stops so the pool restarts the worker.
#[derive(Default)]
struct PanicCounter {
    consecutive: usize,
}

impl PanicCounter {
    fn observe<T>(
        &mut self,
        id: WorkerId,
        lane: &str,
        username: &str,
        outcome: std::thread::Result<T>,
    ) -> Option<T> {
        match outcome {
            Ok(value) => {
                self.consecutive = 0;
                Some(value)
            }
            Err(payload) => {
                self.consecutive += 1;
                log::error!(
                    "Worker {id} {lane} lane: model panicked on {username}'s frame: {}",
                    panic_message(payload.as_ref())
                );
                None
            }
        }
    }

    fn exhausted(&self) -> bool {
        self.consecutive >= LANE_PANIC_LIMIT
    }
}

/// Face detection, then anti-spoof and identity on the detected face.
///
/// Failures fall back to the stricter outcome: no face, not spoof
/// (identity still gates), mismatch.
fn analyze_face(
    job: &Job,
    detector: &mut dyn FaceDetector,
    spoof_checker: &mut dyn SpoofChecker,
    verifier: &mut dyn IdentityVerifier,
) -> FaceOutcome {
    let username = job.session.username();
    let face = match detector.detect(&job.frame) {
        Ok(Some(face)) => face,
        Ok(None) => return FaceOutcome::default(),
        Err(e) => {
            log::warn!("{username}: face detection failed: {e}");
            return FaceOutcome::default();
        }
    };

    let is_spoof = spoof_checker
        .is_spoof(&job.frame, &face)
        .unwrap_or_else(|e| {
            log::warn!("{username}: anti-spoof check failed: {e}");
            false
        });

    let identity_matches = match job.frame.crop(&face) {
        Some(crop) => verifier
            .verify(&crop, job.session.reference())
            .unwrap_or_else(|e| {
                log::warn!("{username}: identity verification failed: {e}");
                false
            }),
        None => false,
    };

    FaceOutcome {
        face: Some(face),
        is_spoof,
        identity_matches,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::client::session::Outbound;
    use crate::decision::domain::action::{Action, Reason};
    use crate::detection::domain::identity_verifier::ReferenceImage;
    use crate::evidence::infrastructure::evidence_writer::EvidenceWriter;
    use crate::pipeline::pipeline_logger::NullPipelineLogger;
    use tokio::sync::mpsc;

    // --- Scripted fakes keyed on the first pixel of each frame ---
    //
    // Red channel of pixel 0: 0 = no face, 1 = valid face, 2 = face + phone,
    // 3 = spoofed face, 4 = wrong user, 255 = panic in the face detector.

    pub(crate) const NO_FACE: u8 = 0;
    pub(crate) const VALID: u8 = 1;
    pub(crate) const PHONE: u8 = 2;
    pub(crate) const SPOOF: u8 = 3;
    pub(crate) const WRONG_USER: u8 = 4;
    pub(crate) const PANIC: u8 = 255;

    fn marker(frame: &Frame) -> u8 {
        frame.data().first().copied().unwrap_or(0)
    }

    pub(crate) struct FakeFaceDetector;
    impl FaceDetector for FakeFaceDetector {
        fn detect(&mut self, frame: &Frame) -> Result<Option<Region>, Box<dyn std::error::Error>> {
            match marker(frame) {
                NO_FACE => Ok(None),
                PANIC => panic!("scripted face detector panic"),
                _ => Ok(Some(Region::new(4, 4, 16, 16))),
            }
        }
    }

    pub(crate) struct FakeObjectDetector;
    impl ObjectDetector for FakeObjectDetector {
        fn detect(
            &mut self,
            frame: &Frame,
            _target_class: usize,
        ) -> Result<Option<Detection>, Box<dyn std::error::Error>> {
            Ok((marker(frame) == PHONE).then(|| Detection {
                region: Region::new(20, 20, 8, 8),
                confidence: 0.9,
            }))
        }
    }

    pub(crate) struct FakeSpoofChecker;
    impl SpoofChecker for FakeSpoofChecker {
        fn is_spoof(
            &mut self,
            frame: &Frame,
            _face: &Region,
        ) -> Result<bool, Box<dyn std::error::Error>> {
            Ok(marker(frame) == SPOOF)
        }
    }

    /// Crops inherit the marker from the top-left of the face box, which
    /// the scripted frames paint uniformly.
    pub(crate) struct FakeIdentityVerifier;
    impl IdentityVerifier for FakeIdentityVerifier {
        fn verify(
            &mut self,
            face_crop: &Frame,
            _reference: &ReferenceImage,
        ) -> Result<bool, Box<dyn std::error::Error>> {
            Ok(marker(face_crop) != WRONG_USER)
        }
    }

    struct FailingFaceDetector;
    impl FaceDetector for FailingFaceDetector {
        fn detect(&mut self, _frame: &Frame) -> Result<Option<Region>, Box<dyn std::error::Error>> {
            Err("model exploded".into())
        }
    }

    pub(crate) fn fake_suite() -> ModelSuite {
        ModelSuite {
            object_detector: Box::new(FakeObjectDetector),
            face_detector: Box::new(FakeFaceDetector),
            spoof_checker: Box::new(FakeSpoofChecker),
            identity_verifier: Box::new(FakeIdentityVerifier),
        }
    }

    pub(crate) fn scripted_frame(marker: u8) -> Frame {
        Frame::new(vec![marker; 32 * 32 * 3], 32, 32, 3, 0)
    }

    pub(crate) fn session(name: &str) -> (Arc<Session>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let reference = ReferenceImage {
            username: name.into(),
            frame: Arc::new(scripted_frame(VALID)),
        };
        (Arc::new(Session::new(reference, tx)), rx)
    }

    fn config(capacity: usize) -> WorkerConfig {
        WorkerConfig {
            capacity,
            idle_sleep: Duration::from_millis(1),
            target_class: PHONE_CLASS_ID,
        }
    }

    fn spawn(capacity: usize, models: ModelSuite, evidence: &EvidenceWriter) -> PipelineWorker {
        PipelineWorker::spawn(
            1,
            ExecutionTarget::Cpu,
            config(capacity),
            models,
            evidence.sender(),
            Box::new(NullPipelineLogger),
        )
        .unwrap()
    }

    fn recv_decision(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Decision {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match rx.try_recv() {
                Ok(Outbound::Response(d)) => return d,
                Ok(other) => panic!("unexpected outbound {other:?}"),
                Err(_) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(2)),
                Err(_) => panic!("no decision within 5s"),
            }
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not met within 5s");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_try_assign_respects_capacity_and_duplicates() {
        let tmp = tempfile::tempdir().unwrap();
        let evidence = EvidenceWriter::spawn(tmp.path().to_path_buf());
        let worker = spawn(2, fake_suite(), &evidence);
        let (a, _ra) = session("a");
        let (b, _rb) = session("b");
        let (c, _rc) = session("c");

        assert!(worker.try_assign(a.clone()));
        assert!(!worker.try_assign(a.clone()));
        assert!(worker.try_assign(b));
        assert!(!worker.try_assign(c.clone()));
        assert_eq!(worker.len(), 2);
        assert_eq!(a.assigned_worker(), Some(1));
        assert_eq!(c.assigned_worker(), None);

        assert!(worker.unassign("a"));
        assert!(!worker.unassign("a"));
        assert_eq!(a.assigned_worker(), None);

        worker.request_stop();
        assert_eq!(worker.join(Duration::from_secs(5)), WorkerExit::Stopped);
        evidence.shutdown();
    }

    #[rstest::rstest]
    #[case(NO_FACE, Action::LockScreen, Reason::NoFace)]
    #[case(PHONE, Action::SignOut, Reason::PhoneDetection)]
    #[case(SPOOF, Action::SignOut, Reason::SpoofImage)]
    #[case(WRONG_USER, Action::LockScreen, Reason::WrongUser)]
    fn test_cycle_produces_decision(
        #[case] marker: u8,
        #[case] action: Action,
        #[case] reason: Reason,
    ) {
        let tmp = tempfile::tempdir().unwrap();
        let evidence = EvidenceWriter::spawn(tmp.path().to_path_buf());
        let worker = spawn(4, fake_suite(), &evidence);
        let (s, mut rx) = session("alice");
        assert!(worker.try_assign(s.clone()));

        s.submit_frame(scripted_frame(marker), 100.0);
        let decision = recv_decision(&mut rx);
        assert_eq!((decision.action, decision.reason), (action, reason));
        assert_eq!(decision.username, "alice");
        assert_eq!(decision.sent_at, 100.0);
        assert!(decision.finished_at >= decision.sent_at);

        worker.request_stop();
        worker.join(Duration::from_secs(5));
        assert_eq!(evidence.shutdown().written, 1);
        let user_dir = tmp.path().join(action.evidence_name()).join("alice");
        assert_eq!(std::fs::read_dir(user_dir).unwrap().count(), 1);
    }

    #[test]
    fn test_valid_frame_sends_nothing_and_writes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let evidence = EvidenceWriter::spawn(tmp.path().to_path_buf());
        let worker = spawn(4, fake_suite(), &evidence);
        let (s, mut rx) = session("bob");
        assert!(worker.try_assign(s.clone()));

        s.submit_frame(scripted_frame(VALID), 1.0);
        wait_until(|| !s.has_pending_frame());
        // follow with an actionable frame so we know the first cycle finished
        s.submit_frame(scripted_frame(NO_FACE), 2.0);
        let decision = recv_decision(&mut rx);
        assert_eq!(decision.reason, Reason::NoFace);
        assert_eq!(decision.sent_at, 2.0);

        worker.request_stop();
        worker.join(Duration::from_secs(5));
        assert_eq!(evidence.shutdown().written, 1);
    }

    #[test]
    fn test_face_detection_error_locks_screen() {
        let tmp = tempfile::tempdir().unwrap();
        let evidence = EvidenceWriter::spawn(tmp.path().to_path_buf());
        let mut models = fake_suite();
        models.face_detector = Box::new(FailingFaceDetector);
        let worker = spawn(4, models, &evidence);
        let (s, mut rx) = session("carol");
        assert!(worker.try_assign(s.clone()));

        s.submit_frame(scripted_frame(VALID), 1.0);
        let decision = recv_decision(&mut rx);
        assert_eq!(
            (decision.action, decision.reason),
            (Action::LockScreen, Reason::NoFace)
        );

        worker.request_stop();
        assert_eq!(worker.join(Duration::from_secs(5)), WorkerExit::Stopped);
        evidence.shutdown();
    }

    #[test]
    fn test_model_panic_only_affects_that_client() {
        let tmp = tempfile::tempdir().unwrap();
        let evidence = EvidenceWriter::spawn(tmp.path().to_path_buf());
        let worker = spawn(4, fake_suite(), &evidence);
        let (a, mut ra) = session("a");
        let (b, mut rb) = session("b");
        assert!(worker.try_assign(a.clone()));
        assert!(worker.try_assign(b.clone()));

        a.submit_frame(scripted_frame(PANIC), 1.0);
        b.submit_frame(scripted_frame(PHONE), 1.0);
        let decision = recv_decision(&mut ra);
        assert_eq!(
            (decision.action, decision.reason),
            (Action::LockScreen, Reason::NoFace)
        );
        assert_eq!(recv_decision(&mut rb).reason, Reason::PhoneDetection);

        a.submit_frame(scripted_frame(WRONG_USER), 2.0);
        assert_eq!(recv_decision(&mut ra).reason, Reason::WrongUser);
        assert!(!worker.has_exited());
        assert_eq!(a.assigned_worker(), Some(1));

        worker.request_stop();
        assert_eq!(worker.join(Duration::from_secs(5)), WorkerExit::Stopped);
        evidence.shutdown();
    }

    #[test]
    fn test_repeated_model_panics_crash_worker_and_release_clients() {
        let tmp = tempfile::tempdir().unwrap();
        let evidence = EvidenceWriter::spawn(tmp.path().to_path_buf());
        let worker = spawn(4, fake_suite(), &evidence);
        let (a, _ra) = session("a");
        let (b, _rb) = session("b");
        assert!(worker.try_assign(a.clone()));
        assert!(worker.try_assign(b.clone()));

        wait_until(|| {
            a.submit_frame(scripted_frame(PANIC), 1.0);
            worker.has_exited()
        });

        assert!(!worker.try_assign(session("c").0));
        match worker.join(Duration::from_secs(5)) {
            WorkerExit::Crashed(reason) => assert!(reason.contains("face lane")),
            other => panic!("expected crash, got {other:?}"),
        }
        assert_eq!(a.assigned_worker(), None);
        assert_eq!(b.assigned_worker(), None);
        evidence.shutdown();
    }

    #[test]
    fn test_stop_releases_clients() {
        let tmp = tempfile::tempdir().unwrap();
        let evidence = EvidenceWriter::spawn(tmp.path().to_path_buf());
        let worker = spawn(4, fake_suite(), &evidence);
        let (a, _ra) = session("a");
        assert!(worker.try_assign(a.clone()));

        worker.request_stop();
        assert!(!worker.try_assign(session("b").0));
        assert_eq!(worker.join(Duration::from_secs(5)), WorkerExit::Stopped);
        assert_eq!(a.assigned_worker(), None);
        evidence.shutdown();
    }

    #[test]
    fn test_one_decision_per_cycle_keeps_latest_frame() {
        let tmp = tempfile::tempdir().unwrap();
        let evidence = EvidenceWriter::spawn(tmp.path().to_path_buf());
        let (s, mut rx) = session("dave");
        // queue two frames before the worker exists; only the latest survives
        s.submit_frame(scripted_frame(NO_FACE), 1.0);
        s.submit_frame(scripted_frame(PHONE), 2.0);

        let worker = spawn(4, fake_suite(), &evidence);
        assert!(worker.try_assign(s.clone()));
        let decision = recv_decision(&mut rx);
        assert_eq!(decision.reason, Reason::PhoneDetection);
        assert_eq!(s.frames_dropped(), 1);

        worker.request_stop();
        worker.join(Duration::from_secs(5));
        evidence.shutdown();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_analyze_face_crop_mismatch_without_face_is_default() {
        let (s, _rx) = session("erin");
        let job = Job {
            session: s,
            frame: Arc::new(scripted_frame(NO_FACE)),
            sent_at: 0.0,
        };
        let out = analyze_face(
            &job,
            &mut FakeFaceDetector,
            &mut FakeSpoofChecker,
            &mut FakeIdentityVerifier,
        );
        assert_eq!(out, FaceOutcome::default());
    }
}
