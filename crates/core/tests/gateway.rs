//! Drives a full server (gateway, pool, workers, evidence) over real
//! WebSocket connections with scripted models.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use deskguard_core::client::session_table::SessionTable;
use deskguard_core::detection::domain::face_detector::FaceDetector;
use deskguard_core::detection::domain::identity_verifier::{IdentityVerifier, ReferenceImage};
use deskguard_core::detection::domain::model_factory::{ExecutionTarget, ModelFactory, ModelSuite};
use deskguard_core::detection::domain::object_detector::{Detection, ObjectDetector};
use deskguard_core::detection::domain::spoof_checker::SpoofChecker;
use deskguard_core::evidence::infrastructure::evidence_writer::EvidenceWriter;
use deskguard_core::gateway::gateway::{Gateway, GatewayConfig};
use deskguard_core::gateway::infrastructure::user_registry::UserRegistry;
use deskguard_core::pipeline::worker::WorkerConfig;
use deskguard_core::pool::infrastructure::cpu_probe::CpuProbe;
use deskguard_core::pool::pool_manager::{PoolConfig, PoolManager};
use deskguard_core::shared::constants::PHONE_CLASS_ID;
use deskguard_core::shared::frame::Frame;
use deskguard_core::shared::region::Region;
use deskguard_core::state::domain::shared_state::SharedState;
use deskguard_core::state::domain::shared_state_store::ClientSet;
use deskguard_core::state::infrastructure::in_memory_state_store::InMemoryStateStore;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const NO_FACE: u8 = 0;
const VALID: u8 = 1;
const PHONE: u8 = 2;

const STEP: Duration = Duration::from_secs(5);

fn marker(frame: &Frame) -> u8 {
    frame.data().first().copied().unwrap_or(0)
}

struct ScriptedFaces;
impl FaceDetector for ScriptedFaces {
    fn detect(&mut self, frame: &Frame) -> Result<Option<Region>, Box<dyn std::error::Error>> {
        Ok((marker(frame) != NO_FACE).then(|| Region::new(4, 4, 16, 16)))
    }
}

struct ScriptedPhones;
impl ObjectDetector for ScriptedPhones {
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

struct NeverSpoofed;
impl SpoofChecker for NeverSpoofed {
    fn is_spoof(
        &mut self,
        _frame: &Frame,
        _face: &Region,
    ) -> Result<bool, Box<dyn std::error::Error>> {
        Ok(false)
    }
}

struct AlwaysMatches;
impl IdentityVerifier for AlwaysMatches {
    fn verify(
        &mut self,
        _face_crop: &Frame,
        _reference: &ReferenceImage,
    ) -> Result<bool, Box<dyn std::error::Error>> {
        Ok(true)
    }
}

struct ScriptedFactory;
impl ModelFactory for ScriptedFactory {
    fn build(
        &self,
        _target: ExecutionTarget,
    ) -> Result<ModelSuite, Box<dyn std::error::Error + Send + Sync>> {
        Ok(ModelSuite {
            object_detector: Box::new(ScriptedPhones),
            face_detector: Box::new(ScriptedFaces),
            spoof_checker: Box::new(NeverSpoofed),
            identity_verifier: Box::new(AlwaysMatches),
        })
    }
}

struct Server {
    addr: SocketAddr,
    shared: SharedState,
    evidence_root: PathBuf,
    shutdown: watch::Sender<bool>,
    _registry: TempDir,
    _evidence: TempDir,
    _writer: EvidenceWriter,
}

async fn start(users: &[&str], max_pool_size: usize, capacity: usize) -> Server {
    start_with_idle_timeout(users, max_pool_size, capacity, Duration::from_secs(30)).await
}

async fn start_with_idle_timeout(
    users: &[&str],
    max_pool_size: usize,
    capacity: usize,
    idle_timeout: Duration,
) -> Server {
    let registry_dir = TempDir::new().unwrap();
    for user in users {
        image::RgbImage::from_pixel(8, 8, image::Rgb([VALID, VALID, VALID]))
            .save(registry_dir.path().join(format!("{user}.png")))
            .unwrap();
    }
    let evidence_dir = TempDir::new().unwrap();
    let evidence_root = evidence_dir.path().join("Actions");

    let shared = SharedState::new(Arc::new(InMemoryStateStore::new()));
    let sessions = SessionTable::new();
    let writer = EvidenceWriter::spawn(evidence_root.clone());

    let pool_config = PoolConfig {
        max_pool_size,
        worker: WorkerConfig {
            capacity,
            idle_sleep: Duration::from_millis(2),
            target_class: PHONE_CLASS_ID,
        },
        gpu_memory_threshold: 0.9,
        assign_interval: Duration::from_millis(20),
        unassign_interval: Duration::from_millis(20),
        grace_period: Duration::from_secs(1),
    };
    let gateway_config = GatewayConfig {
        bind: SocketAddr::from(([127, 0, 0, 1], 0)),
        idle_timeout,
        monitor_interval: Duration::from_millis(20),
        ceiling: pool_config.ceiling(),
    };

    let pool = Arc::new(PoolManager::new(
        pool_config,
        shared.clone(),
        sessions.clone(),
        Arc::new(ScriptedFactory),
        Arc::new(CpuProbe),
        writer.sender(),
    ));
    let registry = Arc::new(UserRegistry::new(registry_dir.path()).unwrap());
    let gateway = Arc::new(Gateway::new(
        gateway_config,
        shared.clone(),
        sessions,
        registry,
    ));

    let listener = gateway.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, rx) = watch::channel(false);
    tokio::spawn(pool.run(rx.clone()));
    tokio::spawn(gateway.serve(listener, rx));

    Server {
        addr,
        shared,
        evidence_root,
        shutdown,
        _registry: registry_dir,
        _evidence: evidence_dir,
        _writer: writer,
    }
}

async fn connect(server: &Server) -> Client {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}", server.addr))
        .await
        .unwrap();
    ws
}

fn frame_message(username: &str, marker: u8) -> Message {
    let img = image::RgbImage::from_pixel(32, 32, image::Rgb([marker, marker, marker]));
    let mut png = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
        .unwrap();
    let body = serde_json::json!({
        "username": username,
        "image": STANDARD.encode(png),
        "timestamp": 1_700_000_000.25,
    });
    Message::Text(body.to_string())
}

async fn next_message(ws: &mut Client) -> Message {
    tokio::time::timeout(STEP, ws.next())
        .await
        .expect("timed out waiting for the server")
        .expect("stream ended")
        .expect("websocket error")
}

async fn next_json(ws: &mut Client) -> serde_json::Value {
    match next_message(ws).await {
        Message::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected a text response, got {other:?}"),
    }
}

async fn next_close_code(ws: &mut Client) -> u16 {
    match next_message(ws).await {
        Message::Close(Some(frame)) => u16::from(frame.code),
        other => panic!("expected a close frame, got {other:?}"),
    }
}

async fn wait_for_evidence(dir: &Path) -> Vec<PathBuf> {
    let deadline = tokio::time::Instant::now() + STEP;
    loop {
        if let Ok(entries) = std::fs::read_dir(dir) {
            let files: Vec<PathBuf> = entries.filter_map(Result::ok).map(|e| e.path()).collect();
            if !files.is_empty() {
                return files;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no evidence under {}",
            dir.display()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_absent_user_locks_screen_and_writes_evidence() {
    let server = start(&["alice"], 2, 4).await;
    let mut ws = connect(&server).await;

    ws.send(frame_message("alice", NO_FACE)).await.unwrap();
    let response = next_json(&mut ws).await;
    assert_eq!(response["action"], "lock-screen");
    assert_eq!(response["reason"], "no-face");
    assert_eq!(response["actual_username"], "alice");
    assert_eq!(response["send_time"], 1_700_000_000.25);

    let files = wait_for_evidence(&server.evidence_root.join("Lock_screen").join("alice")).await;
    assert_eq!(files.len(), 1);
    let name = files[0].file_name().unwrap().to_string_lossy().to_string();
    assert!(name.ends_with("___Lock_screen___No_face.jpg"), "{name}");

    let _ = server.shutdown.send(true);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_phone_signs_out_and_closes_connection() {
    let server = start(&["bob"], 2, 4).await;
    let mut ws = connect(&server).await;

    ws.send(frame_message("bob", PHONE)).await.unwrap();
    let response = next_json(&mut ws).await;
    assert_eq!(response["action"], "sign-out");
    assert_eq!(response["reason"], "phone-detection");
    assert_eq!(next_close_code(&mut ws).await, 4004);

    let files = wait_for_evidence(&server.evidence_root.join("Sign_out").join("bob")).await;
    assert_eq!(files.len(), 1);

    let _ = server.shutdown.send(true);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unknown_user_is_refused() {
    let server = start(&["alice"], 2, 4).await;
    let mut ws = connect(&server).await;

    ws.send(frame_message("carol", VALID)).await.unwrap();
    let notice = next_json(&mut ws).await;
    assert_eq!(notice["reason"], "unavailable");
    assert_eq!(next_close_code(&mut ws).await, 4002);

    let _ = server.shutdown.send(true);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_client_beyond_capacity_is_refused() {
    let server = start(&["alice", "bob"], 1, 1).await;

    let mut alice = connect(&server).await;
    alice.send(frame_message("alice", NO_FACE)).await.unwrap();
    assert_eq!(next_json(&mut alice).await["action"], "lock-screen");

    let mut bob = connect(&server).await;
    bob.send(frame_message("bob", VALID)).await.unwrap();
    assert_eq!(next_close_code(&mut bob).await, 4001);
    assert!(server.shared.system_full().await.unwrap());

    let _ = server.shutdown.send(true);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_second_connection_for_same_user_is_refused() {
    let server = start(&["alice"], 2, 4).await;

    let mut first = connect(&server).await;
    first.send(frame_message("alice", NO_FACE)).await.unwrap();
    assert_eq!(next_json(&mut first).await["reason"], "no-face");

    let mut second = connect(&server).await;
    second.send(frame_message("alice", VALID)).await.unwrap();
    assert_eq!(next_close_code(&mut second).await, 4006);

    let _ = server.shutdown.send(true);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_malformed_message_keeps_connection_open() {
    let server = start(&["alice"], 2, 4).await;
    let mut ws = connect(&server).await;

    ws.send(Message::Text("{not json".into())).await.unwrap();
    let error = next_json(&mut ws).await;
    assert_eq!(error["action"], "error");
    assert_eq!(error["reason"], "empty");

    ws.send(frame_message("alice", NO_FACE)).await.unwrap();
    assert_eq!(next_json(&mut ws).await["action"], "lock-screen");

    let _ = server.shutdown.send(true);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_idle_connection_is_closed() {
    let server = start_with_idle_timeout(&["alice"], 2, 4, Duration::from_millis(300)).await;
    let mut ws = connect(&server).await;

    ws.send(frame_message("alice", NO_FACE)).await.unwrap();
    assert_eq!(next_json(&mut ws).await["action"], "lock-screen");
    assert_eq!(next_close_code(&mut ws).await, 4005);

    let _ = server.shutdown.send(true);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_paused_session_answers_every_frame_without_inference() {
    let server = start(&["alice"], 2, 4).await;
    let mut ws = connect(&server).await;

    ws.send(frame_message("alice", NO_FACE)).await.unwrap();
    assert_eq!(next_json(&mut ws).await["action"], "lock-screen");

    server
        .shared
        .set_status(ClientSet::Paused, "alice", true)
        .await
        .unwrap();

    // frames sent before the monitor notices the pause are still inferred
    let deadline = tokio::time::Instant::now() + STEP;
    loop {
        ws.send(frame_message("alice", NO_FACE)).await.unwrap();
        let response = next_json(&mut ws).await;
        if response["reason"] == "paused" {
            assert_eq!(response["action"], "no-action");
            break;
        }
        assert_eq!(response["action"], "lock-screen");
        assert!(tokio::time::Instant::now() < deadline, "pause never applied");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    for _ in 0..2 {
        ws.send(frame_message("alice", PHONE)).await.unwrap();
        let response = next_json(&mut ws).await;
        assert_eq!(response["action"], "no-action");
        assert_eq!(response["reason"], "paused");
        assert_eq!(response["actual_username"], "alice");
    }
    assert!(std::fs::read_dir(server.evidence_root.join("Sign_out")).is_err());

    let _ = server.shutdown.send(true);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_deactivated_session_is_notified_and_closed() {
    let server = start(&["alice"], 2, 4).await;
    let mut ws = connect(&server).await;

    ws.send(frame_message("alice", NO_FACE)).await.unwrap();
    assert_eq!(next_json(&mut ws).await["action"], "lock-screen");

    server
        .shared
        .set_status(ClientSet::Deactivated, "alice", true)
        .await
        .unwrap();

    let notice = next_json(&mut ws).await;
    assert_eq!(notice["action"], "error");
    assert_eq!(notice["reason"], "unavailable");
    assert_eq!(next_close_code(&mut ws).await, 4002);

    let _ = server.shutdown.send(true);
}
