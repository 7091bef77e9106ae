use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::sync::watch;

use deskguard_core::client::session_table::SessionTable;
use deskguard_core::config::{GpuProbeKind, ServerConfig, StateBackend};
use deskguard_core::detection::domain::model_factory::ModelFactory;
use deskguard_core::detection::infrastructure::onnx_model_factory::{
    ModelThresholds, OnnxModelFactory,
};
use deskguard_core::evidence::infrastructure::evidence_writer::EvidenceWriter;
use deskguard_core::gateway::gateway::{Gateway, GatewayConfig};
use deskguard_core::gateway::infrastructure::user_registry::UserRegistry;
use deskguard_core::pipeline::worker::WorkerConfig;
use deskguard_core::pool::domain::gpu_probe::GpuProbe;
use deskguard_core::pool::infrastructure::cpu_probe::CpuProbe;
use deskguard_core::pool::infrastructure::nvidia_smi_probe::NvidiaSmiProbe;
use deskguard_core::pool::pool_manager::{PoolConfig, PoolManager};
use deskguard_core::shared::constants::{DEFAULT_EVIDENCE_DIR, PHONE_CLASS_ID};
use deskguard_core::state::domain::shared_state::SharedState;
use deskguard_core::state::domain::shared_state_store::SharedStateStore;
use deskguard_core::state::infrastructure::in_memory_state_store::InMemoryStateStore;
use deskguard_core::state::infrastructure::redis_state_store::{
    RedisStateStore, DEFAULT_KEY_PREFIX,
};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ProbeArg {
    NvidiaSmi,
    Cpu,
}

/// Workstation presence monitoring server.
#[derive(Parser)]
#[command(name = "deskguard")]
struct Cli {
    /// Address the WebSocket gateway listens on.
    #[arg(long, env = "DESKGUARD_BIND", default_value = "0.0.0.0:8765")]
    bind: SocketAddr,

    /// Directory of reference images, one `<username>.<ext>` per user.
    #[arg(long, env = "DESKGUARD_REGISTRY_DIR", default_value = "users")]
    registry_dir: PathBuf,

    /// Only admit these users (comma-separated).
    #[arg(long, env = "DESKGUARD_ALLOW", value_delimiter = ',')]
    allow: Option<Vec<String>>,

    /// Refuse these users as blocked (comma-separated).
    #[arg(long, env = "DESKGUARD_DENY", value_delimiter = ',')]
    deny: Option<Vec<String>>,

    /// Root directory for evidence images.
    #[arg(long, env = "DESKGUARD_EVIDENCE_DIR", default_value = DEFAULT_EVIDENCE_DIR)]
    evidence_dir: PathBuf,

    /// Directory searched for ONNX models before the user cache.
    #[arg(long, env = "DESKGUARD_MODEL_DIR")]
    model_dir: Option<PathBuf>,

    /// Shared state in Redis instead of in-process memory.
    #[arg(long, env = "DESKGUARD_REDIS_URL")]
    redis_url: Option<String>,

    /// Key prefix for shared state in Redis.
    #[arg(long, env = "DESKGUARD_REDIS_PREFIX", default_value = DEFAULT_KEY_PREFIX)]
    redis_prefix: String,

    /// How GPU memory headroom is measured.
    #[arg(long, env = "DESKGUARD_GPU_PROBE", value_enum, default_value = "nvidia-smi")]
    gpu_probe: ProbeArg,

    /// Most pipeline workers alive at once.
    #[arg(long, env = "DESKGUARD_MAX_POOL_SIZE", default_value = "5")]
    max_pool_size: usize,

    /// Clients served by one worker.
    #[arg(long, env = "DESKGUARD_WORKER_CAPACITY", default_value = "30")]
    worker_capacity: usize,

    /// GPU memory fraction above which no new worker is placed (0.0-1.0).
    #[arg(long, env = "DESKGUARD_GPU_THRESHOLD", default_value = "0.9")]
    gpu_threshold: f64,

    /// Assignment pass interval in milliseconds.
    #[arg(long, env = "DESKGUARD_ASSIGN_INTERVAL_MS", default_value = "1000")]
    assign_interval_ms: u64,

    /// Unassignment pass interval in milliseconds.
    #[arg(long, env = "DESKGUARD_UNASSIGN_INTERVAL_MS", default_value = "100")]
    unassign_interval_ms: u64,

    /// Gateway state monitor interval in milliseconds.
    #[arg(long, env = "DESKGUARD_MONITOR_INTERVAL_MS", default_value = "500")]
    monitor_interval_ms: u64,

    /// Seconds without a message before a connection is closed.
    #[arg(long, env = "DESKGUARD_IDLE_TIMEOUT_SECS", default_value = "60")]
    idle_timeout_secs: u64,

    /// Worker sleep when no client has a pending frame, in milliseconds.
    #[arg(long, env = "DESKGUARD_WORKER_IDLE_MS", default_value = "10")]
    worker_idle_ms: u64,

    /// Seconds a stopping worker may take before it counts as crashed.
    #[arg(long, env = "DESKGUARD_GRACE_SECS", default_value = "5")]
    grace_secs: u64,

    /// Face detection confidence threshold (0.0-1.0).
    #[arg(long, env = "DESKGUARD_FACE_CONFIDENCE", default_value = "0.5")]
    face_confidence: f64,

    /// Phone detection confidence threshold (0.0-1.0).
    #[arg(long, env = "DESKGUARD_PHONE_CONFIDENCE", default_value = "0.4")]
    phone_confidence: f64,

    /// Cosine similarity needed to accept a face as the enrolled user.
    #[arg(long, env = "DESKGUARD_IDENTITY_THRESHOLD", default_value = "0.4")]
    identity_threshold: f64,

    /// Live probability below which a face counts as a spoof.
    #[arg(long, env = "DESKGUARD_LIVE_THRESHOLD", default_value = "0.5")]
    live_threshold: f32,
}

impl Cli {
    fn into_config(self) -> ServerConfig {
        let pool = PoolConfig {
            max_pool_size: self.max_pool_size,
            worker: WorkerConfig {
                capacity: self.worker_capacity,
                idle_sleep: Duration::from_millis(self.worker_idle_ms),
                target_class: PHONE_CLASS_ID,
            },
            gpu_memory_threshold: self.gpu_threshold,
            assign_interval: Duration::from_millis(self.assign_interval_ms),
            unassign_interval: Duration::from_millis(self.unassign_interval_ms),
            grace_period: Duration::from_secs(self.grace_secs),
        };
        let gateway = GatewayConfig {
            bind: self.bind,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            monitor_interval: Duration::from_millis(self.monitor_interval_ms),
            ceiling: pool.ceiling(),
        };
        let state = match self.redis_url {
            Some(url) => StateBackend::Redis {
                url,
                prefix: self.redis_prefix,
            },
            None => StateBackend::InMemory,
        };
        ServerConfig {
            gateway,
            pool,
            registry_dir: self.registry_dir,
            allow_list: self.allow,
            deny_list: self.deny.unwrap_or_default(),
            evidence_root: self.evidence_dir,
            model_dir: self.model_dir,
            thresholds: ModelThresholds {
                face_confidence: self.face_confidence,
                object_confidence: self.phone_confidence,
                identity_similarity: self.identity_threshold,
                live_probability: self.live_threshold,
            },
            state,
            gpu_probe: match self.gpu_probe {
                ProbeArg::NvidiaSmi => GpuProbeKind::NvidiaSmi,
                ProbeArg::Cpu => GpuProbeKind::Cpu,
            },
        }
    }
}

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Cli::parse().into_config();
    config.validate()?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(serve(config))
}

async fn serve(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut registry =
        UserRegistry::new(&config.registry_dir)?.with_deny_list(config.deny_list.clone());
    if let Some(allow) = &config.allow_list {
        registry = registry.with_allow_list(allow.clone());
    }
    log::info!(
        "Registry {}: {} enrolled users",
        registry.dir().display(),
        registry.usernames()?.len()
    );

    let store: Arc<dyn SharedStateStore> = match &config.state {
        StateBackend::InMemory => Arc::new(InMemoryStateStore::new()),
        StateBackend::Redis { url, prefix } => {
            log::info!("Connecting to shared state at {url}");
            Arc::new(RedisStateStore::connect(url, prefix).await?)
        }
    };
    let shared = SharedState::new(store);
    shared.set_system_full(false).await?;
    shared.set_gpu_full(false).await?;

    let gpu: Arc<dyn GpuProbe> = match config.gpu_probe {
        GpuProbeKind::NvidiaSmi => Arc::new(NvidiaSmiProbe::new()),
        GpuProbeKind::Cpu => Arc::new(CpuProbe),
    };

    log::info!("Resolving models");
    let factory: Arc<dyn ModelFactory> = Arc::new(OnnxModelFactory::new(
        config.model_dir.as_deref(),
        config.thresholds.clone(),
    )?);

    let evidence = EvidenceWriter::spawn(config.evidence_root.clone());
    let sessions = SessionTable::new();

    let pool = Arc::new(PoolManager::new(
        config.pool.clone(),
        shared.clone(),
        sessions.clone(),
        factory,
        gpu,
        evidence.sender(),
    ));
    let gateway = Arc::new(Gateway::new(
        config.gateway.clone(),
        shared,
        sessions,
        Arc::new(registry),
    ));
    let listener = gateway.bind().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pool_task = tokio::spawn(pool.run(shutdown_rx.clone()));
    let gateway_task = tokio::spawn(gateway.serve(listener, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down");
    let _ = shutdown_tx.send(true);

    let _ = gateway_task.await;
    let _ = pool_task.await;

    let stats = tokio::task::spawn_blocking(move || evidence.shutdown()).await?;
    log::info!(
        "Evidence: {} written, {} failed",
        stats.written,
        stats.failed
    );
    Ok(())
}
