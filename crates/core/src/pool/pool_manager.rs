use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, Mutex};

use crate::client::session_table::SessionTable;
use crate::detection::domain::model_factory::ModelFactory;
use crate::evidence::infrastructure::evidence_writer::EvidenceSender;
use crate::pipeline::pipeline_logger::LogPipelineLogger;
use crate::pipeline::worker::{PipelineWorker, WorkerConfig, WorkerExit, WorkerId};
use crate::pool::domain::gpu_probe::{select_device, GpuProbe};
use crate::state::domain::shared_state::SharedState;
use crate::state::domain::shared_state_store::StateError;

/// Cycles between worker timing reports at debug level.
const WORKER_LOG_THROTTLE: usize = 100;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error("failed to load models on {target}: {message}")]
    ModelLoad { target: String, message: String },
    #[error("failed to start worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

#[derive(Clone, Debug, PartialEq)]
pub struct PoolConfig {
    pub max_pool_size: usize,
    pub worker: WorkerConfig,
    pub gpu_memory_threshold: f64,
    pub assign_interval: Duration,
    pub unassign_interval: Duration,
    pub grace_period: Duration,
}

impl PoolConfig {
    /// Most clients the pool can ever hold.
    ///
    /// Saturates; `ServerConfig::validate` rejects products that overflow.
    pub fn ceiling(&self) -> usize {
        self.max_pool_size.saturating_mul(self.worker.capacity)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: 5,
            worker: WorkerConfig::default(),
            gpu_memory_threshold: 0.9,
            assign_interval: Duration::from_secs(1),
            unassign_interval: Duration::from_millis(100),
            grace_period: Duration::from_secs(5),
        }
    }
}

/// Outcome of one assignment pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AssignReport {
    pub assigned: Vec<String>,
    pub rejected: Vec<String>,
    pub pending: Vec<String>,
    pub workers_created: usize,
    pub system_full: bool,
    pub gpu_full: bool,
}

struct WorkerSlot {
    worker: PipelineWorker,
    device: usize,
}

#[derive(Default)]
struct PoolState {
    workers: BTreeMap<WorkerId, WorkerSlot>,
    assignments: HashMap<String, WorkerId>,
    next_id: WorkerId,
}

/// Scales the worker pool and keeps clients assigned to it.
///
/// Two reconciliation passes share the pool lock: assignment places
/// active clients on workers (creating workers while GPUs have headroom),
/// unassignment drops departed clients and tears down empty or dead workers.
pub struct PoolManager {
    config: PoolConfig,
    state: Mutex<PoolState>,
    shared: SharedState,
    sessions: SessionTable,
    factory: Arc<dyn ModelFactory>,
    gpu: Arc<dyn GpuProbe>,
    evidence: EvidenceSender,
}

impl PoolManager {
    pub fn new(
        config: PoolConfig,
        shared: SharedState,
        sessions: SessionTable,
        factory: Arc<dyn ModelFactory>,
        gpu: Arc<dyn GpuProbe>,
        evidence: EvidenceSender,
    ) -> Self {
        Self {
            config,
            state: Mutex::new(PoolState::default()),
            shared,
            sessions,
            factory,
            gpu,
            evidence,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Runs both reconciliation loops until `shutdown` flips to `true`,
    /// then stops every worker.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let assign = {
            let pool = self.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(pool.config.assign_interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = pool.assign_pass().await {
                                log::warn!("Assignment pass failed: {e}");
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            })
        };
        let unassign = {
            let pool = self.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(pool.config.unassign_interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = pool.unassign_pass().await {
                                log::warn!("Unassignment pass failed: {e}");
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            })
        };

        let _ = tokio::join!(assign, unassign);
        self.shutdown().await;
    }

    /// Places unassigned active clients on workers.
    pub async fn assign_pass(&self) -> Result<AssignReport, PoolError> {
        let snapshot = self.shared.snapshot().await?;
        let active: BTreeSet<String> = snapshot
            .schedulable()
            .into_iter()
            .filter(|u| self.sessions.contains(u))
            .collect();

        let mut state = self.state.lock().await;
        clear_stale_assignments(&mut state);

        let ceiling = self.config.ceiling();
        let mut report = AssignReport {
            system_full: active.len() >= ceiling,
            ..Default::default()
        };
        if report.system_full != snapshot.system_full {
            log::info!(
                "System full: {} ({} active, ceiling {ceiling})",
                report.system_full,
                active.len()
            );
        }
        self.shared.set_system_full(report.system_full).await?;

        // Departed clients still held by a worker until the next
        // unassignment pass do not take up room.
        let held = state
            .assignments
            .keys()
            .filter(|u| active.contains(*u))
            .count();
        let room = ceiling.saturating_sub(held);
        let unassigned: Vec<&String> = active
            .iter()
            .filter(|u| !state.assignments.contains_key(*u))
            .collect();
        let (to_assign, excess) = unassigned.split_at(room.min(unassigned.len()));

        for username in excess {
            log::warn!("Pool at capacity; closing {username}");
            self.shared.request_close(username).await?;
            report.rejected.push((*username).clone());
        }

        for (i, username) in to_assign.iter().enumerate() {
            let Some(session) = self.sessions.get(username) else {
                continue;
            };

            let mut placed = state
                .workers
                .iter()
                .filter(|(_, slot)| slot.worker.has_capacity())
                .find_map(|(id, slot)| slot.worker.try_assign(session.clone()).then_some(*id));

            if placed.is_none() && state.workers.len() < self.config.max_pool_size {
                match self.create_worker(&mut state).await {
                    Ok(Some(id)) => {
                        report.workers_created += 1;
                        placed = state
                            .workers
                            .get(&id)
                            .and_then(|slot| slot.worker.try_assign(session.clone()).then_some(id));
                    }
                    Ok(None) => report.gpu_full = true,
                    Err(e) => log::error!("Could not create worker: {e}"),
                }
            }

            match placed {
                Some(id) => {
                    log::info!("Assigned {username} to worker {id}");
                    state.assignments.insert((*username).clone(), id);
                    report.assigned.push((*username).clone());
                }
                None => {
                    report
                        .pending
                        .extend(to_assign[i..].iter().map(|u| (*u).clone()));
                    break;
                }
            }
        }

        if report.gpu_full != snapshot.gpu_full {
            log::info!("GPU full: {}", report.gpu_full);
        }
        self.shared.set_gpu_full(report.gpu_full).await?;
        Ok(report)
    }

    /// Drops departed clients and tears down dead or empty workers.
    pub async fn unassign_pass(&self) -> Result<(), PoolError> {
        let snapshot = self.shared.snapshot().await?;
        let live = snapshot.schedulable();

        let mut retired = Vec::new();
        {
            let mut state = self.state.lock().await;
            let PoolState {
                workers,
                assignments,
                ..
            } = &mut *state;

            let dead: Vec<WorkerId> = workers
                .iter()
                .filter(|(_, slot)| slot.worker.has_exited())
                .map(|(id, _)| *id)
                .collect();
            for id in dead {
                if let Some(slot) = workers.remove(&id) {
                    let orphaned = assignments.iter().filter(|(_, w)| **w == id).count();
                    log::warn!("Worker {id} exited; rescheduling {orphaned} clients");
                    assignments.retain(|_, w| *w != id);
                    retired.push(slot);
                }
            }

            for (id, slot) in workers.iter() {
                for username in slot.worker.client_ids() {
                    let still_here = live.contains(&username)
                        && self
                            .sessions
                            .get(&username)
                            .is_some_and(|s| !s.is_closed() && s.assigned_worker() == Some(*id));
                    if !still_here && slot.worker.unassign(&username) {
                        log::info!("Unassigned {username} from worker {id}");
                        assignments.remove(&username);
                    }
                }
            }

            let empty: Vec<WorkerId> = workers
                .iter()
                .filter(|(_, slot)| slot.worker.is_empty())
                .map(|(id, _)| *id)
                .collect();
            for id in empty {
                if let Some(slot) = workers.remove(&id) {
                    slot.worker.request_stop();
                    retired.push(slot);
                }
            }
        }

        for slot in retired {
            self.retire(slot).await;
        }
        Ok(())
    }

    /// Stops and joins every worker.
    pub async fn shutdown(&self) {
        let slots: Vec<WorkerSlot> = {
            let mut state = self.state.lock().await;
            state.assignments.clear();
            std::mem::take(&mut state.workers).into_values().collect()
        };
        for slot in &slots {
            slot.worker.request_stop();
        }
        for slot in slots {
            self.retire(slot).await;
        }
    }

    pub async fn worker_count(&self) -> usize {
        self.state.lock().await.workers.len()
    }

    pub async fn assignment(&self, username: &str) -> Option<WorkerId> {
        self.state.lock().await.assignments.get(username).copied()
    }

    pub async fn worker_clients(&self) -> BTreeMap<WorkerId, Vec<String>> {
        self.state
            .lock()
            .await
            .workers
            .iter()
            .map(|(id, slot)| (*id, slot.worker.client_ids()))
            .collect()
    }

    /// Places a new worker on the first device with headroom.
    ///
    /// Returns `Ok(None)` when no device qualifies.
    async fn create_worker(&self, state: &mut PoolState) -> Result<Option<WorkerId>, PoolError> {
        let gpu = self.gpu.clone();
        let devices = match tokio::task::spawn_blocking(move || gpu.snapshot()).await {
            Ok(Ok(devices)) => devices,
            Ok(Err(e)) => {
                log::warn!("GPU probe failed: {e}");
                return Ok(None);
            }
            Err(e) => {
                log::warn!("GPU probe task failed: {e}");
                return Ok(None);
            }
        };
        let Some(device) = select_device(&devices, self.config.gpu_memory_threshold) else {
            return Ok(None);
        };

        self.gpu.claim(device);
        let target = self.gpu.target(device);
        let factory = self.factory.clone();
        let built = tokio::task::spawn_blocking(move || factory.build(target))
            .await
            .map_err(|e| e.to_string())
            .and_then(|r| r.map_err(|e| e.to_string()));
        let models = match built {
            Ok(models) => models,
            Err(message) => {
                self.gpu.release(device);
                return Err(PoolError::ModelLoad {
                    target: target.to_string(),
                    message,
                });
            }
        };

        let id = state.next_id;
        state.next_id += 1;
        let worker = PipelineWorker::spawn(
            id,
            target,
            self.config.worker.clone(),
            models,
            self.evidence.clone(),
            Box::new(LogPipelineLogger::new(
                format!("worker-{id}"),
                WORKER_LOG_THROTTLE,
            )),
        )
        .map_err(|e| {
            self.gpu.release(device);
            PoolError::Spawn(e)
        })?;
        state.workers.insert(id, WorkerSlot { worker, device });
        Ok(Some(id))
    }

    async fn retire(&self, slot: WorkerSlot) {
        let WorkerSlot { worker, device } = slot;
        let id = worker.id();
        let grace = self.config.grace_period;
        let exit = tokio::task::spawn_blocking(move || worker.join(grace)).await;
        self.gpu.release(device);
        match exit {
            Ok(WorkerExit::Stopped) => log::info!("Worker {id} torn down"),
            Ok(WorkerExit::Crashed(reason)) => log::error!("Worker {id} crashed: {reason}"),
            Err(e) => log::error!("Worker {id} join failed: {e}"),
        }
    }
}

/// Keeps only assignments that point at a live worker still holding the
/// client, so a client can never be counted against two workers.
fn clear_stale_assignments(state: &mut PoolState) {
    let PoolState {
        workers,
        assignments,
        ..
    } = state;
    assignments.retain(|username, id| {
        workers.get(id).is_some_and(|slot| {
            !slot.worker.has_exited() && slot.worker.client_ids().iter().any(|c| c == username)
        })
    });
}
