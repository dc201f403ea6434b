//! Singleton-enforcing worker registry and task assignment.
//!
//! At most one worker per kind (`ml_manager`, `trading_engine`, …) may be
//! alive at a time; registration of a second is refused while the first
//! holds a fresh heartbeat. Tasks are opaque ids owned by exactly one live
//! worker. One lock guards the whole registry — every operation is short.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Running,
    Stopping,
    Error,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Stopping => "stopping",
            WorkerState::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub id: String,
    pub kind: String,
    pub process_id: u32,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub state: WorkerState,
    pub tasks: HashSet<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Per-worker view inside [`WorkerStats`].
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSummary {
    pub id: String,
    pub kind: String,
    pub process_id: u32,
    pub state: &'static str,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub active_tasks: usize,
    pub tasks: Vec<String>,
    pub uptime_seconds: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub total_workers: usize,
    pub workers_by_kind: HashMap<String, usize>,
    pub workers_by_state: HashMap<&'static str, usize>,
    pub active_tasks: usize,
    pub workers: Vec<WorkerSummary>,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Heartbeat age beyond which a worker stops counting as alive.
    pub heartbeat_timeout: Duration,
    /// Dead-worker sweep cadence.
    pub cleanup_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(120),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Default)]
struct Registry {
    workers: HashMap<String, WorkerInfo>,
    /// task id → owning worker id.
    assignments: HashMap<String, String>,
}

impl Registry {
    fn release_tasks_of(&mut self, worker_id: &str) -> Vec<String> {
        let freed: Vec<String> = self
            .assignments
            .iter()
            .filter(|(_, owner)| owner.as_str() == worker_id)
            .map(|(task, _)| task.clone())
            .collect();
        for task in &freed {
            self.assignments.remove(task);
        }
        freed
    }
}

pub struct WorkerCoordinator {
    config: CoordinatorConfig,
    registry: Mutex<Registry>,
    system: Mutex<System>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            registry: Mutex::new(Registry::default()),
            system: Mutex::new(System::new()),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn is_alive(&self, worker: &WorkerInfo, now: DateTime<Utc>) -> bool {
        matches!(worker.state, WorkerState::Starting | WorkerState::Running)
            && (now - worker.last_heartbeat).to_std().unwrap_or_default()
                < self.config.heartbeat_timeout
    }

    fn pid_exists(&self, pid: u32) -> bool {
        let mut system = self.system.lock();
        let pid = Pid::from_u32(pid);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            ProcessRefreshKind::new(),
        );
        system.process(pid).is_some()
    }

    /// Register a worker of `kind`. `None` when a worker of that kind is
    /// already alive, or when the caller-supplied id is taken. The check
    /// and the insert happen under one lock.
    pub fn register(
        &self,
        kind: &str,
        id: Option<String>,
        metadata: Option<serde_json::Value>,
    ) -> Option<String> {
        let mut registry = self.registry.lock();
        let now = Utc::now();

        let occupied: Vec<&str> = registry
            .workers
            .values()
            .filter(|w| w.kind == kind && self.is_alive(w, now))
            .map(|w| w.id.as_str())
            .collect();
        if !occupied.is_empty() {
            warn!(kind, alive = ?occupied, "worker kind already occupied");
            return None;
        }

        let pid = std::process::id();
        let id = id.unwrap_or_else(|| format!("{kind}_{}_{pid}", now.timestamp()));
        if registry.workers.contains_key(&id) {
            error!(id, "worker id already registered");
            return None;
        }

        registry.workers.insert(
            id.clone(),
            WorkerInfo {
                id: id.clone(),
                kind: kind.to_string(),
                process_id: pid,
                started_at: now,
                last_heartbeat: now,
                state: WorkerState::Starting,
                tasks: HashSet::new(),
                metadata,
            },
        );

        info!(id, kind, pid, "worker registered");
        Some(id)
    }

    /// Remove a worker and free every task it owned.
    pub fn unregister(&self, worker_id: &str) {
        let mut registry = self.registry.lock();
        if registry.workers.remove(worker_id).is_none() {
            warn!(id = worker_id, "unregister of unknown worker");
            return;
        }
        let freed = registry.release_tasks_of(worker_id);
        info!(id = worker_id, freed_tasks = freed.len(), "worker unregistered");
        if !freed.is_empty() {
            debug!(id = worker_id, tasks = ?freed, "tasks freed for reassignment");
        }
    }

    /// Refresh a worker's heartbeat and optionally its state, task set, and
    /// metadata. False when the worker is unknown.
    pub fn heartbeat(
        &self,
        worker_id: &str,
        state: Option<WorkerState>,
        active_tasks: Option<usize>,
        tasks: Option<HashSet<String>>,
        metadata: Option<serde_json::Value>,
    ) -> bool {
        let mut registry = self.registry.lock();
        let Some(worker) = registry.workers.get_mut(worker_id) else {
            warn!(id = worker_id, "heartbeat from unregistered worker");
            return false;
        };

        worker.last_heartbeat = Utc::now();
        if let Some(state) = state {
            worker.state = state;
        }
        if let Some(tasks) = tasks {
            worker.tasks = tasks;
        }
        if let Some(meta) = metadata {
            match (&mut worker.metadata, meta) {
                (Some(serde_json::Value::Object(existing)), serde_json::Value::Object(new)) => {
                    existing.extend(new);
                }
                (slot, meta) => *slot = Some(meta),
            }
        }
        if let Some(count) = active_tasks {
            let entry = worker
                .metadata
                .get_or_insert_with(|| serde_json::json!({}));
            if let Some(obj) = entry.as_object_mut() {
                obj.insert("active_tasks".into(), count.into());
            }
        }
        true
    }

    /// Whether `task_id` could be assigned to a worker of `kind` right now.
    /// Frees assignments whose owner no longer exists.
    pub fn can_assign_task(&self, task_id: &str, kind: &str) -> bool {
        let mut registry = self.registry.lock();
        self.can_assign_locked(&mut registry, task_id, kind)
    }

    fn can_assign_locked(&self, registry: &mut Registry, task_id: &str, kind: &str) -> bool {
        if let Some(owner) = registry.assignments.get(task_id).cloned() {
            if registry.workers.contains_key(&owner) {
                debug!(task_id, owner, "task already assigned");
                return false;
            }
            // Owner died without unregistering; free the task.
            registry.assignments.remove(task_id);
        }

        let now = Utc::now();
        registry
            .workers
            .values()
            .any(|w| w.kind == kind && self.is_alive(w, now))
    }

    /// Assign a task to the least-loaded live worker of `kind`.
    ///
    /// Ties break on worker id, so identical registry states make identical
    /// choices.
    pub fn assign_task(&self, task_id: &str, kind: &str) -> Option<String> {
        let mut registry = self.registry.lock();
        if !self.can_assign_locked(&mut registry, task_id, kind) {
            return None;
        }

        let now = Utc::now();
        let best = registry
            .workers
            .values()
            .filter(|w| w.kind == kind && self.is_alive(w, now))
            .min_by(|a, b| {
                (a.tasks.len(), a.id.as_str()).cmp(&(b.tasks.len(), b.id.as_str()))
            })?
            .id
            .clone();

        registry
            .assignments
            .insert(task_id.to_string(), best.clone());
        if let Some(worker) = registry.workers.get_mut(&best) {
            worker.tasks.insert(task_id.to_string());
        }

        info!(task_id, worker = %best, "task assigned");
        Some(best)
    }

    /// Mark a task complete. False when the task is unknown or owned by a
    /// different worker (logged, never a crash).
    pub fn complete_task(&self, task_id: &str, worker_id: &str) -> bool {
        let mut registry = self.registry.lock();
        match registry.assignments.get(task_id) {
            Some(owner) if owner == worker_id => {
                registry.assignments.remove(task_id);
                if let Some(worker) = registry.workers.get_mut(worker_id) {
                    worker.tasks.remove(task_id);
                } else {
                    error!(
                        task_id,
                        worker_id, "task completion from a worker missing in the registry"
                    );
                }
                info!(task_id, worker = worker_id, "task completed");
                true
            }
            Some(owner) => {
                warn!(
                    task_id,
                    claimed_by = worker_id,
                    owner = %owner,
                    "task completion by non-owner refused"
                );
                false
            }
            None => {
                warn!(task_id, worker = worker_id, "completion of unassigned task");
                false
            }
        }
    }

    pub fn worker_stats(&self) -> WorkerStats {
        let registry = self.registry.lock();
        let now = Utc::now();

        let mut by_kind: HashMap<String, usize> = HashMap::new();
        let mut by_state: HashMap<&'static str, usize> = HashMap::new();
        let mut workers: Vec<WorkerSummary> = Vec::with_capacity(registry.workers.len());

        for worker in registry.workers.values() {
            *by_kind.entry(worker.kind.clone()).or_default() += 1;
            *by_state.entry(worker.state.as_str()).or_default() += 1;
            let mut tasks: Vec<String> = worker.tasks.iter().cloned().collect();
            tasks.sort_unstable();
            workers.push(WorkerSummary {
                id: worker.id.clone(),
                kind: worker.kind.clone(),
                process_id: worker.process_id,
                state: worker.state.as_str(),
                started_at: worker.started_at,
                last_heartbeat: worker.last_heartbeat,
                active_tasks: worker.tasks.len(),
                tasks,
                uptime_seconds: (now - worker.started_at)
                    .to_std()
                    .unwrap_or_default()
                    .as_secs_f64(),
            });
        }
        workers.sort_by(|a, b| a.id.cmp(&b.id));

        WorkerStats {
            total_workers: registry.workers.len(),
            workers_by_kind: by_kind,
            workers_by_state: by_state,
            active_tasks: registry.assignments.len(),
            workers,
        }
    }

    /// Unregister workers whose heartbeat went stale or whose process is
    /// gone. Their tasks become assignable again.
    pub fn sweep_dead_workers(&self) -> usize {
        let stale: Vec<(String, &'static str)> = {
            let registry = self.registry.lock();
            let now = Utc::now();
            registry
                .workers
                .values()
                .filter_map(|w| {
                    let heartbeat_age =
                        (now - w.last_heartbeat).to_std().unwrap_or_default();
                    if heartbeat_age >= self.config.heartbeat_timeout {
                        Some((w.id.clone(), "heartbeat timeout"))
                    } else if !self.pid_exists(w.process_id) {
                        Some((w.id.clone(), "process gone"))
                    } else {
                        None
                    }
                })
                .collect()
        };

        for (id, reason) in &stale {
            warn!(id, reason, "removing dead worker");
            self.unregister(id);
        }
        stale.len()
    }

    /// Run an initial dead-process sweep and launch the periodic one.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            warn!("worker coordinator already started");
            return;
        }

        self.sweep_dead_workers();

        let coordinator = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let interval = self.config.cleanup_interval;
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        coordinator.sweep_dead_workers();
                    }
                }
            }
        }));
        info!("worker coordinator started");
    }

    /// Stop the sweep loop and unregister everything. Idempotent.
    pub async fn stop(&self) {
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        if handles.is_empty() {
            warn!("worker coordinator already stopped");
            return;
        }
        let _ = self.shutdown.send(true);
        for handle in handles {
            let _ = handle.await;
        }

        let ids: Vec<String> = self.registry.lock().workers.keys().cloned().collect();
        for id in ids {
            self.unregister(&id);
        }
        info!("worker coordinator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> WorkerCoordinator {
        WorkerCoordinator::new(CoordinatorConfig::default())
    }

    #[test]
    fn second_registration_of_a_kind_is_refused() {
        let c = coordinator();
        let w1 = c.register("ml_manager", None, None).expect("first register");
        assert!(c.register("ml_manager", None, None).is_none());

        c.unregister(&w1);
        let w2 = c.register("ml_manager", None, None).expect("re-register");
        assert_ne!(w1, w2);
    }

    #[test]
    fn different_kinds_coexist() {
        let c = coordinator();
        assert!(c.register("ml_manager", None, None).is_some());
        assert!(c.register("trading_engine", None, None).is_some());
    }

    #[test]
    fn caller_supplied_ids_must_be_unique() {
        let c = coordinator();
        assert!(c.register("a", Some("w".into()), None).is_some());
        assert!(c.register("b", Some("w".into()), None).is_none());
    }

    #[test]
    fn stale_heartbeat_frees_the_kind() {
        let c = WorkerCoordinator::new(CoordinatorConfig {
            heartbeat_timeout: Duration::ZERO,
            ..Default::default()
        });
        let w1 = c.register("ml_manager", None, None).unwrap();
        // With a zero timeout the first worker is immediately not-alive, so
        // the singleton slot is open again (ids differ since one exists).
        let w2 = c.register("ml_manager", Some("replacement".into()), None);
        assert!(w2.is_some());
        assert_ne!(w1, w2.unwrap());
    }

    #[test]
    fn heartbeat_updates_state_and_metadata() {
        let c = coordinator();
        let id = c.register("engine", None, None).unwrap();

        assert!(c.heartbeat(
            &id,
            Some(WorkerState::Running),
            Some(3),
            None,
            Some(serde_json::json!({"shard": 2})),
        ));
        assert!(!c.heartbeat("ghost", None, None, None, None));

        let stats = c.worker_stats();
        assert_eq!(stats.workers_by_state["running"], 1);
    }

    #[test]
    fn task_assignment_and_completion_round_trip() {
        let c = coordinator();
        let worker = c.register("engine", None, None).unwrap();

        assert!(c.can_assign_task("t1", "engine"));
        let assigned = c.assign_task("t1", "engine").unwrap();
        assert_eq!(assigned, worker);

        // A task is owned by at most one worker at a time.
        assert!(!c.can_assign_task("t1", "engine"));
        assert!(c.assign_task("t1", "engine").is_none());

        assert!(!c.complete_task("t1", "someone_else"));
        assert!(c.complete_task("t1", &worker));
        assert!(!c.complete_task("t1", &worker));

        // Released tasks are assignable again.
        assert!(c.assign_task("t1", "engine").is_some());
    }

    #[test]
    fn no_live_worker_means_no_assignment() {
        let c = coordinator();
        assert!(!c.can_assign_task("t1", "engine"));
        assert!(c.assign_task("t1", "engine").is_none());
    }

    #[test]
    fn unregister_frees_owned_tasks() {
        let c = coordinator();
        let worker = c.register("engine", None, None).unwrap();
        c.assign_task("t1", "engine").unwrap();
        c.assign_task("t2", "engine").unwrap();

        c.unregister(&worker);
        let stats = c.worker_stats();
        assert_eq!(stats.total_workers, 0);
        assert_eq!(stats.active_tasks, 0);
    }

    #[test]
    fn sweep_removes_stale_workers_and_their_tasks() {
        let c = WorkerCoordinator::new(CoordinatorConfig {
            heartbeat_timeout: Duration::ZERO,
            ..Default::default()
        });
        c.register("engine", Some("w1".into()), None).unwrap();

        assert_eq!(c.sweep_dead_workers(), 1);
        let stats = c.worker_stats();
        assert_eq!(stats.total_workers, 0);
    }

    #[test]
    fn stats_aggregate_by_kind_and_state() {
        let c = coordinator();
        c.register("engine", Some("w1".into()), None).unwrap();
        c.register("ml_manager", Some("w2".into()), None).unwrap();
        c.heartbeat("w2", Some(WorkerState::Running), None, None, None);
        c.assign_task("t1", "engine").unwrap();

        let stats = c.worker_stats();
        assert_eq!(stats.total_workers, 2);
        assert_eq!(stats.workers_by_kind["engine"], 1);
        assert_eq!(stats.workers_by_state["starting"], 1);
        assert_eq!(stats.workers_by_state["running"], 1);
        assert_eq!(stats.active_tasks, 1);
        assert_eq!(stats.workers[0].id, "w1");
    }
}
