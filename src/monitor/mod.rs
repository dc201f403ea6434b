//! Process and component monitoring.
//!
//! Components report heartbeats, errors, and warnings; the monitor samples
//! host metrics, evaluates alert rules, and keeps a bounded history of
//! both. It is observability only — nothing here sits on the critical path
//! of an admission decision, and its failure degrades visibility, not
//! trading correctness.

mod rules;
mod system;

pub use rules::{builtin_rules, AlertRule, AlertSeverity, RuleKind};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sqlx::postgres::PgPool;
use sqlx::Row;
use sysinfo::System;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::kv::KvStore;

/// Ring-buffer cap on retained metric samples.
const METRICS_CAP: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
            HealthStatus::Unknown => "unknown",
        }
    }
}

/// Health record for one registered component.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub error_count: u64,
    pub warning_count: u64,
    pub uptime_seconds: f64,
    pub memory_usage_mb: f64,
    pub cpu_usage_percent: f64,
    pub active_tasks: usize,
    pub last_error: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl ComponentHealth {
    pub fn new(name: &str, metadata: Option<serde_json::Value>) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            status: HealthStatus::Unknown,
            registered_at: now,
            last_heartbeat: now,
            error_count: 0,
            warning_count: 0,
            uptime_seconds: 0.0,
            memory_usage_mb: 0.0,
            cpu_usage_percent: 0.0,
            active_tasks: 0,
            last_error: None,
            metadata,
        }
    }
}

/// One time-stamped host sample.
#[derive(Debug, Clone, Serialize)]
pub struct SystemMetricsSample {
    pub timestamp: DateTime<Utc>,
    pub total_memory_mb: f64,
    pub used_memory_mb: f64,
    pub memory_percent: f64,
    pub cpu_percent: f64,
    pub disk_usage_percent: f64,
    pub active_connections: usize,
    pub kv_connections: u64,
    pub sql_connections: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStats {
    pub monitoring_started: DateTime<Utc>,
    pub uptime_seconds: f64,
    pub total_components: usize,
    pub healthy_components: usize,
    pub warning_components: usize,
    pub critical_components: usize,
    pub total_heartbeats: u64,
    pub total_alerts: u64,
    pub system_checks: u64,
    pub active_alerts: usize,
    pub metrics_collected: usize,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Metrics sampling cadence.
    pub monitoring_interval: Duration,
    /// Heartbeat age that flips a component to critical.
    pub heartbeat_timeout: Duration,
    /// Preferred mount for disk sampling.
    pub disk_path: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            monitoring_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(300),
            disk_path: "/".into(),
        }
    }
}

#[derive(Default)]
struct MonitorState {
    components: HashMap<String, ComponentHealth>,
    metrics: VecDeque<SystemMetricsSample>,
    active_alerts: HashMap<String, Alert>,
    /// Fire times, kept after clearing for cooldown suppression.
    last_fired: HashMap<String, DateTime<Utc>>,
    total_heartbeats: u64,
    total_alerts: u64,
    system_checks: u64,
}

pub struct ProcessMonitor {
    config: MonitorConfig,
    rules: Vec<AlertRule>,
    state: Mutex<MonitorState>,
    system: Mutex<System>,
    kv: Option<KvStore>,
    pool: Option<PgPool>,
    started_at: DateTime<Utc>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessMonitor {
    pub fn new(config: MonitorConfig, pool: Option<PgPool>, kv: Option<KvStore>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            rules: builtin_rules(),
            state: Mutex::new(MonitorState::default()),
            system: Mutex::new(System::new()),
            kv,
            pool,
            started_at: Utc::now(),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Register a component. False when the name is already present.
    pub fn register_component(&self, name: &str, metadata: Option<serde_json::Value>) -> bool {
        let mut state = self.state.lock();
        if state.components.contains_key(name) {
            warn!(name, "component already registered");
            return false;
        }
        state
            .components
            .insert(name.to_string(), ComponentHealth::new(name, metadata));
        info!(name, "component registered for monitoring");
        true
    }

    /// Record a component heartbeat. Unknown components are registered on
    /// the fly. An explicit `status` overrides; otherwise `unknown`
    /// promotes to `healthy`.
    pub async fn heartbeat(
        &self,
        name: &str,
        status: Option<HealthStatus>,
        active_tasks: Option<usize>,
        metadata: Option<serde_json::Value>,
    ) -> bool {
        let (memory_mb, cpu_pct) = system::process_usage(&mut self.system.lock());

        let snapshot = {
            let mut state = self.state.lock();
            if !state.components.contains_key(name) {
                state
                    .components
                    .insert(name.to_string(), ComponentHealth::new(name, None));
                info!(name, "component auto-registered on first heartbeat");
            }
            state.total_heartbeats += 1;

            let component = state.components.get_mut(name).expect("just inserted");
            component.last_heartbeat = Utc::now();
            match status {
                Some(status) => component.status = status,
                None if component.status == HealthStatus::Unknown => {
                    component.status = HealthStatus::Healthy;
                }
                None => {}
            }
            if let Some(tasks) = active_tasks {
                component.active_tasks = tasks;
            }
            if let Some(meta) = metadata {
                match (&mut component.metadata, meta) {
                    (Some(serde_json::Value::Object(existing)), serde_json::Value::Object(new)) => {
                        existing.extend(new);
                    }
                    (slot, meta) => *slot = Some(meta),
                }
            }
            component.memory_usage_mb = memory_mb;
            component.cpu_usage_percent = cpu_pct;
            component.clone()
        };

        self.mirror_component(&snapshot).await;
        true
    }

    /// Record an error against a component; critical errors flip it to
    /// `critical` immediately and raise an `error_{name}` alert.
    pub async fn report_error(&self, name: &str, message: &str, critical: bool) {
        {
            let mut state = self.state.lock();
            if !state.components.contains_key(name) {
                state
                    .components
                    .insert(name.to_string(), ComponentHealth::new(name, None));
            }
            let component = state.components.get_mut(name).expect("just inserted");
            component.error_count += 1;
            component.last_error = Some(message.to_string());
            if critical {
                component.status = HealthStatus::Critical;
            } else if component.status == HealthStatus::Healthy {
                component.status = HealthStatus::Warning;
            }
        }
        warn!(component = name, message, critical, "component error reported");

        let severity = if critical {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Warning
        };
        self.fire_alert(
            &format!("error_{name}"),
            severity,
            &format!("error in component {name}: {message}"),
            Duration::ZERO,
        )
        .await;
    }

    /// Record a warning against a component.
    pub fn report_warning(&self, name: &str, message: &str) {
        let mut state = self.state.lock();
        if !state.components.contains_key(name) {
            state
                .components
                .insert(name.to_string(), ComponentHealth::new(name, None));
        }
        let component = state.components.get_mut(name).expect("just inserted");
        component.warning_count += 1;
        if component.status == HealthStatus::Healthy {
            component.status = HealthStatus::Warning;
        }
        info!(component = name, message, "component warning reported");
    }

    /// Health of one component, or of all of them.
    pub fn component_health(&self, name: Option<&str>) -> HashMap<String, ComponentHealth> {
        let state = self.state.lock();
        match name {
            Some(name) => state
                .components
                .get(name)
                .map(|c| HashMap::from([(c.name.clone(), c.clone())]))
                .unwrap_or_default(),
            None => state.components.clone(),
        }
    }

    /// Samples from the trailing `minutes` minutes, oldest first.
    pub fn system_metrics(&self, minutes: i64) -> Vec<SystemMetricsSample> {
        let cutoff = Utc::now() - chrono::Duration::minutes(minutes);
        self.state
            .lock()
            .metrics
            .iter()
            .filter(|m| m.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    /// Currently firing alerts (there is no durable alert history beyond
    /// the KV mirror).
    pub fn alerts(&self, _active_only: bool) -> Vec<Alert> {
        let state = self.state.lock();
        let mut alerts: Vec<Alert> = state.active_alerts.values().cloned().collect();
        alerts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        alerts
    }

    pub fn stats(&self) -> MonitorStats {
        let state = self.state.lock();
        let count = |status: HealthStatus| {
            state
                .components
                .values()
                .filter(|c| c.status == status)
                .count()
        };
        MonitorStats {
            monitoring_started: self.started_at,
            uptime_seconds: (Utc::now() - self.started_at)
                .to_std()
                .unwrap_or_default()
                .as_secs_f64(),
            total_components: state.components.len(),
            healthy_components: count(HealthStatus::Healthy),
            warning_components: count(HealthStatus::Warning),
            critical_components: count(HealthStatus::Critical),
            total_heartbeats: state.total_heartbeats,
            total_alerts: state.total_alerts,
            system_checks: state.system_checks,
            active_alerts: state.active_alerts.len(),
            metrics_collected: state.metrics.len(),
        }
    }

    /// Raise an alert unless it is already firing or inside its cooldown.
    async fn fire_alert(&self, id: &str, severity: AlertSeverity, message: &str, cooldown: Duration) {
        let alert = {
            let mut state = self.state.lock();
            if state.active_alerts.contains_key(id) {
                return;
            }
            let now = Utc::now();
            if let Some(last) = state.last_fired.get(id) {
                let since = (now - *last).to_std().unwrap_or_default();
                if since < cooldown {
                    debug!(id, "alert suppressed by cooldown");
                    return;
                }
            }

            let alert = Alert {
                id: id.to_string(),
                severity,
                message: message.to_string(),
                created_at: now,
            };
            state.active_alerts.insert(id.to_string(), alert.clone());
            state.last_fired.insert(id.to_string(), now);
            state.total_alerts += 1;
            alert
        };

        match severity {
            AlertSeverity::Critical => error!(id, message, "ALERT"),
            AlertSeverity::Warning => warn!(id, message, "ALERT"),
            AlertSeverity::Info => info!(id, message, "ALERT"),
        }

        if let Some(kv) = &self.kv {
            let payload = serde_json::to_string(&alert).unwrap_or_default();
            kv.set_ex(&format!("alert:{id}"), &payload, 3600).await;
        }
    }

    async fn clear_alert(&self, id: &str) {
        let removed = self.state.lock().active_alerts.remove(id).is_some();
        if removed {
            info!(id, "alert cleared");
            if let Some(kv) = &self.kv {
                kv.del(&format!("alert:{id}")).await;
            }
        }
    }

    /// One pass of the metrics loop.
    async fn collect_system_metrics(&self) {
        let host = system::sample_host(&mut self.system.lock(), &self.config.disk_path);
        let active_connections = system::connection_count();

        let kv_connections = match &self.kv {
            Some(kv) => kv.connected_clients().await.unwrap_or(0),
            None => 0,
        };

        let sql_connections = match &self.pool {
            Some(pool) => sqlx::query("SELECT count(*) AS connections FROM pg_stat_activity")
                .fetch_one(pool)
                .await
                .ok()
                .and_then(|row| row.try_get::<i64, _>("connections").ok())
                .unwrap_or(0) as u64,
            None => 0,
        };

        let sample = SystemMetricsSample {
            timestamp: Utc::now(),
            total_memory_mb: host.total_memory_mb,
            used_memory_mb: host.used_memory_mb,
            memory_percent: host.memory_percent,
            cpu_percent: host.cpu_percent,
            disk_usage_percent: host.disk_usage_percent,
            active_connections,
            kv_connections,
            sql_connections,
        };

        if let Some(kv) = &self.kv {
            let key = format!("metrics:{}", sample.timestamp.timestamp());
            let payload = serde_json::to_string(&sample).unwrap_or_default();
            kv.set_ex(&key, &payload, 3600).await;
        }

        self.record_sample(sample);
    }

    fn record_sample(&self, sample: SystemMetricsSample) {
        let mut state = self.state.lock();
        state.metrics.push_back(sample);
        while state.metrics.len() > METRICS_CAP {
            state.metrics.pop_front();
        }
        state.system_checks += 1;
    }

    /// One pass of the health loop: advance uptimes and flip components
    /// with stale heartbeats to critical.
    async fn check_component_health(&self) {
        let now = Utc::now();
        let mut timed_out: Vec<String> = Vec::new();
        {
            let mut state = self.state.lock();
            for component in state.components.values_mut() {
                component.uptime_seconds = (now - component.registered_at)
                    .to_std()
                    .unwrap_or_default()
                    .as_secs_f64();

                let heartbeat_age = (now - component.last_heartbeat)
                    .to_std()
                    .unwrap_or_default();
                if heartbeat_age > self.config.heartbeat_timeout
                    && component.status != HealthStatus::Critical
                {
                    component.status = HealthStatus::Critical;
                    timed_out.push(component.name.clone());
                }
            }
        }

        for name in timed_out {
            self.fire_alert(
                &format!("heartbeat_timeout_{name}"),
                AlertSeverity::Critical,
                &format!(
                    "component {name} has not sent a heartbeat for more than {:?}",
                    self.config.heartbeat_timeout
                ),
                Duration::ZERO,
            )
            .await;
        }
    }

    /// One pass of the alert loop: evaluate rules, raise what fires, clear
    /// what no longer holds.
    async fn process_alerts(&self) {
        struct Pending {
            id: String,
            severity: AlertSeverity,
            message: String,
            cooldown: Duration,
        }

        let (to_fire, to_clear) = {
            let state = self.state.lock();
            let mut fire: Vec<Pending> = Vec::new();
            let mut clear: Vec<String> = Vec::new();

            if let Some(latest) = state.metrics.back() {
                for rule in self.rules.iter().filter(|r| r.is_system()) {
                    let id = format!("system_{}", rule.name);
                    match rule.evaluate_system(latest) {
                        Some(message) => {
                            if !state.active_alerts.contains_key(&id) {
                                fire.push(Pending {
                                    id,
                                    severity: rule.severity,
                                    message,
                                    cooldown: rule.cooldown,
                                });
                            }
                        }
                        None => {
                            if state.active_alerts.contains_key(&id) {
                                clear.push(id);
                            }
                        }
                    }
                }
            }

            for component in state.components.values() {
                for rule in self.rules.iter().filter(|r| !r.is_system()) {
                    if let Some(message) = rule.evaluate_component(component) {
                        let id = format!("component_{}_{}", rule.name, component.name);
                        if !state.active_alerts.contains_key(&id) {
                            fire.push(Pending {
                                id,
                                severity: rule.severity,
                                message,
                                cooldown: rule.cooldown,
                            });
                        }
                    }
                }
            }

            // Heartbeat-timeout alerts clear once the component reports in
            // again.
            let now = Utc::now();
            for id in state.active_alerts.keys() {
                if let Some(name) = id.strip_prefix("heartbeat_timeout_") {
                    if let Some(component) = state.components.get(name) {
                        let age = (now - component.last_heartbeat)
                            .to_std()
                            .unwrap_or_default();
                        if age <= self.config.heartbeat_timeout {
                            clear.push(id.clone());
                        }
                    }
                }
            }

            (fire, clear)
        };

        for pending in to_fire {
            self.fire_alert(
                &pending.id,
                pending.severity,
                &pending.message,
                pending.cooldown,
            )
            .await;
        }
        for id in to_clear {
            self.clear_alert(&id).await;
        }
    }

    /// One pass of the cleanup loop: expire day-old alerts and prune
    /// mirrored metric keys.
    async fn cleanup_old_data(&self) {
        let cutoff = Utc::now() - chrono::Duration::hours(24);
        let expired: Vec<String> = {
            let mut state = self.state.lock();
            let expired: Vec<String> = state
                .active_alerts
                .values()
                .filter(|a| a.created_at < cutoff)
                .map(|a| a.id.clone())
                .collect();
            for id in &expired {
                state.active_alerts.remove(id);
            }
            state.last_fired.retain(|_, fired| *fired >= cutoff);
            expired
        };
        if !expired.is_empty() {
            info!(count = expired.len(), "expired old alerts");
        }

        if let Some(kv) = &self.kv {
            let cutoff_ts = cutoff.timestamp();
            let mut deleted = 0usize;
            for key in kv.keys("metrics:*").await {
                let stale = key
                    .split(':')
                    .nth(1)
                    .and_then(|ts| ts.parse::<i64>().ok())
                    .is_some_and(|ts| ts < cutoff_ts);
                if stale {
                    kv.del(&key).await;
                    deleted += 1;
                }
            }
            if deleted > 0 {
                info!(deleted, "pruned mirrored metric keys");
            }
        }
    }

    async fn mirror_component(&self, component: &ComponentHealth) {
        if let Some(kv) = &self.kv {
            let payload = serde_json::to_string(component).unwrap_or_default();
            kv.set_ex(&format!("component:{}", component.name), &payload, 300)
                .await;
        }
    }

    /// Launch the metrics, health, alert, and cleanup loops.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            warn!("process monitor already started");
            return;
        }

        let spawn_loop = |period: Duration, kind: LoopKind| {
            let monitor = Arc::clone(self);
            let mut shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => monitor.run_loop_once(kind).await,
                    }
                }
            })
        };

        tasks.push(spawn_loop(self.config.monitoring_interval, LoopKind::Metrics));
        tasks.push(spawn_loop(Duration::from_secs(30), LoopKind::Health));
        tasks.push(spawn_loop(Duration::from_secs(60), LoopKind::Alerts));
        tasks.push(spawn_loop(Duration::from_secs(3600), LoopKind::Cleanup));
        info!("process monitor started");
    }

    async fn run_loop_once(&self, kind: LoopKind) {
        match kind {
            LoopKind::Metrics => self.collect_system_metrics().await,
            LoopKind::Health => self.check_component_health().await,
            LoopKind::Alerts => self.process_alerts().await,
            LoopKind::Cleanup => self.cleanup_old_data().await,
        }
    }

    /// Stop all loops. Idempotent.
    pub async fn stop(&self) {
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        if handles.is_empty() {
            warn!("process monitor already stopped");
            return;
        }
        let _ = self.shutdown.send(true);
        for handle in handles {
            let _ = handle.await;
        }
        info!("process monitor stopped");
    }
}

#[derive(Clone, Copy)]
enum LoopKind {
    Metrics,
    Health,
    Alerts,
    Cleanup,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> ProcessMonitor {
        ProcessMonitor::new(MonitorConfig::default(), None, None)
    }

    fn sample(memory: f64, cpu: f64, disk: f64) -> SystemMetricsSample {
        SystemMetricsSample {
            timestamp: Utc::now(),
            total_memory_mb: 16_000.0,
            used_memory_mb: 8_000.0,
            memory_percent: memory,
            cpu_percent: cpu,
            disk_usage_percent: disk,
            active_connections: 12,
            kv_connections: 1,
            sql_connections: 2,
        }
    }

    #[tokio::test]
    async fn status_walks_the_documented_transitions() {
        let m = monitor();
        m.register_component("eng", None);
        assert_eq!(
            m.component_health(Some("eng"))["eng"].status,
            HealthStatus::Unknown
        );

        m.heartbeat("eng", None, None, None).await;
        assert_eq!(
            m.component_health(Some("eng"))["eng"].status,
            HealthStatus::Healthy
        );

        m.report_warning("eng", "queue depth rising");
        assert_eq!(
            m.component_health(Some("eng"))["eng"].status,
            HealthStatus::Warning
        );

        m.report_error("eng", "db unreachable", true).await;
        assert_eq!(
            m.component_health(Some("eng"))["eng"].status,
            HealthStatus::Critical
        );

        // An explicit heartbeat status overrides.
        m.heartbeat("eng", Some(HealthStatus::Healthy), None, None)
            .await;
        assert_eq!(
            m.component_health(Some("eng"))["eng"].status,
            HealthStatus::Healthy
        );
    }

    #[tokio::test]
    async fn heartbeat_auto_registers_unknown_components() {
        let m = monitor();
        assert!(m.heartbeat("fresh", None, Some(2), None).await);
        let health = m.component_health(Some("fresh"));
        assert_eq!(health["fresh"].active_tasks, 2);
    }

    #[tokio::test]
    async fn heartbeat_timeout_flips_to_critical_and_alerts() {
        let m = ProcessMonitor::new(
            MonitorConfig {
                heartbeat_timeout: Duration::ZERO,
                ..Default::default()
            },
            None,
            None,
        );
        m.heartbeat("eng", Some(HealthStatus::Healthy), None, None)
            .await;

        tokio::time::sleep(Duration::from_millis(5)).await;
        m.check_component_health().await;

        assert_eq!(
            m.component_health(Some("eng"))["eng"].status,
            HealthStatus::Critical
        );
        let alerts = m.alerts(true);
        assert!(alerts.iter().any(|a| a.id == "heartbeat_timeout_eng"));
    }

    #[tokio::test]
    async fn fresh_heartbeat_clears_the_timeout_alert() {
        let m = ProcessMonitor::new(
            MonitorConfig {
                heartbeat_timeout: Duration::from_secs(3600),
                ..Default::default()
            },
            None,
            None,
        );
        m.heartbeat("eng", Some(HealthStatus::Healthy), None, None)
            .await;
        // Simulate a previously fired timeout alert.
        m.fire_alert(
            "heartbeat_timeout_eng",
            AlertSeverity::Critical,
            "stale",
            Duration::ZERO,
        )
        .await;

        m.process_alerts().await;
        assert!(m.alerts(true).is_empty());
    }

    #[tokio::test]
    async fn system_rules_fire_and_clear_with_the_metrics() {
        let m = monitor();
        m.record_sample(sample(96.0, 10.0, 10.0));
        m.process_alerts().await;

        let ids: Vec<String> = m.alerts(true).into_iter().map(|a| a.id).collect();
        assert!(ids.contains(&"system_high_memory_usage".to_string()));
        assert!(ids.contains(&"system_critical_memory_usage".to_string()));

        m.record_sample(sample(40.0, 10.0, 10.0));
        m.process_alerts().await;
        assert!(m.alerts(true).is_empty());
    }

    #[tokio::test]
    async fn cooldown_suppresses_immediate_refires() {
        let m = monitor();
        m.record_sample(sample(96.0, 10.0, 10.0));
        m.process_alerts().await;
        m.record_sample(sample(40.0, 10.0, 10.0));
        m.process_alerts().await;
        assert!(m.alerts(true).is_empty());

        // Condition returns within the cooldown window: stays quiet.
        m.record_sample(sample(96.0, 10.0, 10.0));
        m.process_alerts().await;
        assert!(m.alerts(true).is_empty());
    }

    #[tokio::test]
    async fn component_error_rule_raises_an_alert() {
        let m = monitor();
        for _ in 0..11 {
            m.report_error("eng", "boom", false).await;
        }
        // report_error itself raised error_eng; the rule pass adds the
        // error-rate alert.
        m.process_alerts().await;
        let ids: Vec<String> = m.alerts(true).into_iter().map(|a| a.id).collect();
        assert!(ids.contains(&"component_high_error_rate_eng".to_string()));
    }

    #[tokio::test]
    async fn metrics_ring_is_bounded() {
        let m = monitor();
        for _ in 0..(METRICS_CAP + 20) {
            m.record_sample(sample(10.0, 10.0, 10.0));
        }
        assert_eq!(m.stats().metrics_collected, METRICS_CAP);
    }

    #[tokio::test]
    async fn stats_count_components_by_status() {
        let m = monitor();
        m.heartbeat("a", Some(HealthStatus::Healthy), None, None).await;
        m.heartbeat("b", Some(HealthStatus::Healthy), None, None).await;
        m.report_warning("b", "meh");
        m.report_error("c", "bad", true).await;

        let stats = m.stats();
        assert_eq!(stats.total_components, 3);
        assert_eq!(stats.healthy_components, 1);
        assert_eq!(stats.warning_components, 1);
        assert_eq!(stats.critical_components, 1);
        assert_eq!(stats.total_heartbeats, 2);
    }

    #[tokio::test]
    async fn cleanup_drops_day_old_alerts() {
        let m = monitor();
        m.fire_alert("old_one", AlertSeverity::Info, "ancient", Duration::ZERO)
            .await;
        m.state.lock().active_alerts.get_mut("old_one").unwrap().created_at =
            Utc::now() - chrono::Duration::hours(25);

        m.cleanup_old_data().await;
        assert!(m.alerts(true).is_empty());
    }
}
