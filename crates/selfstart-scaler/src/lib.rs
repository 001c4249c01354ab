//! Auto-scaler for the SelfStart control plane.
//!
//! Three loops: metrics collection (runtime stats → [`MetricsPoint`] ring
//! buffer + store history), decision (threshold logic with cooldown and a
//! weighted-moving-average prediction blend), and cleanup of aged samples.
//! Scale actions go through a [`ScaleExecutor`], so the runtime-layer
//! meaning of "replicas" stays pluggable; the in-box executor covers the
//! single-container case.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use selfstart_discovery::DiscoveryEngine;
use selfstart_hooks::HookBus;
use selfstart_observe::OperationsMetrics;
use selfstart_proto::{
    Error, HookPoint, MetricsPoint, Result, ScalingDirection, ScalingEvent, ScalingPolicy,
    ScalingTrigger, ServiceStatus, keys,
};
use selfstart_runtime::ContainerRuntime;
use selfstart_store::RegistryStore;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ─── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalerConfig {
    pub collection_interval_secs: u64,
    pub evaluation_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    pub metrics_retention_secs: u64,
    pub prediction_samples: usize,
    pub stats_timeout_secs: u64,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            collection_interval_secs: 30,
            evaluation_interval_secs: 60,
            cleanup_interval_secs: 300,
            metrics_retention_secs: 3600,
            prediction_samples: 10,
            stats_timeout_secs: 10,
        }
    }
}

// ─── Executor seam ────────────────────────────────────────────────────────────

/// Converges a service onto a target replica count.
///
/// The decision layer never talks to the runtime directly; whoever wires
/// the scaler provides the executor (the daemon uses the orchestrator).
#[async_trait]
pub trait ScaleExecutor: Send + Sync {
    async fn scale_to(&self, service: &str, replicas: u32) -> Result<()>;
}

/// Application-level metrics plugged in by collaborators; absent values
/// default to zero.
#[async_trait]
pub trait AppMetricsSource: Send + Sync {
    async fn request_rate(&self, service: &str) -> f64;
    async fn response_time_ms(&self, service: &str) -> f64;
    async fn error_rate(&self, service: &str) -> f64;
    async fn queue_length(&self, service: &str) -> u32;
}

/// Default source: no application metrics available.
pub struct NoAppMetrics;

#[async_trait]
impl AppMetricsSource for NoAppMetrics {
    async fn request_rate(&self, _service: &str) -> f64 {
        0.0
    }
    async fn response_time_ms(&self, _service: &str) -> f64 {
        0.0
    }
    async fn error_rate(&self, _service: &str) -> f64 {
        0.0
    }
    async fn queue_length(&self, _service: &str) -> u32 {
        0
    }
}

/// Scaler-wide counters, for status endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalerSummary {
    pub total_policies: usize,
    pub active_policies: usize,
    pub services_with_metrics: usize,
    pub total_metrics_points: usize,
}

// ─── Auto-scaler ──────────────────────────────────────────────────────────────

pub struct AutoScaler {
    discovery: Arc<DiscoveryEngine>,
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn RegistryStore>,
    hooks: Arc<HookBus>,
    metrics: Arc<OperationsMetrics>,
    executor: Arc<dyn ScaleExecutor>,
    app_metrics: Arc<dyn AppMetricsSource>,
    config: ScalerConfig,
    policies: RwLock<HashMap<String, ScalingPolicy>>,
    history: RwLock<HashMap<String, VecDeque<MetricsPoint>>>,
    /// Last observed (rx, tx, at) per service, for rate derivation.
    net_counters: RwLock<HashMap<String, (u64, u64, DateTime<Utc>)>>,
    last_action: RwLock<HashMap<String, DateTime<Utc>>>,
    replicas: RwLock<HashMap<String, u32>>,
}

impl AutoScaler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        discovery: Arc<DiscoveryEngine>,
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn RegistryStore>,
        hooks: Arc<HookBus>,
        metrics: Arc<OperationsMetrics>,
        executor: Arc<dyn ScaleExecutor>,
        app_metrics: Arc<dyn AppMetricsSource>,
        config: ScalerConfig,
    ) -> Self {
        Self {
            discovery,
            runtime,
            store,
            hooks,
            metrics,
            executor,
            app_metrics,
            config,
            policies: RwLock::new(HashMap::new()),
            history: RwLock::new(HashMap::new()),
            net_counters: RwLock::new(HashMap::new()),
            last_action: RwLock::new(HashMap::new()),
            replicas: RwLock::new(HashMap::new()),
        }
    }

    // ─── Policy management ──────────────────────────────────────────────────

    pub async fn set_policy(&self, policy: ScalingPolicy) -> Result<()> {
        policy.validate()?;
        let name = policy.service_name.clone();
        if let Ok(payload) = serde_json::to_string(&policy) {
            if let Err(e) = self.store.set(&keys::scaling_policy(&name), &payload).await {
                warn!(service = %name, error = %e, "policy persist failed");
            } else if let Err(e) = self
                .store
                .set_add(keys::SCALING_POLICIES_INDEX, &name)
                .await
            {
                warn!(service = %name, error = %e, "policy index update failed");
            }
        }
        info!(service = %name, "scaling policy updated");
        self.policies.write().insert(name, policy);
        Ok(())
    }

    pub fn get_policy(&self, service: &str) -> Option<ScalingPolicy> {
        self.policies.read().get(service).cloned()
    }

    pub fn all_policies(&self) -> Vec<ScalingPolicy> {
        let mut all: Vec<ScalingPolicy> = self.policies.read().values().cloned().collect();
        all.sort_by(|a, b| a.service_name.cmp(&b.service_name));
        all
    }

    /// Rehydrate policies persisted by a previous run.
    pub async fn load_policies(&self) -> Result<usize> {
        let names = self.store.set_members(keys::SCALING_POLICIES_INDEX).await?;
        let mut loaded = 0;
        for name in names {
            if let Some(raw) = self.store.get(&keys::scaling_policy(&name)).await? {
                match serde_json::from_str::<ScalingPolicy>(&raw) {
                    Ok(policy) => {
                        self.policies.write().insert(name.clone(), policy);
                        loaded += 1;
                    }
                    Err(e) => warn!(service = %name, error = %e, "stored policy is corrupt"),
                }
            }
        }
        info!(loaded, "scaling policies rehydrated");
        Ok(loaded)
    }

    // ─── Collection ─────────────────────────────────────────────────────────

    /// Sample every auto-scale service once.
    pub async fn collect_once(&self) {
        for service in self.discovery.all_services() {
            if !service.auto_scale_enabled || service.status != ServiceStatus::Running {
                continue;
            }
            match self.sample_service(&service.name, &service.container_id).await {
                Ok(point) => self.record_point(&service.name, point).await,
                Err(e) => {
                    debug!(service = %service.name, error = %e, "metrics sample failed")
                }
            }
        }
    }

    async fn sample_service(&self, name: &str, container_id: &str) -> Result<MetricsPoint> {
        let lookup = if container_id.is_empty() { name } else { container_id };
        let stats = tokio::time::timeout(
            Duration::from_secs(self.config.stats_timeout_secs),
            self.runtime.stats(lookup),
        )
        .await
        .map_err(|_| Error::Timeout(format!("stats fetch for '{name}'")))??;

        let now = Utc::now();
        let (rx, tx) = stats.network_totals();
        let (in_mbps, out_mbps) = {
            let mut counters = self.net_counters.write();
            let rates = match counters.get(name) {
                Some((prev_rx, prev_tx, prev_at)) => {
                    let gap = (now - *prev_at).num_seconds().max(1) as f64;
                    (
                        mbps(rx.saturating_sub(*prev_rx), gap),
                        mbps(tx.saturating_sub(*prev_tx), gap),
                    )
                }
                None => (0.0, 0.0),
            };
            counters.insert(name.to_string(), (rx, tx, now));
            rates
        };

        Ok(MetricsPoint {
            cpu_percent: stats.cpu_percent(),
            memory_percent: stats.memory_percent(),
            network_in_mbps: in_mbps,
            network_out_mbps: out_mbps,
            request_rate: self.app_metrics.request_rate(name).await,
            response_time_ms: self.app_metrics.response_time_ms(name).await,
            error_rate: self.app_metrics.error_rate(name).await,
            queue_length: self.app_metrics.queue_length(name).await,
            timestamp: now,
        })
    }

    async fn record_point(&self, name: &str, point: MetricsPoint) {
        let cap = (self.config.metrics_retention_secs / self.config.collection_interval_secs.max(1))
            .max(1) as usize;
        {
            let mut history = self.history.write();
            let ring = history.entry(name.to_string()).or_default();
            if ring.len() == cap {
                ring.pop_front();
            }
            ring.push_back(point.clone());
        }

        if let Ok(payload) = serde_json::to_string(&point) {
            if let Err(e) = self
                .store
                .list_push(
                    &keys::metrics(name),
                    &payload,
                    cap,
                    self.config.metrics_retention_secs,
                )
                .await
            {
                debug!(service = name, error = %e, "metrics history push failed");
            }
        }

        self.metrics.hook_publishes_total.inc();
        self.hooks
            .publish(
                HookPoint::OnMetricsCollection,
                serde_json::json!({
                    "service": name,
                    "cpu_percent": point.cpu_percent,
                    "memory_percent": point.memory_percent,
                }),
            )
            .await;
    }

    // ─── Decision ───────────────────────────────────────────────────────────

    /// Evaluate every enabled policy once.
    pub async fn evaluate_once(&self) {
        let policies: Vec<ScalingPolicy> = self
            .policies
            .read()
            .values()
            .filter(|p| p.enabled)
            .cloned()
            .collect();
        for policy in policies {
            let (direction, trigger) = self.decide(&policy).await;
            if direction != ScalingDirection::None {
                self.execute(&policy, direction, trigger).await;
            }
        }
    }

    async fn decide(&self, policy: &ScalingPolicy) -> (ScalingDirection, ScalingTrigger) {
        let name = &policy.service_name;

        // The original control plane applies the shorter of the two
        // cooldowns regardless of the last action's direction.
        let cooldown =
            Duration::from_secs(policy.scale_up_cooldown_secs.min(policy.scale_down_cooldown_secs));
        if let Some(last) = self.last_action.read().get(name) {
            let elapsed = (Utc::now() - *last)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if elapsed < cooldown {
                return (ScalingDirection::None, ScalingTrigger::CpuThreshold);
            }
        }

        let window: Vec<MetricsPoint> = {
            let history = self.history.read();
            let Some(ring) = history.get(name) else {
                return (ScalingDirection::None, ScalingTrigger::CpuThreshold);
            };
            if ring.len() < policy.evaluation_periods {
                return (ScalingDirection::None, ScalingTrigger::CpuThreshold);
            }
            ring.iter()
                .rev()
                .take(policy.evaluation_periods)
                .cloned()
                .collect()
        };

        let n = window.len() as f64;
        let mut cpu = window.iter().map(|m| m.cpu_percent).sum::<f64>() / n;
        let mut memory = window.iter().map(|m| m.memory_percent).sum::<f64>() / n;
        let mut network = window
            .iter()
            .map(|m| m.network_in_mbps.max(m.network_out_mbps))
            .sum::<f64>()
            / n;

        if policy.enable_prediction {
            let predicted_cpu = self.predict(name, |m| m.cpu_percent);
            let predicted_mem = self.predict(name, |m| m.memory_percent);
            let predicted_net =
                self.predict(name, |m| m.network_in_mbps.max(m.network_out_mbps));
            cpu = cpu * 0.7 + predicted_cpu * 0.3;
            memory = memory * 0.7 + predicted_mem * 0.3;
            network = network * 0.7 + predicted_net * 0.3;
        }

        let current = self.current_replicas(name).await;

        if cpu > policy.cpu_scale_up_threshold
            || memory > policy.memory_scale_up_threshold
            || network > policy.network_scale_up_threshold
        {
            if current < policy.max_replicas {
                info!(
                    service = %name,
                    cpu = format!("{cpu:.1}"),
                    memory = format!("{memory:.1}"),
                    network = format!("{network:.1}"),
                    "scale up decided"
                );
                let trigger = if cpu > policy.cpu_scale_up_threshold {
                    ScalingTrigger::CpuThreshold
                } else if memory > policy.memory_scale_up_threshold {
                    ScalingTrigger::MemoryThreshold
                } else {
                    ScalingTrigger::NetworkThreshold
                };
                return (ScalingDirection::Up, trigger);
            }
        } else if cpu < policy.cpu_scale_down_threshold
            && memory < policy.memory_scale_down_threshold
            && network < policy.network_scale_down_threshold
            && current > policy.min_replicas
        {
            info!(
                service = %name,
                cpu = format!("{cpu:.1}"),
                memory = format!("{memory:.1}"),
                network = format!("{network:.1}"),
                "scale down decided"
            );
            return (ScalingDirection::Down, ScalingTrigger::CpuThreshold);
        }

        (ScalingDirection::None, ScalingTrigger::CpuThreshold)
    }

    /// Weighted moving average with linear weights plus a three-step linear
    /// trend, floored at zero. With fewer than three samples there is no
    /// usable trend and the prediction degrades to the plain mean, so the
    /// blend in [`AutoScaler::evaluate_once`] never drags a hot axis down.
    fn predict(&self, name: &str, metric: impl Fn(&MetricsPoint) -> f64) -> f64 {
        let history = self.history.read();
        let Some(ring) = history.get(name) else {
            return 0.0;
        };
        let values: Vec<f64> = ring
            .iter()
            .rev()
            .take(self.config.prediction_samples)
            .map(|m| metric(m))
            .collect::<Vec<f64>>()
            .into_iter()
            .rev()
            .collect();
        if values.is_empty() {
            return 0.0;
        }
        if values.len() < 3 {
            return values.iter().sum::<f64>() / values.len() as f64;
        }

        let weight_sum: f64 = (1..=values.len()).map(|w| w as f64).sum();
        let wma: f64 = values
            .iter()
            .enumerate()
            .map(|(i, v)| (i + 1) as f64 * v)
            .sum::<f64>()
            / weight_sum;
        let trend = (values[values.len() - 1] - values[0]) / values.len() as f64;
        (wma + trend * 3.0).max(0.0)
    }

    async fn current_replicas(&self, name: &str) -> u32 {
        if let Some(count) = self.replicas.read().get(name) {
            return *count;
        }
        match self.discovery.get_service(name).await {
            Some(service) if service.status == ServiceStatus::Running => 1,
            _ => 0,
        }
    }

    // ─── Execution ──────────────────────────────────────────────────────────

    async fn execute(
        &self,
        policy: &ScalingPolicy,
        direction: ScalingDirection,
        trigger: ScalingTrigger,
    ) {
        let name = &policy.service_name;
        let current = self.current_replicas(name).await;
        let target = match direction {
            ScalingDirection::Up => (current + 1).min(policy.max_replicas),
            ScalingDirection::Down => current.saturating_sub(1).max(policy.min_replicas),
            ScalingDirection::None => return,
        };
        if target == current {
            return;
        }

        let outcome = self.executor.scale_to(name, target).await;
        let success = outcome.is_ok();
        let error_message = outcome.err().map(|e| e.to_string());

        self.record_event(ScalingEvent {
            service_name: name.clone(),
            direction,
            trigger,
            from_replicas: current,
            to_replicas: target,
            metrics: self.latest_point(name),
            timestamp: Utc::now(),
            success,
            error_message: error_message.clone(),
        })
        .await;

        if success {
            self.replicas.write().insert(name.clone(), target);
            // The cooldown timer only advances on success, so a failed
            // action is retried on the next cycle.
            self.last_action.write().insert(name.clone(), Utc::now());
            match direction {
                ScalingDirection::Up => self.metrics.scale_ups_total.inc(),
                ScalingDirection::Down => self.metrics.scale_downs_total.inc(),
                ScalingDirection::None => {}
            }
            info!(service = %name, from = current, to = target, %direction, "scale action applied");
        } else {
            self.metrics.record_scaling_error();
            warn!(service = %name, from = current, to = target, error = ?error_message, "scale action failed");
        }
    }

    /// Operator-driven scale: bypasses thresholds and cooldown, still
    /// audited. The target is clamped into the policy bounds when a policy
    /// exists.
    pub async fn manual_scale(&self, name: &str, replicas: u32) -> Result<u32> {
        let target = match self.policies.read().get(name) {
            Some(policy) => replicas.clamp(policy.min_replicas, policy.max_replicas),
            None => replicas,
        };
        let current = self.current_replicas(name).await;

        let outcome = self.executor.scale_to(name, target).await;
        let success = outcome.is_ok();
        let direction = if target >= current {
            ScalingDirection::Up
        } else {
            ScalingDirection::Down
        };

        self.record_event(ScalingEvent {
            service_name: name.to_string(),
            direction,
            trigger: ScalingTrigger::Manual,
            from_replicas: current,
            to_replicas: target,
            metrics: self.latest_point(name),
            timestamp: Utc::now(),
            success,
            error_message: outcome.as_ref().err().map(|e| e.to_string()),
        })
        .await;

        match outcome {
            Ok(()) => {
                self.replicas.write().insert(name.to_string(), target);
                self.last_action.write().insert(name.to_string(), Utc::now());
                info!(service = name, from = current, to = target, "manual scale applied");
                Ok(target)
            }
            Err(e) => {
                self.metrics.record_scaling_error();
                Err(e)
            }
        }
    }

    fn latest_point(&self, name: &str) -> MetricsPoint {
        self.history
            .read()
            .get(name)
            .and_then(|ring| ring.back().cloned())
            .unwrap_or_else(|| MetricsPoint::zero(Utc::now()))
    }

    async fn record_event(&self, event: ScalingEvent) {
        self.metrics.hook_publishes_total.inc();
        self.hooks
            .publish(
                HookPoint::OnScalingEvent,
                serde_json::json!({
                    "service": event.service_name,
                    "direction": event.direction,
                    "from": event.from_replicas,
                    "to": event.to_replicas,
                    "success": event.success,
                }),
            )
            .await;

        let Ok(payload) = serde_json::to_string(&event) else {
            return;
        };
        if let Err(e) = self
            .store
            .list_push(
                &keys::scaling_events(&event.service_name),
                &payload,
                keys::SCALING_EVENTS_CAP,
                keys::SCALING_EVENTS_TTL_SECS,
            )
            .await
        {
            debug!(service = %event.service_name, error = %e, "event persist failed");
        }
    }

    /// Newest-first scaling history for one service.
    pub async fn scaling_events(&self, name: &str, limit: usize) -> Result<Vec<ScalingEvent>> {
        let raw = self
            .store
            .list_range(&keys::scaling_events(name), limit)
            .await?;
        Ok(raw
            .iter()
            .filter_map(|entry| serde_json::from_str(entry).ok())
            .collect())
    }

    // ─── Cleanup ────────────────────────────────────────────────────────────

    /// Drop in-memory samples older than the retention window.
    pub fn cleanup_once(&self) {
        let cutoff =
            Utc::now() - chrono::Duration::seconds(self.config.metrics_retention_secs as i64);
        let mut history = self.history.write();
        for ring in history.values_mut() {
            while ring.front().is_some_and(|m| m.timestamp < cutoff) {
                ring.pop_front();
            }
        }
        history.retain(|_, ring| !ring.is_empty());
    }

    pub fn summary(&self) -> ScalerSummary {
        let policies = self.policies.read();
        let history = self.history.read();
        ScalerSummary {
            total_policies: policies.len(),
            active_policies: policies.values().filter(|p| p.enabled).count(),
            services_with_metrics: history.len(),
            total_metrics_points: history.values().map(|r| r.len()).sum(),
        }
    }

    // ─── Loops ──────────────────────────────────────────────────────────────

    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let collection = {
            let scaler = Arc::clone(self);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(
                    scaler.config.collection_interval_secs,
                ));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => scaler.collect_once().await,
                        _ = shutdown.changed() => {
                            info!("scaler collection loop stopping");
                            break;
                        }
                    }
                }
            })
        };

        let decision = {
            let scaler = Arc::clone(self);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(
                    scaler.config.evaluation_interval_secs,
                ));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => scaler.evaluate_once().await,
                        _ = shutdown.changed() => {
                            info!("scaler decision loop stopping");
                            break;
                        }
                    }
                }
            })
        };

        let cleanup = {
            let scaler = Arc::clone(self);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(
                    scaler.config.cleanup_interval_secs,
                ));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => scaler.cleanup_once(),
                        _ = shutdown.changed() => {
                            info!("scaler cleanup loop stopping");
                            break;
                        }
                    }
                }
            })
        };

        vec![collection, decision, cleanup]
    }
}

fn mbps(bytes: u64, window_secs: f64) -> f64 {
    (bytes as f64 * 8.0) / (1024.0 * 1024.0 * window_secs)
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use selfstart_discovery::DiscoveryConfig;
    use selfstart_proto::labels;
    use selfstart_runtime::{FakeRuntime, stats_sample};

    struct RecordingExecutor {
        calls: Mutex<Vec<(String, u32)>>,
        fail: std::sync::atomic::AtomicBool,
    }

    impl RecordingExecutor {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                fail: std::sync::atomic::AtomicBool::new(false),
            })
        }

        fn calls(&self) -> Vec<(String, u32)> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl ScaleExecutor for RecordingExecutor {
        async fn scale_to(&self, service: &str, replicas: u32) -> Result<()> {
            if self.fail.load(std::sync::atomic::Ordering::Relaxed) {
                return Err(Error::Runtime("executor offline".to_string()));
            }
            self.calls.lock().push((service.to_string(), replicas));
            Ok(())
        }
    }

    struct Fixture {
        scaler: Arc<AutoScaler>,
        executor: Arc<RecordingExecutor>,
        runtime: Arc<FakeRuntime>,
        discovery: Arc<DiscoveryEngine>,
    }

    async fn fixture_with_service(service: &str) -> Fixture {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.add_running(
            service,
            std::collections::HashMap::from([
                (labels::ENABLE.to_string(), "true".to_string()),
                (labels::AUTO_SCALE.to_string(), "true".to_string()),
            ]),
        );

        let store: Arc<dyn RegistryStore> = Arc::new(selfstart_store::MemoryStore::new());
        let hooks = Arc::new(HookBus::new());
        let metrics = Arc::new(OperationsMetrics::new());
        let discovery = Arc::new(DiscoveryEngine::new(
            Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
            Arc::clone(&store),
            Arc::clone(&hooks),
            Arc::clone(&metrics),
            DiscoveryConfig::default(),
        ));
        discovery.discover_once().await.expect("discover");

        let executor = RecordingExecutor::new();
        let scaler = Arc::new(AutoScaler::new(
            Arc::clone(&discovery),
            Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
            store,
            hooks,
            metrics,
            Arc::clone(&executor) as Arc<dyn ScaleExecutor>,
            Arc::new(NoAppMetrics),
            ScalerConfig::default(),
        ));
        Fixture {
            scaler,
            executor,
            runtime,
            discovery,
        }
    }

    fn cpu_point(cpu: f64) -> MetricsPoint {
        MetricsPoint {
            cpu_percent: cpu,
            memory_percent: 10.0,
            network_in_mbps: 1.0,
            network_out_mbps: 1.0,
            request_rate: 0.0,
            response_time_ms: 0.0,
            error_rate: 0.0,
            queue_length: 0,
            timestamp: Utc::now(),
        }
    }

    fn seed_history(scaler: &AutoScaler, service: &str, cpus: &[f64]) {
        let mut history = scaler.history.write();
        let ring = history.entry(service.to_string()).or_default();
        for cpu in cpus {
            ring.push_back(cpu_point(*cpu));
        }
    }

    fn test_policy(service: &str) -> ScalingPolicy {
        let mut policy = ScalingPolicy::for_service(service);
        policy.cpu_scale_up_threshold = 80.0;
        policy.cpu_scale_down_threshold = 30.0;
        policy.min_replicas = 1;
        policy.max_replicas = 3;
        policy.evaluation_periods = 3;
        policy.evaluation_interval_secs = 1;
        policy.scale_up_cooldown_secs = 5;
        policy.scale_down_cooldown_secs = 5;
        policy.enable_prediction = false;
        policy
    }

    #[tokio::test]
    async fn test_scale_up_under_cpu_pressure_then_cooldown() {
        let fx = fixture_with_service("webshop").await;
        fx.scaler
            .set_policy(test_policy("webshop"))
            .await
            .expect("policy");
        seed_history(&fx.scaler, "webshop", &[85.0, 90.0, 88.0]);

        fx.scaler.evaluate_once().await;
        assert_eq!(fx.executor.calls(), vec![("webshop".to_string(), 2)]);

        let events = fx
            .scaler
            .scaling_events("webshop", 10)
            .await
            .expect("events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].direction, ScalingDirection::Up);
        assert_eq!((events[0].from_replicas, events[0].to_replicas), (1, 2));
        assert!(events[0].success);

        // Inside the cooldown window nothing further happens, whatever the
        // samples say.
        seed_history(&fx.scaler, "webshop", &[99.0, 99.0, 99.0]);
        fx.scaler.evaluate_once().await;
        assert_eq!(fx.executor.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_no_decision_with_insufficient_samples() {
        let fx = fixture_with_service("webshop").await;
        fx.scaler
            .set_policy(test_policy("webshop"))
            .await
            .expect("policy");
        seed_history(&fx.scaler, "webshop", &[95.0, 96.0]);

        fx.scaler.evaluate_once().await;
        assert!(fx.executor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_scale_down_requires_all_axes_low() {
        let fx = fixture_with_service("webshop").await;
        fx.scaler
            .set_policy(test_policy("webshop"))
            .await
            .expect("policy");
        fx.scaler.replicas.write().insert("webshop".to_string(), 2);

        // CPU low but memory above its down threshold: hold.
        {
            let mut history = fx.scaler.history.write();
            let ring = history.entry("webshop".to_string()).or_default();
            for _ in 0..3 {
                let mut point = cpu_point(5.0);
                point.memory_percent = 75.0;
                ring.push_back(point);
            }
        }
        fx.scaler.evaluate_once().await;
        assert!(fx.executor.calls().is_empty());

        // All axes low: scale down 2 → 1.
        fx.scaler.history.write().clear();
        seed_history(&fx.scaler, "webshop", &[5.0, 4.0, 6.0]);
        fx.scaler.evaluate_once().await;
        assert_eq!(fx.executor.calls(), vec![("webshop".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_replica_bounds_are_respected() {
        let fx = fixture_with_service("webshop").await;
        fx.scaler
            .set_policy(test_policy("webshop"))
            .await
            .expect("policy");

        // Already at max: no scale-up.
        fx.scaler.replicas.write().insert("webshop".to_string(), 3);
        seed_history(&fx.scaler, "webshop", &[95.0, 95.0, 95.0]);
        fx.scaler.evaluate_once().await;
        assert!(fx.executor.calls().is_empty());

        // Already at min: no scale-down.
        fx.scaler.replicas.write().insert("webshop".to_string(), 1);
        fx.scaler.history.write().clear();
        seed_history(&fx.scaler, "webshop", &[2.0, 2.0, 2.0]);
        fx.scaler.evaluate_once().await;
        assert!(fx.executor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_action_leaves_cooldown_open_for_retry() {
        let fx = fixture_with_service("webshop").await;
        fx.scaler
            .set_policy(test_policy("webshop"))
            .await
            .expect("policy");
        seed_history(&fx.scaler, "webshop", &[90.0, 92.0, 91.0]);

        fx.executor
            .fail
            .store(true, std::sync::atomic::Ordering::Relaxed);
        fx.scaler.evaluate_once().await;

        let events = fx
            .scaler
            .scaling_events("webshop", 10)
            .await
            .expect("events");
        assert_eq!(events.len(), 1);
        assert!(!events[0].success);
        assert!(events[0].error_message.is_some());

        // No cooldown stamp: the next cycle retries immediately.
        fx.executor
            .fail
            .store(false, std::sync::atomic::Ordering::Relaxed);
        fx.scaler.evaluate_once().await;
        assert_eq!(fx.executor.calls(), vec![("webshop".to_string(), 2)]);
    }

    #[tokio::test]
    async fn test_prediction_blend_raises_rising_load() {
        let fx = fixture_with_service("webshop").await;
        let mut policy = test_policy("webshop");
        policy.enable_prediction = true;
        fx.scaler.set_policy(policy).await.expect("policy");

        // Mean of the last 3 samples is 78.3 (below the threshold), but the
        // steep upward trend pushes the blended value over 80.
        seed_history(
            &fx.scaler,
            "webshop",
            &[40.0, 55.0, 65.0, 75.0, 78.0, 82.0],
        );
        fx.scaler.evaluate_once().await;
        assert_eq!(fx.executor.calls(), vec![("webshop".to_string(), 2)]);
    }

    #[tokio::test]
    async fn test_prediction_with_short_window_keeps_hot_axis_hot() {
        let fx = fixture_with_service("webshop").await;
        let mut policy = test_policy("webshop");
        policy.evaluation_periods = 2;
        policy.enable_prediction = true;
        fx.scaler.set_policy(policy).await.expect("policy");

        // Two flat samples at 85%: zero trend, so the blend must stay at
        // the mean and clear the 80% threshold.
        seed_history(&fx.scaler, "webshop", &[85.0, 85.0]);
        fx.scaler.evaluate_once().await;
        assert_eq!(fx.executor.calls(), vec![("webshop".to_string(), 2)]);
    }

    #[tokio::test]
    async fn test_prediction_blends_network_axis() {
        let fx = fixture_with_service("webshop").await;
        let mut policy = test_policy("webshop");
        policy.network_scale_up_threshold = 100.0;
        policy.enable_prediction = true;
        fx.scaler.set_policy(policy).await.expect("policy");

        // Mean of the last 3 network samples is 95 Mbps (below the
        // threshold), but the climb pushes the blended value over 100.
        {
            let mut history = fx.scaler.history.write();
            let ring = history.entry("webshop".to_string()).or_default();
            for mbps in [40.0, 60.0, 80.0, 90.0, 95.0, 100.0] {
                let mut point = cpu_point(10.0);
                point.network_in_mbps = mbps;
                ring.push_back(point);
            }
        }
        fx.scaler.evaluate_once().await;

        assert_eq!(fx.executor.calls(), vec![("webshop".to_string(), 2)]);
        let events = fx
            .scaler
            .scaling_events("webshop", 10)
            .await
            .expect("events");
        assert_eq!(events[0].trigger, ScalingTrigger::NetworkThreshold);
    }

    #[test]
    fn test_predictor_shape() {
        let runtime = Arc::new(FakeRuntime::new());
        let store: Arc<dyn RegistryStore> = Arc::new(selfstart_store::MemoryStore::new());
        let hooks = Arc::new(HookBus::new());
        let metrics = Arc::new(OperationsMetrics::new());
        let discovery = Arc::new(DiscoveryEngine::new(
            Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
            Arc::clone(&store),
            Arc::clone(&hooks),
            Arc::clone(&metrics),
            DiscoveryConfig::default(),
        ));
        let scaler = AutoScaler::new(
            discovery,
            runtime,
            store,
            hooks,
            metrics,
            RecordingExecutor::new(),
            Arc::new(NoAppMetrics),
            ScalerConfig::default(),
        );

        // No samples at all: nothing to predict.
        assert_eq!(scaler.predict("svc", |m| m.cpu_percent), 0.0);

        // Fewer than three samples: degrade to the plain mean.
        seed_history(&scaler, "svc", &[50.0, 60.0]);
        let short = scaler.predict("svc", |m| m.cpu_percent);
        assert!((short - 55.0).abs() < 0.001, "got {short}");

        // Flat series: prediction equals the level.
        scaler.history.write().clear();
        seed_history(&scaler, "svc", &[50.0, 50.0, 50.0, 50.0]);
        let flat = scaler.predict("svc", |m| m.cpu_percent);
        assert!((flat - 50.0).abs() < 0.001, "got {flat}");

        // Rising series: prediction sits above the weighted average.
        scaler.history.write().clear();
        seed_history(&scaler, "svc", &[10.0, 20.0, 30.0, 40.0]);
        let rising = scaler.predict("svc", |m| m.cpu_percent);
        assert!(rising > 30.0, "got {rising}");

        // Falling series never predicts below zero.
        scaler.history.write().clear();
        seed_history(&scaler, "svc", &[9.0, 6.0, 3.0, 0.0]);
        assert!(scaler.predict("svc", |m| m.cpu_percent) >= 0.0);
    }

    #[tokio::test]
    async fn test_manual_scale_bypasses_cooldown_and_clamps() {
        let fx = fixture_with_service("webshop").await;
        fx.scaler
            .set_policy(test_policy("webshop"))
            .await
            .expect("policy");

        // Way past max_replicas: clamped to 3.
        let applied = fx.scaler.manual_scale("webshop", 10).await.expect("scale");
        assert_eq!(applied, 3);

        // Cooldown does not block manual actions.
        let applied = fx.scaler.manual_scale("webshop", 1).await.expect("scale");
        assert_eq!(applied, 1);

        let events = fx
            .scaler
            .scaling_events("webshop", 10)
            .await
            .expect("events");
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.trigger == ScalingTrigger::Manual));
    }

    #[tokio::test]
    async fn test_collection_derives_rates_from_stats() {
        let fx = fixture_with_service("webshop").await;

        // First sample establishes counters (rates 0), second derives.
        fx.runtime.set_stats(
            "webshop",
            stats_sample(150, 100, 1200, 1000, 512, 1024, 1_000_000, 500_000),
        );
        fx.scaler.collect_once().await;
        fx.runtime.set_stats(
            "webshop",
            stats_sample(160, 150, 1300, 1200, 512, 1024, 2_048_576, 500_000),
        );
        fx.scaler.collect_once().await;

        let history = fx.scaler.history.read();
        let ring = history.get("webshop").expect("history");
        assert_eq!(ring.len(), 2);

        let first = &ring[0];
        assert!((first.cpu_percent - 25.0).abs() < 0.001);
        assert!((first.memory_percent - 50.0).abs() < 0.001);
        assert_eq!(first.network_in_mbps, 0.0);

        let second = &ring[1];
        // 1 MiB delta over a ≥1s window: at most 8 Mbps.
        assert!(second.network_in_mbps > 0.0);
        assert!(second.network_in_mbps <= 8.0);
        assert_eq!(second.network_out_mbps, 0.0);
    }

    #[tokio::test]
    async fn test_cleanup_drops_aged_points() {
        let fx = fixture_with_service("webshop").await;
        {
            let mut history = fx.scaler.history.write();
            let ring = history.entry("webshop".to_string()).or_default();
            let mut old = cpu_point(10.0);
            old.timestamp = Utc::now() - chrono::Duration::seconds(7200);
            ring.push_back(old);
            ring.push_back(cpu_point(20.0));
        }

        fx.scaler.cleanup_once();
        let history = fx.scaler.history.read();
        assert_eq!(history.get("webshop").expect("ring").len(), 1);
    }

    #[tokio::test]
    async fn test_policies_rehydrate_from_store() {
        let fx = fixture_with_service("webshop").await;
        fx.scaler
            .set_policy(test_policy("webshop"))
            .await
            .expect("policy");

        let other = AutoScaler::new(
            Arc::clone(&fx.discovery),
            Arc::clone(&fx.runtime) as Arc<dyn ContainerRuntime>,
            Arc::clone(&fx.scaler.store),
            Arc::new(HookBus::new()),
            Arc::new(OperationsMetrics::new()),
            RecordingExecutor::new(),
            Arc::new(NoAppMetrics),
            ScalerConfig::default(),
        );
        assert_eq!(other.load_policies().await.expect("load"), 1);
        assert!(other.get_policy("webshop").is_some());
    }
}
