//! Container lifecycle orchestrator for the SelfStart control plane.
//!
//! Owns the per-container state machine, serializes startup through a
//! bounded FIFO queue drained by a small worker pool, resolves declared
//! dependencies before enqueueing, and runs a background health loop over
//! every managed container.
//!
//! State machine (initial = stopped):
//!
//! ```text
//! stopped ──start──► starting ──ready──► running
//! starting ──fail──► error
//! running  ──stop──► stopping ──done──► stopped
//! running  ──probe-fail×2──► unhealthy ──recover──► running
//! unhealthy ──probe-fail×N──► error
//! any      ──gone-from-runtime──► stopped
//! ```

#![forbid(unsafe_code)]

use chrono::Utc;
use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use selfstart_hooks::HookBus;
use selfstart_observe::OperationsMetrics;
use selfstart_proto::{
    ContainerConfig, ContainerState, ContainerStatus, Error, HealthCheck, HookPoint, Result, keys,
};
use selfstart_runtime::{ContainerRuntime, ContainerSpec, state};
use selfstart_store::RegistryStore;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ─── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Worker tasks draining the startup queue.
    pub max_concurrent_starts: usize,
    /// Startup queue capacity; a full queue rejects new start intents.
    pub queue_capacity: usize,
    pub health_check_interval_secs: u64,
    pub dependency_timeout_secs: u64,
    /// Consecutive failed probes before an unhealthy container goes to error.
    pub max_health_failures: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_starts: 3,
            queue_capacity: 32,
            health_check_interval_secs: 30,
            dependency_timeout_secs: 300,
            max_health_failures: 5,
        }
    }
}

/// How a start request was absorbed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// Intent accepted and queued for a worker.
    Queued,
    /// Container already running; nothing to do.
    AlreadyRunning,
    /// A start is already in flight; no second task enqueued.
    AlreadyStarting,
}

/// Orchestrator-wide counters, for status endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSummary {
    pub total_containers: usize,
    pub states: HashMap<String, usize>,
    pub queue_depth: usize,
    pub workers: usize,
}

// ─── Orchestrator ─────────────────────────────────────────────────────────────

pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn RegistryStore>,
    hooks: Arc<HookBus>,
    metrics: Arc<OperationsMetrics>,
    http: reqwest::Client,
    config: OrchestratorConfig,
    configs: RwLock<HashMap<String, ContainerConfig>>,
    statuses: RwLock<HashMap<String, ContainerStatus>>,
    /// Consecutive health-check failures per container.
    fail_streaks: RwLock<HashMap<String, u32>>,
    queue_tx: mpsc::Sender<String>,
    queue_rx: AsyncMutex<mpsc::Receiver<String>>,
}

impl Orchestrator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn RegistryStore>,
        hooks: Arc<HookBus>,
        metrics: Arc<OperationsMetrics>,
        config: OrchestratorConfig,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            runtime,
            store,
            hooks,
            metrics,
            http: reqwest::Client::new(),
            config,
            configs: RwLock::new(HashMap::new()),
            statuses: RwLock::new(HashMap::new()),
            fail_streaks: RwLock::new(HashMap::new()),
            queue_tx,
            queue_rx: AsyncMutex::new(queue_rx),
        }
    }

    // ─── Registration ───────────────────────────────────────────────────────

    /// Register (or replace) a container configuration. Idempotent on name.
    /// Rejects dependency cycles.
    pub async fn register(&self, config: ContainerConfig) -> Result<()> {
        if config.name.is_empty() || config.image.is_empty() {
            return Err(Error::Validation(
                "container config needs a name and an image".to_string(),
            ));
        }
        self.check_for_cycles(&config)?;

        if let Ok(payload) = serde_json::to_string(&config) {
            if let Err(e) = self.store.set(&keys::container(&config.name), &payload).await {
                warn!(container = %config.name, error = %e, "config persist failed");
            } else if let Err(e) = self
                .store
                .set_add(keys::CONTAINERS_INDEX, &config.name)
                .await
            {
                warn!(container = %config.name, error = %e, "config index update failed");
            }
        }

        self.statuses
            .write()
            .entry(config.name.clone())
            .or_insert_with(|| ContainerStatus::stopped(&config.name));
        info!(container = %config.name, image = %config.image, "container registered");
        self.configs.write().insert(config.name.clone(), config);
        Ok(())
    }

    /// Rehydrate configurations persisted by a previous run.
    pub async fn load_registered(&self) -> Result<usize> {
        let names = self.store.set_members(keys::CONTAINERS_INDEX).await?;
        let mut loaded = 0;
        for name in names {
            match self.store.get(&keys::container(&name)).await? {
                Some(raw) => match serde_json::from_str::<ContainerConfig>(&raw) {
                    Ok(config) => {
                        self.statuses
                            .write()
                            .entry(config.name.clone())
                            .or_insert_with(|| ContainerStatus::stopped(&config.name));
                        self.configs.write().insert(config.name.clone(), config);
                        loaded += 1;
                    }
                    Err(e) => {
                        warn!(container = %name, error = %e, "stored config is corrupt, skipping")
                    }
                },
                None => debug!(container = %name, "indexed config missing"),
            }
        }
        info!(loaded, "container configurations rehydrated");
        Ok(loaded)
    }

    /// DFS over the dependency graph including the incoming config.
    fn check_for_cycles(&self, incoming: &ContainerConfig) -> Result<()> {
        let configs = self.configs.read();
        let deps_of = |name: &str| -> Vec<String> {
            if name == incoming.name {
                incoming.dependencies.clone()
            } else {
                configs
                    .get(name)
                    .map(|c| c.dependencies.clone())
                    .unwrap_or_default()
            }
        };

        let mut stack = vec![(incoming.name.clone(), Vec::<String>::new())];
        let mut visited = HashSet::new();
        while let Some((node, path)) = stack.pop() {
            if path.contains(&node) {
                return Err(Error::Validation(format!(
                    "dependency cycle: {} -> {}",
                    path.join(" -> "),
                    node
                )));
            }
            if !visited.insert((node.clone(), path.len())) {
                continue;
            }
            let mut next_path = path.clone();
            next_path.push(node.clone());
            for dep in deps_of(&node) {
                stack.push((dep, next_path.clone()));
            }
        }
        Ok(())
    }

    // ─── Public lifecycle API ───────────────────────────────────────────────

    /// Enqueue a start intent after resolving dependencies.
    pub async fn start(&self, name: &str, force: bool) -> Result<StartOutcome> {
        let Some(config) = self.configs.read().get(name).cloned() else {
            return Err(Error::NotFound(format!("container '{name}' is not registered")));
        };

        match self.state_of(name) {
            ContainerState::Running if !force => return Ok(StartOutcome::AlreadyRunning),
            ContainerState::Starting if !force => {
                debug!(container = name, "start already in flight");
                return Ok(StartOutcome::AlreadyStarting);
            }
            _ => {}
        }

        if !config.dependencies.is_empty() {
            let deadline =
                Instant::now() + Duration::from_secs(self.config.dependency_timeout_secs);
            for dep in &config.dependencies {
                self.ensure_dependency(dep, deadline).await?;
            }
        }

        self.transition(name, ContainerState::Starting, None).await;
        match self.queue_tx.try_send(name.to_string()) {
            Ok(()) => Ok(StartOutcome::Queued),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.transition(name, ContainerState::Stopped, None).await;
                Err(Error::Conflict(
                    "startup queue is full, retry shortly".to_string(),
                ))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.transition(name, ContainerState::Stopped, None).await;
                Err(Error::Internal("startup queue is closed".to_string()))
            }
        }
    }

    /// Recursively make one dependency running, bounded by the shared
    /// deadline. Cycles were rejected at registration, so this terminates.
    fn ensure_dependency<'a>(
        &'a self,
        name: &'a str,
        deadline: Instant,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.state_of(name) == ContainerState::Running {
                return Ok(());
            }
            info!(dependency = name, "starting dependency");
            self.start(name, false).await?;

            loop {
                if self.state_of(name) == ContainerState::Running {
                    return Ok(());
                }
                if Instant::now() >= deadline {
                    return Err(Error::Timeout(format!(
                        "dependency '{name}' did not reach running in time"
                    )));
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        })
    }

    /// Stop a managed container with bounded grace.
    pub async fn stop(&self, name: &str, force: bool) -> Result<()> {
        let Some(config) = self.configs.read().get(name).cloned() else {
            return Err(Error::NotFound(format!("container '{name}' is not registered")));
        };
        if self.state_of(name) == ContainerState::Stopped {
            return Ok(());
        }

        self.metrics.hook_publishes_total.inc();
        self.hooks
            .publish(
                HookPoint::BeforeContainerStop,
                serde_json::json!({ "container": name }),
            )
            .await;

        self.transition(name, ContainerState::Stopping, None).await;
        let grace = if force { 0 } else { config.shutdown_timeout_secs };
        match self.runtime.stop(name, grace).await {
            Ok(()) | Err(Error::NotFound(_)) => {
                self.clear_container_id(name);
                self.transition(name, ContainerState::Stopped, None).await;
                self.metrics.container_stops_total.inc();
                self.metrics.hook_publishes_total.inc();
                self.hooks
                    .publish(
                        HookPoint::AfterContainerStop,
                        serde_json::json!({ "container": name }),
                    )
                    .await;
                info!(container = name, "container stopped");
                Ok(())
            }
            Err(e) => {
                self.transition(name, ContainerState::Error, Some(e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    /// Stop, small gap, start.
    pub async fn restart(&self, name: &str) -> Result<StartOutcome> {
        self.stop(name, false).await?;
        tokio::time::sleep(Duration::from_secs(2)).await;
        {
            let mut statuses = self.statuses.write();
            if let Some(status) = statuses.get_mut(name) {
                status.restart_count = status.restart_count.saturating_add(1);
            }
        }
        self.start(name, false).await
    }

    pub fn status(&self, name: &str) -> Result<ContainerStatus> {
        self.statuses
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("container '{name}' is not registered")))
    }

    pub fn all_statuses(&self) -> Vec<ContainerStatus> {
        let mut all: Vec<ContainerStatus> = self.statuses.read().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub async fn logs(&self, name: &str, lines: usize) -> Result<String> {
        let target = {
            let statuses = self.statuses.read();
            let status = statuses
                .get(name)
                .ok_or_else(|| Error::NotFound(format!("container '{name}' is not registered")))?;
            status.container_id.clone().unwrap_or_else(|| name.to_string())
        };
        self.runtime.logs(&target, lines, true).await
    }

    pub fn summary(&self) -> OrchestratorSummary {
        let statuses = self.statuses.read();
        let mut states: HashMap<String, usize> = HashMap::new();
        for status in statuses.values() {
            *states.entry(status.state.to_string()).or_default() += 1;
        }
        OrchestratorSummary {
            total_containers: statuses.len(),
            states,
            queue_depth: self
                .queue_tx
                .max_capacity()
                .saturating_sub(self.queue_tx.capacity()),
            workers: self.config.max_concurrent_starts,
        }
    }

    // ─── Startup pipeline ───────────────────────────────────────────────────

    async fn execute_startup(&self, name: &str) {
        let Some(config) = self.configs.read().get(name).cloned() else {
            warn!(container = name, "queued container lost its config");
            return;
        };

        self.metrics.container_starts_total.inc();
        self.metrics.hook_publishes_total.inc();
        self.hooks
            .publish(
                HookPoint::BeforeContainerStart,
                serde_json::json!({ "container": name }),
            )
            .await;

        match self.run_startup(&config).await {
            Ok(container_id) => {
                {
                    let mut statuses = self.statuses.write();
                    if let Some(status) = statuses.get_mut(name) {
                        status.state = ContainerState::Running;
                        status.container_id = Some(container_id.clone());
                        status.started_at = Some(Utc::now());
                        status.error_message = None;
                    }
                }
                self.persist_status(name).await;
                self.metrics.hook_publishes_total.inc();
                self.hooks
                    .publish(
                        HookPoint::AfterContainerStart,
                        serde_json::json!({ "container": name, "success": true }),
                    )
                    .await;
                info!(container = name, id = %container_id, "container started");
            }
            Err(e) => {
                self.metrics.record_start_error();
                self.transition(name, ContainerState::Error, Some(e.to_string()))
                    .await;
                self.metrics.hook_publishes_total.inc();
                self.hooks
                    .publish(
                        HookPoint::AfterContainerStart,
                        serde_json::json!({
                            "container": name,
                            "success": false,
                            "error": e.to_string(),
                        }),
                    )
                    .await;
                warn!(container = name, error = %e, "container start failed");
            }
        }
    }

    async fn run_startup(&self, config: &ContainerConfig) -> Result<String> {
        // Adopt a container the runtime already has running; clear out
        // leftovers in exited/created.
        match self.runtime.get(&config.name).await {
            Ok(existing) if existing.is_running() => {
                debug!(container = %config.name, "adopting already-running container");
                return Ok(existing.id);
            }
            Ok(existing)
                if existing.state == state::EXITED || existing.state == state::CREATED =>
            {
                self.runtime.remove(&existing.id).await?;
            }
            Ok(_) | Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let spec = ContainerSpec {
            name: config.name.clone(),
            image: config.image.clone(),
            ports: config.ports.clone(),
            environment: config.environment.clone(),
            volumes: config.volumes.clone(),
            labels: config.labels.clone(),
            restart_policy: config.restart_policy.clone(),
            auto_remove: config.auto_remove,
        };
        let id = self.runtime.create(&spec).await?;
        self.runtime.start(&id).await?;
        self.wait_until_ready(config, &id).await?;
        Ok(id)
    }

    async fn wait_until_ready(&self, config: &ContainerConfig, id: &str) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs(config.startup_timeout_secs);
        loop {
            let container = self.runtime.get(id).await?;
            if container.state == state::EXITED || container.state == state::DEAD {
                return Err(Error::Runtime(format!(
                    "container '{}' died during startup",
                    config.name
                )));
            }
            if container.is_running() {
                match &config.health_check {
                    None => return Ok(()),
                    Some(check) => {
                        if self.run_health_check(id, check).await {
                            return Ok(());
                        }
                    }
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "container '{}' not ready within {}s",
                    config.name, config.startup_timeout_secs
                )));
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    async fn run_health_check(&self, id: &str, check: &HealthCheck) -> bool {
        self.metrics.health_probes_total.inc();
        match check {
            HealthCheck::Http { url, timeout_secs } => {
                let request = self
                    .http
                    .get(url)
                    .timeout(Duration::from_secs((*timeout_secs).max(1)));
                match request.send().await {
                    Ok(response) => response.status().is_success(),
                    Err(e) => {
                        debug!(url, error = %e, "http health check failed");
                        false
                    }
                }
            }
            HealthCheck::Exec { command } => match self.runtime.exec(id, command).await {
                Ok(result) => result.exit_code == 0,
                Err(e) => {
                    debug!(error = %e, "exec health check failed");
                    false
                }
            },
        }
    }

    // ─── Health loop ────────────────────────────────────────────────────────

    /// One pass over every running managed container.
    pub async fn run_health_once(&self) {
        let running: Vec<(String, Option<String>)> = self
            .statuses
            .read()
            .values()
            .filter(|s| s.state == ContainerState::Running || s.state == ContainerState::Unhealthy)
            .map(|s| (s.name.clone(), s.container_id.clone()))
            .collect();

        for (name, container_id) in running {
            self.health_check_container(&name, container_id.as_deref())
                .await;
        }
    }

    async fn health_check_container(&self, name: &str, container_id: Option<&str>) {
        let lookup = container_id.unwrap_or(name);
        let container = match self.runtime.get(lookup).await {
            Ok(c) => c,
            Err(Error::NotFound(_)) => {
                info!(container = name, "container gone from runtime");
                self.clear_container_id(name);
                self.fail_streaks.write().remove(name);
                self.transition(name, ContainerState::Stopped, None).await;
                return;
            }
            Err(e) => {
                warn!(container = name, error = %e, "health reload failed");
                return;
            }
        };

        if !container.is_running() {
            if container.state == state::EXITED || container.state == state::CREATED {
                self.clear_container_id(name);
                self.transition(name, ContainerState::Stopped, None).await;
            } else {
                self.clear_container_id(name);
                self.transition(
                    name,
                    ContainerState::Unhealthy,
                    Some(format!("runtime state: {}", container.state)),
                )
                .await;
            }
            return;
        }

        let check = self
            .configs
            .read()
            .get(name)
            .and_then(|c| c.health_check.clone());
        let healthy = match &check {
            Some(check) => self.run_health_check(&container.id, check).await,
            None => true,
        };

        let (new_state, streak) = {
            let mut streaks = self.fail_streaks.write();
            let streak = streaks.entry(name.to_string()).or_insert(0);
            if healthy {
                *streak = 0;
            } else {
                *streak += 1;
            }
            let current = self.state_of(name);
            let new_state = if healthy {
                ContainerState::Running
            } else if *streak >= self.config.max_health_failures {
                ContainerState::Error
            } else if *streak >= 2 {
                ContainerState::Unhealthy
            } else {
                current
            };
            (new_state, *streak)
        };

        {
            let mut statuses = self.statuses.write();
            if let Some(status) = statuses.get_mut(name) {
                status.last_health_check = Some(Utc::now());
            }
        }

        let current = self.state_of(name);
        if new_state != current {
            let message = if new_state == ContainerState::Error {
                Some(format!("health check failed {streak} times"))
            } else if new_state == ContainerState::Unhealthy {
                Some("health check failing".to_string())
            } else {
                None
            };
            self.transition(name, new_state, message).await;
        } else {
            self.persist_status(name).await;
        }

        self.metrics.hook_publishes_total.inc();
        self.hooks
            .publish(
                HookPoint::OnHealthCheck,
                serde_json::json!({
                    "container": name,
                    "healthy": healthy,
                    "state": new_state,
                }),
            )
            .await;
    }

    // ─── State plumbing ─────────────────────────────────────────────────────

    fn state_of(&self, name: &str) -> ContainerState {
        self.statuses
            .read()
            .get(name)
            .map(|s| s.state)
            .unwrap_or_default()
    }

    fn clear_container_id(&self, name: &str) {
        let mut statuses = self.statuses.write();
        if let Some(status) = statuses.get_mut(name) {
            status.container_id = None;
        }
    }

    async fn transition(&self, name: &str, to: ContainerState, message: Option<String>) {
        {
            let mut statuses = self.statuses.write();
            let Some(status) = statuses.get_mut(name) else {
                return;
            };
            debug!(container = name, from = %status.state, to = %to, "state transition");
            status.state = to;
            status.error_message = message;
            if to == ContainerState::Stopped {
                status.started_at = None;
            }
        }
        self.persist_status(name).await;
    }

    /// Best-effort status snapshot for collaborators, TTL one hour.
    async fn persist_status(&self, name: &str) {
        let Some(status) = self.statuses.read().get(name).cloned() else {
            return;
        };
        let Ok(payload) = serde_json::to_string(&status) else {
            return;
        };
        if let Err(e) = self
            .store
            .set_ex(&keys::status(name), &payload, keys::STATUS_TTL_SECS)
            .await
        {
            debug!(container = name, error = %e, "status persist failed");
        }
    }

    // ─── Loops ──────────────────────────────────────────────────────────────

    /// Spawn the startup workers and the health loop.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        for worker in 0..self.config.max_concurrent_starts {
            let orchestrator = Arc::clone(self);
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                debug!(worker, "startup worker running");
                loop {
                    let intent = {
                        let mut rx = orchestrator.queue_rx.lock().await;
                        tokio::select! {
                            intent = rx.recv() => intent,
                            _ = shutdown.changed() => None,
                        }
                    };
                    let Some(name) = intent else {
                        info!(worker, "startup worker stopping");
                        break;
                    };
                    orchestrator.execute_startup(&name).await;
                }
            }));
        }

        let orchestrator = Arc::clone(self);
        let mut shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(
                orchestrator.config.health_check_interval_secs,
            ));
            loop {
                tokio::select! {
                    _ = ticker.tick() => orchestrator.run_health_once().await,
                    _ = shutdown.changed() => {
                        info!("orchestrator health loop stopping");
                        break;
                    }
                }
            }
        }));

        handles
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
