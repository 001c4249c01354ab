//! Label-driven service discovery for the SelfStart control plane.
//!
//! Three cooperative loops keep a TTL-bounded view of the services running
//! on the container runtime:
//! - the discovery loop scans containers carrying `selfstart.enable=true`
//!   and upserts [`Service`] records into the registry store;
//! - the health loop probes every endpoint's health path and maintains the
//!   health score;
//! - the cleanup loop evicts services not seen for `service_ttl`.
//!
//! Runtime and store errors are logged and absorbed; each loop continues on
//! its own cadence and republishes once the dependency recovers.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use selfstart_hooks::HookBus;
use selfstart_observe::OperationsMetrics;
use selfstart_proto::{
    Endpoint, HookPoint, Result, Service, ServiceKind, ServiceStatus, keys, labels,
};
use selfstart_runtime::{ContainerRuntime, RuntimeContainer, state};
use selfstart_store::RegistryStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ─── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub discovery_interval_secs: u64,
    pub health_check_interval_secs: u64,
    pub service_ttl_secs: u64,
    pub probe_timeout_secs: u64,
    /// Substring identifying the project network; a container IP on such a
    /// network is preferred over the container name for endpoint hosts.
    pub network_marker: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            discovery_interval_secs: 30,
            health_check_interval_secs: 60,
            service_ttl_secs: 300,
            probe_timeout_secs: 5,
            network_marker: "selfstart".to_string(),
        }
    }
}

/// Snapshot of the discovery view, for status endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySummary {
    pub total_services: usize,
    pub healthy_services: usize,
    pub running_services: usize,
    pub services_by_type: HashMap<String, usize>,
    pub last_discovery: Option<DateTime<Utc>>,
}

// ─── Engine ───────────────────────────────────────────────────────────────────

pub struct DiscoveryEngine {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn RegistryStore>,
    hooks: Arc<HookBus>,
    metrics: Arc<OperationsMetrics>,
    http: reqwest::Client,
    config: DiscoveryConfig,
    services: RwLock<HashMap<String, Service>>,
    last_discovery: RwLock<Option<DateTime<Utc>>>,
}

impl DiscoveryEngine {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn RegistryStore>,
        hooks: Arc<HookBus>,
        metrics: Arc<OperationsMetrics>,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            runtime,
            store,
            hooks,
            metrics,
            http: reqwest::Client::new(),
            config,
            services: RwLock::new(HashMap::new()),
            last_discovery: RwLock::new(None),
        }
    }

    // ─── Discovery cycle ────────────────────────────────────────────────────

    /// One discovery pass: scan the runtime, rebuild the local view, upsert
    /// every service into the store. Returns the number of services found.
    pub async fn discover_once(&self) -> Result<usize> {
        let containers = self.runtime.list_all().await.inspect_err(|_| {
            self.metrics.discovery_errors.inc();
        })?;

        let mut discovered: HashMap<String, Service> = HashMap::new();
        for container in &containers {
            if !labels::is_enabled(&container.labels) {
                continue;
            }
            match self.build_service(container) {
                Ok(service) => {
                    self.store_service(&service).await;
                    discovered.insert(service.name.clone(), service);
                }
                Err(e) => {
                    warn!(container = %container.name, error = %e, "skipping undiscoverable container");
                }
            }
        }

        let count = discovered.len();
        *self.services.write() = discovered;
        *self.last_discovery.write() = Some(Utc::now());
        self.metrics.discovery_cycles_total.inc();

        self.metrics.hook_publishes_total.inc();
        self.hooks
            .publish(
                HookPoint::OnServiceDiscovery,
                serde_json::json!({ "services": count }),
            )
            .await;

        info!(services = count, "discovery cycle complete");
        Ok(count)
    }

    fn build_service(&self, container: &RuntimeContainer) -> Result<Service> {
        let parsed = labels::parse(&container.labels)?;
        let status = map_status(&container.state);
        let host = self.resolve_host(container);

        let mut endpoints = vec![Endpoint {
            protocol: parsed.protocol.clone(),
            host: host.clone(),
            port: parsed.port,
            path: parsed.path.clone(),
            health_path: parsed.health_path.clone(),
        }];
        for port in &container.exposed_ports {
            if *port != parsed.port {
                endpoints.push(Endpoint {
                    protocol: "http".to_string(),
                    host: host.clone(),
                    port: *port,
                    ..Endpoint::default()
                });
            }
        }

        let now = Utc::now();
        // Keep the original discovery time across rediscoveries.
        let created_at = self
            .services
            .read()
            .get(&container.name)
            .map(|s| s.created_at)
            .unwrap_or(now);

        let service = Service {
            name: container.name.clone(),
            container_id: short_id(&container.id),
            image: container.image.clone(),
            status,
            service_type: parsed.service_type,
            endpoints,
            labels: container.labels.clone(),
            dependencies: parsed.dependencies,
            environment: container.environment.clone(),
            created_at,
            last_seen: now,
            health_score: 1.0,
            auto_scale_enabled: parsed.auto_scale,
            min_replicas: parsed.min_replicas,
            max_replicas: parsed.max_replicas,
        };
        service.validate()?;
        Ok(service)
    }

    fn resolve_host(&self, container: &RuntimeContainer) -> String {
        let marker = self.config.network_marker.to_lowercase();
        for (network, ip) in &container.networks {
            if network.to_lowercase().contains(&marker) && !ip.is_empty() {
                return ip.clone();
            }
        }
        container.name.clone()
    }

    // ─── Health cycle ───────────────────────────────────────────────────────

    /// One health pass over every known service.
    pub async fn check_health_once(&self) {
        let snapshot: Vec<Service> = self.services.read().values().cloned().collect();

        for service in snapshot {
            let total = service.endpoints.len();
            let mut healthy = 0usize;
            for endpoint in &service.endpoints {
                self.metrics.health_probes_total.inc();
                if self.probe(&endpoint.health_url()).await {
                    healthy += 1;
                }
            }
            let score = if total > 0 {
                healthy as f64 / total as f64
            } else {
                0.0
            };

            let updated = {
                let mut services = self.services.write();
                let Some(entry) = services.get_mut(&service.name) else {
                    continue;
                };
                entry.health_score = score;
                if score == 0.0 && entry.status == ServiceStatus::Running {
                    info!(service = %entry.name, "service unhealthy: all probes failed");
                    entry.status = ServiceStatus::Unhealthy;
                } else if score > 0.0 && entry.status == ServiceStatus::Unhealthy {
                    info!(service = %entry.name, score, "service recovered");
                    entry.status = ServiceStatus::Running;
                }
                entry.last_seen = Utc::now();
                entry.clone()
            };

            self.store_service(&updated).await;
            self.metrics.hook_publishes_total.inc();
            self.hooks
                .publish(
                    HookPoint::OnHealthCheck,
                    serde_json::json!({
                        "service": updated.name,
                        "health_score": updated.health_score,
                        "status": updated.status,
                    }),
                )
                .await;
        }
    }

    async fn probe(&self, url: &str) -> bool {
        let request = self
            .http
            .get(url)
            .timeout(Duration::from_secs(self.config.probe_timeout_secs));
        match request.send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(url, error = %e, "health probe failed");
                false
            }
        }
    }

    // ─── Cleanup cycle ──────────────────────────────────────────────────────

    /// Evict services whose `last_seen` is older than the service TTL.
    /// Returns the evicted names.
    pub async fn cleanup_once(&self) -> Vec<String> {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.config.service_ttl_secs as i64);
        let stale: Vec<String> = self
            .services
            .read()
            .values()
            .filter(|s| s.last_seen < cutoff)
            .map(|s| s.name.clone())
            .collect();

        for name in &stale {
            self.services.write().remove(name);
            if let Err(e) = self.store.delete(&keys::service(name)).await {
                warn!(service = %name, error = %e, "store delete failed");
            }
            if let Err(e) = self.store.set_remove(keys::SERVICES_INDEX, name).await {
                warn!(service = %name, error = %e, "store index update failed");
            }
        }

        if !stale.is_empty() {
            info!(evicted = stale.len(), "evicted stale services");
        }
        stale
    }

    // ─── Store plumbing ─────────────────────────────────────────────────────

    /// Best-effort upsert; store failures degrade to the in-memory view.
    async fn store_service(&self, service: &Service) {
        let payload = match serde_json::to_string(service) {
            Ok(p) => p,
            Err(e) => {
                warn!(service = %service.name, error = %e, "service encode failed");
                return;
            }
        };
        let key = keys::service(&service.name);
        if let Err(e) = self
            .store
            .set_ex(&key, &payload, self.config.service_ttl_secs)
            .await
        {
            warn!(service = %service.name, error = %e, "store upsert failed, keeping in-memory view");
            return;
        }
        if let Err(e) = self.store.set_add(keys::SERVICES_INDEX, &service.name).await {
            warn!(service = %service.name, error = %e, "store index update failed");
        }
    }

    // ─── Public view ────────────────────────────────────────────────────────

    /// Local view first, store second.
    pub async fn get_service(&self, name: &str) -> Option<Service> {
        if let Some(service) = self.services.read().get(name).cloned() {
            return Some(service);
        }
        match self.store.get(&keys::service(name)).await {
            Ok(Some(raw)) => serde_json::from_str(&raw)
                .inspect_err(|e| warn!(service = name, error = %e, "stored service is corrupt"))
                .ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(service = name, error = %e, "store read failed");
                None
            }
        }
    }

    pub fn all_services(&self) -> Vec<Service> {
        let mut services: Vec<Service> = self.services.read().values().cloned().collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        services
    }

    pub fn services_by_type(&self, kind: ServiceKind) -> Vec<Service> {
        self.all_services()
            .into_iter()
            .filter(|s| s.service_type == kind)
            .collect()
    }

    pub fn healthy_services(&self) -> Vec<Service> {
        self.all_services()
            .into_iter()
            .filter(|s| s.health_score > 0.5)
            .collect()
    }

    /// Services that list `name` among their dependencies.
    pub fn dependents_of(&self, name: &str) -> Vec<Service> {
        self.all_services()
            .into_iter()
            .filter(|s| s.dependencies.iter().any(|d| d == name))
            .collect()
    }

    /// Register a service that discovery would not find on its own.
    pub async fn register_manual(&self, service: Service) -> Result<()> {
        service.validate()?;
        info!(service = %service.name, "service registered manually");
        self.store_service(&service).await;
        self.services
            .write()
            .insert(service.name.clone(), service);
        Ok(())
    }

    pub async fn unregister(&self, name: &str) -> Result<()> {
        self.services.write().remove(name);
        self.store.delete(&keys::service(name)).await?;
        self.store.set_remove(keys::SERVICES_INDEX, name).await?;
        info!(service = name, "service unregistered");
        Ok(())
    }

    pub fn summary(&self) -> DiscoverySummary {
        let services = self.services.read();
        let mut by_type: HashMap<String, usize> = HashMap::new();
        for service in services.values() {
            *by_type.entry(service.service_type.to_string()).or_default() += 1;
        }
        DiscoverySummary {
            total_services: services.len(),
            healthy_services: services.values().filter(|s| s.health_score > 0.5).count(),
            running_services: services
                .values()
                .filter(|s| s.status == ServiceStatus::Running)
                .count(),
            services_by_type: by_type,
            last_discovery: *self.last_discovery.read(),
        }
    }

    // ─── Loops ──────────────────────────────────────────────────────────────

    /// Spawn the three cooperative loops. They stop when `shutdown` flips.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let discovery = {
            let engine = Arc::clone(self);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(Duration::from_secs(engine.config.discovery_interval_secs));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = engine.discover_once().await {
                                warn!(error = %e, "discovery cycle failed");
                            }
                        }
                        _ = shutdown.changed() => {
                            info!("discovery loop stopping");
                            break;
                        }
                    }
                }
            })
        };

        let health = {
            let engine = Arc::clone(self);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(
                    engine.config.health_check_interval_secs,
                ));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => engine.check_health_once().await,
                        _ = shutdown.changed() => {
                            info!("discovery health loop stopping");
                            break;
                        }
                    }
                }
            })
        };

        let cleanup = {
            let engine = Arc::clone(self);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(Duration::from_secs(engine.config.service_ttl_secs));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            engine.cleanup_once().await;
                        }
                        _ = shutdown.changed() => {
                            info!("discovery cleanup loop stopping");
                            break;
                        }
                    }
                }
            })
        };

        vec![discovery, health, cleanup]
    }
}

fn map_status(raw: &str) -> ServiceStatus {
    match raw {
        state::RUNNING => ServiceStatus::Running,
        state::EXITED | state::CREATED | state::PAUSED => ServiceStatus::Stopped,
        state::RESTARTING => ServiceStatus::Starting,
        state::DEAD => ServiceStatus::Unhealthy,
        _ => ServiceStatus::Unknown,
    }
}

fn short_id(id: &str) -> String {
    id.chars().take(12).collect()
}

// ─── Tests ────────────────────────────────────────────────────────────────────
