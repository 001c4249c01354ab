//! Subsystem wiring and lifecycle for the control-plane daemon.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use selfstart_discovery::DiscoveryEngine;
use selfstart_hooks::HookBus;
use selfstart_observe::{MetricsExporter, OperationsMetrics};
use selfstart_orchestrator::Orchestrator;
use selfstart_proto::Result as ProtoResult;
use selfstart_proxy::ReverseProxy;
use selfstart_runtime::{ContainerRuntime, FakeRuntime};
use selfstart_scaler::{AutoScaler, NoAppMetrics, ScaleExecutor};
use selfstart_shutdown::{RuleStore, ShutdownEngine, StaticActivity};
use selfstart_store::{MemoryStore, RedisStore, RegistryStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::DaemonConfig;
use crate::error::{DaemonError, DaemonResult};

// ─── Scale executor ───────────────────────────────────────────────────────────

/// Converges replica targets through the orchestrator.
///
/// The runtime layer manages one named container per service, so replicas
/// beyond one are recorded by the scaler but map onto "keep it running".
pub struct OrchestratorScaleExecutor {
    orchestrator: Arc<Orchestrator>,
}

impl OrchestratorScaleExecutor {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl ScaleExecutor for OrchestratorScaleExecutor {
    async fn scale_to(&self, service: &str, replicas: u32) -> ProtoResult<()> {
        if replicas == 0 {
            self.orchestrator.stop(service, false).await
        } else {
            self.orchestrator.start(service, false).await.map(|_| ())
        }
    }
}

// ─── Daemon ───────────────────────────────────────────────────────────────────

pub struct Daemon {
    pub config: DaemonConfig,
    pub store: Arc<dyn RegistryStore>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub hooks: Arc<HookBus>,
    pub metrics: Arc<OperationsMetrics>,
    pub discovery: Arc<DiscoveryEngine>,
    pub orchestrator: Arc<Orchestrator>,
    pub proxy: Arc<ReverseProxy>,
    pub scaler: Arc<AutoScaler>,
    pub shutdown_engine: Arc<ShutdownEngine>,
    pub rules: Arc<RuleStore>,
    activity: Arc<StaticActivity>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Daemon {
    /// Build against the runtime chosen by the config: dev mode embeds the
    /// in-memory runtime; otherwise an external adapter must be supplied
    /// via [`Daemon::with_runtime`].
    pub async fn build(config: DaemonConfig) -> DaemonResult<Self> {
        if !config.dev_mode {
            return Err(DaemonError::RuntimeUnreachable(
                "no container runtime adapter configured; set DEV_MODE=true or embed one with Daemon::with_runtime".to_string(),
            ));
        }
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(FakeRuntime::new());
        Self::with_runtime(config, runtime).await
    }

    /// Build with an externally supplied runtime adapter.
    pub async fn with_runtime(
        config: DaemonConfig,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> DaemonResult<Self> {
        let store = connect_store(&config).await?;
        Ok(Self::assemble(config, store, runtime))
    }

    fn assemble(
        config: DaemonConfig,
        store: Arc<dyn RegistryStore>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        let hooks = Arc::new(HookBus::new());
        let metrics = Arc::new(OperationsMetrics::new());

        let discovery = Arc::new(DiscoveryEngine::new(
            Arc::clone(&runtime),
            Arc::clone(&store),
            Arc::clone(&hooks),
            Arc::clone(&metrics),
            config.discovery.clone(),
        ));

        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&runtime),
            Arc::clone(&store),
            Arc::clone(&hooks),
            Arc::clone(&metrics),
            config.orchestrator.clone(),
        ));

        let proxy = Arc::new(ReverseProxy::new(
            Arc::clone(&store),
            Arc::clone(&hooks),
            Arc::clone(&metrics),
            config.proxy.clone(),
        ));

        let executor: Arc<dyn ScaleExecutor> =
            Arc::new(OrchestratorScaleExecutor::new(Arc::clone(&orchestrator)));

        let scaler = Arc::new(AutoScaler::new(
            Arc::clone(&discovery),
            Arc::clone(&runtime),
            Arc::clone(&store),
            Arc::clone(&hooks),
            Arc::clone(&metrics),
            Arc::clone(&executor),
            Arc::new(NoAppMetrics),
            config.scaler.clone(),
        ));

        let rules = Arc::new(RuleStore::open(&config.state_path));
        let activity = Arc::new(StaticActivity::new());
        let shutdown_engine = Arc::new(ShutdownEngine::new(
            Arc::clone(&runtime),
            Arc::clone(&rules),
            Arc::clone(&hooks),
            Arc::clone(&metrics),
            Arc::clone(&activity) as Arc<dyn selfstart_shutdown::ActivitySource>,
            executor,
            config.shutdown.clone(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            store,
            runtime,
            hooks,
            metrics,
            discovery,
            orchestrator,
            proxy,
            scaler,
            shutdown_engine,
            rules,
            activity,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Reload durable state persisted by a previous run.
    pub async fn rehydrate(&self) {
        if let Err(e) = self.orchestrator.load_registered().await {
            warn!(error = %e, "container config rehydration failed");
        }
        if let Err(e) = self.scaler.load_policies().await {
            warn!(error = %e, "scaling policy rehydration failed");
        }
    }

    /// Spawn every control loop. They stop when [`Daemon::trigger_shutdown`]
    /// fires.
    pub fn spawn_all(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        handles.extend(self.discovery.spawn(self.shutdown_rx.clone()));
        handles.extend(self.orchestrator.spawn(self.shutdown_rx.clone()));
        handles.extend(self.proxy.spawn(self.shutdown_rx.clone()));
        handles.extend(self.scaler.spawn(self.shutdown_rx.clone()));
        handles.extend(self.shutdown_engine.spawn(self.shutdown_rx.clone()));
        handles.push(self.spawn_activity_sync());
        info!(loops = handles.len(), "control loops running");
        handles
    }

    /// Feed the proxy's live connection gauges into the shutdown engine's
    /// activity view.
    fn spawn_activity_sync(&self) -> JoinHandle<()> {
        let proxy = Arc::clone(&self.proxy);
        let activity = Arc::clone(&self.activity);
        let mut shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let mut last_active: HashMap<String, DateTime<Utc>> = HashMap::new();
            let mut ticker = tokio::time::interval(Duration::from_secs(15));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for name in proxy.target_names() {
                            let Ok(status) = proxy.target_status(&name) else {
                                continue;
                            };
                            let connections: u32 = status
                                .backends
                                .iter()
                                .map(|b| b.current_connections)
                                .sum();
                            if connections > 0 {
                                let now = Utc::now();
                                last_active.insert(name.clone(), now);
                                activity.set(&name, connections, now);
                            } else if let Some(at) = last_active.get(&name) {
                                activity.set(&name, 0, *at);
                            }
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Prometheus text exposition of the operation counters.
    pub fn render_metrics(&self) -> String {
        MetricsExporter::new(Arc::clone(&self.metrics)).render()
    }

    /// Run until interrupted, then drain the loops.
    pub async fn run(&self) -> DaemonResult<()> {
        self.rehydrate().await;
        let handles = self.spawn_all();

        tokio::signal::ctrl_c()
            .await
            .map_err(|e| DaemonError::Other(format!("signal handler: {e}")))?;
        info!("interrupt received, draining control loops");
        self.trigger_shutdown();

        for handle in handles {
            if tokio::time::timeout(Duration::from_secs(10), handle)
                .await
                .is_err()
            {
                warn!("a control loop did not stop within the drain deadline");
            }
        }
        Ok(())
    }
}

async fn connect_store(config: &DaemonConfig) -> DaemonResult<Arc<dyn RegistryStore>> {
    match &config.redis_url {
        Some(url) => {
            let store = RedisStore::connect(url)
                .await
                .map_err(|e| DaemonError::StoreUnreachable(e.to_string()))?;
            store
                .ping()
                .await
                .map_err(|e| DaemonError::StoreUnreachable(e.to_string()))?;
            info!(url = %url, "registry store connected");
            Ok(Arc::new(store))
        }
        None => {
            info!("no REDIS_URL, using in-memory registry store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use selfstart_proto::{ContainerConfig, ContainerState};

    fn test_config(dir: &std::path::Path) -> DaemonConfig {
        DaemonConfig {
            dev_mode: true,
            state_path: dir.to_path_buf(),
            ..DaemonConfig::default()
        }
    }

    #[tokio::test]
    async fn test_build_requires_runtime_outside_dev_mode() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = test_config(dir.path());
        config.dev_mode = false;

        let err = Daemon::build(config).await;
        match err {
            Err(e @ DaemonError::RuntimeUnreachable(_)) => assert_eq!(e.exit_code(), 3),
            other => panic!("expected runtime error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_dev_mode_builds_with_memory_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let daemon = Daemon::build(test_config(dir.path())).await.expect("build");

        assert!(daemon.discovery.all_services().is_empty());
        assert!(daemon.render_metrics().contains("selfstart_proxy_requests_total 0"));
    }

    #[tokio::test]
    async fn test_scale_executor_maps_replicas_to_lifecycle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let daemon = Daemon::build(test_config(dir.path())).await.expect("build");
        let handles = daemon.spawn_all();

        daemon
            .orchestrator
            .register(ContainerConfig::new("app", "app:latest"))
            .await
            .expect("register");

        let executor = OrchestratorScaleExecutor::new(Arc::clone(&daemon.orchestrator));
        executor.scale_to("app", 1).await.expect("scale up");

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let status = daemon.orchestrator.status("app").expect("status");
            if status.state == ContainerState::Running {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "stuck in {:?}", status.state);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        executor.scale_to("app", 0).await.expect("scale down");
        assert_eq!(
            daemon.orchestrator.status("app").expect("status").state,
            ContainerState::Stopped
        );

        daemon.trigger_shutdown();
        for handle in handles {
            let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        }
    }
}
