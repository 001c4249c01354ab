//! Container runtime adapter for the SelfStart control plane.
//!
//! [`ContainerRuntime`] is the opaque seam to Docker or any compatible
//! runtime. The control loops only depend on this trait; production adapters
//! live outside this workspace. [`FakeRuntime`] is a deterministic in-memory
//! implementation used by tests and dev mode.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use selfstart_proto::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use fake::FakeRuntime;

// ─── Runtime view of a container ──────────────────────────────────────────────

/// Raw runtime states, as reported by the engine.
pub mod state {
    pub const RUNNING: &str = "running";
    pub const EXITED: &str = "exited";
    pub const CREATED: &str = "created";
    pub const RESTARTING: &str = "restarting";
    pub const PAUSED: &str = "paused";
    pub const DEAD: &str = "dead";
}

/// What the runtime reports about one container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    /// Raw engine state string, see [`state`].
    pub state: String,
    pub labels: HashMap<String, String>,
    pub environment: HashMap<String, String>,
    /// network name → container IP on that network
    pub networks: HashMap<String, String>,
    pub exposed_ports: Vec<u16>,
    pub started_at: Option<DateTime<Utc>>,
}

impl RuntimeContainer {
    pub fn is_running(&self) -> bool {
        self.state == state::RUNNING
    }
}

/// Creation request handed to the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// container port → host port
    pub ports: HashMap<u16, u16>,
    pub environment: HashMap<String, String>,
    /// host path → container path
    pub volumes: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub restart_policy: String,
    pub auto_remove: bool,
}

/// Result of an in-container exec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecResult {
    pub exit_code: i64,
    pub output: String,
}

// ─── Stats (Docker Engine shape) ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CpuUsage {
    pub total_usage: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CpuStats {
    pub cpu_usage: CpuUsage,
    pub system_cpu_usage: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemoryStats {
    pub usage: u64,
    pub limit: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NetworkIo {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// One stats sample, following the Docker Engine stats field layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerStats {
    pub cpu_stats: CpuStats,
    pub precpu_stats: CpuStats,
    pub memory_stats: MemoryStats,
    pub networks: HashMap<String, NetworkIo>,
    pub read_at: DateTime<Utc>,
}

impl ContainerStats {
    /// CPU utilisation percentage over the sample window.
    pub fn cpu_percent(&self) -> f64 {
        let cpu_delta = self
            .cpu_stats
            .cpu_usage
            .total_usage
            .saturating_sub(self.precpu_stats.cpu_usage.total_usage);
        let system_delta = self
            .cpu_stats
            .system_cpu_usage
            .saturating_sub(self.precpu_stats.system_cpu_usage);
        if system_delta == 0 {
            return 0.0;
        }
        (cpu_delta as f64 / system_delta as f64) * 100.0
    }

    /// Memory utilisation percentage against the container limit.
    pub fn memory_percent(&self) -> f64 {
        if self.memory_stats.limit == 0 {
            return 0.0;
        }
        (self.memory_stats.usage as f64 / self.memory_stats.limit as f64) * 100.0
    }

    /// Cumulative (rx, tx) byte counters across all networks.
    pub fn network_totals(&self) -> (u64, u64) {
        self.networks
            .values()
            .fold((0, 0), |(rx, tx), io| (rx + io.rx_bytes, tx + io.tx_bytes))
    }
}

// ─── Runtime adapter trait ────────────────────────────────────────────────────

/// Opaque interface to a container runtime.
///
/// Every method maps to one engine RPC; callers wrap each invocation in an
/// explicit timeout. Implementations report missing containers as
/// [`Error::NotFound`] and engine failures as [`Error::Runtime`].
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// List every container the runtime knows, including stopped ones.
    async fn list_all(&self) -> Result<Vec<RuntimeContainer>>;

    /// Look a container up by name or id.
    async fn get(&self, name_or_id: &str) -> Result<RuntimeContainer>;

    /// Create a container; returns the new container id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start(&self, id: &str) -> Result<()>;

    /// Stop with a bounded grace period.
    async fn stop(&self, id: &str, timeout_secs: u64) -> Result<()>;

    async fn pause(&self, id: &str) -> Result<()>;

    async fn remove(&self, id: &str) -> Result<()>;

    async fn stats(&self, id: &str) -> Result<ContainerStats>;

    async fn logs(&self, id: &str, tail: usize, timestamps: bool) -> Result<String>;

    async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecResult>;
}

// ─── Fake runtime ─────────────────────────────────────────────────────────────

mod fake {
    use super::*;
    use parking_lot::Mutex;

    /// In-memory container under the fake runtime's control.
    #[derive(Debug, Clone)]
    pub struct FakeContainer {
        pub id: String,
        pub name: String,
        pub image: String,
        pub state: String,
        pub labels: HashMap<String, String>,
        pub environment: HashMap<String, String>,
        pub networks: HashMap<String, String>,
        pub exposed_ports: Vec<u16>,
        pub started_at: Option<DateTime<Utc>>,
        pub stats: ContainerStats,
        pub exec_exit_code: i64,
        pub logs: String,
    }

    #[derive(Default)]
    struct FakeInner {
        containers: HashMap<String, FakeContainer>,
        next_id: u64,
        /// Names whose next start call fails.
        fail_start: Vec<String>,
    }

    /// Deterministic in-memory [`ContainerRuntime`] for tests and dev mode.
    ///
    /// State transitions are immediate: `create` leaves the container in
    /// `created`, `start` moves it to `running`, `stop` to `exited`.
    #[derive(Default)]
    pub struct FakeRuntime {
        inner: Mutex<FakeInner>,
    }

    impl FakeRuntime {
        pub fn new() -> Self {
            Self::default()
        }

        /// Seed a container already in `running` state.
        pub fn add_running(&self, name: &str, labels: HashMap<String, String>) -> String {
            let mut inner = self.inner.lock();
            inner.next_id += 1;
            let id = format!("fake-{:08x}", inner.next_id);
            inner.containers.insert(
                name.to_string(),
                FakeContainer {
                    id: id.clone(),
                    name: name.to_string(),
                    image: format!("{name}:latest"),
                    state: state::RUNNING.to_string(),
                    labels,
                    environment: HashMap::new(),
                    networks: HashMap::from([(
                        "selfstart_net".to_string(),
                        "172.20.0.2".to_string(),
                    )]),
                    exposed_ports: Vec::new(),
                    started_at: Some(Utc::now()),
                    stats: zero_stats(),
                    exec_exit_code: 0,
                    logs: String::new(),
                },
            );
            id
        }

        /// Force a state, e.g. to simulate an engine-side crash.
        pub fn set_state(&self, name: &str, new_state: &str) {
            let mut inner = self.inner.lock();
            if let Some(c) = inner.containers.get_mut(name) {
                c.state = new_state.to_string();
            }
        }

        /// Drop a container entirely, as if removed outside the control plane.
        pub fn remove_container(&self, name: &str) {
            self.inner.lock().containers.remove(name);
        }

        pub fn set_stats(&self, name: &str, stats: ContainerStats) {
            let mut inner = self.inner.lock();
            if let Some(c) = inner.containers.get_mut(name) {
                c.stats = stats;
            }
        }

        pub fn set_started_at(&self, name: &str, at: DateTime<Utc>) {
            let mut inner = self.inner.lock();
            if let Some(c) = inner.containers.get_mut(name) {
                c.started_at = Some(at);
            }
        }

        pub fn set_exec_exit(&self, name: &str, code: i64) {
            let mut inner = self.inner.lock();
            if let Some(c) = inner.containers.get_mut(name) {
                c.exec_exit_code = code;
            }
        }

        pub fn set_logs(&self, name: &str, logs: &str) {
            let mut inner = self.inner.lock();
            if let Some(c) = inner.containers.get_mut(name) {
                c.logs = logs.to_string();
            }
        }

        /// Make the next `start` of `name` fail with a runtime error.
        pub fn fail_next_start(&self, name: &str) {
            self.inner.lock().fail_start.push(name.to_string());
        }

        pub fn state_of(&self, name: &str) -> Option<String> {
            self.inner
                .lock()
                .containers
                .get(name)
                .map(|c| c.state.clone())
        }

        fn view(c: &FakeContainer) -> RuntimeContainer {
            RuntimeContainer {
                id: c.id.clone(),
                name: c.name.clone(),
                image: c.image.clone(),
                state: c.state.clone(),
                labels: c.labels.clone(),
                environment: c.environment.clone(),
                networks: c.networks.clone(),
                exposed_ports: c.exposed_ports.clone(),
                started_at: c.started_at,
            }
        }
    }

    fn find_mut<'a>(
        inner: &'a mut FakeInner,
        name_or_id: &str,
    ) -> Option<&'a mut FakeContainer> {
        if inner.containers.contains_key(name_or_id) {
            return inner.containers.get_mut(name_or_id);
        }
        inner
            .containers
            .values_mut()
            .find(|c| c.id == name_or_id)
    }

    /// A zeroed stats sample.
    pub fn zero_stats() -> ContainerStats {
        ContainerStats {
            cpu_stats: CpuStats::default(),
            precpu_stats: CpuStats::default(),
            memory_stats: MemoryStats::default(),
            networks: HashMap::new(),
            read_at: Utc::now(),
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn list_all(&self) -> Result<Vec<RuntimeContainer>> {
            let inner = self.inner.lock();
            let mut all: Vec<RuntimeContainer> =
                inner.containers.values().map(Self::view).collect();
            all.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(all)
        }

        async fn get(&self, name_or_id: &str) -> Result<RuntimeContainer> {
            let mut inner = self.inner.lock();
            find_mut(&mut inner, name_or_id)
                .map(|c| Self::view(c))
                .ok_or_else(|| Error::NotFound(format!("container '{name_or_id}'")))
        }

        async fn create(&self, spec: &ContainerSpec) -> Result<String> {
            let mut inner = self.inner.lock();
            if inner.containers.contains_key(&spec.name) {
                return Err(Error::Conflict(format!(
                    "container '{}' already exists",
                    spec.name
                )));
            }
            inner.next_id += 1;
            let id = format!("fake-{:08x}", inner.next_id);
            inner.containers.insert(
                spec.name.clone(),
                FakeContainer {
                    id: id.clone(),
                    name: spec.name.clone(),
                    image: spec.image.clone(),
                    state: state::CREATED.to_string(),
                    labels: spec.labels.clone(),
                    environment: spec.environment.clone(),
                    networks: HashMap::from([(
                        "selfstart_net".to_string(),
                        "172.20.0.2".to_string(),
                    )]),
                    exposed_ports: spec.ports.keys().copied().collect(),
                    started_at: None,
                    stats: zero_stats(),
                    exec_exit_code: 0,
                    logs: String::new(),
                },
            );
            Ok(id)
        }

        async fn start(&self, id: &str) -> Result<()> {
            let mut inner = self.inner.lock();
            if let Some(pos) = {
                let name = find_mut(&mut inner, id).map(|c| c.name.clone());
                name.and_then(|n| inner.fail_start.iter().position(|f| *f == n))
            } {
                inner.fail_start.remove(pos);
                return Err(Error::Runtime("injected start failure".to_string()));
            }
            let c = find_mut(&mut inner, id)
                .ok_or_else(|| Error::NotFound(format!("container '{id}'")))?;
            c.state = state::RUNNING.to_string();
            c.started_at = Some(Utc::now());
            Ok(())
        }

        async fn stop(&self, id: &str, _timeout_secs: u64) -> Result<()> {
            let mut inner = self.inner.lock();
            let c = find_mut(&mut inner, id)
                .ok_or_else(|| Error::NotFound(format!("container '{id}'")))?;
            c.state = state::EXITED.to_string();
            c.started_at = None;
            Ok(())
        }

        async fn pause(&self, id: &str) -> Result<()> {
            let mut inner = self.inner.lock();
            let c = find_mut(&mut inner, id)
                .ok_or_else(|| Error::NotFound(format!("container '{id}'")))?;
            c.state = state::PAUSED.to_string();
            Ok(())
        }

        async fn remove(&self, id: &str) -> Result<()> {
            let mut inner = self.inner.lock();
            let name = find_mut(&mut inner, id)
                .map(|c| c.name.clone())
                .ok_or_else(|| Error::NotFound(format!("container '{id}'")))?;
            inner.containers.remove(&name);
            Ok(())
        }

        async fn stats(&self, id: &str) -> Result<ContainerStats> {
            let mut inner = self.inner.lock();
            find_mut(&mut inner, id)
                .map(|c| c.stats.clone())
                .ok_or_else(|| Error::NotFound(format!("container '{id}'")))
        }

        async fn logs(&self, id: &str, tail: usize, _timestamps: bool) -> Result<String> {
            let mut inner = self.inner.lock();
            let c = find_mut(&mut inner, id)
                .ok_or_else(|| Error::NotFound(format!("container '{id}'")))?;
            let lines: Vec<&str> = c.logs.lines().collect();
            let start = lines.len().saturating_sub(tail);
            Ok(lines[start..].join("\n"))
        }

        async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecResult> {
            let mut inner = self.inner.lock();
            let c = find_mut(&mut inner, id)
                .ok_or_else(|| Error::NotFound(format!("container '{id}'")))?;
            Ok(ExecResult {
                exit_code: c.exec_exit_code,
                output: format!("exec: {}", cmd.join(" ")),
            })
        }
    }
}

/// Build a stats sample from raw counter values, for tests and fakes.
pub fn stats_sample(
    cpu_total: u64,
    pre_cpu_total: u64,
    system_total: u64,
    pre_system_total: u64,
    mem_usage: u64,
    mem_limit: u64,
    rx_bytes: u64,
    tx_bytes: u64,
) -> ContainerStats {
    ContainerStats {
        cpu_stats: CpuStats {
            cpu_usage: CpuUsage {
                total_usage: cpu_total,
            },
            system_cpu_usage: system_total,
        },
        precpu_stats: CpuStats {
            cpu_usage: CpuUsage {
                total_usage: pre_cpu_total,
            },
            system_cpu_usage: pre_system_total,
        },
        memory_stats: MemoryStats {
            usage: mem_usage,
            limit: mem_limit,
        },
        networks: HashMap::from([(
            "eth0".to_string(),
            NetworkIo {
                rx_bytes,
                tx_bytes,
            },
        )]),
        read_at: Utc::now(),
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_percent_derivation() {
        // 25 CPU units out of 100 system units over the window
        let stats = stats_sample(125, 100, 1100, 1000, 0, 0, 0, 0);
        assert!((stats.cpu_percent() - 25.0).abs() < 0.001);
    }

    #[test]
    fn test_cpu_percent_zero_system_delta() {
        let stats = stats_sample(125, 100, 1000, 1000, 0, 0, 0, 0);
        assert_eq!(stats.cpu_percent(), 0.0);
    }

    #[test]
    fn test_memory_percent() {
        let stats = stats_sample(0, 0, 0, 0, 512, 1024, 0, 0);
        assert!((stats.memory_percent() - 50.0).abs() < 0.001);

        let unlimited = stats_sample(0, 0, 0, 0, 512, 0, 0, 0);
        assert_eq!(unlimited.memory_percent(), 0.0);
    }

    #[test]
    fn test_network_totals_sum_all_interfaces() {
        let mut stats = stats_sample(0, 0, 0, 0, 0, 0, 100, 200);
        stats.networks.insert(
            "eth1".to_string(),
            NetworkIo {
                rx_bytes: 10,
                tx_bytes: 20,
            },
        );
        assert_eq!(stats.network_totals(), (110, 220));
    }

    #[tokio::test]
    async fn test_fake_lifecycle() {
        let rt = FakeRuntime::new();
        let spec = ContainerSpec {
            name: "db".to_string(),
            image: "postgres:16".to_string(),
            ports: HashMap::from([(5432, 5432)]),
            environment: HashMap::new(),
            volumes: HashMap::new(),
            labels: HashMap::new(),
            restart_policy: "unless-stopped".to_string(),
            auto_remove: false,
        };

        let id = rt.create(&spec).await.expect("create");
        assert_eq!(rt.get("db").await.expect("get").state, state::CREATED);

        rt.start(&id).await.expect("start");
        let c = rt.get("db").await.expect("get");
        assert!(c.is_running());
        assert!(c.started_at.is_some());

        rt.stop(&id, 30).await.expect("stop");
        assert_eq!(rt.get("db").await.expect("get").state, state::EXITED);

        rt.remove(&id).await.expect("remove");
        assert!(matches!(rt.get("db").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_fake_lookup_by_id_or_name() {
        let rt = FakeRuntime::new();
        let id = rt.add_running("cache", HashMap::new());
        assert_eq!(rt.get("cache").await.expect("by name").id, id);
        assert_eq!(rt.get(&id).await.expect("by id").name, "cache");
    }

    #[tokio::test]
    async fn test_fake_create_conflict() {
        let rt = FakeRuntime::new();
        rt.add_running("db", HashMap::new());
        let spec = ContainerSpec {
            name: "db".to_string(),
            image: "postgres:16".to_string(),
            ports: HashMap::new(),
            environment: HashMap::new(),
            volumes: HashMap::new(),
            labels: HashMap::new(),
            restart_policy: "no".to_string(),
            auto_remove: false,
        };
        assert!(matches!(rt.create(&spec).await, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn test_fake_injected_start_failure() {
        let rt = FakeRuntime::new();
        rt.add_running("app", HashMap::new());
        rt.set_state("app", state::EXITED);
        rt.fail_next_start("app");

        assert!(rt.start("app").await.is_err());
        // Injection is one-shot
        assert!(rt.start("app").await.is_ok());
    }

    #[tokio::test]
    async fn test_fake_logs_tail() {
        let rt = FakeRuntime::new();
        rt.add_running("app", HashMap::new());
        rt.set_logs("app", "one\ntwo\nthree\nfour");

        let tail = rt.logs("app", 2, false).await.expect("logs");
        assert_eq!(tail, "three\nfour");
    }

    #[tokio::test]
    async fn test_fake_exec_exit_code() {
        let rt = FakeRuntime::new();
        rt.add_running("app", HashMap::new());
        rt.set_exec_exit("app", 7);

        let result = rt
            .exec("app", &["sh".to_string(), "-c".to_string(), "check".to_string()])
            .await
            .expect("exec");
        assert_eq!(result.exit_code, 7);
    }
}
