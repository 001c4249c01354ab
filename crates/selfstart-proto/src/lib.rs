//! Shared data model for the SelfStart control plane.
//!
//! Defines the entities exchanged between the discovery engine, the
//! orchestrator, the reverse proxy, the auto-scaler and the auto-shutdown
//! engine, plus the label grammar and the store key namespace.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub use error::{Error, Result};

// ─── Service model ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Running,
    Starting,
    Stopped,
    Unhealthy,
    #[default]
    Unknown,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Starting => write!(f, "starting"),
            Self::Stopped => write!(f, "stopped"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    #[default]
    Web,
    Api,
    Database,
    Cache,
    Queue,
    Monitoring,
    Utility,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 7] = [
        Self::Web,
        Self::Api,
        Self::Database,
        Self::Cache,
        Self::Queue,
        Self::Monitoring,
        Self::Utility,
    ];
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Web => write!(f, "web"),
            Self::Api => write!(f, "api"),
            Self::Database => write!(f, "database"),
            Self::Cache => write!(f, "cache"),
            Self::Queue => write!(f, "queue"),
            Self::Monitoring => write!(f, "monitoring"),
            Self::Utility => write!(f, "utility"),
        }
    }
}

impl std::str::FromStr for ServiceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "web" => Ok(Self::Web),
            "api" => Ok(Self::Api),
            "database" => Ok(Self::Database),
            "cache" => Ok(Self::Cache),
            "queue" => Ok(Self::Queue),
            "monitoring" => Ok(Self::Monitoring),
            "utility" => Ok(Self::Utility),
            other => Err(Error::Validation(format!("unknown service type '{other}'"))),
        }
    }
}

/// A single addressable endpoint of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub health_path: String,
}

impl Endpoint {
    pub fn url(&self) -> String {
        format!("{}://{}:{}{}", self.protocol, self.host, self.port, self.path)
    }

    pub fn health_url(&self) -> String {
        format!(
            "{}://{}:{}{}",
            self.protocol, self.host, self.port, self.health_path
        )
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            protocol: "http".to_string(),
            host: "localhost".to_string(),
            port: 80,
            path: "/".to_string(),
            health_path: "/health".to_string(),
        }
    }
}

/// A logical workload discovered from the container runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub container_id: String,
    pub image: String,
    pub status: ServiceStatus,
    pub service_type: ServiceKind,
    pub endpoints: Vec<Endpoint>,
    pub labels: HashMap<String, String>,
    pub dependencies: Vec<String>,
    pub environment: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Fraction of endpoints that answered OK on the last probe cycle.
    pub health_score: f64,
    pub auto_scale_enabled: bool,
    pub min_replicas: u32,
    pub max_replicas: u32,
}

impl Service {
    /// `status = running` requires a resolvable container id.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Validation("service name is empty".to_string()));
        }
        if self.status == ServiceStatus::Running && self.container_id.is_empty() {
            return Err(Error::Validation(format!(
                "service '{}' is running without a container id",
                self.name
            )));
        }
        if self.min_replicas > self.max_replicas {
            return Err(Error::Validation(format!(
                "service '{}': min_replicas {} > max_replicas {}",
                self.name, self.min_replicas, self.max_replicas
            )));
        }
        Ok(())
    }
}

// ─── Container model (orchestrator view) ─────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
    Unhealthy,
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Error => write!(f, "error"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Readiness / liveness check attached to a managed container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HealthCheck {
    Http { url: String, timeout_secs: u64 },
    Exec { command: Vec<String> },
}

/// Declarative configuration of a managed container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub name: String,
    pub image: String,
    /// container port → host port
    pub ports: HashMap<u16, u16>,
    pub environment: HashMap<String, String>,
    /// host path → container path
    pub volumes: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub dependencies: Vec<String>,
    pub health_check: Option<HealthCheck>,
    pub restart_policy: String,
    pub auto_remove: bool,
    pub startup_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
}

impl ContainerConfig {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ports: HashMap::new(),
            environment: HashMap::new(),
            volumes: HashMap::new(),
            labels: HashMap::new(),
            dependencies: Vec::new(),
            health_check: None,
            restart_policy: "unless-stopped".to_string(),
            auto_remove: false,
            startup_timeout_secs: 120,
            shutdown_timeout_secs: 30,
        }
    }
}

/// Live state of a managed container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub name: String,
    pub state: ContainerState,
    pub container_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub error_message: Option<String>,
}

impl ContainerStatus {
    pub fn stopped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: ContainerState::Stopped,
            container_id: None,
            started_at: None,
            last_health_check: None,
            restart_count: 0,
            error_message: None,
        }
    }
}

// ─── Scaling model ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalingDirection {
    Up,
    Down,
    None,
}

impl std::fmt::Display for ScalingDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
            Self::None => write!(f, "none"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingTrigger {
    CpuThreshold,
    MemoryThreshold,
    NetworkThreshold,
    CustomMetric,
    Scheduled,
    Manual,
}

/// Per-service auto-scaling policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingPolicy {
    pub service_name: String,
    pub enabled: bool,

    pub cpu_scale_up_threshold: f64,
    pub memory_scale_up_threshold: f64,
    pub network_scale_up_threshold: f64,

    pub cpu_scale_down_threshold: f64,
    pub memory_scale_down_threshold: f64,
    pub network_scale_down_threshold: f64,

    pub scale_up_cooldown_secs: u64,
    pub scale_down_cooldown_secs: u64,

    pub min_replicas: u32,
    pub max_replicas: u32,

    pub evaluation_periods: usize,
    pub evaluation_interval_secs: u64,

    pub enable_prediction: bool,
}

impl ScalingPolicy {
    pub fn for_service(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            enabled: true,
            cpu_scale_up_threshold: 80.0,
            memory_scale_up_threshold: 85.0,
            network_scale_up_threshold: 100.0,
            cpu_scale_down_threshold: 30.0,
            memory_scale_down_threshold: 40.0,
            network_scale_down_threshold: 20.0,
            scale_up_cooldown_secs: 300,
            scale_down_cooldown_secs: 600,
            min_replicas: 1,
            max_replicas: 10,
            evaluation_periods: 3,
            evaluation_interval_secs: 60,
            enable_prediction: true,
        }
    }

    /// Down thresholds must sit strictly below up thresholds on every axis,
    /// and cooldowns must cover at least one evaluation interval.
    pub fn validate(&self) -> Result<()> {
        if self.service_name.is_empty() {
            return Err(Error::Validation("policy has no service name".to_string()));
        }
        let axes = [
            ("cpu", self.cpu_scale_down_threshold, self.cpu_scale_up_threshold),
            (
                "memory",
                self.memory_scale_down_threshold,
                self.memory_scale_up_threshold,
            ),
            (
                "network",
                self.network_scale_down_threshold,
                self.network_scale_up_threshold,
            ),
        ];
        for (axis, down, up) in axes {
            if down >= up {
                return Err(Error::Validation(format!(
                    "policy '{}': {axis} scale-down threshold {down} must be below scale-up threshold {up}",
                    self.service_name
                )));
            }
        }
        if self.scale_up_cooldown_secs < self.evaluation_interval_secs
            || self.scale_down_cooldown_secs < self.evaluation_interval_secs
        {
            return Err(Error::Validation(format!(
                "policy '{}': cooldowns must be >= evaluation interval ({}s)",
                self.service_name, self.evaluation_interval_secs
            )));
        }
        if self.min_replicas > self.max_replicas {
            return Err(Error::Validation(format!(
                "policy '{}': min_replicas {} > max_replicas {}",
                self.service_name, self.min_replicas, self.max_replicas
            )));
        }
        if self.evaluation_periods == 0 {
            return Err(Error::Validation(format!(
                "policy '{}': evaluation_periods must be > 0",
                self.service_name
            )));
        }
        Ok(())
    }
}

/// One resource sample for a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsPoint {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub network_in_mbps: f64,
    pub network_out_mbps: f64,
    pub request_rate: f64,
    pub response_time_ms: f64,
    pub error_rate: f64,
    pub queue_length: u32,
    pub timestamp: DateTime<Utc>,
}

impl MetricsPoint {
    pub fn zero(timestamp: DateTime<Utc>) -> Self {
        Self {
            cpu_percent: 0.0,
            memory_percent: 0.0,
            network_in_mbps: 0.0,
            network_out_mbps: 0.0,
            request_rate: 0.0,
            response_time_ms: 0.0,
            error_rate: 0.0,
            queue_length: 0,
            timestamp,
        }
    }
}

/// Append-only audit record of a scale action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingEvent {
    pub service_name: String,
    pub direction: ScalingDirection,
    pub trigger: ScalingTrigger,
    pub from_replicas: u32,
    pub to_replicas: u32,
    pub metrics: MetricsPoint,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub error_message: Option<String>,
}

// ─── Shutdown model ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownCondition {
    Inactivity,
    Schedule,
    LowResources,
    IdleTime,
}

impl std::fmt::Display for ShutdownCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inactivity => write!(f, "inactivity"),
            Self::Schedule => write!(f, "schedule"),
            Self::LowResources => write!(f, "low_resources"),
            Self::IdleTime => write!(f, "idle_time"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownAction {
    Stop,
    Pause,
    Restart,
    ScaleDown,
}

impl std::fmt::Display for ShutdownAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stop => write!(f, "stop"),
            Self::Pause => write!(f, "pause"),
            Self::Restart => write!(f, "restart"),
            Self::ScaleDown => write!(f, "scale_down"),
        }
    }
}

/// Wall-clock window, both bounds inclusive, `HH:MM` or `HH:MM:SS`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: String,
    pub end: String,
}

/// A rule the auto-shutdown engine evaluates on every tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShutdownRule {
    pub id: Uuid,
    pub name: String,
    pub enabled: bool,
    pub condition: ShutdownCondition,
    pub action: ShutdownAction,

    /// Restrict to these containers when non-empty.
    pub containers: Vec<String>,
    pub exclude_containers: Vec<String>,
    /// Required container labels, `key=value`.
    pub tags: Vec<String>,

    pub inactivity_threshold_secs: u64,
    pub cpu_threshold: f64,
    pub memory_threshold_mb: f64,
    pub network_threshold_bytes: u64,

    pub cron_schedule: Option<String>,
    pub time_ranges: Vec<TimeRange>,
    /// 0 = Monday … 6 = Sunday.
    pub days_of_week: Vec<u8>,

    pub grace_period_secs: u64,
    pub notification: bool,
    pub auto_restart: bool,
    pub restart_schedule: Option<String>,

    pub protect_if_connected: bool,
    pub protect_if_uploading: bool,
    pub min_uptime_secs: u64,

    pub created_at: DateTime<Utc>,
    pub last_triggered: Option<DateTime<Utc>>,
    pub last_checked: Option<DateTime<Utc>>,
}

impl ShutdownRule {
    pub fn new(name: impl Into<String>, condition: ShutdownCondition, action: ShutdownAction) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            enabled: true,
            condition,
            action,
            containers: Vec::new(),
            exclude_containers: Vec::new(),
            tags: Vec::new(),
            inactivity_threshold_secs: 3600,
            cpu_threshold: 5.0,
            memory_threshold_mb: 100.0,
            network_threshold_bytes: 1024,
            cron_schedule: None,
            time_ranges: Vec::new(),
            days_of_week: Vec::new(),
            grace_period_secs: 30,
            notification: true,
            auto_restart: false,
            restart_schedule: None,
            protect_if_connected: true,
            protect_if_uploading: true,
            min_uptime_secs: 300,
            created_at: Utc::now(),
            last_triggered: None,
            last_checked: None,
        }
    }

    /// A schedule rule carries a cron expression or time ranges, never both.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Validation("rule has no name".to_string()));
        }
        if self.condition == ShutdownCondition::Schedule {
            let has_cron = self.cron_schedule.is_some();
            let has_ranges = !self.time_ranges.is_empty();
            if has_cron && has_ranges {
                return Err(Error::Validation(format!(
                    "rule '{}': cron_schedule and time_ranges are mutually exclusive",
                    self.name
                )));
            }
            if !has_cron && !has_ranges {
                return Err(Error::Validation(format!(
                    "rule '{}': schedule condition needs a cron_schedule or time_ranges",
                    self.name
                )));
            }
        }
        if self.days_of_week.iter().any(|d| *d > 6) {
            return Err(Error::Validation(format!(
                "rule '{}': days_of_week entries must be 0..=6",
                self.name
            )));
        }
        Ok(())
    }
}

/// Append-only audit record of a shutdown action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShutdownLog {
    pub id: Uuid,
    pub rule_id: Uuid,
    pub container_name: String,
    pub action: ShutdownAction,
    pub reason: String,
    pub success: bool,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub scheduled_restart: Option<DateTime<Utc>>,
}

// ─── Proxy model ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    #[default]
    RoundRobin,
    LeastConnections,
    Weighted,
    IpHash,
    HealthBased,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    #[default]
    Healthy,
    Unhealthy,
    Draining,
    Maintenance,
}

impl std::fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Draining => write!(f, "draining"),
            Self::Maintenance => write!(f, "maintenance"),
        }
    }
}

/// Static configuration of one backend behind a proxy target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backend {
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub max_connections: u32,
}

impl Backend {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            weight: 1,
            max_connections: 100,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Live per-backend view, for status endpoints and audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendView {
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub status: BackendStatus,
    pub current_connections: u32,
    pub response_time_ema_ms: f64,
    pub success_count: u64,
    pub error_count: u64,
    pub health_ratio: f64,
    pub last_health_check: Option<DateTime<Utc>>,
}

/// A named backend pool with a selection policy and health regime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyTarget {
    pub name: String,
    pub backends: Vec<Backend>,
    pub policy: SelectionPolicy,
    pub health_check_path: String,
    pub health_check_interval_secs: u64,
    pub health_check_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_timeout_secs: u64,
    pub sticky_sessions: bool,
}

impl ProxyTarget {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            backends: Vec::new(),
            policy: SelectionPolicy::RoundRobin,
            health_check_path: "/health".to_string(),
            health_check_interval_secs: 30,
            health_check_timeout_secs: 5,
            max_retries: 3,
            retry_delay_ms: 1000,
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout_secs: 60,
            sticky_sessions: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Validation("proxy target has no name".to_string()));
        }
        for backend in &self.backends {
            if backend.host.is_empty() || backend.port == 0 {
                return Err(Error::Validation(format!(
                    "target '{}': backend host/port invalid",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

// ─── Hook points ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPoint {
    BeforeContainerStart,
    AfterContainerStart,
    BeforeContainerStop,
    AfterContainerStop,
    OnServiceDiscovery,
    OnScalingEvent,
    OnHealthCheck,
    OnMetricsCollection,
    OnApiRequest,
    OnWebhookTrigger,
}

impl std::fmt::Display for HookPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BeforeContainerStart => write!(f, "before_container_start"),
            Self::AfterContainerStart => write!(f, "after_container_start"),
            Self::BeforeContainerStop => write!(f, "before_container_stop"),
            Self::AfterContainerStop => write!(f, "after_container_stop"),
            Self::OnServiceDiscovery => write!(f, "on_service_discovery"),
            Self::OnScalingEvent => write!(f, "on_scaling_event"),
            Self::OnHealthCheck => write!(f, "on_health_check"),
            Self::OnMetricsCollection => write!(f, "on_metrics_collection"),
            Self::OnApiRequest => write!(f, "on_api_request"),
            Self::OnWebhookTrigger => write!(f, "on_webhook_trigger"),
        }
    }
}

// ─── Label grammar ────────────────────────────────────────────────────────────

pub mod labels {
    //! The `selfstart.*` container-label grammar that drives discovery.

    use super::{Error, Result, ServiceKind};
    use std::collections::HashMap;

    pub const ENABLE: &str = "selfstart.enable";
    pub const TYPE: &str = "selfstart.type";
    pub const PORT: &str = "selfstart.port";
    pub const PATH: &str = "selfstart.path";
    pub const HEALTH_PATH: &str = "selfstart.health_path";
    pub const PROTOCOL: &str = "selfstart.protocol";
    pub const DEPENDENCIES: &str = "selfstart.dependencies";
    pub const AUTO_SCALE: &str = "selfstart.auto_scale";
    pub const MIN_REPLICAS: &str = "selfstart.min_replicas";
    pub const MAX_REPLICAS: &str = "selfstart.max_replicas";

    /// Typed view over the optional discovery labels.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ServiceLabels {
        pub service_type: ServiceKind,
        pub port: u16,
        pub path: String,
        pub health_path: String,
        pub protocol: String,
        pub dependencies: Vec<String>,
        pub auto_scale: bool,
        pub min_replicas: u32,
        pub max_replicas: u32,
    }

    /// True when the container opted into discovery.
    pub fn is_enabled(labels: &HashMap<String, String>) -> bool {
        labels.get(ENABLE).map(String::as_str) == Some("true")
    }

    /// Parse the optional labels, rejecting malformed values.
    pub fn parse(labels: &HashMap<String, String>) -> Result<ServiceLabels> {
        let service_type = match labels.get(TYPE) {
            Some(raw) => raw.parse()?,
            None => ServiceKind::Web,
        };
        let port = parse_number(labels, PORT, 80u16)?;
        let min_replicas = parse_number(labels, MIN_REPLICAS, 1u32)?;
        let max_replicas = parse_number(labels, MAX_REPLICAS, 5u32)?;
        if min_replicas > max_replicas {
            return Err(Error::Validation(format!(
                "label {MIN_REPLICAS} ({min_replicas}) exceeds {MAX_REPLICAS} ({max_replicas})"
            )));
        }

        let dependencies = labels
            .get(DEPENDENCIES)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(ServiceLabels {
            service_type,
            port,
            path: labels.get(PATH).cloned().unwrap_or_else(|| "/".to_string()),
            health_path: labels
                .get(HEALTH_PATH)
                .cloned()
                .unwrap_or_else(|| "/health".to_string()),
            protocol: labels
                .get(PROTOCOL)
                .cloned()
                .unwrap_or_else(|| "http".to_string()),
            dependencies,
            auto_scale: labels.get(AUTO_SCALE).map(String::as_str) == Some("true"),
            min_replicas,
            max_replicas,
        })
    }

    fn parse_number<T: std::str::FromStr>(
        labels: &HashMap<String, String>,
        key: &str,
        default: T,
    ) -> Result<T> {
        match labels.get(key) {
            Some(raw) => raw
                .parse()
                .map_err(|_| Error::Validation(format!("label {key} has invalid value '{raw}'"))),
            None => Ok(default),
        }
    }
}

// ─── Store key namespace ──────────────────────────────────────────────────────

pub mod keys {
    //! Key layout of the registry store. All keys live under `selfstart:`.

    pub const SERVICES_INDEX: &str = "selfstart:services";
    pub const CONTAINERS_INDEX: &str = "selfstart:containers";
    pub const SCALING_POLICIES_INDEX: &str = "selfstart:scaling_policies";
    pub const ROUND_ROBIN_INDEX: &str = "selfstart:proxy:round_robin_index";

    pub const STATUS_TTL_SECS: u64 = 3600;
    pub const ROUND_ROBIN_TTL_SECS: u64 = 3600;
    pub const SCALING_EVENTS_TTL_SECS: u64 = 7 * 86400;
    pub const SCALING_EVENTS_CAP: usize = 100;

    pub fn service(name: &str) -> String {
        format!("selfstart:service:{name}")
    }

    pub fn metrics(name: &str) -> String {
        format!("selfstart:metrics:{name}")
    }

    pub fn scaling_policy(name: &str) -> String {
        format!("selfstart:scaling_policy:{name}")
    }

    pub fn scaling_events(name: &str) -> String {
        format!("selfstart:scaling_events:{name}")
    }

    pub fn container(name: &str) -> String {
        format!("selfstart:container:{name}")
    }

    pub fn status(name: &str) -> String {
        format!("selfstart:status:{name}")
    }

    pub fn proxy_target(name: &str) -> String {
        format!("selfstart:proxy:target:{name}")
    }
}

// ─── Error taxonomy ───────────────────────────────────────────────────────────

pub mod error {
    use thiserror::Error;

    /// The error kinds surfaced to callers and logs.
    #[derive(Debug, Error)]
    pub enum Error {
        #[error("not found: {0}")]
        NotFound(String),
        #[error("conflict: {0}")]
        Conflict(String),
        #[error("validation error: {0}")]
        Validation(String),
        #[error("timeout: {0}")]
        Timeout(String),
        #[error("backend error: {0}")]
        Backend(String),
        #[error("runtime error: {0}")]
        Runtime(String),
        #[error("store error: {0}")]
        Store(String),
        #[error("internal error: {0}")]
        Internal(String),
    }

    impl Error {
        /// Stable machine-readable kind, for logs and API payloads.
        pub fn kind(&self) -> &'static str {
            match self {
                Self::NotFound(_) => "not_found",
                Self::Conflict(_) => "conflict",
                Self::Validation(_) => "validation",
                Self::Timeout(_) => "timeout",
                Self::Backend(_) => "backend_error",
                Self::Runtime(_) => "runtime_error",
                Self::Store(_) => "store_error",
                Self::Internal(_) => "internal",
            }
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_service() -> Service {
        Service {
            name: "webshop".to_string(),
            container_id: "abc123def456".to_string(),
            image: "webshop:1.4".to_string(),
            status: ServiceStatus::Running,
            service_type: ServiceKind::Web,
            endpoints: vec![Endpoint::default()],
            labels: HashMap::new(),
            dependencies: vec!["db".to_string()],
            environment: HashMap::new(),
            created_at: Utc::now(),
            last_seen: Utc::now(),
            health_score: 1.0,
            auto_scale_enabled: true,
            min_replicas: 1,
            max_replicas: 3,
        }
    }

    #[test]
    fn test_service_roundtrip() {
        let service = sample_service();
        let json = serde_json::to_string(&service).expect("serialize");
        let back: Service = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(service, back);
    }

    #[test]
    fn test_running_service_requires_container_id() {
        let mut service = sample_service();
        service.container_id.clear();
        assert!(service.validate().is_err());

        service.status = ServiceStatus::Stopped;
        assert!(service.validate().is_ok());
    }

    #[test]
    fn test_service_kind_rejects_unknown_tag() {
        assert!("database".parse::<ServiceKind>().is_ok());
        assert!("blockchain".parse::<ServiceKind>().is_err());

        let err = serde_json::from_str::<ServiceKind>("\"blockchain\"");
        assert!(err.is_err());
    }

    #[test]
    fn test_endpoint_urls() {
        let ep = Endpoint {
            protocol: "http".to_string(),
            host: "10.0.0.4".to_string(),
            port: 8080,
            path: "/app".to_string(),
            health_path: "/healthz".to_string(),
        };
        assert_eq!(ep.url(), "http://10.0.0.4:8080/app");
        assert_eq!(ep.health_url(), "http://10.0.0.4:8080/healthz");
    }

    #[test]
    fn test_policy_roundtrip() {
        let policy = ScalingPolicy::for_service("webshop");
        let json = serde_json::to_string(&policy).expect("serialize");
        let back: ScalingPolicy = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(policy, back);
    }

    #[test]
    fn test_policy_default_is_valid() {
        assert!(ScalingPolicy::for_service("webshop").validate().is_ok());
    }

    #[test]
    fn test_policy_rejects_inverted_thresholds() {
        let mut policy = ScalingPolicy::for_service("webshop");
        policy.cpu_scale_down_threshold = 90.0;
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_policy_rejects_short_cooldown() {
        let mut policy = ScalingPolicy::for_service("webshop");
        policy.scale_up_cooldown_secs = 10;
        policy.evaluation_interval_secs = 60;
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_rule_roundtrip() {
        let rule = ShutdownRule::new(
            "night-idle",
            ShutdownCondition::Inactivity,
            ShutdownAction::Stop,
        );
        let json = serde_json::to_string(&rule).expect("serialize");
        let back: ShutdownRule = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(rule, back);
    }

    #[test]
    fn test_schedule_rule_needs_exactly_one_schedule_source() {
        let mut rule = ShutdownRule::new(
            "nightly",
            ShutdownCondition::Schedule,
            ShutdownAction::Stop,
        );
        assert!(rule.validate().is_err(), "no schedule source");

        rule.cron_schedule = Some("0 0 2 * * *".to_string());
        assert!(rule.validate().is_ok());

        rule.time_ranges.push(TimeRange {
            start: "02:00".to_string(),
            end: "04:00".to_string(),
        });
        assert!(rule.validate().is_err(), "both sources set");

        rule.cron_schedule = None;
        assert!(rule.validate().is_ok());
    }

    #[test]
    fn test_rule_rejects_bad_weekday() {
        let mut rule = ShutdownRule::new(
            "weekend",
            ShutdownCondition::LowResources,
            ShutdownAction::Pause,
        );
        rule.days_of_week = vec![5, 7];
        assert!(rule.validate().is_err());
    }

    #[test]
    fn test_proxy_target_roundtrip() {
        let mut target = ProxyTarget::new("webshop");
        target.backends.push(Backend::new("10.0.0.4", 8080));
        target.policy = SelectionPolicy::LeastConnections;
        let json = serde_json::to_string(&target).expect("serialize");
        let back: ProxyTarget = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(target, back);
    }

    #[test]
    fn test_proxy_target_rejects_zero_port() {
        let mut target = ProxyTarget::new("webshop");
        target.backends.push(Backend::new("10.0.0.4", 0));
        assert!(target.validate().is_err());
    }

    #[test]
    fn test_backend_url() {
        assert_eq!(Backend::new("10.0.0.4", 8080).url(), "http://10.0.0.4:8080");
    }

    #[test]
    fn test_hook_point_serializes_snake_case() {
        let json = serde_json::to_string(&HookPoint::OnScalingEvent).expect("serialize");
        assert_eq!(json, "\"on_scaling_event\"");
        assert_eq!(HookPoint::BeforeContainerStart.to_string(), "before_container_start");
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::NotFound("x".to_string()).kind(), "not_found");
        assert_eq!(Error::Backend("x".to_string()).kind(), "backend_error");
        assert_eq!(Error::Store("x".to_string()).kind(), "store_error");
    }

    // ─── Labels ─────────────────────────────────────────────────────────────

    fn label_map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_labels_enable_gate() {
        assert!(labels::is_enabled(&label_map(&[(labels::ENABLE, "true")])));
        assert!(!labels::is_enabled(&label_map(&[(labels::ENABLE, "false")])));
        assert!(!labels::is_enabled(&label_map(&[])));
    }

    #[test]
    fn test_labels_defaults() {
        let parsed = labels::parse(&label_map(&[(labels::ENABLE, "true")])).expect("parse");
        assert_eq!(parsed.service_type, ServiceKind::Web);
        assert_eq!(parsed.port, 80);
        assert_eq!(parsed.health_path, "/health");
        assert_eq!(parsed.min_replicas, 1);
        assert_eq!(parsed.max_replicas, 5);
        assert!(!parsed.auto_scale);
        assert!(parsed.dependencies.is_empty());
    }

    #[test]
    fn test_labels_full_parse() {
        let parsed = labels::parse(&label_map(&[
            (labels::TYPE, "api"),
            (labels::PORT, "9000"),
            (labels::PATH, "/v1"),
            (labels::HEALTH_PATH, "/v1/health"),
            (labels::DEPENDENCIES, "db, cache"),
            (labels::AUTO_SCALE, "true"),
            (labels::MIN_REPLICAS, "2"),
            (labels::MAX_REPLICAS, "6"),
        ]))
        .expect("parse");

        assert_eq!(parsed.service_type, ServiceKind::Api);
        assert_eq!(parsed.port, 9000);
        assert_eq!(parsed.dependencies, vec!["db".to_string(), "cache".to_string()]);
        assert!(parsed.auto_scale);
        assert_eq!((parsed.min_replicas, parsed.max_replicas), (2, 6));
    }

    #[test]
    fn test_labels_reject_bad_port() {
        let err = labels::parse(&label_map(&[(labels::PORT, "eighty")]));
        assert!(err.is_err());
    }

    #[test]
    fn test_labels_reject_inverted_replicas() {
        let err = labels::parse(&label_map(&[
            (labels::MIN_REPLICAS, "5"),
            (labels::MAX_REPLICAS, "2"),
        ]));
        assert!(err.is_err());
    }

    // ─── Keys ───────────────────────────────────────────────────────────────

    #[test]
    fn test_key_namespace() {
        assert_eq!(keys::service("webshop"), "selfstart:service:webshop");
        assert_eq!(keys::status("webshop"), "selfstart:status:webshop");
        assert_eq!(keys::proxy_target("webshop"), "selfstart:proxy:target:webshop");
        assert_eq!(keys::SERVICES_INDEX, "selfstart:services");
        assert!(keys::ROUND_ROBIN_INDEX.starts_with("selfstart:proxy:"));
    }
}
