//! Reverse proxy and load balancer for the SelfStart control plane.
//!
//! Maintains named backend pools ([`ProxyTarget`]), selects a backend per
//! request under five policies, guards every backend with a circuit breaker,
//! probes backends actively, and retries connection-establishment failures
//! on other healthy backends. Hop-by-hop headers are stripped in both
//! directions and forwarding headers are added.
//!
//! Callers map [`Error::Backend`] to a 503 and [`Error::NotFound`] to a 404.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use selfstart_hooks::HookBus;
use selfstart_observe::OperationsMetrics;
use selfstart_proto::{
    Backend, BackendStatus, BackendView, Error, HookPoint, ProxyTarget, Result, SelectionPolicy,
    keys,
};
use selfstart_store::RegistryStore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ─── Circuit breaker ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-backend failure-trip state machine.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    timeout: Duration,
    failure_count: u32,
    opened_at: Option<Instant>,
    state: BreakerState,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, timeout: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            timeout,
            failure_count: 0,
            opened_at: None,
            state: BreakerState::Closed,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// A completed call closes the breaker and clears the counter.
    pub fn record_success(&mut self) {
        self.failure_count = 0;
        self.opened_at = None;
        self.state = BreakerState::Closed;
    }

    /// Returns true when this failure tripped the breaker open.
    pub fn record_failure(&mut self) -> bool {
        self.failure_count += 1;
        if self.failure_count >= self.threshold {
            let newly_open = self.state != BreakerState::Open;
            self.state = BreakerState::Open;
            self.opened_at = Some(Instant::now());
            newly_open
        } else {
            false
        }
    }

    /// Whether a call may go through right now. An open breaker moves to
    /// half-open once its timeout elapses, admitting a single trial.
    pub fn can_attempt(&mut self) -> bool {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                if self.opened_at.is_some_and(|at| at.elapsed() >= self.timeout) {
                    self.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }
}

// ─── Backend handle ───────────────────────────────────────────────────────────

/// Live state of one backend: config plus atomic counters and the breaker.
pub struct BackendHandle {
    pub config: Backend,
    status: RwLock<BackendStatus>,
    connections: AtomicU32,
    success_count: AtomicU64,
    error_count: AtomicU64,
    /// EMA of response time, stored in microseconds.
    response_ema_micros: AtomicU64,
    last_health_check: RwLock<Option<DateTime<Utc>>>,
    breaker: Mutex<CircuitBreaker>,
}

impl BackendHandle {
    fn new(config: Backend, breaker_threshold: u32, breaker_timeout: Duration) -> Self {
        Self {
            config,
            status: RwLock::new(BackendStatus::Healthy),
            connections: AtomicU32::new(0),
            success_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            response_ema_micros: AtomicU64::new(0),
            last_health_check: RwLock::new(None),
            breaker: Mutex::new(CircuitBreaker::new(breaker_threshold, breaker_timeout)),
        }
    }

    pub fn url(&self) -> String {
        self.config.url()
    }

    pub fn status(&self) -> BackendStatus {
        *self.status.read()
    }

    pub fn set_status(&self, status: BackendStatus) {
        *self.status.write() = status;
    }

    pub fn connections(&self) -> u32 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn health_ratio(&self) -> f64 {
        let ok = self.success_count.load(Ordering::Relaxed);
        let err = self.error_count.load(Ordering::Relaxed);
        let total = ok + err;
        if total == 0 {
            return 1.0;
        }
        ok as f64 / total as f64
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.lock().state()
    }

    fn record_response_time(&self, elapsed: Duration) {
        let sample = elapsed.as_micros() as u64;
        let old = self.response_ema_micros.load(Ordering::Relaxed);
        let ema = if old == 0 {
            sample
        } else {
            (old * 4 + sample) / 5
        };
        self.response_ema_micros.store(ema, Ordering::Relaxed);
    }

    pub fn view(&self) -> BackendView {
        BackendView {
            host: self.config.host.clone(),
            port: self.config.port,
            weight: self.config.weight,
            status: self.status(),
            current_connections: self.connections(),
            response_time_ema_ms: self.response_ema_micros.load(Ordering::Relaxed) as f64 / 1000.0,
            success_count: self.success_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            health_ratio: self.health_ratio(),
            last_health_check: *self.last_health_check.read(),
        }
    }
}

struct TargetState {
    config: ProxyTarget,
    backends: RwLock<Vec<Arc<BackendHandle>>>,
    /// Local round-robin counter, used when the store is unreachable.
    rr_fallback: AtomicU64,
}

impl TargetState {
    fn handle_for(config: &ProxyTarget, backend: Backend) -> Arc<BackendHandle> {
        Arc::new(BackendHandle::new(
            backend,
            config.circuit_breaker_threshold,
            Duration::from_secs(config.circuit_breaker_timeout_secs),
        ))
    }
}

// ─── Request / response shapes ────────────────────────────────────────────────

/// A request entering the proxy, transport-agnostic.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub client_ip: Option<String>,
    pub session_id: Option<String>,
}

impl ProxyRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            path: path.into(),
            headers: Vec::new(),
            body: Vec::new(),
            client_ip: None,
            session_id: None,
        }
    }
}

/// The response handed back to the façade.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub backend_url: String,
}

/// Status view of one target, for API consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetStatusView {
    pub name: String,
    pub policy: SelectionPolicy,
    pub backends: Vec<BackendView>,
    pub healthy_backends: usize,
    pub total_backends: usize,
}

/// Proxy-wide counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySummary {
    pub total_requests: u64,
    pub total_errors: u64,
    pub error_rate: f64,
    pub average_response_time_ms: f64,
    pub active_targets: usize,
    pub total_backends: usize,
    pub healthy_backends: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub request_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
        }
    }
}

// ─── Reverse proxy ────────────────────────────────────────────────────────────

pub struct ReverseProxy {
    store: Arc<dyn RegistryStore>,
    hooks: Arc<HookBus>,
    metrics: Arc<OperationsMetrics>,
    http: reqwest::Client,
    config: ProxyConfig,
    targets: RwLock<HashMap<String, Arc<TargetState>>>,
    /// session id → backend url, live only while the backend stays healthy.
    sessions: RwLock<HashMap<String, String>>,
    total_response_micros: AtomicU64,
}

impl ReverseProxy {
    pub fn new(
        store: Arc<dyn RegistryStore>,
        hooks: Arc<HookBus>,
        metrics: Arc<OperationsMetrics>,
        config: ProxyConfig,
    ) -> Self {
        Self {
            store,
            hooks,
            metrics,
            http: reqwest::Client::new(),
            config,
            targets: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            total_response_micros: AtomicU64::new(0),
        }
    }

    // ─── Target management ──────────────────────────────────────────────────

    pub async fn register_target(&self, target: ProxyTarget) -> Result<()> {
        target.validate()?;
        let backends = target
            .backends
            .iter()
            .map(|b| TargetState::handle_for(&target, b.clone()))
            .collect();
        let state = Arc::new(TargetState {
            config: target.clone(),
            backends: RwLock::new(backends),
            rr_fallback: AtomicU64::new(0),
        });
        info!(target = %target.name, backends = target.backends.len(), "proxy target registered");
        self.targets.write().insert(target.name.clone(), state);
        self.persist_target(&target.name).await;
        Ok(())
    }

    pub async fn add_backend(&self, target_name: &str, backend: Backend) -> Result<()> {
        let state = self.target(target_name)?;
        if backend.host.is_empty() || backend.port == 0 {
            return Err(Error::Validation("backend host/port invalid".to_string()));
        }
        {
            let mut backends = state.backends.write();
            if backends.iter().any(|b| b.config == backend) {
                return Err(Error::Conflict(format!(
                    "backend {} already registered on '{target_name}'",
                    backend.url()
                )));
            }
            info!(target = target_name, backend = %backend.url(), "backend added");
            backends.push(TargetState::handle_for(&state.config, backend));
        }
        self.persist_target(target_name).await;
        Ok(())
    }

    pub async fn remove_backend(&self, target_name: &str, backend_url: &str) -> Result<()> {
        let state = self.target(target_name)?;
        let removed = {
            let mut backends = state.backends.write();
            let before = backends.len();
            backends.retain(|b| b.url() != backend_url);
            before != backends.len()
        };
        if !removed {
            return Err(Error::NotFound(format!(
                "backend {backend_url} on target '{target_name}'"
            )));
        }
        info!(target = target_name, backend = backend_url, "backend removed");
        self.persist_target(target_name).await;
        Ok(())
    }

    /// A backend in maintenance is never selected and never probed.
    pub fn set_maintenance(&self, target_name: &str, backend_url: &str, on: bool) -> Result<()> {
        let state = self.target(target_name)?;
        let backends = state.backends.read();
        let backend = backends
            .iter()
            .find(|b| b.url() == backend_url)
            .ok_or_else(|| {
                Error::NotFound(format!("backend {backend_url} on target '{target_name}'"))
            })?;
        backend.set_status(if on {
            BackendStatus::Maintenance
        } else {
            BackendStatus::Healthy
        });
        info!(target = target_name, backend = backend_url, maintenance = on, "maintenance toggled");
        Ok(())
    }

    pub fn target_status(&self, target_name: &str) -> Result<TargetStatusView> {
        let state = self.target(target_name)?;
        let backends = state.backends.read();
        let views: Vec<BackendView> = backends.iter().map(|b| b.view()).collect();
        Ok(TargetStatusView {
            name: state.config.name.clone(),
            policy: state.config.policy,
            healthy_backends: views
                .iter()
                .filter(|v| v.status == BackendStatus::Healthy)
                .count(),
            total_backends: views.len(),
            backends: views,
        })
    }

    pub fn target_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.targets.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn target(&self, name: &str) -> Result<Arc<TargetState>> {
        self.targets
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("proxy target '{name}'")))
    }

    async fn persist_target(&self, name: &str) {
        let Ok(state) = self.target(name) else {
            return;
        };
        let mut config = state.config.clone();
        config.backends = state
            .backends
            .read()
            .iter()
            .map(|b| b.config.clone())
            .collect();
        let Ok(payload) = serde_json::to_string(&config) else {
            return;
        };
        if let Err(e) = self.store.set(&keys::proxy_target(name), &payload).await {
            debug!(target = name, error = %e, "target persist failed");
        }
    }

    // ─── Request path ───────────────────────────────────────────────────────

    /// Forward one request to a selected backend.
    ///
    /// Retries connection-establishment failures and breaker refusals on
    /// other healthy backends, never a request whose response headers were
    /// already received.
    pub async fn proxy_request(
        &self,
        target_name: &str,
        request: ProxyRequest,
    ) -> Result<ProxyResponse> {
        let state = self.target(target_name)?;
        self.metrics.proxy_requests_total.inc();
        self.metrics.hook_publishes_total.inc();
        self.hooks
            .publish(
                HookPoint::OnApiRequest,
                serde_json::json!({
                    "target": target_name,
                    "method": request.method,
                    "path": request.path,
                }),
            )
            .await;

        let max_attempts = state.config.max_retries as usize + 1;
        let retry_delay = Duration::from_millis(state.config.retry_delay_ms);
        let mut tried: HashSet<String> = HashSet::new();
        let mut attempt = 0usize;
        let mut refusals = 0usize;
        let mut real_attempts = 0usize;

        while attempt < max_attempts {
            let Some(backend) = self.select_backend(&state, &request, &tried).await else {
                break;
            };
            let url = backend.url();

            if !backend.breaker.lock().can_attempt() {
                debug!(target = target_name, backend = %url, "circuit open, skipping backend");
                refusals += 1;
                tried.insert(url);
                attempt += 1;
                self.metrics.proxy_retries_total.inc();
                tokio::time::sleep(retry_delay).await;
                continue;
            }

            real_attempts += 1;
            match self.forward(&backend, &request).await {
                Ok(response) => {
                    if state.config.sticky_sessions {
                        if let Some(session) = &request.session_id {
                            self.sessions.write().insert(session.clone(), url);
                        }
                    }
                    return Ok(response);
                }
                Err(ForwardError::Connect(message)) => {
                    warn!(target = target_name, backend = %url, error = %message, "backend unreachable");
                    tried.insert(url);
                    attempt += 1;
                    if attempt < max_attempts {
                        self.metrics.proxy_retries_total.inc();
                        tokio::time::sleep(retry_delay).await;
                    }
                }
                Err(ForwardError::Aborted(message)) => {
                    // Headers already received; retrying could duplicate work.
                    self.metrics.proxy_request_errors.inc();
                    return Err(Error::Backend(message));
                }
            }
        }

        self.metrics.proxy_request_errors.inc();
        Err(Error::Backend(if real_attempts > 0 {
            "all backends failed".to_string()
        } else if refusals > 0 {
            "circuit breaker open".to_string()
        } else {
            "no healthy backends available".to_string()
        }))
    }

    async fn forward(
        &self,
        backend: &BackendHandle,
        request: &ProxyRequest,
    ) -> std::result::Result<ProxyResponse, ForwardError> {
        let method: reqwest::Method = request
            .method
            .parse()
            .map_err(|_| ForwardError::Aborted(format!("bad method '{}'", request.method)))?;
        let url = format!("{}{}", backend.url(), request.path);

        let mut builder = self
            .http
            .request(method, &url)
            .timeout(Duration::from_secs(self.config.request_timeout_secs))
            .body(request.body.clone());
        for (name, value) in sanitize_request_headers(&request.headers, request.client_ip.as_deref())
        {
            builder = builder.header(name, value);
        }

        backend.connections.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let outcome = builder.send().await;
        backend.connections.fetch_sub(1, Ordering::Relaxed);

        match outcome {
            Ok(response) => {
                backend.record_response_time(started.elapsed());
                self.total_response_micros
                    .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
                backend.success_count.fetch_add(1, Ordering::Relaxed);
                backend.breaker.lock().record_success();

                let status = response.status().as_u16();
                let headers = sanitize_response_headers(response.headers());
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| ForwardError::Aborted(format!("body read failed: {e}")))?;
                Ok(ProxyResponse {
                    status,
                    headers,
                    body: body.to_vec(),
                    backend_url: backend.url(),
                })
            }
            Err(e) => {
                backend.error_count.fetch_add(1, Ordering::Relaxed);
                if backend.breaker.lock().record_failure() {
                    self.metrics.record_circuit_open();
                }
                if e.is_connect() {
                    Err(ForwardError::Connect(e.to_string()))
                } else {
                    Err(ForwardError::Aborted(e.to_string()))
                }
            }
        }
    }

    // ─── Backend selection ──────────────────────────────────────────────────

    async fn select_backend(
        &self,
        state: &TargetState,
        request: &ProxyRequest,
        tried: &HashSet<String>,
    ) -> Option<Arc<BackendHandle>> {
        let candidates: Vec<Arc<BackendHandle>> = state
            .backends
            .read()
            .iter()
            .filter(|b| b.status() == BackendStatus::Healthy)
            .filter(|b| !tried.contains(&b.url()))
            .filter(|b| b.connections() < b.config.max_connections)
            .cloned()
            .collect();
        if candidates.is_empty() {
            return None;
        }

        // Sticky sessions pin to the recorded backend while it stays healthy.
        if state.config.sticky_sessions {
            if let Some(session) = &request.session_id {
                let pinned = self.sessions.read().get(session).cloned();
                if let Some(url) = pinned {
                    if let Some(backend) = candidates.iter().find(|b| b.url() == url) {
                        return Some(Arc::clone(backend));
                    }
                    self.sessions.write().remove(session);
                }
            }
        }

        let chosen = match state.config.policy {
            SelectionPolicy::RoundRobin => {
                let index = self.round_robin_index(state).await;
                Arc::clone(&candidates[(index as usize) % candidates.len()])
            }
            SelectionPolicy::LeastConnections => candidates
                .iter()
                .min_by_key(|b| b.connections())
                .map(Arc::clone)?,
            SelectionPolicy::Weighted => weighted_pick(&candidates),
            SelectionPolicy::IpHash => {
                let ip = request.client_ip.as_deref().unwrap_or_default();
                Arc::clone(&candidates[(ip_hash(ip) as usize) % candidates.len()])
            }
            SelectionPolicy::HealthBased => candidates
                .iter()
                .max_by(|a, b| {
                    a.health_ratio()
                        .partial_cmp(&b.health_ratio())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(Arc::clone)?,
        };
        Some(chosen)
    }

    /// Shared counter through the store; local atomic when it is down.
    async fn round_robin_index(&self, state: &TargetState) -> u64 {
        match self
            .store
            .counter_incr(keys::ROUND_ROBIN_INDEX, keys::ROUND_ROBIN_TTL_SECS)
            .await
        {
            Ok(index) => index,
            Err(e) => {
                debug!(error = %e, "store counter unavailable, using local round-robin");
                state.rr_fallback.fetch_add(1, Ordering::Relaxed)
            }
        }
    }

    // ─── Active health checks ───────────────────────────────────────────────

    /// Probe every backend whose health-check interval elapsed.
    pub async fn run_health_once(&self) {
        let targets: Vec<Arc<TargetState>> = self.targets.read().values().cloned().collect();
        for state in targets {
            let interval = Duration::from_secs(state.config.health_check_interval_secs);
            let backends: Vec<Arc<BackendHandle>> = state.backends.read().clone();
            for backend in backends {
                if backend.status() == BackendStatus::Maintenance {
                    continue;
                }
                let window = chrono::Duration::from_std(interval)
                    .unwrap_or_else(|_| chrono::Duration::zero());
                let due = backend
                    .last_health_check
                    .read()
                    .map_or(true, |at| Utc::now() - at >= window);
                if !due {
                    continue;
                }
                self.probe_backend(&state, &backend).await;
            }
        }
    }

    async fn probe_backend(&self, state: &TargetState, backend: &BackendHandle) {
        self.metrics.health_probes_total.inc();
        let url = format!("{}{}", backend.url(), state.config.health_check_path);
        let healthy = match self
            .http
            .get(&url)
            .timeout(Duration::from_secs(state.config.health_check_timeout_secs))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(backend = %backend.url(), error = %e, "health probe failed");
                false
            }
        };

        let previous = backend.status();
        if healthy {
            if previous == BackendStatus::Unhealthy {
                info!(target = %state.config.name, backend = %backend.url(), "backend recovered");
            }
            backend.set_status(BackendStatus::Healthy);
        } else {
            if previous == BackendStatus::Healthy {
                warn!(target = %state.config.name, backend = %backend.url(), "backend unhealthy");
            }
            backend.set_status(BackendStatus::Unhealthy);
            self.drop_sessions_for(&backend.url());
        }
        *backend.last_health_check.write() = Some(Utc::now());
    }

    fn drop_sessions_for(&self, backend_url: &str) {
        self.sessions.write().retain(|_, url| url != backend_url);
    }

    pub fn summary(&self) -> ProxySummary {
        let requests = self.metrics.proxy_requests_total.get();
        let errors = self.metrics.proxy_request_errors.get();
        let targets = self.targets.read();
        let mut total_backends = 0;
        let mut healthy_backends = 0;
        for state in targets.values() {
            for backend in state.backends.read().iter() {
                total_backends += 1;
                if backend.status() == BackendStatus::Healthy {
                    healthy_backends += 1;
                }
            }
        }
        ProxySummary {
            total_requests: requests,
            total_errors: errors,
            error_rate: if requests > 0 {
                errors as f64 / requests as f64
            } else {
                0.0
            },
            average_response_time_ms: if requests > 0 {
                self.total_response_micros.load(Ordering::Relaxed) as f64
                    / requests as f64
                    / 1000.0
            } else {
                0.0
            },
            active_targets: targets.len(),
            total_backends,
            healthy_backends,
        }
    }

    /// Spawn the active health-check loop.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let proxy = Arc::clone(self);
        let mut shutdown = shutdown.clone();
        vec![tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(10));
            loop {
                tokio::select! {
                    _ = ticker.tick() => proxy.run_health_once().await,
                    _ = shutdown.changed() => {
                        info!("proxy health loop stopping");
                        break;
                    }
                }
            }
        })]
    }
}

enum ForwardError {
    /// Connection establishment failed; safe to retry elsewhere.
    Connect(String),
    /// Failure after the request was in flight; never retried.
    Aborted(String),
}

// ─── Header hygiene ───────────────────────────────────────────────────────────

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.contains(&name.to_ascii_lowercase().as_str())
}

/// Strip hop-by-hop headers and `Host`, append forwarding headers.
fn sanitize_request_headers(
    headers: &[(String, String)],
    client_ip: Option<&str>,
) -> Vec<(String, String)> {
    let mut sanitized: Vec<(String, String)> = headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name) && !name.eq_ignore_ascii_case("host"))
        .filter(|(name, _)| !name.eq_ignore_ascii_case("x-real-ip"))
        .cloned()
        .collect();

    if let Some(ip) = client_ip {
        sanitized.push(("X-Real-IP".to_string(), ip.to_string()));
        let forwarded = headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("x-forwarded-for"))
            .map(|(_, v)| format!("{v}, {ip}"))
            .unwrap_or_else(|| ip.to_string());
        sanitized.retain(|(name, _)| !name.eq_ignore_ascii_case("x-forwarded-for"));
        sanitized.push(("X-Forwarded-For".to_string(), forwarded));
    }
    sanitized.push(("X-Forwarded-Proto".to_string(), "http".to_string()));
    sanitized
}

fn sanitize_response_headers(headers: &reqwest::header::HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| {
            let name = name.as_str();
            !is_hop_by_hop(name)
                && !name.eq_ignore_ascii_case("content-length")
                && !name.eq_ignore_ascii_case("content-encoding")
        })
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

// ─── Selection helpers ────────────────────────────────────────────────────────

fn weighted_pick(candidates: &[Arc<BackendHandle>]) -> Arc<BackendHandle> {
    use rand::Rng;
    let total: u64 = candidates.iter().map(|b| b.config.weight as u64).sum();
    if total == 0 {
        return Arc::clone(&candidates[0]);
    }
    let mut roll = rand::thread_rng().gen_range(1..=total);
    for backend in candidates {
        let weight = backend.config.weight as u64;
        if roll <= weight {
            return Arc::clone(backend);
        }
        roll -= weight;
    }
    Arc::clone(candidates.last().expect("candidates not empty"))
}

fn ip_hash(client_ip: &str) -> u64 {
    let digest = Sha256::digest(client_ip.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().expect("8 bytes"))
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use selfstart_store::MemoryStore;

    fn proxy() -> Arc<ReverseProxy> {
        Arc::new(ReverseProxy::new(
            Arc::new(MemoryStore::new()),
            Arc::new(HookBus::new()),
            Arc::new(OperationsMetrics::new()),
            ProxyConfig::default(),
        ))
    }

    fn target_with(name: &str, policy: SelectionPolicy, backends: Vec<Backend>) -> ProxyTarget {
        let mut target = ProxyTarget::new(name);
        target.policy = policy;
        target.backends = backends;
        target
    }

    async fn registered(
        proxy: &ReverseProxy,
        name: &str,
        policy: SelectionPolicy,
        backends: Vec<Backend>,
    ) -> Arc<TargetState> {
        proxy
            .register_target(target_with(name, policy, backends))
            .await
            .expect("register");
        proxy.target(name).expect("target")
    }

    // ─── Circuit breaker ────────────────────────────────────────────────────

    #[test]
    fn test_breaker_opens_at_threshold() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        assert!(breaker.can_attempt());
        assert!(!breaker.record_failure());
        assert!(!breaker.record_failure());
        assert!(breaker.record_failure(), "third failure trips the breaker");
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.can_attempt());
    }

    #[test]
    fn test_breaker_half_open_trial_then_close() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_millis(0));
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        // Timeout of zero: the next attempt is the half-open trial.
        assert!(breaker.can_attempt());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.can_attempt());
    }

    #[test]
    fn test_breaker_half_open_trial_failure_reopens() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_millis(0));
        breaker.record_failure();
        assert!(breaker.can_attempt()); // half-open
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    // ─── Selection ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_round_robin_distributes_evenly() {
        let proxy = proxy();
        let state = registered(
            &proxy,
            "web",
            SelectionPolicy::RoundRobin,
            vec![Backend::new("10.0.0.1", 80), Backend::new("10.0.0.2", 80)],
        )
        .await;

        let mut counts: HashMap<String, usize> = HashMap::new();
        let request = ProxyRequest::get("/");
        for _ in 0..100 {
            let backend = proxy
                .select_backend(&state, &request, &HashSet::new())
                .await
                .expect("backend");
            *counts.entry(backend.url()).or_default() += 1;
        }

        let first = counts["http://10.0.0.1:80"];
        let second = counts["http://10.0.0.2:80"];
        assert_eq!(first + second, 100);
        assert!((48..=52).contains(&first), "skewed: {first}/{second}");
    }

    #[tokio::test]
    async fn test_least_connections_picks_idle_backend() {
        let proxy = proxy();
        let state = registered(
            &proxy,
            "web",
            SelectionPolicy::LeastConnections,
            vec![Backend::new("10.0.0.1", 80), Backend::new("10.0.0.2", 80)],
        )
        .await;

        state.backends.read()[0]
            .connections
            .store(5, Ordering::Relaxed);

        let backend = proxy
            .select_backend(&state, &ProxyRequest::get("/"), &HashSet::new())
            .await
            .expect("backend");
        assert_eq!(backend.url(), "http://10.0.0.2:80");
    }

    #[tokio::test]
    async fn test_weighted_selection_respects_weights() {
        let proxy = proxy();
        let mut heavy = Backend::new("10.0.0.1", 80);
        heavy.weight = 3;
        let light = Backend::new("10.0.0.2", 80);
        let state = registered(&proxy, "web", SelectionPolicy::Weighted, vec![heavy, light]).await;

        let mut heavy_hits = 0usize;
        for _ in 0..400 {
            let backend = proxy
                .select_backend(&state, &ProxyRequest::get("/"), &HashSet::new())
                .await
                .expect("backend");
            if backend.url() == "http://10.0.0.1:80" {
                heavy_hits += 1;
            }
        }
        // Expectation is 300 of 400; allow generous noise.
        assert!(
            (240..=360).contains(&heavy_hits),
            "weight-3 backend got {heavy_hits}/400"
        );
    }

    #[tokio::test]
    async fn test_ip_hash_is_stable_per_client() {
        let proxy = proxy();
        let state = registered(
            &proxy,
            "web",
            SelectionPolicy::IpHash,
            vec![
                Backend::new("10.0.0.1", 80),
                Backend::new("10.0.0.2", 80),
                Backend::new("10.0.0.3", 80),
            ],
        )
        .await;

        let mut request = ProxyRequest::get("/");
        request.client_ip = Some("203.0.113.9".to_string());

        let first = proxy
            .select_backend(&state, &request, &HashSet::new())
            .await
            .expect("backend")
            .url();
        for _ in 0..10 {
            let again = proxy
                .select_backend(&state, &request, &HashSet::new())
                .await
                .expect("backend")
                .url();
            assert_eq!(first, again);
        }
    }

    #[tokio::test]
    async fn test_health_based_prefers_best_ratio() {
        let proxy = proxy();
        let state = registered(
            &proxy,
            "web",
            SelectionPolicy::HealthBased,
            vec![Backend::new("10.0.0.1", 80), Backend::new("10.0.0.2", 80)],
        )
        .await;

        {
            let backends = state.backends.read();
            backends[0].success_count.store(1, Ordering::Relaxed);
            backends[0].error_count.store(9, Ordering::Relaxed);
            backends[1].success_count.store(9, Ordering::Relaxed);
            backends[1].error_count.store(1, Ordering::Relaxed);
        }

        let backend = proxy
            .select_backend(&state, &ProxyRequest::get("/"), &HashSet::new())
            .await
            .expect("backend");
        assert_eq!(backend.url(), "http://10.0.0.2:80");
    }

    #[tokio::test]
    async fn test_maintenance_backend_never_selected() {
        let proxy = proxy();
        let state = registered(
            &proxy,
            "web",
            SelectionPolicy::RoundRobin,
            vec![Backend::new("10.0.0.1", 80), Backend::new("10.0.0.2", 80)],
        )
        .await;

        proxy
            .set_maintenance("web", "http://10.0.0.1:80", true)
            .expect("maintenance");

        for _ in 0..20 {
            let backend = proxy
                .select_backend(&state, &ProxyRequest::get("/"), &HashSet::new())
                .await
                .expect("backend");
            assert_eq!(backend.url(), "http://10.0.0.2:80");
        }

        proxy
            .set_maintenance("web", "http://10.0.0.1:80", false)
            .expect("back to healthy");
        assert_eq!(
            proxy.target_status("web").expect("status").healthy_backends,
            2
        );
    }

    #[tokio::test]
    async fn test_backend_at_connection_cap_is_skipped() {
        let proxy = proxy();
        let mut small = Backend::new("10.0.0.1", 80);
        small.max_connections = 1;
        let state = registered(
            &proxy,
            "web",
            SelectionPolicy::RoundRobin,
            vec![small, Backend::new("10.0.0.2", 80)],
        )
        .await;

        state.backends.read()[0]
            .connections
            .store(1, Ordering::Relaxed);

        for _ in 0..10 {
            let backend = proxy
                .select_backend(&state, &ProxyRequest::get("/"), &HashSet::new())
                .await
                .expect("backend");
            assert_eq!(backend.url(), "http://10.0.0.2:80");
        }
    }

    // ─── Target management ──────────────────────────────────────────────────

    #[tokio::test]
    async fn test_add_remove_backend() {
        let proxy = proxy();
        registered(
            &proxy,
            "web",
            SelectionPolicy::RoundRobin,
            vec![Backend::new("10.0.0.1", 80)],
        )
        .await;

        proxy
            .add_backend("web", Backend::new("10.0.0.2", 80))
            .await
            .expect("add");
        assert_eq!(proxy.target_status("web").expect("s").total_backends, 2);

        // Duplicate add is a conflict.
        assert!(matches!(
            proxy.add_backend("web", Backend::new("10.0.0.2", 80)).await,
            Err(Error::Conflict(_))
        ));

        proxy
            .remove_backend("web", "http://10.0.0.1:80")
            .await
            .expect("remove");
        assert_eq!(proxy.target_status("web").expect("s").total_backends, 1);

        assert!(matches!(
            proxy.remove_backend("web", "http://10.0.0.9:80").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_target_is_not_found() {
        let proxy = proxy();
        assert!(matches!(
            proxy.proxy_request("ghost", ProxyRequest::get("/")).await,
            Err(Error::NotFound(_))
        ));
    }

    // ─── Request path ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_all_backends_unhealthy_yields_backend_error() {
        let proxy = proxy();
        let state = registered(
            &proxy,
            "web",
            SelectionPolicy::RoundRobin,
            vec![Backend::new("10.0.0.1", 80)],
        )
        .await;
        state.backends.read()[0].set_status(BackendStatus::Unhealthy);

        let err = proxy.proxy_request("web", ProxyRequest::get("/")).await;
        match err {
            Err(Error::Backend(message)) => {
                assert!(message.contains("no healthy backends"), "got: {message}")
            }
            other => panic!("expected backend error, got {other:?}"),
        }
    }

    async fn spawn_echo_server() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    use tokio::io::{AsyncReadExt, AsyncWriteExt};
                    let mut buf = vec![0u8; 4096];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket
                        .write_all(
                            b"HTTP/1.1 200 OK\r\nconnection: close\r\nx-served-by: echo\r\ncontent-length: 5\r\n\r\nhello",
                        )
                        .await;
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn test_proxy_forwards_and_sanitizes_headers() {
        let port = spawn_echo_server().await;
        let proxy = proxy();
        registered(
            &proxy,
            "web",
            SelectionPolicy::RoundRobin,
            vec![Backend::new("127.0.0.1", port)],
        )
        .await;

        let mut request = ProxyRequest::get("/hello");
        request.client_ip = Some("203.0.113.9".to_string());
        let response = proxy.proxy_request("web", request).await.expect("response");

        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"hello");
        assert!(
            response
                .headers
                .iter()
                .any(|(name, value)| name == "x-served-by" && value == "echo")
        );
        // Hop-by-hop headers never pass through.
        assert!(
            !response
                .headers
                .iter()
                .any(|(name, _)| name.eq_ignore_ascii_case("connection"))
        );
    }

    #[tokio::test]
    async fn test_sticky_sessions_pin_backend() {
        let port_a = spawn_echo_server().await;
        let port_b = spawn_echo_server().await;
        let proxy = proxy();
        let mut target = target_with(
            "web",
            SelectionPolicy::RoundRobin,
            vec![
                Backend::new("127.0.0.1", port_a),
                Backend::new("127.0.0.1", port_b),
            ],
        );
        target.sticky_sessions = true;
        proxy.register_target(target).await.expect("register");

        let mut request = ProxyRequest::get("/");
        request.session_id = Some("session-1".to_string());

        let first = proxy
            .proxy_request("web", request.clone())
            .await
            .expect("first");
        for _ in 0..5 {
            let next = proxy
                .proxy_request("web", request.clone())
                .await
                .expect("next");
            assert_eq!(first.backend_url, next.backend_url);
        }
    }

    #[tokio::test]
    async fn test_connect_failure_retries_then_circuit_opens() {
        let proxy = proxy();
        let mut target = target_with(
            "web",
            SelectionPolicy::RoundRobin,
            // Port 1 refuses connections.
            vec![Backend::new("127.0.0.1", 1)],
        );
        target.max_retries = 0;
        target.circuit_breaker_threshold = 1;
        target.circuit_breaker_timeout_secs = 60;
        target.retry_delay_ms = 0;
        proxy.register_target(target).await.expect("register");

        // First request reaches the backend, fails, trips the breaker.
        let err = proxy.proxy_request("web", ProxyRequest::get("/")).await;
        assert!(matches!(err, Err(Error::Backend(_))));
        let state = proxy.target("web").expect("target");
        assert_eq!(
            state.backends.read()[0].breaker_state(),
            BreakerState::Open
        );

        // Second request is refused without touching the backend.
        let before = state.backends.read()[0].error_count.load(Ordering::Relaxed);
        let err = proxy.proxy_request("web", ProxyRequest::get("/")).await;
        assert!(matches!(err, Err(Error::Backend(_))));
        let after = state.backends.read()[0].error_count.load(Ordering::Relaxed);
        assert_eq!(before, after, "open breaker must not let the call through");
    }

    #[tokio::test]
    async fn test_connect_failure_fails_over_to_healthy_backend() {
        let port = spawn_echo_server().await;
        let proxy = proxy();
        let mut target = target_with(
            "web",
            SelectionPolicy::RoundRobin,
            vec![Backend::new("127.0.0.1", 1), Backend::new("127.0.0.1", port)],
        );
        target.retry_delay_ms = 0;
        proxy.register_target(target).await.expect("register");

        // Run several requests: whenever the dead backend is drawn first,
        // the retry must land on the live one.
        for _ in 0..6 {
            let response = proxy
                .proxy_request("web", ProxyRequest::get("/"))
                .await
                .expect("failover response");
            assert_eq!(response.status, 200);
            assert_eq!(response.backend_url, format!("http://127.0.0.1:{port}"));
        }
    }

    // ─── Header hygiene units ───────────────────────────────────────────────

    #[test]
    fn test_request_header_sanitization() {
        let headers = vec![
            ("Host".to_string(), "public.example".to_string()),
            ("Connection".to_string(), "keep-alive".to_string()),
            ("Accept".to_string(), "application/json".to_string()),
            ("X-Forwarded-For".to_string(), "198.51.100.7".to_string()),
        ];
        let sanitized = sanitize_request_headers(&headers, Some("203.0.113.9"));

        assert!(!sanitized.iter().any(|(n, _)| n.eq_ignore_ascii_case("host")));
        assert!(
            !sanitized
                .iter()
                .any(|(n, _)| n.eq_ignore_ascii_case("connection"))
        );
        assert!(
            sanitized
                .iter()
                .any(|(n, v)| n == "Accept" && v == "application/json")
        );
        assert!(
            sanitized
                .iter()
                .any(|(n, v)| n == "X-Real-IP" && v == "203.0.113.9")
        );
        assert!(
            sanitized
                .iter()
                .any(|(n, v)| n == "X-Forwarded-For" && v == "198.51.100.7, 203.0.113.9")
        );
        assert!(
            sanitized
                .iter()
                .any(|(n, v)| n == "X-Forwarded-Proto" && v == "http")
        );
    }

    #[test]
    fn test_ip_hash_differs_across_clients() {
        // Not a strong property, but these must not all collide.
        let hashes: HashSet<u64> = ["10.0.0.1", "10.0.0.2", "192.168.1.50", "203.0.113.9"]
            .iter()
            .map(|ip| ip_hash(ip))
            .collect();
        assert!(hashes.len() >= 3);
    }
}
