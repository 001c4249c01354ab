//! Rule-driven auto-shutdown for the SelfStart control plane.
//!
//! On every tick the engine snapshots per-container usage, evaluates each
//! enabled [`ShutdownRule`] against its target set, skips containers a
//! protection predicate covers, and executes the rule's action after the
//! grace period. Every action lands in the shutdown log table.

#![forbid(unsafe_code)]

use chrono::{DateTime, Datelike, NaiveTime, Utc};
use cron::Schedule;
use parking_lot::RwLock;
use selfstart_hooks::HookBus;
use selfstart_observe::OperationsMetrics;
use selfstart_proto::{
    Error, HookPoint, Result, ShutdownAction, ShutdownCondition, ShutdownLog, ShutdownRule,
    TimeRange,
};
use selfstart_runtime::ContainerRuntime;
use selfstart_scaler::ScaleExecutor;
use selfstart_store::JsonTable;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ─── Rule store (relational tier) ─────────────────────────────────────────────

/// Persistent shutdown rules and logs, one JSON table each.
pub struct RuleStore {
    rules_table: JsonTable,
    logs_table: JsonTable,
    rules: RwLock<HashMap<String, ShutdownRule>>,
    logs: RwLock<HashMap<String, ShutdownLog>>,
}

const LOG_RETENTION: usize = 1000;

impl RuleStore {
    pub fn open(dir: &Path) -> Self {
        let rules_table = JsonTable::new(dir, "shutdown_rules");
        let logs_table = JsonTable::new(dir, "shutdown_logs");
        let rules = rules_table.load();
        let logs = logs_table.load();
        Self {
            rules_table,
            logs_table,
            rules: RwLock::new(rules),
            logs: RwLock::new(logs),
        }
    }

    pub fn create_rule(&self, rule: ShutdownRule) -> Result<Uuid> {
        rule.validate()?;
        let id = rule.id;
        self.rules.write().insert(id.to_string(), rule);
        self.flush_rules()?;
        info!(rule = %id, "shutdown rule created");
        Ok(id)
    }

    pub fn rules(&self, enabled_only: bool) -> Vec<ShutdownRule> {
        let mut rules: Vec<ShutdownRule> = self
            .rules
            .read()
            .values()
            .filter(|r| !enabled_only || r.enabled)
            .cloned()
            .collect();
        rules.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        rules
    }

    pub fn get_rule(&self, id: Uuid) -> Result<ShutdownRule> {
        self.rules
            .read()
            .get(&id.to_string())
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("shutdown rule {id}")))
    }

    pub fn update_rule(&self, id: Uuid, mut rule: ShutdownRule) -> Result<()> {
        rule.validate()?;
        rule.id = id;
        let mut rules = self.rules.write();
        if !rules.contains_key(&id.to_string()) {
            return Err(Error::NotFound(format!("shutdown rule {id}")));
        }
        rules.insert(id.to_string(), rule);
        drop(rules);
        self.flush_rules()
    }

    pub fn delete_rule(&self, id: Uuid) -> Result<()> {
        if self.rules.write().remove(&id.to_string()).is_none() {
            return Err(Error::NotFound(format!("shutdown rule {id}")));
        }
        self.flush_rules()
    }

    fn touch(&self, id: Uuid, triggered: bool) {
        {
            let mut rules = self.rules.write();
            if let Some(rule) = rules.get_mut(&id.to_string()) {
                let now = Some(Utc::now());
                if triggered {
                    rule.last_triggered = now;
                } else {
                    rule.last_checked = now;
                }
            }
        }
        if let Err(e) = self.flush_rules() {
            debug!(error = %e, "rule bookkeeping flush failed");
        }
    }

    pub fn append_log(&self, log: ShutdownLog) {
        {
            let mut logs = self.logs.write();
            logs.insert(log.id.to_string(), log);
            if logs.len() > LOG_RETENTION {
                let mut entries: Vec<(String, DateTime<Utc>)> = logs
                    .iter()
                    .map(|(k, v)| (k.clone(), v.created_at))
                    .collect();
                entries.sort_by_key(|(_, at)| *at);
                let excess = logs.len() - LOG_RETENTION;
                for (key, _) in entries.into_iter().take(excess) {
                    logs.remove(&key);
                }
            }
        }
        if let Err(e) = self.flush_logs() {
            warn!(error = %e, "shutdown log flush failed");
        }
    }

    /// Newest-first logs, optionally filtered by rule or container.
    pub fn logs(
        &self,
        rule_id: Option<Uuid>,
        container: Option<&str>,
        limit: usize,
    ) -> Vec<ShutdownLog> {
        let mut logs: Vec<ShutdownLog> = self
            .logs
            .read()
            .values()
            .filter(|l| rule_id.is_none_or(|id| l.rule_id == id))
            .filter(|l| container.is_none_or(|c| l.container_name == c))
            .cloned()
            .collect();
        logs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        logs.truncate(limit);
        logs
    }

    fn flush_rules(&self) -> Result<()> {
        self.rules_table.save(&self.rules.read())
    }

    fn flush_logs(&self) -> Result<()> {
        self.logs_table.save(&self.logs.read())
    }
}

// ─── Activity feed ────────────────────────────────────────────────────────────

/// Live activity per container, fed by collaborators (the daemon wires the
/// reverse proxy's connection gauges in here).
#[derive(Debug, Clone, Copy)]
pub struct ActivityStats {
    pub connections: u32,
    pub last_activity: DateTime<Utc>,
}

pub trait ActivitySource: Send + Sync {
    fn activity(&self) -> HashMap<String, ActivityStats>;
}

/// Fixed activity map, for tests and for deployments without a proxy.
#[derive(Default)]
pub struct StaticActivity {
    entries: RwLock<HashMap<String, ActivityStats>>,
}

impl StaticActivity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, container: &str, connections: u32, last_activity: DateTime<Utc>) {
        self.entries.write().insert(
            container.to_string(),
            ActivityStats {
                connections,
                last_activity,
            },
        );
    }
}

impl ActivitySource for StaticActivity {
    fn activity(&self) -> HashMap<String, ActivityStats> {
        self.entries.read().clone()
    }
}

// ─── Usage snapshot ───────────────────────────────────────────────────────────

/// Per-container usage the conditions evaluate against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerUsage {
    pub name: String,
    pub labels: HashMap<String, String>,
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub rx_bytes_per_sec: f64,
    pub tx_bytes_per_sec: f64,
    pub uptime_secs: u64,
    pub connections: u32,
    pub last_activity: DateTime<Utc>,
    pub is_protected: bool,
}

// ─── Engine ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    pub check_interval_secs: u64,
    /// Gap between stop and start for the restart action.
    pub restart_gap_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 60,
            restart_gap_secs: 5,
        }
    }
}

pub struct ShutdownEngine {
    runtime: Arc<dyn ContainerRuntime>,
    rules: Arc<RuleStore>,
    hooks: Arc<HookBus>,
    metrics: Arc<OperationsMetrics>,
    activity: Arc<dyn ActivitySource>,
    scale_executor: Arc<dyn ScaleExecutor>,
    config: ShutdownConfig,
    usage: RwLock<HashMap<String, ContainerUsage>>,
    /// Last observed (rx, tx, at) per container, for rate derivation.
    net_counters: RwLock<HashMap<String, (u64, u64, DateTime<Utc>)>>,
    /// Containers another subsystem pinned against shutdown.
    protected: RwLock<HashSet<String>>,
}

impl ShutdownEngine {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        rules: Arc<RuleStore>,
        hooks: Arc<HookBus>,
        metrics: Arc<OperationsMetrics>,
        activity: Arc<dyn ActivitySource>,
        scale_executor: Arc<dyn ScaleExecutor>,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            runtime,
            rules,
            hooks,
            metrics,
            activity,
            scale_executor,
            config,
            usage: RwLock::new(HashMap::new()),
            net_counters: RwLock::new(HashMap::new()),
            protected: RwLock::new(HashSet::new()),
        }
    }

    /// Pin or release a container against every shutdown rule.
    pub fn set_protected(&self, container: &str, protected: bool) {
        let mut set = self.protected.write();
        if protected {
            set.insert(container.to_string());
        } else {
            set.remove(container);
        }
    }

    pub fn usage_snapshot(&self) -> Vec<ContainerUsage> {
        let mut all: Vec<ContainerUsage> = self.usage.read().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    // ─── Evaluation cycle ───────────────────────────────────────────────────

    pub async fn evaluate_once(&self) {
        if let Err(e) = self.refresh_usage().await {
            warn!(error = %e, "usage refresh failed, skipping evaluation");
            return;
        }

        for rule in self.rules.rules(true) {
            self.evaluate_rule(&rule).await;
            self.rules.touch(rule.id, false);
        }
    }

    async fn refresh_usage(&self) -> Result<()> {
        let containers = self.runtime.list_all().await?;
        let activity = self.activity.activity();
        let protected = self.protected.read().clone();
        let now = Utc::now();

        let mut usage = HashMap::new();
        for container in containers {
            if !container.is_running() {
                continue;
            }
            let stats = match self.runtime.stats(&container.id).await {
                Ok(stats) => stats,
                Err(e) => {
                    debug!(container = %container.name, error = %e, "stats fetch failed");
                    continue;
                }
            };

            let (rx, tx) = stats.network_totals();
            let (rx_rate, tx_rate) = {
                let mut counters = self.net_counters.write();
                let rates = match counters.get(&container.name) {
                    Some((prev_rx, prev_tx, prev_at)) => {
                        let gap = (now - *prev_at).num_seconds().max(1) as f64;
                        (
                            rx.saturating_sub(*prev_rx) as f64 / gap,
                            tx.saturating_sub(*prev_tx) as f64 / gap,
                        )
                    }
                    None => (0.0, 0.0),
                };
                counters.insert(container.name.clone(), (rx, tx, now));
                rates
            };

            let started_at = container.started_at.unwrap_or(now);
            let uptime_secs = (now - started_at).num_seconds().max(0) as u64;
            let (connections, last_activity) = match activity.get(&container.name) {
                Some(stats) => (stats.connections, stats.last_activity),
                None => (0, started_at),
            };

            usage.insert(
                container.name.clone(),
                ContainerUsage {
                    name: container.name.clone(),
                    labels: container.labels.clone(),
                    cpu_percent: stats.cpu_percent(),
                    memory_mb: stats.memory_stats.usage as f64 / (1024.0 * 1024.0),
                    rx_bytes_per_sec: rx_rate,
                    tx_bytes_per_sec: tx_rate,
                    uptime_secs,
                    connections,
                    last_activity,
                    is_protected: protected.contains(&container.name),
                },
            );
        }

        *self.usage.write() = usage;
        Ok(())
    }

    async fn evaluate_rule(&self, rule: &ShutdownRule) {
        let targets = self.target_containers(rule);
        for name in targets {
            let Some(usage) = self.usage.read().get(&name).cloned() else {
                continue;
            };

            if self.is_protected(rule, &usage) {
                self.metrics.shutdowns_protected_total.inc();
                info!(rule = %rule.name, container = %name, "shutdown skipped: container protected");
                continue;
            }

            if self.condition_met(rule, &usage) {
                self.execute(rule, &name).await;
            }
        }
    }

    /// All observed containers minus exclusions, intersected with the
    /// explicit list when non-empty, filtered by required tags.
    fn target_containers(&self, rule: &ShutdownRule) -> Vec<String> {
        let usage = self.usage.read();
        let mut targets: Vec<String> = usage
            .values()
            .filter(|u| rule.containers.is_empty() || rule.containers.contains(&u.name))
            .filter(|u| !rule.exclude_containers.contains(&u.name))
            .filter(|u| {
                rule.tags.iter().all(|tag| match tag.split_once('=') {
                    Some((key, value)) => u.labels.get(key).map(String::as_str) == Some(value),
                    None => u.labels.contains_key(tag),
                })
            })
            .map(|u| u.name.clone())
            .collect();
        targets.sort();
        targets
    }

    // ─── Protection predicates ──────────────────────────────────────────────

    fn is_protected(&self, rule: &ShutdownRule, usage: &ContainerUsage) -> bool {
        if usage.is_protected {
            return true;
        }
        if usage.uptime_secs < rule.min_uptime_secs {
            return true;
        }
        if rule.protect_if_connected && usage.connections > 0 {
            return true;
        }
        if rule.protect_if_uploading
            && usage.tx_bytes_per_sec > (rule.network_threshold_bytes * 10) as f64
        {
            return true;
        }
        false
    }

    // ─── Conditions ─────────────────────────────────────────────────────────

    fn condition_met(&self, rule: &ShutdownRule, usage: &ContainerUsage) -> bool {
        match rule.condition {
            ShutdownCondition::Inactivity => {
                let idle = (Utc::now() - usage.last_activity).num_seconds().max(0) as u64;
                idle >= rule.inactivity_threshold_secs
            }
            ShutdownCondition::LowResources => {
                usage.cpu_percent <= rule.cpu_threshold
                    && usage.memory_mb <= rule.memory_threshold_mb
            }
            ShutdownCondition::IdleTime => {
                usage.cpu_percent <= rule.cpu_threshold
                    && usage.rx_bytes_per_sec + usage.tx_bytes_per_sec
                        <= rule.network_threshold_bytes as f64
                    && usage.connections == 0
            }
            ShutdownCondition::Schedule => schedule_matches(rule, Utc::now()),
        }
    }

    // ─── Execution ──────────────────────────────────────────────────────────

    async fn execute(&self, rule: &ShutdownRule, container: &str) {
        if rule.notification {
            self.metrics.hook_publishes_total.inc();
            self.hooks
                .publish(
                    HookPoint::OnWebhookTrigger,
                    serde_json::json!({
                        "event": "shutdown_pending",
                        "container": container,
                        "rule": rule.name,
                        "action": rule.action,
                        "grace_period_secs": rule.grace_period_secs,
                    }),
                )
                .await;
        }

        if rule.grace_period_secs > 0 {
            info!(rule = %rule.name, container, grace = rule.grace_period_secs, "grace period before shutdown");
            tokio::time::sleep(Duration::from_secs(rule.grace_period_secs)).await;
        }

        let outcome = self.perform_action(rule.action, container).await;
        let success = outcome.is_ok();
        let scheduled_restart = if success && rule.auto_restart {
            rule.restart_schedule
                .as_deref()
                .and_then(|expr| next_cron_occurrence(expr, Utc::now()))
        } else {
            None
        };

        if success {
            self.metrics.shutdowns_executed_total.inc();
            info!(rule = %rule.name, container, action = %rule.action, "shutdown action executed");
        } else {
            warn!(rule = %rule.name, container, action = %rule.action, error = ?outcome.as_ref().err(), "shutdown action failed");
        }

        self.rules.append_log(ShutdownLog {
            id: Uuid::new_v4(),
            rule_id: rule.id,
            container_name: container.to_string(),
            action: rule.action,
            reason: format!("condition: {}", rule.condition),
            success,
            error_message: outcome.err().map(|e| e.to_string()),
            created_at: Utc::now(),
            scheduled_restart,
        });
        self.rules.touch(rule.id, true);
    }

    async fn perform_action(&self, action: ShutdownAction, container: &str) -> Result<()> {
        match action {
            ShutdownAction::Stop => self.runtime.stop(container, 30).await,
            ShutdownAction::Pause => self.runtime.pause(container).await,
            ShutdownAction::Restart => {
                self.runtime.stop(container, 30).await?;
                tokio::time::sleep(Duration::from_secs(self.config.restart_gap_secs)).await;
                self.runtime.start(container).await
            }
            ShutdownAction::ScaleDown => self.scale_executor.scale_to(container, 0).await,
        }
    }

    // ─── Loop ───────────────────────────────────────────────────────────────

    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let engine = Arc::clone(self);
        let mut shutdown = shutdown.clone();
        vec![tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(engine.config.check_interval_secs));
            loop {
                tokio::select! {
                    _ = ticker.tick() => engine.evaluate_once().await,
                    _ = shutdown.changed() => {
                        info!("shutdown evaluation loop stopping");
                        break;
                    }
                }
            }
        })]
    }
}

// ─── Schedule helpers ─────────────────────────────────────────────────────────

fn schedule_matches(rule: &ShutdownRule, now: DateTime<Utc>) -> bool {
    if !rule.days_of_week.is_empty() {
        let weekday = now.date_naive().weekday().num_days_from_monday() as u8;
        if !rule.days_of_week.contains(&weekday) {
            return false;
        }
    }

    if !rule.time_ranges.is_empty() {
        let current = now.time();
        return rule
            .time_ranges
            .iter()
            .any(|range| match (parse_time(&range.start), parse_time(&range.end)) {
                (Some(start), Some(end)) => start <= current && current <= end,
                _ => {
                    warn!(rule = %rule.name, "unparseable time range");
                    false
                }
            });
    }

    if let Some(expr) = &rule.cron_schedule {
        return match next_cron_occurrence(expr, now) {
            Some(next) => (next - now).num_seconds() <= 60,
            None => false,
        };
    }

    false
}

fn parse_time(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .ok()
}

fn next_cron_occurrence(expr: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match Schedule::from_str(expr) {
        Ok(schedule) => schedule.after(&after).next(),
        Err(e) => {
            warn!(expr, error = %e, "invalid cron expression");
            None
        }
    }
}

/// Helper for [`TimeRange`] construction in configs and tests.
pub fn time_range(start: &str, end: &str) -> TimeRange {
    TimeRange {
        start: start.to_string(),
        end: end.to_string(),
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
