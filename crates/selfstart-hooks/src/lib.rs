//! In-process hook bus for the SelfStart control plane.
//!
//! The five control loops publish well-known lifecycle events here;
//! external collaborators (webhook dispatcher, metrics plugins) subscribe.
//! Delivery is best-effort within the publishing task: subscribers run in
//! registration order, a panicking subscriber is isolated, and the caller
//! gets one outcome per subscriber.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::RwLock;
use selfstart_proto::HookPoint;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

// ─── Subscriber contract ──────────────────────────────────────────────────────

/// A hook bus subscriber. One instance may listen on several hook points.
#[async_trait]
pub trait HookSubscriber: Send + Sync {
    /// Stable name, used in outcome lists and logs.
    fn name(&self) -> &str;

    async fn on_hook(&self, point: HookPoint, payload: &serde_json::Value)
    -> Result<(), String>;
}

/// What happened to one subscriber during a publish.
#[derive(Debug, Clone)]
pub struct HookOutcome {
    pub subscriber: String,
    pub result: Result<(), String>,
}

// ─── Hook bus ─────────────────────────────────────────────────────────────────

/// Typed publish/subscribe over the enumerated hook points.
#[derive(Default)]
pub struct HookBus {
    subscribers: RwLock<HashMap<HookPoint, Vec<Arc<dyn HookSubscriber>>>>,
}

impl HookBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber on one hook point. Invocation order is
    /// registration order.
    pub fn subscribe(&self, point: HookPoint, subscriber: Arc<dyn HookSubscriber>) {
        debug!(hook = %point, subscriber = subscriber.name(), "hook subscribed");
        self.subscribers
            .write()
            .entry(point)
            .or_default()
            .push(subscriber);
    }

    /// Register a subscriber on several hook points at once.
    pub fn subscribe_many(&self, points: &[HookPoint], subscriber: Arc<dyn HookSubscriber>) {
        for point in points {
            self.subscribe(*point, Arc::clone(&subscriber));
        }
    }

    /// Remove every registration of the named subscriber.
    pub fn unsubscribe(&self, name: &str) {
        let mut subscribers = self.subscribers.write();
        for list in subscribers.values_mut() {
            list.retain(|s| s.name() != name);
        }
        subscribers.retain(|_, list| !list.is_empty());
    }

    pub fn subscriber_count(&self, point: HookPoint) -> usize {
        self.subscribers
            .read()
            .get(&point)
            .map_or(0, |list| list.len())
    }

    /// Publish a payload to every subscriber of `point`, in registration
    /// order. A subscriber that errors or panics is captured in its outcome
    /// and does not affect the others.
    pub async fn publish(&self, point: HookPoint, payload: serde_json::Value) -> Vec<HookOutcome> {
        let targets: Vec<Arc<dyn HookSubscriber>> = self
            .subscribers
            .read()
            .get(&point)
            .cloned()
            .unwrap_or_default();

        let mut outcomes = Vec::with_capacity(targets.len());
        for subscriber in targets {
            let name = subscriber.name().to_string();
            let result = match AssertUnwindSafe(subscriber.on_hook(point, &payload))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    warn!(hook = %point, subscriber = %name, error = %e, "hook subscriber failed");
                    Err(e)
                }
                Err(panic) => {
                    let message = panic_message(panic);
                    warn!(hook = %point, subscriber = %name, error = %message, "hook subscriber panicked");
                    Err(message)
                }
            };
            outcomes.push(HookOutcome {
                subscriber: name,
                result,
            });
        }
        outcomes
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic: <non-string payload>".to_string()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    struct Recorder {
        name: String,
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl HookSubscriber for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn on_hook(
            &self,
            _point: HookPoint,
            payload: &serde_json::Value,
        ) -> Result<(), String> {
            self.seen
                .lock()
                .push(format!("{}:{}", self.name, payload["container"]));
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl HookSubscriber for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn on_hook(
            &self,
            _point: HookPoint,
            _payload: &serde_json::Value,
        ) -> Result<(), String> {
            Err("webhook endpoint unreachable".to_string())
        }
    }

    struct Panicking;

    #[async_trait]
    impl HookSubscriber for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn on_hook(
            &self,
            _point: HookPoint,
            _payload: &serde_json::Value,
        ) -> Result<(), String> {
            panic!("subscriber bug");
        }
    }

    fn recorder(name: &str, seen: &Arc<Mutex<Vec<String>>>) -> Arc<dyn HookSubscriber> {
        Arc::new(Recorder {
            name: name.to_string(),
            seen: Arc::clone(seen),
        })
    }

    #[tokio::test]
    async fn test_publish_in_registration_order() {
        let bus = HookBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe(HookPoint::AfterContainerStart, recorder("first", &seen));
        bus.subscribe(HookPoint::AfterContainerStart, recorder("second", &seen));

        let outcomes = bus
            .publish(HookPoint::AfterContainerStart, json!({"container": "db"}))
            .await;

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].subscriber, "first");
        assert_eq!(outcomes[1].subscriber, "second");
        assert_eq!(
            *seen.lock(),
            vec!["first:\"db\"".to_string(), "second:\"db\"".to_string()]
        );
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = HookBus::new();
        let outcomes = bus.publish(HookPoint::OnScalingEvent, json!({})).await;
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn test_failing_subscriber_does_not_block_others() {
        let bus = HookBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe(HookPoint::BeforeContainerStop, Arc::new(Failing));
        bus.subscribe(HookPoint::BeforeContainerStop, recorder("after", &seen));

        let outcomes = bus
            .publish(HookPoint::BeforeContainerStop, json!({"container": "db"}))
            .await;

        assert!(outcomes[0].result.is_err());
        assert!(outcomes[1].result.is_ok());
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_panicking_subscriber_is_isolated() {
        let bus = HookBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe(HookPoint::OnHealthCheck, Arc::new(Panicking));
        bus.subscribe(HookPoint::OnHealthCheck, recorder("survivor", &seen));

        let outcomes = bus
            .publish(HookPoint::OnHealthCheck, json!({"container": "db"}))
            .await;

        let err = outcomes[0].result.as_ref().expect_err("panic captured");
        assert!(err.contains("subscriber bug"), "got: {err}");
        assert!(outcomes[1].result.is_ok());
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_many_and_unsubscribe() {
        let bus = HookBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sub = recorder("multi", &seen);

        bus.subscribe_many(
            &[HookPoint::OnScalingEvent, HookPoint::OnMetricsCollection],
            sub,
        );
        assert_eq!(bus.subscriber_count(HookPoint::OnScalingEvent), 1);
        assert_eq!(bus.subscriber_count(HookPoint::OnMetricsCollection), 1);

        bus.unsubscribe("multi");
        assert_eq!(bus.subscriber_count(HookPoint::OnScalingEvent), 0);
        assert_eq!(bus.subscriber_count(HookPoint::OnMetricsCollection), 0);
    }
}
