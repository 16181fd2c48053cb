use crate::bus::{BusEvent, MessageBus};
use crate::packet::AttrValue;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Result of a UDF invocation. The no-op success is also the failure result:
/// a missing or broken UDF must never cost telemetry.
#[derive(Debug)]
pub struct UdfOutcome {
    pub accepted: bool,
    pub attributes: HashMap<String, AttrValue>,
}

impl UdfOutcome {
    pub fn pass() -> Self {
        Self {
            accepted: true,
            attributes: HashMap::new(),
        }
    }

    fn drop_record() -> Self {
        Self {
            accepted: false,
            attributes: HashMap::new(),
        }
    }
}

struct UdfDispatcherInner {
    bus: Arc<MessageBus>,
    endpoints: RwLock<HashSet<String>>,
    execution_timeout: Duration,
}

/// Invokes user-defined functions over the bus. Endpoint discovery is a
/// periodic snapshot, so a UDF registered between refreshes is simply not
/// called yet; an endpoint absent from the snapshot resolves synchronously.
#[derive(Clone)]
pub struct UdfDispatcher {
    inner: Arc<UdfDispatcherInner>,
}

impl UdfDispatcher {
    pub fn new(bus: Arc<MessageBus>, execution_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(UdfDispatcherInner {
                bus,
                endpoints: RwLock::new(HashSet::new()),
                execution_timeout,
            }),
        }
    }

    /// Re-snapshot the currently subscribed topic names.
    pub fn refresh(&self) {
        let endpoints = self.inner.bus.endpoints();
        *self.inner.endpoints.write().expect("udf endpoints lock") = endpoints;
    }

    pub fn spawn_refresh(
        &self,
        check_period: Duration,
        cancel_token: CancellationToken,
    ) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(check_period.max(Duration::from_millis(1)));
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    _ = interval.tick() => dispatcher.refresh(),
                }
            }
        })
    }

    /// Run the UDF at `endpoint` over `payload`. The payload is handed to the
    /// UDF with an empty `attributes` object to fill; the reply decides
    /// whether the record continues and which attributes it gains.
    pub async fn execute(&self, endpoint: &str, mut payload: serde_json::Value) -> UdfOutcome {
        {
            let endpoints = self.inner.endpoints.read().expect("udf endpoints lock");
            if !endpoints.contains(endpoint) {
                return UdfOutcome::pass();
            }
        }
        if let serde_json::Value::Object(map) = &mut payload {
            map.entry("attributes")
                .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
        }
        let request = BusEvent::UdfRequest(payload);
        match self
            .inner
            .bus
            .request(endpoint, request, self.inner.execution_timeout)
            .await
        {
            Ok(BusEvent::UdfReply {
                accepted,
                attributes,
            }) => {
                if !accepted {
                    debug!(endpoint, "udf rejected record");
                    return UdfOutcome::drop_record();
                }
                let mut retained = HashMap::new();
                for (name, value) in attributes {
                    match value {
                        serde_json::Value::String(s) => {
                            retained.insert(name, AttrValue::Str(s));
                        }
                        serde_json::Value::Bool(b) => {
                            retained.insert(name, AttrValue::Bool(b));
                        }
                        other => {
                            warn!(endpoint, attribute = %name, ?other, "dropping non string/bool udf attribute");
                        }
                    }
                }
                UdfOutcome {
                    accepted: true,
                    attributes: retained,
                }
            }
            Ok(_) => {
                error!(endpoint, "udf replied with an unexpected event");
                UdfOutcome::pass()
            }
            Err(e) => {
                error!(endpoint, "udf execution failed: {}", e);
                UdfOutcome::pass()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_udf(
        bus: &Arc<MessageBus>,
        endpoint: &str,
        accepted: bool,
        attributes: serde_json::Value,
    ) {
        let mut sub = bus.subscribe(endpoint, 8);
        tokio::spawn(async move {
            while let Some(msg) = sub.receiver.recv().await {
                if let Some(reply) = msg.reply {
                    let attributes = attributes
                        .as_object()
                        .cloned()
                        .unwrap_or_default();
                    reply
                        .send(BusEvent::UdfReply {
                            accepted,
                            attributes,
                        })
                        .ok();
                }
            }
        });
    }

    #[tokio::test]
    async fn test_unknown_endpoint_is_noop_success() {
        let bus = Arc::new(MessageBus::new());
        let dispatcher = UdfDispatcher::new(bus, Duration::from_millis(100));
        let outcome = dispatcher
            .execute("sip_invite_transaction_udf", serde_json::json!({}))
            .await;
        assert!(outcome.accepted);
        assert!(outcome.attributes.is_empty());
    }

    #[tokio::test]
    async fn test_subscriber_invisible_until_refresh() {
        let bus = Arc::new(MessageBus::new());
        let dispatcher = UdfDispatcher::new(bus.clone(), Duration::from_millis(100));
        spawn_udf(&bus, "gate_udf", false, serde_json::json!({}));

        // not in the snapshot yet: record passes without asking the udf
        let outcome = dispatcher.execute("gate_udf", serde_json::json!({})).await;
        assert!(outcome.accepted);

        dispatcher.refresh();
        let outcome = dispatcher.execute("gate_udf", serde_json::json!({})).await;
        assert!(!outcome.accepted);
    }

    #[tokio::test]
    async fn test_attribute_filtering() {
        let bus = Arc::new(MessageBus::new());
        let dispatcher = UdfDispatcher::new(bus.clone(), Duration::from_millis(100));
        spawn_udf(
            &bus,
            "tag_udf",
            true,
            serde_json::json!({"tenant": "acme", "flagged": true, "score": 0.9}),
        );
        dispatcher.refresh();

        let outcome = dispatcher.execute("tag_udf", serde_json::json!({})).await;
        assert!(outcome.accepted);
        assert_eq!(
            outcome.attributes.get("tenant"),
            Some(&AttrValue::Str("acme".to_string()))
        );
        assert_eq!(
            outcome.attributes.get("flagged"),
            Some(&AttrValue::Bool(true))
        );
        assert!(!outcome.attributes.contains_key("score"));
    }

    #[tokio::test]
    async fn test_timeout_is_noop_success() {
        let bus = Arc::new(MessageBus::new());
        let dispatcher = UdfDispatcher::new(bus.clone(), Duration::from_millis(30));
        // subscriber that never replies
        let _sub = bus.subscribe("slow_udf", 8);
        dispatcher.refresh();

        let started = std::time::Instant::now();
        let outcome = dispatcher.execute("slow_udf", serde_json::json!({})).await;
        assert!(outcome.accepted);
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
