use crate::packet::Packet;
use crate::rtpr::{RtprSession, SdpSession};
use crate::sip::{SipCall, SipTransaction};
use anyhow::{anyhow, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

pub const DEFAULT_QUEUE_DEPTH: usize = 1024;

/// Everything that travels between workers. Events are shared by reference
/// (`Arc`), there is no serialization round-trip inside the process.
#[derive(Debug)]
pub enum BusEvent {
    Packet(Packet),
    Sip {
        packet: Packet,
        message: rsip::SipMessage,
    },
    Transaction(SipTransaction),
    CallRecord(SipCall),
    SdpInfo(Vec<SdpSession>),
    Media(RtprSession),
    UdfRequest(serde_json::Value),
    UdfReply {
        accepted: bool,
        attributes: serde_json::Map<String, serde_json::Value>,
    },
}

pub struct BusMessage {
    pub event: Arc<BusEvent>,
    pub reply: Option<oneshot::Sender<BusEvent>>,
}

pub struct Subscription {
    pub id: u64,
    pub receiver: mpsc::Receiver<BusMessage>,
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<BusMessage>,
}

#[derive(Default)]
struct TopicState {
    subscribers: Vec<Subscriber>,
    next: usize,
}

/// In-process topic bus. Point-to-point `send` is round-robin,
/// `send_sharded` picks the subscriber by key so one key always lands on the
/// same consumer, `publish` is broadcast, `request` is send plus a one-shot
/// reply channel. Queues are bounded; a full queue drops the message with a
/// warning counter rather than stalling the sender.
pub struct MessageBus {
    topics: Mutex<HashMap<String, TopicState>>,
    next_subscriber_id: AtomicU64,
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            next_subscriber_id: AtomicU64::new(1),
        }
    }

    /// Register a handler on `topic`. Subscribers on one topic are addressed
    /// in subscription order, which is what keeps sharded sends stable.
    pub fn subscribe(&self, topic: &str, depth: usize) -> Subscription {
        let (tx, rx) = mpsc::channel(depth.max(1));
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let mut topics = self.topics.lock().expect("bus lock");
        topics
            .entry(topic.to_string())
            .or_default()
            .subscribers
            .push(Subscriber { id, tx });
        Subscription { id, receiver: rx }
    }

    pub fn unsubscribe(&self, topic: &str, id: u64) {
        let mut topics = self.topics.lock().expect("bus lock");
        if let Some(state) = topics.get_mut(topic) {
            state.subscribers.retain(|s| s.id != id);
            if state.subscribers.is_empty() {
                topics.remove(topic);
            }
        }
    }

    /// Topics that currently have at least one live subscriber.
    pub fn endpoints(&self) -> HashSet<String> {
        let mut topics = self.topics.lock().expect("bus lock");
        topics.retain(|_, state| {
            state.subscribers.retain(|s| !s.tx.is_closed());
            !state.subscribers.is_empty()
        });
        topics.keys().cloned().collect()
    }

    /// Broadcast to every subscriber. Returns the delivered count.
    pub fn publish(&self, topic: &str, event: BusEvent) -> usize {
        let event = Arc::new(event);
        let mut topics = self.topics.lock().expect("bus lock");
        let state = match topics.get_mut(topic) {
            Some(state) => state,
            None => {
                debug!(topic, "publish without subscribers");
                return 0;
            }
        };
        let mut delivered = 0;
        state.subscribers.retain(|subscriber| {
            match subscriber.tx.try_send(BusMessage {
                event: event.clone(),
                reply: None,
            }) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(topic, "bus queue full, dropping message");
                    crate::metrics::bus::dropped(topic);
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
        delivered
    }

    /// Deliver to one subscriber, chosen round-robin.
    pub fn send(&self, topic: &str, event: BusEvent) -> bool {
        self.send_message(topic, event, None, None)
    }

    /// Deliver to the subscriber at `key_hash mod subscriber_count`. The same
    /// key always reaches the same consumer while the topology stands.
    pub fn send_sharded(&self, topic: &str, key_hash: u64, event: BusEvent) -> bool {
        self.send_message(topic, event, None, Some(key_hash))
    }

    /// Send and await a single reply, bounded by `timeout`.
    pub async fn request(
        &self,
        topic: &str,
        event: BusEvent,
        timeout: Duration,
    ) -> Result<BusEvent> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if !self.send_message(topic, event, Some(reply_tx), None) {
            return Err(anyhow!("no subscriber on topic {}", topic));
        }
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(anyhow!("subscriber on {} dropped the reply", topic)),
            Err(_) => Err(anyhow!("request on {} timed out", topic)),
        }
    }

    fn send_message(
        &self,
        topic: &str,
        event: BusEvent,
        reply: Option<oneshot::Sender<BusEvent>>,
        key_hash: Option<u64>,
    ) -> bool {
        let mut topics = self.topics.lock().expect("bus lock");
        let state = match topics.get_mut(topic) {
            Some(state) => state,
            None => {
                debug!(topic, "send without subscribers");
                return false;
            }
        };
        state.subscribers.retain(|s| !s.tx.is_closed());
        if state.subscribers.is_empty() {
            debug!(topic, "send without subscribers");
            return false;
        }
        let index = match key_hash {
            Some(key) => (key % state.subscribers.len() as u64) as usize,
            None => {
                let index = state.next % state.subscribers.len();
                state.next = state.next.wrapping_add(1);
                index
            }
        };
        match state.subscribers[index].tx.try_send(BusMessage {
            event: Arc::new(event),
            reply,
        }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(topic, "bus queue full, dropping message");
                crate::metrics::bus::dropped(topic);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                state.subscribers.remove(index);
                false
            }
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet_event() -> BusEvent {
        use crate::packet::{Address, Packet, Protocol};
        BusEvent::Packet(Packet::new(
            1_000,
            Address::new("10.0.0.1".parse().unwrap(), 5060),
            Address::new("10.0.0.2".parse().unwrap(), 5060),
            Protocol::Sip,
            bytes::Bytes::new(),
        ))
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = MessageBus::new();
        let mut first = bus.subscribe("events", 8);
        let mut second = bus.subscribe("events", 8);
        assert_eq!(bus.publish("events", packet_event()), 2);
        assert!(first.receiver.recv().await.is_some());
        assert!(second.receiver.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_send_round_robins() {
        let bus = MessageBus::new();
        let mut first = bus.subscribe("work", 8);
        let mut second = bus.subscribe("work", 8);
        for _ in 0..4 {
            assert!(bus.send("work", packet_event()));
        }
        // two each, in FIFO order per subscriber
        for sub in [&mut first, &mut second] {
            assert!(sub.receiver.try_recv().is_ok());
            assert!(sub.receiver.try_recv().is_ok());
            assert!(sub.receiver.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn test_send_sharded_is_deterministic() {
        let bus = MessageBus::new();
        let mut first = bus.subscribe("shards", 32);
        let mut second = bus.subscribe("shards", 32);
        let key = crate::utils::stable_hash("call-id-1");
        for _ in 0..8 {
            assert!(bus.send_sharded("shards", key, packet_event()));
        }
        let first_count = std::iter::from_fn(|| first.receiver.try_recv().ok()).count();
        let second_count = std::iter::from_fn(|| second.receiver.try_recv().ok()).count();
        assert!(
            (first_count == 8 && second_count == 0) || (first_count == 0 && second_count == 8),
            "one shard must own the key, got {}/{}",
            first_count,
            second_count
        );
    }

    #[tokio::test]
    async fn test_request_reply() {
        let bus = Arc::new(MessageBus::new());
        let mut sub = bus.subscribe("udf", 8);
        tokio::spawn(async move {
            while let Some(msg) = sub.receiver.recv().await {
                if let Some(reply) = msg.reply {
                    reply
                        .send(BusEvent::UdfReply {
                            accepted: true,
                            attributes: serde_json::Map::new(),
                        })
                        .ok();
                }
            }
        });
        let reply = bus
            .request(
                "udf",
                BusEvent::UdfRequest(serde_json::json!({})),
                Duration::from_millis(200),
            )
            .await
            .expect("reply");
        assert!(matches!(reply, BusEvent::UdfReply { accepted: true, .. }));
    }

    #[tokio::test]
    async fn test_request_times_out_without_reply() {
        let bus = MessageBus::new();
        let _sub = bus.subscribe("udf", 8);
        let result = bus
            .request(
                "udf",
                BusEvent::UdfRequest(serde_json::json!({})),
                Duration::from_millis(20),
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_endpoints_tracks_subscriptions() {
        let bus = MessageBus::new();
        let sub = bus.subscribe("sip", 8);
        assert!(bus.endpoints().contains("sip"));
        bus.unsubscribe("sip", sub.id);
        assert!(!bus.endpoints().contains("sip"));
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let bus = MessageBus::new();
        let mut sub = bus.subscribe("slow", 1);
        assert_eq!(bus.publish("slow", packet_event()), 1);
        assert_eq!(bus.publish("slow", packet_event()), 0);
        assert!(sub.receiver.try_recv().is_ok());
        assert!(sub.receiver.try_recv().is_err());
    }
}
