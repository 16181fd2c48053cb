use super::transaction::CALL_TRANSACTION_TOPIC;
use super::{routing_prefix, SipMessageHandler, TransactionAggregator, TransactionState};
use crate::bus::{BusEvent, MessageBus};
use crate::config::{SipCallConfig, SipTransactionConfig, StorageConfig};
use crate::packet::{Address, AttrValue, Packet, Protocol};
use crate::storage::StorageManager;
use crate::udf::UdfDispatcher;
use crate::utils::{now_micros, time_suffix};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn sip_request(method: &str, call_id: &str, cseq_num: u32, branch: &str) -> Bytes {
    format!(
        "{method} sip:bob@example.com SIP/2.0\r\n\
         Via: SIP/2.0/UDP 10.0.0.1:5060;branch={branch}\r\n\
         From: <sip:alice@example.com>;tag=leg-a\r\n\
         To: <sip:bob@example.com>\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: {cseq_num} {method}\r\n\
         Max-Forwards: 70\r\n\
         Content-Length: 0\r\n\r\n"
    )
    .into()
}

fn sip_response(status: u16, reason: &str, method: &str, call_id: &str, cseq_num: u32, branch: &str) -> Bytes {
    format!(
        "SIP/2.0 {status} {reason}\r\n\
         Via: SIP/2.0/UDP 10.0.0.1:5060;branch={branch}\r\n\
         From: <sip:alice@example.com>;tag=leg-a\r\n\
         To: <sip:bob@example.com>;tag=leg-b\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: {cseq_num} {method}\r\n\
         Content-Length: 0\r\n\r\n"
    )
    .into()
}

fn sip_packet(payload: Bytes, timestamp: u64) -> Packet {
    Packet::new(
        timestamp,
        Address::new("10.0.0.1".parse().unwrap(), 5060).with_host("pbx-a"),
        Address::new("10.0.0.2".parse().unwrap(), 5060).with_host("pbx-b"),
        Protocol::Sip,
        payload,
    )
}

struct Pipeline {
    bus: Arc<MessageBus>,
    storage: StorageManager,
    udf: UdfDispatcher,
    dir: TempDir,
    cancel_token: CancellationToken,
}

impl Pipeline {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let cancel_token = CancellationToken::new();
        let storage = StorageManager::new(
            &StorageConfig::Local {
                root: dir.path().to_string_lossy().to_string(),
                flush_count: 10_000,
                flush_interval_ms: 3_600_000,
            },
            cancel_token.clone(),
        )
        .unwrap();
        let bus = Arc::new(MessageBus::new());
        let udf = UdfDispatcher::new(bus.clone(), Duration::from_millis(100));
        Self {
            bus,
            storage,
            udf,
            dir,
            cancel_token,
        }
    }

    fn transaction_config(&self) -> SipTransactionConfig {
        SipTransactionConfig {
            expiration_delay_ms: 20,
            termination_timeout_ms: 150,
        }
    }

    fn start_aggregator(&self, prefix: &str) {
        TransactionAggregator::new(
            prefix,
            0,
            self.bus.clone(),
            self.storage.sender(),
            self.udf.clone(),
            self.transaction_config(),
            "%Y%m%d".to_string(),
        )
        .spawn(self.cancel_token.child_token());
    }

    fn start_message_handler(&self) {
        SipMessageHandler::new(
            self.bus.clone(),
            self.storage.sender(),
            &[],
            1,
            "%Y%m%d".to_string(),
        )
        .spawn(self.cancel_token.child_token());
    }

    fn publish(&self, payload: Bytes, timestamp: u64) {
        assert_eq!(
            self.bus
                .publish("sip", BusEvent::Packet(sip_packet(payload, timestamp))),
            1
        );
    }

    async fn read_collection(&self, collection: &str) -> Vec<serde_json::Value> {
        self.storage.flush().await;
        let path = self.dir.path().join(format!("{}.jsonl", collection));
        match std::fs::read_to_string(path) {
            Ok(content) => content
                .lines()
                .map(|line| serde_json::from_str(line).unwrap())
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

/// OPTIONS request plus a matching 200 within 25 ms of packet time becomes
/// one succeeded transaction document in the day-bucketed index collection.
#[tokio::test]
async fn test_options_transaction_success() {
    let pipeline = Pipeline::new();
    pipeline.start_aggregator("sip_options");
    pipeline.start_message_handler();

    let t0 = now_micros();
    pipeline.publish(sip_request("OPTIONS", "opt-1@pbx", 1, "z9hG4bK-opt1"), t0);
    pipeline.publish(
        sip_response(200, "OK", "OPTIONS", "opt-1@pbx", 1, "z9hG4bK-opt1"),
        t0 + 25_000,
    );
    tokio::time::sleep(Duration::from_millis(150)).await;

    let suffix = time_suffix(t0, "%Y%m%d");
    let docs = pipeline
        .read_collection(&format!("sip_options_index0_{}", suffix))
        .await;
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0]["state"], "succeed");
    assert_eq!(docs[0]["created_at"], t0);
    assert_eq!(docs[0]["terminated_at"], t0 + 25_000);
    assert_eq!(docs[0]["call_id"], "opt-1@pbx");

    // both raw messages were bucketed by the packet date as well
    let raw = pipeline
        .read_collection(&format!("sip_options_raw_{}", suffix))
        .await;
    assert_eq!(raw.len(), 2);
}

#[tokio::test]
async fn test_message_transaction_success() {
    let pipeline = Pipeline::new();
    pipeline.start_aggregator("sip_message");
    pipeline.start_message_handler();

    let t0 = now_micros();
    pipeline.publish(sip_request("MESSAGE", "msg-1@pbx", 1, "z9hG4bK-msg1"), t0);
    pipeline.publish(
        sip_response(200, "OK", "MESSAGE", "msg-1@pbx", 1, "z9hG4bK-msg1"),
        t0 + 25_000,
    );
    tokio::time::sleep(Duration::from_millis(150)).await;

    let docs = pipeline
        .read_collection(&format!("sip_message_index0_{}", time_suffix(t0, "%Y%m%d")))
        .await;
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0]["state"], "succeed");
}

/// An INVITE that never gets a final response is terminated by the expiry
/// timer as failed, roughly one termination timeout after it was created.
#[tokio::test]
async fn test_unmatched_invite_expires_as_failed() {
    let pipeline = Pipeline::new();
    pipeline.start_aggregator("sip_call");
    pipeline.start_message_handler();

    let t0 = now_micros();
    pipeline.publish(sip_request("INVITE", "inv-1@pbx", 1, "z9hG4bK-inv1"), t0);
    tokio::time::sleep(Duration::from_millis(400)).await;

    let docs = pipeline
        .read_collection(&format!("sip_invite_index0_{}", time_suffix(t0, "%Y%m%d")))
        .await;
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0]["state"], "failed");
    let terminated_at = docs[0]["terminated_at"].as_u64().unwrap();
    assert!(terminated_at >= t0 + 150_000);
    assert!(terminated_at < t0 + 2_000_000);
}

/// With nothing subscribed on the UDF endpoint the transaction flows through
/// unmodified, within one execution timeout.
#[tokio::test]
async fn test_transaction_without_udf_consumer_is_emitted_unmodified() {
    let pipeline = Pipeline::new();
    let mut downstream = pipeline.bus.subscribe(CALL_TRANSACTION_TOPIC, 16);
    pipeline.start_aggregator("sip_call");
    pipeline.start_message_handler();

    let t0 = now_micros();
    pipeline.publish(sip_request("INVITE", "inv-2@pbx", 1, "z9hG4bK-inv2"), t0);
    pipeline.publish(
        sip_response(200, "OK", "INVITE", "inv-2@pbx", 1, "z9hG4bK-inv2"),
        t0 + 10_000,
    );

    let msg = tokio::time::timeout(Duration::from_millis(500), downstream.receiver.recv())
        .await
        .expect("transaction within one execution timeout")
        .unwrap();
    match &*msg.event {
        BusEvent::Transaction(transaction) => {
            assert_eq!(transaction.call_id, "inv-2@pbx");
            assert_eq!(transaction.state, TransactionState::Succeed);
            assert!(transaction.attributes.is_empty());
        }
        other => panic!("unexpected event {:?}", other),
    }
}

/// A UDF that accepts the transaction sees its string/bool attributes merged
/// into the emitted record.
#[tokio::test]
async fn test_udf_attributes_reach_the_emitted_transaction() {
    let pipeline = Pipeline::new();
    let mut udf_sub = pipeline.bus.subscribe("sip_options_transaction_udf", 16);
    tokio::spawn(async move {
        while let Some(msg) = udf_sub.receiver.recv().await {
            if let Some(reply) = msg.reply {
                let mut attributes = serde_json::Map::new();
                attributes.insert("team".to_string(), serde_json::json!("core"));
                attributes.insert("score".to_string(), serde_json::json!(1.5));
                reply
                    .send(BusEvent::UdfReply {
                        accepted: true,
                        attributes,
                    })
                    .ok();
            }
        }
    });
    pipeline.udf.refresh();

    let mut downstream = pipeline.bus.subscribe("sip_options_transaction", 16);
    pipeline.start_aggregator("sip_options");
    pipeline.start_message_handler();

    let t0 = now_micros();
    pipeline.publish(sip_request("OPTIONS", "opt-2@pbx", 7, "z9hG4bK-opt2"), t0);
    pipeline.publish(
        sip_response(200, "OK", "OPTIONS", "opt-2@pbx", 7, "z9hG4bK-opt2"),
        t0 + 5_000,
    );

    let msg = tokio::time::timeout(Duration::from_millis(500), downstream.receiver.recv())
        .await
        .expect("transaction emitted")
        .unwrap();
    match &*msg.event {
        BusEvent::Transaction(transaction) => {
            assert_eq!(
                transaction.attributes.get("team"),
                Some(&AttrValue::Str("core".to_string()))
            );
            // numeric attributes never survive the udf filter
            assert!(!transaction.attributes.contains_key("score"));
        }
        other => panic!("unexpected event {:?}", other),
    }
}

/// INVITE answered then BYE: the call aggregator tracks ringing/answered and
/// closes the call as ended with both timestamps.
#[tokio::test]
async fn test_call_lifecycle_invite_bye() {
    let pipeline = Pipeline::new();
    super::CallAggregator::new(
        0,
        pipeline.bus.clone(),
        pipeline.storage.sender(),
        pipeline.udf.clone(),
        SipCallConfig {
            expiration_delay_ms: 50,
            aggregation_timeout_ms: 60_000,
        },
        "%Y%m%d".to_string(),
    )
    .spawn(pipeline.cancel_token.child_token());
    let mut records = pipeline.bus.subscribe("sip_call_record", 16);
    pipeline.start_aggregator("sip_call");
    pipeline.start_message_handler();

    let t0 = now_micros();
    pipeline.publish(sip_request("INVITE", "call-9@pbx", 1, "z9hG4bK-c9a"), t0);
    pipeline.publish(
        sip_response(180, "Ringing", "INVITE", "call-9@pbx", 1, "z9hG4bK-c9a"),
        t0 + 50_000,
    );
    pipeline.publish(
        sip_response(200, "OK", "INVITE", "call-9@pbx", 1, "z9hG4bK-c9a"),
        t0 + 900_000,
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    pipeline.publish(sip_request("BYE", "call-9@pbx", 2, "z9hG4bK-c9b"), t0 + 30_000_000);
    pipeline.publish(
        sip_response(200, "OK", "BYE", "call-9@pbx", 2, "z9hG4bK-c9b"),
        t0 + 30_010_000,
    );

    let msg = tokio::time::timeout(Duration::from_secs(2), records.receiver.recv())
        .await
        .expect("call record emitted")
        .unwrap();
    match &*msg.event {
        BusEvent::CallRecord(call) => {
            assert_eq!(call.call_id, "call-9@pbx");
            assert_eq!(call.state, super::CallState::Ended);
            assert_eq!(call.answered_at, Some(t0 + 900_000));
            assert_eq!(call.terminated_at, Some(t0 + 30_010_000));
            assert_eq!(call.transactions.len(), 2);
            assert!(!call.legs.is_empty());
        }
        other => panic!("unexpected event {:?}", other),
    }

    let docs = pipeline
        .read_collection(&format!("sip_call_index0_{}", time_suffix(t0, "%Y%m%d")))
        .await;
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0]["state"], "ended");
}

/// A late-arriving packet lands in the raw collection of its own capture
/// date, not today's.
#[tokio::test]
async fn test_raw_documents_bucket_by_packet_date() {
    let pipeline = Pipeline::new();
    pipeline.start_message_handler();

    // 2020-09-13 12:26:40 UTC, long in the past by the time this runs
    let t0 = 1_600_000_000_000_000u64;
    pipeline.publish(sip_request("OPTIONS", "late-1@pbx", 1, "z9hG4bK-late"), t0);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let raw = pipeline.read_collection("sip_options_raw_20200913").await;
    assert_eq!(raw.len(), 1);
    assert_eq!(raw[0]["call_id"], "late-1@pbx");
}

/// Messages missing any of Call-ID/From/To are discarded before routing.
#[tokio::test]
async fn test_invalid_sip_is_discarded_silently() {
    let pipeline = Pipeline::new();
    let mut downstream = pipeline.bus.subscribe("sip_options_0", 16);
    pipeline.start_message_handler();

    let broken: Bytes = "OPTIONS sip:bob@example.com SIP/2.0\r\n\
         Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK-x\r\n\
         From: <sip:alice@example.com>;tag=leg-a\r\n\
         CSeq: 1 OPTIONS\r\n\
         Content-Length: 0\r\n\r\n"
        .into();
    pipeline.publish(broken, now_micros());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(downstream.receiver.try_recv().is_err());
}

#[test]
fn test_routing_prefixes() {
    assert_eq!(routing_prefix(&rsip::Method::Register), "sip_register");
    assert_eq!(routing_prefix(&rsip::Method::Options), "sip_options");
    assert_eq!(routing_prefix(&rsip::Method::Notify), "sip_notify");
    assert_eq!(routing_prefix(&rsip::Method::Message), "sip_message");
    assert_eq!(routing_prefix(&rsip::Method::Subscribe), "sip_subscribe");
    assert_eq!(routing_prefix(&rsip::Method::Invite), "sip_call");
    assert_eq!(routing_prefix(&rsip::Method::Bye), "sip_call");
    assert_eq!(routing_prefix(&rsip::Method::Publish), "sip_call");
}

#[test]
fn test_transaction_state_classification() {
    assert_eq!(TransactionState::from_status(200), TransactionState::Succeed);
    assert_eq!(TransactionState::from_status(302), TransactionState::Redirected);
    assert_eq!(TransactionState::from_status(401), TransactionState::Unauthorized);
    assert_eq!(TransactionState::from_status(407), TransactionState::Unauthorized);
    assert_eq!(TransactionState::from_status(487), TransactionState::Canceled);
    assert_eq!(TransactionState::from_status(486), TransactionState::Failed);
    assert_eq!(TransactionState::from_status(503), TransactionState::Failed);
    assert_eq!(TransactionState::from_status(180), TransactionState::Proceeding);
}

#[test]
fn test_transaction_key_same_for_request_and_response() {
    let request_bytes = sip_request("OPTIONS", "key-1@pbx", 3, "z9hG4bK-k1");
    let request = rsip::SipMessage::try_from(&request_bytes[..]).unwrap();
    let response_bytes = sip_response(200, "OK", "OPTIONS", "key-1@pbx", 3, "z9hG4bK-k1");
    let response = rsip::SipMessage::try_from(&response_bytes[..]).unwrap();
    let request_key = super::TransactionKey::from_message(&request).unwrap();
    let response_key = super::TransactionKey::from_message(&response).unwrap();
    assert_eq!(request_key, response_key);
    assert_eq!(request_key.branch, "z9hG4bK-k1");
}
