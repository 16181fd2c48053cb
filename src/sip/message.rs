use super::{call_id_of, cseq_of, from_uri_of, method_key, routing_prefix, to_uri_of};
use crate::bus::{BusEvent, MessageBus, DEFAULT_QUEUE_DEPTH};
use crate::packet::{Packet, Protocol};
use crate::storage::{StorageEvent, StorageSender};
use crate::utils::{shard_index, time_suffix};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// First SIP stage: parse, validate, meter, persist the raw message and
/// forward to the right aggregator shard.
pub struct SipMessageHandler {
    bus: Arc<MessageBus>,
    storage: StorageSender,
    exclusions: HashSet<String>,
    instances: usize,
    time_suffix: String,
}

impl SipMessageHandler {
    pub fn new(
        bus: Arc<MessageBus>,
        storage: StorageSender,
        exclusions: &[String],
        instances: usize,
        time_suffix: String,
    ) -> Self {
        Self {
            bus,
            storage,
            exclusions: exclusions.iter().map(|m| m.to_uppercase()).collect(),
            instances: instances.max(1),
            time_suffix,
        }
    }

    pub fn spawn(self, cancel_token: CancellationToken) -> JoinHandle<()> {
        let mut sub = self.bus.subscribe("sip", DEFAULT_QUEUE_DEPTH);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    msg = sub.receiver.recv() => match msg {
                        Some(msg) => {
                            if let BusEvent::Packet(packet) = &*msg.event {
                                if packet.protocol == Protocol::Sip {
                                    self.handle(packet);
                                }
                            }
                        }
                        None => break,
                    },
                }
            }
        })
    }

    fn handle(&self, packet: &Packet) {
        // Raw bytes, not a str round-trip: SIP-I carries binary ISUP bodies.
        let message = match rsip::SipMessage::try_from(&packet.payload[..]) {
            Ok(message) => message,
            Err(e) => {
                debug!(src = %packet.src_addr, "sip parse failed: {}", e);
                crate::metrics::ingest::packets_dropped("sip_parse");
                return;
            }
        };

        let call_id = call_id_of(&message);
        let from_uri = from_uri_of(&message);
        let to_uri = to_uri_of(&message);
        let (call_id, to_uri) = match (call_id, from_uri, to_uri) {
            (Some(call_id), Some(_), Some(to_uri)) => (call_id, to_uri),
            _ => {
                debug!(src = %packet.src_addr, "sip message without Call-ID/From/To");
                crate::metrics::ingest::packets_dropped("sip_invalid");
                return;
            }
        };

        // An unparsable CSeq method is outside the known method set.
        let (_, cseq_method) = match cseq_of(&message) {
            Some(cseq) => cseq,
            None => {
                debug!(call_id = %call_id, "sip message with unusable CSeq");
                crate::metrics::ingest::packets_dropped("sip_unknown_method");
                return;
            }
        };
        let cseq_name = cseq_method.to_string();

        let (method_name, status_code) = match &message {
            rsip::SipMessage::Request(request) => (Some(request.method.to_string()), None),
            rsip::SipMessage::Response(response) => (None, Some(response.status_code.code())),
        };
        crate::metrics::sip::message(
            &cseq_name,
            method_name.as_deref(),
            status_code,
            packet.src_addr.host.as_deref(),
            packet.dst_addr.host.as_deref(),
        );

        // Exclusions silence the raw write and forwarding, never the metrics.
        if self.exclusions.contains(&cseq_name.to_uppercase()) {
            return;
        }

        self.write_raw(packet, &call_id, &cseq_name, method_name.as_deref(), status_code);

        let prefix = routing_prefix(&cseq_method);
        let shard = match prefix {
            "sip_call" => shard_index(&call_id, self.instances),
            // one address-of-record must stay on one shard (RFC 3261 §10.2)
            "sip_register" => shard_index(&to_uri, self.instances),
            _ => 0,
        };
        let topic = format!("{}_{}", prefix, shard);
        if !self.bus.send(
            &topic,
            BusEvent::Sip {
                packet: packet.clone(),
                message,
            },
        ) {
            debug!(topic = %topic, "no aggregator for sip message");
        }
    }

    fn write_raw(
        &self,
        packet: &Packet,
        call_id: &str,
        cseq_name: &str,
        method_name: Option<&str>,
        status_code: Option<u16>,
    ) {
        let collection = format!(
            "sip_{}_raw_{}",
            method_key(cseq_name),
            time_suffix(packet.timestamp, &self.time_suffix)
        );
        let document = serde_json::json!({
            "timestamp": packet.timestamp,
            "src_addr": packet.src_addr.to_string(),
            "src_host": packet.src_addr.host,
            "dst_addr": packet.dst_addr.to_string(),
            "dst_host": packet.dst_addr.host,
            "call_id": call_id,
            "cseq_method": cseq_name,
            "method": method_name,
            "status_code": status_code,
            "payload": String::from_utf8_lossy(&packet.payload),
        });
        if self
            .storage
            .send(StorageEvent::Insert {
                collection,
                document,
            })
            .is_err()
        {
            error!("storage writer is gone, dropping sip raw document");
        }
    }
}
