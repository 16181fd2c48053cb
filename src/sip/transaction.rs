use super::{
    from_tag_of, from_uri_of, to_tag_of, to_uri_of, SipTransaction, TransactionKey,
    TransactionState,
};
use crate::bus::{BusEvent, MessageBus, DEFAULT_QUEUE_DEPTH};
use crate::config::SipTransactionConfig;
use crate::packet::Packet;
use crate::storage::{StorageEvent, StorageSender};
use crate::udf::UdfDispatcher;
use crate::utils::{now_micros, stable_hash, time_suffix};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Terminated call-dialog transactions are fanned out on this topic, sharded
/// by Call-ID, so the call aggregator shards line up with the routing of the
/// messages themselves.
pub const CALL_TRANSACTION_TOPIC: &str = "sip_call_transaction";

/// Joins requests and responses into transactions for one `(prefix, shard)`
/// slot. The worker owns its map; messages and the expiry timer run through
/// one select loop.
pub struct TransactionAggregator {
    prefix: String,
    shard: usize,
    bus: Arc<MessageBus>,
    storage: StorageSender,
    udf: UdfDispatcher,
    config: SipTransactionConfig,
    time_suffix: String,
    transactions: HashMap<TransactionKey, SipTransaction>,
}

impl TransactionAggregator {
    pub fn new(
        prefix: &str,
        shard: usize,
        bus: Arc<MessageBus>,
        storage: StorageSender,
        udf: UdfDispatcher,
        config: SipTransactionConfig,
        time_suffix: String,
    ) -> Self {
        Self {
            prefix: prefix.to_string(),
            shard,
            bus,
            storage,
            udf,
            config,
            time_suffix,
            transactions: HashMap::new(),
        }
    }

    pub fn spawn(mut self, cancel_token: CancellationToken) -> JoinHandle<()> {
        let topic = format!("{}_{}", self.prefix, self.shard);
        let mut sub = self.bus.subscribe(&topic, DEFAULT_QUEUE_DEPTH);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(self.config.expiration_delay_ms.max(1)));
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    msg = sub.receiver.recv() => match msg {
                        Some(msg) => {
                            if let BusEvent::Sip { packet, message } = &*msg.event {
                                self.handle(packet, message).await;
                            }
                        }
                        None => break,
                    },
                    _ = interval.tick() => self.expire(now_micros()).await,
                }
            }
        })
    }

    async fn handle(&mut self, packet: &Packet, message: &rsip::SipMessage) {
        let key = match TransactionKey::from_message(message) {
            Some(key) => key,
            None => {
                debug!(src = %packet.src_addr, "sip message without transaction identity");
                return;
            }
        };
        let transaction = self.transactions.entry(key.clone()).or_insert_with(|| {
            SipTransaction::new(
                &key,
                packet.src_addr.clone(),
                packet.dst_addr.clone(),
                packet.timestamp,
            )
        });

        match message {
            rsip::SipMessage::Request(request) => {
                if transaction.request_method.is_none() {
                    transaction.request_method = Some(request.method.to_string());
                    transaction.src_addr = packet.src_addr.clone();
                    transaction.dst_addr = packet.dst_addr.clone();
                    transaction.from_uri = from_uri_of(message);
                    transaction.to_uri = to_uri_of(message);
                    transaction.from_tag = from_tag_of(message);
                    transaction.created_at = transaction.created_at.min(packet.timestamp);
                }
            }
            rsip::SipMessage::Response(response) => {
                let status = response.status_code.code();
                if (101..200).contains(&status) && transaction.ringing_at.is_none() {
                    transaction.ringing_at = Some(packet.timestamp);
                }
                if !transaction.has_final_response() {
                    transaction.response_status = Some(status);
                    if transaction.to_tag.is_none() {
                        transaction.to_tag = to_tag_of(message);
                    }
                    if transaction.from_tag.is_none() {
                        transaction.from_tag = from_tag_of(message);
                    }
                    if transaction.from_uri.is_none() {
                        transaction.from_uri = from_uri_of(message);
                        transaction.to_uri = to_uri_of(message);
                    }
                    if status >= 200 {
                        transaction.terminated_at = Some(packet.timestamp);
                        transaction.state = TransactionState::from_status(status);
                    } else {
                        transaction.state = TransactionState::Proceeding;
                    }
                }
            }
        }

        if self
            .transactions
            .get(&key)
            .map(|t| t.has_final_response())
            .unwrap_or(false)
        {
            if let Some(transaction) = self.transactions.remove(&key) {
                self.finish(transaction).await;
            }
        }
    }

    /// Transactions that never saw a final response terminate as failed once
    /// they outlive the termination timeout.
    async fn expire(&mut self, now_micros: u64) {
        let timeout_micros = self.config.termination_timeout_ms.saturating_mul(1_000);
        let mut expired: Vec<TransactionKey> = self
            .transactions
            .iter()
            .filter(|(_, tx)| tx.created_at.saturating_add(timeout_micros) <= now_micros)
            .map(|(key, _)| key.clone())
            .collect();
        expired.sort_by_key(|key| {
            self.transactions
                .get(key)
                .map(|tx| tx.created_at)
                .unwrap_or(0)
        });
        for key in expired {
            if let Some(mut transaction) = self.transactions.remove(&key) {
                transaction.terminated_at = Some(now_micros);
                transaction.state = TransactionState::Failed;
                self.finish(transaction).await;
            }
        }
    }

    async fn finish(&self, mut transaction: SipTransaction) {
        let method_key = transaction.method_key();
        let endpoint = format!("sip_{}_transaction_udf", method_key);
        let payload = serde_json::json!({
            "call_id": transaction.call_id,
            "cseq_method": transaction.cseq_method,
            "cseq_num": transaction.cseq_num,
            "state": transaction.state.as_str(),
            "src_addr": transaction.src_addr.to_string(),
            "dst_addr": transaction.dst_addr.to_string(),
            "created_at": transaction.created_at,
            "terminated_at": transaction.terminated_at,
        });
        let outcome = self.udf.execute(&endpoint, payload).await;
        if !outcome.accepted {
            debug!(call_id = %transaction.call_id, "transaction dropped by udf");
            return;
        }
        transaction.attributes.extend(outcome.attributes);

        let collection = format!(
            "sip_{}_index{}_{}",
            method_key,
            self.shard,
            time_suffix(transaction.created_at, &self.time_suffix)
        );
        if self
            .storage
            .send(StorageEvent::Insert {
                collection,
                document: transaction.to_document(),
            })
            .is_err()
        {
            error!("storage writer is gone, dropping transaction document");
        }

        let key_hash = stable_hash(&transaction.call_id);
        if self.prefix == "sip_call" {
            self.bus.send_sharded(
                CALL_TRANSACTION_TOPIC,
                key_hash,
                BusEvent::Transaction(transaction),
            );
        } else {
            let topic = format!("sip_{}_transaction", method_key);
            self.bus.send(&topic, BusEvent::Transaction(transaction));
        }
    }
}
