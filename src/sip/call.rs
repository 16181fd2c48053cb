use super::transaction::CALL_TRANSACTION_TOPIC;
use super::{CallState, SipCall, SipTransaction};
use crate::bus::{BusEvent, MessageBus, DEFAULT_QUEUE_DEPTH};
use crate::config::SipCallConfig;
use crate::storage::{StorageEvent, StorageSender};
use crate::udf::UdfDispatcher;
use crate::utils::{now_micros, now_millis, time_suffix};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Folds terminated transactions into calls keyed by Call-ID. One worker per
/// shard; the transaction stage routes by the same Call-ID hash, so all
/// transactions of a dialog arrive here in termination order.
pub struct CallAggregator {
    shard: usize,
    bus: Arc<MessageBus>,
    storage: StorageSender,
    udf: UdfDispatcher,
    config: SipCallConfig,
    time_suffix: String,
    calls: HashMap<String, SipCall>,
}

impl CallAggregator {
    pub fn new(
        shard: usize,
        bus: Arc<MessageBus>,
        storage: StorageSender,
        udf: UdfDispatcher,
        config: SipCallConfig,
        time_suffix: String,
    ) -> Self {
        Self {
            shard,
            bus,
            storage,
            udf,
            config,
            time_suffix,
            calls: HashMap::new(),
        }
    }

    pub fn spawn(mut self, cancel_token: CancellationToken) -> JoinHandle<()> {
        let mut sub = self.bus.subscribe(CALL_TRANSACTION_TOPIC, DEFAULT_QUEUE_DEPTH);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(self.config.expiration_delay_ms.max(1)));
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    msg = sub.receiver.recv() => match msg {
                        Some(msg) => {
                            if let BusEvent::Transaction(transaction) = &*msg.event {
                                self.handle(transaction).await;
                            }
                        }
                        None => break,
                    },
                    _ = interval.tick() => self.expire(now_millis()).await,
                }
            }
        })
    }

    async fn handle(&mut self, transaction: &SipTransaction) {
        let call = self
            .calls
            .entry(transaction.call_id.clone())
            .or_insert_with(|| {
                SipCall::new(
                    transaction.call_id.clone(),
                    transaction.created_at,
                    now_millis(),
                )
            });
        call.last_activity_at = now_millis();
        call.record_leg(transaction.from_tag.clone(), transaction.to_tag.clone());

        match transaction.cseq_method.as_str() {
            "INVITE" => {
                if call.state == CallState::Trying && transaction.ringing_at.is_some() {
                    call.state = CallState::Ringing;
                }
                match transaction.response_status {
                    Some(status) if (200..300).contains(&status) => {
                        call.state = CallState::Answered;
                        call.answered_at = transaction.terminated_at;
                    }
                    Some(status) if status >= 300 => {
                        call.state = CallState::Failed;
                        call.terminated_at =
                            transaction.terminated_at.or_else(|| Some(now_micros()));
                    }
                    _ => {}
                }
            }
            "BYE" => {
                call.state = CallState::Ended;
                call.terminated_at = transaction.terminated_at.or_else(|| Some(now_micros()));
            }
            _ => {}
        }
        call.transactions.push(transaction.clone());

        if call.state.is_terminal() {
            if let Some(call) = self.calls.remove(&transaction.call_id) {
                self.finish(call).await;
            }
        }
    }

    /// Calls with no activity past the aggregation timeout are closed out as
    /// failed so a lost BYE cannot pin state forever.
    async fn expire(&mut self, now_millis: u64) {
        let timeout = self.config.aggregation_timeout_ms;
        let expired: Vec<String> = self
            .calls
            .iter()
            .filter(|(_, call)| call.last_activity_at.saturating_add(timeout) < now_millis)
            .map(|(call_id, _)| call_id.clone())
            .collect();
        for call_id in expired {
            if let Some(mut call) = self.calls.remove(&call_id) {
                if !call.state.is_terminal() {
                    call.state = CallState::Failed;
                    call.terminated_at = Some(now_micros());
                }
                self.finish(call).await;
            }
        }
    }

    async fn finish(&self, mut call: SipCall) {
        let payload = serde_json::json!({
            "call_id": call.call_id,
            "state": call.state,
            "created_at": call.created_at,
            "terminated_at": call.terminated_at,
            "transaction_count": call.transactions.len(),
        });
        let outcome = self.udf.execute("sip_call_udf", payload).await;
        if !outcome.accepted {
            debug!(call_id = %call.call_id, "call dropped by udf");
            return;
        }
        call.attributes.extend(outcome.attributes);

        let collection = format!(
            "sip_call_index{}_{}",
            self.shard,
            time_suffix(call.created_at, &self.time_suffix)
        );
        if self
            .storage
            .send(StorageEvent::Insert {
                collection,
                document: call.to_document(),
            })
            .is_err()
        {
            error!("storage writer is gone, dropping call document");
        }

        self.bus.publish("sip_call_record", BusEvent::CallRecord(call));
    }
}
