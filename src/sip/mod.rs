pub mod call;
pub mod message;
pub mod transaction;

#[cfg(test)]
mod tests;

use crate::packet::{Address, AttrValue};
use rsip::headers::ToTypedHeader;
use rsip::prelude::{HeadersExt, UntypedHeader};
use rsip::SipMessage;
use serde::Serialize;
use std::collections::HashMap;

pub use call::CallAggregator;
pub use message::SipMessageHandler;
pub use transaction::TransactionAggregator;

/// Registration-class methods get their own routing prefix; everything else
/// belongs to a call dialog and shares the `sip_call` prefix.
pub fn routing_prefix(method: &rsip::Method) -> &'static str {
    match method {
        rsip::Method::Register => "sip_register",
        rsip::Method::Notify => "sip_notify",
        rsip::Method::Message => "sip_message",
        rsip::Method::Options => "sip_options",
        rsip::Method::Subscribe => "sip_subscribe",
        _ => "sip_call",
    }
}

/// Prefixes that run on a single shard. `sip_call` and `sip_register` are
/// sharded by Call-ID and To URI respectively.
pub const SINGLE_SHARD_PREFIXES: [&str; 4] =
    ["sip_notify", "sip_message", "sip_options", "sip_subscribe"];

pub fn method_key(method: &str) -> String {
    method.to_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Trying,
    Proceeding,
    Succeed,
    Failed,
    Redirected,
    Canceled,
    Unauthorized,
}

impl TransactionState {
    pub fn from_status(code: u16) -> Self {
        match code {
            401 | 407 => TransactionState::Unauthorized,
            487 => TransactionState::Canceled,
            100..=199 => TransactionState::Proceeding,
            200..=299 => TransactionState::Succeed,
            300..=399 => TransactionState::Redirected,
            _ => TransactionState::Failed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionState::Trying => "trying",
            TransactionState::Proceeding => "proceeding",
            TransactionState::Succeed => "succeed",
            TransactionState::Failed => "failed",
            TransactionState::Redirected => "redirected",
            TransactionState::Canceled => "canceled",
            TransactionState::Unauthorized => "unauthorized",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Trying,
    Ringing,
    Answered,
    Ended,
    Failed,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Ended | CallState::Failed)
    }
}

/// Transaction identity per RFC 3261: requests and responses carry the same
/// Call-ID, CSeq and topmost Via branch, so both sides derive the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub call_id: String,
    pub cseq_num: u32,
    pub cseq_method: String,
    pub branch: String,
}

impl TransactionKey {
    pub fn from_message(message: &SipMessage) -> Option<Self> {
        let call_id = call_id_of(message)?;
        let (cseq_num, cseq_method) = cseq_of(message)?;
        let branch = branch_of(message).unwrap_or_default();
        Some(Self {
            call_id,
            cseq_num,
            cseq_method: cseq_method.to_string(),
            branch,
        })
    }
}

pub fn call_id_of(message: &SipMessage) -> Option<String> {
    let header = match message {
        SipMessage::Request(request) => request.call_id_header(),
        SipMessage::Response(response) => response.call_id_header(),
    };
    header
        .ok()
        .map(|h| h.value().trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn cseq_of(message: &SipMessage) -> Option<(u32, rsip::Method)> {
    let header = match message {
        SipMessage::Request(request) => request.cseq_header(),
        SipMessage::Response(response) => response.cseq_header(),
    }
    .ok()?;
    let typed = header.typed().ok()?;
    Some((typed.seq, typed.method))
}

pub fn branch_of(message: &SipMessage) -> Option<String> {
    let header = match message {
        SipMessage::Request(request) => request.via_header(),
        SipMessage::Response(response) => response.via_header(),
    }
    .ok()?;
    header
        .typed()
        .ok()?
        .branch()
        .map(|branch| branch.to_string())
}

pub fn from_uri_of(message: &SipMessage) -> Option<String> {
    let header = match message {
        SipMessage::Request(request) => request.from_header(),
        SipMessage::Response(response) => response.from_header(),
    }
    .ok()?;
    header.uri().ok().map(|uri| uri.to_string())
}

pub fn to_uri_of(message: &SipMessage) -> Option<String> {
    let header = match message {
        SipMessage::Request(request) => request.to_header(),
        SipMessage::Response(response) => response.to_header(),
    }
    .ok()?;
    header.uri().ok().map(|uri| uri.to_string())
}

pub fn from_tag_of(message: &SipMessage) -> Option<String> {
    let header = match message {
        SipMessage::Request(request) => request.from_header(),
        SipMessage::Response(response) => response.from_header(),
    }
    .ok()?;
    header.tag().ok().flatten().map(|tag| tag.to_string())
}

pub fn to_tag_of(message: &SipMessage) -> Option<String> {
    let header = match message {
        SipMessage::Request(request) => request.to_header(),
        SipMessage::Response(response) => response.to_header(),
    }
    .ok()?;
    header.tag().ok().flatten().map(|tag| tag.to_string())
}

/// One SIP request/response exchange. Collected by the transaction
/// aggregator, terminated by a final response or by timer.
#[derive(Debug, Clone, Serialize)]
pub struct SipTransaction {
    pub call_id: String,
    pub cseq_num: u32,
    pub cseq_method: String,
    pub branch: String,
    pub src_addr: Address,
    pub dst_addr: Address,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_tag: Option<String>,
    /// Microseconds since the UNIX epoch, from the first packet observed.
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ringing_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminated_at: Option<u64>,
    pub state: TransactionState,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, AttrValue>,
}

impl SipTransaction {
    pub fn new(key: &TransactionKey, src_addr: Address, dst_addr: Address, created_at: u64) -> Self {
        Self {
            call_id: key.call_id.clone(),
            cseq_num: key.cseq_num,
            cseq_method: key.cseq_method.clone(),
            branch: key.branch.clone(),
            src_addr,
            dst_addr,
            request_method: None,
            response_status: None,
            from_uri: None,
            to_uri: None,
            from_tag: None,
            to_tag: None,
            created_at,
            ringing_at: None,
            terminated_at: None,
            state: TransactionState::Trying,
            attributes: HashMap::new(),
        }
    }

    pub fn has_final_response(&self) -> bool {
        self.response_status.map(|code| code >= 200).unwrap_or(false)
    }

    pub fn method_key(&self) -> String {
        method_key(&self.cseq_method)
    }

    pub fn to_document(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallLeg {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_tag: Option<String>,
}

/// A dialog as the monitor sees it: every finished transaction sharing a
/// Call-ID, in termination order, plus the derived call state.
#[derive(Debug, Clone, Serialize)]
pub struct SipCall {
    pub call_id: String,
    pub legs: Vec<CallLeg>,
    pub transactions: Vec<SipTransaction>,
    pub state: CallState,
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answered_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminated_at: Option<u64>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, AttrValue>,
    /// Wall-clock milliseconds of the last update, drives expiry only.
    #[serde(skip)]
    pub last_activity_at: u64,
}

impl SipCall {
    pub fn new(call_id: String, created_at: u64, now_millis: u64) -> Self {
        Self {
            call_id,
            legs: Vec::new(),
            transactions: Vec::new(),
            state: CallState::Trying,
            created_at,
            answered_at: None,
            terminated_at: None,
            attributes: HashMap::new(),
            last_activity_at: now_millis,
        }
    }

    pub fn record_leg(&mut self, from_tag: Option<String>, to_tag: Option<String>) {
        if from_tag.is_none() && to_tag.is_none() {
            return;
        }
        let leg = CallLeg { from_tag, to_tag };
        if !self.legs.contains(&leg) {
            self.legs.push(leg);
        }
    }

    pub fn to_document(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
