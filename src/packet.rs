use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Network endpoint as seen by a capture agent. `host` is the symbolic name
/// the agent resolved at capture time; it is never reassigned downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub addr: IpAddr,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl Address {
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self {
            addr,
            port,
            host: None,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

impl From<SocketAddr> for Address {
    fn from(value: SocketAddr) -> Self {
        Self::new(value.ip(), value.port())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Rtcp = 1,
    Rtp = 2,
    Sip = 3,
    Icmp = 4,
    Rtpr = 5,
    Smpp = 6,
}

impl Protocol {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Protocol::Rtcp),
            2 => Some(Protocol::Rtp),
            3 => Some(Protocol::Sip),
            4 => Some(Protocol::Icmp),
            5 => Some(Protocol::Rtpr),
            6 => Some(Protocol::Smpp),
            _ => None,
        }
    }

    pub fn code(&self) -> u8 {
        *self as u8
    }

    /// Ingress bus topic carrying packets of this protocol.
    pub fn topic(&self) -> &'static str {
        match self {
            Protocol::Rtcp => "rtcp",
            Protocol::Rtp => "rtp",
            Protocol::Sip => "sip",
            Protocol::Icmp => "icmp",
            Protocol::Rtpr => "rtpr",
            Protocol::Smpp => "smpp",
        }
    }
}

/// Attribute values a UDF may attach to a record. Only strings and booleans
/// survive UDF filtering; numbers occur on records built by the core itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Str(String),
    Bool(bool),
    Num(f64),
}

/// Decoded capture record. Immutable once it enters the core, except for
/// `attributes` which is additive.
#[derive(Debug, Clone, Serialize)]
pub struct Packet {
    /// Capture wall-clock time, microseconds since the UNIX epoch.
    pub timestamp: u64,
    pub src_addr: Address,
    pub dst_addr: Address,
    pub protocol: Protocol,
    #[serde(skip)]
    pub payload: Bytes,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, AttrValue>,
}

impl Packet {
    pub fn new(
        timestamp: u64,
        src_addr: Address,
        dst_addr: Address,
        protocol: Protocol,
        payload: Bytes,
    ) -> Self {
        Self {
            timestamp,
            src_addr,
            dst_addr,
            protocol,
            payload,
            attributes: HashMap::new(),
        }
    }

    pub fn timestamp_millis(&self) -> u64 {
        self.timestamp / 1_000
    }
}
