use crate::bus::{BusEvent, MessageBus, DEFAULT_QUEUE_DEPTH};
use crate::config::ManagementConfig;
use crate::rtpr::SdpSession;
use crate::storage::{StorageEvent, StorageSender};
use crate::utils::now_millis;
use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A registered capture agent. `addr` is wherever the last register came
/// from; SDP pushes go back to that address.
#[derive(Debug, Clone)]
pub struct RemoteHost {
    pub name: String,
    pub addr: SocketAddr,
    /// Wall-clock milliseconds of the last register.
    pub last_update: u64,
    pub rtp_enabled: bool,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RegisterPayload {
    #[allow(dead_code)]
    timestamp: Option<u64>,
    name: String,
    #[serde(default)]
    config: RegisterConfig,
}

#[derive(Debug, Default, Deserialize)]
struct RegisterConfig {
    host: Option<serde_json::Value>,
    rtp: Option<RtpSection>,
}

#[derive(Debug, Deserialize)]
struct RtpSection {
    enabled: bool,
}

/// Agent registry behind the management UDP socket: tracks liveness from
/// `register` datagrams and pushes SDP sessions to every RTP-enabled agent.
pub struct ManagementSocket {
    storage: StorageSender,
    config: ManagementConfig,
    agents: HashMap<String, RemoteHost>,
    send_sdp_sessions: bool,
}

impl ManagementSocket {
    /// Bind the socket and start the worker. Returns the bound address so
    /// callers (and tests) can reach an OS-assigned port.
    pub async fn spawn(
        bus: Arc<MessageBus>,
        storage: StorageSender,
        config: ManagementConfig,
        cancel_token: CancellationToken,
    ) -> Result<(SocketAddr, JoinHandle<()>)> {
        let socket = UdpSocket::bind(&config.addr)
            .await
            .map_err(|e| anyhow!("failed to bind management socket on {}: {}", config.addr, e))?;
        let local_addr = socket.local_addr()?;
        info!("management socket listening on {}", local_addr);

        let mut sdp_sub = bus.subscribe("sdp_info", DEFAULT_QUEUE_DEPTH);
        let mut registry = ManagementSocket {
            storage,
            config,
            agents: HashMap::new(),
            send_sdp_sessions: false,
        };
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];
            let mut interval = tokio::time::interval(Duration::from_millis(
                registry.config.expiration_delay_ms.max(1),
            ));
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    result = socket.recv_from(&mut buf) => match result {
                        Ok((size, peer)) => registry.handle_datagram(&buf[..size], peer),
                        Err(e) => error!("management recv error: {}", e),
                    },
                    msg = sdp_sub.receiver.recv() => match msg {
                        Some(msg) => {
                            if let BusEvent::SdpInfo(sessions) = &*msg.event {
                                registry.push_sdp_sessions(&socket, sessions).await;
                            }
                        }
                        None => break,
                    },
                    _ = interval.tick() => registry.expire(now_millis()),
                }
            }
        });
        Ok((local_addr, handle))
    }

    fn handle_datagram(&mut self, data: &[u8], peer: SocketAddr) {
        let envelope: Envelope = match serde_json::from_slice(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(%peer, "undecodable management datagram: {}", e);
                return;
            }
        };
        match envelope.kind.as_str() {
            "register" => self.handle_register(envelope.payload, peer),
            other => warn!(%peer, kind = other, "unsupported management message"),
        }
    }

    fn handle_register(&mut self, payload: serde_json::Value, peer: SocketAddr) {
        let payload: RegisterPayload = match serde_json::from_value(payload) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(%peer, "malformed register payload: {}", e);
                return;
            }
        };
        let rtp_enabled = payload
            .config
            .rtp
            .map(|section| section.enabled)
            .unwrap_or(false);

        if !self.agents.contains_key(&payload.name) {
            info!(agent = %payload.name, %peer, rtp_enabled, "agent registered");
            if let Some(host) = payload.config.host {
                if self
                    .storage
                    .send(StorageEvent::Upsert {
                        collection: "hosts".to_string(),
                        key: payload.name.clone(),
                        document: host,
                    })
                    .is_err()
                {
                    error!("storage writer is gone, dropping host document");
                }
            }
        }
        self.agents.insert(
            payload.name.clone(),
            RemoteHost {
                name: payload.name,
                addr: peer,
                last_update: now_millis(),
                rtp_enabled,
            },
        );
        self.recompute_send_flag();
    }

    async fn push_sdp_sessions(&self, socket: &UdpSocket, sessions: &[SdpSession]) {
        if !self.send_sdp_sessions {
            return;
        }
        for session in sessions {
            let datagram = match serde_json::to_vec(&serde_json::json!({
                "type": "sdp_session",
                "payload": session,
            })) {
                Ok(datagram) => datagram,
                Err(e) => {
                    error!("failed to encode sdp_session: {}", e);
                    continue;
                }
            };
            for agent in self.agents.values().filter(|agent| agent.rtp_enabled) {
                // no retry: the next report carries the session again
                if let Err(e) = socket.send_to(&datagram, agent.addr).await {
                    error!(agent = %agent.name, "sdp push failed: {}", e);
                }
            }
        }
    }

    fn expire(&mut self, now_millis: u64) {
        let timeout = self.config.expiration_timeout_ms;
        self.agents.retain(|name, agent| {
            let keep = agent.last_update.saturating_add(timeout) >= now_millis;
            if !keep {
                info!(agent = %name, "agent expired");
            }
            keep
        });
        self.recompute_send_flag();
    }

    fn recompute_send_flag(&mut self) {
        self.send_sdp_sessions = self.agents.values().any(|agent| agent.rtp_enabled);
    }
}
