use super::{parse_report, sdp_session_id, session_key, ReportSource, RtprSession, SdpSession};
use crate::bus::{BusEvent, MessageBus, DEFAULT_QUEUE_DEPTH};
use crate::config::RtprConfig;
use crate::packet::{Packet, Protocol};
use crate::storage::{StorageEvent, StorageSender};
use crate::utils::{now_millis, time_suffix};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Joins RTP-R reports into media sessions. One worker owns all three maps,
/// so no locking: reports, SDP updates and the expiry timer are serialized
/// through the same select loop.
pub struct RtprSessionAggregator {
    bus: Arc<MessageBus>,
    storage: StorageSender,
    config: RtprConfig,
    time_suffix: String,
    sdp: HashMap<u64, SdpSession>,
    rtp: HashMap<u64, RtprSession>,
    rtcp: HashMap<u64, RtprSession>,
}

impl RtprSessionAggregator {
    pub fn new(
        bus: Arc<MessageBus>,
        storage: StorageSender,
        config: RtprConfig,
        time_suffix: String,
    ) -> Self {
        Self {
            bus,
            storage,
            config,
            time_suffix,
            sdp: HashMap::new(),
            rtp: HashMap::new(),
            rtcp: HashMap::new(),
        }
    }

    pub fn spawn(mut self, cancel_token: CancellationToken) -> JoinHandle<()> {
        let mut rtp_sub = self.bus.subscribe("rtpr", DEFAULT_QUEUE_DEPTH);
        let mut rtcp_sub = self.bus.subscribe("rtpr_rtcp", DEFAULT_QUEUE_DEPTH);
        let mut sdp_sub = self.bus.subscribe("sdp_info", DEFAULT_QUEUE_DEPTH);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(self.config.expiration_delay_ms.max(1)));
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    msg = rtp_sub.receiver.recv() => match msg {
                        Some(msg) => self.on_event(&msg.event),
                        None => break,
                    },
                    msg = rtcp_sub.receiver.recv() => match msg {
                        Some(msg) => self.on_event(&msg.event),
                        None => break,
                    },
                    msg = sdp_sub.receiver.recv() => match msg {
                        Some(msg) => self.on_event(&msg.event),
                        None => break,
                    },
                    _ = interval.tick() => self.expire(now_millis()),
                }
            }
        })
    }

    fn on_event(&mut self, event: &BusEvent) {
        match event {
            BusEvent::Packet(packet) if packet.protocol == Protocol::Rtpr => {
                self.handle_report(packet)
            }
            BusEvent::SdpInfo(sessions) => {
                for session in sessions {
                    self.sdp.insert(session.id, session.clone());
                }
            }
            other => debug!(?other, "unexpected event on rtpr topic"),
        }
    }

    fn handle_report(&mut self, packet: &Packet) {
        let mut report = match parse_report(&packet.payload) {
            Ok(report) => report,
            Err(e) => {
                debug!(src = %packet.src_addr, "undecodable rtpr payload: {}", e);
                crate::metrics::ingest::packets_dropped("rtpr_parse");
                return;
            }
        };
        if report.cumulative {
            debug!(ssrc = report.ssrc, "discarding cumulative report");
            crate::metrics::ingest::packets_dropped("rtpr_cumulative");
            return;
        }

        if report.call_id.is_none() {
            let sdp = self
                .sdp
                .get(&sdp_session_id(&packet.src_addr))
                .or_else(|| self.sdp.get(&sdp_session_id(&packet.dst_addr)));
            if let Some(sdp) = sdp {
                report.enrich(sdp);
            }
        }

        let key = session_key(&packet.src_addr, &packet.dst_addr, report.ssrc);
        let at_millis = packet.timestamp_millis();
        let sessions = match report.source {
            ReportSource::Rtp => &mut self.rtp,
            ReportSource::Rtcp => &mut self.rtcp,
        };
        match sessions.entry(key) {
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                entry.get_mut().update(&report, at_millis);
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(RtprSession::new(
                    packet.src_addr.clone(),
                    packet.dst_addr.clone(),
                    at_millis,
                    report.clone(),
                ));
            }
        }

        self.write_raw(packet, &report);
        if !self.config.cumulative_metrics {
            crate::metrics::rtpr::report(report.source.as_str(), &report);
        }
    }

    fn write_raw(&self, packet: &Packet, report: &super::RtpReportPayload) {
        let collection = format!(
            "rtpr_{}_raw_{}",
            report.source.as_str(),
            time_suffix(packet.timestamp, &self.time_suffix)
        );
        let mut document = match serde_json::to_value(report) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => {
                error!("failed to serialize rtpr report");
                return;
            }
        };
        document.insert("timestamp".into(), packet.timestamp.into());
        document.insert("src_addr".into(), packet.src_addr.to_string().into());
        document.insert("dst_addr".into(), packet.dst_addr.to_string().into());
        if self
            .storage
            .send(StorageEvent::Insert {
                collection,
                document: serde_json::Value::Object(document),
            })
            .is_err()
        {
            error!("storage writer is gone, dropping rtpr document");
        }
    }

    fn expire(&mut self, now_millis: u64) {
        let timeout = self.config.aggregation_timeout_ms;
        self.sdp
            .retain(|_, session| session.timestamp + timeout > now_millis);

        let mut terminated = Vec::new();
        for sessions in [&mut self.rtp, &mut self.rtcp] {
            let expired: Vec<u64> = sessions
                .iter()
                .filter(|(_, s)| s.last_report_at + timeout < now_millis)
                .map(|(key, _)| *key)
                .collect();
            for key in expired {
                if let Some(session) = sessions.remove(&key) {
                    terminated.push(session);
                }
            }
        }
        for session in terminated {
            if self.config.cumulative_metrics {
                crate::metrics::rtpr::report(session.report.source.as_str(), &session.report);
            }
            self.bus.publish("media", BusEvent::Media(session));
        }
        if self.rtp.len() + self.rtcp.len() > 100_000 {
            warn!(
                rtp = self.rtp.len(),
                rtcp = self.rtcp.len(),
                "rtpr session maps are unusually large"
            );
        }
    }
}
