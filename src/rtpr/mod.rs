pub mod session;

use crate::packet::Address;
use crate::utils::stable_hash;
use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Read};
use std::net::IpAddr;

pub use session::RtprSessionAggregator;

const REPORT_MAGIC: u16 = 0x5252;
const REPORT_VERSION: u8 = 1;

const FLAG_CUMULATIVE: u8 = 0b0000_0001;
const FLAG_CALL_ID: u8 = 0b0000_0010;
const FLAG_CODEC: u8 = 0b0000_0100;
const FLAG_QUALITY: u8 = 0b0000_1000;

/// Default transmission rating of the E-model with no impairments applied.
pub const R_FACTOR_BASE: f64 = 93.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportSource {
    Rtp = 1,
    Rtcp = 2,
}

impl ReportSource {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ReportSource::Rtp),
            2 => Some(ReportSource::Rtcp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReportSource::Rtp => "rtp",
            ReportSource::Rtcp => "rtcp",
        }
    }
}

/// Quality report produced by a capture agent from one observed RTP or RTCP
/// stream window. Cumulative reports are a legacy agent mode and are dropped
/// by the aggregator.
#[derive(Debug, Clone, Serialize)]
pub struct RtpReportPayload {
    pub source: ReportSource,
    pub ssrc: u32,
    pub cumulative: bool,
    pub expected_packets: u32,
    pub received_packets: u32,
    pub lost_packets: u32,
    pub rejected_packets: u32,
    /// 0..1 over the report window.
    pub fraction_lost: f64,
    pub last_jitter: f64,
    pub avg_jitter: f64,
    pub min_jitter: f64,
    pub max_jitter: f64,
    /// Milliseconds since the UNIX epoch.
    pub created_at: u64,
    pub started_at: u64,
    /// Milliseconds covered by this report (or by the whole session once
    /// aggregated).
    pub duration: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codec_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_type: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r_factor: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mos: Option<f64>,
}

impl RtpReportPayload {
    pub fn new(source: ReportSource, ssrc: u32) -> Self {
        Self {
            source,
            ssrc,
            cumulative: false,
            expected_packets: 0,
            received_packets: 0,
            lost_packets: 0,
            rejected_packets: 0,
            fraction_lost: 0.0,
            last_jitter: 0.0,
            avg_jitter: 0.0,
            min_jitter: 0.0,
            max_jitter: 0.0,
            created_at: 0,
            started_at: 0,
            duration: 0,
            call_id: None,
            codec_name: None,
            payload_type: None,
            r_factor: None,
            mos: None,
        }
    }

    /// Copy call correlation and codec facts from a cached SDP session and
    /// derive R-factor and MOS from the codec impairment constants.
    pub fn enrich(&mut self, sdp: &SdpSession) {
        self.call_id = Some(sdp.call_id.clone());
        self.codec_name = Some(sdp.codec.name.clone());
        self.payload_type = Some(sdp.codec.payload_type);
        let r_factor = compute_r_factor(self.fraction_lost, &sdp.codec);
        self.r_factor = Some(r_factor);
        self.mos = Some(compute_mos(r_factor));
    }

    /// Fold `incoming` into this running aggregate. Counts add, min/max fold,
    /// the jitter mean is weighted by received packet counts, the last value
    /// follows the newest report.
    pub fn merge(&mut self, incoming: &RtpReportPayload) {
        let prev_weight = self.received_packets as f64;
        let incoming_weight = incoming.received_packets as f64;
        let total_weight = prev_weight + incoming_weight;
        if total_weight > 0.0 {
            self.avg_jitter = (self.avg_jitter * prev_weight
                + incoming.avg_jitter * incoming_weight)
                / total_weight;
        }
        self.min_jitter = self.min_jitter.min(incoming.min_jitter);
        self.max_jitter = self.max_jitter.max(incoming.max_jitter);
        self.last_jitter = incoming.last_jitter;

        self.expected_packets = self.expected_packets.saturating_add(incoming.expected_packets);
        self.received_packets = self.received_packets.saturating_add(incoming.received_packets);
        self.lost_packets = self.lost_packets.saturating_add(incoming.lost_packets);
        self.rejected_packets = self.rejected_packets.saturating_add(incoming.rejected_packets);
        if self.expected_packets > 0 {
            self.fraction_lost = self.lost_packets as f64 / self.expected_packets as f64;
        }

        if self.started_at == 0 || (incoming.started_at > 0 && incoming.started_at < self.started_at)
        {
            self.started_at = incoming.started_at;
        }
        if self.call_id.is_none() {
            self.call_id = incoming.call_id.clone();
        }
        if self.codec_name.is_none() {
            self.codec_name = incoming.codec_name.clone();
        }
        if self.payload_type.is_none() {
            self.payload_type = incoming.payload_type;
        }
        if incoming.r_factor.is_some() {
            self.r_factor = incoming.r_factor;
        }
        if incoming.mos.is_some() {
            self.mos = incoming.mos;
        }
    }
}

/// E-model transmission rating from packet loss and the codec's impairment
/// constants. `ie` is the codec impairment factor, `bpl` its robustness
/// against bursty loss.
pub fn compute_r_factor(fraction_lost: f64, codec: &SdpCodec) -> f64 {
    let ppl = fraction_lost * 100.0;
    let ie_eff = if ppl + codec.bpl > 0.0 {
        codec.ie + (95.0 - codec.ie) * ppl / (ppl + codec.bpl)
    } else {
        codec.ie
    };
    (R_FACTOR_BASE - ie_eff).clamp(0.0, R_FACTOR_BASE)
}

/// Standard E-model MOS mapping, clamped to the 1..4.5 scale.
pub fn compute_mos(r_factor: f64) -> f64 {
    let r = r_factor;
    (1.0 + 0.035 * r + r * (r - 60.0) * (100.0 - r) * 7e-6).clamp(1.0, 4.5)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SdpCodec {
    pub payload_type: u8,
    pub name: String,
    pub ie: f64,
    pub bpl: f64,
}

/// Media description extracted from SIP signaling, cached so RTP-R reports
/// can be correlated back to their call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SdpSession {
    pub id: u64,
    pub call_id: String,
    /// Milliseconds since the UNIX epoch.
    pub timestamp: u64,
    pub codec: SdpCodec,
}

/// SDP cache key for a media endpoint. The port is masked to its even pair
/// so an RTP port and its implicit RTCP port resolve to the same session.
pub fn sdp_session_id(addr: &Address) -> u64 {
    let masked_port = (addr.port & 0xFFFE) as u64;
    match addr.addr {
        IpAddr::V4(v4) => ((u32::from(v4) as u64) << 32) | masked_port,
        IpAddr::V6(v6) => {
            let octets = v6.octets();
            let mut fold = 0u32;
            for chunk in octets.chunks_exact(4) {
                fold ^= u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            }
            ((fold as u64) << 32) | masked_port
        }
    }
}

/// Session key symmetric in (src, dst): the address hashes fold by XOR into
/// the high word and the SSRC occupies the low word, so reports observed in
/// either direction collapse onto one session.
pub fn session_key(src: &Address, dst: &Address, ssrc: u32) -> u64 {
    let src_hash = stable_hash(&src.to_string());
    let dst_hash = stable_hash(&dst.to_string());
    ((src_hash ^ dst_hash) & 0xFFFF_FFFF_0000_0000) | ssrc as u64
}

/// One aggregated media stream between two endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct RtprSession {
    pub src_addr: Address,
    pub dst_addr: Address,
    /// Milliseconds since the UNIX epoch.
    pub created_at: u64,
    pub last_report_at: u64,
    pub report: RtpReportPayload,
}

impl RtprSession {
    pub fn new(src_addr: Address, dst_addr: Address, at_millis: u64, report: RtpReportPayload) -> Self {
        Self {
            src_addr,
            dst_addr,
            created_at: at_millis,
            last_report_at: at_millis,
            report,
        }
    }

    pub fn update(&mut self, incoming: &RtpReportPayload, at_millis: u64) {
        self.report.merge(incoming);
        self.last_report_at = at_millis;
        self.report.duration = self.last_report_at.saturating_sub(self.created_at) as u32;
    }
}

/// Report source without decoding the full payload; used to route capture
/// datagrams onto the `rtpr` / `rtpr_rtcp` topics.
pub fn peek_source(data: &[u8]) -> Option<ReportSource> {
    if data.len() < 4 {
        return None;
    }
    if u16::from_be_bytes([data[0], data[1]]) != REPORT_MAGIC {
        return None;
    }
    ReportSource::from_code(data[3])
}

pub fn parse_report(data: &[u8]) -> Result<RtpReportPayload> {
    let mut cursor = Cursor::new(data);
    let magic = cursor.read_u16::<BigEndian>()?;
    if magic != REPORT_MAGIC {
        return Err(anyhow!("invalid report magic"));
    }
    let version = cursor.read_u8()?;
    if version != REPORT_VERSION {
        return Err(anyhow!("unsupported report version {}", version));
    }
    let source = ReportSource::from_code(cursor.read_u8()?)
        .ok_or_else(|| anyhow!("unknown report source"))?;
    let flags = cursor.read_u8()?;
    let ssrc = cursor.read_u32::<BigEndian>()?;

    let mut report = RtpReportPayload::new(source, ssrc);
    report.cumulative = flags & FLAG_CUMULATIVE != 0;
    report.expected_packets = cursor.read_u32::<BigEndian>()?;
    report.received_packets = cursor.read_u32::<BigEndian>()?;
    report.lost_packets = cursor.read_u32::<BigEndian>()?;
    report.rejected_packets = cursor.read_u32::<BigEndian>()?;
    report.fraction_lost = cursor.read_f64::<BigEndian>()?;
    report.last_jitter = cursor.read_f64::<BigEndian>()?;
    report.avg_jitter = cursor.read_f64::<BigEndian>()?;
    report.min_jitter = cursor.read_f64::<BigEndian>()?;
    report.max_jitter = cursor.read_f64::<BigEndian>()?;
    report.created_at = cursor.read_u64::<BigEndian>()?;
    report.started_at = cursor.read_u64::<BigEndian>()?;
    report.duration = cursor.read_u32::<BigEndian>()?;

    if flags & FLAG_CALL_ID != 0 {
        report.call_id = Some(read_string(&mut cursor)?);
    }
    if flags & FLAG_CODEC != 0 {
        report.codec_name = Some(read_string(&mut cursor)?);
        report.payload_type = Some(cursor.read_u8()?);
    }
    if flags & FLAG_QUALITY != 0 {
        report.r_factor = Some(cursor.read_f64::<BigEndian>()?);
        report.mos = Some(cursor.read_f64::<BigEndian>()?);
    }
    Ok(report)
}

pub fn encode_report(report: &RtpReportPayload) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.write_u16::<BigEndian>(REPORT_MAGIC).unwrap();
    buf.write_u8(REPORT_VERSION).unwrap();
    buf.write_u8(report.source as u8).unwrap();

    let mut flags = 0u8;
    if report.cumulative {
        flags |= FLAG_CUMULATIVE;
    }
    if report.call_id.is_some() {
        flags |= FLAG_CALL_ID;
    }
    if report.codec_name.is_some() {
        flags |= FLAG_CODEC;
    }
    if report.r_factor.is_some() {
        flags |= FLAG_QUALITY;
    }
    buf.write_u8(flags).unwrap();
    buf.write_u32::<BigEndian>(report.ssrc).unwrap();
    buf.write_u32::<BigEndian>(report.expected_packets).unwrap();
    buf.write_u32::<BigEndian>(report.received_packets).unwrap();
    buf.write_u32::<BigEndian>(report.lost_packets).unwrap();
    buf.write_u32::<BigEndian>(report.rejected_packets).unwrap();
    buf.write_f64::<BigEndian>(report.fraction_lost).unwrap();
    buf.write_f64::<BigEndian>(report.last_jitter).unwrap();
    buf.write_f64::<BigEndian>(report.avg_jitter).unwrap();
    buf.write_f64::<BigEndian>(report.min_jitter).unwrap();
    buf.write_f64::<BigEndian>(report.max_jitter).unwrap();
    buf.write_u64::<BigEndian>(report.created_at).unwrap();
    buf.write_u64::<BigEndian>(report.started_at).unwrap();
    buf.write_u32::<BigEndian>(report.duration).unwrap();

    if let Some(ref call_id) = report.call_id {
        write_string(&mut buf, call_id);
    }
    if let Some(ref codec_name) = report.codec_name {
        write_string(&mut buf, codec_name);
        buf.write_u8(report.payload_type.unwrap_or(0)).unwrap();
    }
    if let Some(r_factor) = report.r_factor {
        buf.write_f64::<BigEndian>(r_factor).unwrap();
        buf.write_f64::<BigEndian>(report.mos.unwrap_or(1.0)).unwrap();
    }
    buf
}

fn read_string(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let len = cursor.read_u16::<BigEndian>()? as usize;
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).to_string())
}

fn write_string(buf: &mut Vec<u8>, value: &str) {
    let bytes = value.as_bytes();
    buf.write_u16::<BigEndian>(bytes.len() as u16).unwrap();
    buf.extend_from_slice(bytes);
}
