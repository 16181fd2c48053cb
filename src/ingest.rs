use crate::bus::{BusEvent, MessageBus};
use crate::packet::{Address, Packet, Protocol};
use crate::rtpr::{peek_source, ReportSource};
use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const DATAGRAM_MAGIC: u16 = 0x5650;
const DATAGRAM_VERSION: u8 = 1;

/// Decode a capture-agent datagram into a `Packet` record.
pub fn parse_datagram(data: &[u8]) -> Result<Packet> {
    let mut cursor = Cursor::new(data);
    let magic = cursor.read_u16::<BigEndian>()?;
    if magic != DATAGRAM_MAGIC {
        return Err(anyhow!("invalid datagram magic"));
    }
    let version = cursor.read_u8()?;
    if version != DATAGRAM_VERSION {
        return Err(anyhow!("unsupported datagram version {}", version));
    }
    let protocol = Protocol::from_code(cursor.read_u8()?)
        .ok_or_else(|| anyhow!("unknown protocol code"))?;
    let ip_family = cursor.read_u8()?;
    let src_addr = read_address(&mut cursor, ip_family)?;
    let dst_addr = read_address(&mut cursor, ip_family)?;
    let timestamp = cursor.read_u64::<BigEndian>()?;
    let payload_len = cursor.read_u32::<BigEndian>()? as usize;
    let mut payload = vec![0u8; payload_len];
    cursor.read_exact(&mut payload)?;

    Ok(Packet::new(
        timestamp,
        src_addr,
        dst_addr,
        protocol,
        payload.into(),
    ))
}

/// Encode a packet record for transmission; the inverse of
/// [`parse_datagram`]. Capture agents speak this format.
pub fn encode_datagram(packet: &Packet) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.write_u16::<BigEndian>(DATAGRAM_MAGIC).unwrap();
    buf.write_u8(DATAGRAM_VERSION).unwrap();
    buf.write_u8(packet.protocol.code()).unwrap();

    let ip_family = match packet.src_addr.addr {
        IpAddr::V4(_) => 4u8,
        IpAddr::V6(_) => 6u8,
    };
    buf.write_u8(ip_family).unwrap();
    write_address(&mut buf, &packet.src_addr);
    write_address(&mut buf, &packet.dst_addr);

    buf.write_u64::<BigEndian>(packet.timestamp).unwrap();
    buf.write_u32::<BigEndian>(packet.payload.len() as u32)
        .unwrap();
    buf.extend_from_slice(&packet.payload);
    buf
}

fn read_address(cursor: &mut Cursor<&[u8]>, ip_family: u8) -> Result<Address> {
    let addr = if ip_family == 4 {
        let mut octets = [0u8; 4];
        cursor.read_exact(&mut octets)?;
        IpAddr::from(octets)
    } else {
        let mut octets = [0u8; 16];
        cursor.read_exact(&mut octets)?;
        IpAddr::from(octets)
    };
    let port = cursor.read_u16::<BigEndian>()?;
    let host_len = cursor.read_u16::<BigEndian>()? as usize;
    let mut address = Address::new(addr, port);
    if host_len > 0 {
        let mut host = vec![0u8; host_len];
        cursor.read_exact(&mut host)?;
        address = address.with_host(String::from_utf8_lossy(&host).to_string());
    }
    Ok(address)
}

fn write_address(buf: &mut Vec<u8>, address: &Address) {
    match address.addr {
        IpAddr::V4(ip) => buf.extend_from_slice(&ip.octets()),
        IpAddr::V6(ip) => buf.extend_from_slice(&ip.octets()),
    }
    buf.write_u16::<BigEndian>(address.port).unwrap();
    match address.host {
        Some(ref host) => {
            let bytes = host.as_bytes();
            buf.write_u16::<BigEndian>(bytes.len() as u16).unwrap();
            buf.extend_from_slice(bytes);
        }
        None => buf.write_u16::<BigEndian>(0).unwrap(),
    }
}

/// Optional UDP front door for capture agents that speak the datagram
/// format: decodes and publishes onto the per-protocol ingress topics.
pub struct IngestListener;

impl IngestListener {
    pub async fn spawn(
        bus: Arc<MessageBus>,
        addr: &str,
        cancel_token: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| anyhow!("failed to bind capture feed on {}: {}", addr, e))?;
        info!("capture feed listening on {}", socket.local_addr()?);
        Ok(tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    result = socket.recv_from(&mut buf) => match result {
                        Ok((size, _)) => Self::dispatch(&bus, &buf[..size]),
                        Err(e) => error!("capture feed recv error: {}", e),
                    }
                }
            }
        }))
    }

    fn dispatch(bus: &MessageBus, data: &[u8]) {
        let packet = match parse_datagram(data) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("malformed capture datagram: {}", e);
                crate::metrics::ingest::packets_dropped("malformed");
                return;
            }
        };
        let topic = match packet.protocol {
            Protocol::Rtpr => match peek_source(&packet.payload) {
                Some(ReportSource::Rtcp) => "rtpr_rtcp",
                _ => "rtpr",
            },
            other => other.topic(),
        };
        crate::metrics::ingest::packets_processed(topic);
        bus.publish(topic, BusEvent::Packet(packet));
    }
}
