//! IPv4/TCP/UDP packet parsing and building

use crate::checksum::{ip_checksum, tcp_checksum, udp_checksum, PROTO_TCP, PROTO_UDP};
use crate::error::{EngineError, Result};
use bytes::BytesMut;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU16, Ordering};

pub const DEFAULT_MTU: usize = 1500;
pub const DEFAULT_MSS: u16 = 1460;
pub const IPV4_HEADER_LEN: usize = 20;
pub const TCP_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;
/// MSS (4) + window scale (3) + NOP (1)
pub const SYN_OPTIONS_LEN: usize = 8;

const PROTO_ICMP: u8 = 1;

static IP_ID: AtomicU16 = AtomicU16::new(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
}

impl TcpFlags {
    pub fn syn_only() -> Self {
        Self { syn: true, ..Default::default() }
    }
    pub fn syn_ack() -> Self {
        Self { syn: true, ack: true, ..Default::default() }
    }
    pub fn ack_only() -> Self {
        Self { ack: true, ..Default::default() }
    }
    pub fn fin_ack() -> Self {
        Self { fin: true, ack: true, ..Default::default() }
    }
    pub fn rst_ack() -> Self {
        Self { rst: true, ack: true, ..Default::default() }
    }
    pub fn psh_ack() -> Self {
        Self { psh: true, ack: true, ..Default::default() }
    }

    pub fn from_byte(b: u8) -> Self {
        Self {
            fin: b & 0x01 != 0,
            syn: b & 0x02 != 0,
            rst: b & 0x04 != 0,
            psh: b & 0x08 != 0,
            ack: b & 0x10 != 0,
        }
    }

    pub fn to_byte(&self) -> u8 {
        let mut flags = 0u8;
        if self.fin { flags |= 0x01; }
        if self.syn { flags |= 0x02; }
        if self.rst { flags |= 0x04; }
        if self.psh { flags |= 0x08; }
        if self.ack { flags |= 0x10; }
        flags
    }
}

#[derive(Debug, Clone)]
pub struct ParsedPacket {
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub protocol: u8,
    /// IP header length (IHL * 4)
    pub header_len: usize,
    /// Length from the IP total-length field, clamped to the buffer
    pub total_len: usize,
    pub transport: TransportInfo,
}

#[derive(Debug, Clone)]
pub enum TransportInfo {
    Tcp(TcpInfo),
    Udp(UdpInfo),
    Icmp,
    Other(u8),
}

#[derive(Debug, Clone)]
pub struct TcpInfo {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    /// Data offset * 4
    pub header_len: usize,
    pub flags: TcpFlags,
    pub window: u16,
    pub mss: Option<u16>,
    pub window_scale: Option<u8>,
    /// Offset of the payload from the start of the IP packet
    pub payload_offset: usize,
    pub payload_len: usize,
}

#[derive(Debug, Clone)]
pub struct UdpInfo {
    pub src_port: u16,
    pub dst_port: u16,
    /// Value of the UDP length field (header + payload)
    pub length: u16,
    pub payload_offset: usize,
    pub payload_len: usize,
}

impl ParsedPacket {
    pub fn src_socket(&self) -> Option<SocketAddrV4> {
        match &self.transport {
            TransportInfo::Tcp(t) => Some(SocketAddrV4::new(self.src_addr, t.src_port)),
            TransportInfo::Udp(u) => Some(SocketAddrV4::new(self.src_addr, u.src_port)),
            _ => None,
        }
    }

    pub fn dst_socket(&self) -> Option<SocketAddrV4> {
        match &self.transport {
            TransportInfo::Tcp(t) => Some(SocketAddrV4::new(self.dst_addr, t.dst_port)),
            TransportInfo::Udp(u) => Some(SocketAddrV4::new(self.dst_addr, u.dst_port)),
            _ => None,
        }
    }

    pub fn is_tcp_syn(&self) -> bool {
        matches!(&self.transport, TransportInfo::Tcp(t) if t.flags.syn && !t.flags.ack)
    }

    /// Transport payload borrowed from the raw packet this view was parsed from.
    pub fn payload<'a>(&self, raw: &'a [u8]) -> &'a [u8] {
        let (offset, len) = match &self.transport {
            TransportInfo::Tcp(t) => (t.payload_offset, t.payload_len),
            TransportInfo::Udp(u) => (u.payload_offset, u.payload_len),
            _ => return &[],
        };
        raw.get(offset..offset + len).unwrap_or(&[])
    }
}

/// Parse an IPv4 packet with its TCP or UDP header.
pub fn parse_packet(data: &[u8]) -> Result<ParsedPacket> {
    if data.is_empty() {
        return Err(EngineError::PacketTooShort { expected: 1, actual: 0 });
    }

    let version = (data[0] >> 4) & 0x0F;
    if version != 4 {
        return Err(EngineError::InvalidIpVersion(version));
    }
    if data.len() < IPV4_HEADER_LEN {
        return Err(EngineError::PacketTooShort { expected: IPV4_HEADER_LEN, actual: data.len() });
    }

    let ihl = ((data[0] & 0x0F) as usize) * 4;
    if ihl < IPV4_HEADER_LEN || data.len() < ihl {
        return Err(EngineError::InvalidPacket(format!("IPv4: bad header length {}", ihl)));
    }

    // Trailing bytes past the total length are link padding
    let total_len = (u16::from_be_bytes([data[2], data[3]]) as usize).min(data.len());
    if total_len < ihl {
        return Err(EngineError::InvalidPacket(format!("IPv4: total length {} < header {}", total_len, ihl)));
    }

    let protocol = data[9];
    let src_addr = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
    let dst_addr = Ipv4Addr::new(data[16], data[17], data[18], data[19]);

    let transport = match protocol {
        PROTO_TCP => TransportInfo::Tcp(parse_tcp(&data[..total_len], ihl)?),
        PROTO_UDP => TransportInfo::Udp(parse_udp(&data[..total_len], ihl)?),
        PROTO_ICMP => TransportInfo::Icmp,
        other => TransportInfo::Other(other),
    };

    Ok(ParsedPacket { src_addr, dst_addr, protocol, header_len: ihl, total_len, transport })
}

fn parse_tcp(packet: &[u8], ihl: usize) -> Result<TcpInfo> {
    let data = &packet[ihl..];
    if data.len() < TCP_HEADER_LEN {
        return Err(EngineError::PacketTooShort { expected: ihl + TCP_HEADER_LEN, actual: packet.len() });
    }

    let header_len = ((data[12] >> 4) as usize) * 4;
    if header_len < TCP_HEADER_LEN || data.len() < header_len {
        return Err(EngineError::InvalidPacket(format!("TCP: bad data offset {}", header_len)));
    }

    let mut mss = None;
    let mut window_scale = None;
    let opts = &data[TCP_HEADER_LEN..header_len];
    let mut i = 0;
    while i < opts.len() {
        match opts[i] {
            0 => break,
            1 => i += 1,
            kind => {
                let Some(&len) = opts.get(i + 1) else { break };
                let len = len as usize;
                if len < 2 || i + len > opts.len() {
                    break;
                }
                match (kind, len) {
                    (2, 4) => mss = Some(u16::from_be_bytes([opts[i + 2], opts[i + 3]])),
                    (3, 3) => window_scale = Some(opts[i + 2]),
                    _ => {}
                }
                i += len;
            }
        }
    }

    Ok(TcpInfo {
        src_port: u16::from_be_bytes([data[0], data[1]]),
        dst_port: u16::from_be_bytes([data[2], data[3]]),
        seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        ack: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        header_len,
        flags: TcpFlags::from_byte(data[13]),
        window: u16::from_be_bytes([data[14], data[15]]),
        mss,
        window_scale,
        payload_offset: ihl + header_len,
        payload_len: data.len() - header_len,
    })
}

fn parse_udp(packet: &[u8], ihl: usize) -> Result<UdpInfo> {
    let data = &packet[ihl..];
    if data.len() < UDP_HEADER_LEN {
        return Err(EngineError::PacketTooShort { expected: ihl + UDP_HEADER_LEN, actual: packet.len() });
    }

    let length = u16::from_be_bytes([data[4], data[5]]);
    if (length as usize) < UDP_HEADER_LEN {
        return Err(EngineError::InvalidPacket(format!("UDP: bad length {}", length)));
    }
    let payload_len = (length as usize - UDP_HEADER_LEN).min(data.len() - UDP_HEADER_LEN);

    Ok(UdpInfo {
        src_port: u16::from_be_bytes([data[0], data[1]]),
        dst_port: u16::from_be_bytes([data[2], data[3]]),
        length,
        payload_offset: ihl + UDP_HEADER_LEN,
        payload_len,
    })
}

/// Everything needed to synthesize one TCP segment toward the interface.
#[derive(Debug, Clone, Copy)]
pub struct TcpSegmentSpec {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    /// MSS and window-scale advertised when `flags.syn` is set
    pub mss: u16,
    pub window_scale: u8,
}

fn write_ipv4_header(pkt: &mut [u8], total_len: usize, protocol: u8, src: Ipv4Addr, dst: Ipv4Addr) {
    pkt[0] = 0x45;
    pkt[1] = 0x00;
    pkt[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    let ip_id = IP_ID.fetch_add(1, Ordering::Relaxed);
    pkt[4..6].copy_from_slice(&ip_id.to_be_bytes());
    pkt[6..8].copy_from_slice(&0x4000u16.to_be_bytes());
    pkt[8] = 64;
    pkt[9] = protocol;
    pkt[10..12].copy_from_slice(&[0, 0]);
    pkt[12..16].copy_from_slice(&src.octets());
    pkt[16..20].copy_from_slice(&dst.octets());

    let ip_cksum = ip_checksum(&pkt[..IPV4_HEADER_LEN]);
    pkt[10..12].copy_from_slice(&ip_cksum.to_be_bytes());
}

/// Build an IPv4 TCP packet. SYN segments carry MSS, window-scale and a NOP pad.
///
/// Fails with [`EngineError::PacketTooLarge`] when the result would exceed `mtu`;
/// callers chunk payloads at MSS granularity first.
pub fn build_tcp_packet(spec: &TcpSegmentSpec, payload: &[u8], mtu: usize) -> Result<BytesMut> {
    let opts_len = if spec.flags.syn { SYN_OPTIONS_LEN } else { 0 };
    let tcp_hdr_len = TCP_HEADER_LEN + opts_len;
    let total_len = IPV4_HEADER_LEN + tcp_hdr_len + payload.len();
    if total_len > mtu {
        return Err(EngineError::PacketTooLarge { size: total_len, mtu });
    }

    let mut pkt = BytesMut::zeroed(total_len);
    write_ipv4_header(&mut pkt, total_len, PROTO_TCP, *spec.src.ip(), *spec.dst.ip());

    let tcp = &mut pkt[IPV4_HEADER_LEN..];
    tcp[0..2].copy_from_slice(&spec.src.port().to_be_bytes());
    tcp[2..4].copy_from_slice(&spec.dst.port().to_be_bytes());
    tcp[4..8].copy_from_slice(&spec.seq.to_be_bytes());
    tcp[8..12].copy_from_slice(&spec.ack.to_be_bytes());
    tcp[12] = ((tcp_hdr_len / 4) as u8) << 4;
    tcp[13] = spec.flags.to_byte();
    tcp[14..16].copy_from_slice(&spec.window.to_be_bytes());

    if spec.flags.syn {
        tcp[20] = 2;
        tcp[21] = 4;
        tcp[22..24].copy_from_slice(&spec.mss.to_be_bytes());
        tcp[24] = 3;
        tcp[25] = 3;
        tcp[26] = spec.window_scale;
        tcp[27] = 1;
    }

    tcp[tcp_hdr_len..].copy_from_slice(payload);

    let tcp_cksum = tcp_checksum(*spec.src.ip(), *spec.dst.ip(), tcp);
    tcp[16..18].copy_from_slice(&tcp_cksum.to_be_bytes());

    Ok(pkt)
}

/// Build a bare RST+ACK, used to refuse a connection or answer a segment without a flow.
pub fn build_tcp_rst(src: SocketAddrV4, dst: SocketAddrV4, seq: u32, ack: u32) -> BytesMut {
    let spec = TcpSegmentSpec {
        src,
        dst,
        seq,
        ack,
        flags: TcpFlags::rst_ack(),
        window: 0,
        mss: 0,
        window_scale: 0,
    };
    // 40 bytes always fits the minimum IPv4 MTU
    match build_tcp_packet(&spec, &[], IPV4_HEADER_LEN + TCP_HEADER_LEN) {
        Ok(pkt) => pkt,
        Err(_) => BytesMut::new(),
    }
}

/// Build an IPv4 UDP packet, rejecting anything larger than `mtu`.
pub fn build_udp_packet(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8], mtu: usize) -> Result<BytesMut> {
    let total_len = IPV4_HEADER_LEN + UDP_HEADER_LEN + payload.len();
    if total_len > mtu {
        return Err(EngineError::PacketTooLarge { size: total_len, mtu });
    }

    let mut pkt = BytesMut::zeroed(total_len);
    write_ipv4_header(&mut pkt, total_len, PROTO_UDP, *src.ip(), *dst.ip());

    let udp = &mut pkt[IPV4_HEADER_LEN..];
    udp[0..2].copy_from_slice(&src.port().to_be_bytes());
    udp[2..4].copy_from_slice(&dst.port().to_be_bytes());
    udp[4..6].copy_from_slice(&((UDP_HEADER_LEN + payload.len()) as u16).to_be_bytes());
    udp[UDP_HEADER_LEN..].copy_from_slice(payload);

    let udp_cksum = udp_checksum(*src.ip(), *dst.ip(), udp);
    udp[6..8].copy_from_slice(&udp_cksum.to_be_bytes());

    Ok(pkt)
}

/// Convert a socket address to its IPv4 form, if it is one.
pub fn as_v4(addr: SocketAddr) -> Option<SocketAddrV4> {
    match addr {
        SocketAddr::V4(v4) => Some(v4),
        SocketAddr::V6(v6) => v6.ip().to_ipv4_mapped().map(|ip| SocketAddrV4::new(ip, v6.port())),
    }
}
