//! Internet checksums for IPv4 headers and TCP/UDP segments
//!
//! All functions are pure one's-complement arithmetic over big-endian 16-bit
//! words. A trailing odd byte is padded on the right (shifted left 8 bits).

use std::net::Ipv4Addr;

pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

/// Sum big-endian 16-bit words into a 32-bit accumulator without folding.
fn sum_words(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum = sum.wrapping_add(((word[0] as u32) << 8) | word[1] as u32);
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add((*last as u32) << 8);
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Checksum of an IPv4 header.
///
/// Computed with the checksum field zeroed this yields the value to store;
/// computed over a header that already carries a valid checksum it yields 0.
pub fn ip_checksum(header: &[u8]) -> u16 {
    fold(sum_words(0, header))
}

/// Checksum of a TCP or UDP segment including the 12-byte pseudo-header.
pub fn transport_checksum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, segment: &[u8]) -> u16 {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src.octets());
    pseudo[4..8].copy_from_slice(&dst.octets());
    pseudo[9] = protocol;
    pseudo[10..12].copy_from_slice(&(segment.len() as u16).to_be_bytes());

    let sum = sum_words(0, &pseudo);
    fold(sum_words(sum, segment))
}

pub fn tcp_checksum(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> u16 {
    transport_checksum(src, dst, PROTO_TCP, segment)
}

/// UDP checksum; a computed zero is sent as `0xFFFF` since zero means "no checksum".
pub fn udp_checksum(src: Ipv4Addr, dst: Ipv4Addr, datagram: &[u8]) -> u16 {
    match transport_checksum(src, dst, PROTO_UDP, datagram) {
        0 => 0xFFFF,
        cksum => cksum,
    }
}

/// Verify a complete IPv4 packet: header checksum and, for TCP/UDP, the transport checksum.
pub fn verify_ipv4(packet: &[u8]) -> bool {
    if packet.len() < 20 {
        return false;
    }
    let ihl = ((packet[0] & 0x0F) as usize) * 4;
    let total = u16::from_be_bytes([packet[2], packet[3]]) as usize;
    if ihl < 20 || total < ihl || packet.len() < total {
        return false;
    }
    if ip_checksum(&packet[..ihl]) != 0 {
        return false;
    }

    let src = Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);
    let dst = Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);
    let segment = &packet[ihl..total];
    match packet[9] {
        PROTO_TCP => transport_checksum(src, dst, PROTO_TCP, segment) == 0,
        // UDP checksum 0 means the sender did not compute one
        PROTO_UDP if segment.len() >= 8 && segment[6..8] == [0, 0] => true,
        PROTO_UDP => transport_checksum(src, dst, PROTO_UDP, segment) == 0,
        _ => true,
    }
}
