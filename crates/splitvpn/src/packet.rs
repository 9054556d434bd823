//! IP packet inspection
//!
//! Only the fields needed to key a flow are read: IP version, addresses,
//! transport protocol and TCP/UDP ports. Packets pass through the router
//! unmodified.

use crate::classifier::ClassifyError;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_ICMPV6: u8 = 58;

/// Transport protocol of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Transport {
    Tcp,
    Udp,
    Icmp,
    Other(u8),
}

impl Transport {
    pub fn from_number(proto: u8) -> Self {
        match proto {
            IPPROTO_TCP => Transport::Tcp,
            IPPROTO_UDP => Transport::Udp,
            IPPROTO_ICMP | IPPROTO_ICMPV6 => Transport::Icmp,
            other => Transport::Other(other),
        }
    }

    pub fn has_ports(&self) -> bool {
        matches!(self, Transport::Tcp | Transport::Udp)
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::Udp => write!(f, "udp"),
            Transport::Icmp => write!(f, "icmp"),
            Transport::Other(n) => write!(f, "proto-{}", n),
        }
    }
}

/// Directional 5-tuple identifying one flow.
///
/// Ports are zero for transports without ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowTuple {
    pub transport: Transport,
    pub src: IpAddr,
    pub src_port: u16,
    pub dst: IpAddr,
    pub dst_port: u16,
}

impl FlowTuple {
    /// The tuple a reply to this flow carries
    pub fn reversed(&self) -> Self {
        Self {
            transport: self.transport,
            src: self.dst,
            src_port: self.dst_port,
            dst: self.src,
            dst_port: self.src_port,
        }
    }
}

impl fmt::Display for FlowTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{} -> {}:{}",
            self.transport, self.src, self.src_port, self.dst, self.dst_port
        )
    }
}

/// Read the flow tuple of a raw IPv4 or IPv6 packet
pub fn parse_flow(packet: &[u8]) -> Result<FlowTuple, ClassifyError> {
    let first = *packet.first().ok_or(ClassifyError::Truncated)?;

    match first >> 4 {
        4 => parse_ipv4(packet),
        6 => parse_ipv6(packet),
        version => Err(ClassifyError::NotIp(version)),
    }
}

fn parse_ipv4(packet: &[u8]) -> Result<FlowTuple, ClassifyError> {
    if packet.len() < 20 {
        return Err(ClassifyError::Truncated);
    }

    let ihl = ((packet[0] & 0x0F) as usize) * 4;
    if ihl < 20 || packet.len() < ihl {
        return Err(ClassifyError::Truncated);
    }

    let src = IpAddr::V4(Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]));
    let dst = IpAddr::V4(Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]));
    let transport = Transport::from_number(packet[9]);

    // Non-first fragments carry no transport header
    let fragment_offset = u16::from_be_bytes([packet[6], packet[7]]) & 0x1FFF;
    let (src_port, dst_port) = if fragment_offset == 0 {
        read_ports(packet, ihl, transport)?
    } else {
        (0, 0)
    };

    Ok(FlowTuple {
        transport,
        src,
        src_port,
        dst,
        dst_port,
    })
}

fn parse_ipv6(packet: &[u8]) -> Result<FlowTuple, ClassifyError> {
    if packet.len() < 40 {
        return Err(ClassifyError::Truncated);
    }

    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&packet[8..24]);
    dst.copy_from_slice(&packet[24..40]);

    let header = ipv6_transport(packet)?;
    let transport = Transport::from_number(header.proto);
    let (src_port, dst_port) = match header.l4 {
        Some(l4) => read_ports(packet, l4, transport)?,
        None => (0, 0),
    };

    Ok(FlowTuple {
        transport,
        src: IpAddr::V6(Ipv6Addr::from(src)),
        src_port,
        dst: IpAddr::V6(Ipv6Addr::from(dst)),
        dst_port,
    })
}

const IPV6_HOP_BY_HOP: u8 = 0;
const IPV6_ROUTING: u8 = 43;
const IPV6_FRAGMENT: u8 = 44;
const IPV6_AUTH: u8 = 51;
const IPV6_DEST_OPTS: u8 = 60;
const MAX_IPV6_EXTENSIONS: usize = 8;

/// Transport located behind the IPv6 extension header chain
struct Ipv6Transport {
    proto: u8,
    /// Offset of the transport header, `None` in non-first fragments
    l4: Option<usize>,
    /// Identification and "is first fragment" of a fragmented packet
    fragment: Option<(u32, bool)>,
}

fn ipv6_transport(packet: &[u8]) -> Result<Ipv6Transport, ClassifyError> {
    let mut next = packet[6];
    let mut offset = 40;
    let mut fragment = None;

    for _ in 0..MAX_IPV6_EXTENSIONS {
        let header = packet.get(offset..offset + 8).ok_or(ClassifyError::Truncated);
        let len = match next {
            IPV6_HOP_BY_HOP | IPV6_ROUTING | IPV6_DEST_OPTS => (header?[1] as usize + 1) * 8,
            IPV6_AUTH => (header?[1] as usize + 2) * 4,
            IPV6_FRAGMENT => {
                let header = header?;
                let frag_offset = u16::from_be_bytes([header[2], header[3]]) >> 3;
                let id = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
                fragment = Some((id, frag_offset == 0));
                if frag_offset != 0 {
                    return Ok(Ipv6Transport {
                        proto: header[0],
                        l4: None,
                        fragment,
                    });
                }
                8
            }
            proto => {
                return Ok(Ipv6Transport {
                    proto,
                    l4: Some(offset),
                    fragment,
                });
            }
        };
        next = packet[offset];
        offset += len;
    }
    Err(ClassifyError::Truncated)
}

/// Identifies the fragments of one datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentKey {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub id: u32,
    pub proto: u8,
}

/// Fragment a packet belongs to, if it is fragmented
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    pub key: FragmentKey,
    /// Only the first fragment carries the transport header
    pub first: bool,
}

/// Fragmentation info of a packet that `parse_flow` accepted
pub fn fragment_of(packet: &[u8]) -> Option<Fragment> {
    match packet.first()? >> 4 {
        4 if packet.len() >= 20 => {
            let flags = u16::from_be_bytes([packet[6], packet[7]]);
            let offset = flags & 0x1FFF;
            let more = flags & 0x2000 != 0;
            if offset == 0 && !more {
                return None;
            }
            Some(Fragment {
                key: FragmentKey {
                    src: IpAddr::V4(Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15])),
                    dst: IpAddr::V4(Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19])),
                    id: u16::from_be_bytes([packet[4], packet[5]]) as u32,
                    proto: packet[9],
                },
                first: offset == 0,
            })
        }
        6 if packet.len() >= 40 => {
            let header = ipv6_transport(packet).ok()?;
            let (id, first) = header.fragment?;
            let mut src = [0u8; 16];
            let mut dst = [0u8; 16];
            src.copy_from_slice(&packet[8..24]);
            dst.copy_from_slice(&packet[24..40]);
            Some(Fragment {
                key: FragmentKey {
                    src: IpAddr::V6(Ipv6Addr::from(src)),
                    dst: IpAddr::V6(Ipv6Addr::from(dst)),
                    id,
                    proto: header.proto,
                },
                first,
            })
        }
        _ => None,
    }
}

fn read_ports(packet: &[u8], l4: usize, transport: Transport) -> Result<(u16, u16), ClassifyError> {
    if !transport.has_ports() {
        return Ok((0, 0));
    }
    if packet.len() < l4 + 4 {
        return Err(ClassifyError::Truncated);
    }

    Ok((
        u16::from_be_bytes([packet[l4], packet[l4 + 1]]),
        u16::from_be_bytes([packet[l4 + 2], packet[l4 + 3]]),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ipv4_packet, ipv6_udp_packet, ipv6_with_extension};

    #[test]
    fn test_parse_ipv4_udp() {
        let pkt = ipv4_packet(IPPROTO_UDP, [10, 111, 0, 1], 40000, [10, 8, 0, 1], 53, b"q");
        let flow = parse_flow(&pkt).unwrap();

        assert_eq!(flow.transport, Transport::Udp);
        assert_eq!(flow.src, IpAddr::V4(Ipv4Addr::new(10, 111, 0, 1)));
        assert_eq!(flow.src_port, 40000);
        assert_eq!(flow.dst_port, 53);
    }

    #[test]
    fn test_parse_ipv4_tcp_reversed() {
        let pkt = ipv4_packet(IPPROTO_TCP, [10, 111, 0, 1], 50123, [93, 184, 216, 34], 443, &[0; 20]);
        let flow = parse_flow(&pkt).unwrap();
        let reply = flow.reversed();

        assert_eq!(reply.src, flow.dst);
        assert_eq!(reply.dst_port, 50123);
        assert_eq!(reply.reversed(), flow);
    }

    #[test]
    fn test_parse_icmp_has_no_ports() {
        let pkt = ipv4_packet(IPPROTO_ICMP, [10, 0, 0, 1], 0, [10, 0, 0, 2], 0, &[8, 0, 0, 0]);
        let flow = parse_flow(&pkt).unwrap();
        assert_eq!(flow.transport, Transport::Icmp);
        assert_eq!((flow.src_port, flow.dst_port), (0, 0));
    }

    #[test]
    fn test_parse_ipv6_udp() {
        let src: Ipv6Addr = "fd00::2".parse().unwrap();
        let dst: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let pkt = ipv6_udp_packet(src, 5353, dst, 53);
        let flow = parse_flow(&pkt).unwrap();

        assert_eq!(flow.src, IpAddr::V6(src));
        assert_eq!(flow.dst, IpAddr::V6(dst));
        assert_eq!(flow.dst_port, 53);
    }

    #[test]
    fn test_ipv6_extension_headers_are_skipped() {
        let src: Ipv6Addr = "fd00::2".parse().unwrap();
        let dst: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let plain = ipv6_udp_packet(src, 5353, dst, 53);

        // Hop-by-hop options, 8 bytes
        let pkt = ipv6_with_extension(&plain, IPV6_HOP_BY_HOP, &[0, 0, 1, 4, 0, 0, 0, 0]);
        let flow = parse_flow(&pkt).unwrap();
        assert_eq!(flow.transport, Transport::Udp);
        assert_eq!((flow.src_port, flow.dst_port), (5353, 53));
        assert_eq!(fragment_of(&pkt), None);

        // First fragment: ports are read, the datagram is keyed
        let first = ipv6_with_extension(&plain, IPV6_FRAGMENT, &[0, 0, 0, 1, 0, 0, 0, 7]);
        assert_eq!(parse_flow(&first).unwrap().dst_port, 53);
        let fragment = fragment_of(&first).unwrap();
        assert!(fragment.first);
        assert_eq!(fragment.key.id, 7);
        assert_eq!(fragment.key.proto, IPPROTO_UDP);

        // Later fragment at offset 8: no transport header
        let later = ipv6_with_extension(&plain, IPV6_FRAGMENT, &[0, 0, 0, 8, 0, 0, 0, 7]);
        assert_eq!((parse_flow(&later).unwrap().src_port, parse_flow(&later).unwrap().dst_port), (0, 0));
        assert_eq!(fragment_of(&later).unwrap().key, fragment.key);
        assert!(!fragment_of(&later).unwrap().first);
    }

    #[test]
    fn test_ipv4_fragments() {
        let mut pkt = ipv4_packet(IPPROTO_UDP, [10, 111, 0, 1], 40000, [10, 8, 0, 1], 53, b"q");
        assert_eq!(fragment_of(&pkt), None);

        pkt[4..6].copy_from_slice(&0x1234u16.to_be_bytes());
        pkt[6] = 0x20;
        let first = fragment_of(&pkt).unwrap();
        assert!(first.first);
        assert_eq!(parse_flow(&pkt).unwrap().src_port, 40000);

        // Offset 185 (1480 bytes), last fragment
        pkt[6..8].copy_from_slice(&185u16.to_be_bytes());
        let later = fragment_of(&pkt).unwrap();
        assert!(!later.first);
        assert_eq!(later.key, first.key);
        assert_eq!(parse_flow(&pkt).unwrap().src_port, 0);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse_flow(&[]), Err(ClassifyError::Truncated));
        assert_eq!(parse_flow(&[0x45, 0, 0]), Err(ClassifyError::Truncated));
        assert_eq!(parse_flow(&[0x20; 40]), Err(ClassifyError::NotIp(2)));

        // UDP header cut short
        let mut pkt = ipv4_packet(IPPROTO_UDP, [1, 1, 1, 1], 1, [2, 2, 2, 2], 2, b"");
        pkt.truncate(22);
        assert_eq!(parse_flow(&pkt), Err(ClassifyError::Truncated));
    }
}
