//! NS/NA frame parsing and construction using smoltcp
//!
//! Incoming frames are validated the whole way down before anything reacts to
//! them: Ethernet type, IPv6 payload length against the captured length,
//! hop-by-hop option chain, hop limit, and the ICMPv6 pseudo-header checksum.
//! Anything malformed is dropped silently.

use std::net::Ipv6Addr;

use smoltcp::wire::{
    EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr, Icmpv6Message, Icmpv6Packet,
    IpProtocol, Ipv6Packet, Ipv6Repr, NdiscNeighborFlags, NdiscRepr, RawHardwareAddress,
};

use crate::addr;

/// Ethernet header length.
pub const ETHER_HDR_LEN: usize = 14;

/// Fixed IPv6 header length.
pub const IPV6_HDR_LEN: usize = 40;

/// Largest frame the engine ever reads or writes.
pub const MAX_FRAME: usize = 2048;

/// A validated neighbor-discovery message lifted off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NdpEvent {
    /// Neighbor Solicitation: "who has `target`?"
    Solicit {
        src: Ipv6Addr,
        dst: Ipv6Addr,
        target: Ipv6Addr,
        /// Source link-layer address option; absent for DAD probes.
        src_ll: Option<[u8; 6]>,
    },
    /// Neighbor Advertisement for `target`.
    Advert { target: Ipv6Addr },
}

/// Parse and validate a captured Ethernet frame into an [`NdpEvent`].
///
/// Returns `None` for anything that is not a well-formed NS/NA: wrong
/// ethertype, inconsistent payload length, broken extension-header chain,
/// hop limit other than 255, or a checksum mismatch.
pub fn parse(frame: &[u8]) -> Option<NdpEvent> {
    let eth = EthernetFrame::new_checked(frame).ok()?;
    if eth.ethertype() != EthernetProtocol::Ipv6 {
        return None;
    }

    let ipv6 = Ipv6Packet::new_checked(eth.payload()).ok()?;
    let plen = ipv6.payload_len() as usize;
    if frame.len() != ETHER_HDR_LEN + IPV6_HDR_LEN + plen {
        return None;
    }
    if ipv6.hop_limit() != 255 {
        return None;
    }

    let src = ipv6.src_addr();
    let dst = ipv6.dst_addr();
    let payload = ipv6.payload();

    // Skip through any hop-by-hop option chain in front of the ICMPv6 body.
    let mut offset = 0usize;
    if ipv6.next_header() == IpProtocol::HopByHop {
        loop {
            if plen - offset < 8 {
                return None;
            }
            let next = payload[offset];
            let ext_len = 8 + 8 * payload[offset + 1] as usize;
            if plen - offset < ext_len {
                return None;
            }
            offset += ext_len;
            if next == u8::from(IpProtocol::Icmpv6) {
                break;
            } else if next != u8::from(IpProtocol::HopByHop) {
                return None;
            }
        }
    } else if ipv6.next_header() != IpProtocol::Icmpv6 {
        return None;
    }

    let icmp = Icmpv6Packet::new_checked(&payload[offset..]).ok()?;
    if !icmp.verify_checksum(&src, &dst) {
        return None;
    }

    match icmp.msg_type() {
        Icmpv6Message::NeighborSolicit => {
            let NdiscRepr::NeighborSolicit { target_addr, lladdr } =
                NdiscRepr::parse(&icmp).ok()?
            else {
                return None;
            };
            // A solicitation with a specified source must carry exactly one
            // 6-byte source link-layer option; DAD probes carry none.
            let src_ll = if src.is_unspecified() {
                None
            } else {
                let ll = lladdr?;
                let bytes = ll.as_bytes();
                if bytes.len() != 6 {
                    return None;
                }
                Some([bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]])
            };
            Some(NdpEvent::Solicit {
                src,
                dst,
                target: target_addr,
                src_ll,
            })
        }
        Icmpv6Message::NeighborAdvert => {
            let NdiscRepr::NeighborAdvert { target_addr, .. } = NdiscRepr::parse(&icmp).ok()?
            else {
                return None;
            };
            Some(NdpEvent::Advert {
                target: target_addr,
            })
        }
        _ => None,
    }
}

/// Everything needed to construct a Neighbor Advertisement frame.
#[derive(Debug, Clone, Copy)]
pub struct AdvertSpec {
    /// Address being advertised; also the IPv6 source of the frame.
    pub target: Ipv6Addr,
    /// IPv6 destination (the solicitor, or a multicast group).
    pub dst: Ipv6Addr,
    /// Ethernet destination.
    pub dst_ll: [u8; 6],
    /// MAC of the interface the advertisement leaves on; becomes the
    /// target link-layer option and the Ethernet source.
    pub iface_mac: [u8; 6],
    /// Whether to set the router flag.
    pub router: bool,
}

/// Build a Neighbor Advertisement frame.
///
/// The override flag is always set; the solicited flag only when the reply
/// goes out unicast.
pub fn build_advert(spec: &AdvertSpec) -> Vec<u8> {
    let mut flags = NdiscNeighborFlags::OVERRIDE;
    if !spec.dst.is_multicast() {
        flags |= NdiscNeighborFlags::SOLICITED;
    }
    if spec.router {
        flags |= NdiscNeighborFlags::ROUTER;
    }

    let ndisc = NdiscRepr::NeighborAdvert {
        flags,
        target_addr: spec.target,
        lladdr: Some(RawHardwareAddress::from_bytes(&spec.iface_mac)),
    };

    emit_frame(spec.iface_mac, spec.dst_ll, spec.target, spec.dst, &ndisc)
}

/// Build a Neighbor Solicitation probing `target` out of the interface with
/// `iface_mac`.
///
/// The IPv6 source is the interface's EUI-64 link-local address; the frame is
/// addressed to the target's solicited-node group.
pub fn build_solicit(iface_mac: [u8; 6], target: Ipv6Addr) -> Vec<u8> {
    let src = addr::link_local(iface_mac);
    let dst = addr::solicited_node(&target);
    let dst_ll = addr::multicast_mac(&dst);

    let ndisc = NdiscRepr::NeighborSolicit {
        target_addr: target,
        lladdr: Some(RawHardwareAddress::from_bytes(&iface_mac)),
    };

    emit_frame(iface_mac, dst_ll, src, dst, &ndisc)
}

fn emit_frame(
    src_mac: [u8; 6],
    dst_mac: [u8; 6],
    src: Ipv6Addr,
    dst: Ipv6Addr,
    ndisc: &NdiscRepr<'_>,
) -> Vec<u8> {
    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress::from_bytes(&src_mac),
        dst_addr: EthernetAddress::from_bytes(&dst_mac),
        ethertype: EthernetProtocol::Ipv6,
    };

    let ipv6_repr = Ipv6Repr {
        src_addr: src,
        dst_addr: dst,
        next_header: IpProtocol::Icmpv6,
        payload_len: ndisc.buffer_len(),
        hop_limit: 255,
    };

    let total_len = eth_repr.buffer_len() + ipv6_repr.buffer_len() + ndisc.buffer_len();
    let mut buffer = vec![0u8; total_len];

    let mut frame = EthernetFrame::new_unchecked(&mut buffer);
    eth_repr.emit(&mut frame);

    let mut ipv6_packet = Ipv6Packet::new_unchecked(frame.payload_mut());
    ipv6_repr.emit(&mut ipv6_packet);

    let mut icmp_packet = Icmpv6Packet::new_unchecked(ipv6_packet.payload_mut());
    ndisc.emit(&mut icmp_packet);
    icmp_packet.fill_checksum(&src, &dst);

    buffer
}
