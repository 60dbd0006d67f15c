//! Test doubles and frame builders
//!
//! `MemoryLink` stands in for the AF_PACKET socket: scripted interfaces,
//! an inject queue for received frames, and a capture log for sent ones.
//! The frame builders construct NS/NA frames the way a peer on the link
//! would, independently of the engine's own builders.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::Ipv6Addr;
use std::os::fd::RawFd;
use std::rc::Rc;

use smoltcp::wire::{
    EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr, Icmpv6Message, Icmpv6Packet,
    IpProtocol, Ipv6Packet, Ipv6Repr, NdiscNeighborFlags, NdiscRepr, RawHardwareAddress,
};

use crate::addr;
use crate::link::{LinkChannel, LinkFlags, RecvOutcome};
use crate::packet::{ETHER_HDR_LEN, IPV6_HDR_LEN};

struct FakeIface {
    index: u32,
    mac: [u8; 6],
    flags: LinkFlags,
}

#[derive(Default)]
struct Inner {
    ifaces: HashMap<String, FakeIface>,
    rx: VecDeque<(u32, Vec<u8>)>,
    tx: Vec<(u32, Vec<u8>)>,
}

/// In-memory [`LinkChannel`]. Clones share the same state, so a test can
/// keep a handle after moving one into the daemon.
#[derive(Clone, Default)]
pub struct MemoryLink {
    inner: Rc<RefCell<Inner>>,
}

impl MemoryLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script an interface with the given kernel index and MAC.
    pub fn add_iface(&mut self, name: &str, index: u32, mac: [u8; 6]) {
        self.inner.borrow_mut().ifaces.insert(
            name.to_string(),
            FakeIface {
                index,
                mac,
                flags: LinkFlags::default(),
            },
        );
    }

    /// Overwrite an interface's current flags (the pre-daemon state).
    pub fn set_iface_flags(&mut self, name: &str, flags: LinkFlags) {
        self.inner
            .borrow_mut()
            .ifaces
            .get_mut(name)
            .expect("unknown test interface")
            .flags = flags;
    }

    /// Queue a frame as if it had been captured on `ifindex`.
    pub fn inject(&mut self, ifindex: u32, frame: Vec<u8>) {
        self.inner.borrow_mut().rx.push_back((ifindex, frame));
    }

    /// Drain everything the engine has sent so far.
    pub fn take_tx(&mut self) -> Vec<(u32, Vec<u8>)> {
        std::mem::take(&mut self.inner.borrow_mut().tx)
    }
}

impl LinkChannel for MemoryLink {
    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<RecvOutcome> {
        let Some((ifindex, frame)) = self.inner.borrow_mut().rx.pop_front() else {
            return Ok(RecvOutcome::Empty);
        };
        let len = frame.len().min(buf.len());
        buf[..len].copy_from_slice(&frame[..len]);
        Ok(RecvOutcome::Frame { ifindex, len })
    }

    fn send(&mut self, ifindex: u32, frame: &[u8]) -> io::Result<()> {
        self.inner.borrow_mut().tx.push((ifindex, frame.to_vec()));
        Ok(())
    }

    fn poll_fd(&self) -> Option<RawFd> {
        None
    }

    fn ifindex(&self, name: &str) -> io::Result<u32> {
        self.inner
            .borrow()
            .ifaces
            .get(name)
            .map(|iface| iface.index)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no interface {name}")))
    }

    fn ifname(&self, index: u32) -> io::Result<String> {
        self.inner
            .borrow()
            .ifaces
            .iter()
            .find(|(_, iface)| iface.index == index)
            .map(|(name, _)| name.clone())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no interface #{index}"))
            })
    }

    fn lladdr(&self, name: &str) -> io::Result<[u8; 6]> {
        self.inner
            .borrow()
            .ifaces
            .get(name)
            .map(|iface| iface.mac)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no interface {name}")))
    }

    fn flags(&self, name: &str) -> io::Result<LinkFlags> {
        self.inner
            .borrow()
            .ifaces
            .get(name)
            .map(|iface| iface.flags)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no interface {name}")))
    }

    fn set_flags(&mut self, name: &str, flags: LinkFlags) -> io::Result<()> {
        let mut inner = self.inner.borrow_mut();
        let iface = inner
            .ifaces
            .get_mut(name)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no interface {name}")))?;
        iface.flags = flags;
        Ok(())
    }
}

fn emit(src_mac: [u8; 6], dst_mac: [u8; 6], src: Ipv6Addr, dst: Ipv6Addr, ndisc: &NdiscRepr<'_>) -> Vec<u8> {
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

    let mut buffer = vec![0u8; eth_repr.buffer_len() + ipv6_repr.buffer_len() + ndisc.buffer_len()];
    let mut frame = EthernetFrame::new_unchecked(&mut buffer);
    eth_repr.emit(&mut frame);
    let mut ipv6_packet = Ipv6Packet::new_unchecked(frame.payload_mut());
    ipv6_repr.emit(&mut ipv6_packet);
    let mut icmp_packet = Icmpv6Packet::new_unchecked(ipv6_packet.payload_mut());
    ndisc.emit(&mut icmp_packet);
    icmp_packet.fill_checksum(&src, &dst);
    buffer
}

fn eth_dst_for(dst: &Ipv6Addr) -> [u8; 6] {
    if dst.is_multicast() {
        addr::multicast_mac(dst)
    } else {
        [0xff; 6]
    }
}

/// Neighbor Solicitation with a source link-layer option.
pub fn solicit_frame(src_mac: [u8; 6], src: Ipv6Addr, dst: Ipv6Addr, target: Ipv6Addr) -> Vec<u8> {
    let ndisc = NdiscRepr::NeighborSolicit {
        target_addr: target,
        lladdr: Some(RawHardwareAddress::from_bytes(&src_mac)),
    };
    emit(src_mac, eth_dst_for(&dst), src, dst, &ndisc)
}

/// Neighbor Solicitation without any options (e.g. a DAD probe).
pub fn solicit_frame_no_option(
    src_mac: [u8; 6],
    src: Ipv6Addr,
    dst: Ipv6Addr,
    target: Ipv6Addr,
) -> Vec<u8> {
    let ndisc = NdiscRepr::NeighborSolicit {
        target_addr: target,
        lladdr: None,
    };
    emit(src_mac, eth_dst_for(&dst), src, dst, &ndisc)
}

/// Neighbor Advertisement for `target`, as the target itself would send it.
pub fn advert_frame(src_mac: [u8; 6], target: Ipv6Addr) -> Vec<u8> {
    let ndisc = NdiscRepr::NeighborAdvert {
        flags: NdiscNeighborFlags::SOLICITED | NdiscNeighborFlags::OVERRIDE,
        target_addr: target,
        lladdr: Some(RawHardwareAddress::from_bytes(&src_mac)),
    };
    let dst: Ipv6Addr = "ff02::1".parse().unwrap();
    emit(src_mac, eth_dst_for(&dst), target, dst, &ndisc)
}

/// Flip one bit of the ICMPv6 checksum in place.
pub fn corrupt_checksum(frame: &mut [u8]) {
    frame[ETHER_HDR_LEN + IPV6_HDR_LEN + 2] ^= 0x01;
}

/// Re-frame with an 8-byte hop-by-hop header in front of the ICMPv6 body.
pub fn wrap_hop_by_hop(frame: &[u8]) -> Vec<u8> {
    let split = ETHER_HDR_LEN + IPV6_HDR_LEN;
    let mut out = Vec::with_capacity(frame.len() + 8);
    out.extend_from_slice(&frame[..split]);
    // next header ICMPv6, zero extension length, Pad1 options.
    out.extend_from_slice(&[58, 0, 0, 0, 0, 0, 0, 0]);
    out.extend_from_slice(&frame[split..]);

    out[ETHER_HDR_LEN + 6] = 0; // ip6_nxt = hop-by-hop
    let plen = u16::from_be_bytes([out[ETHER_HDR_LEN + 4], out[ETHER_HDR_LEN + 5]]) + 8;
    out[ETHER_HDR_LEN + 4..ETHER_HDR_LEN + 6].copy_from_slice(&plen.to_be_bytes());
    out
}

/// A decoded Neighbor Advertisement, for assertions on engine output.
#[derive(Debug)]
pub struct ParsedAdvert {
    pub eth_src: [u8; 6],
    pub eth_dst: [u8; 6],
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
    pub target: Ipv6Addr,
    pub router: bool,
    pub solicited: bool,
    pub override_flag: bool,
    pub lladdr: Option<[u8; 6]>,
}

/// Decode an NA frame emitted by the engine.
pub fn parse_advert(frame: &[u8]) -> Option<ParsedAdvert> {
    let (eth_src, eth_dst, src, dst, icmp) = split_frame(frame)?;
    let icmp = Icmpv6Packet::new_checked(icmp).ok()?;
    if icmp.msg_type() != Icmpv6Message::NeighborAdvert {
        return None;
    }
    let NdiscRepr::NeighborAdvert {
        flags,
        target_addr,
        lladdr,
    } = NdiscRepr::parse(&icmp).ok()?
    else {
        return None;
    };
    Some(ParsedAdvert {
        eth_src,
        eth_dst,
        src,
        dst,
        target: target_addr,
        router: flags.contains(NdiscNeighborFlags::ROUTER),
        solicited: flags.contains(NdiscNeighborFlags::SOLICITED),
        override_flag: flags.contains(NdiscNeighborFlags::OVERRIDE),
        lladdr: lladdr.and_then(|ll| ll.as_bytes().try_into().ok()),
    })
}

/// A decoded Neighbor Solicitation, for assertions on engine output.
#[derive(Debug)]
pub struct ParsedSolicit {
    pub eth_src: [u8; 6],
    pub eth_dst: [u8; 6],
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
    pub target: Ipv6Addr,
    pub lladdr: Option<[u8; 6]>,
}

/// Decode an NS frame emitted by the engine.
pub fn parse_solicit(frame: &[u8]) -> Option<ParsedSolicit> {
    let (eth_src, eth_dst, src, dst, icmp) = split_frame(frame)?;
    let icmp = Icmpv6Packet::new_checked(icmp).ok()?;
    if icmp.msg_type() != Icmpv6Message::NeighborSolicit {
        return None;
    }
    let NdiscRepr::NeighborSolicit { target_addr, lladdr } = NdiscRepr::parse(&icmp).ok()? else {
        return None;
    };
    Some(ParsedSolicit {
        eth_src,
        eth_dst,
        src,
        dst,
        target: target_addr,
        lladdr: lladdr.and_then(|ll| ll.as_bytes().try_into().ok()),
    })
}

#[allow(clippy::type_complexity)]
fn split_frame(frame: &[u8]) -> Option<([u8; 6], [u8; 6], Ipv6Addr, Ipv6Addr, &[u8])> {
    let eth = EthernetFrame::new_checked(frame).ok()?;
    if eth.ethertype() != EthernetProtocol::Ipv6 {
        return None;
    }
    let eth_src = eth.src_addr().as_bytes().try_into().ok()?;
    let eth_dst = eth.dst_addr().as_bytes().try_into().ok()?;
    let ipv6 = Ipv6Packet::new_checked(eth.payload()).ok()?;
    if ipv6.next_header() != IpProtocol::Icmpv6 {
        return None;
    }
    Some((
        eth_src,
        eth_dst,
        ipv6.src_addr(),
        ipv6.dst_addr(),
        &frame[ETHER_HDR_LEN + IPV6_HDR_LEN..],
    ))
}
