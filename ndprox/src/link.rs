//! Raw link-layer channel
//!
//! The engine talks to the wire through the [`LinkChannel`] trait so the
//! packet path can be driven by an in-memory double in tests. The production
//! implementation is [`PacketSocket`]: one shared `AF_PACKET` socket carrying
//! every interface, demultiplexed by `sll_ifindex`, with a classic-BPF filter
//! that drops everything except ICMPv6 NS/NA frames in the kernel.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::libc;

/// IFF_PROMISC / IFF_ALLMULTI as seen by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkFlags {
    pub promisc: bool,
    pub allmulti: bool,
}

/// Outcome of a non-blocking receive.
#[derive(Debug)]
pub enum RecvOutcome {
    /// A frame arrived on the interface with the given kernel index.
    Frame { ifindex: u32, len: usize },
    /// Nothing pending.
    Empty,
}

/// Capability the packet engine needs from the host link layer.
pub trait LinkChannel {
    /// Try to receive one frame into `buf` (non-blocking).
    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<RecvOutcome>;

    /// Send a fully-formed Ethernet frame out of the given interface.
    fn send(&mut self, ifindex: u32, frame: &[u8]) -> io::Result<()>;

    /// File descriptor to poll for read readiness, if there is one.
    fn poll_fd(&self) -> Option<RawFd>;

    /// Resolve an interface name to its kernel index.
    fn ifindex(&self, name: &str) -> io::Result<u32>;

    /// Resolve a kernel index back to the interface name.
    fn ifname(&self, index: u32) -> io::Result<String>;

    /// Query the interface's link-layer (MAC) address.
    fn lladdr(&self, name: &str) -> io::Result<[u8; 6]>;

    /// Read the interface's PROMISC/ALLMULTI flags.
    fn flags(&self, name: &str) -> io::Result<LinkFlags>;

    /// Set the interface's PROMISC/ALLMULTI flags.
    fn set_flags(&mut self, name: &str, flags: LinkFlags) -> io::Result<()>;
}

const ETH_P_IPV6: u16 = 0x86dd;

const ICMPV6_NS: u8 = 135;
const ICMPV6_NA: u8 = 136;

// Classic BPF opcodes (BPF_LD|BPF_H|BPF_ABS etc).
const OP_LD_H_ABS: u16 = 0x28;
const OP_LD_B_ABS: u16 = 0x30;
const OP_JEQ_K: u16 = 0x15;
const OP_RET_K: u16 = 0x06;

const fn bpf_stmt(code: u16, k: u32) -> libc::sock_filter {
    libc::sock_filter {
        code,
        jt: 0,
        jf: 0,
        k,
    }
}

const fn bpf_jump(code: u16, k: u32, jt: u8, jf: u8) -> libc::sock_filter {
    libc::sock_filter { code, jt, jf, k }
}

/// Shared raw packet socket (Linux `AF_PACKET`).
pub struct PacketSocket {
    fd: OwnedFd,
}

impl PacketSocket {
    /// Open the shared socket and install the NS/NA filter.
    ///
    /// Both steps are fatal at startup when they fail.
    pub fn open() -> io::Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK,
                ETH_P_IPV6.to_be() as libc::c_int,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let sock = Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        };
        sock.attach_filter()?;
        Ok(sock)
    }

    /// Install the in-kernel filter admitting only IPv6 ICMPv6 NS/NA frames.
    fn attach_filter(&self) -> io::Result<()> {
        let filter: [libc::sock_filter; 9] = [
            // Load ether_type; drop unless IPv6.
            bpf_stmt(OP_LD_H_ABS, 12),
            bpf_jump(OP_JEQ_K, ETH_P_IPV6 as u32, 0, 5),
            // Load ip6_nxt; drop unless ICMPv6.
            bpf_stmt(OP_LD_B_ABS, 20),
            bpf_jump(OP_JEQ_K, libc::IPPROTO_ICMPV6 as u32, 0, 3),
            // Load icmp6_type; keep NS and NA.
            bpf_stmt(OP_LD_B_ABS, 54),
            bpf_jump(OP_JEQ_K, ICMPV6_NS as u32, 2, 0),
            bpf_jump(OP_JEQ_K, ICMPV6_NA as u32, 1, 0),
            bpf_stmt(OP_RET_K, 0),
            bpf_stmt(OP_RET_K, u32::MAX),
        ];

        let prog = libc::sock_fprog {
            len: filter.len() as u16,
            filter: filter.as_ptr() as *mut libc::sock_filter,
        };

        let rc = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_ATTACH_FILTER,
                (&prog as *const libc::sock_fprog).cast(),
                mem::size_of::<libc::sock_fprog>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn ifreq_for(name: &str) -> io::Result<libc::ifreq> {
        let mut req: libc::ifreq = unsafe { mem::zeroed() };
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() >= req.ifr_name.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid interface name {name:?}"),
            ));
        }
        for (slot, b) in req.ifr_name.iter_mut().zip(bytes) {
            *slot = *b as libc::c_char;
        }
        Ok(req)
    }

    fn raw_flags(&self, name: &str) -> io::Result<libc::c_short> {
        let mut req = Self::ifreq_for(name)?;
        let rc = unsafe { libc::ioctl(self.fd.as_raw_fd(), libc::SIOCGIFFLAGS, &mut req) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(unsafe { req.ifr_ifru.ifru_flags })
    }
}

impl LinkChannel for PacketSocket {
    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<RecvOutcome> {
        let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
        let mut addrlen = mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;

        let len = unsafe {
            libc::recvfrom(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr().cast(),
                buf.len(),
                0,
                (&mut addr as *mut libc::sockaddr_ll).cast(),
                &mut addrlen,
            )
        };
        if len < 0 {
            let err = io::Error::last_os_error();
            return if err.kind() == io::ErrorKind::WouldBlock {
                Ok(RecvOutcome::Empty)
            } else {
                Err(err)
            };
        }
        Ok(RecvOutcome::Frame {
            ifindex: addr.sll_ifindex as u32,
            len: len as usize,
        })
    }

    fn send(&mut self, ifindex: u32, frame: &[u8]) -> io::Result<()> {
        let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as libc::sa_family_t;
        addr.sll_protocol = ETH_P_IPV6.to_be();
        addr.sll_ifindex = ifindex as libc::c_int;

        let len = unsafe {
            libc::sendto(
                self.fd.as_raw_fd(),
                frame.as_ptr().cast(),
                frame.len(),
                0,
                (&addr as *const libc::sockaddr_ll).cast(),
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if len < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn poll_fd(&self) -> Option<RawFd> {
        Some(self.fd.as_raw_fd())
    }

    fn ifindex(&self, name: &str) -> io::Result<u32> {
        nix::net::if_::if_nametoindex(name)
            .map(|index| index as u32)
            .map_err(io::Error::from)
    }

    fn ifname(&self, index: u32) -> io::Result<String> {
        let mut buf = [0 as libc::c_char; libc::IF_NAMESIZE];
        let rc = unsafe { libc::if_indextoname(index as libc::c_uint, buf.as_mut_ptr()) };
        if rc.is_null() {
            return Err(io::Error::last_os_error());
        }
        let name = buf
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8 as char)
            .collect();
        Ok(name)
    }

    fn lladdr(&self, name: &str) -> io::Result<[u8; 6]> {
        let mut req = Self::ifreq_for(name)?;
        let rc = unsafe { libc::ioctl(self.fd.as_raw_fd(), libc::SIOCGIFHWADDR, &mut req) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        let sa = unsafe { req.ifr_ifru.ifru_hwaddr };
        let mut mac = [0u8; 6];
        for (out, b) in mac.iter_mut().zip(&sa.sa_data[..6]) {
            *out = *b as u8;
        }
        Ok(mac)
    }

    fn flags(&self, name: &str) -> io::Result<LinkFlags> {
        let raw = self.raw_flags(name)?;
        Ok(LinkFlags {
            promisc: raw & libc::IFF_PROMISC as libc::c_short != 0,
            allmulti: raw & libc::IFF_ALLMULTI as libc::c_short != 0,
        })
    }

    fn set_flags(&mut self, name: &str, flags: LinkFlags) -> io::Result<()> {
        let mut raw = self.raw_flags(name)?;
        if flags.promisc {
            raw |= libc::IFF_PROMISC as libc::c_short;
        } else {
            raw &= !(libc::IFF_PROMISC as libc::c_short);
        }
        if flags.allmulti {
            raw |= libc::IFF_ALLMULTI as libc::c_short;
        } else {
            raw &= !(libc::IFF_ALLMULTI as libc::c_short);
        }

        let mut req = Self::ifreq_for(name)?;
        req.ifr_ifru.ifru_flags = raw;
        let rc = unsafe { libc::ioctl(self.fd.as_raw_fd(), libc::SIOCSIFFLAGS, &req) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_program_shape() {
        // The jump offsets have to land on the final keep/drop statements.
        let filter = [
            bpf_stmt(OP_LD_H_ABS, 12),
            bpf_jump(OP_JEQ_K, ETH_P_IPV6 as u32, 0, 5),
            bpf_stmt(OP_LD_B_ABS, 20),
            bpf_jump(OP_JEQ_K, libc::IPPROTO_ICMPV6 as u32, 0, 3),
            bpf_stmt(OP_LD_B_ABS, 54),
            bpf_jump(OP_JEQ_K, ICMPV6_NS as u32, 2, 0),
            bpf_jump(OP_JEQ_K, ICMPV6_NA as u32, 1, 0),
            bpf_stmt(OP_RET_K, 0),
            bpf_stmt(OP_RET_K, u32::MAX),
        ];
        assert_eq!(filter.len(), 9);
        // Non-IPv6 ethertype falls through to the drop statement.
        assert_eq!(1 + 1 + filter[1].jf as usize, 7);
        // Non-ICMPv6 next header falls through to the drop statement.
        assert_eq!(3 + 1 + filter[3].jf as usize, 7);
        // NS and NA both land on the keep statement.
        assert_eq!(5 + 1 + filter[5].jt as usize, 8);
        assert_eq!(6 + 1 + filter[6].jt as usize, 8);
    }
}
