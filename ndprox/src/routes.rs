//! Kernel IPv6 routing table snapshot
//!
//! `auto` rules need to know which interface a target is reachable through.
//! The table is read from `/proc/net/ipv6_route` once at startup (only when
//! an auto rule exists) into a longest-prefix-match trie.

use std::fs;
use std::io;
use std::net::Ipv6Addr;

use ipnet::Ipv6Net;
use prefix_trie::PrefixMap;
use tracing::debug;

use crate::link::LinkChannel;

const PROC_IPV6_ROUTE: &str = "/proc/net/ipv6_route";

const RTF_UP: u32 = 0x0001;
const RTF_GATEWAY: u32 = 0x0002;

/// One kernel route.
#[derive(Debug, Clone)]
pub struct Route {
    pub dev: String,
    pub ifindex: u32,
    pub gateway: Option<Ipv6Addr>,
    pub metric: u32,
}

/// Longest-prefix-match view of the kernel routing table.
pub struct RouteTable {
    map: PrefixMap<Ipv6Net, Route>,
}

impl RouteTable {
    /// Read the current kernel table.
    pub fn load(link: &dyn LinkChannel) -> io::Result<Self> {
        let text = fs::read_to_string(PROC_IPV6_ROUTE)?;
        Ok(Self::parse(&text, link))
    }

    /// Parse the `/proc/net/ipv6_route` format. Lines that do not parse or
    /// name an unknown device are skipped.
    pub fn parse(text: &str, link: &dyn LinkChannel) -> Self {
        let mut map: PrefixMap<Ipv6Net, Route> = PrefixMap::new();

        for line in text.lines() {
            let Some((prefix, route)) = parse_line(line, link) else {
                continue;
            };
            match map.get(&prefix) {
                Some(existing) if existing.metric <= route.metric => {}
                _ => {
                    map.insert(prefix, route);
                }
            }
        }

        debug!("kernel route table loaded");
        Self { map }
    }

    /// Longest matching route for an address.
    pub fn lookup(&self, addr: &Ipv6Addr) -> Option<&Route> {
        let host = Ipv6Net::new(*addr, 128).ok()?;
        self.map.get_lpm(&host).map(|(_, route)| route)
    }

    /// Route used to reach `addr`, following the gateway one step when
    /// `autovia` is set and the route is indirect.
    pub fn resolve(&self, addr: &Ipv6Addr, autovia: bool) -> Option<&Route> {
        let route = self.lookup(addr)?;
        match route.gateway {
            Some(gateway) if autovia => self.lookup(&gateway),
            _ => Some(route),
        }
    }
}

fn parse_line(line: &str, link: &dyn LinkChannel) -> Option<(Ipv6Net, Route)> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 10 {
        return None;
    }

    let dest = parse_hex_addr(fields[0])?;
    let plen = u8::from_str_radix(fields[1], 16).ok()?;
    let nexthop = parse_hex_addr(fields[4])?;
    let metric = u32::from_str_radix(fields[5], 16).ok()?;
    let flags = u32::from_str_radix(fields[8], 16).ok()?;
    let dev = fields[9];

    if flags & RTF_UP == 0 {
        return None;
    }

    let prefix = Ipv6Net::new(dest, plen).ok()?;
    let ifindex = link.ifindex(dev).ok()?;
    let gateway = (flags & RTF_GATEWAY != 0).then_some(nexthop);

    Some((
        prefix,
        Route {
            dev: dev.to_string(),
            ifindex,
            gateway,
            metric,
        },
    ))
}

fn parse_hex_addr(s: &str) -> Option<Ipv6Addr> {
    if s.len() != 32 {
        return None;
    }
    let mut octets = [0u8; 16];
    for (i, octet) in octets.iter_mut().enumerate() {
        *octet = u8::from_str_radix(&s[2 * i..2 * i + 2], 16).ok()?;
    }
    Some(Ipv6Addr::from(octets))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::MemoryLink;

    const MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x00, 0x00, 0x01];

    fn sample_link() -> MemoryLink {
        let mut link = MemoryLink::new();
        link.add_iface("eth0", 2, MAC);
        link.add_iface("eth1", 3, MAC);
        link
    }

    // dest plen src splen nexthop metric refcnt use flags dev
    const SAMPLE: &str = "\
20010db8000000000000000000000000 40 00000000000000000000000000000000 00 00000000000000000000000000000000 00000100 00000000 00000000 00000001 eth1
20010db8000100000000000000000000 40 00000000000000000000000000000000 00 fe800000000000000000000000000001 00000400 00000000 00000000 00000003 eth0
fe800000000000000000000000000000 40 00000000000000000000000000000000 00 00000000000000000000000000000000 00000100 00000000 00000000 00000001 eth0
00000000000000000000000000000000 00 00000000000000000000000000000000 00 00000000000000000000000000000000 00000000 00000000 00000000 00000000 down0
";

    #[test]
    fn test_parse_and_lookup() {
        let link = sample_link();
        let table = RouteTable::parse(SAMPLE, &link);

        let route = table.lookup(&"2001:db8::5".parse().unwrap()).unwrap();
        assert_eq!(route.dev, "eth1");
        assert_eq!(route.ifindex, 3);
        assert!(route.gateway.is_none());

        // Not-UP routes and unknown devices are skipped.
        assert!(table.lookup(&"2001:db9::1".parse().unwrap()).is_none());
    }

    #[test]
    fn test_longest_prefix_wins() {
        let link = sample_link();
        let extra = format!(
            "{SAMPLE}20010db8000000000000000000000000 30 00000000000000000000000000000000 00 00000000000000000000000000000000 00000100 00000000 00000000 00000001 eth0\n"
        );
        let table = RouteTable::parse(&extra, &link);
        // /64 beats /48 for an address inside both.
        let route = table.lookup(&"2001:db8::5".parse().unwrap()).unwrap();
        assert_eq!(route.dev, "eth1");
        // Outside the /64 the /48 still matches.
        let route = table.lookup(&"2001:db8:ff::5".parse().unwrap()).unwrap();
        assert_eq!(route.dev, "eth0");
    }

    #[test]
    fn test_autovia_follows_gateway() {
        let link = sample_link();
        let table = RouteTable::parse(SAMPLE, &link);
        let target = "2001:db8:1::9".parse().unwrap();

        // Without autovia the indirect route itself is used.
        let direct = table.resolve(&target, false).unwrap();
        assert_eq!(direct.dev, "eth0");

        // With autovia the gateway's own (link-local) route decides.
        let via = table.resolve(&target, true).unwrap();
        assert_eq!(via.dev, "eth0");
        assert!(via.gateway.is_none());
    }

    #[test]
    fn test_duplicate_prefix_keeps_lowest_metric() {
        let link = sample_link();
        let dup = "\
20010db8000000000000000000000000 40 00000000000000000000000000000000 00 00000000000000000000000000000000 00000400 00000000 00000000 00000001 eth0
20010db8000000000000000000000000 40 00000000000000000000000000000000 00 00000000000000000000000000000000 00000100 00000000 00000000 00000001 eth1
";
        let table = RouteTable::parse(dup, &link);
        assert_eq!(table.lookup(&"2001:db8::1".parse().unwrap()).unwrap().dev, "eth1");
    }
}
