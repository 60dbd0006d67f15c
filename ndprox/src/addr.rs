//! IPv6 address derivations used by the proxy engine.

use std::net::Ipv6Addr;

/// Solicited-node multicast group for a unicast address (RFC 4291 §2.7.1).
///
/// `ff02::1:ffXX:XXXX` where `XX:XXXX` are the low 24 bits of the address.
pub fn solicited_node(target: &Ipv6Addr) -> Ipv6Addr {
    let t = target.octets();
    Ipv6Addr::from([
        0xff, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x01, 0xff, t[13], t[14], t[15],
    ])
}

/// Ethernet address for an IPv6 multicast group (RFC 2464 §7).
///
/// `33:33` followed by the low 32 bits of the group address.
pub fn multicast_mac(group: &Ipv6Addr) -> [u8; 6] {
    let g = group.octets();
    [0x33, 0x33, g[12], g[13], g[14], g[15]]
}

/// Link-local address derived from a MAC via modified EUI-64 (RFC 4291 App. A).
pub fn link_local(mac: [u8; 6]) -> Ipv6Addr {
    Ipv6Addr::from([
        0xfe,
        0x80,
        0,
        0,
        0,
        0,
        0,
        0,
        mac[0] ^ 0x02,
        mac[1],
        mac[2],
        0xff,
        0xfe,
        mac[3],
        mac[4],
        mac[5],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solicited_node_keeps_low_24_bits() {
        let target: Ipv6Addr = "2001:db8::aa12:3456".parse().unwrap();
        let group = solicited_node(&target);
        assert_eq!(group.octets()[..13], "ff02::1:ff00:0".parse::<Ipv6Addr>().unwrap().octets()[..13]);
        assert_eq!(group.octets()[13..], target.octets()[13..]);
        assert!(group.is_multicast());
    }

    #[test]
    fn test_solicited_node_mac_mapping() {
        let target: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let group = solicited_node(&target);
        assert_eq!(multicast_mac(&group), [0x33, 0x33, 0xff, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn test_all_nodes_mac_mapping() {
        let all_nodes: Ipv6Addr = "ff02::1".parse().unwrap();
        assert_eq!(multicast_mac(&all_nodes), [0x33, 0x33, 0x00, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn test_link_local_flips_universal_bit() {
        let addr = link_local([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);
        let expected: Ipv6Addr = "fe80::5054:ff:fe12:3456".parse().unwrap();
        assert_eq!(addr, expected);
    }
}
