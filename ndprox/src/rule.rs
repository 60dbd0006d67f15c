//! Proxy rules and target matching
//!
//! Each proxy carries an ordered list of `(prefix, mode)` rules; the first
//! rule whose prefix covers a solicited target decides how the target is
//! validated.

use std::net::Ipv6Addr;
use std::rc::Rc;

use ipnet::Ipv6Net;

use crate::iface::Iface;

/// How a matched target is validated before it is advertised.
#[derive(Clone)]
pub enum RuleMode {
    /// Advertise immediately, no downstream probe.
    Static,
    /// Consult the kernel routing table for a downstream interface.
    Auto { autovia: bool },
    /// Probe across the given downstream interface.
    Iface(Rc<Iface>),
}

impl RuleMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleMode::Static => "static",
            RuleMode::Auto { .. } => "auto",
            RuleMode::Iface(_) => "iface",
        }
    }
}

/// One `(prefix, mode)` entry.
pub struct Rule {
    pub prefix: Ipv6Net,
    pub mode: RuleMode,
}

impl Rule {
    /// Whether the high-order `prefix_len` bits of `addr` match this rule.
    pub fn matches(&self, addr: &Ipv6Addr) -> bool {
        self.prefix.contains(addr)
    }
}

/// First rule in insertion order whose prefix covers `addr`.
pub fn first_match<'a>(rules: &'a [Rule], addr: &Ipv6Addr) -> Option<&'a Rule> {
    rules.iter().find(|rule| rule.matches(addr))
}

/// Union of rule modes across all proxies, driving startup preparation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuleKinds {
    pub any_static: bool,
    pub any_auto: bool,
    pub any_iface: bool,
}

impl RuleKinds {
    pub fn record(&mut self, mode: &RuleMode) {
        match mode {
            RuleMode::Static => self.any_static = true,
            RuleMode::Auto { .. } => self.any_auto = true,
            RuleMode::Iface(_) => self.any_iface = true,
        }
    }
}
