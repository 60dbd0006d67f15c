//! Per-upstream proxy
//!
//! A proxy is bound to one upstream interface. It matches solicited targets
//! against its rules, owns the resulting sessions, and answers on the
//! upstream link on their behalf.

use std::collections::HashMap;
use std::io;
use std::net::Ipv6Addr;
use std::rc::Rc;
use std::time::Instant;

use tracing::debug;

use crate::config::Timing;
use crate::iface::{Iface, IfaceRegistry};
use crate::link::LinkChannel;
use crate::routes::RouteTable;
use crate::rule::{Rule, RuleMode, first_match};
use crate::session::{Session, SessionState};
use crate::timer::{TimerKey, TimerWheel};

/// Borrowed runtime context handed into the packet handlers.
///
/// The daemon owns all of these; they are threaded through explicitly so the
/// only process-wide state is the OS fd table.
pub struct Engine<'a> {
    pub link: &'a mut dyn LinkChannel,
    pub registry: &'a mut IfaceRegistry,
    pub routes: Option<&'a RouteTable>,
    pub timers: &'a mut TimerWheel,
    pub timing: &'a Timing,
    pub now: Instant,
}

/// One configured upstream interface with its rules and sessions.
pub struct Proxy {
    /// Position in the daemon's proxy list; used as the timer key.
    pub index: usize,
    pub upstream: Rc<Iface>,
    pub router: bool,
    pub promiscuous: bool,
    pub rules: Vec<Rule>,
    pub sessions: HashMap<Ipv6Addr, Session>,
}

impl Proxy {
    pub fn new(
        index: usize,
        upstream: Rc<Iface>,
        router: bool,
        promiscuous: bool,
        rules: Vec<Rule>,
    ) -> Self {
        Self {
            index,
            upstream,
            router,
            promiscuous,
            rules,
            sessions: HashMap::new(),
        }
    }

    /// Startup preparation: when any rule needs solicited-node multicast
    /// traffic that is not ours, ask the kernel to deliver it.
    pub fn prepare(&self, link: &mut dyn LinkChannel) -> io::Result<()> {
        let dynamic = self
            .rules
            .iter()
            .any(|rule| !matches!(rule.mode, RuleMode::Static));
        if !dynamic {
            return Ok(());
        }
        if self.promiscuous {
            self.upstream.set_promisc(link, true)
        } else {
            self.upstream.set_allmulti(link, true)
        }
    }

    /// An NS arrived on the upstream interface asking for `target`.
    pub fn handle_ns(
        &mut self,
        eng: &mut Engine<'_>,
        src: Ipv6Addr,
        dst: Ipv6Addr,
        target: Ipv6Addr,
        src_ll: Option<[u8; 6]>,
    ) {
        if let Some(session) = self.sessions.get_mut(&target) {
            session.refresh_solicit(src, dst, src_ll);
            if session.state == SessionState::Valid {
                session.send_advert(eng.link, &self.upstream, self.router);
            }
            return;
        }

        let Some(rule) = first_match(&self.rules, &target) else {
            return;
        };
        let mode = rule.mode.clone();
        debug!(
            iface = %self.upstream.name,
            target = %target,
            rule = %rule.prefix,
            mode = mode.as_str(),
            "solicit matched"
        );

        let mut session = Session::new(target, src, dst, src_ll, eng.now);
        match mode {
            RuleMode::Static => {
                session.become_valid(eng.timing, eng.now);
                session.send_advert(eng.link, &self.upstream, self.router);
            }
            RuleMode::Iface(downstream) => {
                session.start_checking(eng.link, downstream, eng.timing, eng.now);
            }
            RuleMode::Auto { autovia } => {
                self.start_auto(eng, &mut session, autovia);
            }
        }

        eng.timers.schedule(
            session.deadline,
            TimerKey {
                proxy: self.index,
                target,
            },
        );
        self.sessions.insert(target, session);
    }

    /// Entry action for `auto` rules: find a downstream via the kernel
    /// routing table. Anything that does not yield a usable interface other
    /// than the upstream parks the session in INVALID.
    fn start_auto(&self, eng: &mut Engine<'_>, session: &mut Session, autovia: bool) {
        let route = eng
            .routes
            .and_then(|table| table.resolve(&session.target, autovia));

        match route {
            Some(route) if route.ifindex != self.upstream.index => {
                match eng
                    .registry
                    .open(&mut *eng.link, Some(&route.dev), Some(route.ifindex))
                {
                    Ok(downstream) => {
                        session.start_checking(eng.link, downstream, eng.timing, eng.now);
                    }
                    Err(e) => {
                        debug!(target = %session.target, error = %e, "downstream open failed");
                        session.become_invalid(eng.timing, eng.now);
                    }
                }
            }
            Some(_) => {
                debug!(target = %session.target, "route points back at upstream");
                session.become_invalid(eng.timing, eng.now);
            }
            None => {
                debug!(target = %session.target, "no route to target");
                session.become_invalid(eng.timing, eng.now);
            }
        }
    }

    /// An NA for `target` arrived on interface `ifindex`. Returns true when
    /// a probing session on that interface consumed it.
    pub fn handle_na_on(
        &mut self,
        link: &mut dyn LinkChannel,
        timing: &Timing,
        timers: &mut TimerWheel,
        now: Instant,
        ifindex: u32,
        target: Ipv6Addr,
    ) -> bool {
        let Some(session) = self.sessions.get_mut(&target) else {
            return false;
        };
        let Some(downstream) = &session.downstream else {
            return false;
        };
        if downstream.index != ifindex {
            return false;
        }
        if !session.handle_na(timing, now) {
            return false;
        }

        session.send_advert(link, &self.upstream, self.router);
        timers.schedule(
            session.deadline,
            TimerKey {
                proxy: self.index,
                target,
            },
        );
        true
    }

    /// A timer armed for `target` at `deadline` fired.
    pub fn handle_timer(
        &mut self,
        link: &mut dyn LinkChannel,
        timing: &Timing,
        timers: &mut TimerWheel,
        now: Instant,
        target: Ipv6Addr,
        deadline: Instant,
    ) {
        let Some(session) = self.sessions.get_mut(&target) else {
            return;
        };
        if session.deadline != deadline {
            // Superseded by a later reschedule.
            return;
        }

        if session.handle_timer(link, timing, now) {
            timers.schedule(
                session.deadline,
                TimerKey {
                    proxy: self.index,
                    target,
                },
            );
        } else {
            debug!(iface = %self.upstream.name, target = %target, "session destroyed");
            self.sessions.remove(&target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::MemoryLink;
    use std::time::Duration;

    const MAC_UP: [u8; 6] = [0x52, 0x54, 0x00, 0x00, 0x00, 0x01];

    fn timing() -> Timing {
        Timing {
            invalid_ttl: Duration::from_millis(10_000),
            valid_ttl: Duration::from_millis(30_000),
            renew: Duration::from_millis(5_000),
            retrans_limit: 3,
            retrans_time: Duration::from_millis(1_000),
            keepalive: false,
        }
    }

    fn setup() -> (MemoryLink, IfaceRegistry, Rc<Iface>) {
        let mut link = MemoryLink::new();
        link.add_iface("eth0", 2, MAC_UP);
        let mut registry = IfaceRegistry::new(false);
        let upstream = registry.open(&mut link, Some("eth0"), None).unwrap();
        (link, registry, upstream)
    }

    #[test]
    fn test_static_rules_do_not_touch_flags() {
        let (mut link, _registry, upstream) = setup();
        let proxy = Proxy::new(
            0,
            upstream,
            false,
            false,
            vec![Rule {
                prefix: "2001:db8::/64".parse().unwrap(),
                mode: RuleMode::Static,
            }],
        );
        proxy.prepare(&mut link).unwrap();
        assert!(!link.flags("eth0").unwrap().allmulti);
        assert!(!link.flags("eth0").unwrap().promisc);
    }

    #[test]
    fn test_dynamic_rules_enable_allmulti() {
        let (mut link, _registry, upstream) = setup();
        let proxy = Proxy::new(
            0,
            upstream,
            false,
            false,
            vec![Rule {
                prefix: "2001:db8::/64".parse().unwrap(),
                mode: RuleMode::Auto { autovia: false },
            }],
        );
        proxy.prepare(&mut link).unwrap();
        assert!(link.flags("eth0").unwrap().allmulti);
        assert!(!link.flags("eth0").unwrap().promisc);
    }

    #[test]
    fn test_promiscuous_overrides_allmulti() {
        let (mut link, _registry, upstream) = setup();
        let proxy = Proxy::new(
            0,
            upstream,
            false,
            true,
            vec![Rule {
                prefix: "2001:db8::/64".parse().unwrap(),
                mode: RuleMode::Auto { autovia: false },
            }],
        );
        proxy.prepare(&mut link).unwrap();
        assert!(link.flags("eth0").unwrap().promisc);
        assert!(!link.flags("eth0").unwrap().allmulti);
    }

    #[test]
    fn test_unmatched_target_is_ignored() {
        let (mut link, mut registry, upstream) = setup();
        let mut timers = TimerWheel::new();
        let timing = timing();
        let now = Instant::now();

        let mut proxy = Proxy::new(0, upstream, false, false, vec![]);
        let mut eng = Engine {
            link: &mut link,
            registry: &mut registry,
            routes: None,
            timers: &mut timers,
            timing: &timing,
            now,
        };
        proxy.handle_ns(
            &mut eng,
            "2001:db8::2".parse().unwrap(),
            "ff02::1:ff00:1".parse().unwrap(),
            "2001:db8::1".parse().unwrap(),
            Some([1, 2, 3, 4, 5, 6]),
        );
        assert!(proxy.sessions.is_empty());
        assert!(timers.is_empty());
        assert!(link.take_tx().is_empty());
    }

    #[test]
    fn test_auto_without_route_goes_invalid() {
        let (mut link, mut registry, upstream) = setup();
        let mut timers = TimerWheel::new();
        let timing = timing();
        let now = Instant::now();

        let mut proxy = Proxy::new(
            0,
            upstream,
            false,
            false,
            vec![Rule {
                prefix: "2001:db8::/64".parse().unwrap(),
                mode: RuleMode::Auto { autovia: false },
            }],
        );
        let mut eng = Engine {
            link: &mut link,
            registry: &mut registry,
            routes: None,
            timers: &mut timers,
            timing: &timing,
            now,
        };
        let target: Ipv6Addr = "2001:db8::1".parse().unwrap();
        proxy.handle_ns(
            &mut eng,
            "2001:db8::2".parse().unwrap(),
            "ff02::1:ff00:1".parse().unwrap(),
            target,
            Some([1, 2, 3, 4, 5, 6]),
        );
        assert_eq!(proxy.sessions[&target].state, SessionState::Invalid);
        assert!(link.take_tx().is_empty());
    }
}
