//! Per-target session state machine
//!
//! One session exists per (proxy, target). It remembers the solicitor that
//! asked for the target, drives the downstream probe with retransmissions,
//! and decides when a Neighbor Advertisement goes back out the upstream
//! interface.
//!
//! States:
//! - WAITING: freshly created, before the rule's entry action runs
//! - CHECKING: probing the target across the downstream interface
//! - VALID: target confirmed; advertisements are answered immediately
//! - RENEWING: re-probing an expiring VALID session (keepalive)
//! - INVALID: probe failed; suppresses repeat probes for a while
//! - EXPIRED: terminal, destroyed on the next scheduler tick

use std::net::Ipv6Addr;
use std::rc::Rc;
use std::time::Instant;

use tracing::{debug, info, trace};

use crate::addr;
use crate::config::Timing;
use crate::iface::Iface;
use crate::link::LinkChannel;
use crate::packet::{self, AdvertSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Waiting,
    Checking,
    Valid,
    Renewing,
    Invalid,
    Expired,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Waiting => "waiting",
            SessionState::Checking => "checking",
            SessionState::Valid => "valid",
            SessionState::Renewing => "renewing",
            SessionState::Invalid => "invalid",
            SessionState::Expired => "expired",
        }
    }
}

/// Validation state for one solicited target.
pub struct Session {
    /// The address being proxied.
    pub target: Ipv6Addr,
    /// IPv6 source of the most recent solicitation (latest wins).
    pub ns_src: Ipv6Addr,
    /// IPv6 destination of the most recent solicitation.
    pub ns_dst: Ipv6Addr,
    /// Solicitor's link-layer address; absent for DAD probes.
    pub src_ll: Option<[u8; 6]>,
    pub state: SessionState,
    /// Interface the target is probed through; set iff the originating rule
    /// provides one.
    pub downstream: Option<Rc<Iface>>,
    /// NS transmissions in the current CHECKING/RENEWING round.
    pub attempts: u32,
    /// When the current state ends; mirrored by a timer wheel entry.
    pub deadline: Instant,
}

impl Session {
    pub fn new(
        target: Ipv6Addr,
        ns_src: Ipv6Addr,
        ns_dst: Ipv6Addr,
        src_ll: Option<[u8; 6]>,
        now: Instant,
    ) -> Self {
        Self {
            target,
            ns_src,
            ns_dst,
            src_ll,
            state: SessionState::Waiting,
            downstream: None,
            attempts: 0,
            deadline: now,
        }
    }

    fn set_state(&mut self, to: SessionState) {
        debug!(
            target = %self.target,
            from = self.state.as_str(),
            to = to.as_str(),
            "session transition"
        );
        self.state = to;
    }

    /// Record the latest solicitor. A repeated NS never duplicates a session.
    pub fn refresh_solicit(&mut self, src: Ipv6Addr, dst: Ipv6Addr, src_ll: Option<[u8; 6]>) {
        self.ns_src = src;
        self.ns_dst = dst;
        self.src_ll = src_ll;
    }

    /// Entry action for `static` rules and promotion on a received NA.
    pub fn become_valid(&mut self, timing: &Timing, now: Instant) {
        self.set_state(SessionState::Valid);
        self.deadline = if timing.keepalive && self.downstream.is_some() {
            now + timing.valid_ttl.saturating_sub(timing.renew)
        } else {
            now + timing.valid_ttl
        };
    }

    /// Entry action when no downstream can be probed.
    pub fn become_invalid(&mut self, timing: &Timing, now: Instant) {
        self.set_state(SessionState::Invalid);
        self.deadline = now + timing.invalid_ttl;
    }

    /// Entry action for `iface`/`auto` rules: first probe plus timer.
    pub fn start_checking(
        &mut self,
        link: &mut dyn LinkChannel,
        downstream: Rc<Iface>,
        timing: &Timing,
        now: Instant,
    ) {
        self.downstream = Some(downstream);
        self.set_state(SessionState::Checking);
        self.attempts = 1;
        self.send_probe(link);
        self.deadline = now + timing.retrans_time;
    }

    /// Promote CHECKING/RENEWING to VALID after a received advertisement.
    /// Returns false when the session is in no state to be promoted.
    pub fn handle_na(&mut self, timing: &Timing, now: Instant) -> bool {
        match self.state {
            SessionState::Checking | SessionState::Renewing => {
                self.become_valid(timing, now);
                true
            }
            _ => false,
        }
    }

    /// Drive the state machine on timer expiry. Returns false when the
    /// session is finished and must be destroyed.
    pub fn handle_timer(&mut self, link: &mut dyn LinkChannel, timing: &Timing, now: Instant) -> bool {
        match self.state {
            SessionState::Checking | SessionState::Renewing => {
                if self.attempts < timing.retrans_limit {
                    self.attempts += 1;
                    self.send_probe(link);
                    self.deadline = now + timing.retrans_time;
                } else if self.state == SessionState::Checking {
                    self.become_invalid(timing, now);
                } else {
                    self.set_state(SessionState::Expired);
                    self.deadline = now;
                }
                true
            }
            SessionState::Valid => {
                if timing.keepalive && self.downstream.is_some() {
                    self.set_state(SessionState::Renewing);
                    self.attempts = 1;
                    self.send_probe(link);
                    self.deadline = now + timing.retrans_time;
                    true
                } else {
                    self.set_state(SessionState::Expired);
                    self.deadline = now;
                    true
                }
            }
            SessionState::Invalid => {
                self.set_state(SessionState::Expired);
                self.deadline = now;
                true
            }
            SessionState::Waiting | SessionState::Expired => false,
        }
    }

    /// Send an NS for the target out the downstream interface.
    pub fn send_probe(&self, link: &mut dyn LinkChannel) {
        let Some(downstream) = &self.downstream else {
            return;
        };
        trace!(iface = %downstream.name, target = %self.target, "write NS");
        let frame = packet::build_solicit(downstream.lladdr, self.target);
        if let Err(e) = link.send(downstream.index, &frame) {
            debug!(iface = %downstream.name, error = %e, "NS send failed");
        }
    }

    /// Send an NA for the target to the stored solicitor out `upstream`.
    ///
    /// DAD probes have no solicitor address to answer; those replies go to
    /// the target's solicited-node group instead.
    pub fn send_advert(&self, link: &mut dyn LinkChannel, upstream: &Iface, router: bool) {
        let (dst, dst_ll) = match self.src_ll {
            Some(ll) if !self.ns_src.is_unspecified() => (self.ns_src, ll),
            _ => {
                let group = addr::solicited_node(&self.target);
                (group, addr::multicast_mac(&group))
            }
        };

        info!(
            target = %self.target,
            dst = %dst,
            iface = %upstream.name,
            "write NA"
        );

        let frame = packet::build_advert(&AdvertSpec {
            target: self.target,
            dst,
            dst_ll,
            iface_mac: upstream.lladdr,
            router,
        });
        if let Err(e) = link.send(upstream.index, &frame) {
            debug!(iface = %upstream.name, error = %e, "NA send failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::MemoryLink;
    use std::time::Duration;

    const MAC_DOWN: [u8; 6] = [0x52, 0x54, 0x00, 0x00, 0x00, 0x02];

    fn timing(keepalive: bool) -> Timing {
        Timing {
            invalid_ttl: Duration::from_millis(10_000),
            valid_ttl: Duration::from_millis(30_000),
            renew: Duration::from_millis(5_000),
            retrans_limit: 3,
            retrans_time: Duration::from_millis(1_000),
            keepalive,
        }
    }

    fn downstream(link: &mut MemoryLink) -> Rc<Iface> {
        link.add_iface("eth1", 3, MAC_DOWN);
        let mut reg = crate::iface::IfaceRegistry::new(false);
        reg.open(link, Some("eth1"), None).unwrap()
    }

    fn new_session(now: Instant) -> Session {
        Session::new(
            "2001:db8::1".parse().unwrap(),
            "2001:db8::2".parse().unwrap(),
            "ff02::1:ff00:1".parse().unwrap(),
            Some([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]),
            now,
        )
    }

    #[test]
    fn test_checking_retransmits_then_goes_invalid() {
        let mut link = MemoryLink::new();
        let d = downstream(&mut link);
        let t = timing(false);
        let now = Instant::now();

        let mut s = new_session(now);
        s.start_checking(&mut link, d, &t, now);
        assert_eq!(s.state, SessionState::Checking);
        assert_eq!(link.take_tx().len(), 1);

        // Two more transmissions, then the round is exhausted.
        assert!(s.handle_timer(&mut link, &t, now + t.retrans_time));
        assert!(s.handle_timer(&mut link, &t, now + 2 * t.retrans_time));
        assert_eq!(link.take_tx().len(), 2);
        assert_eq!(s.state, SessionState::Checking);

        assert!(s.handle_timer(&mut link, &t, now + 3 * t.retrans_time));
        assert_eq!(s.state, SessionState::Invalid);
        assert!(link.take_tx().is_empty());

        // INVALID holds for invalid_ttl, then the session is reaped.
        assert_eq!(s.deadline, now + 3 * t.retrans_time + t.invalid_ttl);
        assert!(s.handle_timer(&mut link, &t, s.deadline));
        assert_eq!(s.state, SessionState::Expired);
        assert!(!s.handle_timer(&mut link, &t, s.deadline));
    }

    #[test]
    fn test_na_promotes_checking_to_valid() {
        let mut link = MemoryLink::new();
        let d = downstream(&mut link);
        let t = timing(false);
        let now = Instant::now();

        let mut s = new_session(now);
        s.start_checking(&mut link, d, &t, now);
        assert!(s.handle_na(&t, now));
        assert_eq!(s.state, SessionState::Valid);
        assert_eq!(s.deadline, now + t.valid_ttl);
    }

    #[test]
    fn test_na_does_not_promote_invalid() {
        let t = timing(false);
        let now = Instant::now();
        let mut s = new_session(now);
        s.become_invalid(&t, now);
        assert!(!s.handle_na(&t, now));
        assert_eq!(s.state, SessionState::Invalid);
    }

    #[test]
    fn test_keepalive_renews_and_recovers() {
        let mut link = MemoryLink::new();
        let d = downstream(&mut link);
        let t = timing(true);
        let now = Instant::now();

        let mut s = new_session(now);
        s.start_checking(&mut link, d, &t, now);
        assert!(s.handle_na(&t, now));
        // Renewal starts `renew` before the TTL would run out.
        assert_eq!(s.deadline, now + t.valid_ttl - t.renew);

        assert!(s.handle_timer(&mut link, &t, s.deadline));
        assert_eq!(s.state, SessionState::Renewing);

        let renew_started = s.deadline;
        assert!(s.handle_na(&t, renew_started));
        assert_eq!(s.state, SessionState::Valid);
        assert_eq!(s.deadline, renew_started + t.valid_ttl - t.renew);
    }

    #[test]
    fn test_renewing_timeout_expires_session() {
        let mut link = MemoryLink::new();
        let d = downstream(&mut link);
        let t = timing(true);
        let now = Instant::now();

        let mut s = new_session(now);
        s.start_checking(&mut link, d, &t, now);
        assert!(s.handle_na(&t, now));
        assert!(s.handle_timer(&mut link, &t, s.deadline));
        assert_eq!(s.state, SessionState::Renewing);

        while s.state == SessionState::Renewing {
            assert!(s.handle_timer(&mut link, &t, s.deadline));
        }
        // A failed renewal expires rather than suppressing future probes.
        assert_eq!(s.state, SessionState::Expired);
    }

    #[test]
    fn test_static_session_expires_even_with_keepalive() {
        let mut link = MemoryLink::new();
        let t = timing(true);
        let now = Instant::now();

        let mut s = new_session(now);
        s.become_valid(&t, now);
        // No downstream to probe: full TTL, then gone.
        assert_eq!(s.deadline, now + t.valid_ttl);
        assert!(s.handle_timer(&mut link, &t, s.deadline));
        assert_eq!(s.state, SessionState::Expired);
    }

    #[test]
    fn test_refresh_keeps_latest_solicitor() {
        let now = Instant::now();
        let mut s = new_session(now);
        let other: Ipv6Addr = "2001:db8::99".parse().unwrap();
        s.refresh_solicit(other, s.ns_dst, Some([1, 2, 3, 4, 5, 6]));
        assert_eq!(s.ns_src, other);
        assert_eq!(s.src_ll, Some([1, 2, 3, 4, 5, 6]));
    }
}
