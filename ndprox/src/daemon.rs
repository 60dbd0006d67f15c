//! Daemon runtime: startup, the poll loop, and cleanup
//!
//! Single-threaded and cooperative. One poll cycle drains the shared link
//! socket, dispatches each frame (NS to the proxy bound to the arrival
//! interface, NA to the session probing on it), then fires every timer whose
//! deadline has passed.

use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{Config, RuleModeSpec};
use crate::iface::{IfaceError, IfaceRegistry};
use crate::link::{LinkChannel, RecvOutcome};
use crate::packet::{self, MAX_FRAME, NdpEvent};
use crate::proxy::{Engine, Proxy};
use crate::routes::RouteTable;
use crate::rule::{Rule, RuleKinds, RuleMode};
use crate::timer::TimerWheel;

/// Frames handled per poll cycle before yielding back to the timers.
const BATCH_LIMIT: usize = 64;

/// Fatal startup failures.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Iface(#[from] IfaceError),

    #[error("failed to prepare interface flags: {0}")]
    Flags(#[source] std::io::Error),
}

/// The proxy daemon: owns the link channel, interface registry, proxies,
/// and the timer wheel.
pub struct Daemon {
    cfg: Config,
    link: Box<dyn LinkChannel>,
    registry: IfaceRegistry,
    proxies: Vec<Proxy>,
    timers: TimerWheel,
    routes: Option<RouteTable>,
    kinds: RuleKinds,
}

impl Daemon {
    pub fn new(cfg: Config, link: Box<dyn LinkChannel>, no_restore: bool) -> Self {
        Self {
            cfg,
            link,
            registry: IfaceRegistry::new(no_restore),
            proxies: Vec::new(),
            timers: TimerWheel::new(),
            routes: None,
            kinds: RuleKinds::default(),
        }
    }

    /// Open every configured interface, build the proxies, prepare link
    /// flags, and snapshot the kernel routing table when auto rules exist.
    pub fn startup(&mut self) -> Result<(), StartupError> {
        let mut kinds = RuleKinds::default();

        for (index, spec) in self.cfg.proxies.iter().enumerate() {
            let upstream = self
                .registry
                .open(&mut *self.link, Some(&spec.iface), None)?;

            let mut rules = Vec::with_capacity(spec.rules.len());
            for rule in &spec.rules {
                let mode = match &rule.mode {
                    RuleModeSpec::Static => RuleMode::Static,
                    RuleModeSpec::Auto { autovia } => RuleMode::Auto { autovia: *autovia },
                    RuleModeSpec::Iface(name) => RuleMode::Iface(
                        self.registry.open(&mut *self.link, Some(name), None)?,
                    ),
                };
                kinds.record(&mode);
                rules.push(Rule {
                    prefix: rule.prefix,
                    mode,
                });
            }

            let proxy = Proxy::new(index, upstream, spec.router, spec.promiscuous, rules);
            proxy.prepare(&mut *self.link).map_err(StartupError::Flags)?;
            self.proxies.push(proxy);
        }

        if kinds.any_auto {
            match RouteTable::load(&*self.link) {
                Ok(routes) => self.routes = Some(routes),
                Err(e) => {
                    // Auto rules degrade to INVALID sessions until a snapshot
                    // is available.
                    warn!(error = %e, "failed to read kernel routing table");
                }
            }
        }
        self.kinds = kinds;

        info!(proxies = self.proxies.len(), "startup complete");
        Ok(())
    }

    /// Replace the kernel route snapshot consulted by auto rules.
    pub fn set_routes(&mut self, routes: RouteTable) {
        self.routes = Some(routes);
    }

    /// Run one poll cycle: wait up to `max_wait` (bounded by the next timer
    /// deadline) for I/O, drain frames, then fire due timers.
    pub fn poll_once(&mut self, max_wait: Duration) -> std::io::Result<()> {
        let now = Instant::now();
        let timeout = self
            .timers
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now).min(max_wait))
            .unwrap_or(max_wait);

        if let Some(fd) = self.link.poll_fd() {
            let fd = unsafe { BorrowedFd::borrow_raw(fd) };
            let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
            let ms = timeout.as_millis().min(u16::MAX as u128) as u16;
            match poll(&mut fds, PollTimeout::from(ms)) {
                Ok(_) | Err(Errno::EINTR) => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.drain_frames();
        self.process_timers(Instant::now());
        Ok(())
    }

    /// Loop until the shutdown flag is raised.
    pub fn run(&mut self, shutdown: &AtomicBool) -> std::io::Result<()> {
        while !shutdown.load(Ordering::SeqCst) {
            self.poll_once(Duration::from_millis(500))?;
        }
        Ok(())
    }

    /// Drop all sessions and restore interface flags.
    pub fn cleanup(&mut self) {
        // Proxies and sessions hold interface handles; release them before
        // the registry restores flags.
        self.proxies.clear();
        self.timers = TimerWheel::new();
        self.registry.cleanup(&mut *self.link);
        info!("cleanup complete");
    }

    fn drain_frames(&mut self) {
        let mut buf = [0u8; MAX_FRAME];
        for _ in 0..BATCH_LIMIT {
            match self.link.try_recv(&mut buf) {
                Ok(RecvOutcome::Frame { ifindex, len }) => {
                    let frame = buf[..len].to_vec();
                    self.handle_frame(ifindex, &frame, Instant::now());
                }
                Ok(RecvOutcome::Empty) => break,
                Err(e) => {
                    debug!(error = %e, "link receive failed");
                    break;
                }
            }
        }
    }

    /// Dispatch one validated frame. Malformed frames are dropped silently.
    pub fn handle_frame(&mut self, ifindex: u32, frame: &[u8], now: Instant) {
        let Some(event) = packet::parse(frame) else {
            return;
        };

        match event {
            NdpEvent::Solicit {
                src,
                dst,
                target,
                src_ll,
            } => {
                let Daemon {
                    cfg,
                    link,
                    registry,
                    proxies,
                    timers,
                    routes,
                    ..
                } = self;
                let Some(proxy) = proxies
                    .iter_mut()
                    .find(|proxy| proxy.upstream.index == ifindex)
                else {
                    return;
                };
                let mut eng = Engine {
                    link: &mut **link,
                    registry,
                    routes: routes.as_ref(),
                    timers,
                    timing: &cfg.timing,
                    now,
                };
                proxy.handle_ns(&mut eng, src, dst, target, src_ll);
            }
            NdpEvent::Advert { target } => {
                for proxy in &mut self.proxies {
                    if proxy.handle_na_on(
                        &mut *self.link,
                        &self.cfg.timing,
                        &mut self.timers,
                        now,
                        ifindex,
                        target,
                    ) {
                        break;
                    }
                }
            }
        }
    }

    /// Fire every timer due at or before `now`.
    pub fn process_timers(&mut self, now: Instant) {
        while let Some((deadline, key)) = self.timers.pop_due(now) {
            let Some(proxy) = self.proxies.get_mut(key.proxy) else {
                continue;
            };
            proxy.handle_timer(
                &mut *self.link,
                &self.cfg.timing,
                &mut self.timers,
                now,
                key.target,
                deadline,
            );
        }
    }

    /// Configured proxies, in configuration order.
    pub fn proxies(&self) -> &[Proxy] {
        &self.proxies
    }

    /// The interface registry.
    pub fn registry(&self) -> &IfaceRegistry {
        &self.registry
    }

    /// Union of rule modes across all proxies.
    pub fn rule_kinds(&self) -> RuleKinds {
        self.kinds
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        if !self.proxies.is_empty() {
            warn!("daemon dropped without cleanup");
        }
    }
}
