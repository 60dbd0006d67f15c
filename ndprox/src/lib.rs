//! Userspace NDP proxy
//!
//! Listens for IPv6 Neighbor Solicitations on upstream interfaces, decides
//! per configured rules whether a solicited target should be answered for,
//! optionally verifies the target across a downstream interface, and replies
//! with Neighbor Advertisements so routed prefixes look on-link.

pub mod addr;
pub mod config;
pub mod daemon;
pub mod iface;
pub mod link;
pub mod packet;
pub mod proxy;
pub mod routes;
pub mod rule;
pub mod session;
pub mod test_util;
pub mod timer;

pub use config::{Config, ConfigError, Timing};
pub use daemon::{Daemon, StartupError};
pub use link::{LinkChannel, LinkFlags, PacketSocket, RecvOutcome};
pub use packet::NdpEvent;
pub use session::SessionState;
