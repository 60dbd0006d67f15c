//! Interface registry
//!
//! Interfaces are shared between proxies and sessions through `Rc` handles,
//! deduplicated by kernel index. The registry caches the link-layer address,
//! records PROMISC/ALLMULTI state the first time either flag is touched, and
//! restores both at cleanup unless the no-restore override is set. Closed
//! entries are retained and revived on re-open so the saved-flag slots stay
//! idempotent across reconfiguration.

use std::cell::Cell;
use std::collections::HashMap;
use std::io;
use std::rc::Rc;

use smoltcp::wire::EthernetAddress;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::link::{LinkChannel, LinkFlags};

/// Interface lookup/open errors. All of these are fatal at startup.
#[derive(Debug, Error)]
pub enum IfaceError {
    #[error("interface name or index required")]
    Unspecified,

    #[error("expected interface {name} to have index {expected}, found {actual}")]
    IndexMismatch {
        name: String,
        expected: u32,
        actual: u32,
    },

    #[error("failed to resolve interface {name}: {source}")]
    Resolve { name: String, source: io::Error },

    #[error("failed to determine link-layer address of {name}: {source}")]
    Lladdr { name: String, source: io::Error },
}

/// One kernel interface, shared by reference counting.
#[derive(Debug)]
pub struct Iface {
    pub index: u32,
    pub name: String,
    pub lladdr: [u8; 6],
    old_promisc: Cell<Option<bool>>,
    old_allmulti: Cell<Option<bool>>,
}

impl Iface {
    /// Enable or disable promiscuous mode, remembering the pre-daemon state
    /// the first time it is touched.
    pub fn set_promisc(&self, link: &mut dyn LinkChannel, on: bool) -> io::Result<()> {
        let cur = link.flags(&self.name)?;
        if self.old_promisc.get().is_none() {
            self.old_promisc.set(Some(cur.promisc));
        }
        if cur.promisc == on {
            return Ok(());
        }
        debug!(iface = %self.name, on, "promiscuous mode");
        link.set_flags(&self.name, LinkFlags { promisc: on, ..cur })
    }

    /// Enable or disable all-multicast mode, remembering the pre-daemon state
    /// the first time it is touched.
    pub fn set_allmulti(&self, link: &mut dyn LinkChannel, on: bool) -> io::Result<()> {
        let cur = link.flags(&self.name)?;
        if self.old_allmulti.get().is_none() {
            self.old_allmulti.set(Some(cur.allmulti));
        }
        if cur.allmulti == on {
            return Ok(());
        }
        debug!(iface = %self.name, on, "all multicast mode");
        link.set_flags(&self.name, LinkFlags { allmulti: on, ..cur })
    }

    /// Put any flags the daemon changed back the way they were.
    fn restore(&self, link: &mut dyn LinkChannel) {
        let restore_one = |link: &mut dyn LinkChannel, saved: Option<bool>, promisc: bool| {
            let Some(old) = saved else { return };
            let cur = match link.flags(&self.name) {
                Ok(cur) => cur,
                Err(e) => {
                    warn!(iface = %self.name, error = %e, "failed to read flags for restore");
                    return;
                }
            };
            let wanted = if promisc {
                LinkFlags { promisc: old, ..cur }
            } else {
                LinkFlags { allmulti: old, ..cur }
            };
            if wanted != cur
                && let Err(e) = link.set_flags(&self.name, wanted)
            {
                warn!(iface = %self.name, error = %e, "failed to restore flags");
            }
        };

        restore_one(&mut *link, self.old_promisc.take(), true);
        restore_one(&mut *link, self.old_allmulti.take(), false);
    }
}

/// Registry of open interfaces, keyed by kernel index.
pub struct IfaceRegistry {
    entries: HashMap<u32, Rc<Iface>>,
    no_restore: bool,
}

impl IfaceRegistry {
    pub fn new(no_restore: bool) -> Self {
        Self {
            entries: HashMap::new(),
            no_restore,
        }
    }

    /// Open an interface by name, index, or both (both must agree).
    ///
    /// Re-opening an interface that is already known returns the shared
    /// handle.
    pub fn open(
        &mut self,
        link: &mut dyn LinkChannel,
        name: Option<&str>,
        index: Option<u32>,
    ) -> Result<Rc<Iface>, IfaceError> {
        let (name, index) = match (name, index) {
            (None, None) => return Err(IfaceError::Unspecified),
            (Some(name), Some(index)) => {
                let actual = link.ifindex(name).map_err(|source| IfaceError::Resolve {
                    name: name.to_string(),
                    source,
                })?;
                if actual != index {
                    return Err(IfaceError::IndexMismatch {
                        name: name.to_string(),
                        expected: index,
                        actual,
                    });
                }
                (name.to_string(), index)
            }
            (Some(name), None) => {
                let index = link.ifindex(name).map_err(|source| IfaceError::Resolve {
                    name: name.to_string(),
                    source,
                })?;
                (name.to_string(), index)
            }
            (None, Some(index)) => {
                let name = link
                    .ifname(index)
                    .map_err(|source| IfaceError::Resolve {
                        name: format!("#{index}"),
                        source,
                    })?;
                (name, index)
            }
        };

        if let Some(iface) = self.entries.get(&index) {
            return Ok(iface.clone());
        }

        let lladdr = link.lladdr(&name).map_err(|source| IfaceError::Lladdr {
            name: name.clone(),
            source,
        })?;

        let iface = Rc::new(Iface {
            index,
            name,
            lladdr,
            old_promisc: Cell::new(None),
            old_allmulti: Cell::new(None),
        });

        info!(
            iface = %iface.name,
            index,
            mac = %EthernetAddress::from_bytes(&iface.lladdr),
            "new interface"
        );

        self.entries.insert(index, iface.clone());
        Ok(iface)
    }

    /// Shared handle for an already-open interface.
    pub fn get(&self, index: u32) -> Option<Rc<Iface>> {
        self.entries.get(&index).cloned()
    }

    /// Number of holders of an interface outside the registry itself.
    pub fn holders(&self, index: u32) -> usize {
        self.entries
            .get(&index)
            .map(|iface| Rc::strong_count(iface) - 1)
            .unwrap_or(0)
    }

    /// Restore saved flags (unless overridden) and forget all entries.
    pub fn cleanup(&mut self, link: &mut dyn LinkChannel) {
        for (_, iface) in self.entries.drain() {
            if !self.no_restore {
                iface.restore(link);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::MemoryLink;

    const MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];

    fn link_with_eth0() -> MemoryLink {
        let mut link = MemoryLink::new();
        link.add_iface("eth0", 2, MAC);
        link
    }

    #[test]
    fn test_open_by_name_resolves_index() {
        let mut link = link_with_eth0();
        let mut reg = IfaceRegistry::new(false);
        let iface = reg.open(&mut link, Some("eth0"), None).unwrap();
        assert_eq!(iface.index, 2);
        assert_eq!(iface.name, "eth0");
        assert_eq!(iface.lladdr, MAC);
    }

    #[test]
    fn test_open_by_index_resolves_name() {
        let mut link = link_with_eth0();
        let mut reg = IfaceRegistry::new(false);
        let iface = reg.open(&mut link, None, Some(2)).unwrap();
        assert_eq!(iface.name, "eth0");
    }

    #[test]
    fn test_open_rejects_inconsistent_name_index() {
        let mut link = link_with_eth0();
        let mut reg = IfaceRegistry::new(false);
        let err = reg.open(&mut link, Some("eth0"), Some(7)).unwrap_err();
        assert!(matches!(err, IfaceError::IndexMismatch { actual: 2, .. }));
    }

    #[test]
    fn test_open_is_shared_and_refcounted() {
        let mut link = link_with_eth0();
        let mut reg = IfaceRegistry::new(false);

        let a = reg.open(&mut link, Some("eth0"), None).unwrap();
        let b = reg.open(&mut link, Some("eth0"), None).unwrap();
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(reg.holders(2), 2);

        drop(a);
        drop(b);
        // Every open/close pair balances out.
        assert_eq!(reg.holders(2), 0);
    }

    #[test]
    fn test_missing_interface_fails() {
        let mut link = link_with_eth0();
        let mut reg = IfaceRegistry::new(false);
        assert!(matches!(
            reg.open(&mut link, Some("eth9"), None),
            Err(IfaceError::Resolve { .. })
        ));
    }

    #[test]
    fn test_flags_saved_once_and_restored() {
        let mut link = link_with_eth0();
        link.set_iface_flags(
            "eth0",
            LinkFlags {
                promisc: false,
                allmulti: true,
            },
        );

        let mut reg = IfaceRegistry::new(false);
        let iface = reg.open(&mut link, Some("eth0"), None).unwrap();

        iface.set_allmulti(&mut link, true).unwrap();
        iface.set_promisc(&mut link, true).unwrap();
        iface.set_promisc(&mut link, false).unwrap();
        iface.set_promisc(&mut link, true).unwrap();
        assert_eq!(
            link.flags("eth0").unwrap(),
            LinkFlags {
                promisc: true,
                allmulti: true,
            }
        );

        drop(iface);
        reg.cleanup(&mut link);
        // Back to the pre-daemon state: allmulti was already on.
        assert_eq!(
            link.flags("eth0").unwrap(),
            LinkFlags {
                promisc: false,
                allmulti: true,
            }
        );
    }

    #[test]
    fn test_no_restore_override_leaves_flags() {
        let mut link = link_with_eth0();
        let mut reg = IfaceRegistry::new(true);
        let iface = reg.open(&mut link, Some("eth0"), None).unwrap();

        iface.set_promisc(&mut link, true).unwrap();
        drop(iface);
        reg.cleanup(&mut link);
        assert!(link.flags("eth0").unwrap().promisc);
    }

    #[test]
    fn test_reopened_entry_is_reused() {
        let mut link = link_with_eth0();
        let mut reg = IfaceRegistry::new(false);

        let first = reg.open(&mut link, Some("eth0"), None).unwrap();
        first.set_promisc(&mut link, true).unwrap();
        drop(first);

        // The retained entry still holds the saved flag state.
        let second = reg.open(&mut link, Some("eth0"), None).unwrap();
        assert_eq!(second.old_promisc.get(), Some(false));
    }
}
