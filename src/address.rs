//! Link-layer and network-layer addressing.
//!
//! Every mote owns an EUI-64 derived deterministically from its id, an IPv6
//! link-local address and (once joined) a global address. Both IPv6 scopes
//! share the same interface identifier as the MAC address, so address
//! conversions are direct.

use std::fmt;

use serde::Serialize;

/// Dense mote identifier. Mote 0 is the DAG root.
pub type MoteId = usize;

/// Interface identifier reserved for the DAG root. The root keeps id 0 but
/// its addresses end in `..-01-00-00` so that they are never confused with
/// the unspecified identifier.
const ROOT_HOST: u64 = 0x1_0000;

/// EUI-64 link-layer address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MacAddr(u64);

impl MacAddr {
    /// All-ones broadcast address.
    pub const BROADCAST: MacAddr = MacAddr(u64::MAX);

    /// Derive the EUI-64 of a mote: `02-00-00-00-00-<host>` with the host
    /// part in the lowest three octets.
    pub fn from_mote_id(id: MoteId) -> Self {
        MacAddr(0x0200_0000_0000_0000 | Self::host_for(id))
    }

    fn host_for(id: MoteId) -> u64 {
        if id == 0 { ROOT_HOST } else { id as u64 }
    }

    /// The interface identifier shared with the mote's IPv6 addresses.
    pub fn host(&self) -> u64 {
        self.0 & 0x0000_ffff_ffff_ffff
    }

    /// Inverse of [`MacAddr::from_mote_id`].
    pub fn mote_id(&self) -> MoteId {
        let host = self.host();
        if host == ROOT_HOST { 0 } else { host as usize }
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0.to_be_bytes();
        for (i, b) in bytes.iter().enumerate() {
            if i > 0 {
                write!(f, "-")?;
            }
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl Serialize for MacAddr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// IPv6 address, reduced to the scopes the stack actually uses.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Ipv6Addr {
    /// `fe80::<host>`
    LinkLocal(u64),
    /// `fd00::<host>`
    Global(u64),
    /// `ff02::1a`, the link-local all-RPL-nodes multicast address.
    AllRplNodes,
}

impl Ipv6Addr {
    pub fn link_local_of(mac: MacAddr) -> Self {
        Ipv6Addr::LinkLocal(mac.host())
    }

    pub fn global_of(mac: MacAddr) -> Self {
        Ipv6Addr::Global(mac.host())
    }

    /// Interface identifier, `None` for multicast.
    pub fn host(&self) -> Option<u64> {
        match self {
            Ipv6Addr::LinkLocal(h) | Ipv6Addr::Global(h) => Some(*h),
            Ipv6Addr::AllRplNodes => None,
        }
    }

    pub fn is_multicast(&self) -> bool {
        matches!(self, Ipv6Addr::AllRplNodes)
    }

    pub fn is_link_local(&self) -> bool {
        matches!(self, Ipv6Addr::LinkLocal(_))
    }

    /// The MAC address of the interface owning this address.
    pub fn mac_addr(&self) -> Option<MacAddr> {
        self.host().map(|h| MacAddr(0x0200_0000_0000_0000 | h))
    }
}

impl fmt::Display for Ipv6Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (prefix, host) = match self {
            Ipv6Addr::LinkLocal(h) => ("fe80", h),
            Ipv6Addr::Global(h) => ("fd00", h),
            Ipv6Addr::AllRplNodes => return write!(f, "ff02::1a"),
        };
        let high = host >> 16;
        let low = host & 0xffff;
        if high != 0 {
            write!(f, "{}::{:x}:{:x}", prefix, high, low)
        } else {
            write!(f, "{}::{:x}", prefix, low)
        }
    }
}

impl fmt::Debug for Ipv6Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl Serialize for Ipv6Addr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_addr_derivation() {
        assert_eq!(MacAddr::from_mote_id(0).to_string(), "02-00-00-00-00-01-00-00");
        assert_eq!(MacAddr::from_mote_id(1).to_string(), "02-00-00-00-00-00-00-01");
        assert_eq!(MacAddr::from_mote_id(0x1234).to_string(), "02-00-00-00-00-00-12-34");
    }

    #[test]
    fn mac_addr_roundtrip() {
        for id in [0usize, 1, 2, 77, 65535] {
            assert_eq!(MacAddr::from_mote_id(id).mote_id(), id);
        }
    }

    #[test]
    fn ipv6_formatting() {
        let root = MacAddr::from_mote_id(0);
        let m1 = MacAddr::from_mote_id(1);
        assert_eq!(Ipv6Addr::link_local_of(root).to_string(), "fe80::1:0");
        assert_eq!(Ipv6Addr::global_of(root).to_string(), "fd00::1:0");
        assert_eq!(Ipv6Addr::link_local_of(m1).to_string(), "fe80::1");
        assert_eq!(Ipv6Addr::AllRplNodes.to_string(), "ff02::1a");
    }

    #[test]
    fn broadcast_is_not_a_mote() {
        assert!(MacAddr::BROADCAST.is_broadcast());
        assert!(!MacAddr::from_mote_id(3).is_broadcast());
    }

    #[test]
    fn ipv6_to_mac() {
        let m = MacAddr::from_mote_id(5);
        assert_eq!(Ipv6Addr::link_local_of(m).mac_addr(), Some(m));
        assert_eq!(Ipv6Addr::AllRplNodes.mac_addr(), None);
    }
}
