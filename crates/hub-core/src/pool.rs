// # Address Allocator
//
// The overlay subnet is derived from a single configured subnet key `k`:
//
// ```text
// 100.k.192.0/18   overlay (everything the hub filters)
// ├── 100.k.208.0/20   user devices
// └── 100.k.224.0/19   servers
// ```
//
// Each pool is cut into /30 blocks. Offset 2 of a block is handed to the
// identity, offset 1 is the point-to-point peer the VPN server uses.
// Allocation is first-fit over that block order, so it only depends on
// the set of addresses already in use.

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::model::IdentityKind;

const BLOCK_PREFIX: u8 = 30;
const USABLE_OFFSET: u32 = 2;

/// Validated second octet of the overlay subnet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct SubnetKey(u8);

impl SubnetKey {
    /// Accepts 1..=255; anything else is a configuration error
    pub fn new(key: u16) -> Result<Self> {
        match u8::try_from(key) {
            Ok(k) if k > 0 => Ok(Self(k)),
            _ => Err(Error::config(format!(
                "subnet key must be between 1 and 255, got {}",
                key
            ))),
        }
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    /// The whole overlay: both pools plus headroom
    pub fn overlay_subnet(&self) -> Ipv4Net {
        net(Ipv4Addr::new(100, self.0, 192, 0), 18)
    }
}

impl TryFrom<u16> for SubnetKey {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        Self::new(value)
    }
}

impl From<SubnetKey> for u16 {
    fn from(key: SubnetKey) -> Self {
        key.0 as u16
    }
}

/// One of the two address pools
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubnetPool {
    kind: IdentityKind,
    network: Ipv4Net,
}

impl SubnetPool {
    pub fn new(key: SubnetKey, kind: IdentityKind) -> Self {
        let network = match kind {
            IdentityKind::Server => net(Ipv4Addr::new(100, key.0, 224, 0), 19),
            IdentityKind::UserDevice => net(Ipv4Addr::new(100, key.0, 208, 0), 20),
        };
        Self { kind, network }
    }

    pub fn kind(&self) -> IdentityKind {
        self.kind
    }

    pub fn network(&self) -> Ipv4Net {
        self.network
    }

    /// Assignable addresses in allocation order
    pub fn addresses(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        let base = u32::from(self.network.network());
        (0..self.capacity() as u32).map(move |block| Ipv4Addr::from(base + block * 4 + USABLE_OFFSET))
    }

    /// Number of assignable addresses
    pub fn capacity(&self) -> usize {
        1usize << (BLOCK_PREFIX - self.network.prefix_len())
    }

    /// Whether `addr` is an assignable address of this pool
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.network.contains(&addr) && u32::from(addr) % 4 == USABLE_OFFSET
    }

    /// First-fit allocation
    ///
    /// # Parameters
    ///
    /// - `used`: addresses already held by identities of this pool
    ///
    /// # Returns
    ///
    /// - `Ok(Ipv4Addr)`: lowest free address in block order
    /// - `Err(Error::ResourceExhausted)`: every block is taken
    pub fn allocate(&self, used: &BTreeSet<Ipv4Addr>) -> Result<Ipv4Addr> {
        self.addresses()
            .find(|addr| !used.contains(addr))
            .ok_or_else(|| {
                Error::exhausted(format!(
                    "{} pool {} has no free address ({} assigned)",
                    self.kind,
                    self.network,
                    used.len()
                ))
            })
    }
}

/// Point-to-point peer of an assigned address
pub fn peer_address(addr: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(addr).wrapping_sub(1))
}

fn net(addr: Ipv4Addr, prefix: u8) -> Ipv4Net {
    // prefix is a constant no greater than 32
    Ipv4Net::new(addr, prefix).unwrap_or_else(|_| Ipv4Net::from(addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SubnetKey {
        SubnetKey::new(111).unwrap()
    }

    #[test]
    fn test_first_allocations_are_block_offset_two() {
        let pool = SubnetPool::new(key(), IdentityKind::Server);
        assert_eq!(pool.network().to_string(), "100.111.224.0/19");

        let mut used = BTreeSet::new();
        let first = pool.allocate(&used).unwrap();
        assert_eq!(first, Ipv4Addr::new(100, 111, 224, 2));

        used.insert(first);
        let second = pool.allocate(&used).unwrap();
        assert_eq!(second, Ipv4Addr::new(100, 111, 224, 6));
    }

    #[test]
    fn test_allocation_is_deterministic() {
        let pool = SubnetPool::new(key(), IdentityKind::UserDevice);
        let used: BTreeSet<_> = pool.addresses().step_by(2).take(50).collect();
        let a = pool.allocate(&used).unwrap();
        let b = pool.allocate(&used).unwrap();
        assert_eq!(a, b);
        assert!(!used.contains(&a));
        assert_eq!(a, Ipv4Addr::new(100, 111, 208, 6));
    }

    #[test]
    fn test_first_fit_reuses_released_slot() {
        let pool = SubnetPool::new(key(), IdentityKind::Server);
        let mut used: BTreeSet<_> = pool.addresses().take(4).collect();
        used.remove(&Ipv4Addr::new(100, 111, 224, 6));
        assert_eq!(pool.allocate(&used).unwrap(), Ipv4Addr::new(100, 111, 224, 6));
    }

    #[test]
    fn test_exhaustion() {
        let pool = SubnetPool::new(key(), IdentityKind::UserDevice);
        assert_eq!(pool.capacity(), 1024);
        let used: BTreeSet<_> = pool.addresses().collect();
        assert!(matches!(pool.allocate(&used), Err(Error::ResourceExhausted(_))));
    }

    #[test]
    fn test_pools_are_disjoint_and_inside_overlay() {
        let servers = SubnetPool::new(key(), IdentityKind::Server);
        let devices = SubnetPool::new(key(), IdentityKind::UserDevice);
        let overlay = key().overlay_subnet();
        assert!(overlay.contains(&servers.network()));
        assert!(overlay.contains(&devices.network()));
        assert!(devices.addresses().all(|a| !servers.contains(a)));
        assert_eq!(servers.addresses().last(), Some(Ipv4Addr::new(100, 111, 255, 254)));
    }

    #[test]
    fn test_peer_address() {
        assert_eq!(
            peer_address(Ipv4Addr::new(100, 111, 224, 2)),
            Ipv4Addr::new(100, 111, 224, 1)
        );
    }

    #[test]
    fn test_subnet_key_bounds() {
        assert!(matches!(SubnetKey::new(0), Err(Error::Config(_))));
        assert!(matches!(SubnetKey::new(256), Err(Error::Config(_))));
        assert_eq!(SubnetKey::new(255).unwrap().value(), 255);
    }
}
