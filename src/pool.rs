//! Address pool for peer tunnel addresses
//!
//! Hands out single IPv4 hosts from the tunnel subnet. The usable range is
//! the subnet's hosts minus the network and broadcast addresses, the
//! server's own address, and anything below the configured pool start.
//! Only the allocated set is stored; the free set is its complement, so the
//! two can never overlap or leak addresses.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::error::PoolError;

/// Allocator over the usable host range of one subnet
#[derive(Debug, Clone)]
pub struct AddressPool {
    subnet: Ipv4Net,
    server: Ipv4Addr,
    /// First usable address (inclusive)
    first: u32,
    /// Last usable address (inclusive)
    last: u32,
    allocated: BTreeSet<u32>,
}

impl AddressPool {
    /// Build an empty pool
    ///
    /// `pool_start` raises the lower bound of the range; addresses below it
    /// are never handed out.
    pub fn new(subnet: Ipv4Net, server: Ipv4Addr, pool_start: Option<Ipv4Addr>) -> Self {
        let subnet = subnet.trunc();
        let network = u32::from(subnet.network());
        let broadcast = u32::from(subnet.broadcast());

        // /31 and /32 have no network/broadcast reservation
        let (mut first, last) = if subnet.prefix_len() >= 31 {
            (network, broadcast)
        } else {
            (network + 1, broadcast - 1)
        };

        if let Some(start) = pool_start {
            first = first.max(u32::from(start));
        }

        Self {
            subnet,
            server,
            first,
            last,
            allocated: BTreeSet::new(),
        }
    }

    pub fn subnet(&self) -> Ipv4Net {
        self.subnet
    }

    /// Number of addresses peers can ever hold
    pub fn capacity(&self) -> usize {
        if self.first > self.last {
            return 0;
        }
        let span = (self.last - self.first) as usize + 1;
        if self.in_range(u32::from(self.server)) {
            span - 1
        } else {
            span
        }
    }

    pub fn allocated_count(&self) -> usize {
        self.allocated.len()
    }

    pub fn free_count(&self) -> usize {
        self.capacity() - self.allocated.len()
    }

    /// Whether `address` belongs to the usable range
    pub fn contains(&self, address: Ipv4Addr) -> bool {
        let raw = u32::from(address);
        self.in_range(raw) && address != self.server
    }

    pub fn is_allocated(&self, address: Ipv4Addr) -> bool {
        self.allocated.contains(&u32::from(address))
    }

    /// Allocated addresses in ascending order
    pub fn allocated(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.allocated.iter().map(|raw| Ipv4Addr::from(*raw))
    }

    /// Take the lowest free address
    pub fn allocate(&mut self) -> Result<Ipv4Addr, PoolError> {
        let server = u32::from(self.server);
        let mut candidate = self.first;

        // The allocated set is sorted, so walk it alongside the range and
        // stop at the first gap.
        for &taken in self.allocated.range(self.first..) {
            if candidate == server {
                candidate += 1;
            }
            if taken != candidate {
                break;
            }
            candidate += 1;
        }
        if candidate == server {
            candidate = candidate.wrapping_add(1);
        }

        if candidate < self.first || candidate > self.last || self.allocated.contains(&candidate) {
            return Err(PoolError::Exhausted {
                subnet: self.subnet.to_string(),
            });
        }

        self.allocated.insert(candidate);
        Ok(Ipv4Addr::from(candidate))
    }

    /// Mark a specific address as allocated (used when rebuilding from the registry)
    pub fn reserve(&mut self, address: Ipv4Addr) -> Result<(), PoolError> {
        if !self.contains(address) {
            return Err(PoolError::OutOfRange {
                address,
                subnet: self.subnet.to_string(),
            });
        }
        if !self.allocated.insert(u32::from(address)) {
            return Err(PoolError::Conflict { address });
        }
        Ok(())
    }

    /// Return an address to the free set. Unknown addresses are ignored.
    pub fn release(&mut self, address: Ipv4Addr) {
        self.allocated.remove(&u32::from(address));
    }

    fn in_range(&self, raw: u32) -> bool {
        raw >= self.first && raw <= self.last
    }
}
