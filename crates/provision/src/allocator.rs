//! Tunnel address allocation
//!
//! There is no persisted free list: every allocation recomputes the in-use set
//! from all stored client records (any protocol, enabled or not) plus the hub's
//! reserved address. Callers must serialize allocate-then-persist.

use ipnetwork::Ipv4Network;
use sitelink_common::{Error, Result, VpnClient};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

/// Derives the next free host address of a subnet
#[derive(Debug, Clone, Copy)]
pub struct AddressAllocator {
    subnet: Ipv4Network,
    exclude_first_host: bool,
}

impl AddressAllocator {
    pub fn new(subnet: Ipv4Network) -> Self {
        Self {
            subnet,
            exclude_first_host: true,
        }
    }

    /// Allow handing out the first usable host as well.
    pub fn with_first_host(mut self) -> Self {
        self.exclude_first_host = false;
        self
    }

    pub fn subnet(&self) -> Ipv4Network {
        self.subnet
    }

    /// The hub's own address: first usable host of the subnet.
    pub fn server_address(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.subnet.network()).wrapping_add(1))
    }

    /// Lowest usable host not held by any of `clients`.
    pub fn next_available_address(&self, clients: &[VpnClient]) -> Result<Ipv4Addr> {
        self.next_excluding(clients.iter().map(|c| c.tunnel_address))
    }

    /// Lowest usable host not in `in_use`.
    pub fn next_excluding(&self, in_use: impl IntoIterator<Item = Ipv4Addr>) -> Result<Ipv4Addr> {
        let mut used: BTreeSet<u32> = in_use.into_iter().map(u32::from).collect();
        if self.exclude_first_host {
            used.insert(u32::from(self.server_address()));
        }

        // /31 and /32 have no network/broadcast split worth allocating from
        if self.subnet.prefix() >= 31 {
            return Err(self.exhausted());
        }

        let first = u32::from(self.subnet.network()) + 1;
        let last = u32::from(self.subnet.broadcast()) - 1;
        (first..=last)
            .find(|candidate| !used.contains(candidate))
            .map(Ipv4Addr::from)
            .ok_or_else(|| self.exhausted())
    }

    /// Whether `addr` is a usable host of the subnet other than the hub's.
    pub fn is_assignable(&self, addr: Ipv4Addr) -> bool {
        if self.subnet.prefix() >= 31 || !self.subnet.contains(addr) {
            return false;
        }
        let raw = u32::from(addr);
        raw != u32::from(self.subnet.network())
            && raw != u32::from(self.subnet.broadcast())
            && !(self.exclude_first_host && addr == self.server_address())
    }

    fn exhausted(&self) -> Error {
        Error::AddressExhausted {
            subnet: self.subnet.to_string(),
        }
    }
}
