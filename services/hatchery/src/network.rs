//! Static address planning for cloned instances.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard};

use hatchery_networking::{AddressPool, NetworkError, NetworkIdentity};

use crate::provider::ProviderInstance;

/// Hands out free addresses from the configured pool.
///
/// An address is in use when a listed instance reports it or when another
/// in-flight clone holds a [`Reservation`] for it.
pub struct NetworkPlanner {
    pool: AddressPool,
    netmask: Ipv4Addr,
    gateway: Option<Ipv4Addr>,
    dns: Vec<Ipv4Addr>,
    reserved: Mutex<BTreeSet<Ipv4Addr>>,
}

impl NetworkPlanner {
    pub fn new(
        pool: AddressPool,
        netmask: Ipv4Addr,
        gateway: Option<Ipv4Addr>,
        dns: Vec<Ipv4Addr>,
    ) -> Self {
        Self {
            pool,
            netmask,
            gateway,
            dns,
            reserved: Mutex::new(BTreeSet::new()),
        }
    }

    /// Planner without a static pool: the provider assigns addresses.
    pub fn dynamic() -> Self {
        Self::new(AddressPool::default(), Ipv4Addr::UNSPECIFIED, None, Vec::new())
    }

    pub fn has_static_pool(&self) -> bool {
        !self.pool.is_empty()
    }

    fn reserved(&self) -> MutexGuard<'_, BTreeSet<Ipv4Addr>> {
        self.reserved.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reserve the first free address given the current inventory.
    ///
    /// Returns `Ok(None)` when no static pool is configured.
    pub fn reserve(
        &self,
        instances: &[ProviderInstance],
    ) -> Result<Option<Reservation<'_>>, NetworkError> {
        if self.pool.is_empty() {
            return Ok(None);
        }

        let mut reserved = self.reserved();
        let mut in_use: BTreeSet<Ipv4Addr> = instances.iter().filter_map(|i| i.address).collect();
        in_use.extend(reserved.iter().copied());

        let address = self.pool.next_free(&in_use)?;
        reserved.insert(address);

        let mut identity = NetworkIdentity::new(address, self.netmask);
        identity.gateway = self.gateway;
        for server in &self.dns {
            identity.add_dns(*server);
        }

        Ok(Some(Reservation {
            planner: self,
            identity,
        }))
    }
}

/// A reserved address, released when dropped.
pub struct Reservation<'a> {
    planner: &'a NetworkPlanner,
    identity: NetworkIdentity,
}

impl Reservation<'_> {
    pub fn identity(&self) -> &NetworkIdentity {
        &self.identity
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.planner.reserved().remove(&self.identity.address);
    }
}
