//! Networking utilities for worker instances.
//!
//! This library provides helpers for:
//! - Parsing configured IPv4 ranges (`a.b.c.d/n,e.f.g.h/m`)
//! - Picking a free static address from the configured pool
//! - Describing the network identity applied to a cloned instance

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),

    /// Address pool exhausted.
    #[error("address pool exhausted ({size} addresses, all in use)")]
    PoolExhausted { size: usize },
}

// ============================================================================
// IPv4 Prefixes
// ============================================================================

/// IPv4 prefix, e.g. `192.168.0.0/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Prefix {
    /// Network address (masked).
    pub address: Ipv4Addr,

    /// Prefix length.
    pub prefix_len: u8,
}

impl Ipv4Prefix {
    /// Create a new prefix, masking the address.
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Result<Self, NetworkError> {
        if prefix_len > 32 {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds 32",
                prefix_len
            )));
        }

        Ok(Self {
            address: mask_ipv4(address, prefix_len),
            prefix_len,
        })
    }

    /// Parse from CIDR notation. A bare address is treated as `/32`.
    pub fn from_cidr(s: &str) -> Result<Self, NetworkError> {
        let s = s.trim();
        let (addr_str, prefix_len) = match s.split_once('/') {
            Some((addr, prefix)) => {
                let len = prefix
                    .parse::<u8>()
                    .map_err(|_| NetworkError::InvalidPrefix(prefix.to_string()))?;
                (addr, len)
            }
            None => (s, 32),
        };

        let address = Ipv4Addr::from_str(addr_str)
            .map_err(|_| NetworkError::InvalidAddress(addr_str.to_string()))?;

        Self::new(address, prefix_len)
    }

    /// Check if an address is within this prefix.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        mask_ipv4(addr, self.prefix_len) == self.address
    }

    /// Netmask in dotted form.
    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(mask_bits(self.prefix_len))
    }

    /// Usable host addresses.
    ///
    /// The network and broadcast addresses are skipped unless the prefix is
    /// a `/31` or `/32`, where every address is usable.
    pub fn hosts(&self) -> Vec<Ipv4Addr> {
        let base = u32::from(self.address);
        let size = 1u64 << (32 - u32::from(self.prefix_len));
        if size <= 2 {
            return (0..size).map(|i| Ipv4Addr::from(base + i as u32)).collect();
        }
        (1..size - 1).map(|i| Ipv4Addr::from(base + i as u32)).collect()
    }
}

impl std::fmt::Display for Ipv4Prefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

fn mask_bits(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix_len))
    }
}

fn mask_ipv4(addr: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(addr) & mask_bits(prefix_len))
}

// ============================================================================
// Address Pool
// ============================================================================

/// A fixed set of addresses that workers may be given.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressPool {
    addresses: Vec<Ipv4Addr>,
}

impl AddressPool {
    /// Build a pool from explicit addresses, deduplicated in order.
    pub fn new(addresses: impl IntoIterator<Item = Ipv4Addr>) -> Self {
        let mut seen = BTreeSet::new();
        let addresses = addresses
            .into_iter()
            .filter(|addr| seen.insert(*addr))
            .collect();
        Self { addresses }
    }

    /// Parse a comma-separated list of CIDR ranges.
    ///
    /// An empty string yields an empty pool, which means "let the provider
    /// assign addresses".
    pub fn from_ranges(ranges: &str) -> Result<Self, NetworkError> {
        let mut addresses = Vec::new();
        for range in ranges.split(',').map(str::trim).filter(|r| !r.is_empty()) {
            addresses.extend(Ipv4Prefix::from_cidr(range)?.hosts());
        }
        Ok(Self::new(addresses))
    }

    /// Returns true if no static addresses are configured.
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.addresses.contains(&addr)
    }

    /// First configured address not present in `in_use`.
    pub fn next_free(&self, in_use: &BTreeSet<Ipv4Addr>) -> Result<Ipv4Addr, NetworkError> {
        self.addresses
            .iter()
            .copied()
            .find(|addr| !in_use.contains(addr))
            .ok_or(NetworkError::PoolExhausted {
                size: self.addresses.len(),
            })
    }

    /// Addresses not present in `in_use`, in configured order.
    pub fn available(&self, in_use: &BTreeSet<Ipv4Addr>) -> Vec<Ipv4Addr> {
        self.addresses
            .iter()
            .copied()
            .filter(|addr| !in_use.contains(addr))
            .collect()
    }
}

// ============================================================================
// Network Identity
// ============================================================================

/// Static network settings applied to a cloned instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkIdentity {
    /// Static address of the instance.
    pub address: Ipv4Addr,

    /// Netmask of the instance subnet.
    pub netmask: Ipv4Addr,

    /// Default gateway, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,

    /// DNS resolvers.
    #[serde(default)]
    pub dns_servers: Vec<Ipv4Addr>,
}

impl NetworkIdentity {
    /// Create an identity with a netmask and no gateway or resolvers.
    pub fn new(address: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        Self {
            address,
            netmask,
            gateway: None,
            dns_servers: Vec::new(),
        }
    }

    /// Set the gateway.
    pub fn with_gateway(mut self, gateway: Ipv4Addr) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Add a DNS server.
    pub fn add_dns(&mut self, server: Ipv4Addr) {
        self.dns_servers.push(server);
    }
}

/// Parse an optional dotted address, treating empty as absent.
pub fn parse_optional_addr(s: &str) -> Result<Option<Ipv4Addr>, NetworkError> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(None);
    }
    Ipv4Addr::from_str(s)
        .map(Some)
        .map_err(|_| NetworkError::InvalidAddress(s.to_string()))
}
