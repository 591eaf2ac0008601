// SPDX-License-Identifier: MIT

//! Management of firewall access rules.
//!
//! The [`Firewall`] trait abstracts over the concrete backend; the
//! [`Manager`] applies service-level policy (duration clamping and defaults)
//! before delegating to it. Access rules are effectively a set keyed by
//! (address range, port): re-adding an entry refreshes its timeout.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use ipnet::IpNet;

use crate::server::db::{Service, User};

pub mod mock;
pub mod nftables;

pub use mock::Mock;
pub use nftables::NfTables;

/// An inclusive range of IP addresses, always within a single address
/// family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpRange {
    pub start: IpAddr,
    pub end: IpAddr,
}

impl IpRange {
    /// Parse a client entry: a single address, a CIDR block, or an explicit
    /// `start-end` range.
    pub fn parse(entry: &str) -> anyhow::Result<IpRange> {
        let entry = entry.trim();

        if let Ok(addr) = IpAddr::from_str(entry) {
            return Ok(IpRange {
                start: addr,
                end: addr,
            });
        }

        if let Ok(net) = IpNet::from_str(entry) {
            return Ok(IpRange {
                start: net.network(),
                end: net.broadcast(),
            });
        }

        if let Some((start, end)) = entry.split_once('-') {
            let start = IpAddr::from_str(start.trim())
                .map_err(|error| anyhow::anyhow!("invalid range start '{start}': {error}"))?;
            let end = IpAddr::from_str(end.trim())
                .map_err(|error| anyhow::anyhow!("invalid range end '{end}': {error}"))?;
            if start.is_ipv4() != end.is_ipv4() {
                return Err(anyhow::anyhow!(
                    "range '{entry}' mixes IPv4 and IPv6 addresses"
                ));
            }
            if start > end {
                return Err(anyhow::anyhow!("range '{entry}' is reversed"));
            }
            return Ok(IpRange { start, end });
        }

        Err(anyhow::anyhow!(
            "'{entry}' is not an IP address, CIDR block, or address range"
        ))
    }

    pub fn is_ipv4(&self) -> bool {
        self.start.is_ipv4()
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Parse a list of client entries into a set of address ranges. Any single
/// parse failure fails the whole set.
pub fn parse_ip_set(entries: &[String]) -> anyhow::Result<Vec<IpRange>> {
    entries.iter().map(|entry| IpRange::parse(entry)).collect()
}

/// The range covering every IPv4 address.
pub fn all_ipv4() -> IpRange {
    IpRange {
        start: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        end: IpAddr::V4(Ipv4Addr::BROADCAST),
    }
}

/// The range covering every IPv6 address.
pub fn all_ipv6() -> IpRange {
    IpRange {
        start: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        end: IpAddr::V6(Ipv6Addr::from_bits(u128::MAX)),
    }
}

/// The interface to a concrete firewall backend.
///
/// Implementations must be safe for concurrent calls.
#[async_trait]
pub trait Firewall: Send + Sync {
    /// Initialize the firewall (create tables, chains, sets). Must be
    /// idempotent.
    async fn init(&self) -> anyhow::Result<()>;

    /// Allow the address range access to the port until the timeout elapses.
    /// Re-adding an existing entry refreshes its timeout.
    async fn allow(&self, range: IpRange, port: u16, timeout: Duration) -> anyhow::Result<()>;

    /// Remove access of the address range to the port. Removing an absent
    /// entry is not an error.
    async fn deny(&self, range: IpRange, port: u16) -> anyhow::Result<()>;
}

/// Applies access policy for services and drives the firewall backend.
#[derive(Clone)]
pub struct Manager {
    firewall: Arc<dyn Firewall>,
    default_access_duration: Duration,
}

impl Manager {
    /// Create a new manager and initialize the backend ruleset.
    pub async fn new(
        firewall: Arc<dyn Firewall>,
        default_access_duration: Duration,
    ) -> anyhow::Result<Manager> {
        firewall
            .init()
            .await
            .map_err(|error| anyhow::anyhow!("firewall setup failed: {error:#}"))?;
        Ok(Manager {
            firewall,
            default_access_duration,
        })
    }

    /// Grant the address ranges access to a service.
    ///
    /// The duration is clamped to the service's maximum; a zero duration
    /// falls back to the configured default.
    pub async fn grant_access(
        &self,
        ip_set: &[IpRange],
        service: &Service,
        duration: Duration,
    ) -> anyhow::Result<()> {
        let mut duration = duration;
        if duration > service.max_access_duration {
            tracing::warn!(
                service = service.name,
                requested = %humantime::format_duration(duration),
                max = %humantime::format_duration(service.max_access_duration),
                "limiting access duration to the service maximum"
            );
            duration = service.max_access_duration;
        }
        if duration.is_zero() {
            duration = self.default_access_duration;
        }

        for range in ip_set {
            self.firewall
                .allow(*range, service.port, duration)
                .await
                .map_err(|error| {
                    anyhow::anyhow!(
                        "failed creating access for client {range} to service {}: {error:#}",
                        service.name
                    )
                })?;
            tracing::info!(
                client = %range,
                service = service.name,
                port = service.port,
                duration = %humantime::format_duration(duration),
                "created temporary access"
            );
        }

        Ok(())
    }

    /// Remove access of the address ranges to a service.
    pub async fn deny_access(
        &self,
        ip_set: &[IpRange],
        service: &Service,
        user: &User,
    ) -> anyhow::Result<()> {
        for range in ip_set {
            self.firewall
                .deny(*range, service.port)
                .await
                .map_err(|error| {
                    anyhow::anyhow!(
                        "failed removing access of client {range} to service {}: {error:#}",
                        service.name
                    )
                })?;
            tracing::info!(
                client = %range,
                service = service.name,
                port = service.port,
                user = user.name,
                "removed access"
            );
        }

        Ok(())
    }
}
