use std::net::Ipv4Addr;

use nix::ifaddrs::{getifaddrs, InterfaceAddress};
use nix::net::if_::InterfaceFlags;

use crate::error::{PoolError, Result};

/// Returns the externally reachable IPv4 address of this machine: the
/// first interface that is up, not loopback, multicast-capable, and
/// carries an IPv4 address.
pub fn external_ipv4() -> Result<Ipv4Addr> {
    let interfaces = getifaddrs().map_err(|e| PoolError::Probe(e.to_string()))?;

    for ifaddr in interfaces {
        if !ifaddr.flags.contains(InterfaceFlags::IFF_UP) {
            tracing::debug!(interface = %ifaddr.interface_name, "skipping interface that is down");
            continue;
        }
        if ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK) {
            continue;
        }
        if !ifaddr.flags.contains(InterfaceFlags::IFF_MULTICAST) {
            tracing::debug!(
                interface = %ifaddr.interface_name,
                "skipping interface without multicast"
            );
            continue;
        }
        let Some(ip) = ipv4_of(&ifaddr) else {
            tracing::debug!(
                interface = %ifaddr.interface_name,
                "skipping interface with no IPv4 address"
            );
            continue;
        };
        tracing::debug!(interface = %ifaddr.interface_name, ip = %ip, "selected external address");
        return Ok(ip);
    }

    Err(PoolError::NoExternalIp)
}

/// Returns the IPv4 address of the first up, multicast-capable interface.
/// The discovery responder joins the group on it when the operator does not
/// name one.
pub fn multicast_interface_ipv4() -> Result<Ipv4Addr> {
    let interfaces = getifaddrs().map_err(|e| PoolError::Probe(e.to_string()))?;

    for ifaddr in interfaces {
        if !ifaddr.flags.contains(InterfaceFlags::IFF_UP)
            || !ifaddr.flags.contains(InterfaceFlags::IFF_MULTICAST)
        {
            continue;
        }
        let Some(ip) = ipv4_of(&ifaddr) else { continue };
        tracing::debug!(
            interface = %ifaddr.interface_name,
            ip = %ip,
            "selected multicast interface"
        );
        return Ok(ip);
    }

    Err(PoolError::NoMulticastInterface)
}

fn ipv4_of(ifaddr: &InterfaceAddress) -> Option<Ipv4Addr> {
    ifaddr
        .address
        .as_ref()?
        .as_sockaddr_in()
        .map(|sin| sin.ip())
}
