//! Provisions the configured IPv6 addresses onto a network interface.
//!
//! Shells out to iproute2 rather than speaking rtnetlink. Addresses are added with a /128
//! prefix; an address that is already present on the interface is not an error.

use std::{collections::HashSet, net::Ipv6Addr};

use crate::config::Endpoint;

/// Parses `ip -6 addr show dev <iface>` output into the set of addresses already assigned.
/// Lines look like `    inet6 2001:db8::10/128 scope global`.
pub fn parse_assigned_addresses(output: &str) -> HashSet<Ipv6Addr> {
    let mut assigned = HashSet::new();
    for line in output.lines() {
        let mut words = line.split_whitespace();
        if words.next() != Some("inet6") {
            continue;
        }

        if let Some(cidr) = words.next() {
            let address = cidr.split('/').next().unwrap_or(cidr);
            if let Ok(address) = address.parse() {
                assigned.insert(address);
            }
        }
    }

    assigned
}

#[cfg(target_os = "linux")]
pub use linux::ensure_addresses;

#[cfg(target_os = "linux")]
mod linux {
    use std::{
        collections::HashSet,
        io::{Error, ErrorKind},
        net::Ipv6Addr,
        process::Command,
    };

    use super::{parse_assigned_addresses, Endpoint};

    /// Makes sure every endpoint's outbound address is assigned to `interface`, adding the
    /// missing ones. Fails fast on the first address the kernel rejects.
    pub fn ensure_addresses(interface: &str, endpoints: &[Endpoint]) -> Result<(), Error> {
        let assigned = query_assigned(interface)?;

        for endpoint in endpoints {
            if assigned.contains(&endpoint.address) {
                tracing::debug!(address = %endpoint.address, interface, "address already assigned");
                continue;
            }

            add_address(interface, endpoint.address)?;
            tracing::info!(address = %endpoint.address, interface, "assigned address");
        }

        Ok(())
    }

    fn query_assigned(interface: &str) -> Result<HashSet<Ipv6Addr>, Error> {
        let output = Command::new("ip").args(["-6", "addr", "show", "dev", interface]).output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::new(
                ErrorKind::Other,
                format!("ip -6 addr show dev {interface} failed: {}", stderr.trim()),
            ));
        }

        Ok(parse_assigned_addresses(&String::from_utf8_lossy(&output.stdout)))
    }

    fn add_address(interface: &str, address: Ipv6Addr) -> Result<(), Error> {
        let output = Command::new("ip")
            .args(["addr", "add", &format!("{address}/128"), "dev", interface])
            .output()?;

        if output.status.success() {
            return Ok(());
        }

        // Lost a race with another assigner, same end state
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("File exists") {
            return Ok(());
        }

        Err(Error::new(
            ErrorKind::Other,
            format!("ip addr add {address}/128 dev {interface} failed: {}", stderr.trim()),
        ))
    }
}

#[cfg(not(target_os = "linux"))]
pub fn ensure_addresses(interface: &str, _endpoints: &[Endpoint]) -> Result<(), std::io::Error> {
    tracing::warn!(interface, "address provisioning is only supported on linux, skipping");
    Ok(())
}
