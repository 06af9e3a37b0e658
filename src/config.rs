use std::{
    collections::HashSet,
    fmt,
    net::{IpAddr, Ipv6Addr},
    path::{Path, PathBuf},
};

use serde::Deserialize;

/// The top-level YAML configuration.
///
/// ```yaml
/// interface: eth0
/// proxies:
///   - ipv6: "2001:db8::10"
///     port: 10801
/// ```
#[derive(Debug, Deserialize)]
pub struct Config {
    /// The network interface the outbound addresses get assigned to.
    pub interface: String,

    /// One entry per SOCKS5 listener.
    #[serde(default)]
    pub proxies: Vec<ProxyEntry>,
}

/// A single listener entry as it appears in the configuration file.
#[derive(Debug, Deserialize)]
pub struct ProxyEntry {
    pub ipv6: String,
    pub port: u16,
}

/// A validated (outbound address, listen port) pair. Immutable after startup; each listener
/// owns exactly one of these for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub address: Ipv6Addr,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socks5://0.0.0.0:{} → {}", self.port, self.address)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, std::io::Error),
    Yaml(serde_yaml::Error),
    Validation(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(path, error) => write!(f, "config: read {}: {error}", path.display()),
            Self::Yaml(error) => write!(f, "config: yaml: {error}"),
            Self::Validation(message) => write!(f, "config: {message}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Loads and parses a YAML config file. Call [`Config::validate`] afterwards.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|error| ConfigError::Io(path.to_path_buf(), error))?;
        serde_yaml::from_str(&data).map_err(ConfigError::Yaml)
    }

    /// Validates the configuration, turning the raw entries into [`Endpoint`] values.
    ///
    /// Addresses must be IPv6 (IPv4 and IPv4-mapped addresses are rejected) and unique, and
    /// ports must be nonzero and unique.
    pub fn validate(&self) -> Result<Vec<Endpoint>, ConfigError> {
        if self.interface.is_empty() {
            return Err(ConfigError::Validation("'interface' is required (e.g. eth0)".into()));
        }

        if self.proxies.is_empty() {
            return Err(ConfigError::Validation("at least one proxy entry is required".into()));
        }

        let mut endpoints = Vec::with_capacity(self.proxies.len());
        let mut seen_addresses = HashSet::with_capacity(self.proxies.len());
        let mut seen_ports = HashSet::with_capacity(self.proxies.len());

        for (i, entry) in self.proxies.iter().enumerate() {
            let address = parse_outbound_address(&entry.ipv6)
                .map_err(|message| ConfigError::Validation(format!("proxies[{i}]: {message}")))?;

            if entry.port == 0 {
                return Err(ConfigError::Validation(format!("proxies[{i}]: port 0 is out of range (1-65535)")));
            }

            if !seen_addresses.insert(address) {
                return Err(ConfigError::Validation(format!("proxies[{i}]: duplicate IPv6 {address}")));
            }

            if !seen_ports.insert(entry.port) {
                return Err(ConfigError::Validation(format!("proxies[{i}]: duplicate port {}", entry.port)));
            }

            endpoints.push(Endpoint {
                address,
                port: entry.port,
            });
        }

        Ok(endpoints)
    }
}

/// Parses an outbound address string, rejecting anything that isn't plain IPv6.
fn parse_outbound_address(s: &str) -> Result<Ipv6Addr, String> {
    let ip: IpAddr = s.parse().map_err(|_| format!("invalid IP address {s:?}"))?;

    match ip {
        IpAddr::V4(_) => Err(format!("{s:?} is IPv4, only IPv6 is supported")),
        IpAddr::V6(v6) if v6.to_ipv4_mapped().is_some() => Err(format!("{s:?} is IPv4-mapped, only IPv6 is supported")),
        IpAddr::V6(v6) => Ok(v6),
    }
}
