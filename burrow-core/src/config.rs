//! Daemon and server configuration. Parses a TOML file into strongly-typed
//! structures; command-line flags override individual fields.

use serde::Deserialize;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

use crate::consts::DEFAULT_MASTER_PORT;
use crate::Error;

/// Primary node daemon configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct DaemonConfig {
    /// Node identifier. If omitted a random value is generated at startup.
    pub node_id: Option<u32>,

    /// Logging verbosity (`error`, `warn`, `info`, `debug`, `trace`).
    pub log_level: Option<String>,

    /// Rendezvous server address, `host:port`.
    pub server_addr: Option<String>,

    pub ports: PortsConfig,
    pub tun: TunConfig,
    pub auth: AuthConfig,
    pub udpgw: UdpgwConfig,
}

/// Port allocator pools and decay.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    /// Pool size for symmetric hole punching (class 0).
    pub symm_ports: u32,
    /// Pool size for non-symmetric hole punching (class 1).
    pub fast_ports: u32,
    /// Grace period in milliseconds before a released port may be reused.
    pub decay_ms: u64,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            symm_ports: 4,
            fast_ports: 16,
            decay_ms: 30_000,
        }
    }
}

/// TUN front configuration. The TUN bridge itself is an external
/// collaborator; the daemon validates and holds its parameters.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TunConfig {
    pub tundev: Option<String>,
    pub netif_ipaddr: Option<Ipv4Addr>,
    pub netif_netmask: Option<Ipv4Addr>,
    pub tun_ns: Option<Ipv4Addr>,
    pub netif_ip6addr: Option<String>,
}

impl TunConfig {
    /// netif-ipaddr, netif-netmask and tun-ns are mandatory for the TUN
    /// front to come up.
    pub fn validate(&self) -> crate::Result<()> {
        if self.netif_ipaddr.is_none() {
            return Err(Error::config("netif-ipaddr is required"));
        }
        if self.netif_netmask.is_none() {
            return Err(Error::config("netif-netmask is required"));
        }
        if self.tun_ns.is_none() {
            return Err(Error::config("tun-ns is required"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    pub password_file: Option<String>,
    pub append_source_to_username: bool,
}

impl AuthConfig {
    /// Resolve the effective password, reading `password_file` if set.
    pub fn password(&self) -> crate::Result<Option<String>> {
        if let Some(path) = &self.password_file {
            let data = fs::read_to_string(path)?;
            return Ok(Some(data.trim_end().to_string()));
        }
        Ok(self.password.clone())
    }
}

/// UDP-gateway sub-module parameters (consumed by the external udpgw
/// collaborator).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UdpgwConfig {
    pub max_connections_for_client: u32,
    /// `addr count` pairs, e.g. `["127.0.0.1:53 5"]`.
    pub local_udp_addrs: Vec<String>,
    pub local_udp_ip6_addrs: Vec<String>,
    pub unique_local_ports: bool,
}

impl Default for UdpgwConfig {
    fn default() -> Self {
        Self {
            max_connections_for_client: 16,
            local_udp_addrs: Vec::new(),
            local_udp_ip6_addrs: Vec::new(),
            unique_local_ports: false,
        }
    }
}

/// Rendezvous server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    pub port: u16,
    pub log_level: Option<String>,
    /// Cap on concurrent connection requests per registered client.
    pub max_connections_for_client: u32,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_MASTER_PORT,
            log_level: None,
            max_connections_for_client: 16,
        }
    }
}

impl DaemonConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let data = fs::read_to_string(path)?;
        Ok(toml::from_str(&data)?)
    }
}

impl MasterConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let data = fs::read_to_string(path)?;
        Ok(toml::from_str(&data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let cfg = DaemonConfig::default();
        assert_eq!(cfg.ports.fast_ports, 16);
        assert_eq!(cfg.ports.symm_ports, 4);
        assert!(cfg.tun.validate().is_err());
    }

    #[test]
    fn parse_roundtrip() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            r#"
node_id = 42
server_addr = "10.0.0.1:2345"

[ports]
fast_ports = 8

[tun]
netif_ipaddr = "10.0.0.2"
netif_netmask = "255.255.255.0"
tun_ns = "8.8.8.8"
"#
        )
        .unwrap();
        let cfg = DaemonConfig::from_file(f.path()).unwrap();
        assert_eq!(cfg.node_id, Some(42));
        assert_eq!(cfg.ports.fast_ports, 8);
        assert_eq!(cfg.ports.symm_ports, 4);
        cfg.tun.validate().unwrap();
    }

    #[test]
    fn password_file_wins() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "s3cret").unwrap();
        let auth = AuthConfig {
            password: Some("other".into()),
            password_file: Some(f.path().to_string_lossy().into_owned()),
            ..Default::default()
        };
        assert_eq!(auth.password().unwrap().as_deref(), Some("s3cret"));
    }
}
