//! Instance configuration

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{CoreError, CoreResult};

/// Structured options an instance is created with
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    /// Hardware address for the virtual device; generated when empty
    pub mac: Option<String>,
    /// Content hash naming the swarm
    pub hash: String,
    /// Path to a keyfile with shared swarm keys
    pub keyfile: Option<PathBuf>,
    /// Literal key; takes precedence over the keyfile
    pub key: Option<String>,
    /// Lifetime of the literal key ("default" when empty)
    pub ttl: Option<String>,
    /// Bootstrap rendezvous `host:port` (TCP; the UDP echo service
    /// answers on the same address)
    pub target: Option<String>,
    /// Skip local-subnet candidates during direct-path discovery
    pub forward_mode: bool,
    /// UDP port to bind; 0 picks an ephemeral one
    pub port: u16,
    /// Preferred outbound address
    pub outbound_ip: Option<Ipv4Addr>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            mac: None,
            hash: String::new(),
            keyfile: None,
            key: None,
            ttl: None,
            target: None,
            forward_mode: false,
            port: 0,
            outbound_ip: None,
        }
    }
}

impl InstanceConfig {
    /// Rendezvous address, defaulting to the public bootstrap
    pub fn target(&self) -> &str {
        self.target.as_deref().unwrap_or("bootstrap.swarmlink.io:6881")
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.hash.is_empty() {
            return Err(CoreError::ConfigInvalid("swarm hash is empty".into()));
        }
        Ok(())
    }
}

/// Parsed `-ip` specification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpSpec {
    /// Ask the rendezvous for an address
    Dhcp,
    /// Choose cooperatively once a peer is connected
    Discover,
    /// Literal address with prefix length (bare addresses get /24)
    Static(Ipv4Addr, u8),
}

impl FromStr for IpSpec {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dhcp" | "auto" => Ok(Self::Dhcp),
            "discover" => Ok(Self::Discover),
            literal => {
                let (addr, prefix) = match literal.split_once('/') {
                    Some((addr, prefix)) => {
                        let prefix: u8 = prefix.parse().map_err(|_| {
                            CoreError::ConfigInvalid(format!("bad prefix in {literal}"))
                        })?;
                        if prefix > 30 {
                            return Err(CoreError::ConfigInvalid(format!(
                                "prefix /{prefix} leaves no host addresses"
                            )));
                        }
                        (addr, prefix)
                    }
                    None => (literal, 24),
                };
                let ip: Ipv4Addr = addr
                    .parse()
                    .map_err(|_| CoreError::ConfigInvalid(format!("bad ip: {literal}")))?;
                Ok(Self::Static(ip, prefix))
            }
        }
    }
}

impl IpSpec {
    /// Netmask for a static spec
    pub fn mask(prefix: u8) -> Ipv4Addr {
        let bits = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
        Ipv4Addr::from(bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_keywords() {
        assert_eq!("dhcp".parse::<IpSpec>().unwrap(), IpSpec::Dhcp);
        assert_eq!("auto".parse::<IpSpec>().unwrap(), IpSpec::Dhcp);
        assert_eq!("discover".parse::<IpSpec>().unwrap(), IpSpec::Discover);
    }

    #[test]
    fn bare_address_defaults_to_slash_24() {
        assert_eq!(
            "10.1.0.5".parse::<IpSpec>().unwrap(),
            IpSpec::Static("10.1.0.5".parse().unwrap(), 24)
        );
    }

    #[test]
    fn cidr_is_honored() {
        assert_eq!(
            "192.168.4.9/16".parse::<IpSpec>().unwrap(),
            IpSpec::Static("192.168.4.9".parse().unwrap(), 16)
        );
    }

    #[test]
    fn garbage_is_rejected() {
        assert!("10.1".parse::<IpSpec>().is_err());
        assert!("10.1.0.5/33".parse::<IpSpec>().is_err());
        assert!("not-an-ip".parse::<IpSpec>().is_err());
    }

    #[test]
    fn mask_from_prefix() {
        assert_eq!(IpSpec::mask(24), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(IpSpec::mask(16), Ipv4Addr::new(255, 255, 0, 0));
    }

    #[test]
    fn empty_hash_fails_validation() {
        let config = InstanceConfig::default();
        assert!(config.validate().is_err());
    }
}
