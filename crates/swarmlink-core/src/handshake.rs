//! Peer introduction records
//!
//! The first authenticated exchange between two peers is a
//! comma-framed record `"id,mac,ip|auto,endpoint"` carrying identity,
//! hardware address, overlay IP (or the auto marker) and the endpoint
//! the sender observed the recipient on.

use std::net::{Ipv4Addr, SocketAddr};

use swarmlink_net::MacAddr;

use crate::error::{CoreError, CoreResult};

/// Handshake data exchanged between two peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Introduction {
    /// Sender's 36-char member id
    pub id: String,
    /// Sender's hardware address
    pub mac: MacAddr,
    /// Sender's overlay IP; `None` while it runs in auto mode
    pub ip: Option<Ipv4Addr>,
    /// Where the sender observed the recipient (reverse NAT learning)
    pub endpoint: SocketAddr,
}

impl Introduction {
    /// Render the wire record
    pub fn to_record(&self) -> String {
        let ip = match self.ip {
            Some(ip) => ip.to_string(),
            None => "auto".to_owned(),
        };
        format!("{},{},{},{}", self.id, self.mac, ip, self.endpoint)
    }

    /// Parse a wire record. Exactly four comma-separated fields; each
    /// failure names the offending field.
    pub fn parse(record: &str) -> CoreResult<Self> {
        let parts: Vec<&str> = record.split(',').collect();
        if parts.len() != 4 {
            return Err(CoreError::MalformedIntroduction(format!(
                "expected 4 fields, got {}",
                parts.len()
            )));
        }
        let id = parts[0].to_owned();
        if id.is_empty() {
            return Err(CoreError::MalformedIntroduction("empty id".into()));
        }
        let mac: MacAddr = parts[1]
            .parse()
            .map_err(|_| CoreError::MalformedIntroduction(format!("bad mac: {}", parts[1])))?;
        let ip = if parts[2] == "auto" {
            None
        } else {
            Some(parts[2].parse().map_err(|_| {
                CoreError::MalformedIntroduction(format!("bad ip: {}", parts[2]))
            })?)
        };
        let endpoint: SocketAddr = parts[3].parse().map_err(|_| {
            CoreError::MalformedIntroduction(format!("bad endpoint: {}", parts[3]))
        })?;
        Ok(Self { id, mac, ip, endpoint })
    }

    /// Whether the sender runs in auto-IP mode
    pub fn auto_ip(&self) -> bool {
        self.ip.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Introduction {
        Introduction {
            id: "0f8fad5b-d9cb-469f-a165-70867728950e".into(),
            mac: "06:aa:bb:cc:dd:ee".parse().unwrap(),
            ip: Some("10.1.0.5".parse().unwrap()),
            endpoint: "203.0.113.9:3500".parse().unwrap(),
        }
    }

    #[test]
    fn record_roundtrip() {
        let hs = sample();
        assert_eq!(Introduction::parse(&hs.to_record()).unwrap(), hs);
    }

    #[test]
    fn auto_ip_roundtrip() {
        let hs = Introduction {
            ip: None,
            ..sample()
        };
        let record = hs.to_record();
        assert!(record.contains(",auto,"));
        let parsed = Introduction::parse(&record).unwrap();
        assert!(parsed.auto_ip());
        assert_eq!(parsed, hs);
    }

    #[test]
    fn three_fields_rejected() {
        let err = Introduction::parse("id,06:aa:bb:cc:dd:ee,10.1.0.5").unwrap_err();
        assert!(matches!(err, CoreError::MalformedIntroduction(_)));
    }

    #[test]
    fn bad_mac_rejected() {
        assert!(Introduction::parse("id,not-a-mac,10.1.0.5,1.2.3.4:5").is_err());
    }

    #[test]
    fn bad_ip_rejected() {
        assert!(Introduction::parse("id,06:aa:bb:cc:dd:ee,256.0.0.1,1.2.3.4:5").is_err());
    }

    #[test]
    fn bad_endpoint_rejected() {
        assert!(Introduction::parse("id,06:aa:bb:cc:dd:ee,10.1.0.5,nowhere").is_err());
    }
}
