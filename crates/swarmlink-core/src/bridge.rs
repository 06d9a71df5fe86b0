//! Device bridge payloads
//!
//! `COMM` messages either tunnel one layer-2 frame (with its protocol
//! tag) or carry the overlay coordination subtypes used by auto-mode
//! address discovery. This module owns their encoding; dispatch lives
//! with the instance.

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use swarmlink_net::{NetError, NetResult};

use crate::ID_LENGTH;

/// `COMM` subtypes
pub const COMM_FRAME: u16 = 0;
pub const COMM_IP_SUBNET: u16 = 1;
pub const COMM_IP_INFO: u16 = 2;
pub const COMM_IP_SET: u16 = 3;

/// Decoded `COMM` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Comm {
    /// One tunneled layer-2 frame
    Frame { proto: u16, frame: Bytes },
    /// Subnet query (`subnet: None`) or answer (`subnet: Some`)
    IpSubnet { id: String, subnet: Option<Ipv4Addr> },
    /// Candidate probe, or a claim echoing the prober's id
    IpInfo { id: String, candidate: Ipv4Addr },
    /// A member announces its freshly installed address
    IpSet { id: String, ip: Ipv4Addr },
}

impl Comm {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Comm::Frame { proto, frame } => {
                buf.put_u16(COMM_FRAME);
                buf.put_u16(*proto);
                buf.put_slice(frame);
            }
            Comm::IpSubnet { id, subnet } => {
                buf.put_u16(COMM_IP_SUBNET);
                buf.put_slice(id.as_bytes());
                if let Some(subnet) = subnet {
                    buf.put_slice(&subnet.octets());
                }
            }
            Comm::IpInfo { id, candidate } => {
                buf.put_u16(COMM_IP_INFO);
                buf.put_slice(id.as_bytes());
                buf.put_slice(&candidate.octets());
            }
            Comm::IpSet { id, ip } => {
                buf.put_u16(COMM_IP_SET);
                buf.put_slice(id.as_bytes());
                buf.put_slice(&ip.octets());
            }
        }
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> NetResult<Self> {
        if payload.len() < 2 {
            return Err(NetError::Framing("comm payload too short".into()));
        }
        let subtype = payload.get_u16();
        match subtype {
            COMM_FRAME => {
                if payload.len() < 2 {
                    return Err(NetError::Framing("comm frame without protocol".into()));
                }
                let proto = payload.get_u16();
                Ok(Comm::Frame {
                    proto,
                    frame: payload,
                })
            }
            COMM_IP_SUBNET => {
                let id = take_id(&mut payload)?;
                let subnet = match payload.len() {
                    0 => None,
                    4 => Some(take_ip(&mut payload)),
                    n => {
                        return Err(NetError::Framing(format!(
                            "ip-subnet payload has {n} trailing bytes"
                        )))
                    }
                };
                Ok(Comm::IpSubnet { id, subnet })
            }
            COMM_IP_INFO => {
                let id = take_id(&mut payload)?;
                if payload.len() != 4 {
                    return Err(NetError::Framing("ip-info needs a candidate".into()));
                }
                Ok(Comm::IpInfo {
                    id,
                    candidate: take_ip(&mut payload),
                })
            }
            COMM_IP_SET => {
                let id = take_id(&mut payload)?;
                if payload.len() != 4 {
                    return Err(NetError::Framing("ip-set needs an address".into()));
                }
                Ok(Comm::IpSet {
                    id,
                    ip: take_ip(&mut payload),
                })
            }
            other => Err(NetError::Framing(format!("unknown comm subtype {other}"))),
        }
    }
}

fn take_id(payload: &mut Bytes) -> NetResult<String> {
    if payload.len() < ID_LENGTH {
        return Err(NetError::Framing("comm payload misses the member id".into()));
    }
    let mut id = vec![0u8; ID_LENGTH];
    payload.copy_to_slice(&mut id);
    String::from_utf8(id).map_err(|_| NetError::Framing("member id is not utf-8".into()))
}

fn take_ip(payload: &mut Bytes) -> Ipv4Addr {
    let mut octets = [0u8; 4];
    payload.copy_to_slice(&mut octets);
    Ipv4Addr::from(octets)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "0f8fad5b-d9cb-469f-a165-70867728950e";

    #[test]
    fn frame_roundtrip() {
        let comm = Comm::Frame {
            proto: 0x0800,
            frame: Bytes::from_static(b"ethernet frame bytes"),
        };
        assert_eq!(Comm::decode(comm.encode()).unwrap(), comm);
    }

    #[test]
    fn subnet_query_and_answer_roundtrip() {
        let query = Comm::IpSubnet {
            id: ID.into(),
            subnet: None,
        };
        assert_eq!(Comm::decode(query.encode()).unwrap(), query);

        let answer = Comm::IpSubnet {
            id: ID.into(),
            subnet: Some("10.1.0.0".parse().unwrap()),
        };
        assert_eq!(Comm::decode(answer.encode()).unwrap(), answer);
    }

    #[test]
    fn ip_info_roundtrip() {
        let comm = Comm::IpInfo {
            id: ID.into(),
            candidate: "10.1.0.254".parse().unwrap(),
        };
        assert_eq!(Comm::decode(comm.encode()).unwrap(), comm);
    }

    #[test]
    fn ip_set_roundtrip() {
        let comm = Comm::IpSet {
            id: ID.into(),
            ip: "10.1.0.7".parse().unwrap(),
        };
        assert_eq!(Comm::decode(comm.encode()).unwrap(), comm);
    }

    #[test]
    fn malformed_payloads_rejected() {
        assert!(Comm::decode(Bytes::from_static(b"")).is_err());
        assert!(Comm::decode(Bytes::from_static(&[0x00, 0x63])).is_err()); // unknown subtype 99
        // ip-info with a truncated id
        let mut buf = BytesMut::new();
        buf.put_u16(COMM_IP_INFO);
        buf.put_slice(b"short-id");
        assert!(Comm::decode(buf.freeze()).is_err());
        // ip-set without the address
        let mut buf = BytesMut::new();
        buf.put_u16(COMM_IP_SET);
        buf.put_slice(ID.as_bytes());
        assert!(Comm::decode(buf.freeze()).is_err());
    }
}
