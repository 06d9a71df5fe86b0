//! Layer-2 device contract
//!
//! The instance bridges whole Ethernet frames between a virtual
//! device and the swarm. The OS driver itself lives outside this
//! repository; this module defines the capability set it must
//! implement, frame utilities, and an in-memory double used by tests
//! and dry runs.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use async_trait::async_trait;
use bytes::Bytes;
use rand::RngCore;

use crate::error::{NetError, NetResult};

mod memory;
pub use memory::MemoryTap;

/// Offset of the EtherType field in an Ethernet frame
pub const ETHERTYPE_OFFSET: usize = 12;

/// Ethernet header length
pub const ETHER_HEADER_LEN: usize = 14;

/// Protocols the bridge dispatches on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum EtherType {
    ParcUniversal = 0x0200,
    Ipv4 = 0x0800,
    Arp = 0x0806,
    Rarp = 0x8035,
    Dot1q = 0x8100,
    Ipv6 = 0x86dd,
    PppoeDiscovery = 0x8863,
    PppoeSession = 0x8864,
    Lldp = 0x88cc,
}

impl EtherType {
    /// Decode a raw EtherType value
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0200 | 0x0201 => Some(Self::ParcUniversal),
            0x0800 => Some(Self::Ipv4),
            0x0806 => Some(Self::Arp),
            0x8035 => Some(Self::Rarp),
            0x8100 => Some(Self::Dot1q),
            0x86dd => Some(Self::Ipv6),
            0x8863 => Some(Self::PppoeDiscovery),
            0x8864 => Some(Self::PppoeSession),
            0x88cc => Some(Self::Lldp),
            _ => None,
        }
    }

    /// Read bytes 12..14 of a frame
    pub fn of_frame(frame: &[u8]) -> Option<Self> {
        raw_ethertype(frame).and_then(Self::from_u16)
    }
}

/// Raw EtherType of a frame, if long enough
pub fn raw_ethertype(frame: &[u8]) -> Option<u16> {
    if frame.len() < ETHER_HEADER_LEN {
        return None;
    }
    Some(u16::from_be_bytes([
        frame[ETHERTYPE_OFFSET],
        frame[ETHERTYPE_OFFSET + 1],
    ]))
}

/// Destination hardware address of a frame
pub fn frame_destination(frame: &[u8]) -> Option<MacAddr> {
    if frame.len() < ETHER_HEADER_LEN {
        return None;
    }
    let mut octets = [0u8; 6];
    octets.copy_from_slice(&frame[..6]);
    Some(MacAddr(octets))
}

/// Source hardware address of a frame
pub fn frame_source(frame: &[u8]) -> Option<MacAddr> {
    if frame.len() < ETHER_HEADER_LEN {
        return None;
    }
    let mut octets = [0u8; 6];
    octets.copy_from_slice(&frame[6..12]);
    Some(MacAddr(octets))
}

/// A six-octet hardware address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// Generate a locally administered address with the conventional
    /// 0x06 first octet.
    pub fn generate() -> Self {
        let mut octets = [0u8; 6];
        rand::rngs::OsRng.fill_bytes(&mut octets);
        octets[0] = 0x06;
        Self(octets)
    }

    /// The locally-administered bit
    pub fn is_locally_administered(&self) -> bool {
        self.0[0] & 0x02 != 0
    }

    /// The group (broadcast/multicast) bit
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut count = 0;
        for part in s.split(':') {
            if count == 6 || part.len() != 2 {
                return Err(NetError::Framing(format!("invalid mac: {s}")));
            }
            octets[count] = u8::from_str_radix(part, 16)
                .map_err(|_| NetError::Framing(format!("invalid mac: {s}")))?;
            count += 1;
        }
        if count != 6 {
            return Err(NetError::Framing(format!("invalid mac: {s}")));
        }
        Ok(Self(octets))
    }
}

/// One whole layer-2 frame with its protocol tag
#[derive(Debug, Clone)]
pub struct TapFrame {
    pub proto: u16,
    pub data: Bytes,
}

impl TapFrame {
    pub fn new(proto: u16, data: impl Into<Bytes>) -> Self {
        Self {
            proto,
            data: data.into(),
        }
    }
}

/// Capability set every platform device driver implements
#[async_trait]
pub trait TapDevice: Send + Sync {
    /// Device name as registered with the OS
    fn name(&self) -> String;

    /// Rename the device before it is opened
    fn set_name(&self, name: &str);

    /// Open the underlying device node
    async fn open(&self) -> NetResult<()>;

    /// Apply addressing. A `lazy` configure defers the IP assignment
    /// (used while the overlay address is still being discovered).
    async fn configure(&self, lazy: bool) -> NetResult<()>;

    /// Read one whole frame. `Err(FrameTooBig)` is survivable; any
    /// other error means the device broke.
    async fn read_frame(&self) -> NetResult<TapFrame>;

    /// Write one whole frame with its original protocol tag
    async fn write_frame(&self, frame: &TapFrame) -> NetResult<()>;

    /// Whether the device has failed under us
    fn is_broken(&self) -> bool;

    /// Close the device node
    async fn close(&self) -> NetResult<()>;

    fn ip(&self) -> Option<Ipv4Addr>;
    fn set_ip(&self, ip: Option<Ipv4Addr>);
    fn mask(&self) -> Option<Ipv4Addr>;
    fn set_mask(&self, mask: Option<Ipv4Addr>);
    /// Discovered overlay subnet (network address), used in auto mode
    fn subnet(&self) -> Option<Ipv4Addr>;
    fn set_subnet(&self, subnet: Option<Ipv4Addr>);
    fn mac(&self) -> Option<MacAddr>;
    fn set_mac(&self, mac: MacAddr);
    fn mtu(&self) -> u16;

    /// Auto mode: the overlay IP is chosen cooperatively later
    fn is_auto(&self) -> bool;
    fn set_auto(&self, auto: bool);

    fn is_configured(&self) -> bool;
    fn mark_configured(&self);
    /// Drop addressing back to unconfigured
    fn deconfigure(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with_type(hi: u8, lo: u8) -> Vec<u8> {
        let mut f = vec![0u8; 64];
        f[..6].copy_from_slice(&[0x06, 1, 2, 3, 4, 5]);
        f[6..12].copy_from_slice(&[0x06, 9, 8, 7, 6, 5]);
        f[12] = hi;
        f[13] = lo;
        f
    }

    #[test]
    fn ethertype_dispatch() {
        assert_eq!(
            EtherType::of_frame(&frame_with_type(0x08, 0x00)),
            Some(EtherType::Ipv4)
        );
        assert_eq!(
            EtherType::of_frame(&frame_with_type(0x08, 0x06)),
            Some(EtherType::Arp)
        );
        assert_eq!(
            EtherType::of_frame(&frame_with_type(0x86, 0xdd)),
            Some(EtherType::Ipv6)
        );
        assert_eq!(
            EtherType::of_frame(&frame_with_type(0x02, 0x01)),
            Some(EtherType::ParcUniversal)
        );
        assert_eq!(EtherType::of_frame(&frame_with_type(0x12, 0x34)), None);
        assert_eq!(EtherType::of_frame(&[0u8; 4]), None);
    }

    #[test]
    fn frame_addresses() {
        let f = frame_with_type(0x08, 0x00);
        assert_eq!(
            frame_destination(&f).unwrap().to_string(),
            "06:01:02:03:04:05"
        );
        assert_eq!(frame_source(&f).unwrap().to_string(), "06:09:08:07:06:05");
    }

    #[test]
    fn mac_parse_and_display() {
        let mac: MacAddr = "06:aa:bb:cc:dd:ee".parse().unwrap();
        assert_eq!(mac.to_string(), "06:aa:bb:cc:dd:ee");
        assert!(mac.is_locally_administered());
        assert!("06:aa:bb:cc:dd".parse::<MacAddr>().is_err());
        assert!("06:aa:bb:cc:dd:ee:ff".parse::<MacAddr>().is_err());
        assert!("06:zz:bb:cc:dd:ee".parse::<MacAddr>().is_err());
    }

    #[test]
    fn generated_mac_is_locally_administered() {
        for _ in 0..8 {
            let mac = MacAddr::generate();
            assert_eq!(mac.octets()[0], 0x06);
            assert!(mac.is_locally_administered());
            assert!(!mac.is_multicast());
        }
    }

    #[test]
    fn broadcast_is_multicast() {
        assert!(MacAddr::BROADCAST.is_multicast());
    }
}
