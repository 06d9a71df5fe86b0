//! Network layer for swarmlink
//!
//! Everything below protocol semantics: the fixed-header UDP message
//! codec, the instance's UDP socket with echo-port discovery, endpoint
//! bookkeeping, and the layer-2 device contract. This crate never
//! interprets message payloads.

pub mod endpoint;
pub mod error;
pub mod message;
pub mod socket;
pub mod tap;

pub use endpoint::{Endpoint, EndpointSet, LatencyPacket, LatencyKind};
pub use error::{NetError, NetResult};
pub use message::{Fragmenter, Message, MsgType, Reassembler};
pub use socket::{Datagram, NetSocket};
pub use tap::{EtherType, MacAddr, MemoryTap, TapDevice, TapFrame};

/// Wire magic distinguishing swarm datagrams from strays
pub const MAGIC: u16 = 0x5a4c;

/// Largest datagram we ever parse
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Default device MTU
pub const DEFAULT_MTU: u16 = 1500;

/// Length of a swarm member id
pub const ID_LENGTH: usize = 36;
