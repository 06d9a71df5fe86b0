//! swarmlink instance runtime
//!
//! An [`Instance`] is bound to one swarm: it keeps the membership
//! table, drives one state machine per peer (handshakes, hole
//! punching, liveness, relay fallback), reconciles overlay addresses
//! when no authority exists, and bridges the local layer-2 device into
//! the swarm's encrypted UDP protocol.

use std::time::Duration;

pub mod bridge;
pub mod config;
pub mod error;
pub mod handshake;
pub mod instance;
pub mod peer;
pub mod reconcile;
pub mod registry;
pub mod relay;
pub mod rendezvous;
pub mod swarm;

pub use config::{InstanceConfig, IpSpec};
pub use error::{CoreError, CoreResult};
pub use handshake::Introduction;
pub use instance::Instance;
pub use peer::{Peer, PeerEvent, PeerState};
pub use relay::{Relay, RelayManager, RelayStatus};
pub use rendezvous::{PeerAnnounce, RendezvousClient, RendezvousPacket};
pub use swarm::{Route, SwarmOp, SwarmTable};

/// Length of a swarm member id
pub use swarmlink_net::ID_LENGTH;

/// Cadence of the main control loop
pub const RUN_TICK: Duration = Duration::from_millis(100);

/// Re-query the rendezvous when idle this long
pub const RENDEZVOUS_STALE: Duration = Duration::from_secs(30);

/// One-shot peer discovery fires this long after start
pub const DISCOVERY_DELAY: Duration = Duration::from_secs(5);

/// How long `close` waits for the swarm to drain
pub const PEER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// No valid datagram within this window disconnects a peer
pub const LIVENESS_WINDOW: Duration = Duration::from_secs(30);

/// Back-off between DISCONNECT and a fresh connection episode
pub const COOLDOWN_PERIOD: Duration = Duration::from_secs(3);

/// Direct-path discovery window before relay fallback
pub const DISCOVERY_WINDOW: Duration = Duration::from_secs(10);

/// Overlay-IP requests toward the rendezvous
pub const DHCP_ATTEMPTS: u32 = 3;
pub const DHCP_WAIT: Duration = Duration::from_secs(2);

/// Auto-mode reconciliation timing
pub const SUBNET_WAIT: Duration = Duration::from_secs(2);
pub const IP_PROBE_INTERVAL: Duration = Duration::from_millis(1500);

/// Device naming
pub const MAX_DEVICE_NAME: usize = 15;
pub const DEVICE_BASENAME: &str = "swl";
