//! Relay pool
//!
//! Candidates come from the rendezvous; each is probed on a cadence
//! and promoted to active after a successful latency measurement, or
//! declared dead after enough unanswered probes. When the active set
//! changes the runtime reports it back so other members can pick
//! compatible relays.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Probe spacing per relay
const RELAY_PROBE_INTERVAL: Duration = Duration::from_secs(10);

/// Unanswered probes before a relay is dead
const RELAY_MISSED_LIMIT: u32 = 3;

/// Health of one relay candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStatus {
    Probing,
    Active,
    Dead,
}

/// One relay endpoint under observation
#[derive(Debug, Clone)]
pub struct Relay {
    pub endpoint: SocketAddr,
    pub status: RelayStatus,
    pub latency: Option<Duration>,
    last_probe: Option<Instant>,
    missed: u32,
}

impl Relay {
    fn new(endpoint: SocketAddr) -> Self {
        Self {
            endpoint,
            status: RelayStatus::Probing,
            latency: None,
            last_probe: None,
            missed: 0,
        }
    }
}

/// Pool of relay endpoints with change tracking
#[derive(Default)]
pub struct RelayManager {
    relays: RwLock<Vec<Relay>>,
    changed: AtomicBool,
}

impl RelayManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge candidates from the rendezvous; known endpoints keep
    /// their measurements, dead ones get another chance.
    pub async fn add_candidates(&self, endpoints: Vec<SocketAddr>) {
        let mut relays = self.relays.write().await;
        for endpoint in endpoints {
            match relays.iter_mut().find(|r| r.endpoint == endpoint) {
                Some(relay) if relay.status == RelayStatus::Dead => {
                    debug!(%endpoint, "re-probing dead relay");
                    relay.status = RelayStatus::Probing;
                    relay.missed = 0;
                }
                Some(_) => {}
                None => {
                    debug!(%endpoint, "new relay candidate");
                    relays.push(Relay::new(endpoint));
                }
            }
        }
    }

    /// Endpoints due for a probe; marks them probed and advances the
    /// missed counters.
    pub async fn due_probes(&self) -> Vec<SocketAddr> {
        let mut relays = self.relays.write().await;
        let mut due = Vec::new();
        for relay in relays.iter_mut() {
            if relay.status == RelayStatus::Dead {
                continue;
            }
            let ready = relay
                .last_probe
                .map_or(true, |t| t.elapsed() >= RELAY_PROBE_INTERVAL);
            if !ready {
                continue;
            }
            relay.last_probe = Some(Instant::now());
            relay.missed += 1;
            if relay.missed > RELAY_MISSED_LIMIT {
                warn!(endpoint = %relay.endpoint, "relay is dead");
                relay.status = RelayStatus::Dead;
                self.changed.store(true, Ordering::Relaxed);
                continue;
            }
            due.push(relay.endpoint);
        }
        due
    }

    /// Record a probe answer. Returns false when the address is not a
    /// tracked relay.
    pub async fn record_reply(&self, endpoint: SocketAddr, rtt: Duration) -> bool {
        let mut relays = self.relays.write().await;
        let Some(relay) = relays.iter_mut().find(|r| r.endpoint == endpoint) else {
            return false;
        };
        relay.missed = 0;
        relay.latency = Some(rtt);
        if relay.status != RelayStatus::Active {
            info!(%endpoint, ?rtt, "relay active");
            relay.status = RelayStatus::Active;
            self.changed.store(true, Ordering::Relaxed);
        }
        true
    }

    /// Whether this address belongs to a tracked relay
    pub async fn is_tracked(&self, endpoint: SocketAddr) -> bool {
        self.relays
            .read()
            .await
            .iter()
            .any(|r| r.endpoint == endpoint)
    }

    /// The active subset
    pub async fn active(&self) -> Vec<Relay> {
        self.relays
            .read()
            .await
            .iter()
            .filter(|r| r.status == RelayStatus::Active)
            .cloned()
            .collect()
    }

    /// Lowest-latency active relay
    pub async fn best(&self) -> Option<SocketAddr> {
        self.relays
            .read()
            .await
            .iter()
            .filter(|r| r.status == RelayStatus::Active)
            .min_by_key(|r| r.latency.unwrap_or(Duration::MAX))
            .map(|r| r.endpoint)
    }

    /// Consume the change flag; true at most once per change
    pub fn take_changes(&self) -> bool {
        self.changed.swap(false, Ordering::Relaxed)
    }
}
