//! Concurrent peer registry
//!
//! Keyed by member id with two secondary indexes (overlay IP -> id,
//! hardware address -> id). All writes funnel through one serializing
//! mutator; reads get snapshot copies and must not expect mutations to
//! reflect back.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};

use tokio::sync::RwLock;
use tracing::trace;

use swarmlink_net::MacAddr;

use crate::error::{CoreError, CoreResult};
use crate::peer::Peer;

/// Mutation accepted by the serializing mutator
#[derive(Debug)]
pub enum SwarmOp {
    Update(Box<Peer>),
    Delete(String),
}

/// Where to send traffic for a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub addr: SocketAddr,
    /// When set, `addr` is a relay and messages must be wrapped with
    /// this destination id
    pub via_relay: Option<String>,
}

#[derive(Default)]
struct Tables {
    peers: HashMap<String, Peer>,
    by_ip: HashMap<Ipv4Addr, String>,
    by_mac: HashMap<MacAddr, String>,
}

impl Tables {
    /// Secondary indexes are rewritten inside the same critical
    /// section as the primary map.
    fn reindex(&mut self, id: &str, peer: &Peer) {
        self.by_ip.retain(|_, v| v != id);
        self.by_mac.retain(|_, v| v != id);
        if let Some(ip) = peer.ip {
            self.by_ip.insert(ip, id.to_owned());
        }
        if let Some(mac) = peer.hw {
            self.by_mac.insert(mac, id.to_owned());
        }
    }

    fn unindex(&mut self, id: &str) {
        self.by_ip.retain(|_, v| v != id);
        self.by_mac.retain(|_, v| v != id);
    }
}

/// The swarm membership table
#[derive(Default)]
pub struct SwarmTable {
    tables: RwLock<Tables>,
}

impl SwarmTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The single serializing mutator
    pub async fn apply(&self, op: SwarmOp) -> CoreResult<()> {
        let mut tables = self.tables.write().await;
        match op {
            SwarmOp::Update(peer) => {
                trace!(peer = %peer.id, state = %peer.state, "swarm update");
                tables.reindex(&peer.id, &peer);
                tables.peers.insert(peer.id.clone(), *peer);
                Ok(())
            }
            SwarmOp::Delete(id) => {
                if tables.peers.remove(&id).is_none() {
                    return Err(CoreError::UnknownPeer(id));
                }
                tables.unindex(&id);
                Ok(())
            }
        }
    }

    /// Insert or refresh a peer snapshot
    pub async fn update(&self, peer: &Peer) {
        let _ = self.apply(SwarmOp::Update(Box::new(peer.clone()))).await;
    }

    /// Remove a peer; deleting an unknown id is reported, not fatal
    pub async fn delete(&self, id: &str) -> CoreResult<()> {
        self.apply(SwarmOp::Delete(id.to_owned())).await
    }

    /// Snapshot copy of the whole table
    pub async fn get(&self) -> HashMap<String, Peer> {
        self.tables.read().await.peers.clone()
    }

    /// Snapshot copy of one peer
    pub async fn peer(&self, id: &str) -> Option<Peer> {
        self.tables.read().await.peers.get(id).cloned()
    }

    /// Route for a destination hardware address
    pub async fn route_by_mac(&self, mac: MacAddr) -> Option<Route> {
        let tables = self.tables.read().await;
        let id = tables.by_mac.get(&mac)?;
        let peer = tables.peers.get(id)?;
        if let Some(proxy) = peer.proxy {
            return Some(Route {
                addr: proxy,
                via_relay: Some(peer.id.clone()),
            });
        }
        peer.active_endpoint().map(|addr| Route {
            addr,
            via_relay: None,
        })
    }

    /// Member id owning an overlay address
    pub async fn id_by_ip(&self, ip: Ipv4Addr) -> Option<String> {
        self.tables.read().await.by_ip.get(&ip).cloned()
    }

    pub async fn len(&self) -> usize {
        self.tables.read().await.peers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tables.read().await.peers.is_empty()
    }
}
