//! Endpoint bookkeeping
//!
//! A peer is reachable through a small set of candidate UDP endpoints.
//! Each endpoint tracks contact freshness, measured latency and a
//! `broken` flag that only resets when a fresh candidate set is
//! installed.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{NetError, NetResult};
use crate::ID_LENGTH;

/// Minimum spacing between latency probes per endpoint
pub const LATENCY_REQUEST_INTERVAL: Duration = Duration::from_secs(10);

/// Consecutive unanswered probes before an endpoint is broken
pub const MISSED_PROBE_LIMIT: u32 = 3;

/// Spacing between peer-to-peer liveness pings
pub const XPEER_PING_INTERVAL: Duration = Duration::from_secs(5);

/// Candidates kept per peer
pub const MAX_CANDIDATES: usize = 8;

/// Latency request marker
pub const LATENCY_REQUEST_HEADER: &[u8; 4] = b"LREQ";
/// Latency reply marker
pub const LATENCY_RESPONSE_HEADER: &[u8; 4] = b"LRES";

/// One candidate UDP address for a peer
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub addr: SocketAddr,
    pub last_contact: Instant,
    pub last_ping: Instant,
    pub last_latency_query: Instant,
    pub latency: Option<Duration>,
    pub broken: bool,
    missed: u32,
}

impl Endpoint {
    pub fn new(addr: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            addr,
            last_contact: now,
            last_ping: now,
            // Backdate so the first probe fires immediately
            last_latency_query: now.checked_sub(LATENCY_REQUEST_INTERVAL).unwrap_or(now),
            latency: None,
            broken: false,
            missed: 0,
        }
    }

    /// Whether a latency probe is due
    pub fn probe_due(&self) -> bool {
        !self.broken && self.last_latency_query.elapsed() >= LATENCY_REQUEST_INTERVAL
    }

    /// Note that a probe was sent; counts toward the missed limit
    /// until a reply arrives.
    pub fn probe_sent(&mut self) {
        self.last_latency_query = Instant::now();
        self.missed += 1;
        if self.missed > MISSED_PROBE_LIMIT {
            self.broken = true;
        }
    }

    /// Record a measured round trip
    pub fn record_latency(&mut self, rtt: Duration) {
        self.latency = Some(rtt);
        self.missed = 0;
        self.record_contact();
    }

    /// Whether a liveness ping is due
    pub fn ping_due(&self) -> bool {
        !self.broken && self.last_ping.elapsed() >= XPEER_PING_INTERVAL
    }

    pub fn ping_sent(&mut self) {
        self.last_ping = Instant::now();
    }

    /// Any valid datagram through this endpoint refreshes contact
    pub fn record_contact(&mut self) {
        self.last_contact = Instant::now();
        self.last_ping = Instant::now();
    }

    /// Had traffic within `window`
    pub fn fresh_within(&self, window: Duration) -> bool {
        self.last_contact.elapsed() <= window
    }
}

/// Bounded candidate collection; the primary endpoint is a derived
/// view, never stored separately.
#[derive(Debug, Clone, Default)]
pub struct EndpointSet {
    endpoints: Vec<Endpoint>,
}

impl EndpointSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the candidate set. Broken flags reset with the new
    /// episode; known addresses keep their measurements.
    pub fn install(&mut self, addrs: impl IntoIterator<Item = SocketAddr>) {
        let mut next = Vec::new();
        for addr in addrs {
            if next.len() >= MAX_CANDIDATES {
                break;
            }
            match self.endpoints.iter().find(|e| e.addr == addr) {
                Some(existing) => {
                    let mut kept = existing.clone();
                    kept.broken = false;
                    kept.missed = 0;
                    next.push(kept);
                }
                None => next.push(Endpoint::new(addr)),
            }
        }
        self.endpoints = next;
    }

    /// Add a single learned address if there is room
    pub fn learn(&mut self, addr: SocketAddr) {
        if self.endpoints.iter().any(|e| e.addr == addr) {
            return;
        }
        if self.endpoints.len() < MAX_CANDIDATES {
            self.endpoints.push(Endpoint::new(addr));
        }
    }

    /// The best usable endpoint: lowest latency among non-broken
    /// candidates with recent traffic; when none is recent, the one
    /// contacted last.
    pub fn best(&self) -> Option<&Endpoint> {
        let live = self
            .endpoints
            .iter()
            .filter(|e| !e.broken && e.fresh_within(LATENCY_REQUEST_INTERVAL))
            .min_by_key(|e| e.latency.unwrap_or(Duration::MAX));
        live.or_else(|| {
            self.endpoints
                .iter()
                .filter(|e| !e.broken)
                .min_by_key(|e| e.last_contact.elapsed())
        })
    }

    pub fn get_mut(&mut self, addr: SocketAddr) -> Option<&mut Endpoint> {
        self.endpoints.iter_mut().find(|e| e.addr == addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Endpoint> {
        self.endpoints.iter_mut()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// True when every candidate is broken (and at least one exists)
    pub fn all_broken(&self) -> bool {
        !self.endpoints.is_empty() && self.endpoints.iter().all(|e| e.broken)
    }
}

/// Parsed latency request/reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatencyPacket {
    pub kind: LatencyKind,
    /// The endpoint being measured, packed as ip4 + port
    pub endpoint: SocketAddrV4,
    /// Requester's id
    pub id: String,
    /// Requester's wallclock nanos, echoed verbatim
    pub timestamp: u128,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyKind {
    Request,
    Response,
}

impl LatencyPacket {
    pub fn request(endpoint: SocketAddrV4, id: &str, timestamp: u128) -> Self {
        Self {
            kind: LatencyKind::Request,
            endpoint,
            id: id.to_owned(),
            timestamp,
        }
    }

    /// Turn a request into the reply that travels back
    pub fn into_response(mut self) -> Self {
        self.kind = LatencyKind::Response;
        self
    }

    /// Serialize: header(4) + ip4(4) + port(2) + id(36) + nanos(16)
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + 6 + ID_LENGTH + 16);
        match self.kind {
            LatencyKind::Request => buf.put_slice(LATENCY_REQUEST_HEADER),
            LatencyKind::Response => buf.put_slice(LATENCY_RESPONSE_HEADER),
        }
        buf.put_slice(&self.endpoint.ip().octets());
        buf.put_u16(self.endpoint.port());
        buf.put_slice(self.id.as_bytes());
        buf.put_u128(self.timestamp);
        buf.freeze()
    }

    pub fn parse(mut payload: Bytes) -> NetResult<Self> {
        if payload.len() != 4 + 6 + ID_LENGTH + 16 {
            return Err(NetError::Framing(format!(
                "latency payload has {} bytes",
                payload.len()
            )));
        }
        let mut header = [0u8; 4];
        payload.copy_to_slice(&mut header);
        let kind = match &header {
            LATENCY_REQUEST_HEADER => LatencyKind::Request,
            LATENCY_RESPONSE_HEADER => LatencyKind::Response,
            _ => return Err(NetError::Framing("bad latency header".into())),
        };
        let mut ip = [0u8; 4];
        payload.copy_to_slice(&mut ip);
        let port = payload.get_u16();
        let mut id = vec![0u8; ID_LENGTH];
        payload.copy_to_slice(&mut id);
        let id = String::from_utf8(id)
            .map_err(|_| NetError::Framing("latency id is not utf-8".into()))?;
        let timestamp = payload.get_u128();
        Ok(Self {
            kind,
            endpoint: SocketAddrV4::new(Ipv4Addr::from(ip), port),
            id,
            timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn latency_packet_roundtrip() {
        let id = "0f8fad5b-d9cb-469f-a165-70867728950e";
        let pkt = LatencyPacket::request("192.0.2.7:4500".parse().unwrap(), id, 123_456_789);
        let parsed = LatencyPacket::parse(pkt.to_bytes()).unwrap();
        assert_eq!(parsed, pkt);

        let reply = parsed.into_response();
        let parsed = LatencyPacket::parse(reply.to_bytes()).unwrap();
        assert_eq!(parsed.kind, LatencyKind::Response);
        assert_eq!(parsed.timestamp, 123_456_789);
    }

    #[test]
    fn latency_packet_rejects_wrong_size() {
        assert!(LatencyPacket::parse(Bytes::from_static(b"LREQshort")).is_err());
    }

    #[test]
    fn broken_after_missed_probes() {
        let mut e = Endpoint::new(v4("10.0.0.1:3500"));
        for _ in 0..=MISSED_PROBE_LIMIT {
            e.probe_sent();
        }
        assert!(e.broken);
    }

    #[test]
    fn reply_resets_missed_counter() {
        let mut e = Endpoint::new(v4("10.0.0.1:3500"));
        e.probe_sent();
        e.probe_sent();
        e.record_latency(Duration::from_millis(12));
        assert!(!e.broken);
        assert_eq!(e.latency, Some(Duration::from_millis(12)));
    }

    #[test]
    fn best_prefers_unbroken_low_latency() {
        let mut set = EndpointSet::new();
        set.install([v4("10.0.0.1:1"), v4("10.0.0.2:1"), v4("10.0.0.3:1")]);
        set.get_mut(v4("10.0.0.1:1")).unwrap().broken = true;
        set.get_mut(v4("10.0.0.2:1"))
            .unwrap()
            .record_latency(Duration::from_millis(40));
        set.get_mut(v4("10.0.0.3:1"))
            .unwrap()
            .record_latency(Duration::from_millis(8));
        assert_eq!(set.best().unwrap().addr, v4("10.0.0.3:1"));
    }

    #[test]
    fn install_resets_broken_flags() {
        let mut set = EndpointSet::new();
        set.install([v4("10.0.0.1:1")]);
        set.get_mut(v4("10.0.0.1:1")).unwrap().broken = true;
        assert!(set.all_broken());
        set.install([v4("10.0.0.1:1"), v4("10.0.0.2:1")]);
        assert!(!set.all_broken());
        assert!(!set.iter().any(|e| e.broken));
    }

    #[test]
    fn candidate_set_is_bounded() {
        let mut set = EndpointSet::new();
        set.install((0..20).map(|i| v4(&format!("10.0.1.{i}:1"))));
        assert_eq!(set.len(), MAX_CANDIDATES);
        set.learn(v4("10.0.2.1:1"));
        assert_eq!(set.len(), MAX_CANDIDATES);
    }
}
