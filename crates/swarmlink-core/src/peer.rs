//! Per-peer connection state machine
//!
//! Every peer is owned by exactly one driver task. The driver holds
//! the authoritative [`Peer`] value, consumes events from an inbox,
//! and publishes snapshots to the swarm table after every mutation.
//! Nothing else advances a peer's state.

use std::net::SocketAddr;
use std::sync::Weak;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, trace, warn};

use swarmlink_net::endpoint::EndpointSet;
use swarmlink_net::MacAddr;

use crate::handshake::Introduction;
use crate::instance::Instance;
use crate::{COOLDOWN_PERIOD, DISCOVERY_WINDOW, LIVENESS_WINDOW};

/// Driver wake-up cadence
const DRIVER_TICK: Duration = Duration::from_millis(100);

/// Spacing between hole-punch bursts while connecting
const PUNCH_BURST_INTERVAL: Duration = Duration::from_secs(1);

/// Connection state of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Init,
    RequestedIp,
    RequestingProxy,
    WaitingForProxy,
    WaitingToConnect,
    Connecting,
    Connected,
    Disconnect,
    Stop,
    Cooldown,
}

impl PeerState {
    /// Human-readable state word for logs and status output
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "INITIALIZING",
            Self::RequestedIp => "WAITING_IP",
            Self::RequestingProxy => "REQUESTING_PROXIES",
            Self::WaitingForProxy => "WAITING_PROXIES",
            Self::WaitingToConnect => "WAITING_CONNECTION",
            Self::Connecting => "INITIALIZING_CONNECTION",
            Self::Connected => "CONNECTED",
            Self::Disconnect => "DISCONNECTED",
            Self::Stop => "STOPPED",
            Self::Cooldown => "COOLDOWN",
        }
    }
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `from -> to` is a legal edge of the state machine
pub fn transition_allowed(from: PeerState, to: PeerState) -> bool {
    use PeerState::*;
    if from == to {
        return false;
    }
    // Shutdown, liveness loss and send failure may interrupt anything
    // that is not already terminal or cooling down.
    if to == Disconnect {
        return !matches!(from, Stop | Cooldown);
    }
    matches!(
        (from, to),
        (Init, RequestedIp)
            | (RequestedIp, RequestingProxy)
            | (RequestingProxy, WaitingForProxy)
            | (WaitingForProxy, WaitingToConnect)
            | (WaitingToConnect, Connecting)
            | (Connecting, Connected)
            | (Disconnect, Cooldown)
            | (Cooldown, Init)
            | (Cooldown, Stop)
    )
}

/// Membership record for one remote swarm member
#[derive(Debug, Clone)]
pub struct Peer {
    /// 36-char member id assigned by the rendezvous
    pub id: String,
    /// Hardware address learned from the introduction
    pub hw: Option<MacAddr>,
    /// Overlay IP; `None` until assigned
    pub ip: Option<std::net::Ipv4Addr>,
    /// The peer chooses its address cooperatively
    pub auto_ip: bool,
    pub state: PeerState,
    pub endpoints: EndpointSet,
    /// Relay endpoint this peer is reached through, when direct paths
    /// failed
    pub proxy: Option<SocketAddr>,
    pub last_handshake: Option<Instant>,
    pub last_contact: Instant,
    /// Our address as this peer observes it
    pub observed_external: Option<SocketAddr>,
    /// Flagged removed by the rendezvous
    pub removed: bool,
    pub stop_requested: bool,
}

impl Peer {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            hw: None,
            ip: None,
            auto_ip: false,
            state: PeerState::Init,
            endpoints: EndpointSet::new(),
            proxy: None,
            last_handshake: None,
            last_contact: Instant::now(),
            observed_external: None,
            removed: false,
            stop_requested: false,
        }
    }

    /// Address traffic for this peer should go to right now
    pub fn active_endpoint(&self) -> Option<SocketAddr> {
        self.proxy.or_else(|| self.endpoints.best().map(|e| e.addr))
    }
}

/// Events delivered to a peer's driver
#[derive(Debug)]
pub enum PeerEvent {
    /// An introduction arrived from this peer
    Intro { hs: Introduction, from: SocketAddr },
    /// The peer asks for our introduction
    IntroRequest { from: SocketAddr },
    /// Candidate endpoints offered by the rendezvous
    Endpoints(Vec<SocketAddr>),
    /// A latency reply for one of the peer's endpoints
    LatencyReply { endpoint: SocketAddr, rtt: Duration },
    /// Any valid datagram seen through an endpoint
    Contact { endpoint: SocketAddr },
    /// The peer announced a new overlay address
    IpChanged(std::net::Ipv4Addr),
    /// Control loop asks for due latency probes to be sent
    ProbeEndpoints,
    /// Order the peer toward DISCONNECT
    Disconnect,
    /// The rendezvous flagged this peer removed
    Removed,
}

/// Inbox handle for a running driver
#[derive(Debug, Clone)]
pub struct PeerHandle {
    pub tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerHandle {
    pub fn send(&self, event: PeerEvent) {
        let _ = self.tx.send(event);
    }
}

// NATs allocate mapping slots per burst; only one peer in the whole
// process may be punching at a time.
static HOLE_PUNCH: Mutex<()> = Mutex::const_new(());

/// Guard held across one peer's probe burst
pub type HolePunchTicket<'a> = MutexGuard<'a, ()>;

/// Acquire the process-wide hole-punch serializer
pub async fn hole_punch_ticket() -> HolePunchTicket<'static> {
    HOLE_PUNCH.lock().await
}

/// Owns one peer and drives its state machine
pub struct PeerDriver {
    peer: Peer,
    rx: mpsc::UnboundedReceiver<PeerEvent>,
    instance: Weak<Instance>,
    state_entered: Instant,
    cooldown_until: Option<Instant>,
    last_burst: Option<Instant>,
    relay_bound_at: Option<Instant>,
}

impl PeerDriver {
    /// Spawn the driver task and return its inbox
    pub fn spawn(instance: &Weak<Instance>, peer: Peer) -> PeerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let driver = Self {
            peer,
            rx,
            instance: instance.clone(),
            state_entered: Instant::now(),
            cooldown_until: None,
            last_burst: None,
            relay_bound_at: None,
        };
        tokio::spawn(driver.run());
        PeerHandle { tx }
    }

    async fn run(mut self) {
        info!(peer = %self.peer.id, "peer driver started");
        let mut last_tick = Instant::now();
        loop {
            let Some(instance) = self.instance.upgrade() else {
                break;
            };
            match tokio::time::timeout(DRIVER_TICK, self.rx.recv()).await {
                Ok(Some(event)) => self.handle_event(&instance, event).await,
                Ok(None) => break,
                Err(_) => {}
            }
            if last_tick.elapsed() >= DRIVER_TICK {
                last_tick = Instant::now();
                self.tick(&instance).await;
            }
            if self.peer.state == PeerState::Stop {
                instance.swarm.update(&self.peer).await;
                break;
            }
        }
        debug!(peer = %self.peer.id, "peer driver stopped");
    }

    /// Advance the state machine; illegal edges are refused.
    async fn set_state(&mut self, instance: &Instance, to: PeerState) {
        let from = self.peer.state;
        if from == to {
            return;
        }
        if !transition_allowed(from, to) {
            warn!(peer = %self.peer.id, %from, %to, "refusing illegal state transition");
            return;
        }
        debug!(peer = %self.peer.id, %from, %to, "peer state");
        self.peer.state = to;
        self.state_entered = Instant::now();
        instance.swarm.update(&self.peer).await;
    }

    async fn handle_event(&mut self, instance: &Instance, event: PeerEvent) {
        match event {
            PeerEvent::Intro { hs, from } => self.on_intro(instance, hs, from).await,
            PeerEvent::IntroRequest { from } => {
                self.peer.endpoints.learn(from);
                self.touch_endpoint(from);
                instance.send_introduction(from).await;
                instance.swarm.update(&self.peer).await;
            }
            PeerEvent::Endpoints(addrs) => {
                let addrs = self.filter_candidates(instance, addrs);
                if !addrs.is_empty() {
                    self.peer.endpoints.install(addrs);
                    instance.swarm.update(&self.peer).await;
                }
            }
            PeerEvent::LatencyReply { endpoint, rtt } => {
                if let Some(e) = self.peer.endpoints.get_mut(endpoint) {
                    e.record_latency(rtt);
                }
                self.peer.last_contact = Instant::now();
                instance.swarm.update(&self.peer).await;
            }
            PeerEvent::Contact { endpoint } => {
                self.touch_endpoint(endpoint);
                instance.swarm.update(&self.peer).await;
            }
            PeerEvent::IpChanged(ip) => {
                info!(peer = %self.peer.id, %ip, "peer announced new overlay address");
                self.peer.ip = Some(ip);
                instance.swarm.update(&self.peer).await;
            }
            PeerEvent::ProbeEndpoints => self.probe_endpoints(instance).await,
            PeerEvent::Disconnect => {
                // Peers already cooling down or stopped stay put
                if transition_allowed(self.peer.state, PeerState::Disconnect) {
                    self.set_state(instance, PeerState::Disconnect).await;
                }
            }
            PeerEvent::Removed => {
                self.peer.removed = true;
                if transition_allowed(self.peer.state, PeerState::Disconnect) {
                    self.set_state(instance, PeerState::Disconnect).await;
                }
            }
        }
    }

    async fn on_intro(&mut self, instance: &Instance, hs: Introduction, from: SocketAddr) {
        if hs.id != self.peer.id {
            warn!(peer = %self.peer.id, claimed = %hs.id, "introduction for a different id, ignoring");
            return;
        }
        let first_handshake = self.peer.last_handshake.is_none();
        self.peer.hw = Some(hs.mac);
        self.peer.auto_ip = hs.auto_ip();
        if let Some(ip) = hs.ip {
            self.peer.ip = Some(ip);
        }
        self.peer.observed_external = Some(hs.endpoint);
        self.peer.endpoints.learn(from);
        self.touch_endpoint(from);
        self.peer.last_handshake = Some(Instant::now());

        let was_connected = self.peer.state == PeerState::Connected;
        if self.peer.state == PeerState::WaitingToConnect {
            self.set_state(instance, PeerState::Connecting).await;
        }
        if self.peer.state == PeerState::Connecting {
            self.peer.proxy = self.peer.proxy.filter(|_| self.relay_bound_at.is_some());
            self.set_state(instance, PeerState::Connected).await;
            info!(peer = %self.peer.id, endpoint = %from, "peer connected");
        }
        if !was_connected && first_handshake {
            // Symmetric introduction so the other side learns us too
            instance.send_introduction(from).await;
        }
        instance.swarm.update(&self.peer).await;
    }

    async fn tick(&mut self, instance: &Instance) {
        use PeerState::*;
        match self.peer.state {
            Init => {
                self.cooldown_until = None;
                self.relay_bound_at = None;
                self.set_state(instance, RequestedIp).await;
            }
            RequestedIp => {
                // Candidates or an introduction tell us the peer is
                // worth pursuing further.
                if !self.peer.endpoints.is_empty() || self.peer.ip.is_some() {
                    self.set_state(instance, RequestingProxy).await;
                }
            }
            RequestingProxy => {
                if instance.relays.active().await.is_empty() {
                    instance.request_relays().await;
                }
                self.set_state(instance, WaitingForProxy).await;
            }
            WaitingForProxy => {
                let relays_ready = !instance.relays.active().await.is_empty();
                if relays_ready
                    || !self.peer.endpoints.is_empty()
                    || self.state_entered.elapsed() > Duration::from_secs(3)
                {
                    self.set_state(instance, WaitingToConnect).await;
                }
            }
            WaitingToConnect => {
                if !self.peer.endpoints.is_empty() {
                    self.last_burst = None;
                    self.relay_bound_at = None;
                    self.set_state(instance, Connecting).await;
                }
            }
            Connecting => self.drive_discovery(instance).await,
            Connected => {
                if self.peer.last_contact.elapsed() > LIVENESS_WINDOW {
                    warn!(peer = %self.peer.id, "liveness window expired");
                    self.set_state(instance, Disconnect).await;
                }
            }
            Disconnect => {
                self.peer.proxy = None;
                self.cooldown_until = Some(Instant::now() + COOLDOWN_PERIOD);
                self.set_state(instance, Cooldown).await;
            }
            Cooldown => {
                if self.peer.removed || self.peer.stop_requested || instance.is_shutdown() {
                    self.set_state(instance, Stop).await;
                } else if self.cooldown_until.is_some_and(|t| Instant::now() >= t) {
                    self.set_state(instance, Init).await;
                }
            }
            Stop => {}
        }
    }

    /// Direct-path discovery: burst introduction requests at every
    /// candidate under the process-wide serializer until one answers
    /// with an introduction; fall back to a relay when the window
    /// closes.
    async fn drive_discovery(&mut self, instance: &Instance) {
        let elapsed = self.state_entered.elapsed();

        if elapsed > DISCOVERY_WINDOW && self.relay_bound_at.is_none() {
            match instance.relays.best().await {
                Some(relay) => {
                    warn!(
                        peer = %self.peer.id, %relay,
                        "{}, falling back to relay",
                        crate::CoreError::NoDirectPath(self.peer.id.clone())
                    );
                    self.peer.proxy = Some(relay);
                    self.relay_bound_at = Some(Instant::now());
                    instance.send_intro_request_via(relay, &self.peer.id).await;
                    instance.swarm.update(&self.peer).await;
                }
                None => {
                    if elapsed > DISCOVERY_WINDOW * 2 {
                        warn!(
                            peer = %self.peer.id,
                            "{}",
                            crate::CoreError::AllPathsDown(self.peer.id.clone())
                        );
                        self.set_state(instance, PeerState::Disconnect).await;
                    }
                }
            }
            return;
        }
        if let Some(bound) = self.relay_bound_at {
            if bound.elapsed() > DISCOVERY_WINDOW {
                warn!(peer = %self.peer.id, "relay path produced no introduction");
                self.set_state(instance, PeerState::Disconnect).await;
            }
            return;
        }

        let due = self
            .last_burst
            .map_or(true, |t| t.elapsed() >= PUNCH_BURST_INTERVAL);
        if !due {
            return;
        }
        self.last_burst = Some(Instant::now());

        let targets: Vec<SocketAddr> = self.peer.endpoints.iter().map(|e| e.addr).collect();
        // One burst at a time across the whole process
        let _ticket = hole_punch_ticket().await;
        for addr in targets {
            trace!(peer = %self.peer.id, %addr, "introduction request");
            instance.send_intro_request(addr).await;
        }
    }

    /// Send due latency probes and liveness pings; declare the peer
    /// down when every endpoint is broken.
    async fn probe_endpoints(&mut self, instance: &Instance) {
        let mut latency_due = Vec::new();
        let mut ping_due = Vec::new();
        for e in self.peer.endpoints.iter_mut() {
            if e.probe_due() {
                e.probe_sent();
                latency_due.push(e.addr);
            }
            if e.ping_due() {
                e.ping_sent();
                ping_due.push(e.addr);
            }
        }
        for addr in latency_due {
            instance.send_latency_probe(addr).await;
        }
        for addr in ping_due {
            instance.send_xpeer_ping(addr).await;
        }
        if self.peer.endpoints.all_broken() && self.peer.proxy.is_none() {
            if self.peer.state == PeerState::Connected {
                warn!(peer = %self.peer.id, "every endpoint broken");
                self.set_state(instance, PeerState::Disconnect).await;
            }
        } else {
            instance.swarm.update(&self.peer).await;
        }
    }

    fn touch_endpoint(&mut self, addr: SocketAddr) {
        self.peer.endpoints.learn(addr);
        if let Some(e) = self.peer.endpoints.get_mut(addr) {
            e.record_contact();
        }
        self.peer.last_contact = Instant::now();
    }

    /// In forward mode local-subnet candidates are skipped so traffic
    /// always leaves through the underlay.
    fn filter_candidates(
        &self,
        instance: &Instance,
        addrs: Vec<SocketAddr>,
    ) -> Vec<SocketAddr> {
        if !instance.forward_mode() {
            return addrs;
        }
        addrs
            .into_iter()
            .filter(|a| match a.ip() {
                std::net::IpAddr::V4(ip) => !instance.is_local_subnet(ip),
                std::net::IpAddr::V6(_) => false,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [PeerState; 10] = [
        PeerState::Init,
        PeerState::RequestedIp,
        PeerState::RequestingProxy,
        PeerState::WaitingForProxy,
        PeerState::WaitingToConnect,
        PeerState::Connecting,
        PeerState::Connected,
        PeerState::Disconnect,
        PeerState::Stop,
        PeerState::Cooldown,
    ];

    #[test]
    fn happy_path_is_legal() {
        use PeerState::*;
        let path = [
            Init,
            RequestedIp,
            RequestingProxy,
            WaitingForProxy,
            WaitingToConnect,
            Connecting,
            Connected,
            Disconnect,
            Cooldown,
            Init,
        ];
        for pair in path.windows(2) {
            assert!(
                transition_allowed(pair[0], pair[1]),
                "{} -> {} should be legal",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn anything_can_disconnect_except_terminal_states() {
        use PeerState::*;
        for from in ALL_STATES {
            let allowed = transition_allowed(from, Disconnect);
            match from {
                Stop | Cooldown | Disconnect => assert!(!allowed, "{from} -> DISCONNECT"),
                _ => assert!(allowed, "{from} -> DISCONNECT should be legal"),
            }
        }
    }

    #[test]
    fn cooldown_resolves_to_init_or_stop_only() {
        use PeerState::*;
        for to in ALL_STATES {
            let allowed = transition_allowed(Cooldown, to);
            assert_eq!(allowed, matches!(to, Init | Stop), "COOLDOWN -> {to}");
        }
    }

    #[test]
    fn no_skipping_ahead() {
        use PeerState::*;
        assert!(!transition_allowed(Init, Connected));
        assert!(!transition_allowed(RequestedIp, Connecting));
        assert!(!transition_allowed(WaitingToConnect, Connected));
        assert!(!transition_allowed(Stop, Init));
    }

    #[test]
    fn self_transition_is_refused() {
        for s in ALL_STATES {
            assert!(!transition_allowed(s, s));
        }
    }

    #[test]
    fn active_endpoint_prefers_proxy() {
        let mut peer = Peer::new("0f8fad5b-d9cb-469f-a165-70867728950e");
        peer.endpoints.install(["10.0.0.1:3500".parse().unwrap()]);
        assert_eq!(
            peer.active_endpoint(),
            Some("10.0.0.1:3500".parse().unwrap())
        );
        peer.proxy = Some("198.51.100.1:3500".parse().unwrap());
        assert_eq!(
            peer.active_endpoint(),
            Some("198.51.100.1:3500".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn hole_punch_ticket_is_exclusive() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let concurrent = Arc::clone(&concurrent);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                let _ticket = hole_punch_ticket().await;
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
