//! Instance runtime
//!
//! One [`Instance`] per swarm. It owns the UDP socket, the rendezvous
//! link, the relay pool, the membership table and one driver task per
//! peer, and bridges the local layer-2 device into the swarm.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

use swarmlink_crypto::KeySchedule;
use swarmlink_net::endpoint::{LatencyKind, LatencyPacket};
use swarmlink_net::tap::{frame_destination, EtherType, MacAddr, TapDevice, TapFrame};
use swarmlink_net::{Datagram, Message, MsgType, NetError, NetSocket, Reassembler};

use crate::bridge::Comm;
use crate::config::{InstanceConfig, IpSpec};
use crate::error::{CoreError, CoreResult};
use crate::handshake::Introduction;
use crate::peer::{Peer, PeerDriver, PeerEvent, PeerHandle, PeerState};
use crate::relay::RelayManager;
use crate::rendezvous::{RendezvousClient, RendezvousPacket};
use crate::swarm::{Route, SwarmTable};
use crate::{
    reconcile, registry, DHCP_ATTEMPTS, DHCP_WAIT, DISCOVERY_DELAY, ID_LENGTH,
    PEER_DRAIN_TIMEOUT, RENDEZVOUS_STALE, RUN_TICK,
};

/// Relay health checks ride the run tick but fire at most this often
const RELAY_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Per-swarm peer-to-peer instance
pub struct Instance {
    config: InstanceConfig,
    hash: String,
    /// Registry owner token; unique even when several instances of
    /// one swarm share the process
    owner: String,
    crypto: RwLock<KeySchedule>,
    device: Arc<dyn TapDevice>,
    socket: Arc<NetSocket>,
    pub swarm: SwarmTable,
    rendezvous: RendezvousClient,
    pub relays: RelayManager,
    drivers: Mutex<HashMap<String, PeerHandle>>,
    reassembler: Mutex<Reassembler>,
    local_ips: Vec<Ipv4Addr>,
    started_at: Instant,
    configured_at: StdMutex<Option<Instant>>,
    shutdown: AtomicBool,
    ready_to_stop: AtomicBool,
    closing: AtomicBool,
    reconciling: AtomicBool,
    device_reader_started: AtomicBool,
    relay_check_at: StdMutex<Instant>,
    shutdown_notify: tokio::sync::Notify,
    /// While reconciliation runs, address claims land here
    claims: StdMutex<Option<mpsc::UnboundedSender<Ipv4Addr>>>,
}

impl Instance {
    /// Build the instance: validate the hardware address, load keys,
    /// bind the socket, run echo-port discovery and connect the
    /// rendezvous link. The device arrives unopened.
    pub async fn new(
        config: InstanceConfig,
        device: Arc<dyn TapDevice>,
    ) -> CoreResult<Arc<Self>> {
        config.validate()?;
        info!(hash = %config.hash, "starting instance");

        let mac = match config.mac.as_deref() {
            Some(spec) if !spec.is_empty() => {
                let mac: MacAddr = spec
                    .parse()
                    .map_err(|_| CoreError::ConfigInvalid(format!("bad mac: {spec}")))?;
                mac
            }
            _ => {
                let mac = MacAddr::generate();
                debug!(%mac, "generated hardware address");
                mac
            }
        };
        device.set_mac(mac);

        let mut crypto = match config.keyfile.as_deref() {
            Some(path) => KeySchedule::load_keyfile(path)?,
            None => KeySchedule::new(),
        };
        if let Some(key) = config.key.as_deref() {
            crypto.add_literal(key, config.ttl.as_deref().unwrap_or(""))?;
        }
        if crypto.is_enabled() {
            debug!("traffic encryption enabled");
        } else {
            debug!("no swarm key provided, traffic goes out in the clear");
        }

        let socket = NetSocket::bind(config.port).await?;
        let (tx, rx) = mpsc::channel::<Datagram>(1024);
        socket.spawn_listener(tx);
        socket.spawn_keepalive(config.target().to_owned());
        let external = socket.wait_remote_port().await;
        debug!(port = socket.port(), external, "socket ready");

        let rendezvous = RendezvousClient::connect(config.target(), &config.hash).await?;

        let local_ips = discover_local_ips(config.outbound_ip);
        trace!(?local_ips, "local addresses");

        let hash = config.hash.clone();
        let owner = format!("{}@{}", hash, socket.port());
        let instance = Arc::new(Self {
            config,
            hash,
            owner,
            crypto: RwLock::new(crypto),
            device,
            socket,
            swarm: SwarmTable::new(),
            rendezvous,
            relays: RelayManager::new(),
            drivers: Mutex::new(HashMap::new()),
            reassembler: Mutex::new(Reassembler::new()),
            local_ips,
            started_at: Instant::now(),
            configured_at: StdMutex::new(None),
            shutdown: AtomicBool::new(false),
            ready_to_stop: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            reconciling: AtomicBool::new(false),
            device_reader_started: AtomicBool::new(false),
            relay_check_at: StdMutex::new(Instant::now()),
            shutdown_notify: tokio::sync::Notify::new(),
            claims: StdMutex::new(None),
        });
        instance.spawn_message_pump(rx);
        Ok(instance)
    }

    // ---- accessors -----------------------------------------------------

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub(crate) fn owner(&self) -> &str {
        &self.owner
    }

    /// Local UDP port
    pub fn port(&self) -> u16 {
        self.socket.port()
    }

    /// When interface configuration finished, if it has
    pub fn configured_at(&self) -> Option<Instant> {
        *self.configured_at.lock().expect("configured_at lock")
    }

    /// Uptime of this instance
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn device(&self) -> &Arc<dyn TapDevice> {
        &self.device
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    pub fn is_ready_to_stop(&self) -> bool {
        self.ready_to_stop.load(Ordering::Relaxed)
    }

    pub fn forward_mode(&self) -> bool {
        self.config.forward_mode
    }

    pub(crate) fn reconciling(&self) -> bool {
        self.reconciling.load(Ordering::Relaxed)
    }

    /// Our member id (the token until the rendezvous assigns one)
    pub async fn member_id(&self) -> String {
        self.rendezvous.id().await
    }

    /// Whether an address shares a /24 with one of our underlay
    /// addresses
    pub fn is_local_subnet(&self, ip: Ipv4Addr) -> bool {
        self.local_ips
            .iter()
            .any(|local| local.octets()[..3] == ip.octets()[..3])
    }

    pub(crate) fn mark_configured(&self) {
        *self.configured_at.lock().expect("configured_at lock") = Some(Instant::now());
    }

    pub(crate) fn set_claims_sink(&self, sink: Option<mpsc::UnboundedSender<Ipv4Addr>>) {
        *self.claims.lock().expect("claims lock") = sink;
    }

    pub(crate) fn set_reconciling(&self, value: bool) {
        self.reconciling.store(value, Ordering::Relaxed);
    }

    pub(crate) fn rendezvous(&self) -> &RendezvousClient {
        &self.rendezvous
    }

    // ---- interface preparation ----------------------------------------

    /// Resolve the IP specification and bring the device up
    pub async fn prepare_interface(
        self: &Arc<Self>,
        ip_spec: &str,
        name_spec: Option<&str>,
    ) -> CoreResult<()> {
        let name = registry::claim_device(&self.owner, name_spec)?;
        self.device.set_name(&name);

        let spec: IpSpec = ip_spec.parse()?;
        match spec {
            IpSpec::Dhcp => {
                let (ip, network) = self.request_ip().await?;
                self.device.set_ip(Some(ip));
                self.device.set_mask(Some(IpSpec::mask(network.1)));
                self.assign_interface().await
            }
            IpSpec::Discover => {
                self.device.set_auto(true);
                self.device.set_ip(None);
                self.device.set_subnet(None);
                self.assign_interface().await
            }
            IpSpec::Static(ip, prefix) => {
                let network = (network_of(ip, prefix), prefix);
                self.device.set_ip(Some(ip));
                self.device.set_mask(Some(IpSpec::mask(prefix)));
                self.rendezvous.set_address(ip, network).await;
                self.rendezvous.send_dhcp(Some(ip), Some(network)).await?;
                self.assign_interface().await
            }
        }
    }

    /// Ask the rendezvous for an overlay address, three attempts two
    /// seconds apart.
    async fn request_ip(&self) -> CoreResult<(Ipv4Addr, (Ipv4Addr, u8))> {
        for attempt in 1..=DHCP_ATTEMPTS {
            debug!(attempt, "requesting overlay address");
            self.rendezvous.send_dhcp(None, None).await?;
            let deadline = Instant::now() + DHCP_WAIT;
            while Instant::now() < deadline {
                if let (Some(ip), Some(network)) =
                    (self.rendezvous.ip().await, self.rendezvous.network().await)
                {
                    return Ok((ip, network));
                }
                sleep(Duration::from_millis(100)).await;
            }
            info!(attempt, "no address yet, asking again");
        }
        Err(CoreError::RendezvousUnreachable(
            "no dhcp response, swarm may be empty".into(),
        ))
    }

    /// Open and configure the device; register the overlay address.
    /// Idempotent once the device is configured.
    pub async fn assign_interface(&self) -> CoreResult<()> {
        if self.device.is_configured() {
            return Ok(());
        }
        if self.device.ip().is_none() && !self.device.is_auto() {
            return Err(CoreError::ConfigInvalid("no overlay ip provided".into()));
        }
        if self.device.mac().is_none() {
            return Err(CoreError::ConfigInvalid("no hardware address".into()));
        }
        self.device
            .open()
            .await
            .map_err(|e| CoreError::DeviceUnavailable(e.to_string()))?;
        self.device
            .configure(self.device.is_auto())
            .await
            .map_err(|e| CoreError::DeviceUnavailable(e.to_string()))?;
        if let Some(ip) = self.device.ip() {
            registry::set_ip(&self.owner, ip)?;
        }
        if !self.device.is_auto() {
            self.device.mark_configured();
            self.mark_configured();
            debug!(device = %self.device.name(), "interface configured");
        }
        Ok(())
    }

    // ---- main loop -----------------------------------------------------

    /// The control loop; blocks until `close` finishes
    pub async fn run(self: &Arc<Self>) -> CoreResult<()> {
        self.spawn_rendezvous_reader();
        self.rendezvous.send_proxy().await.ok();
        let mut discovery_sent = false;

        loop {
            if self.is_shutdown() {
                if self.is_ready_to_stop() {
                    break;
                }
                sleep(Duration::from_millis(100)).await;
                continue;
            }
            self.sweep_stopped_peers().await;
            self.check_rendezvous().await;
            self.check_relays().await;
            self.check_peers().await;
            self.maybe_start_device_reader();
            if !discovery_sent && self.started_at.elapsed() > DISCOVERY_DELAY {
                discovery_sent = true;
                self.rendezvous.send_find().await.ok();
            }
            if self.device.is_broken() {
                info!(hash = %self.hash, "device broke, shutting the instance down");
                self.close().await?;
            }
            sleep(RUN_TICK).await;
        }
        info!(hash = %self.hash, "instance stopped");
        Ok(())
    }

    /// Drop every peer in the terminal state
    async fn sweep_stopped_peers(&self) {
        let snapshot = self.swarm.get().await;
        for (id, peer) in snapshot {
            if peer.state == PeerState::Stop {
                info!(peer = %id, "removing stopped peer");
                let _ = self.swarm.delete(&id).await;
                self.drivers.lock().await.remove(&id);
            }
        }
    }

    /// 30 s watchdog against a silent rendezvous
    async fn check_rendezvous(&self) {
        if self.rendezvous.last_update().await.elapsed() <= RENDEZVOUS_STALE {
            return;
        }
        debug!("rendezvous idle, requesting peers");
        if self.relays.active().await.is_empty() {
            self.rendezvous.send_proxy().await.ok();
        }
        self.rendezvous.send_find().await.ok();
        self.rendezvous.touch().await;
    }

    /// Probe relay liveness and report membership changes
    async fn check_relays(self: &Arc<Self>) {
        {
            let mut at = self.relay_check_at.lock().expect("relay_check_at lock");
            if at.elapsed() < RELAY_CHECK_INTERVAL {
                return;
            }
            *at = Instant::now();
        }
        for endpoint in self.relays.due_probes().await {
            self.send_latency_probe(endpoint).await;
        }
        if self.relays.take_changes() {
            let active: Vec<SocketAddr> = self
                .relays
                .active()
                .await
                .iter()
                .map(|r| r.endpoint)
                .collect();
            debug!(relays = active.len(), "active relay set changed");
            self.rendezvous.send_report_proxy(active).await.ok();
        }
    }

    /// Trigger latency probes for connected peers and kick off
    /// auto-mode address discovery once the first peer is up.
    async fn check_peers(self: &Arc<Self>) {
        let snapshot = self.swarm.get().await;
        let mut any_connected = false;
        for (id, peer) in &snapshot {
            if peer.state == PeerState::Connected {
                any_connected = true;
                if let Some(handle) = self.drivers.lock().await.get(id) {
                    handle.send(PeerEvent::ProbeEndpoints);
                }
            }
        }
        if any_connected
            && self.device.is_auto()
            && !self.device.is_configured()
            && self.device.ip().is_none()
            && self.device.subnet().is_none()
            && !self.reconciling.swap(true, Ordering::Relaxed)
        {
            let instance = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = reconcile::run(&instance).await {
                    error!("address reconciliation failed: {e}");
                }
                instance.set_reconciling(false);
            });
        }
    }

    fn maybe_start_device_reader(self: &Arc<Self>) {
        if !self.device.is_configured()
            || self.device_reader_started.swap(true, Ordering::Relaxed)
        {
            return;
        }
        let instance = Arc::clone(self);
        tokio::spawn(async move {
            info!(device = %instance.device.name(), "device reader started");
            loop {
                if instance.is_shutdown() {
                    break;
                }
                match instance.device.read_frame().await {
                    Ok(frame) => {
                        let inst = Arc::clone(&instance);
                        tokio::spawn(async move { inst.handle_frame(frame).await });
                    }
                    Err(NetError::FrameTooBig { size, mtu }) => {
                        trace!(size, mtu, "oversized frame skipped");
                    }
                    Err(e) => {
                        if instance.is_shutdown() {
                            break;
                        }
                        error!("device read failed: {e}");
                        instance.close().await.ok();
                        break;
                    }
                }
            }
            debug!("device reader stopped");
        });
    }

    // ---- shutdown ------------------------------------------------------

    /// Stop the instance. Safe to call any number of times; only the
    /// first invocation does work.
    pub async fn close(self: &Arc<Self>) -> CoreResult<()> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(hash = %self.hash, "stopping instance");
        self.shutdown.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_waiters();

        if let Err(e) = registry::remove(&self.owner) {
            debug!("interface registry: {e}");
        }

        for handle in self.drivers.lock().await.values() {
            handle.send(PeerEvent::Disconnect);
        }
        let deadline = Instant::now() + PEER_DRAIN_TIMEOUT;
        while !self.swarm.is_empty().await {
            if Instant::now() >= deadline {
                warn!("peer drain timeout passed");
                break;
            }
            self.sweep_stopped_peers().await;
            sleep(Duration::from_millis(100)).await;
        }

        self.rendezvous.close().await.ok();
        self.socket.close();
        self.device.close().await.ok();
        self.ready_to_stop.store(true, Ordering::SeqCst);
        info!(hash = %self.hash, "instance ready to stop");
        Ok(())
    }

    // ---- rendezvous consumer ------------------------------------------

    fn spawn_rendezvous_reader(self: &Arc<Self>) {
        let instance = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if instance.is_shutdown() {
                    break;
                }
                let packet = tokio::select! {
                    _ = instance.shutdown_notify.notified() => break,
                    result = instance.rendezvous.read() => match result {
                        Ok(packet) => packet,
                        Err(e) => {
                            if !instance.is_shutdown() {
                                warn!("rendezvous link broke: {e}");
                            }
                            break;
                        }
                    },
                };
                instance.handle_rendezvous(packet).await;
            }
            debug!("rendezvous reader stopped");
        });
    }

    async fn handle_rendezvous(self: &Arc<Self>, packet: RendezvousPacket) {
        self.rendezvous.touch().await;
        match packet {
            RendezvousPacket::Assigned { id } => {
                if id.len() != ID_LENGTH {
                    warn!(%id, "rendezvous assigned a malformed id");
                    return;
                }
                info!(%id, "member id assigned");
                self.rendezvous.set_id(id).await;
            }
            RendezvousPacket::Ip { ip, network } => {
                info!(%ip, "overlay address issued");
                self.rendezvous.set_address(ip, network).await;
            }
            RendezvousPacket::Peers { peers } => {
                let own = self.member_id().await;
                for announce in peers {
                    if announce.id == own {
                        continue;
                    }
                    self.upsert_peer(&announce.id, announce.endpoints, announce.removed)
                        .await;
                }
            }
            RendezvousPacket::Proxies { endpoints } => {
                self.relays.add_candidates(endpoints).await;
            }
            RendezvousPacket::Error { message } => warn!(%message, "rendezvous error"),
            other => debug!(?other, "ignoring client-bound frame"),
        }
    }

    /// Create the driver for a newly announced peer or feed an
    /// existing one.
    async fn upsert_peer(
        self: &Arc<Self>,
        id: &str,
        endpoints: Vec<SocketAddr>,
        removed: bool,
    ) {
        let mut drivers = self.drivers.lock().await;
        let handle = match drivers.get(id) {
            Some(handle) => handle.clone(),
            None => {
                info!(peer = %id, "new swarm member");
                let peer = Peer::new(id);
                self.swarm.update(&peer).await;
                let weak: Weak<Instance> = Arc::downgrade(self);
                let handle = PeerDriver::spawn(&weak, peer);
                drivers.insert(id.to_owned(), handle.clone());
                handle
            }
        };
        drop(drivers);
        if !endpoints.is_empty() {
            handle.send(PeerEvent::Endpoints(endpoints));
        }
        if removed {
            handle.send(PeerEvent::Removed);
        }
    }

    // ---- datagram handling --------------------------------------------

    fn spawn_message_pump(self: &Arc<Self>, mut rx: mpsc::Receiver<Datagram>) {
        let instance = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(datagram) = rx.recv().await {
                if instance.is_shutdown() {
                    break;
                }
                let inst = Arc::clone(&instance);
                tokio::spawn(async move {
                    inst.handle_datagram(datagram.msg, datagram.from).await;
                });
            }
            debug!("message pump stopped");
        });
    }

    async fn handle_datagram(self: &Arc<Self>, msg: Message, from: SocketAddr) {
        let msg = {
            let crypto = self.crypto.read().await;
            match msg.open(&crypto) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!(%from, "dropping datagram: {e}");
                    return;
                }
            }
        };
        let msg = match self.reassembler.lock().await.accept(from, msg) {
            Ok(Some(msg)) => msg,
            Ok(None) => return,
            Err(e) => {
                debug!(%from, "dropping fragment: {e}");
                return;
            }
        };
        match msg.msg_type {
            MsgType::Nenc => trace!(%from, "plaintext note: {:?}", msg.payload),
            MsgType::Ping => trace!(%from, "stray ping"),
            MsgType::XpeerPing => self.handle_xpeer_ping(msg, from).await,
            MsgType::Intro => self.handle_intro(msg, from).await,
            MsgType::IntroReq => self.handle_intro_request(msg, from).await,
            MsgType::Proxy => self.handle_proxy(msg, from).await,
            MsgType::Latency => self.handle_latency(msg, from).await,
            MsgType::Comm => self.handle_comm(msg, from).await,
        }
    }

    async fn handle_intro(&self, msg: Message, from: SocketAddr) {
        let record = match std::str::from_utf8(&msg.payload) {
            Ok(s) => s,
            Err(_) => {
                debug!(%from, "introduction is not utf-8");
                return;
            }
        };
        let hs = match Introduction::parse(record) {
            Ok(hs) => hs,
            Err(e) => {
                debug!(%from, "rejecting introduction: {e}");
                return;
            }
        };
        let drivers = self.drivers.lock().await;
        match drivers.get(&hs.id) {
            Some(handle) => handle.send(PeerEvent::Intro { hs, from }),
            None => debug!(id = %hs.id, %from, "introduction from unknown member"),
        }
    }

    async fn handle_intro_request(&self, msg: Message, from: SocketAddr) {
        let Ok(id) = std::str::from_utf8(&msg.payload) else {
            return;
        };
        let drivers = self.drivers.lock().await;
        match drivers.get(id) {
            Some(handle) => handle.send(PeerEvent::IntroRequest { from }),
            None => trace!(%id, %from, "introduction request from unknown member"),
        }
    }

    async fn handle_xpeer_ping(&self, msg: Message, from: SocketAddr) {
        let payload = &msg.payload;
        if payload.len() < 1 + ID_LENGTH {
            return;
        }
        let kind = payload[0];
        let Ok(id) = std::str::from_utf8(&payload[1..1 + ID_LENGTH]) else {
            return;
        };
        let Ok(addr_str) = std::str::from_utf8(&payload[1 + ID_LENGTH..]) else {
            return;
        };
        match kind {
            b'q' => {
                // Answer with our id so the prober can route the reply
                let own = self.member_id().await;
                let mut reply = Vec::with_capacity(payload.len());
                reply.push(b'r');
                reply.extend_from_slice(own.as_bytes());
                reply.extend_from_slice(addr_str.as_bytes());
                self.send_sealed(Message::new(MsgType::XpeerPing, reply), from)
                    .await;
            }
            b'r' => {
                let Ok(endpoint) = addr_str.parse::<SocketAddr>() else {
                    return;
                };
                let drivers = self.drivers.lock().await;
                if let Some(handle) = drivers.get(id) {
                    handle.send(PeerEvent::Contact { endpoint });
                }
            }
            _ => trace!(%from, "unknown xpeer ping marker"),
        }
    }

    async fn handle_latency(self: &Arc<Self>, msg: Message, from: SocketAddr) {
        let packet = match LatencyPacket::parse(msg.payload.clone()) {
            Ok(p) => p,
            Err(e) => {
                debug!(%from, "bad latency payload: {e}");
                return;
            }
        };
        match packet.kind {
            LatencyKind::Request => {
                let mut reply = packet.into_response();
                reply.id = self.member_id().await;
                self.send_sealed(Message::new(MsgType::Latency, reply.to_bytes()), from)
                    .await;
            }
            LatencyKind::Response => {
                let rtt = Duration::from_nanos(
                    now_nanos().saturating_sub(packet.timestamp) as u64
                );
                if self.relays.record_reply(from, rtt).await {
                    return;
                }
                let drivers = self.drivers.lock().await;
                if let Some(handle) = drivers.get(&packet.id) {
                    handle.send(PeerEvent::LatencyReply {
                        endpoint: SocketAddr::V4(packet.endpoint),
                        rtt,
                    });
                }
            }
        }
    }

    /// Relay-wrapped messages: 36-byte destination id, then the inner
    /// wire bytes.
    async fn handle_proxy(self: &Arc<Self>, msg: Message, from: SocketAddr) {
        if msg.payload.len() < ID_LENGTH {
            debug!(%from, "short proxy payload");
            return;
        }
        let Ok(dest) = std::str::from_utf8(&msg.payload[..ID_LENGTH]) else {
            return;
        };
        if dest != self.member_id().await {
            trace!(%dest, "proxy frame for someone else");
            return;
        }
        let inner = msg.payload.slice(ID_LENGTH..);
        match Message::decode(inner) {
            Ok(inner) => Box::pin(self.handle_datagram(inner, from)).await,
            Err(e) => debug!(%from, "bad relayed datagram: {e}"),
        }
    }

    async fn handle_comm(self: &Arc<Self>, msg: Message, from: SocketAddr) {
        let comm = match Comm::decode(msg.payload.clone()) {
            Ok(c) => c,
            Err(e) => {
                debug!(%from, "bad comm payload: {e}");
                return;
            }
        };
        match comm {
            Comm::Frame { proto, frame } => {
                if !self.device.is_configured() {
                    trace!("dropping tunneled frame, device not configured");
                    return;
                }
                let frame = TapFrame::new(proto, frame);
                if let Err(e) = self.device.write_frame(&frame).await {
                    warn!("device write failed: {e}");
                }
            }
            Comm::IpSubnet { subnet: None, .. } => {
                // A member asks which subnet this swarm uses
                if let (Some(ip), Some(mask)) = (self.device.ip(), self.device.mask()) {
                    let own = self.member_id().await;
                    let answer = Comm::IpSubnet {
                        id: own,
                        subnet: Some(network_of_mask(ip, mask)),
                    };
                    self.send_sealed(Message::new(MsgType::Comm, answer.encode()), from)
                        .await;
                }
            }
            Comm::IpSubnet {
                subnet: Some(subnet),
                ..
            } => {
                if self.reconciling() && self.device.subnet().is_none() {
                    info!(%subnet, "swarm subnet learned");
                    self.device.set_subnet(Some(subnet));
                }
            }
            Comm::IpInfo { id, candidate } => {
                let own = self.member_id().await;
                if id == own {
                    // A claim answering our probe
                    if let Some(sink) = self.claims.lock().expect("claims lock").as_ref() {
                        let _ = sink.send(candidate);
                    }
                } else if self.device.ip() == Some(candidate) {
                    // Someone probes an address we own; claim it
                    let claim = Comm::IpInfo { id, candidate };
                    self.send_sealed(Message::new(MsgType::Comm, claim.encode()), from)
                        .await;
                }
            }
            Comm::IpSet { id, ip } => {
                let drivers = self.drivers.lock().await;
                if let Some(handle) = drivers.get(&id) {
                    handle.send(PeerEvent::IpChanged(ip));
                }
            }
        }
    }

    // ---- device ingress ------------------------------------------------

    /// Classify one frame from the device and tunnel it to the right
    /// member(s).
    pub async fn handle_frame(self: &Arc<Self>, frame: TapFrame) {
        let Some(ether) = EtherType::of_frame(&frame.data) else {
            trace!(proto = frame.proto, "unhandled ethertype");
            return;
        };
        let Some(dst) = frame_destination(&frame.data) else {
            return;
        };
        trace!(?ether, %dst, len = frame.data.len(), "frame from device");
        let comm = Comm::Frame {
            proto: frame.proto,
            frame: frame.data.clone(),
        };
        let msg = Message::new(MsgType::Comm, comm.encode());

        if dst.is_multicast() {
            // Broadcast and multicast flood every connected member
            for (_, peer) in self.swarm.get().await {
                if peer.state != PeerState::Connected {
                    continue;
                }
                if let Some(route) = route_of(&peer) {
                    self.send_routed(&route, &msg).await.ok();
                }
            }
            return;
        }
        if let Err(e) = self.send_to(dst, msg).await {
            debug!(%dst, "frame not delivered: {e}");
        }
    }

    // ---- sending -------------------------------------------------------

    /// Send a message to the member owning a hardware address.
    /// An unknown destination is not an error; the tunnel is
    /// best-effort like raw Ethernet.
    pub async fn send_to(&self, dst: MacAddr, msg: Message) -> CoreResult<usize> {
        match self.swarm.route_by_mac(dst).await {
            Some(route) => self.send_routed(&route, &msg).await,
            None => Ok(0),
        }
    }

    /// Send along a resolved route, wrapping for the relay when the
    /// peer is proxied.
    pub(crate) async fn send_routed(&self, route: &Route, msg: &Message) -> CoreResult<usize> {
        match &route.via_relay {
            None => {
                let crypto = self.crypto.read().await;
                Ok(self.socket.send_message(msg, &crypto, route.addr).await?)
            }
            Some(dest_id) => {
                // The relay reads the destination tag, so the wrapper
                // stays plaintext while the inner message is sealed.
                let inner = {
                    let crypto = self.crypto.read().await;
                    msg.encode(self.socket.next_sequence(), &crypto)?
                };
                let mut payload = Vec::with_capacity(ID_LENGTH + inner.len());
                payload.extend_from_slice(dest_id.as_bytes());
                payload.extend_from_slice(&inner);
                let wrapper = Message::new(MsgType::Proxy, payload);
                Ok(self
                    .socket
                    .send_message(&wrapper, &KeySchedule::new(), route.addr)
                    .await?)
            }
        }
    }

    /// Fire-and-forget sealed send used by handlers
    pub(crate) async fn send_sealed(&self, msg: Message, addr: SocketAddr) {
        let crypto = self.crypto.read().await;
        if let Err(e) = self.socket.send_message(&msg, &crypto, addr).await {
            debug!(%addr, "send failed: {e}");
        }
    }

    /// Plaintext send for relay traffic and probes that must stay
    /// readable without swarm keys
    pub(crate) async fn send_plain(&self, msg: Message, addr: SocketAddr) {
        if let Err(e) = self
            .socket
            .send_message(&msg, &KeySchedule::new(), addr)
            .await
        {
            debug!(%addr, "send failed: {e}");
        }
    }

    /// Our introduction record toward `to` (which is also the
    /// observed endpoint we report back).
    pub(crate) async fn send_introduction(&self, to: SocketAddr) {
        let Some(mac) = self.device.mac() else {
            return;
        };
        let hs = Introduction {
            id: self.member_id().await,
            mac,
            ip: if self.device.is_auto() {
                None
            } else {
                self.device.ip()
            },
            endpoint: to,
        };
        self.send_sealed(
            Message::new(MsgType::Intro, Bytes::from(hs.to_record())),
            to,
        )
        .await;
    }

    /// Hole-punch probe: ask for an introduction
    pub(crate) async fn send_intro_request(&self, addr: SocketAddr) {
        let own = self.member_id().await;
        self.send_sealed(
            Message::new(MsgType::IntroReq, Bytes::from(own)),
            addr,
        )
        .await;
    }

    /// Introduction request routed through a relay
    pub(crate) async fn send_intro_request_via(&self, relay: SocketAddr, peer_id: &str) {
        let own = self.member_id().await;
        let msg = Message::new(MsgType::IntroReq, Bytes::from(own));
        let route = Route {
            addr: relay,
            via_relay: Some(peer_id.to_owned()),
        };
        if let Err(e) = self.send_routed(&route, &msg).await {
            debug!(%relay, "relayed intro request failed: {e}");
        }
    }

    /// Peer-to-peer liveness query for one endpoint
    pub(crate) async fn send_xpeer_ping(&self, addr: SocketAddr) {
        let own = self.member_id().await;
        let addr_str = addr.to_string();
        let mut payload = Vec::with_capacity(1 + ID_LENGTH + addr_str.len());
        payload.push(b'q');
        payload.extend_from_slice(own.as_bytes());
        payload.extend_from_slice(addr_str.as_bytes());
        self.send_sealed(Message::new(MsgType::XpeerPing, payload), addr)
            .await;
    }

    /// Latency probe toward one endpoint (peer or relay)
    pub(crate) async fn send_latency_probe(&self, addr: SocketAddr) {
        let SocketAddr::V4(v4) = addr else {
            return;
        };
        let own = self.member_id().await;
        let packet = LatencyPacket::request(v4, &own, now_nanos());
        self.send_plain(Message::new(MsgType::Latency, packet.to_bytes()), addr)
            .await;
    }

    /// Encrypted broadcast to every connected member
    pub(crate) async fn broadcast_comm(&self, comm: Comm) {
        let msg = Message::new(MsgType::Comm, comm.encode());
        for (_, peer) in self.swarm.get().await {
            if peer.state != PeerState::Connected {
                continue;
            }
            if let Some(route) = route_of(&peer) {
                self.send_routed(&route, &msg).await.ok();
            }
        }
    }

    pub(crate) async fn request_relays(&self) {
        self.rendezvous.send_proxy().await.ok();
    }

    /// Inject a fresh key at runtime; datagrams sent afterwards carry
    /// the new epoch.
    pub async fn add_key(&self, key: &str, ttl: &str) -> CoreResult<u16> {
        let mut crypto = self.crypto.write().await;
        Ok(crypto.add_literal(key, ttl)?)
    }

    /// Human-readable peer listing for status output
    pub async fn peer_summary(&self) -> Vec<(String, String, Option<Ipv4Addr>)> {
        self.swarm
            .get()
            .await
            .into_iter()
            .map(|(id, p)| (id, p.state.as_str().to_owned(), p.ip))
            .collect()
    }
}

fn route_of(peer: &Peer) -> Option<Route> {
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

fn now_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

fn network_of(ip: Ipv4Addr, prefix: u8) -> Ipv4Addr {
    let bits = u32::from(ip) & u32::from(IpSpec::mask(prefix));
    Ipv4Addr::from(bits)
}

fn network_of_mask(ip: Ipv4Addr, mask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) & u32::from(mask))
}

/// Usable IPv4 unicast addresses of this host. A connected UDP socket
/// reveals the address the default route uses; no datagram is sent.
fn discover_local_ips(outbound: Option<Ipv4Addr>) -> Vec<Ipv4Addr> {
    let mut ips = Vec::new();
    if let Some(ip) = outbound {
        ips.push(ip);
    }
    if let Ok(probe) = std::net::UdpSocket::bind("0.0.0.0:0") {
        if probe.connect("8.8.8.8:53").is_ok() {
            if let Ok(local) = probe.local_addr() {
                if let IpAddr::V4(ip) = local.ip() {
                    if !ip.is_unspecified() && !ips.contains(&ip) {
                        ips.push(ip);
                    }
                }
            }
        }
    }
    ips
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_helpers() {
        assert_eq!(
            network_of("10.1.0.5".parse().unwrap(), 24),
            "10.1.0.0".parse::<Ipv4Addr>().unwrap()
        );
        assert_eq!(
            network_of_mask(
                "192.168.7.33".parse().unwrap(),
                "255.255.255.0".parse().unwrap()
            ),
            "192.168.7.0".parse::<Ipv4Addr>().unwrap()
        );
    }

    #[test]
    fn route_of_prefers_proxy() {
        let mut peer = Peer::new("peer-x");
        peer.endpoints.install(["10.0.0.1:1".parse().unwrap()]);
        peer.proxy = Some("198.51.100.9:3500".parse().unwrap());
        let route = route_of(&peer).unwrap();
        assert_eq!(route.addr, "198.51.100.9:3500".parse().unwrap());
        assert_eq!(route.via_relay.as_deref(), Some("peer-x"));
    }

    #[test]
    fn local_ip_discovery_honors_outbound_override() {
        let ips = discover_local_ips(Some("172.16.5.4".parse().unwrap()));
        assert_eq!(ips[0], "172.16.5.4".parse::<Ipv4Addr>().unwrap());
    }
}
