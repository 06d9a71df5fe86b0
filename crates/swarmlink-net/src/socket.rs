//! Instance UDP socket
//!
//! One socket per instance: a single reader decodes datagrams and
//! hands them to a channel, concurrent sends are safe, and a
//! keep-alive ticker against the echo endpoint learns the externally
//! visible port. Payloads are never interpreted here.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, trace, warn};

use swarmlink_crypto::KeySchedule;

use crate::error::{NetError, NetResult};
use crate::message::{Message, MsgType};
use crate::MAX_DATAGRAM_SIZE;

/// Keep-alive cadence against the echo endpoint
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// How long `wait_remote_port` polls before giving up
const ECHO_DISCOVERY_BUDGET: Duration = Duration::from_secs(3);

/// A decoded datagram with its origin
#[derive(Debug)]
pub struct Datagram {
    pub msg: Message,
    pub from: SocketAddr,
}

/// The instance's UDP socket
pub struct NetSocket {
    socket: Arc<UdpSocket>,
    local_port: u16,
    remote_port: AtomicU16,
    sequence: AtomicU32,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    closed: AtomicBool,
    shutdown: Notify,
}

impl NetSocket {
    /// Bind the socket on the requested port (0 picks an ephemeral
    /// one). Buffer sizes are raised for tunnel traffic.
    pub async fn bind(port: u16) -> NetResult<Arc<Self>> {
        use socket2::{Domain, Protocol, Socket, Type};

        let addr = SocketAddr::from((std::net::Ipv4Addr::UNSPECIFIED, port));
        let raw = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        raw.set_recv_buffer_size(1 << 20)?;
        raw.set_send_buffer_size(1 << 20)?;
        raw.set_nonblocking(true)?;
        raw.bind(&addr.into()).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                NetError::AddrInUse(addr)
            } else {
                NetError::Io(e)
            }
        })?;
        let socket = UdpSocket::from_std(raw.into())?;
        let local_port = socket.local_addr()?.port();
        debug!(port = local_port, "udp socket bound");

        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            local_port,
            remote_port: AtomicU16::new(0),
            sequence: AtomicU32::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        }))
    }

    /// Local (bound) port
    pub fn port(&self) -> u16 {
        self.local_port
    }

    /// Externally visible port learned from the echo endpoint; falls
    /// back to the local port after discovery expires
    pub fn remote_port(&self) -> u16 {
        self.remote_port.load(Ordering::Relaxed)
    }

    /// Bytes written to the wire so far
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Bytes received from the wire so far
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Next outgoing sequence number
    pub fn next_sequence(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Seal and send one message as a single datagram. Returns the
    /// bytes written.
    pub async fn send_message(
        &self,
        msg: &Message,
        schedule: &KeySchedule,
        addr: SocketAddr,
    ) -> NetResult<usize> {
        let wire = msg.encode(self.next_sequence(), schedule)?;
        self.send_raw(&wire, addr).await
    }

    /// Send pre-encoded wire bytes
    pub async fn send_raw(&self, wire: &Bytes, addr: SocketAddr) -> NetResult<usize> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(NetError::SocketClosed);
        }
        let written = self.socket.send_to(wire, addr).await?;
        self.bytes_sent.fetch_add(written as u64, Ordering::Relaxed);
        trace!(bytes = written, %addr, "datagram sent");
        Ok(written)
    }

    /// Spawn the single reader. Decoded datagrams go to `tx`; echo
    /// replies are consumed here to learn the external port. Malformed
    /// datagrams are dropped and the loop continues.
    pub fn spawn_listener(self: &Arc<Self>, tx: mpsc::Sender<Datagram>) -> JoinHandle<()> {
        let sock = Arc::clone(self);
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                if sock.closed.load(Ordering::Relaxed) {
                    break;
                }
                let (len, from) = tokio::select! {
                    _ = sock.shutdown.notified() => break,
                    res = sock.socket.recv_from(&mut buf) => match res {
                        Ok(pair) => pair,
                        Err(e) => {
                            if sock.closed.load(Ordering::Relaxed) {
                                break;
                            }
                            warn!("socket receive error: {e}");
                            continue;
                        }
                    },
                };
                sock.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
                let msg = match Message::decode(Bytes::copy_from_slice(&buf[..len])) {
                    Ok(msg) => msg,
                    Err(e) => {
                        trace!(%from, "dropping datagram: {e}");
                        continue;
                    }
                };
                if sock.absorb_echo_reply(&msg) {
                    continue;
                }
                if tx.send(Datagram { msg, from }).await.is_err() {
                    debug!("datagram channel closed, reader stopping");
                    break;
                }
            }
            debug!("socket reader stopped");
        })
    }

    /// Echo replies are `Ping` datagrams whose payload is the observed
    /// source port.
    fn absorb_echo_reply(&self, msg: &Message) -> bool {
        if msg.msg_type != MsgType::Ping || msg.payload.len() != 2 {
            return false;
        }
        let port = msg.payload.clone().get_u16();
        if port != 0 {
            self.remote_port.store(port, Ordering::Relaxed);
            debug!(port, "external port learned from echo");
        }
        true
    }

    /// Spawn the keep-alive ticker toward the echo endpoint
    pub fn spawn_keepalive(self: &Arc<Self>, target: String) -> JoinHandle<()> {
        let sock = Arc::clone(self);
        tokio::spawn(async move {
            let target = match tokio::net::lookup_host(target.as_str()).await {
                Ok(mut addrs) => match addrs.find(|a| a.is_ipv4()) {
                    Some(addr) => addr,
                    None => {
                        warn!(%target, "echo target has no IPv4 address");
                        return;
                    }
                },
                Err(e) => {
                    warn!(%target, "cannot resolve echo target: {e}");
                    return;
                }
            };
            let schedule = KeySchedule::new();
            loop {
                if sock.closed.load(Ordering::Relaxed) {
                    break;
                }
                let ping = Message::new(MsgType::Ping, Bytes::new());
                if let Err(e) = sock.send_message(&ping, &schedule, target).await {
                    if sock.closed.load(Ordering::Relaxed) {
                        break;
                    }
                    warn!("keep-alive send failed: {e}");
                }
                tokio::select! {
                    _ = sock.shutdown.notified() => break,
                    _ = sleep(KEEPALIVE_INTERVAL) => {}
                }
            }
            debug!("keep-alive stopped");
        })
    }

    /// Block until the echo endpoint reports our external port, or the
    /// discovery budget expires and the local port is assumed.
    pub async fn wait_remote_port(&self) -> u16 {
        let started = tokio::time::Instant::now();
        while self.remote_port.load(Ordering::Relaxed) == 0 {
            if started.elapsed() > ECHO_DISCOVERY_BUDGET {
                break;
            }
            sleep(Duration::from_millis(100)).await;
        }
        let port = self.remote_port.load(Ordering::Relaxed);
        if port == 0 {
            warn!(
                port = self.local_port,
                "no echo reply, assuming local port is visible"
            );
            self.remote_port.store(self.local_port, Ordering::Relaxed);
            return self.local_port;
        }
        port
    }

    /// Stop reader and keep-alive tasks and refuse further sends
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.shutdown.notify_waiters();
    }
}
