//! Bootstrap rendezvous client
//!
//! One TCP connection to the bootstrap service, carrying
//! length-prefixed bincode frames. The service assigns the instance a
//! 36-character id, issues overlay addresses, lists peers with their
//! candidate endpoints, and tracks relay availability.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::{CoreError, CoreResult};

/// Frames above this are considered hostile and break the link
const MAX_FRAME: u32 = 64 * 1024;

/// One peer as announced by the rendezvous
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerAnnounce {
    pub id: String,
    /// Candidate endpoints, best guesses first
    pub endpoints: Vec<SocketAddr>,
    /// The peer left the swarm; members should drop it
    pub removed: bool,
}

/// Frames exchanged with the rendezvous
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RendezvousPacket {
    // client -> server
    /// First frame after connect: the swarm hash and a locally
    /// generated token the server echoes in `Assigned`
    Hello { hash: String, token: String },
    /// Request (`ip: None`) or report (`ip: Some`) an overlay address
    Dhcp {
        ip: Option<Ipv4Addr>,
        network: Option<(Ipv4Addr, u8)>,
    },
    /// Request the member list
    Find { hash: String },
    /// Request the relay list
    Proxy { hash: String },
    /// Announce which relays this member currently reaches
    ReportProxy { endpoints: Vec<SocketAddr> },

    // server -> client
    /// Our assigned member id (36 chars)
    Assigned { id: String },
    /// Overlay address issued or acknowledged
    Ip { ip: Ipv4Addr, network: (Ipv4Addr, u8) },
    /// Current member list
    Peers { peers: Vec<PeerAnnounce> },
    /// Relay endpoints members may use
    Proxies { endpoints: Vec<SocketAddr> },
    /// Server-side failure note
    Error { message: String },
}

/// Mutable rendezvous-side view of this instance
#[derive(Debug)]
pub struct RendezvousState {
    pub id: String,
    pub ip: Option<Ipv4Addr>,
    pub network: Option<(Ipv4Addr, u8)>,
    pub last_update: Instant,
}

/// Client half of the rendezvous link
pub struct RendezvousClient {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    network_hash: String,
    state: RwLock<RendezvousState>,
}

impl RendezvousClient {
    /// Connect, introduce ourselves with the swarm hash and a fresh
    /// token. The token serves as our id until `Assigned` replaces it.
    pub async fn connect(target: &str, hash: &str) -> CoreResult<Self> {
        let stream = TcpStream::connect(target).await.map_err(|e| {
            CoreError::RendezvousUnreachable(format!("connect {target}: {e}"))
        })?;
        stream.set_nodelay(true).ok();
        let (reader, writer) = stream.into_split();
        let token = generate_token();
        info!(%target, token = %token, "rendezvous link up");

        let client = Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            network_hash: hash.to_owned(),
            state: RwLock::new(RendezvousState {
                id: token.clone(),
                ip: None,
                network: None,
                last_update: Instant::now(),
            }),
        };
        client
            .send(&RendezvousPacket::Hello {
                hash: hash.to_owned(),
                token,
            })
            .await?;
        Ok(client)
    }

    /// Swarm hash this link serves
    pub fn network_hash(&self) -> &str {
        &self.network_hash
    }

    /// Current member id (token until assignment)
    pub async fn id(&self) -> String {
        self.state.read().await.id.clone()
    }

    pub async fn set_id(&self, id: String) {
        self.state.write().await.id = id;
    }

    pub async fn ip(&self) -> Option<Ipv4Addr> {
        self.state.read().await.ip
    }

    pub async fn network(&self) -> Option<(Ipv4Addr, u8)> {
        self.state.read().await.network
    }

    pub async fn set_address(&self, ip: Ipv4Addr, network: (Ipv4Addr, u8)) {
        let mut state = self.state.write().await;
        state.ip = Some(ip);
        state.network = Some(network);
    }

    /// Instant of the last frame received
    pub async fn last_update(&self) -> Instant {
        self.state.read().await.last_update
    }

    pub async fn touch(&self) {
        self.state.write().await.last_update = Instant::now();
    }

    /// Block until one frame arrives. Transport errors break the
    /// caller's read loop.
    pub async fn read(&self) -> CoreResult<RendezvousPacket> {
        let mut reader = self.reader.lock().await;
        let mut len = [0u8; 4];
        reader.read_exact(&mut len).await.map_err(|e| {
            CoreError::RendezvousUnreachable(format!("read: {e}"))
        })?;
        let len = u32::from_be_bytes(len);
        if len > MAX_FRAME {
            return Err(CoreError::RendezvousUnreachable(format!(
                "oversized frame: {len} bytes"
            )));
        }
        let mut frame = vec![0u8; len as usize];
        reader.read_exact(&mut frame).await.map_err(|e| {
            CoreError::RendezvousUnreachable(format!("read: {e}"))
        })?;
        let packet = bincode::deserialize(&frame).map_err(|e| {
            CoreError::RendezvousUnreachable(format!("decode: {e}"))
        })?;
        debug!(?packet, "rendezvous frame");
        Ok(packet)
    }

    async fn send(&self, packet: &RendezvousPacket) -> CoreResult<()> {
        let frame = bincode::serialize(packet).map_err(|e| {
            CoreError::RendezvousUnreachable(format!("encode: {e}"))
        })?;
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&(frame.len() as u32).to_be_bytes())
            .await
            .map_err(|e| CoreError::RendezvousUnreachable(format!("write: {e}")))?;
        writer
            .write_all(&frame)
            .await
            .map_err(|e| CoreError::RendezvousUnreachable(format!("write: {e}")))?;
        Ok(())
    }

    /// Request or report an overlay address
    pub async fn send_dhcp(
        &self,
        ip: Option<Ipv4Addr>,
        network: Option<(Ipv4Addr, u8)>,
    ) -> CoreResult<()> {
        self.send(&RendezvousPacket::Dhcp { ip, network }).await
    }

    /// Request the member list
    pub async fn send_find(&self) -> CoreResult<()> {
        self.send(&RendezvousPacket::Find {
            hash: self.network_hash.clone(),
        })
        .await
    }

    /// Request the relay list
    pub async fn send_proxy(&self) -> CoreResult<()> {
        self.send(&RendezvousPacket::Proxy {
            hash: self.network_hash.clone(),
        })
        .await
    }

    /// Announce the relays we currently reach
    pub async fn send_report_proxy(&self, endpoints: Vec<SocketAddr>) -> CoreResult<()> {
        self.send(&RendezvousPacket::ReportProxy { endpoints }).await
    }

    /// Shut the link down
    pub async fn close(&self) -> CoreResult<()> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await.ok();
        Ok(())
    }
}

/// 36-character hyphenated token in the conventional 8-4-4-4-12
/// layout, used as our identity until the rendezvous assigns one.
pub fn generate_token() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    let hex: Vec<String> = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!(
        "{}-{}-{}-{}-{}",
        hex[..4].join(""),
        hex[4..6].join(""),
        hex[6..8].join(""),
        hex[8..10].join(""),
        hex[10..].join("")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn token_has_id_shape() {
        let token = generate_token();
        assert_eq!(token.len(), crate::ID_LENGTH);
        assert_eq!(token.matches('-').count(), 4);
        assert_ne!(token, generate_token());
    }

    #[tokio::test]
    async fn hello_and_assignment_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            // Read the Hello frame
            let mut len = [0u8; 4];
            stream.read_exact(&mut len).await.unwrap();
            let mut frame = vec![0u8; u32::from_be_bytes(len) as usize];
            stream.read_exact(&mut frame).await.unwrap();
            let hello: RendezvousPacket = bincode::deserialize(&frame).unwrap();
            let token = match hello {
                RendezvousPacket::Hello { hash, token } => {
                    assert_eq!(hash, "deadbeef");
                    token
                }
                other => panic!("expected Hello, got {other:?}"),
            };
            assert_eq!(token.len(), crate::ID_LENGTH);
            // Assign an id
            let reply = bincode::serialize(&RendezvousPacket::Assigned {
                id: "11111111-2222-4333-8444-555555555555".into(),
            })
            .unwrap();
            stream
                .write_all(&(reply.len() as u32).to_be_bytes())
                .await
                .unwrap();
            stream.write_all(&reply).await.unwrap();
        });

        let client = RendezvousClient::connect(&addr.to_string(), "deadbeef")
            .await
            .unwrap();
        let packet = client.read().await.unwrap();
        match packet {
            RendezvousPacket::Assigned { id } => {
                client.set_id(id.clone()).await;
                assert_eq!(client.id().await, id);
            }
            other => panic!("expected Assigned, got {other:?}"),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn queries_reach_the_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut seen = Vec::new();
            for _ in 0..4 {
                let mut len = [0u8; 4];
                stream.read_exact(&mut len).await.unwrap();
                let mut frame = vec![0u8; u32::from_be_bytes(len) as usize];
                stream.read_exact(&mut frame).await.unwrap();
                seen.push(bincode::deserialize::<RendezvousPacket>(&frame).unwrap());
            }
            seen
        });

        let client = RendezvousClient::connect(&addr.to_string(), "cafe")
            .await
            .unwrap();
        client.send_find().await.unwrap();
        client.send_proxy().await.unwrap();
        client
            .send_report_proxy(vec!["198.51.100.1:3500".parse().unwrap()])
            .await
            .unwrap();

        let seen = server.await.unwrap();
        assert!(matches!(seen[0], RendezvousPacket::Hello { .. }));
        assert!(matches!(seen[1], RendezvousPacket::Find { .. }));
        assert!(matches!(seen[2], RendezvousPacket::Proxy { .. }));
        assert!(matches!(seen[3], RendezvousPacket::ReportProxy { .. }));
    }
}
