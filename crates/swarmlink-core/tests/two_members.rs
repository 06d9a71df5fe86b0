//! Multi-member scenarios over loopback
//!
//! A stub rendezvous assigns ids and announces peers; the instances
//! then handshake, tunnel frames, reconcile addresses and shut down
//! against real UDP sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::time::sleep;

use swarmlink_core::{Instance, InstanceConfig, PeerAnnounce};
use swarmlink_net::tap::{MacAddr, TapFrame};
use swarmlink_net::{MemoryTap, TapDevice};

mod stub {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use swarmlink_core::RendezvousPacket;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;

    /// Minimal rendezvous: assigns a fixed id per connection (in
    /// accept order) and pushes whatever the test asks it to.
    pub struct StubRendezvous {
        pub addr: SocketAddr,
        writers: Arc<Mutex<Vec<OwnedWriteHalf>>>,
    }

    impl StubRendezvous {
        pub async fn start(ids: Vec<String>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let writers: Arc<Mutex<Vec<OwnedWriteHalf>>> = Arc::new(Mutex::new(Vec::new()));
            let accepting = Arc::clone(&writers);
            tokio::spawn(async move {
                for id in ids {
                    let Ok((stream, _)) = listener.accept().await else {
                        return;
                    };
                    let (mut read, mut write) = stream.into_split();
                    if read_packet(&mut read).await.is_none() {
                        return; // expected Hello
                    }
                    write_packet(&mut write, &RendezvousPacket::Assigned { id }).await;
                    accepting.lock().await.push(write);
                    // Keep draining queries so the client never blocks
                    tokio::spawn(async move {
                        while read_packet(&mut read).await.is_some() {}
                    });
                }
            });
            Self { addr, writers }
        }

        /// Send a Peers frame to the n-th accepted connection
        pub async fn announce(&self, conn: usize, peers: Vec<swarmlink_core::PeerAnnounce>) {
            let packet = RendezvousPacket::Peers { peers };
            loop {
                {
                    let mut writers = self.writers.lock().await;
                    if let Some(writer) = writers.get_mut(conn) {
                        write_packet(writer, &packet).await;
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }

    async fn read_packet(read: &mut OwnedReadHalf) -> Option<RendezvousPacket> {
        let mut len = [0u8; 4];
        read.read_exact(&mut len).await.ok()?;
        let mut frame = vec![0u8; u32::from_be_bytes(len) as usize];
        read.read_exact(&mut frame).await.ok()?;
        bincode::deserialize(&frame).ok()
    }

    async fn write_packet(write: &mut OwnedWriteHalf, packet: &RendezvousPacket) {
        let frame = bincode::serialize(packet).unwrap();
        let _ = write.write_all(&(frame.len() as u32).to_be_bytes()).await;
        let _ = write.write_all(&frame).await;
    }
}

const ID_A: &str = "aaaaaaaa-1111-4111-8111-111111111111";
const ID_B: &str = "bbbbbbbb-2222-4222-8222-222222222222";
const ID_C: &str = "cccccccc-3333-4333-8333-333333333333";

const MAC_A: &str = "06:0a:0a:0a:0a:0a";
const MAC_B: &str = "06:0b:0b:0b:0b:0b";
const MAC_C: &str = "06:0c:0c:0c:0c:0c";

fn loopback(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}

fn announce(id: &str, port: u16) -> PeerAnnounce {
    PeerAnnounce {
        id: id.to_owned(),
        endpoints: vec![loopback(port)],
        removed: false,
    }
}

fn config(hash: &str, mac: &str, target: SocketAddr) -> InstanceConfig {
    InstanceConfig {
        mac: Some(mac.to_owned()),
        hash: hash.to_owned(),
        key: Some("shared integration key".to_owned()),
        target: Some(target.to_string()),
        ..Default::default()
    }
}

/// Ethernet frame with the given addressing
fn frame(dst: &str, src: &str, ethertype: u16, payload: &[u8]) -> TapFrame {
    let dst: MacAddr = dst.parse().unwrap();
    let src: MacAddr = src.parse().unwrap();
    let mut data = Vec::with_capacity(14 + payload.len());
    data.extend_from_slice(&dst.octets());
    data.extend_from_slice(&src.octets());
    data.extend_from_slice(&ethertype.to_be_bytes());
    data.extend_from_slice(payload);
    TapFrame::new(ethertype, Bytes::from(data))
}

async fn wait_connected(instance: &Arc<Instance>, peer_id: &str, budget: Duration) {
    let deadline = Instant::now() + budget;
    loop {
        let connected = instance
            .peer_summary()
            .await
            .iter()
            .any(|(id, state, _)| id == peer_id && state == "CONNECTED");
        if connected {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "{peer_id} did not reach CONNECTED in time"
        );
        sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn static_members_connect_tunnel_and_shut_down() {
    let stub = stub::StubRendezvous::start(vec![ID_A.into(), ID_B.into()]).await;

    let tap_a = Arc::new(MemoryTap::new("swlita"));
    let tap_b = Arc::new(MemoryTap::new("swlitb"));

    let a = Instance::new(config("itest-static", MAC_A, stub.addr), tap_a.clone())
        .await
        .unwrap();
    let b = Instance::new(config("itest-static", MAC_B, stub.addr), tap_b.clone())
        .await
        .unwrap();

    a.prepare_interface("10.93.0.5/24", Some("swlita")).await.unwrap();
    b.prepare_interface("10.93.0.6/24", Some("swlitb")).await.unwrap();

    {
        let a = Arc::clone(&a);
        tokio::spawn(async move { a.run().await });
    }
    {
        let b = Arc::clone(&b);
        tokio::spawn(async move { b.run().await });
    }

    stub.announce(0, vec![announce(ID_B, b.port())]).await;
    stub.announce(1, vec![announce(ID_A, a.port())]).await;

    wait_connected(&a, ID_B, Duration::from_secs(20)).await;
    wait_connected(&b, ID_A, Duration::from_secs(20)).await;

    // Unicast frame toward B's hardware address traverses the tunnel
    let ip_frame = frame(MAC_B, MAC_A, 0x0800, b"icmp echo request bytes");
    tap_a.inject_frame(ip_frame.clone());

    let deadline = Instant::now() + Duration::from_secs(5);
    let delivered = loop {
        let written = tap_b.take_written();
        if let Some(got) = written.into_iter().find(|f| f.proto == 0x0800) {
            break got;
        }
        assert!(Instant::now() < deadline, "frame never reached B's device");
        sleep(Duration::from_millis(50)).await;
    };
    assert_eq!(delivered.data, ip_frame.data);

    // Broadcast ARP floods every connected member
    let arp = frame("ff:ff:ff:ff:ff:ff", MAC_A, 0x0806, b"who-has 10.93.0.6");
    tap_a.inject_frame(arp.clone());
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if tap_b.take_written().iter().any(|f| f.proto == 0x0806) {
            break;
        }
        assert!(Instant::now() < deadline, "broadcast never reached B");
        sleep(Duration::from_millis(50)).await;
    }

    // Shutdown is idempotent
    b.close().await.unwrap();
    assert!(b.is_ready_to_stop());
    b.close().await.unwrap();
    assert!(b.is_ready_to_stop());

    // A revoked device tears the instance down within the drain bound
    tap_a.break_device();
    let deadline = Instant::now() + Duration::from_secs(8);
    while !a.is_ready_to_stop() {
        assert!(
            Instant::now() < deadline,
            "broken device did not stop the instance"
        );
        sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn discover_member_installs_highest_free_address() {
    let stub = stub::StubRendezvous::start(vec![ID_A.into(), ID_C.into()]).await;

    let tap_a = Arc::new(MemoryTap::new("swlitda"));
    let tap_c = Arc::new(MemoryTap::new("swlitdc"));

    let a = Instance::new(config("itest-discover", MAC_A, stub.addr), tap_a.clone())
        .await
        .unwrap();
    let c = Instance::new(config("itest-discover", MAC_C, stub.addr), tap_c.clone())
        .await
        .unwrap();

    a.prepare_interface("10.97.0.5/24", Some("swlitda")).await.unwrap();
    c.prepare_interface("discover", Some("swlitdc")).await.unwrap();
    assert!(tap_c.is_auto());
    assert_eq!(tap_c.ip(), None);

    {
        let a = Arc::clone(&a);
        tokio::spawn(async move { a.run().await });
    }
    {
        let c = Arc::clone(&c);
        tokio::spawn(async move { c.run().await });
    }

    stub.announce(0, vec![announce(ID_C, c.port())]).await;
    stub.announce(1, vec![announce(ID_A, a.port())]).await;

    wait_connected(&c, ID_A, Duration::from_secs(20)).await;

    // Nobody claims .255, so the walk stops at the first candidate
    let expected: std::net::Ipv4Addr = "10.97.0.255".parse().unwrap();
    let deadline = Instant::now() + Duration::from_secs(15);
    while tap_c.ip() != Some(expected) {
        assert!(
            Instant::now() < deadline,
            "discover member never installed an address (got {:?})",
            tap_c.ip()
        );
        sleep(Duration::from_millis(100)).await;
    }
    assert!(tap_c.is_configured());

    // The IP_SET broadcast updates A's membership table
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let seen = a
            .peer_summary()
            .await
            .iter()
            .any(|(id, _, ip)| id == ID_C && *ip == Some(expected));
        if seen {
            break;
        }
        assert!(Instant::now() < deadline, "A never learned C's address");
        sleep(Duration::from_millis(100)).await;
    }

    a.close().await.unwrap();
    c.close().await.unwrap();
}
