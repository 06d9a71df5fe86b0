//! Cooperative overlay address discovery
//!
//! With no DHCP-style authority, a member that started in discover
//! mode asks its first connected peer for the swarm subnet, then walks
//! candidate host addresses from the top of the /24 down, claiming the
//! first one nobody answers for.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

use swarmlink_net::TapDevice;

use crate::bridge::Comm;
use crate::error::{CoreError, CoreResult};
use crate::instance::Instance;
use crate::{registry, IP_PROBE_INTERVAL, SUBNET_WAIT};

/// Candidate order: `.255` down to `.1`
pub fn candidate_order(subnet: Ipv4Addr) -> impl Iterator<Item = Ipv4Addr> {
    let [a, b, c, _] = subnet.octets();
    (1..=255u8).rev().map(move |host| Ipv4Addr::new(a, b, c, host))
}

/// Run the discovery protocol once. Returns the installed address.
pub(crate) async fn run(instance: &Arc<Instance>) -> CoreResult<Ipv4Addr> {
    let device = Arc::clone(instance.device());
    info!("discovering overlay address for this swarm");
    device.set_subnet(None);
    device.set_ip(None);

    let own = instance.member_id().await;
    let (claims_tx, mut claims_rx) = mpsc::unbounded_channel();
    instance.set_claims_sink(Some(claims_tx));

    // Ask every connected member which subnet this swarm uses
    instance
        .broadcast_comm(Comm::IpSubnet {
            id: own.clone(),
            subnet: None,
        })
        .await;

    let deadline = Instant::now() + SUBNET_WAIT;
    let subnet = loop {
        if let Some(subnet) = device.subnet() {
            break subnet;
        }
        if Instant::now() >= deadline {
            warn!("no subnet answer, deconfiguring device");
            device.deconfigure();
            instance.set_claims_sink(None);
            // Give the rendezvous another chance to issue an address
            instance.rendezvous().send_dhcp(None, None).await.ok();
            return Err(CoreError::ReconcileFailed(
                "no subnet information received".into(),
            ));
        }
        sleep(Duration::from_millis(100)).await;
    };
    info!(%subnet, "swarm subnet received");

    for candidate in candidate_order(subnet) {
        // Stale claims from earlier candidates must not count
        while claims_rx.try_recv().is_ok() {}

        debug!(%candidate, "probing candidate address");
        instance
            .broadcast_comm(Comm::IpInfo {
                id: own.clone(),
                candidate,
            })
            .await;

        let mut claimed = false;
        let window_end = Instant::now() + IP_PROBE_INTERVAL;
        loop {
            let Some(remaining) = window_end.checked_duration_since(Instant::now()) else {
                break;
            };
            match timeout(remaining, claims_rx.recv()).await {
                Ok(Some(addr)) if addr == candidate => {
                    claimed = true;
                    break;
                }
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => break,
            }
        }
        if claimed {
            debug!(%candidate, "candidate is taken");
            continue;
        }

        // Nobody claimed it; install
        instance.set_claims_sink(None);
        device.set_ip(Some(candidate));
        device.set_mask(Some(Ipv4Addr::new(255, 255, 255, 0)));
        device.mark_configured();
        registry::set_ip(instance.owner(), candidate)?;
        instance.mark_configured();
        info!(%candidate, "overlay address installed");

        instance
            .broadcast_comm(Comm::IpSet {
                id: own,
                ip: candidate,
            })
            .await;
        return Ok(candidate);
    }

    instance.set_claims_sink(None);
    device.deconfigure();
    Err(CoreError::ReconcileFailed(
        "every candidate address is claimed".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_walk_down_from_255() {
        let order: Vec<Ipv4Addr> = candidate_order("10.1.0.0".parse().unwrap()).collect();
        assert_eq!(order.len(), 255);
        assert_eq!(order[0], "10.1.0.255".parse::<Ipv4Addr>().unwrap());
        assert_eq!(order[1], "10.1.0.254".parse::<Ipv4Addr>().unwrap());
        assert_eq!(*order.last().unwrap(), "10.1.0.1".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn candidates_keep_the_subnet() {
        for candidate in candidate_order("192.168.44.0".parse().unwrap()) {
            assert_eq!(candidate.octets()[..3], [192, 168, 44]);
        }
    }
}
