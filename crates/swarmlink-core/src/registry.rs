//! Process-wide interface registry
//!
//! One daemon may host several instances; this registry tracks which
//! device names and overlay addresses are claimed, keyed by an owner
//! token. Mutation happens only through the owning instance's
//! lifecycle.

use std::net::Ipv4Addr;
use std::sync::Mutex;

use crate::error::{CoreError, CoreResult};
use crate::{DEVICE_BASENAME, MAX_DEVICE_NAME};

#[derive(Debug, Clone)]
struct Entry {
    owner: String,
    device: String,
    ip: Option<Ipv4Addr>,
}

static REGISTRY: Mutex<Vec<Entry>> = Mutex::new(Vec::new());

/// Validate and claim a device name for `owner`. An empty or missing
/// spec generates the first free `swl<N>` name.
pub fn claim_device(owner: &str, name_spec: Option<&str>) -> CoreResult<String> {
    let mut registry = REGISTRY.lock().expect("registry lock");
    let name = match name_spec {
        Some(name) if !name.is_empty() => {
            if name.len() > MAX_DEVICE_NAME {
                return Err(CoreError::ConfigInvalid(format!(
                    "device name {name} exceeds {MAX_DEVICE_NAME} characters"
                )));
            }
            if registry.iter().any(|e| e.device == name) {
                return Err(CoreError::ConfigInvalid(format!(
                    "device name {name} is already in use"
                )));
            }
            name.to_owned()
        }
        _ => {
            let mut i = 0;
            loop {
                let candidate = format!("{DEVICE_BASENAME}{i}");
                if !registry.iter().any(|e| e.device == candidate) {
                    break candidate;
                }
                i += 1;
            }
        }
    };
    registry.retain(|e| e.owner != owner);
    registry.push(Entry {
        owner: owner.to_owned(),
        device: name.clone(),
        ip: None,
    });
    Ok(name)
}

/// Record the overlay address of the owner's device
pub fn set_ip(owner: &str, ip: Ipv4Addr) -> CoreResult<()> {
    let mut registry = REGISTRY.lock().expect("registry lock");
    match registry.iter_mut().find(|e| e.owner == owner) {
        Some(entry) => {
            entry.ip = Some(ip);
            Ok(())
        }
        None => Err(CoreError::ConfigInvalid(format!(
            "owner {owner} holds no device"
        ))),
    }
}

/// Drop the owner's registration entirely. Reports whether an entry
/// existed.
pub fn remove(owner: &str) -> CoreResult<()> {
    let mut registry = REGISTRY.lock().expect("registry lock");
    let before = registry.len();
    registry.retain(|e| e.owner != owner);
    if registry.len() == before {
        return Err(CoreError::UnknownPeer(format!(
            "owner {owner} was not registered"
        )));
    }
    Ok(())
}

/// Whether an overlay address belongs to a local instance device
pub fn is_interface_local(ip: Ipv4Addr) -> bool {
    REGISTRY
        .lock()
        .expect("registry lock")
        .iter()
        .any(|e| e.ip == Some(ip))
}

#[cfg(test)]
mod tests {
    use super::*;

    // The registry is process-global; tests use distinct owners and
    // names so they stay independent of ordering.

    #[test]
    fn claims_and_collides() {
        claim_device("test-owner-a", Some("swltesta")).unwrap();
        let err = claim_device("test-owner-b", Some("swltesta")).unwrap_err();
        assert!(matches!(err, CoreError::ConfigInvalid(_)));
        remove("test-owner-a").unwrap();
    }

    #[test]
    fn rejects_long_names() {
        assert!(claim_device("test-owner-c", Some("a-very-long-device-name")).is_err());
    }

    #[test]
    fn generates_free_names() {
        let name = claim_device("test-owner-d", None).unwrap();
        assert!(name.starts_with(DEVICE_BASENAME));
        let other = claim_device("test-owner-e", Some("")).unwrap();
        assert_ne!(name, other);
        remove("test-owner-d").unwrap();
        remove("test-owner-e").unwrap();
    }

    #[test]
    fn tracks_overlay_addresses() {
        claim_device("test-owner-f", Some("swltestf")).unwrap();
        let ip: Ipv4Addr = "10.99.0.7".parse().unwrap();
        assert!(!is_interface_local(ip));
        set_ip("test-owner-f", ip).unwrap();
        assert!(is_interface_local(ip));
        remove("test-owner-f").unwrap();
        assert!(!is_interface_local(ip));
    }

    #[test]
    fn remove_of_unknown_owner_reports() {
        assert!(matches!(
            remove("never-registered"),
            Err(CoreError::UnknownPeer(_))
        ));
    }

    #[test]
    fn set_ip_requires_claim() {
        assert!(set_ip("nobody", "10.0.0.1".parse().unwrap()).is_err());
    }
}
