//! In-memory device double
//!
//! Behaves like a TAP device over channels: frames injected by a test
//! (or by nothing, in a dry run) come out of `read_frame`, written
//! frames are collected for inspection. Breakage is simulated with a
//! flag.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{NetError, NetResult};
use crate::DEFAULT_MTU;

use super::{MacAddr, TapDevice, TapFrame};

struct Addressing {
    ip: Option<Ipv4Addr>,
    mask: Option<Ipv4Addr>,
    subnet: Option<Ipv4Addr>,
    mac: Option<MacAddr>,
}

/// Channel-backed TAP double
pub struct MemoryTap {
    name: Mutex<String>,
    mtu: u16,
    addressing: Mutex<Addressing>,
    ingress_tx: mpsc::UnboundedSender<TapFrame>,
    ingress_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<TapFrame>>,
    written: Mutex<Vec<TapFrame>>,
    auto: AtomicBool,
    configured: AtomicBool,
    opened: AtomicBool,
    broken: AtomicBool,
}

impl MemoryTap {
    pub fn new(name: impl Into<String>) -> Self {
        let (ingress_tx, ingress_rx) = mpsc::unbounded_channel();
        Self {
            name: Mutex::new(name.into()),
            mtu: DEFAULT_MTU,
            addressing: Mutex::new(Addressing {
                ip: None,
                mask: None,
                subnet: None,
                mac: None,
            }),
            ingress_tx,
            ingress_rx: tokio::sync::Mutex::new(ingress_rx),
            written: Mutex::new(Vec::new()),
            auto: AtomicBool::new(false),
            configured: AtomicBool::new(false),
            opened: AtomicBool::new(false),
            broken: AtomicBool::new(false),
        }
    }

    /// Inject a frame as if the OS wrote it into the device
    pub fn inject_frame(&self, frame: TapFrame) {
        let _ = self.ingress_tx.send(frame);
    }

    /// Frames the instance has written toward the OS
    pub fn take_written(&self) -> Vec<TapFrame> {
        std::mem::take(&mut self.written.lock().expect("written lock"))
    }

    /// Simulate the device node being revoked
    pub fn break_device(&self) {
        self.broken.store(true, Ordering::Relaxed);
    }
}

#[async_trait]
impl TapDevice for MemoryTap {
    fn name(&self) -> String {
        self.name.lock().expect("name lock").clone()
    }

    fn set_name(&self, name: &str) {
        *self.name.lock().expect("name lock") = name.to_owned();
    }

    async fn open(&self) -> NetResult<()> {
        if self.broken.load(Ordering::Relaxed) {
            return Err(NetError::DeviceClosed);
        }
        self.opened.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn configure(&self, lazy: bool) -> NetResult<()> {
        if !self.opened.load(Ordering::Relaxed) {
            return Err(NetError::DeviceClosed);
        }
        if !lazy {
            let addressing = self.addressing.lock().expect("addressing lock");
            if addressing.ip.is_none() {
                return Err(NetError::Framing("no ip to configure".into()));
            }
        }
        Ok(())
    }

    async fn read_frame(&self) -> NetResult<TapFrame> {
        if self.broken.load(Ordering::Relaxed) {
            return Err(NetError::DeviceClosed);
        }
        let mut rx = self.ingress_rx.lock().await;
        match rx.recv().await {
            Some(frame) if frame.data.len() > self.mtu as usize + super::ETHER_HEADER_LEN => {
                Err(NetError::FrameTooBig {
                    size: frame.data.len(),
                    mtu: self.mtu as usize,
                })
            }
            Some(frame) => Ok(frame),
            None => Err(NetError::DeviceClosed),
        }
    }

    async fn write_frame(&self, frame: &TapFrame) -> NetResult<()> {
        if self.broken.load(Ordering::Relaxed) {
            return Err(NetError::DeviceClosed);
        }
        self.written.lock().expect("written lock").push(frame.clone());
        Ok(())
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Relaxed)
    }

    async fn close(&self) -> NetResult<()> {
        self.opened.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn ip(&self) -> Option<Ipv4Addr> {
        self.addressing.lock().expect("addressing lock").ip
    }

    fn set_ip(&self, ip: Option<Ipv4Addr>) {
        self.addressing.lock().expect("addressing lock").ip = ip;
    }

    fn mask(&self) -> Option<Ipv4Addr> {
        self.addressing.lock().expect("addressing lock").mask
    }

    fn set_mask(&self, mask: Option<Ipv4Addr>) {
        self.addressing.lock().expect("addressing lock").mask = mask;
    }

    fn subnet(&self) -> Option<Ipv4Addr> {
        self.addressing.lock().expect("addressing lock").subnet
    }

    fn set_subnet(&self, subnet: Option<Ipv4Addr>) {
        self.addressing.lock().expect("addressing lock").subnet = subnet;
    }

    fn mac(&self) -> Option<MacAddr> {
        self.addressing.lock().expect("addressing lock").mac
    }

    fn set_mac(&self, mac: MacAddr) {
        self.addressing.lock().expect("addressing lock").mac = Some(mac);
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    fn is_auto(&self) -> bool {
        self.auto.load(Ordering::Relaxed)
    }

    fn set_auto(&self, auto: bool) {
        self.auto.store(auto, Ordering::Relaxed);
    }

    fn is_configured(&self) -> bool {
        self.configured.load(Ordering::Relaxed)
    }

    fn mark_configured(&self) {
        self.configured.store(true, Ordering::Relaxed);
    }

    fn deconfigure(&self) {
        self.configured.store(false, Ordering::Relaxed);
        let mut addressing = self.addressing.lock().expect("addressing lock");
        addressing.ip = None;
        addressing.mask = None;
        addressing.subnet = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let tap = MemoryTap::new("swl0");
        tap.open().await.unwrap();

        tap.inject_frame(TapFrame::new(0x0800, Bytes::from_static(b"ingress")));
        let frame = tap.read_frame().await.unwrap();
        assert_eq!(frame.proto, 0x0800);
        assert_eq!(&frame.data[..], b"ingress");

        tap.write_frame(&TapFrame::new(0x0806, Bytes::from_static(b"egress")))
            .await
            .unwrap();
        let written = tap.take_written();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].proto, 0x0806);
    }

    #[tokio::test]
    async fn broken_device_fails_io() {
        let tap = MemoryTap::new("swl0");
        tap.open().await.unwrap();
        tap.break_device();
        assert!(tap.is_broken());
        assert!(tap.read_frame().await.is_err());
        assert!(tap
            .write_frame(&TapFrame::new(0, Bytes::new()))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn oversized_frame_is_survivable_error() {
        let tap = MemoryTap::new("swl0");
        tap.open().await.unwrap();
        let big = vec![0u8; DEFAULT_MTU as usize + 100];
        tap.inject_frame(TapFrame::new(0x0800, big));
        assert!(matches!(
            tap.read_frame().await,
            Err(NetError::FrameTooBig { .. })
        ));
        // Device still usable afterwards
        tap.inject_frame(TapFrame::new(0x0800, Bytes::from_static(b"ok")));
        assert!(tap.read_frame().await.is_ok());
    }

    #[tokio::test]
    async fn configure_requires_ip_unless_lazy() {
        let tap = MemoryTap::new("swl0");
        tap.open().await.unwrap();
        assert!(tap.configure(false).await.is_err());
        assert!(tap.configure(true).await.is_ok());
        tap.set_ip(Some("10.1.0.5".parse().unwrap()));
        assert!(tap.configure(false).await.is_ok());
        tap.deconfigure();
        assert!(tap.ip().is_none());
        assert!(!tap.is_configured());
    }
}
