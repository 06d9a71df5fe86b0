//! swarmlink daemon
//!
//! Joins one swarm and bridges the local virtual device into it. The
//! platform device driver attaches through the `TapDevice` trait; this
//! binary wires the in-memory device, which is enough for dry runs and
//! relay-only deployments.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use swarmlink_core::{Instance, InstanceConfig};
use swarmlink_net::MemoryTap;

/// swarmlink - peer-to-peer virtual networks
#[derive(Parser)]
#[command(name = "swarmlinkd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a swarm and run until interrupted
    Start {
        /// Swarm hash to join
        #[arg(long)]
        hash: String,

        /// Overlay IP: "dhcp", "discover" or a literal address
        /// (optionally CIDR; bare addresses get /24)
        #[arg(long, default_value = "dhcp")]
        ip: String,

        /// Virtual device name (generated when omitted)
        #[arg(long)]
        device: Option<String>,

        /// Hardware address (generated when omitted)
        #[arg(long)]
        mac: Option<String>,

        /// Literal swarm key; overrides the keyfile
        #[arg(long)]
        key: Option<String>,

        /// Keyfile with `base64(key) ttl` records
        #[arg(long)]
        keyfile: Option<PathBuf>,

        /// Lifetime of the literal key
        #[arg(long)]
        ttl: Option<String>,

        /// Bootstrap rendezvous host:port
        #[arg(long)]
        target: Option<String>,

        /// Skip local-subnet candidates during discovery
        #[arg(long)]
        forward: bool,

        /// UDP port (0 picks an ephemeral one)
        #[arg(long, default_value = "0")]
        port: u16,

        /// Preferred outbound address
        #[arg(long)]
        outbound_ip: Option<Ipv4Addr>,
    },

    /// Generate a swarm key suitable for a keyfile
    Genkey,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Start {
            hash,
            ip,
            device,
            mac,
            key,
            keyfile,
            ttl,
            target,
            forward,
            port,
            outbound_ip,
        } => {
            let config = InstanceConfig {
                mac,
                hash,
                keyfile,
                key,
                ttl,
                target,
                forward_mode: forward,
                port,
                outbound_ip,
            };
            run_instance(config, ip, device.as_deref()).await
        }
        Commands::Genkey => {
            use base64::prelude::*;
            use rand::RngCore;
            let mut material = [0u8; 32];
            rand::rngs::OsRng.fill_bytes(&mut material);
            println!("{} default", BASE64_STANDARD.encode(material));
            Ok(())
        }
    }
}

async fn run_instance(config: InstanceConfig, ip: String, device: Option<&str>) -> Result<()> {
    let tap = Arc::new(MemoryTap::new(device.unwrap_or("swl0")));
    let instance = Instance::new(config, tap)
        .await
        .context("failed to create instance")?;

    instance
        .prepare_interface(&ip, device)
        .await
        .context("failed to prepare the virtual interface")?;

    let runner = {
        let instance = Arc::clone(&instance);
        tokio::spawn(async move { instance.run().await })
    };

    tokio::signal::ctrl_c().await.ok();
    info!("interrupt received, shutting down");
    instance.close().await.context("shutdown failed")?;

    match runner.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("run loop ended with error: {e}"),
        Err(e) => warn!("run loop panicked: {e}"),
    }
    Ok(())
}
