//! LinkNet: peer-to-peer chat and file sharing over a local network.
//!
//! The stack, leaves first: a binary message [`codec`], per-connection
//! sessions driven by the [`transport`], UDP multicast [`discovery`], and a
//! chunked [`file_transfer`] protocol on top of the transport. [`chat`]
//! consumes the same inbound stream; [`crypto`] pins the provider interface
//! future wire-level encryption will use.

pub mod chat;
pub mod codec;
pub mod config_models;
pub mod crypto;
pub mod discovery;
pub mod file_transfer;
pub mod models;
mod session;
pub mod transport;

use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use tokio::signal;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::chat::ChatManager;
use crate::config_models::cli_args::Args;
use crate::discovery::PeerDiscovery;
use crate::file_transfer::FileTransferManager;
use crate::transport::Transport;

/// Wire up the full stack and run until interrupted.
pub async fn initialize(args: Args) -> Result<()> {
    let transport = Transport::new();
    transport
        .start(args.port)
        .await
        .with_context(|| format!("failed to start networking on port {}", args.port))?;
    info!("local node id is {}", transport.self_id());

    transport.set_connection_callback(Arc::new(|peer_id, status| {
        info!("peer {peer_id} is now {status}");
    }));
    transport.set_error_callback(Arc::new(|description| {
        warn!("network error: {description}");
    }));

    let chat = ChatManager::new(transport.clone(), args.display_name());
    chat.set_message_callback(Arc::new(|entry| {
        info!("chat from {}: {}", entry.sender_id, entry.content);
    }));

    let file_transfer = FileTransferManager::new(transport.clone());
    file_transfer.set_request_callback(Arc::new(|peer_id, filename, file_size| {
        info!("accepting file {filename} ({file_size} bytes) from peer {peer_id}");
        true
    }));
    file_transfer.set_progress_callback(Arc::new(|peer_id, path, progress| {
        debug!(
            "transfer {} with peer {peer_id}: {:.0}%",
            path.display(),
            progress * 100.0
        );
    }));
    file_transfer.set_completed_callback(Arc::new(|peer_id, path, success, error| {
        if success {
            info!("transfer of {} with peer {peer_id} complete", path.display());
        } else {
            warn!(
                "transfer of {} with peer {peer_id} failed: {error}",
                path.display()
            );
        }
    }));

    let discovery = PeerDiscovery::default();
    if args.auto_connect_enabled() {
        let dialer = transport.clone();
        discovery.set_discovered_callback(Arc::new(move |ip, port| {
            let dialer = dialer.clone();
            tokio::spawn(async move {
                if let Err(e) = dialer.connect(&ip.to_string(), port).await {
                    warn!("could not connect to discovered peer {ip}:{port}: {e}");
                }
            });
        }));
    } else {
        discovery.set_discovered_callback(Arc::new(|ip, port| {
            info!("discovered peer at {ip}:{port} (auto-connect disabled)");
        }));
    }
    // Announce the port we actually bound; relevant when args.port is 0.
    let announce_port = transport
        .local_addr()
        .map(|addr| addr.port())
        .unwrap_or(args.port);
    discovery
        .start(announce_port)
        .context("failed to start peer discovery")?;

    for peer in &args.peers {
        if let Err(e) = transport.connect(&peer.ip().to_string(), peer.port()).await {
            warn!("could not connect to {peer}: {e}");
        }
    }

    info!("linknet ready on port {announce_port}");
    signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");

    discovery.stop().await;
    transport.stop().await;
    Ok(())
}
