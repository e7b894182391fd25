//! UDP advertising + discovery.
//!
//! Periodically multicasts the local branch's 25-byte adv message (send
//! loop) and listens on the same group for peers doing the same
//! (receive loop). Both loops are long-running background tasks spawned
//! onto the owning [`Context`]'s internal `tokio` runtime -- the pattern
//! `Context::io_handle` documents itself for ("continuous RX loop"),
//! already used by `yogi_core::message_transport` for its own fill loop.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use yogi_core::branch::{ADV_MESSAGE_SIZE, LocalBranchInfo, Uuid, wire};
use yogi_transport::context::Context;

use crate::udp::MulticastSocket;

/// Receives advertisement sightings. Implemented by
/// [`crate::connection_manager::ConnectionManager`]; kept as a trait so
/// the advertising loop doesn't need to know about the connection
/// manager's peer registry.
pub trait DiscoveryObserver: Send + Sync + 'static {
    fn on_advertisement(self: Arc<Self>, uuid: Uuid, peer_addr: IpAddr, tcp_port: u16);
}

/// Drives the periodic send loop and the continuous receive loop over a
/// single joined multicast socket.
pub struct Advertising {
    context: Context,
    socket: Arc<MulticastSocket>,
    local_uuid: Uuid,
    adv_message: [u8; ADV_MESSAGE_SIZE],
    running: Arc<AtomicBool>,
}

impl Advertising {
    pub fn new(context: Context, socket: MulticastSocket, local: &LocalBranchInfo) -> Self {
        let adv_message = wire::encode_adv_message(&local.uuid, local.tcp_endpoint.port());
        Self {
            context,
            socket: Arc::new(socket),
            local_uuid: local.uuid,
            adv_message,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Starts the receive loop, and the send loop unless `interval` is
    /// `None` -- a `None` interval means discover-only: the branch still
    /// discovers others but never announces itself.
    pub fn start(&self, interval: Option<Duration>, observer: Arc<dyn DiscoveryObserver>) {
        self.spawn_receive_loop(observer);
        if let Some(interval) = interval {
            self.spawn_send_loop(interval);
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    fn spawn_send_loop(&self, interval: Duration) {
        let socket = Arc::clone(&self.socket);
        let adv_message = self.adv_message;
        let running = Arc::clone(&self.running);
        self.context.io_handle().spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if !running.load(Ordering::Acquire) {
                    break;
                }
                if let Err(err) = socket.send_to_group(&adv_message).await {
                    tracing::warn!(%err, "failed to send advertising message");
                }
            }
        });
    }

    fn spawn_receive_loop(&self, observer: Arc<dyn DiscoveryObserver>) {
        let socket = Arc::clone(&self.socket);
        let local_uuid = self.local_uuid;
        let running = Arc::clone(&self.running);
        self.context.io_handle().spawn(async move {
            let mut buf = [0u8; 256];
            loop {
                if !running.load(Ordering::Acquire) {
                    break;
                }
                match socket.recv_from(&mut buf).await {
                    Ok((n, peer)) => {
                        if n != ADV_MESSAGE_SIZE {
                            tracing::debug!(n, "dropping advertising datagram of unexpected size");
                            continue;
                        }
                        match wire::decode_adv_message(&buf[..n]) {
                            Ok(adv) => {
                                if adv.uuid == local_uuid {
                                    // Our own advertisement looped back via multicast; not a peer.
                                    continue;
                                }
                                Arc::clone(&observer).on_advertisement(adv.uuid, peer.ip(), adv.tcp_port);
                            }
                            Err(err) => {
                                tracing::debug!(code = %err.code(), "dropping malformed advertising datagram");
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!(%err, "advertising socket receive failed, stopping discovery loop");
                        break;
                    }
                }
            }
        });
    }
}
