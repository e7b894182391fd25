//! The peer registry and connection orchestration: reacts to discovery
//! sightings by initiating outbound handshakes, runs the inbound TCP
//! accept loop, and resolves both directions down to a single
//! `Connected`/not-connected state per peer UUID, publishing the branch
//! event sequence (`branch_discovered` -> `branch_queried` ->
//! `connect_finished`) along the way.
//!
//! A background task owns the peer registry behind a mutex, the same
//! shape a worker pool uses for its own bookkeeping, adapted here from
//! worker bookkeeping to peer bookkeeping.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use yogi_core::branch::{BranchInfo, LocalBranchInfo, TimeoutDuration, Uuid};
use serde_json::json;
use yogi_core::events::{BranchEvent, EventBus, EventKind};
use yogi_core::message_transport::MessageTransport;
use yogi_transport::byte_transport::{ByteTransport, ByteTransportConnector, ByteTransportListener};
use yogi_transport::context::{CallContext, Context};
use yogi_transport::error::YogiErrorCode;
use yogi_transport_tcp::{TcpByteTransport, TcpConnector, TcpListener};

use crate::advertising::DiscoveryObserver;
use crate::handshake::{self, RemoteBranchInfo};

const CONNECTION_LOST_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Serializes a full branch record for the `branch_queried`/
/// `connect_finished` event JSON blob. Falls back to `"{}"` on a
/// serialization failure, which should not happen for this type but
/// keeps `publish` infallible either way.
fn branch_info_json(info: &BranchInfo) -> String {
    serde_json::to_string(info).unwrap_or_else(|_| "{}".to_string())
}

enum PeerState {
    Discovered { addr: IpAddr, port: u16, last_seen: Instant },
    Connecting,
    Connected { info: BranchInfo, transport: Arc<MessageTransport<TcpByteTransport>> },
}

/// Owns the peer registry and drives every connection attempt (inbound
/// and outbound) to a settled `Connected` state or a reported failure.
pub struct ConnectionManager {
    context: Context,
    local: LocalBranchInfo,
    events: EventBus,
    connector: TcpConnector,
    peers: Arc<Mutex<HashMap<Uuid, PeerState>>>,
}

impl ConnectionManager {
    pub fn new(context: Context, local: LocalBranchInfo, events: EventBus) -> Arc<Self> {
        Arc::new(Self {
            context,
            local,
            events,
            connector: TcpConnector::new(),
            peers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Starts the inbound TCP accept loop. Skipped entirely under
    /// `ghost_mode`: the branch still advertises a TCP port (so peers
    /// can attempt to reach it), but nothing is listening there, so any
    /// connection attempt fails with the OS's ordinary "connection
    /// refused" rather than a handshake-level rejection.
    pub fn start(self: &Arc<Self>, listener: Option<Arc<TcpListener>>) {
        if let Some(listener) = listener {
            self.spawn_accept_loop(listener);
        }
        self.spawn_connection_lost_monitor();
    }

    /// Names/paths currently in the `Connected` state, for the `Branch`
    /// façade's `connected_peers()` accessor.
    pub fn connected_peers(&self) -> Vec<BranchInfo> {
        self.peers
            .lock()
            .values()
            .filter_map(|state| match state {
                PeerState::Connected { info, .. } => Some(info.clone()),
                _ => None,
            })
            .collect()
    }

    fn io_call_context(&self) -> CallContext {
        match self.local.timeout {
            TimeoutDuration::Infinite => CallContext::infinite(),
            TimeoutDuration::Finite(d) => CallContext::with_timeout(d),
        }
    }

    fn spawn_accept_loop(self: &Arc<Self>, listener: Arc<TcpListener>) {
        let manager = Arc::clone(self);
        self.context.io_handle().spawn(async move {
            loop {
                let ctx = CallContext::infinite();
                match listener.accept(&ctx).await {
                    Ok((transport, _peer_addr)) => {
                        let manager = Arc::clone(&manager);
                        manager.context.io_handle().spawn(async move {
                            manager.run_inbound_handshake(transport).await;
                        });
                    }
                    Err(err) => {
                        tracing::warn!(%err, "tcp accept loop stopped");
                        break;
                    }
                }
            }
        });
    }

    async fn run_inbound_handshake(self: Arc<Self>, transport: TcpByteTransport) {
        let ctx = self.io_call_context();
        let transport = Arc::new(transport);
        match handshake::run_handshake(transport.as_ref(), &self.local, &ctx).await {
            Ok(remote) => self.finalize_handshake(transport, remote, &ctx).await,
            Err(err) => {
                tracing::debug!(code = %err.code(), "inbound handshake failed");
                transport.close().await;
            }
        }
    }

    fn spawn_connection_lost_monitor(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        self.context.io_handle().spawn(async move {
            let mut ticker = tokio::time::interval(CONNECTION_LOST_POLL_INTERVAL);
            loop {
                ticker.tick().await;
                manager.poll_connected_peers_for_errors();
            }
        });
    }

    fn poll_connected_peers_for_errors(&self) {
        let lost: Vec<(Uuid, YogiErrorCode)> = {
            let peers = self.peers.lock();
            peers
                .iter()
                .filter_map(|(uuid, state)| match state {
                    PeerState::Connected { transport, .. } => {
                        transport.last_error().map(|code| (*uuid, code))
                    }
                    _ => None,
                })
                .collect()
        };
        for (uuid, code) in lost {
            self.peers.lock().remove(&uuid);
            self.events.publish(BranchEvent {
                uuid,
                kind: EventKind::ConnectionLost,
                result: Err(code),
                json: "{}".to_string(),
            });
        }
    }

    /// Duplicate-name/path check: compares
    /// `candidate` against this branch's own identity and against every
    /// other peer already `Connected`, since two branches can collide on
    /// their very first connection to each other, not only once a third
    /// peer joins. Only the connection manager has both halves of that
    /// comparison, so the handshake module itself stays ignorant of it.
    /// Excludes `candidate.uuid` itself from the peer scan: discovery is
    /// symmetric, so the same peer's own inbound and outbound handshakes
    /// both land here, and the entry the other one just installed under
    /// that uuid is the same peer, not a collision.
    fn duplicate_of_connected(&self, candidate: &BranchInfo) -> Option<YogiErrorCode> {
        if candidate.name == self.local.name {
            return Some(YogiErrorCode::DuplicateBranchName);
        }
        if candidate.path == self.local.path {
            return Some(YogiErrorCode::DuplicateBranchPath);
        }
        let peers = self.peers.lock();
        for (uuid, state) in peers.iter() {
            if *uuid == candidate.uuid {
                continue;
            }
            if let PeerState::Connected { info, .. } = state {
                if info.name == candidate.name {
                    return Some(YogiErrorCode::DuplicateBranchName);
                }
                if info.path == candidate.path {
                    return Some(YogiErrorCode::DuplicateBranchPath);
                }
            }
        }
        None
    }

    async fn finalize_handshake(
        self: &Arc<Self>,
        transport: Arc<TcpByteTransport>,
        remote: RemoteBranchInfo,
        _ctx: &CallContext,
    ) {
        let uuid = remote.info.uuid;
        self.events.publish(BranchEvent {
            uuid,
            kind: EventKind::BranchQueried,
            result: Ok(()),
            json: branch_info_json(&remote.info),
        });

        // A race between an inbound accept and our own outbound connect
        // to the same peer can both reach this point; the first to
        // install wins, the second's transport is simply closed. This
        // must run before the cross-peer duplicate-name/path check below,
        // since that check's exclusion of `uuid` only guards against a
        // stale in-progress entry, not the already-settled `Connected`
        // state the winner of the race just installed.
        let already_connected = matches!(
            self.peers.lock().get(&uuid),
            Some(PeerState::Connected { .. })
        );
        if already_connected {
            transport.close().await;
            return;
        }

        if let Some(code) = self.duplicate_of_connected(&remote.info) {
            self.events.publish(BranchEvent {
                uuid,
                kind: EventKind::ConnectFinished,
                result: Err(code),
                json: branch_info_json(&remote.info),
            });
            transport.close().await;
            self.peers.lock().remove(&uuid);
            return;
        }

        let message_transport = MessageTransport::new(
            self.context.clone(),
            Arc::clone(&transport),
            self.local.tx_queue_size,
            self.local.rx_queue_size,
            match self.local.timeout {
                TimeoutDuration::Infinite => None,
                TimeoutDuration::Finite(d) => Some(d),
            },
        );
        message_transport.start();

        let json = branch_info_json(&remote.info);
        self.peers.lock().insert(
            uuid,
            PeerState::Connected { info: remote.info.clone(), transport: message_transport },
        );
        self.events.publish(BranchEvent {
            uuid,
            kind: EventKind::ConnectFinished,
            result: Ok(()),
            json,
        });
    }

    fn spawn_outbound_connect(self: &Arc<Self>, uuid: Uuid, addr: IpAddr, port: u16) {
        let manager = Arc::clone(self);
        self.context.io_handle().spawn(async move {
            let ctx = manager.io_call_context();
            let target = yogi_transport::TransportSocketAddr::from(std::net::SocketAddr::new(addr, port));
            match manager.connector.connect(target, &ctx).await {
                Ok(transport) => {
                    let transport = Arc::new(transport);
                    match handshake::run_handshake(transport.as_ref(), &manager.local, &ctx).await {
                        Ok(remote) => manager.finalize_handshake(transport, remote, &ctx).await,
                        Err(err) => {
                            tracing::debug!(%uuid, code = %err.code(), "outbound handshake failed");
                            transport.close().await;
                            manager.peers.lock().remove(&uuid);
                            manager.events.publish(BranchEvent {
                                uuid,
                                kind: EventKind::ConnectFinished,
                                result: Err(err.code()),
                                json: "{}".to_string(),
                            });
                        }
                    }
                }
                Err(err) => {
                    tracing::debug!(%uuid, %addr, %err, "outbound connect failed");
                    manager.peers.lock().remove(&uuid);
                    manager.events.publish(BranchEvent {
                        uuid,
                        kind: EventKind::ConnectFinished,
                        result: Err(err.code()),
                        json: "{}".to_string(),
                    });
                }
            }
        });
    }
}

impl DiscoveryObserver for ConnectionManager {
    fn on_advertisement(self: Arc<Self>, uuid: Uuid, peer_addr: IpAddr, tcp_port: u16) {
        let is_new = {
            let mut peers = self.peers.lock();
            match peers.get_mut(&uuid) {
                Some(PeerState::Discovered { addr, port, last_seen }) => {
                    *addr = peer_addr;
                    *port = tcp_port;
                    *last_seen = Instant::now();
                    false
                }
                Some(_) => false,
                None => {
                    peers.insert(
                        uuid,
                        PeerState::Discovered { addr: peer_addr, port: tcp_port, last_seen: Instant::now() },
                    );
                    true
                }
            }
        };
        if !is_new {
            return;
        }

        self.events.publish(BranchEvent {
            uuid,
            kind: EventKind::BranchDiscovered,
            result: Ok(()),
            json: json!({ "uuid": uuid.to_string(), "tcp_endpoint": format!("{peer_addr}:{tcp_port}") })
                .to_string(),
        });

        if self.local.ghost_mode {
            return;
        }

        self.peers.lock().insert(uuid, PeerState::Connecting);
        self.spawn_outbound_connect(uuid, peer_addr, tcp_port);
    }
}
