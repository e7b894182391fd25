//! The `Branch` composition root: owns a `Context`,
//! the local branch's identity, the UDP advertising/discovery loops, the
//! connection manager, and the branch event bus, and wires them
//! together into the one object an embedder constructs.

use std::sync::Arc;

use yogi_core::branch::{BranchConfig, BranchInfo, LocalBranchInfo, TimeoutDuration};
use yogi_core::events::EventBus;
use yogi_transport::TransportSocketAddr;
use yogi_transport::byte_transport::ByteTransportListener;
use yogi_transport::context::Context;
use yogi_transport::error::YogiError;
use yogi_transport_tcp::TcpListener;

use crate::advertising::Advertising;
use crate::connection_manager::ConnectionManager;
use crate::interfaces::{self, IpVersionFilter};
use crate::udp::MulticastSocket;

/// A running branch: advertises itself, discovers and connects to peers
/// on the same network, and reports the connection lifecycle through
/// [`Branch::events`].
pub struct Branch {
    context: Context,
    local: LocalBranchInfo,
    events: EventBus,
    connection_manager: Arc<ConnectionManager>,
    advertising: Option<Advertising>,
}

impl Branch {
    /// Builds and starts a branch from `config`, binding its TCP
    /// listener (unless `ghost_mode` disables accepting connections)
    /// and joining its configured advertising multicast group.
    pub async fn start(context: Context, config: &BranchConfig) -> Result<Arc<Self>, YogiError> {
        let tcp_bind_addr: std::net::SocketAddr =
            format!("{}:{}", config.tcp_bind_address, config.tcp_bind_port)
                .parse()
                .map_err(|e| {
                    YogiError::with_cause(
                        yogi_transport::error::YogiErrorCode::DeserializeMsgFailed,
                        "invalid tcp_bind_address/tcp_bind_port",
                        std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("{e}")),
                    )
                })?;

        // A port still needs reserving even under ghost_mode, so the
        // branch has something to advertise; the listener is then
        // dropped immediately without ever being started, so the OS
        // naturally refuses any connection attempt that follows.
        let bound_listener = TcpListener::bind(TransportSocketAddr::from(tcp_bind_addr)).await?;
        let tcp_endpoint: std::net::SocketAddr = bound_listener.local_addr()?.into();

        let local = config.build(tcp_endpoint)?;
        let listener = if local.ghost_mode {
            drop(bound_listener);
            None
        } else {
            Some(Arc::new(bound_listener))
        };

        let events = EventBus::new(context.clone());
        let connection_manager = ConnectionManager::new(context.clone(), local.clone(), events.clone());
        connection_manager.start(listener);

        let advertising = Self::start_advertising(&context, &local, Arc::clone(&connection_manager))?;

        Ok(Arc::new(Self {
            context,
            local,
            events,
            connection_manager,
            advertising,
        }))
    }

    fn start_advertising(
        context: &Context,
        local: &LocalBranchInfo,
        observer: Arc<ConnectionManager>,
    ) -> Result<Option<Advertising>, YogiError> {
        let ip_version = match local.advertising_endpoint.ip() {
            std::net::IpAddr::V4(_) => IpVersionFilter::V4,
            std::net::IpAddr::V6(_) => IpVersionFilter::V6,
        };
        let selected = interfaces::select_interfaces(&local.advertising_interfaces, ip_version);
        if selected.is_empty() {
            tracing::warn!("no interfaces qualified for advertising; discovery is disabled for this branch");
            return Ok(None);
        }

        let socket = MulticastSocket::join(local.advertising_endpoint, &selected)?;
        let advertising = Advertising::new(context.clone(), socket, local);
        let interval = match local.advertising_interval {
            TimeoutDuration::Infinite => None,
            TimeoutDuration::Finite(d) => Some(d),
        };
        advertising.start(interval, observer);
        Ok(Some(advertising))
    }

    pub fn info(&self) -> &BranchInfo {
        &self.local
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn connected_peers(&self) -> Vec<BranchInfo> {
        self.connection_manager.connected_peers()
    }

    /// Stops advertising and the underlying `Context`. Already-connected
    /// peers are not actively torn down; dropping the returned `Arc`
    /// (once every clone is gone) releases the listener and sockets.
    pub fn shutdown(&self) {
        if let Some(advertising) = &self.advertising {
            advertising.stop();
        }
        self.context.stop();
    }
}
