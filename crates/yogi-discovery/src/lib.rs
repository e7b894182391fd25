//! UDP multicast advertising/discovery, the handshake and
//! challenge/response auth exchange, and the connection manager /
//! [`Branch`] composition root.
//!
//! Layered bottom-up: [`interfaces`] selects which local addresses to
//! advertise/listen on, [`udp`] wraps the joined multicast socket,
//! [`advertising`] drives the periodic send loop and continuous receive
//! loop over it, [`handshake`] runs the per-connection auth exchange
//! once two peers have found each other, and [`connection_manager`]
//! resolves discovery sightings and inbound connections down to a
//! settled per-peer state, publishing the branch event sequence along
//! the way. [`branch`] wires all of the above into the one object an
//! embedder constructs.

pub mod advertising;
pub mod branch;
pub mod connection_manager;
pub mod handshake;
pub mod interfaces;
pub mod udp;

pub use branch::Branch;
pub use connection_manager::ConnectionManager;
pub use handshake::{run_handshake, RemoteBranchInfo};
