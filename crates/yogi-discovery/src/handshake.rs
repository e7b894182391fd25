//! The connection handshake and password-based auth exchange.
//!
//! Generic over [`ByteTransport`] rather than hardcoded to
//! `yogi-transport-tcp::TcpByteTransport` so the state machine below can
//! be exercised directly against a loopback-TCP pair in this module's
//! own tests, the way `yogi-transport-tcp::channel` tests
//! `TcpByteTransport` itself, without needing a running connection
//! manager or discovery loop.

use rand::RngCore;
use sha2::{Digest, Sha256};

use yogi_core::branch::{ADV_MESSAGE_SIZE, BranchInfo, LocalBranchInfo, Uuid, wire};
use yogi_core::varint;
use yogi_transport::byte_transport::ByteTransport;
use yogi_transport::context::CallContext;
use yogi_transport::error::{YogiError, YogiErrorCode};

/// The fixed, opaque byte both sides exchange as a handshake
/// acknowledgement. Its value is arbitrary; both peers just need to
/// agree on one.
const ACKNOWLEDGE_BYTE: u8 = 0x00;
const CHALLENGE_SIZE: usize = 8;

/// The peer's identity and attributes recovered from a successful
/// handshake.
#[derive(Debug, Clone)]
pub struct RemoteBranchInfo {
    pub info: BranchInfo,
}

/// Runs the full handshake -- info exchange, loopback check, ack,
/// challenge/response auth, a second ack, then network-name agreement
/// -- over an already-connected `transport`. Duplicate name/path
/// detection is left to the caller, which alone knows the set of
/// already-connected peers.
pub async fn run_handshake<T: ByteTransport>(
    transport: &T,
    local: &LocalBranchInfo,
    ctx: &CallContext,
) -> Result<RemoteBranchInfo, YogiError> {
    write_info_message(transport, &local.info, ctx).await?;
    let peer_info = read_info_message(transport, ctx).await?;

    if peer_info.uuid == local.uuid {
        return Err(YogiError::from(YogiErrorCode::LoopbackConnection));
    }

    exchange_ack(transport, ctx).await?;

    let own_challenge = random_challenge();
    transport.send_all(&own_challenge, ctx).await?;
    let mut peer_challenge = [0u8; CHALLENGE_SIZE];
    transport.recv_all(&mut peer_challenge, ctx).await?;

    let own_solution = solve_challenge(&peer_challenge, &local.network_password);
    transport.send_all(&own_solution, ctx).await?;
    let mut peer_solution = [0u8; 32];
    transport.recv_all(&mut peer_solution, ctx).await?;

    let expected = solve_challenge(&own_challenge, &local.network_password);
    if peer_solution != *expected {
        return Err(YogiError::from(YogiErrorCode::PasswordMismatch));
    }

    exchange_ack(transport, ctx).await?;

    if peer_info.network_name != local.network_name {
        return Err(YogiError::from(YogiErrorCode::NetNameMismatch));
    }

    Ok(RemoteBranchInfo { info: peer_info })
}

/// Writes the Info message: the 25-byte adv prefix, a varint body
/// length, then the body itself.
async fn write_info_message<T: ByteTransport>(
    transport: &T,
    info: &BranchInfo,
    ctx: &CallContext,
) -> Result<(), YogiError> {
    let adv = wire::encode_adv_message(&info.uuid, info.tcp_endpoint.port());
    transport.send_all(&adv, ctx).await?;

    let body = wire::encode_info_body(info);
    let len_field = varint::encode(body.len() as u64)?;
    transport.send_all(&len_field, ctx).await?;
    transport.send_all(&body, ctx).await?;
    Ok(())
}

/// Reads a peer's Info message, validating the adv prefix's magic and
/// version the same way the advertising receive loop does.
async fn read_info_message<T: ByteTransport>(
    transport: &T,
    ctx: &CallContext,
) -> Result<BranchInfo, YogiError> {
    let mut adv = [0u8; ADV_MESSAGE_SIZE];
    transport.recv_all(&mut adv, ctx).await?;
    let parsed_adv = wire::decode_adv_message(&adv)?;

    let len = read_varint_from_transport(transport, ctx).await?;
    let mut body = vec![0u8; len as usize];
    transport.recv_all(&mut body, ctx).await?;
    let body = wire::decode_info_body(&body)?;

    let tcp_endpoint = transport
        .peer_addr()
        .map(std::net::SocketAddr::from)
        .unwrap_or_else(|| std::net::SocketAddr::from(([0, 0, 0, 0], parsed_adv.tcp_port)));

    Ok(BranchInfo {
        uuid: parsed_adv.uuid,
        name: body.name,
        description: body.description,
        network_name: body.network_name,
        path: body.path,
        hostname: body.hostname,
        pid: body.pid,
        start_time: body.start_time,
        tcp_endpoint,
        timeout: body.timeout,
        advertising_interval: body.advertising_interval,
        ghost_mode: body.ghost_mode,
    })
}

/// Reads a varint size field one byte at a time, since the underlying
/// transport only exposes byte-range reads, not a peekable stream.
async fn read_varint_from_transport<T: ByteTransport>(
    transport: &T,
    ctx: &CallContext,
) -> Result<u64, YogiError> {
    let mut bytes = Vec::with_capacity(5);
    loop {
        let mut byte = [0u8; 1];
        transport.recv_all(&mut byte, ctx).await?;
        bytes.push(byte[0]);
        if let Some((value, _consumed)) = varint::decode(&bytes)? {
            return Ok(value);
        }
        if bytes.len() >= 5 {
            return Err(YogiError::new(
                YogiErrorCode::DeserializeMsgFailed,
                "info message size field exceeds 5 bytes",
            ));
        }
    }
}

async fn exchange_ack<T: ByteTransport>(transport: &T, ctx: &CallContext) -> Result<(), YogiError> {
    transport.send_all(&[ACKNOWLEDGE_BYTE], ctx).await?;
    let mut ack = [0u8; 1];
    transport.recv_all(&mut ack, ctx).await?;
    Ok(())
}

fn random_challenge() -> [u8; CHALLENGE_SIZE] {
    let mut bytes = [0u8; CHALLENGE_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// `SHA-256(challenge || SHA-256(password))`.
fn solve_challenge(challenge: &[u8; CHALLENGE_SIZE], password: &str) -> [u8; 32] {
    let password_hash = Sha256::digest(password.as_bytes());
    let mut hasher = Sha256::new();
    hasher.update(challenge);
    hasher.update(password_hash);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use yogi_core::branch::BranchConfig;
    use yogi_transport::TransportSocketAddr;
    use yogi_transport::byte_transport::{ByteTransportConnector, ByteTransportListener};
    use yogi_transport_tcp::{TcpConnector, TcpListener};

    fn loopback(port: u16) -> TransportSocketAddr {
        TransportSocketAddr::V4 { addr: [127, 0, 0, 1], port }
    }

    fn local_info(name: &str, password: &str) -> LocalBranchInfo {
        BranchConfig {
            name: name.to_string(),
            network_name: "testnet".to_string(),
            network_password: password.to_string(),
            ..Default::default()
        }
        .build("127.0.0.1:0".parse().unwrap())
        .unwrap()
    }

    #[tokio::test]
    async fn handshake_succeeds_with_matching_network_and_password() {
        let listener = Arc::new(TcpListener::bind(loopback(0)).await.unwrap());
        let addr = listener.local_addr().unwrap();

        let server_local = local_info("server", "hunter2");
        let client_local = local_info("client", "hunter2");

        let ctx = CallContext::infinite();
        let accept_ctx = ctx.clone();
        let listener_for_accept = Arc::clone(&listener);
        let accept_task = tokio::spawn(async move {
            let (conn, _addr) = listener_for_accept.accept(&accept_ctx).await.unwrap();
            run_handshake(&conn, &server_local, &accept_ctx).await
        });

        let connector = TcpConnector::new();
        let conn = connector.connect(addr, &ctx).await.unwrap();
        let client_result = run_handshake(&conn, &client_local, &ctx).await.unwrap();
        let server_result = accept_task.await.unwrap().unwrap();

        assert_eq!(client_result.info.name, "server");
        assert_eq!(server_result.info.name, "client");
    }

    #[tokio::test]
    async fn handshake_rejects_password_mismatch() {
        let listener = Arc::new(TcpListener::bind(loopback(0)).await.unwrap());
        let addr = listener.local_addr().unwrap();

        let server_local = local_info("server", "correct-password");
        let client_local = local_info("client", "wrong-password");

        let ctx = CallContext::infinite();
        let accept_ctx = ctx.clone();
        let listener_for_accept = Arc::clone(&listener);
        let accept_task = tokio::spawn(async move {
            let (conn, _addr) = listener_for_accept.accept(&accept_ctx).await.unwrap();
            run_handshake(&conn, &server_local, &accept_ctx).await
        });

        let connector = TcpConnector::new();
        let conn = connector.connect(addr, &ctx).await.unwrap();
        let client_err = run_handshake(&conn, &client_local, &ctx).await.unwrap_err();
        let server_err = accept_task.await.unwrap().unwrap_err();

        assert_eq!(client_err.code(), YogiErrorCode::PasswordMismatch);
        assert_eq!(server_err.code(), YogiErrorCode::PasswordMismatch);
    }

    #[tokio::test]
    async fn handshake_rejects_network_name_mismatch() {
        let listener = Arc::new(TcpListener::bind(loopback(0)).await.unwrap());
        let addr = listener.local_addr().unwrap();

        let mut server_local = local_info("server", "shared");
        server_local.info.network_name = "net-a".to_string();
        let mut client_local = local_info("client", "shared");
        client_local.info.network_name = "net-b".to_string();

        let ctx = CallContext::infinite();
        let accept_ctx = ctx.clone();
        let listener_for_accept = Arc::clone(&listener);
        let accept_task = tokio::spawn(async move {
            let (conn, _addr) = listener_for_accept.accept(&accept_ctx).await.unwrap();
            run_handshake(&conn, &server_local, &accept_ctx).await
        });

        let connector = TcpConnector::new();
        let conn = connector.connect(addr, &ctx).await.unwrap();
        let client_err = run_handshake(&conn, &client_local, &ctx).await.unwrap_err();
        let server_err = accept_task.await.unwrap().unwrap_err();

        assert_eq!(client_err.code(), YogiErrorCode::NetNameMismatch);
        assert_eq!(server_err.code(), YogiErrorCode::NetNameMismatch);
    }

    #[tokio::test]
    async fn handshake_rejects_self_uuid_as_loopback() {
        let listener = Arc::new(TcpListener::bind(loopback(0)).await.unwrap());
        let addr = listener.local_addr().unwrap();

        let local = local_info("solo", "pw");
        let mut peer_with_same_uuid = local_info("solo-peer", "pw");
        peer_with_same_uuid.info.uuid = local.info.uuid;

        let ctx = CallContext::infinite();
        let accept_ctx = ctx.clone();
        let listener_for_accept = Arc::clone(&listener);
        let accept_task = tokio::spawn(async move {
            let (conn, _addr) = listener_for_accept.accept(&accept_ctx).await.unwrap();
            run_handshake(&conn, &peer_with_same_uuid, &accept_ctx).await
        });

        let connector = TcpConnector::new();
        let conn = connector.connect(addr, &ctx).await.unwrap();
        let client_err = run_handshake(&conn, &local, &ctx).await.unwrap_err();

        assert_eq!(client_err.code(), YogiErrorCode::LoopbackConnection);
        let _ = accept_task.await;
    }
}
