//! End-to-end coverage of branch discovery, handshake, and auth over a
//! real loopback multicast group and TCP connection, exercising
//! `yogi_discovery::Branch` the way an embedder would.

use std::time::Duration;

use yogi_core::branch::BranchConfig;
use yogi_core::events::{BranchEvent, EventKind, EventOutcome};
use yogi_transport::context::Context;
use yogi_discovery::Branch;

fn config(name: &str, network_name: &str, password: &str, advertising_port: u16) -> BranchConfig {
    BranchConfig {
        name: name.to_string(),
        network_name: network_name.to_string(),
        network_password: password.to_string(),
        advertising_interfaces: vec!["localhost".to_string()],
        advertising_address: "239.255.19.88".to_string(),
        advertising_port,
        advertising_interval_secs: Some(0.1),
        timeout_secs: Some(5.0),
        ..Default::default()
    }
}

async fn next_event(bus: &yogi_core::events::EventBus) -> BranchEvent {
    let (tx, rx) = tokio::sync::oneshot::channel();
    bus.await_event(move |_, outcome| {
        let _ = tx.send(outcome);
    });
    match tokio::time::timeout(Duration::from_secs(10), rx).await {
        Ok(Ok(EventOutcome::Delivered(event))) => event,
        Ok(Ok(EventOutcome::Canceled)) => panic!("event await was canceled"),
        Ok(Err(_)) => panic!("event sender dropped"),
        Err(_) => panic!("timed out waiting for a branch event"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn two_branches_discover_and_connect() {
    let ctx_a = Context::new().unwrap();
    ctx_a.run_in_background().unwrap();
    let ctx_b = Context::new().unwrap();
    ctx_b.run_in_background().unwrap();

    let port = 47_781;
    let branch_a = Branch::start(ctx_a.clone(), &config("alice", "testnet", "shared-secret", port))
        .await
        .unwrap();
    let branch_b = Branch::start(ctx_b.clone(), &config("bob", "testnet", "shared-secret", port))
        .await
        .unwrap();

    let discovered = next_event(branch_a.events()).await;
    assert_eq!(discovered.kind, EventKind::BranchDiscovered);

    let queried = next_event(branch_a.events()).await;
    assert_eq!(queried.kind, EventKind::BranchQueried);

    let finished = next_event(branch_a.events()).await;
    assert_eq!(finished.kind, EventKind::ConnectFinished);
    assert!(finished.result.is_ok());

    // Discovery is symmetric: `bob` independently discovers, queries, and
    // connects to `alice` on its own side. Both inbound and outbound
    // handshakes for the same pair must settle into exactly one
    // `Connected` state per side, not just `alice`'s.
    let discovered_b = next_event(branch_b.events()).await;
    assert_eq!(discovered_b.kind, EventKind::BranchDiscovered);

    let queried_b = next_event(branch_b.events()).await;
    assert_eq!(queried_b.kind, EventKind::BranchQueried);

    let finished_b = next_event(branch_b.events()).await;
    assert_eq!(finished_b.kind, EventKind::ConnectFinished);
    assert!(finished_b.result.is_ok());

    assert_eq!(branch_a.connected_peers().len(), 1);
    assert_eq!(branch_a.connected_peers()[0].name, "bob");
    assert_eq!(branch_b.connected_peers().len(), 1);
    assert_eq!(branch_b.connected_peers()[0].name, "alice");

    // Give any redundant inbound/outbound handshake completion for this
    // same pair a chance to land before shutdown, so a regression that
    // tears down the genuine `Connected` entry would surface here instead
    // of going unnoticed.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(branch_a.connected_peers().len(), 1);
    assert_eq!(branch_b.connected_peers().len(), 1);

    branch_a.shutdown();
    branch_b.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_branch_name_is_rejected() {
    let ctx_a = Context::new().unwrap();
    ctx_a.run_in_background().unwrap();
    let ctx_b = Context::new().unwrap();
    ctx_b.run_in_background().unwrap();

    let port = 47_782;
    let branch_a = Branch::start(ctx_a.clone(), &config("same-name", "testnet", "pw", port))
        .await
        .unwrap();
    let branch_b = Branch::start(ctx_b.clone(), &config("same-name", "testnet", "pw", port))
        .await
        .unwrap();

    let _discovered = next_event(branch_a.events()).await;
    let _queried = next_event(branch_a.events()).await;
    let finished = next_event(branch_a.events()).await;

    assert_eq!(finished.kind, EventKind::ConnectFinished);
    assert_eq!(
        finished.result.unwrap_err(),
        yogi_transport::error::YogiErrorCode::DuplicateBranchName
    );
    assert!(branch_a.connected_peers().is_empty());

    branch_a.shutdown();
    branch_b.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn ghost_mode_branch_is_never_reachable() {
    let ctx_a = Context::new().unwrap();
    ctx_a.run_in_background().unwrap();
    let ctx_b = Context::new().unwrap();
    ctx_b.run_in_background().unwrap();

    let port = 47_783;
    let mut ghost_config = config("ghost", "testnet", "pw", port);
    ghost_config.ghost_mode = true;
    let branch_a = Branch::start(ctx_a.clone(), &ghost_config).await.unwrap();
    let branch_b = Branch::start(ctx_b.clone(), &config("seeker", "testnet", "pw", port))
        .await
        .unwrap();

    // `seeker` discovers `ghost` (advertisements still go out) but every
    // connection attempt fails since nothing is listening behind the
    // advertised port; no connected session is ever established.
    let discovered = next_event(branch_b.events()).await;
    assert_eq!(discovered.kind, EventKind::BranchDiscovered);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(branch_b.connected_peers().is_empty());
    assert!(branch_a.connected_peers().is_empty());

    branch_a.shutdown();
    branch_b.shutdown();
}
