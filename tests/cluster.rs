//! Cluster tests over real compartments
//!
//! - Configuration defaults, overrides and validation
//! - Three nodes agree on successive memberships through the local transport
//! - Heartbeats detect a crashed node and a flush removes it

use cohort::flush::{FlushError, NodeFeedbackData, NodeState};
use cohort::membership::MembershipError;
use cohort::prelude::*;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

fn fast_config(name: &str) -> CohortConfig {
    CohortConfig {
        compartment: CompartmentConfig {
            name: name.to_string(),
            dispatch_period_ms: 10,
            ..CompartmentConfig::default()
        },
        heartbeat: HeartbeatConfig {
            track_period_ms: 50,
            heartbeat_start_period_ms: 100,
            heartbeat_period_ms: 50,
            failure_detection_period_ms: 600,
        },
        ..CohortConfig::default()
    }
}

fn start_cluster(n: usize) -> (Arc<LocalTransport>, Vec<Arc<CohortNode>>) {
    let transport = LocalTransport::new();
    let nodes: Vec<_> = (0..n)
        .map(|i| {
            let name = format!("node-{}", i);
            let node = Node::new(name.clone(), "test", format!("mem://{}", name));
            CohortNode::new(
                node,
                fast_config(&name),
                Box::new(FullNodeTrackingStrategy),
                &transport,
            )
            .unwrap()
        })
        .collect();

    let all: Vec<Node> = nodes.iter().map(|n| n.node().clone()).collect();
    for node in &nodes {
        node.start().unwrap();
        node.connect(all.clone()).unwrap();
    }
    assert!(wait_until(|| nodes
        .iter()
        .all(|n| n.live_nodes().live_nodes().len() == all.len())));
    (transport, nodes)
}

fn membership(id: u64, nodes: &[&Arc<CohortNode>]) -> GroupMembership {
    GroupMembership::new(
        id,
        Group::new(
            Uuid::from_u128(0x9e),
            "cluster-group",
            "mem://cluster-group",
            GroupOptions::default(),
            id,
            nodes.iter().map(|n| n.node().clone()).collect(),
            true,
        ),
    )
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

fn installed(nodes: &[&Arc<CohortNode>], id: u64) -> bool {
    nodes.iter().all(|n| {
        n.membership().membership_id() == Some(id) && n.participant().phase() == FlushPhase::Ready
    })
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn default_config_is_valid() {
    assert!(CohortConfig::default().validate().is_ok());
    assert!(fast_config("a").validate().is_ok());
}

#[test]
fn config_overrides_from_json() {
    let config: CohortConfig =
        serde_json::from_str(r#"{"flush": {"flush_timeout_ms": 250}}"#).unwrap();
    assert_eq!(config.flush.flush_timeout_ms, 250);
    assert_eq!(
        config.heartbeat.failure_detection_period_ms,
        HeartbeatConfig::default().failure_detection_period_ms
    );
    assert!(config.validate().is_ok());
}

#[test]
fn invalid_config_is_rejected() {
    let transport = LocalTransport::new();
    let node = Node::new("a", "test", "mem://a");

    let mut config = CohortConfig::default();
    config.flush.flush_timeout_ms = 0;
    let err = CohortNode::new(
        node.clone(),
        config,
        Box::new(FullNodeTrackingStrategy),
        &transport,
    )
    .err()
    .unwrap();
    assert!(matches!(err, CohortError::Flush(FlushError::InvalidConfig(_))));

    let mut config = CohortConfig::default();
    config.heartbeat.failure_detection_period_ms = 1;
    let err = CohortNode::new(node, config, Box::new(FullNodeTrackingStrategy), &transport)
        .err()
        .unwrap();
    assert!(matches!(
        err,
        CohortError::Membership(MembershipError::InvalidConfig(_))
    ));
}

// ============================================================================
// Transitions
// ============================================================================

#[test]
fn three_nodes_agree_on_successive_memberships() {
    let (_transport, nodes) = start_cluster(3);
    let all: Vec<_> = nodes.iter().collect();

    for node in &nodes {
        node.node_feedback().update(NodeFeedbackData {
            node_id: node.node().id(),
            state: NodeState::Running,
            load: 7,
        });
    }

    let first = membership(1, &all);
    nodes[0].install(first.clone()).unwrap();
    assert!(wait_until(|| installed(&all, 1)));
    assert!(wait_until(|| nodes[0].coordinator().in_progress().is_none()));

    // Non-coordinators cannot start a transition.
    assert!(nodes[1].install(membership(2, &all)).is_err());

    let second = membership(2, &all);
    nodes[0].install(second.clone()).unwrap();
    assert!(wait_until(|| installed(&all, 2)));

    for node in &nodes {
        assert_eq!(node.membership().membership(), Some(second.clone()));
        assert_eq!(node.node_feedback().len(), 3);
    }
}

#[test]
fn crashed_node_is_detected_and_removed() {
    let (transport, nodes) = start_cluster(3);
    let all: Vec<_> = nodes.iter().collect();
    let first = membership(1, &all);
    for node in &nodes {
        node.bootstrap(first.clone()).unwrap();
    }

    let crashed = nodes[2].node().id();
    transport.disconnect(&crashed);
    nodes[2].stop();

    let survivors = [&nodes[0], &nodes[1]];
    assert!(wait_until(|| survivors
        .iter()
        .all(|n| !n.live_nodes().is_live(&crashed))));
    assert!(survivors.iter().all(|n| n.live_nodes().is_live(&nodes[0].node().id())));

    let second = membership(2, &survivors);
    nodes[0].install(second.clone()).unwrap();
    assert!(wait_until(|| installed(&survivors, 2)));
    assert_eq!(nodes[2].membership().membership_id(), Some(1));
}
