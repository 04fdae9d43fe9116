//! Property-based tests for membership succession and node tracking
//!
//! - Ring tracking fan-out is 1 (single ring) or 1..=2 (sub-rings)
//! - Ring tracking edges form one strongly connected graph
//! - Deltas reproduce the coordinator's membership on every node

use cohort_membership::{
    Group, GroupMembership, GroupMembershipDelta, GroupOptions, Node, NodeTrackingStrategy,
    RingNodeTrackingStrategy,
};
use proptest::prelude::*;
use std::collections::{HashMap, HashSet, VecDeque};
use uuid::Uuid;

fn nodes(n: usize) -> Vec<Node> {
    (0..n)
        .map(|i| Node::new(format!("n{}", i), "core", format!("10.0.0.{}:7000", i)))
        .collect()
}

fn reachable(start: Uuid, edges: &HashMap<Uuid, Vec<Uuid>>) -> HashSet<Uuid> {
    let mut seen = HashSet::from([start]);
    let mut queue = VecDeque::from([start]);
    while let Some(id) = queue.pop_front() {
        for next in edges.get(&id).into_iter().flatten() {
            if seen.insert(*next) {
                queue.push_back(*next);
            }
        }
    }
    seen
}

fn membership(id: u64, members: Vec<Node>) -> GroupMembership {
    GroupMembership::new(
        id,
        Group::new(
            Uuid::from_u128(1),
            "group",
            "group-addr",
            GroupOptions::default(),
            id,
            members,
            true,
        ),
    )
}

proptest! {
    #[test]
    fn ring_fanout_is_bounded(n in 2usize..120) {
        let live = nodes(n);
        let strategy = RingNodeTrackingStrategy;

        let mut forward: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        let mut backward: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for node in &live {
            let tracked = strategy.tracked_nodes(node, &live);
            prop_assert!(!tracked.contains(node));
            if n <= 10 {
                prop_assert_eq!(tracked.len(), 1);
            } else {
                prop_assert!((1..=2).contains(&tracked.len()));
            }
            for target in tracked {
                forward.entry(node.id()).or_default().push(target.id());
                backward.entry(target.id()).or_default().push(node.id());
            }
        }

        let origin = live[0].id();
        prop_assert_eq!(reachable(origin, &forward).len(), n);
        prop_assert_eq!(reachable(origin, &backward).len(), n);
    }

    #[test]
    fn delta_reproduces_membership(
        size in 1usize..12,
        removals in prop::collection::vec(any::<bool>(), 12),
        failures in prop::collection::vec(any::<bool>(), 12),
        joins in 0usize..4,
    ) {
        let all = nodes(size + joins);
        let old = membership(3, all[..size].to_vec());

        let survivors: Vec<Node> = all[..size]
            .iter()
            .enumerate()
            .filter(|(i, _)| !removals[*i])
            .map(|(_, n)| n.clone())
            .collect();
        let failed: HashSet<Uuid> = all[..size]
            .iter()
            .enumerate()
            .filter(|(i, _)| removals[*i] && failures[*i])
            .map(|(_, n)| n.id())
            .collect();
        let members = survivors.into_iter().chain(all[size..].iter().cloned()).collect();
        let new = membership(4, members);

        let delta = GroupMembershipDelta::between(&old, &new, &failed).unwrap();
        prop_assert_eq!(delta.id, old.id() + 1);
        prop_assert_eq!(delta.failed.len(), failed.len());

        let derived = delta.apply(&old).unwrap();
        prop_assert_eq!(&derived, &new);
        prop_assert!(delta.apply(&derived).is_err());
    }
}
