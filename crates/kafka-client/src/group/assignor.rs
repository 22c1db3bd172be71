//! Partition assignors run by the elected leader of a consumer group.
//!
//! Both assignors are deterministic: members are ordered by member id
//! and partitions by topic then index, so every leader computes the
//! same assignment from the same subscriptions.

use crate::codec::group::{Assignment, Subscription};
use crate::AssignmentStrategy;
use std::collections::BTreeMap;

impl AssignmentStrategy {
    /// Protocol name advertised in JoinGroup.
    pub fn protocol_name(self) -> &'static str {
        match self {
            AssignmentStrategy::Range => "range",
            AssignmentStrategy::RoundRobin => "roundrobin",
        }
    }

    pub fn from_protocol_name(name: &str) -> Option<Self> {
        match name {
            "range" => Some(AssignmentStrategy::Range),
            "roundrobin" => Some(AssignmentStrategy::RoundRobin),
            _ => None,
        }
    }
}

/// Assign the partitions of subscribed topics to members.
/// Every member receives an entry, which may be empty.
/// Topics missing from `partition_counts` are not assigned.
pub fn assign(
    strategy: AssignmentStrategy,
    subscriptions: &BTreeMap<String, Subscription>,
    partition_counts: &BTreeMap<String, usize>,
) -> BTreeMap<String, Assignment> {
    let mut out: BTreeMap<String, Assignment> = subscriptions
        .keys()
        .map(|member| (member.clone(), Assignment::default()))
        .collect();

    match strategy {
        AssignmentStrategy::Range => range(subscriptions, partition_counts, &mut out),
        AssignmentStrategy::RoundRobin => round_robin(subscriptions, partition_counts, &mut out),
    }
    out
}

// Members subscribed to `topic`, in member id order.
fn subscribers<'s>(subscriptions: &'s BTreeMap<String, Subscription>, topic: &str) -> Vec<&'s str> {
    subscriptions
        .iter()
        .filter(|(_, sub)| sub.topics.iter().any(|t| t == topic))
        .map(|(member, _)| member.as_str())
        .collect()
}

// Each topic is divided into contiguous ranges, and the first
// `partitions % members` members receive one extra partition.
fn range(
    subscriptions: &BTreeMap<String, Subscription>,
    partition_counts: &BTreeMap<String, usize>,
    out: &mut BTreeMap<String, Assignment>,
) {
    for (topic, &count) in partition_counts {
        let members = subscribers(subscriptions, topic);
        if members.is_empty() || count == 0 {
            continue;
        }
        let (base, extra) = (count / members.len(), count % members.len());

        let mut next = 0;
        for (index, member) in members.into_iter().enumerate() {
            let take = base + usize::from(index < extra);
            if take == 0 {
                continue;
            }
            let partitions = (next..next + take).map(|p| p as i32).collect();
            next += take;

            if let Some(assignment) = out.get_mut(member) {
                assignment.partitions.insert(topic.clone(), partitions);
            }
        }
    }
}

// Partitions of all topics are dealt to members in turn, skipping
// members which are not subscribed to a partition's topic.
fn round_robin(
    subscriptions: &BTreeMap<String, Subscription>,
    partition_counts: &BTreeMap<String, usize>,
    out: &mut BTreeMap<String, Assignment>,
) {
    let members: Vec<&str> = subscriptions.keys().map(String::as_str).collect();
    if members.is_empty() {
        return;
    }
    let mut cursor = 0;

    for (topic, &count) in partition_counts {
        let subscribed = subscribers(subscriptions, topic);
        if subscribed.is_empty() {
            continue;
        }
        for partition in 0..count as i32 {
            while !subscribed.contains(&members[cursor % members.len()]) {
                cursor += 1;
            }
            let member = members[cursor % members.len()];
            cursor += 1;

            if let Some(assignment) = out.get_mut(member) {
                assignment
                    .partitions
                    .entry(topic.clone())
                    .or_default()
                    .push(partition);
            }
        }
    }
}
