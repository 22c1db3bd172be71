use crate::codec::{self, ErrorCode};
use crate::retry::Retry;
use crate::{BrokerPool, Error, Result, TopicPartition};
use kafka_protocol::messages;
use std::collections::{BTreeMap, BTreeSet};

/// Generation of a group membership, which fences offset commits
/// made by members that have since been removed from the group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub generation_id: i32,
    pub member_id: String,
}

impl Generation {
    /// Commits made outside of group membership, by consumers
    /// with manually assigned partitions.
    pub fn none() -> Self {
        Self {
            generation_id: -1,
            member_id: String::new(),
        }
    }
}

/// Commit `offsets` for `group_id`. Each offset is that of the next
/// record to be consumed. Retriable failures are retried with backoff.
pub async fn commit(
    pool: &BrokerPool,
    group_id: &str,
    generation: &Generation,
    offsets: &BTreeMap<TopicPartition, i64>,
) -> Result<()> {
    if offsets.is_empty() {
        return Ok(());
    }
    with_retries(pool, group_id, "commit offsets", || {
        try_commit(pool, group_id, generation, offsets)
    })
    .await?;

    tracing::debug!(group = group_id, generation = generation.generation_id, count = offsets.len(), "committed offsets");
    metrics::counter!("kafka_client_offset_commits", "group" => group_id.to_string()).increment(1);
    Ok(())
}

/// Fetch committed offsets of `partitions` for `group_id`.
/// Partitions without a committed offset map to None.
pub async fn fetch(
    pool: &BrokerPool,
    group_id: &str,
    partitions: &BTreeSet<TopicPartition>,
) -> Result<BTreeMap<TopicPartition, Option<i64>>> {
    if partitions.is_empty() {
        return Ok(BTreeMap::new());
    }
    with_retries(pool, group_id, "fetch committed offsets", || {
        try_fetch(pool, group_id, partitions)
    })
    .await
}

async fn with_retries<T, F, Fut>(pool: &BrokerPool, group_id: &str, what: &str, attempt: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let config = pool.config();
    let mut retry = Retry::from_config(config, config.routing_retries);

    loop {
        let err = match attempt().await {
            Ok(out) => return Ok(out),
            Err(err) => err,
        };
        if err.code().is_some_and(ErrorCode::invalidates_coordinator) {
            pool.invalidate_coordinator(group_id);
        }
        if !err.is_retryable() {
            return Err(err);
        }
        tracing::warn!(group = group_id, attempt = retry.attempts(), error = %err, "failed to {what} (will retry)");

        if !retry.wait().await {
            return Err(err);
        }
    }
}

async fn try_commit(
    pool: &BrokerPool,
    group_id: &str,
    generation: &Generation,
    offsets: &BTreeMap<TopicPartition, i64>,
) -> Result<()> {
    use messages::offset_commit_request::{OffsetCommitRequestPartition, OffsetCommitRequestTopic};

    let mut topics: BTreeMap<&str, Vec<OffsetCommitRequestPartition>> = BTreeMap::new();
    for (tp, offset) in offsets {
        topics.entry(&tp.topic).or_default().push(
            OffsetCommitRequestPartition::default()
                .with_partition_index(tp.partition)
                .with_committed_offset(*offset),
        );
    }
    let topics = topics
        .into_iter()
        .map(|(topic, partitions)| {
            OffsetCommitRequestTopic::default()
                .with_name(codec::topic_name(topic))
                .with_partitions(partitions)
        })
        .collect();

    let request = messages::OffsetCommitRequest::default()
        .with_group_id(codec::group_id(group_id))
        .with_generation_id_or_member_epoch(generation.generation_id)
        .with_member_id(codec::str_bytes(&generation.member_id))
        .with_topics(topics);

    let conn = pool.coordinator_for(group_id).await?;
    let response = conn.request(&request).await?;

    for topic in &response.topics {
        for partition in &topic.partitions {
            ErrorCode::check(partition.error_code).map_err(Error::Coordination)?;
        }
    }
    Ok(())
}

async fn try_fetch(
    pool: &BrokerPool,
    group_id: &str,
    partitions: &BTreeSet<TopicPartition>,
) -> Result<BTreeMap<TopicPartition, Option<i64>>> {
    use messages::offset_fetch_request::OffsetFetchRequestTopic;

    let mut topics: BTreeMap<&str, Vec<i32>> = BTreeMap::new();
    for tp in partitions {
        topics.entry(&tp.topic).or_default().push(tp.partition);
    }
    let topics = topics
        .into_iter()
        .map(|(topic, indexes)| {
            OffsetFetchRequestTopic::default()
                .with_name(codec::topic_name(topic))
                .with_partition_indexes(indexes)
        })
        .collect();

    let request = messages::OffsetFetchRequest::default()
        .with_group_id(codec::group_id(group_id))
        .with_topics(Some(topics));

    let conn = pool.coordinator_for(group_id).await?;
    let response = conn.request(&request).await?;
    ErrorCode::check(response.error_code).map_err(Error::Coordination)?;

    let mut out: BTreeMap<TopicPartition, Option<i64>> =
        partitions.iter().map(|tp| (tp.clone(), None)).collect();

    for topic in response.topics {
        for partition in topic.partitions {
            ErrorCode::check(partition.error_code).map_err(Error::Coordination)?;

            let tp = TopicPartition::new(topic.name.0.to_string(), partition.partition_index);
            if let Some(slot) = out.get_mut(&tp) {
                *slot = (partition.committed_offset >= 0).then_some(partition.committed_offset);
            }
        }
    }
    Ok(out)
}
