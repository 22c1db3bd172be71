//! Fetcher keeps a prefetch buffer of records for each assigned partition,
//! and fetches from partition leaders as those buffers drain.
//!
//! Buffers share a fixed byte budget. Each of N assigned partitions may
//! hold up to `fetch_buffer_bytes / N` bytes, and is fetched again only
//! once it falls below half of that share. Fetches of partitions which
//! have the same leader are grouped into a single request.

use crate::codec::records::{self, ControlMarker, RecordBatch};
use crate::codec::{self, ErrorCode};
use crate::{BrokerPool, Config, ConsumerRecord, Error, OffsetReset, Result, TopicPartition};
use kafka_protocol::messages::{self, BrokerId};
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;

const EARLIEST_TIMESTAMP: i64 = -2;
const LATEST_TIMESTAMP: i64 = -1;

pub struct Fetcher {
    pool: BrokerPool,
    config: Arc<Config>,
    partitions: BTreeMap<TopicPartition, PartitionState>,
    tasks: JoinSet<Completion>,
    next_epoch: u64,
    refreshing: bool,
    refresh_after: Option<Instant>,
    // Index of the partition which the next poll drains first,
    // so that every partition makes progress under max_poll_records.
    cursor: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    // Waiting for an offset from the reset policy.
    Resetting,
    Fetching,
    // Stopped by an error, which poll returns once. Resumed by seek.
    Halted,
}

#[derive(Debug)]
struct PartitionState {
    status: Status,
    // Offset of the next record to fetch, which follows the last buffered one.
    fetch_offset: i64,
    buffer: VecDeque<ConsumerRecord>,
    buffered: usize,
    in_flight: bool,
    // Bumped on each seek, so that completions of earlier requests are ignored.
    epoch: u64,
    retries: u32,
    retry_at: Option<Instant>,
    failure: Option<Error>,
}

#[derive(Debug, Clone)]
struct FetchTarget {
    tp: TopicPartition,
    epoch: u64,
    offset: i64,
    max_bytes: i32,
}

enum Completion {
    Fetched {
        node_id: i32,
        targets: Vec<FetchTarget>,
        result: Result<messages::FetchResponse>,
    },
    Listed {
        tp: TopicPartition,
        epoch: u64,
        result: Result<i64>,
    },
    Refreshed(Result<()>),
}

impl Fetcher {
    pub fn new(pool: BrokerPool) -> Self {
        let config = Arc::new(pool.config().clone());
        Self {
            pool,
            config,
            partitions: BTreeMap::new(),
            tasks: JoinSet::new(),
            next_epoch: 0,
            refreshing: false,
            refresh_after: None,
            cursor: 0,
        }
    }

    /// Replace the set of assigned partitions. Buffers and positions of
    /// partitions which are no longer assigned are discarded. Newly
    /// assigned partitions start at the offset given by `seek`, or
    /// otherwise at the offset selected by the reset policy.
    pub fn assign(&mut self, partitions: impl IntoIterator<Item = TopicPartition>) {
        let partitions: BTreeSet<TopicPartition> = partitions.into_iter().collect();

        self.partitions.retain(|tp, _| partitions.contains(tp));
        self.pool
            .track_topics(partitions.iter().map(|tp| tp.topic.clone()));

        for tp in partitions {
            if !self.partitions.contains_key(&tp) {
                self.next_epoch += 1;
                self.partitions.insert(tp, PartitionState::new(self.next_epoch));
            }
        }
        tracing::debug!(assigned = self.partitions.len(), "updated fetcher assignment");
    }

    pub fn assignment(&self) -> BTreeSet<TopicPartition> {
        self.partitions.keys().cloned().collect()
    }

    /// Set the offset of the next record returned from `tp`, discarding its
    /// buffered records and clearing a halting error.
    /// Returns false if `tp` isn't assigned.
    pub fn seek(&mut self, tp: &TopicPartition, offset: i64) -> bool {
        let Some(state) = self.partitions.get_mut(tp) else {
            return false;
        };
        self.next_epoch += 1;
        *state = PartitionState::new(self.next_epoch);
        state.status = Status::Fetching;
        state.fetch_offset = offset;

        tracing::debug!(%tp, offset, "seek");
        true
    }

    /// Offset of the next record which poll will return from `tp`,
    /// or None if `tp` isn't assigned or has no position yet.
    pub fn position(&self, tp: &TopicPartition) -> Option<i64> {
        self.partitions.get(tp).and_then(PartitionState::position)
    }

    /// Positions of all assigned partitions which have one.
    pub fn positions(&self) -> BTreeMap<TopicPartition, i64> {
        self.partitions
            .iter()
            .filter_map(|(tp, state)| Some((tp.clone(), state.position()?)))
            .collect()
    }

    /// Bytes of records currently buffered across all partitions.
    pub fn buffered_bytes(&self) -> usize {
        self.partitions.values().map(|s| s.buffered).sum()
    }

    /// Return up to `max_poll_records` buffered records, waiting up to
    /// `max_wait` for records to arrive if none are buffered. An error
    /// which halted a partition is returned once its earlier records
    /// have been returned.
    ///
    /// This method is cancellation safe.
    pub async fn poll(&mut self, max_wait: Duration) -> Result<Vec<ConsumerRecord>> {
        let deadline = Instant::now() + max_wait;

        loop {
            // Apply completed fetches first, so that every partition's
            // buffer is current before records are drained.
            while let Some(joined) = self.tasks.try_join_next() {
                self.joined(joined);
            }
            let records = self.drain();
            self.fill();

            if !records.is_empty() {
                return Ok(records);
            }
            if let Some(err) = self.take_failure() {
                return Err(err);
            }

            let mut wake = deadline;
            for at in self
                .partitions
                .values()
                .filter_map(|s| s.retry_at)
                .chain(self.refresh_after)
            {
                wake = wake.min(at);
            }

            tokio::select! {
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => self.joined(joined),
                () = tokio::time::sleep_until(wake) => {
                    if Instant::now() >= deadline {
                        return Ok(Vec::new());
                    }
                }
            }
        }
    }

    fn joined(&mut self, joined: std::result::Result<Completion, tokio::task::JoinError>) {
        match joined {
            Ok(done) => self.complete(done),
            Err(err) => {
                tracing::error!(error = %err, "fetcher task failed");
                for state in self.partitions.values_mut() {
                    state.in_flight = false;
                }
                self.refreshing = false;
            }
        }
    }

    fn share(&self) -> usize {
        self.config.fetch_buffer_bytes / self.partitions.len().max(1)
    }

    fn take_failure(&mut self) -> Option<Error> {
        self.partitions
            .values_mut()
            .find(|s| s.failure.is_some() && s.buffer.is_empty())
            .and_then(|s| s.failure.take())
    }

    fn drain(&mut self) -> Vec<ConsumerRecord> {
        let n = self.partitions.len();
        let mut out = Vec::new();
        if n == 0 {
            return out;
        }
        let start = self.cursor % n;
        let max = self.config.max_poll_records;

        let (head, tail): (Vec<_>, Vec<_>) = self
            .partitions
            .values_mut()
            .enumerate()
            .partition(|(index, _)| *index < start);

        for (_, state) in tail.into_iter().chain(head) {
            while out.len() < max {
                let Some(record) = state.buffer.pop_front() else {
                    break;
                };
                state.buffered -= record.size();
                out.push(record);
            }
        }
        self.cursor = start + 1;
        out
    }

    // Start fetches of partitions which are below their low-water mark,
    // and offset lookups of partitions which need a reset.
    fn fill(&mut self) {
        let now = Instant::now();
        let share = self.share();
        let low_water = (share / 2).max(1);
        let view = self.pool.snapshot();

        let mut fetches: BTreeMap<i32, Vec<FetchTarget>> = BTreeMap::new();
        let mut missing_leader = false;

        for (tp, state) in self.partitions.iter_mut() {
            if state.in_flight || state.retry_at.is_some_and(|at| at > now) {
                continue;
            }
            state.retry_at = None;

            match state.status {
                Status::Halted => {}
                Status::Resetting => {
                    let timestamp = match self.config.auto_offset_reset {
                        OffsetReset::Earliest => EARLIEST_TIMESTAMP,
                        OffsetReset::Latest => LATEST_TIMESTAMP,
                        OffsetReset::None => {
                            halt(tp, state, Error::NoOffset(tp.clone()));
                            continue;
                        }
                    };
                    state.in_flight = true;
                    self.tasks.spawn(list_offset(
                        self.pool.clone(),
                        tp.clone(),
                        state.epoch,
                        timestamp,
                    ));
                }
                Status::Fetching if state.buffered >= low_water => {}
                Status::Fetching => {
                    let Some(leader) = view.leader(tp) else {
                        missing_leader = true;
                        continue;
                    };
                    state.in_flight = true;
                    fetches.entry(leader.node_id).or_default().push(FetchTarget {
                        tp: tp.clone(),
                        epoch: state.epoch,
                        offset: state.fetch_offset,
                        max_bytes: share.saturating_sub(state.buffered).clamp(1, i32::MAX as usize)
                            as i32,
                    });
                }
            }
        }

        for (node_id, targets) in fetches {
            self.tasks.spawn(fetch(self.pool.clone(), node_id, targets));
        }

        if missing_leader && !self.refreshing && self.refresh_after.map_or(true, |at| at <= now) {
            self.refreshing = true;
            self.refresh_after = None;

            let pool = self.pool.clone();
            self.tasks.spawn(async move {
                Completion::Refreshed(pool.refresh_metadata().await.map(|_| ()))
            });
        }
    }

    fn complete(&mut self, done: Completion) {
        match done {
            Completion::Fetched {
                node_id,
                targets,
                result,
            } => {
                // Targets for which a seek or reassignment hasn't since occurred.
                let mut current = BTreeMap::new();
                for target in targets {
                    if let Some(state) = self.partitions.get_mut(&target.tp) {
                        if state.epoch == target.epoch {
                            state.in_flight = false;
                            current.insert(target.tp.clone(), target);
                        }
                    }
                }

                match result.and_then(|response| {
                    ErrorCode::check(response.error_code)
                        .map(|()| response)
                        .map_err(Error::Broker)
                }) {
                    Ok(response) => self.on_fetched(node_id, current, response),
                    Err(err) => {
                        tracing::warn!(node_id, error = %err, "fetch failed (will retry)");
                        for tp in current.keys() {
                            if let Some(state) = self.partitions.get_mut(tp) {
                                state.backoff(&self.config);
                            }
                        }
                    }
                }
            }
            Completion::Listed { tp, epoch, result } => {
                let Some(state) = self.partitions.get_mut(&tp) else {
                    return;
                };
                if state.epoch != epoch {
                    return;
                }
                state.in_flight = false;

                match result {
                    Ok(offset) => {
                        tracing::info!(%tp, offset, policy = ?self.config.auto_offset_reset, "reset partition offset");
                        state.status = Status::Fetching;
                        state.fetch_offset = offset;
                        state.retries = 0;
                    }
                    Err(err) if err.is_retryable() => {
                        tracing::warn!(%tp, error = %err, "failed to list offsets (will retry)");
                        if err.code().is_some_and(ErrorCode::invalidates_metadata) {
                            self.pool.invalidate_leader(&tp);
                        }
                        state.backoff(&self.config);
                    }
                    Err(err) => halt(&tp, state, err),
                }
            }
            Completion::Refreshed(result) => {
                self.refreshing = false;
                self.refresh_after = Some(Instant::now() + self.config.retry_backoff);

                if let Err(err) = result {
                    tracing::warn!(error = %err, "failed to refresh metadata for fetches (will retry)");
                }
            }
        }
    }

    fn on_fetched(
        &mut self,
        node_id: i32,
        mut current: BTreeMap<TopicPartition, FetchTarget>,
        response: messages::FetchResponse,
    ) {
        let share = self.share();
        let read_committed = self.config.isolation_level == crate::IsolationLevel::ReadCommitted;
        let (mut fetched_records, mut fetched_bytes) = (0, 0);

        for topic in response.responses {
            let name = topic.topic.0.to_string();

            for data in topic.partitions {
                let tp = TopicPartition::new(name.clone(), data.partition_index);
                let Some(target) = current.remove(&tp) else {
                    continue;
                };
                let Some(state) = self.partitions.get_mut(&tp) else {
                    continue;
                };
                if state.fetch_offset != target.offset || state.status != Status::Fetching {
                    continue;
                }

                if data.error_code != 0 {
                    let code = ErrorCode(data.error_code);

                    if code == ErrorCode::OFFSET_OUT_OF_RANGE {
                        if self.config.auto_offset_reset == OffsetReset::None {
                            let offset = state.fetch_offset;
                            halt(&tp, state, Error::OffsetOutOfRange { partition: tp.clone(), offset });
                        } else {
                            tracing::info!(%tp, offset = state.fetch_offset, "fetch offset is out of range");
                            state.status = Status::Resetting;
                        }
                    } else if code.is_retriable() {
                        tracing::debug!(%tp, node_id, %code, "partition fetch failed (will retry)");
                        if code.invalidates_metadata() {
                            self.pool.invalidate_leader(&tp);
                        }
                        state.backoff(&self.config);
                    } else {
                        halt(&tp, state, Error::Broker(code));
                    }
                    continue;
                }
                state.retries = 0;

                let Some(bytes) = data.records else {
                    continue;
                };
                let aborted = match (read_committed, data.aborted_transactions) {
                    (true, Some(aborted)) => aborted
                        .iter()
                        .map(|txn| (txn.producer_id.0, txn.first_offset))
                        .collect(),
                    _ => Vec::new(),
                };
                let before = (state.buffer.len(), state.buffered);

                let result = records::decode_batches(bytes)
                    .and_then(|batches| state.buffer_batches(&tp, batches, aborted, share));

                fetched_records += state.buffer.len() - before.0;
                fetched_bytes += state.buffered - before.1;

                if let Err(err) = result {
                    halt(&tp, state, err);
                }
            }
        }


        metrics::counter!("kafka_client_fetched_records").increment(fetched_records as u64);
        metrics::counter!("kafka_client_fetched_bytes").increment(fetched_bytes as u64);
    }
}

impl std::fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher")
            .field("partitions", &self.partitions.len())
            .field("buffered_bytes", &self.buffered_bytes())
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

impl PartitionState {
    fn new(epoch: u64) -> Self {
        Self {
            status: Status::Resetting,
            fetch_offset: -1,
            buffer: VecDeque::new(),
            buffered: 0,
            in_flight: false,
            epoch,
            retries: 0,
            retry_at: None,
            failure: None,
        }
    }

    fn position(&self) -> Option<i64> {
        match (self.buffer.front(), self.status) {
            (Some(record), _) => Some(record.offset),
            (None, Status::Resetting) => None,
            (None, _) => Some(self.fetch_offset),
        }
    }

    fn backoff(&mut self, config: &Config) {
        self.retries += 1;
        self.retry_at = Some(Instant::now() + crate::retry::delay(config, self.retries));
    }

    // Buffer the records of `batches` from `fetch_offset` onwards, holding
    // no more than `limit` bytes. Records which don't fit are left to be
    // fetched again. `aborted` lists (producer id, first offset) of aborted
    // transactions, whose records are skipped.
    fn buffer_batches(
        &mut self,
        tp: &TopicPartition,
        batches: Vec<RecordBatch>,
        mut aborted: Vec<(i64, i64)>,
        limit: usize,
    ) -> Result<()> {
        aborted.sort_by_key(|(_, first_offset)| *first_offset);
        let mut aborted = aborted.into_iter().peekable();
        let mut aborting = HashSet::new();
        let mut first = true;

        for batch in batches {
            if batch.next_offset() <= self.fetch_offset {
                continue;
            }
            if first && batch.base_offset > self.fetch_offset {
                return Err(Error::OutOfOrder {
                    partition: tp.clone(),
                    expected: self.fetch_offset,
                    actual: batch.base_offset,
                });
            }
            first = false;

            let last_offset = batch.next_offset() - 1;
            while let Some((producer_id, _)) = aborted.next_if(|(_, first_offset)| *first_offset <= last_offset) {
                aborting.insert(producer_id);
            }

            if batch.is_control() {
                if batch.control_marker()? == Some(ControlMarker::Abort) {
                    aborting.remove(&batch.producer_id);
                }
                self.fetch_offset = batch.next_offset();
                continue;
            }
            if batch.is_transactional() && aborting.contains(&batch.producer_id) {
                self.fetch_offset = batch.next_offset();
                continue;
            }

            for record in batch.records()? {
                if record.offset < self.fetch_offset {
                    continue;
                }
                let record = ConsumerRecord {
                    topic: tp.topic.clone(),
                    partition: tp.partition,
                    offset: record.offset,
                    timestamp: record.timestamp,
                    key: record.key,
                    value: record.value,
                    headers: record.headers,
                };
                let size = record.size();

                if self.buffered + size > limit {
                    if self.buffer.is_empty() {
                        return Err(Error::RecordTooLarge {
                            partition: tp.clone(),
                            size,
                            limit,
                        });
                    }
                    return Ok(());
                }
                self.buffered += size;
                self.fetch_offset = record.offset + 1;
                self.buffer.push_back(record);
            }
            self.fetch_offset = batch.next_offset();
        }
        Ok(())
    }
}

fn halt(tp: &TopicPartition, state: &mut PartitionState, err: Error) {
    tracing::warn!(%tp, error = %err, "halting partition until seek");
    state.status = Status::Halted;
    state.failure = Some(err);
}

async fn fetch(pool: BrokerPool, node_id: i32, targets: Vec<FetchTarget>) -> Completion {
    use messages::fetch_request::{FetchPartition, FetchTopic};

    let result = async {
        let config = pool.config();

        let mut topics: BTreeMap<&str, Vec<FetchPartition>> = BTreeMap::new();
        for target in &targets {
            topics.entry(&target.tp.topic).or_default().push(
                FetchPartition::default()
                    .with_partition(target.tp.partition)
                    .with_fetch_offset(target.offset)
                    .with_partition_max_bytes(target.max_bytes),
            );
        }
        let topics = topics
            .into_iter()
            .map(|(topic, partitions)| {
                FetchTopic::default()
                    .with_topic(codec::topic_name(topic))
                    .with_partitions(partitions)
            })
            .collect();

        let request = messages::FetchRequest::default()
            .with_max_wait_ms(config.fetch_max_wait.as_millis() as i32)
            .with_min_bytes(config.fetch_min_bytes)
            .with_max_bytes(config.fetch_max_bytes)
            .with_isolation_level(config.isolation_level.as_i8())
            .with_topics(topics);

        let conn = pool.connection_for(node_id).await?;
        conn.send_with_timeout(&request, config.request_timeout + config.fetch_max_wait)
            .await?
            .await
    }
    .await;

    Completion::Fetched {
        node_id,
        targets,
        result,
    }
}

async fn list_offset(pool: BrokerPool, tp: TopicPartition, epoch: u64, timestamp: i64) -> Completion {
    use messages::list_offsets_request::{ListOffsetsPartition, ListOffsetsTopic};

    let result = async {
        let request = messages::ListOffsetsRequest::default()
            .with_replica_id(BrokerId(-1))
            .with_isolation_level(pool.config().isolation_level.as_i8())
            .with_topics(vec![ListOffsetsTopic::default()
                .with_name(codec::topic_name(&tp.topic))
                .with_partitions(vec![ListOffsetsPartition::default()
                    .with_partition_index(tp.partition)
                    .with_timestamp(timestamp)])]);

        let conn = pool.leader_for(&tp).await?;
        let response = conn.request(&request).await?;

        let partition = response
            .topics
            .iter()
            .filter(|topic| &*topic.name.0 == tp.topic.as_str())
            .flat_map(|topic| topic.partitions.iter())
            .find(|p| p.partition_index == tp.partition)
            .ok_or_else(|| Error::CorruptMessage(format!("ListOffsets response is missing {tp}")))?;

        ErrorCode::check(partition.error_code).map_err(Error::Broker)?;
        Ok(partition.offset)
    }
    .await;

    Completion::Listed { tp, epoch, result }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::records::RecordBatchBuilder;
    use crate::testing::{self, MockBroker, MockRequest, Reply};
    use crate::Compression;
    use messages::fetch_response::{FetchableTopicResponse, PartitionData};
    use messages::{FetchRequest, ListOffsetsRequest, MetadataRequest};
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};

    fn tp() -> TopicPartition {
        TopicPartition::new("events", 0)
    }

    fn decode(bytes: bytes::Bytes) -> Vec<RecordBatch> {
        records::decode_batches(bytes).unwrap()
    }

    fn fetching_at(offset: i64) -> PartitionState {
        let mut state = PartitionState::new(1);
        state.status = Status::Fetching;
        state.fetch_offset = offset;
        state
    }

    fn offsets(state: &PartitionState) -> Vec<i64> {
        state.buffer.iter().map(|r| r.offset).collect()
    }

    #[test]
    fn test_batch_after_fetch_offset_is_out_of_order() {
        let mut state = fetching_at(100);
        let err = state
            .buffer_batches(&tp(), decode(testing::batch(107, &["late"])), Vec::new(), usize::MAX)
            .unwrap_err();

        assert!(matches!(
            err,
            Error::OutOfOrder { expected: 100, actual: 107, .. }
        ));
        assert!(state.buffer.is_empty());
        assert_eq!(state.fetch_offset, 100);
    }

    #[test]
    fn test_records_before_fetch_offset_are_skipped() {
        let mut state = fetching_at(3);
        let mut bytes = testing::batch(0, &["a", "b", "c", "d", "e"]).to_vec();
        bytes.extend_from_slice(&testing::batch(5, &["f"]));

        state
            .buffer_batches(&tp(), decode(bytes.into()), Vec::new(), usize::MAX)
            .unwrap();

        assert_eq!(offsets(&state), vec![3, 4, 5]);
        assert_eq!(state.fetch_offset, 6);
        assert_eq!(state.position(), Some(3));
    }

    #[test]
    fn test_aborted_transactions_and_control_batches_are_skipped() {
        let txn = |base: i64, producer_id: i64, values: &[&str]| {
            let mut builder = RecordBatchBuilder::new(Compression::None, usize::MAX);
            builder.set_producer_state(producer_id, 0, 0);
            builder.set_transactional(true);
            for value in values {
                builder.append(0, None, Some(value.as_bytes()), &[]);
            }
            testing::with_base_offset(&builder.build().unwrap(), base)
        };
        let marker = |base: i64, marker: ControlMarker, producer_id: i64| {
            let builder = RecordBatchBuilder::control(marker, producer_id, 0, 0);
            testing::with_base_offset(&builder.build().unwrap(), base)
        };

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&txn(0, 7, &["aborted-1", "aborted-2"]));
        bytes.extend_from_slice(&txn(2, 8, &["committed"]));
        bytes.extend_from_slice(&marker(3, ControlMarker::Abort, 7));
        bytes.extend_from_slice(&marker(4, ControlMarker::Commit, 8));
        bytes.extend_from_slice(&testing::batch(5, &["plain"]));

        let mut state = fetching_at(0);
        state
            .buffer_batches(&tp(), decode(bytes.clone().into()), vec![(7, 0)], usize::MAX)
            .unwrap();
        assert_eq!(offsets(&state), vec![2, 5]);
        assert_eq!(state.fetch_offset, 6);

        // Without an aborted transaction list (read_uncommitted), only control batches are skipped.
        let mut state = fetching_at(0);
        state
            .buffer_batches(&tp(), decode(bytes.into()), Vec::new(), usize::MAX)
            .unwrap();
        assert_eq!(offsets(&state), vec![0, 1, 2, 5]);
    }

    #[test]
    fn test_oversized_records() {
        // A record larger than the whole budget can never be buffered.
        let mut state = fetching_at(0);
        let err = state
            .buffer_batches(&tp(), decode(testing::batch(0, &["0123456789"])), Vec::new(), 4)
            .unwrap_err();
        assert!(matches!(err, Error::RecordTooLarge { size: 10, limit: 4, .. }));

        // Records which merely overflow the budget are left to be fetched again.
        let mut state = fetching_at(0);
        state
            .buffer_batches(&tp(), decode(testing::batch(0, &["aaaa", "bbbb", "cccc"])), Vec::new(), 10)
            .unwrap();
        assert_eq!(offsets(&state), vec![0, 1]);
        assert_eq!((state.buffered, state.fetch_offset), (8, 2));
    }

    // Fetches which each cover the fetch offset, but overlap earlier fetches
    // by arbitrary amounts, buffer every offset exactly once and in order.
    #[quickcheck_macros::quickcheck]
    fn prop_overlapping_fetches_concatenate(fetches: Vec<(u8, u8)>) -> bool {
        let mut state = fetching_at(0);
        let mut delivered = Vec::new();

        for (overlap, extra) in fetches {
            let next = state.fetch_offset;
            let base = next - (overlap as i64 % 8).min(next);
            let len = (next - base) + 1 + (extra as i64 % 5);

            let values: Vec<String> = (base..base + len).map(|o| o.to_string()).collect();
            let values: Vec<&str> = values.iter().map(String::as_str).collect();

            if state
                .buffer_batches(&tp(), decode(testing::batch(base, &values)), Vec::new(), usize::MAX)
                .is_err()
            {
                return false;
            }
            delivered.extend(state.buffer.drain(..).map(|r| {
                assert_eq!(r.value.as_deref(), Some(r.offset.to_string().as_bytes()));
                r.offset
            }));
            state.buffered = 0;
        }
        delivered == (0..state.fetch_offset).collect::<Vec<_>>()
    }

    // Buffered bytes never exceed the limit, whatever the record sizes.
    #[quickcheck_macros::quickcheck]
    fn prop_buffer_respects_limit(sizes: Vec<u8>, limit: u16) -> bool {
        let limit = limit as usize;
        let values: Vec<String> = sizes.iter().map(|n| "x".repeat(*n as usize)).collect();
        if values.is_empty() {
            return true;
        }
        let values: Vec<&str> = values.iter().map(String::as_str).collect();

        let mut state = fetching_at(0);
        let result = state.buffer_batches(&tp(), decode(testing::batch(0, &values)), Vec::new(), limit);

        let held: usize = state.buffer.iter().map(ConsumerRecord::size).sum();
        let fits = match result {
            Ok(()) => true,
            Err(Error::RecordTooLarge { size, .. }) => state.buffer.is_empty() && size > limit,
            Err(_) => false,
        };
        fits && held == state.buffered && state.buffered <= limit
    }

    // A MockBroker serving partition "events-0" from a log of `len` records,
    // returning at most three records per fetch.
    struct MockLog {
        len: i64,
        // Offset at which the log starts, returned for a reset to earliest.
        start: i64,
        fetches: Mutex<Vec<i64>>,
        list_timestamps: Mutex<Vec<i64>>,
    }

    impl MockLog {
        fn new(start: i64, len: i64) -> Arc<Self> {
            Arc::new(Self {
                len,
                start,
                fetches: Default::default(),
                list_timestamps: Default::default(),
            })
        }

        fn handle(&self, req: MockRequest) -> Reply {
            if req.is::<MetadataRequest>() {
                return Reply::respond::<MetadataRequest>(
                    &req,
                    &testing::metadata(&[(1, req.broker.as_str())], &[("events", 1, 1)]),
                );
            }
            if req.is::<ListOffsetsRequest>() {
                use messages::list_offsets_response::*;

                let request: ListOffsetsRequest = req.decode();
                let timestamp = request.topics[0].partitions[0].timestamp;
                self.list_timestamps.lock().unwrap().push(timestamp);

                let offset = if timestamp == EARLIEST_TIMESTAMP { self.start } else { self.len };
                let response = messages::ListOffsetsResponse::default().with_topics(vec![
                    ListOffsetsTopicResponse::default()
                        .with_name(codec::topic_name("events"))
                        .with_partitions(vec![ListOffsetsPartitionResponse::default()
                            .with_partition_index(0)
                            .with_offset(offset)]),
                ]);
                return Reply::respond::<ListOffsetsRequest>(&req, &response);
            }
            assert!(req.is::<FetchRequest>());

            let request: FetchRequest = req.decode();
            let offset = request.topics[0].partitions[0].fetch_offset;
            self.fetches.lock().unwrap().push(offset);

            let mut data = PartitionData::default()
                .with_partition_index(0)
                .with_high_watermark(self.len);

            if offset < self.start || offset > self.len {
                data = data.with_error_code(ErrorCode::OFFSET_OUT_OF_RANGE.0);
            } else if offset < self.len {
                let values: Vec<String> = (offset..self.len.min(offset + 3))
                    .map(|o| format!("value-{o}"))
                    .collect();
                let values: Vec<&str> = values.iter().map(String::as_str).collect();
                data = data.with_records(Some(testing::batch(offset, &values)));
            }

            Reply::respond::<FetchRequest>(
                &req,
                &messages::FetchResponse::default().with_responses(vec![
                    FetchableTopicResponse::default()
                        .with_topic(codec::topic_name("events"))
                        .with_partitions(vec![data]),
                ]),
            )
        }
    }

    async fn start(log: &Arc<MockLog>, reset: OffsetReset) -> (MockBroker, Fetcher) {
        let broker = MockBroker::start({
            let log = log.clone();
            move |req| log.handle(req)
        })
        .await;

        let config = Config {
            bootstrap_servers: vec![broker.addr()],
            auto_offset_reset: reset,
            fetch_max_wait: Duration::from_millis(10),
            retry_backoff: Duration::from_millis(1),
            retry_backoff_max: Duration::from_millis(5),
            ..Default::default()
        };
        let fetcher = Fetcher::new(BrokerPool::new(Arc::new(config)));
        (broker, fetcher)
    }

    async fn poll_until(fetcher: &mut Fetcher, count: usize) -> Vec<ConsumerRecord> {
        let mut out = Vec::new();
        while out.len() < count {
            out.extend(fetcher.poll(Duration::from_secs(5)).await.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_fetches_from_reset_offset() {
        let log = MockLog::new(2, 10);
        let (_broker, mut fetcher) = start(&log, OffsetReset::Earliest).await;

        fetcher.assign([tp()]);
        assert_eq!(fetcher.position(&tp()), None);

        let records = poll_until(&mut fetcher, 8).await;
        let got: Vec<(i64, String)> = records
            .iter()
            .map(|r| (r.offset, String::from_utf8(r.value.clone().unwrap().to_vec()).unwrap()))
            .collect();
        let expect: Vec<(i64, String)> = (2..10).map(|o| (o, format!("value-{o}"))).collect();

        assert_eq!(got, expect);
        assert_eq!(fetcher.position(&tp()), Some(10));
        assert_eq!(*log.list_timestamps.lock().unwrap(), vec![EARLIEST_TIMESTAMP]);
        assert_eq!(&log.fetches.lock().unwrap()[..3], &[2, 5, 8]);
    }

    #[tokio::test]
    async fn test_out_of_range_applies_reset_policy() {
        let log = MockLog::new(0, 6);
        let (_broker, mut fetcher) = start(&log, OffsetReset::Latest).await;

        fetcher.assign([tp()]);
        assert!(fetcher.seek(&tp(), 50));

        // Reset to the latest offset, from which there's nothing to read.
        let records = fetcher.poll(Duration::from_millis(100)).await.unwrap();
        assert!(records.is_empty());
        assert_eq!(fetcher.position(&tp()), Some(6));
        assert_eq!(*log.list_timestamps.lock().unwrap(), vec![LATEST_TIMESTAMP]);
        assert_eq!(log.fetches.lock().unwrap()[0], 50);
    }

    #[tokio::test]
    async fn test_out_of_range_without_reset_policy() {
        let log = MockLog::new(0, 6);
        let (_broker, mut fetcher) = start(&log, OffsetReset::None).await;

        fetcher.assign([tp()]);
        let err = fetcher.poll(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, Error::NoOffset(ref p) if *p == tp()), "{err:?}");

        fetcher.seek(&tp(), 50);
        let err = fetcher.poll(Duration::from_secs(5)).await.unwrap_err();
        assert!(
            matches!(err, Error::OffsetOutOfRange { offset: 50, .. }),
            "{err:?}"
        );
        assert!(log.list_timestamps.lock().unwrap().is_empty());

        // Seeking clears the error.
        fetcher.seek(&tp(), 4);
        let records = poll_until(&mut fetcher, 2).await;
        assert_eq!(records.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![4, 5]);
    }

    #[tokio::test]
    async fn test_out_of_order_fetch_halts_until_seek() {
        let broker = MockBroker::start(|req| {
            if req.is::<MetadataRequest>() {
                return Reply::respond::<MetadataRequest>(
                    &req,
                    &testing::metadata(&[(1, req.broker.as_str())], &[("events", 1, 1)]),
                );
            }
            let request: FetchRequest = req.decode();
            let offset = request.topics[0].partitions[0].fetch_offset;

            // The broker skips ahead to 107 when asked for 100.
            let base = if offset == 100 { 107 } else { offset };
            Reply::respond::<FetchRequest>(
                &req,
                &messages::FetchResponse::default().with_responses(vec![
                    FetchableTopicResponse::default()
                        .with_topic(codec::topic_name("events"))
                        .with_partitions(vec![PartitionData::default()
                            .with_partition_index(0)
                            .with_records(Some(testing::batch(base, &["v"])))]),
                ]),
            )
        })
        .await;

        let pool = BrokerPool::new(Arc::new(Config {
            bootstrap_servers: vec![broker.addr()],
            ..Default::default()
        }));
        let mut fetcher = Fetcher::new(pool);
        fetcher.assign([tp()]);
        fetcher.seek(&tp(), 100);

        let err = fetcher.poll(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(
            err,
            Error::OutOfOrder { expected: 100, actual: 107, .. }
        ));

        // The partition is halted: nothing further is fetched.
        let fetches = broker.count::<FetchRequest>();
        assert!(fetcher.poll(Duration::from_millis(50)).await.unwrap().is_empty());
        assert_eq!(broker.count::<FetchRequest>(), fetches);

        fetcher.seek(&tp(), 107);
        let records = fetcher.poll(Duration::from_secs(5)).await.unwrap();
        assert_eq!(records[0].offset, 107);
    }

    #[tokio::test]
    async fn test_buffered_bytes_stay_within_budget() {
        let log = MockLog::new(0, 1000);
        let broker = MockBroker::start({
            let log = log.clone();
            move |req| log.handle(req)
        })
        .await;

        // Each record value is "value-NNN", so three records fit in 30 bytes.
        let pool = BrokerPool::new(Arc::new(Config {
            bootstrap_servers: vec![broker.addr()],
            fetch_buffer_bytes: 30,
            max_poll_records: 2,
            ..Default::default()
        }));
        let mut fetcher = Fetcher::new(pool);
        fetcher.assign([tp()]);
        fetcher.seek(&tp(), 100);

        let mut next = 100;
        for _ in 0..20 {
            for record in fetcher.poll(Duration::from_secs(5)).await.unwrap() {
                assert_eq!(record.offset, next);
                next += 1;
            }
            assert!(fetcher.buffered_bytes() <= 30);
        }
        assert!(next >= 120);
    }

    #[tokio::test]
    async fn test_prefetched_records_are_applied_while_buffers_are_non_empty() {
        let log = MockLog::new(0, 100);
        let broker = MockBroker::start({
            let log = log.clone();
            move |req| log.handle(req)
        })
        .await;

        let pool = BrokerPool::new(Arc::new(Config {
            bootstrap_servers: vec![broker.addr()],
            max_poll_records: 1,
            ..Default::default()
        }));
        let mut fetcher = Fetcher::new(pool);
        fetcher.assign([tp()]);
        fetcher.seek(&tp(), 0);

        // Offsets 0-2 are fetched and 0 is returned. The remaining records
        // are below the low-water mark, so offset 3 onwards is prefetched.
        let records = fetcher.poll(Duration::from_secs(5)).await.unwrap();
        assert_eq!(records[0].offset, 0);
        let before = fetcher.buffered_bytes();

        while log.fetches.lock().unwrap().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The prefetched response is buffered before record 1 is returned.
        let records = fetcher.poll(Duration::from_secs(5)).await.unwrap();
        assert_eq!(records[0].offset, 1);
        assert!(fetcher.buffered_bytes() > before, "{} <= {before}", fetcher.buffered_bytes());
    }

    #[tokio::test]
    async fn test_reassignment_discards_revoked_buffers() {
        let log = MockLog::new(0, 10);
        let (_broker, mut fetcher) = start(&log, OffsetReset::Earliest).await;

        fetcher.assign([tp()]);
        poll_until(&mut fetcher, 1).await;
        assert!(fetcher.position(&tp()).is_some());

        fetcher.assign([TopicPartition::new("events", 1)]);
        assert_eq!(fetcher.position(&tp()), None);
        assert_eq!(fetcher.buffered_bytes(), 0);
        assert_eq!(
            fetcher.assignment(),
            BTreeSet::from([TopicPartition::new("events", 1)])
        );
        assert!(!fetcher.seek(&tp(), 0));
    }
}
