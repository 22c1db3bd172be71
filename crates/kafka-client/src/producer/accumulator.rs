use super::{DeliveryFuture, Partitioner, ProducerRecord, ProducerSession, RecordMetadata};
use crate::codec::records::RecordBatchBuilder;
use crate::{ClusterView, Config, Error, Result, TopicPartition};
use bytes::Bytes;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, watch, Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;

/// Accumulator holds appended records in per-partition queues of batches,
/// until the Sender drains them for delivery.
pub(super) struct Accumulator {
    config: Arc<Config>,
    // Permits are bytes of `buffer_memory`, held by each record until it's delivered.
    memory: Arc<Semaphore>,
    partitioner: Partitioner,
    state: Mutex<State>,
    wake: Notify,
    // Number of records which were appended and not yet delivered or failed.
    pending: Arc<watch::Sender<usize>>,
}

#[derive(Default)]
struct State {
    queues: BTreeMap<TopicPartition, Queue>,
    flushing: usize,
    closed: bool,
    aborted: bool,
    // Index of the queue which the next drain visits first.
    cursor: usize,
}

#[derive(Default)]
struct Queue {
    batches: VecDeque<ProducerBatch>,
    in_flight: usize,
    // Sequence number of the next record under the current producer session.
    next_sequence: i32,
}

/// A batch of records bound for one partition.
pub(super) struct ProducerBatch {
    pub tp: TopicPartition,
    builder: RecordBatchBuilder,
    records: Vec<Pending>,
    // A closed batch accepts no further records.
    closed: bool,
    created: Instant,
    /// Failed attempts to deliver this batch.
    pub attempts: u32,
    retry_at: Option<Instant>,
    // Encoding of the batch, and the session it was stamped under.
    // A retry under the same session sends identical bytes.
    stamp: Option<(Option<ProducerSession>, Bytes)>,
    base_sequence: i32,
}

struct Pending {
    record: ProducerRecord,
    timestamp: i64,
    delivery: oneshot::Sender<Result<RecordMetadata>>,
    _permit: OwnedSemaphorePermit,
    _count: PendingCount,
}

// Decrements the pending record count when dropped, however the record is released.
struct PendingCount(Arc<watch::Sender<usize>>);

impl Drop for PendingCount {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n -= 1);
    }
}

/// A batch drained for delivery to `leader`.
pub(super) struct Ready {
    pub leader: i32,
    pub encoded: Bytes,
    pub batch: ProducerBatch,
}

#[derive(Default)]
pub(super) struct Drained {
    pub ready: Vec<Ready>,
    /// Earliest time at which a queued batch becomes ready or expires.
    pub wake: Option<Instant>,
    /// Whether a ready batch is held back by an unknown partition leader.
    pub missing_leader: bool,
}

impl Accumulator {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            memory: Arc::new(Semaphore::new(config.buffer_memory)),
            partitioner: Partitioner::new(config.sticky_partition_interval),
            state: Default::default(),
            wake: Notify::new(),
            pending: Arc::new(watch::Sender::new(0)),
            config,
        }
    }

    pub fn partitioner(&self) -> &Partitioner {
        &self.partitioner
    }

    /// Reserve `size` bytes of buffer memory, failing if they're not available now.
    pub fn try_reserve(&self, size: usize) -> Result<OwnedSemaphorePermit> {
        match self.memory.clone().try_acquire_many_owned(size as u32) {
            Ok(permit) => Ok(permit),
            Err(TryAcquireError::NoPermits) => Err(Error::BufferFull),
            Err(TryAcquireError::Closed) => Err(Error::Closed),
        }
    }

    /// Reserve `size` bytes of buffer memory, waiting for delivered records to release them.
    pub async fn reserve(&self, size: usize) -> Result<OwnedSemaphorePermit> {
        self.memory
            .clone()
            .acquire_many_owned(size as u32)
            .await
            .map_err(|_| Error::Closed)
    }

    /// Append `record` to the open batch of `tp`, starting a new batch if
    /// there's none or the record doesn't fit. Also returns whether a
    /// batch was closed by this append.
    pub fn append(
        &self,
        tp: TopicPartition,
        record: ProducerRecord,
        permit: OwnedSemaphorePermit,
    ) -> Result<(DeliveryFuture, bool)> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(Error::Closed);
        }
        let timestamp = record.timestamp.unwrap_or_else(now_millis);
        let queue = state.queues.entry(tp.clone()).or_default();

        let mut closed_batch = false;
        let appended = match queue.batches.back_mut() {
            Some(batch) if !batch.closed => {
                if batch.try_append(timestamp, &record) {
                    true
                } else {
                    batch.closed = true;
                    closed_batch = true;
                    false
                }
            }
            _ => false,
        };
        if !appended {
            let mut batch = ProducerBatch::new(tp, &self.config);
            batch.try_append(timestamp, &record); // The first record always fits.
            queue.batches.push_back(batch);
        }

        let batch = queue
            .batches
            .back_mut()
            .ok_or_else(|| Error::CorruptMessage("producer queue is empty after append".to_string()))?;

        if batch.builder.size_in_bytes() >= self.config.batch_size {
            batch.closed = true;
            closed_batch = true;
        }

        let (delivery, rx) = oneshot::channel();
        self.pending.send_modify(|n| *n += 1);
        batch.records.push(Pending {
            record,
            timestamp,
            delivery,
            _permit: permit,
            _count: PendingCount(self.pending.clone()),
        });
        drop(state);

        // The Sender schedules lingering of new batches, and sends closed ones.
        if !appended || closed_batch {
            self.wake.notify_one();
        }
        Ok((DeliveryFuture { rx }, closed_batch))
    }

    /// Drain batches which are ready to send to a known leader, and fail
    /// batches which have outlived `delivery_timeout`. Batches are stamped
    /// with `session`, if any.
    pub fn drain(&self, now: Instant, view: &ClusterView, session: Option<ProducerSession>) -> Drained {
        let max_in_flight = if self.config.enable_idempotence {
            1
        } else {
            self.config.max_in_flight_requests_per_connection
        };
        let mut out = Drained::default();
        let mut expired = Vec::new();
        let mut failed = Vec::new();
        let mut rotate = Vec::new();

        let mut state = self.state.lock().unwrap();
        let hurry = state.flushing != 0 || state.closed;

        let mut order: Vec<TopicPartition> = state.queues.keys().cloned().collect();
        if !order.is_empty() {
            let start = state.cursor % order.len();
            order.rotate_left(start);
        }
        state.cursor = state.cursor.wrapping_add(1);

        for tp in order {
            let Some(queue) = state.queues.get_mut(&tp) else {
                continue;
            };
            self.expire_queue(queue, now, &mut expired);

            while let Some(front) = queue.batches.front() {
                let mut ready_at = front.created + self.config.linger;
                if front.closed || hurry {
                    ready_at = now;
                }
                if let Some(retry_at) = front.retry_at {
                    ready_at = retry_at;
                }
                if ready_at > now {
                    wake_at(&mut out.wake, ready_at);
                    break;
                }
                if queue.in_flight >= max_in_flight {
                    break;
                }
                let Some(leader) = view.leader(&tp) else {
                    out.missing_leader = true;
                    break;
                };
                let Some(mut batch) = queue.batches.pop_front() else {
                    break;
                };

                if !batch.closed {
                    batch.closed = true;
                    rotate.push(tp.clone());
                }
                match batch.stamp(session, &mut queue.next_sequence) {
                    Ok(encoded) => {
                        queue.in_flight += 1;
                        out.ready.push(Ready {
                            leader: leader.node_id,
                            encoded,
                            batch,
                        });
                    }
                    Err(err) => failed.push((batch, err)),
                }
            }

            if let Some(front) = queue.batches.front() {
                wake_at(&mut out.wake, front.created + self.config.delivery_timeout);
            }
        }
        state.queues.retain(|_, queue| !queue.batches.is_empty() || queue.in_flight != 0);
        drop(state);

        self.fail_expired(expired);
        for (batch, err) in failed {
            tracing::error!(partition = %batch.tp, error = %err, "failed to encode producer batch");
            batch.fail(err);
        }
        for tp in rotate {
            self.partitioner.on_batch_closed(
                &tp.topic,
                tp.partition,
                &view.available_partitions(&tp.topic),
                view.partition_count(&tp.topic).unwrap_or(1),
            );
        }
        out
    }

    /// Fail queued batches which have outlived `delivery_timeout`, without draining any.
    pub fn expire(&self, now: Instant) -> Option<Instant> {
        let mut expired = Vec::new();
        let mut wake = None;

        let mut state = self.state.lock().unwrap();
        for queue in state.queues.values_mut() {
            self.expire_queue(queue, now, &mut expired);
            if let Some(front) = queue.batches.front() {
                wake_at(&mut wake, front.created + self.config.delivery_timeout);
            }
        }
        drop(state);

        self.fail_expired(expired);
        wake
    }

    fn expire_queue(&self, queue: &mut Queue, now: Instant, expired: &mut Vec<ProducerBatch>) {
        while let Some(front) = queue.batches.front() {
            if now < front.created + self.config.delivery_timeout {
                break;
            }
            expired.extend(queue.batches.pop_front());
        }
    }

    fn fail_expired(&self, expired: Vec<ProducerBatch>) {
        for batch in expired {
            tracing::warn!(
                partition = %batch.tp,
                records = batch.records.len(),
                attempts = batch.attempts,
                "producer batch expired before delivery"
            );
            batch.fail(Error::Timeout(self.config.delivery_timeout));
        }
    }

    /// Deliver the records of an in-flight batch written at `base_offset`.
    pub fn complete(&self, batch: ProducerBatch, base_offset: i64, log_append_time: i64) {
        self.release(&batch.tp);
        batch.complete(base_offset, log_append_time);
    }

    /// Fail the records of an in-flight batch.
    pub fn fail(&self, batch: ProducerBatch, err: Error) {
        self.release(&batch.tp);
        batch.fail(err);
    }

    /// Return an in-flight batch to the front of its queue, to be sent
    /// again at `retry_at`. Once the Accumulator is aborted, the batch
    /// is failed instead.
    pub fn retry(&self, mut batch: ProducerBatch, retry_at: Instant) {
        let mut state = self.state.lock().unwrap();

        if state.aborted {
            drop(state);
            self.release(&batch.tp);
            batch.fail(Error::Closed);
            return;
        }
        batch.retry_at = Some(retry_at);
        let queue = state.queues.entry(batch.tp.clone()).or_default();
        queue.in_flight = queue.in_flight.saturating_sub(1);
        queue.batches.push_front(batch);
        drop(state);

        self.wake.notify_one();
    }

    /// Restart the sequence numbers of every partition, for a new producer session.
    pub fn reset_sequences(&self) {
        let mut state = self.state.lock().unwrap();
        for queue in state.queues.values_mut() {
            queue.next_sequence = 0;
        }
    }

    /// Stop accepting records. Queued batches are sent without lingering.
    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.memory.close();
        self.wake.notify_one();
    }

    /// Stop accepting records, and abandon every batch which isn't in flight.
    /// Futures of abandoned records fail with Closed, and the records are returned.
    pub fn abandon(&self) -> Vec<ProducerRecord> {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        state.aborted = true;

        let batches: Vec<ProducerBatch> = state
            .queues
            .values_mut()
            .flat_map(|queue| queue.batches.drain(..))
            .collect();
        drop(state);
        self.memory.close();

        let mut records = Vec::new();
        for batch in batches {
            for pending in batch.records {
                let _ = pending.delivery.send(Err(Error::Closed));
                records.push(pending.record);
            }
        }
        records
    }

    /// Hold a flush open, which sends queued batches without lingering, until dropped.
    pub fn begin_flush(&self) -> FlushGuard<'_> {
        self.state.lock().unwrap().flushing += 1;
        self.wake.notify_one();
        FlushGuard(self)
    }

    /// Wait until every appended record has been delivered or failed.
    pub async fn wait_idle(&self) {
        let mut rx = self.pending.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    pub fn is_idle(&self) -> bool {
        *self.pending.borrow() == 0
    }

    /// Resolves when batches may have become ready to drain.
    pub async fn notified(&self) {
        self.wake.notified().await
    }

    fn release(&self, tp: &TopicPartition) {
        let mut state = self.state.lock().unwrap();
        if let Some(queue) = state.queues.get_mut(tp) {
            queue.in_flight = queue.in_flight.saturating_sub(1);
        }
        drop(state);
        self.wake.notify_one();
    }
}

pub(super) struct FlushGuard<'a>(&'a Accumulator);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.state.lock().unwrap().flushing -= 1;
    }
}

impl ProducerBatch {
    fn new(tp: TopicPartition, config: &Config) -> Self {
        Self {
            tp,
            builder: RecordBatchBuilder::new(config.compression, config.batch_size),
            records: Vec::new(),
            closed: false,
            created: Instant::now(),
            attempts: 0,
            retry_at: None,
            stamp: None,
            base_sequence: -1,
        }
    }

    fn try_append(&mut self, timestamp: i64, record: &ProducerRecord) -> bool {
        self.builder
            .append(
                timestamp,
                record.key.as_deref(),
                record.value.as_deref(),
                &record.headers,
            )
            .is_some()
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Base sequence number of the batch, or -1 if it isn't idempotent.
    pub fn base_sequence(&self) -> i32 {
        self.base_sequence
    }

    /// Session under which the batch was last stamped.
    pub fn session(&self) -> Option<ProducerSession> {
        self.stamp.as_ref().and_then(|(session, _)| *session)
    }

    // Encode the batch under `session`. A batch already stamped under
    // `session` keeps its encoding and sequence. Otherwise it takes the
    // partition's next sequence, which advances by the batch's record count.
    fn stamp(&mut self, session: Option<ProducerSession>, next_sequence: &mut i32) -> Result<Bytes> {
        if let Some((stamped, encoded)) = &self.stamp {
            if *stamped == session {
                return Ok(encoded.clone());
            }
        }

        match session {
            Some(ProducerSession { producer_id, epoch }) => {
                self.base_sequence = *next_sequence;
                *next_sequence = increment_sequence(*next_sequence, self.builder.record_count());
                self.builder.set_producer_state(producer_id, epoch, self.base_sequence);
            }
            None => {
                self.base_sequence = -1;
                self.builder.set_producer_state(-1, -1, -1);
            }
        }
        let encoded = self.builder.build()?;
        self.stamp = Some((session, encoded.clone()));
        Ok(encoded)
    }

    fn complete(self, base_offset: i64, log_append_time: i64) {
        let topic = self.tp.topic;
        let partition = self.tp.partition;

        for (index, pending) in self.records.into_iter().enumerate() {
            let metadata = RecordMetadata {
                topic: topic.clone(),
                partition,
                offset: if base_offset < 0 { -1 } else { base_offset + index as i64 },
                timestamp: if log_append_time < 0 { pending.timestamp } else { log_append_time },
            };
            let _ = pending.delivery.send(Ok(metadata));
        }
    }

    fn fail(self, err: Error) {
        for pending in self.records {
            let _ = pending.delivery.send(Err(err.clone()));
        }
    }
}

fn wake_at(wake: &mut Option<Instant>, at: Instant) {
    *wake = Some(wake.map_or(at, |current| current.min(at)));
}

// Sequence numbers wrap from i32::MAX to zero.
fn increment_sequence(sequence: i32, count: i32) -> i32 {
    if sequence > i32::MAX - count {
        count - (i32::MAX - sequence) - 1
    } else {
        sequence + count
    }
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use pretty_assertions::assert_eq;
    use quickcheck_macros::quickcheck;
    use std::time::Duration;

    fn config(linger: Duration, batch_size: usize, buffer_memory: usize) -> Arc<Config> {
        Arc::new(Config {
            linger,
            batch_size,
            buffer_memory,
            delivery_timeout: Duration::from_secs(60),
            ..Default::default()
        })
    }

    fn view() -> ClusterView {
        ClusterView::from_response(
            1,
            testing::metadata(&[(1, "localhost:9092")], &[("t", 2, 1)]),
        )
    }

    fn session() -> Option<ProducerSession> {
        Some(ProducerSession {
            producer_id: 7,
            epoch: 0,
        })
    }

    fn append(acc: &Accumulator, partition: i32, value: &str) -> DeliveryFuture {
        let record = ProducerRecord::new("t", value.to_string()).with_partition(partition);
        let permit = acc.try_reserve(value.len()).unwrap();
        acc.append(TopicPartition::new("t", partition), record, permit)
            .unwrap()
            .0
    }

    #[test]
    fn test_full_batches_drain_without_lingering() {
        // Each record's size estimate is about 40 bytes, so that a 61-byte
        // header and two records fill the batch.
        let acc = Accumulator::new(config(Duration::from_secs(60), 150, 1 << 20));
        for value in ["a", "b", "c", "d", "e"] {
            append(&acc, 0, value);
        }
        let drained = acc.drain(Instant::now(), &view(), None);

        let counts: Vec<usize> = drained.ready.iter().map(|r| r.batch.record_count()).collect();
        assert_eq!(counts, vec![2, 2]);
        assert!(drained.ready.iter().all(|r| r.leader == 1));
        // The open batch lingers.
        assert!(drained.wake.is_some());
    }

    #[test]
    fn test_flush_drains_open_batches() {
        let acc = Accumulator::new(config(Duration::from_secs(60), 1 << 14, 1 << 20));
        append(&acc, 0, "a");
        append(&acc, 1, "b");

        assert!(acc.drain(Instant::now(), &view(), None).ready.is_empty());

        let guard = acc.begin_flush();
        let drained = acc.drain(Instant::now(), &view(), None);
        assert_eq!(drained.ready.len(), 2);
        drop(guard);
        assert_eq!(acc.state.lock().unwrap().flushing, 0);
    }

    #[test]
    fn test_lingered_batches_drain() {
        let acc = Accumulator::new(config(Duration::from_millis(10), 1 << 14, 1 << 20));
        append(&acc, 0, "a");

        let now = Instant::now();
        let drained = acc.drain(now, &view(), None);
        assert!(drained.ready.is_empty());
        let wake = drained.wake.unwrap();
        assert!(wake <= now + Duration::from_millis(10));

        assert_eq!(acc.drain(wake, &view(), None).ready.len(), 1);
    }

    #[test]
    fn test_unknown_leader_holds_batches() {
        let acc = Accumulator::new(config(Duration::ZERO, 1 << 14, 1 << 20));
        let record = ProducerRecord::new("other", "x");
        let permit = acc.try_reserve(1).unwrap();
        acc.append(TopicPartition::new("other", 0), record, permit).unwrap();

        let drained = acc.drain(Instant::now(), &view(), None);
        assert!(drained.ready.is_empty());
        assert!(drained.missing_leader);
    }

    #[test]
    fn test_buffer_full() {
        let acc = Accumulator::new(config(Duration::ZERO, 10, 10));
        let first = acc.try_reserve(8).unwrap();
        assert!(matches!(acc.try_reserve(4), Err(Error::BufferFull)));

        drop(first);
        assert!(acc.try_reserve(4).is_ok());
    }

    #[tokio::test]
    async fn test_expired_batches_fail_with_timeout() {
        let acc = Accumulator::new(Arc::new(Config {
            linger: Duration::from_secs(60),
            delivery_timeout: Duration::from_millis(20),
            ..Default::default()
        }));
        let delivery = append(&acc, 0, "a");

        let later = Instant::now() + Duration::from_millis(30);
        assert!(acc.drain(later, &view(), None).ready.is_empty());

        assert!(matches!(delivery.await, Err(Error::Timeout(_))));
        assert!(acc.is_idle());
    }

    #[tokio::test]
    async fn test_abandon_returns_queued_records() {
        let acc = Accumulator::new(config(Duration::from_secs(60), 1 << 14, 1 << 20));
        let first = append(&acc, 0, "a");
        let second = append(&acc, 1, "b");

        let mut abandoned: Vec<String> = acc
            .abandon()
            .into_iter()
            .map(|r| String::from_utf8(r.value.unwrap().to_vec()).unwrap())
            .collect();
        abandoned.sort();
        assert_eq!(abandoned, vec!["a".to_string(), "b".to_string()]);

        assert!(matches!(first.await, Err(Error::Closed)));
        assert!(matches!(second.await, Err(Error::Closed)));
        assert!(acc.is_idle());

        // Further appends and reservations are refused.
        assert!(matches!(acc.try_reserve(1), Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_completed_records_carry_offsets() {
        let acc = Accumulator::new(config(Duration::ZERO, 1 << 14, 1 << 20));
        let first = append(&acc, 0, "a");
        let second = append(&acc, 0, "b");

        let mut drained = acc.drain(Instant::now(), &view(), None);
        let ready = drained.ready.pop().unwrap();
        acc.complete(ready.batch, 40, -1);

        assert_eq!(first.await.unwrap().offset, 40);
        let second = second.await.unwrap();
        assert_eq!((second.partition, second.offset), (0, 41));
        assert!(acc.is_idle());
    }

    #[test]
    fn test_increment_sequence_wraps() {
        assert_eq!(increment_sequence(0, 5), 5);
        assert_eq!(increment_sequence(i32::MAX - 2, 2), i32::MAX);
        assert_eq!(increment_sequence(i32::MAX - 2, 3), 0);
        assert_eq!(increment_sequence(i32::MAX, 4), 3);
    }

    #[test]
    fn test_new_session_restamps_retried_batches() {
        let acc = Accumulator::new(Arc::new(Config {
            linger: Duration::ZERO,
            enable_idempotence: true,
            ..Default::default()
        }));
        append(&acc, 0, "a");
        append(&acc, 0, "b");

        let ready = acc.drain(Instant::now(), &view(), session()).ready.pop().unwrap();
        assert_eq!(ready.batch.base_sequence(), 0);
        acc.retry(ready.batch, Instant::now());

        acc.reset_sequences();
        let renewed = Some(ProducerSession {
            producer_id: 8,
            epoch: 0,
        });
        let ready = acc.drain(Instant::now(), &view(), renewed).ready.pop().unwrap();
        assert_eq!(ready.batch.base_sequence(), 0);
        assert_eq!(ready.batch.session(), renewed);

        let decoded = crate::codec::records::decode_batches(ready.encoded).unwrap();
        assert_eq!(decoded[0].producer_id, 8);
    }

    // Batches drained and retried any number of times keep their first
    // encoding and sequence, and successive batches of a partition take
    // sequences which increase by the record count of the batch before.
    #[quickcheck]
    fn prop_sequences_are_stable_across_retries(batches: Vec<(u8, u8)>) -> bool {
        let acc = Accumulator::new(Arc::new(Config {
            linger: Duration::ZERO,
            enable_idempotence: true,
            ..Default::default()
        }));
        let view = view();
        let mut expect_sequence = 0;

        for (records, retries) in batches.into_iter().take(20) {
            for n in 0..(records % 8) + 1 {
                append(&acc, 0, &format!("v{n}"));
            }
            let Some(first) = acc.drain(Instant::now(), &view, session()).ready.pop() else {
                return false;
            };
            if first.batch.base_sequence() != expect_sequence {
                return false;
            }

            let mut current = first.batch;
            for _ in 0..retries % 4 {
                acc.retry(current, Instant::now());
                let Some(again) = acc.drain(Instant::now(), &view, session()).ready.pop() else {
                    return false;
                };
                if again.encoded != first.encoded || again.batch.base_sequence() != expect_sequence {
                    return false;
                }
                current = again.batch;
            }

            expect_sequence += current.record_count() as i32;
            acc.complete(current, 0, -1);
        }
        acc.is_idle()
    }
}
