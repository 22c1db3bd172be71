use super::accumulator::{Accumulator, ProducerBatch, Ready};
use super::{CloseMode, ProducerRecord, ProducerSession};
use crate::codec::{self, ErrorCode};
use crate::retry::{self, Retry};
use crate::{Acks, BrokerPool, Config, Error, Result};
use bytes::Bytes;
use kafka_protocol::messages;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::Instant;

pub(super) enum Control {
    Close(CloseMode, oneshot::Sender<Vec<ProducerRecord>>),
}

/// Sender drains ready batches from the Accumulator, and sends them to
/// partition leaders in Produce requests grouped by leader.
pub(super) struct Sender {
    pool: BrokerPool,
    config: Arc<Config>,
    accumulator: Arc<Accumulator>,
    session: Option<ProducerSession>,
    // When a lost session may next be renewed.
    renew_at: Option<Instant>,
    requests: JoinSet<Outcome>,
}

struct Outcome {
    node_id: i32,
    session: Option<ProducerSession>,
    batches: Vec<ProducerBatch>,
    result: Result<Option<messages::ProduceResponse>>,
}

impl Sender {
    pub fn new(
        pool: BrokerPool,
        config: Arc<Config>,
        accumulator: Arc<Accumulator>,
        session: Option<ProducerSession>,
    ) -> Self {
        Self {
            pool,
            config,
            accumulator,
            session,
            renew_at: None,
            requests: JoinSet::new(),
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(client_id = %self.config.client_id))]
    pub async fn run(mut self, mut control: mpsc::UnboundedReceiver<Control>) {
        let mut closing: Option<oneshot::Sender<Vec<ProducerRecord>>> = None;
        let mut abandoned = Vec::new();

        loop {
            let now = Instant::now();
            let mut wake = None;

            if self.config.enable_idempotence && self.session.is_none() {
                self.renew_session(now).await;
            }
            if self.config.enable_idempotence && self.session.is_none() {
                let expires = self.accumulator.expire(now);
                wake = match (self.renew_at, expires) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
            } else {
                let drained = self
                    .accumulator
                    .drain(now, &self.pool.snapshot(), self.session);

                if drained.missing_leader {
                    self.pool.request_refresh();
                    let retry_at = now + self.config.retry_backoff;
                    wake = Some(drained.wake.map_or(retry_at, |at| at.min(retry_at)));
                } else if drained.wake.is_some() {
                    wake = drained.wake;
                }
                self.dispatch(drained.ready);
            }

            if closing.is_some() && self.requests.is_empty() && self.accumulator.is_idle() {
                break;
            }

            tokio::select! {
                Some(Control::Close(mode, reply)) = control.recv(), if closing.is_none() => {
                    match mode {
                        CloseMode::Flush => self.accumulator.close(),
                        CloseMode::Abort => abandoned = self.accumulator.abandon(),
                    }
                    closing = Some(reply);
                }
                Some(joined) = self.requests.join_next() => match joined {
                    Ok(outcome) => self.on_outcome(outcome),
                    Err(err) => tracing::error!(error = %err, "produce task failed"),
                },
                () = self.accumulator.notified() => {}
                () = sleep_until(wake) => {}
            }
        }

        tracing::debug!(abandoned = abandoned.len(), "producer sender stopped");
        if let Some(reply) = closing {
            let _ = reply.send(abandoned);
        }
    }

    async fn renew_session(&mut self, now: Instant) {
        if self.renew_at.is_some_and(|at| at > now) {
            return;
        }
        match init_session(&self.pool).await {
            Ok(session) => {
                tracing::info!(
                    producer_id = session.producer_id,
                    epoch = session.epoch,
                    "renewed producer session"
                );
                self.session = Some(session);
                self.renew_at = None;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to renew producer session (will retry)");
                self.renew_at = Some(Instant::now() + self.config.retry_backoff_max);
            }
        }
    }

    fn dispatch(&mut self, ready: Vec<Ready>) {
        let mut by_leader: BTreeMap<i32, Vec<Ready>> = BTreeMap::new();
        for ready in ready {
            by_leader.entry(ready.leader).or_default().push(ready);
        }

        for (node_id, ready) in by_leader {
            let pool = self.pool.clone();
            let config = self.config.clone();
            let session = self.session;

            self.requests.spawn(async move {
                let (batches, encoded): (Vec<ProducerBatch>, Vec<Bytes>) =
                    ready.into_iter().map(|r| (r.batch, r.encoded)).unzip();
                let result = produce(&pool, &config, node_id, &batches, encoded).await;

                Outcome {
                    node_id,
                    session,
                    batches,
                    result,
                }
            });
        }
    }

    fn on_outcome(&mut self, outcome: Outcome) {
        let Outcome {
            node_id,
            session,
            batches,
            result,
        } = outcome;

        let response = match result {
            Ok(Some(response)) => response,
            Ok(None) => {
                // Acks are disabled, and offsets are unknown.
                for batch in batches {
                    self.on_delivered(batch, -1, -1);
                }
                return;
            }
            Err(err) => {
                tracing::debug!(node_id, error = %err, "produce request failed");
                for batch in batches {
                    self.on_failure(batch, err.clone());
                }
                return;
            }
        };

        let mut partitions = HashMap::new();
        for topic in response.responses {
            for partition in topic.partition_responses {
                partitions.insert((topic.name.0.to_string(), partition.index), partition);
            }
        }

        for batch in batches {
            let Some(partition) = partitions.remove(&(batch.tp.topic.clone(), batch.tp.partition)) else {
                let err = Error::CorruptMessage(format!("produce response omits partition {}", batch.tp));
                self.accumulator.fail(batch, err);
                continue;
            };
            let code = ErrorCode(partition.error_code);

            if code == ErrorCode::NONE
                || (code == ErrorCode::DUPLICATE_SEQUENCE_NUMBER && batch.session().is_some())
            {
                self.on_delivered(batch, partition.base_offset, partition.log_append_time_ms);
            } else if code.is_sequence_error() && batch.session().is_some() {
                tracing::warn!(
                    partition = %batch.tp,
                    sequence = batch.base_sequence(),
                    %code,
                    "producer sequence rejected; starting a new producer session"
                );
                if self.session == session {
                    self.session = None;
                    self.renew_at = None;
                    self.accumulator.reset_sequences();
                }
                let err = Error::Sequence {
                    partition: batch.tp.clone(),
                    sequence: batch.base_sequence(),
                    code,
                };
                self.accumulator.fail(batch, err);
            } else {
                self.on_failure(batch, Error::Broker(code));
            }
        }
    }

    fn on_delivered(&self, batch: ProducerBatch, base_offset: i64, log_append_time: i64) {
        metrics::counter!("kafka_client_produced_records", "topic" => batch.tp.topic.clone())
            .increment(batch.record_count() as u64);
        self.accumulator.complete(batch, base_offset, log_append_time);
    }

    fn on_failure(&self, mut batch: ProducerBatch, err: Error) {
        if matches!(err, Error::Connect { .. } | Error::ConnectionLost { .. })
            || err.code().is_some_and(ErrorCode::invalidates_metadata)
        {
            self.pool.invalidate_leader(&batch.tp);
        }
        if !err.is_retryable() {
            tracing::warn!(partition = %batch.tp, error = %err, "failed to deliver producer batch");
            self.accumulator.fail(batch, err);
            return;
        }

        batch.attempts += 1;
        if batch.attempts > self.config.retries {
            tracing::warn!(
                partition = %batch.tp,
                attempts = batch.attempts,
                error = %err,
                "giving up on delivery of producer batch"
            );
            let err = Error::PermanentFailure {
                partition: batch.tp.clone(),
                attempts: batch.attempts,
                source: Box::new(err),
            };
            self.accumulator.fail(batch, err);
            return;
        }

        let delay = retry::delay(&self.config, batch.attempts);
        tracing::debug!(
            partition = %batch.tp,
            attempt = batch.attempts,
            ?delay,
            error = %err,
            "retrying producer batch"
        );
        self.accumulator.retry(batch, Instant::now() + delay);
    }
}

async fn produce(
    pool: &BrokerPool,
    config: &Config,
    node_id: i32,
    batches: &[ProducerBatch],
    encoded: Vec<Bytes>,
) -> Result<Option<messages::ProduceResponse>> {
    use messages::produce_request::{PartitionProduceData, TopicProduceData};

    let mut topics: BTreeMap<&str, Vec<PartitionProduceData>> = BTreeMap::new();
    for (batch, records) in batches.iter().zip(encoded) {
        topics.entry(&batch.tp.topic).or_default().push(
            PartitionProduceData::default()
                .with_index(batch.tp.partition)
                .with_records(Some(records)),
        );
    }
    let topic_data = topics
        .into_iter()
        .map(|(topic, partitions)| {
            TopicProduceData::default()
                .with_name(codec::topic_name(topic))
                .with_partition_data(partitions)
        })
        .collect();

    let request = messages::ProduceRequest::default()
        .with_acks(config.acks.as_i16())
        .with_timeout_ms(config.request_timeout.as_millis() as i32)
        .with_topic_data(topic_data);

    let conn = pool.connection_for(node_id).await?;
    if config.acks == Acks::None {
        conn.send_without_response(&request).await?.await?;
        Ok(None)
    } else {
        Ok(Some(conn.request(&request).await?))
    }
}

/// Acquire a producer id and epoch for an idempotent producer.
pub(super) async fn init_session(pool: &BrokerPool) -> Result<ProducerSession> {
    let config = pool.config();
    let mut retry = Retry::from_config(config, config.routing_retries);

    loop {
        let err = match try_init_session(pool).await {
            Ok(session) => return Ok(session),
            Err(err) => err,
        };
        if !err.is_retryable() {
            return Err(err);
        }
        tracing::warn!(attempt = retry.attempts(), error = %err, "failed to initialize producer id (will retry)");

        if !retry.wait().await {
            return Err(err);
        }
    }
}

async fn try_init_session(pool: &BrokerPool) -> Result<ProducerSession> {
    let request = messages::InitProducerIdRequest::default().with_transaction_timeout_ms(60_000);

    let conn = pool.any_connection().await?;
    let response = conn.request(&request).await?;
    ErrorCode::check(response.error_code).map_err(Error::Broker)?;

    Ok(ProducerSession {
        producer_id: response.producer_id.0,
        epoch: response.producer_epoch,
    })
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
