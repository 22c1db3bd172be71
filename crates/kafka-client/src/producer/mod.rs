//! Producing records.
//!
//! Appended records are partitioned and accumulated into per-partition
//! batches, which a background sender delivers to partition leaders once
//! they're full, have lingered for `linger`, or a flush is requested.
//! With `enable_idempotence`, each batch carries a sequence number under
//! the producer's session, allowing brokers to discard duplicates of
//! retried batches.

use crate::codec::records::RecordBatchBuilder;
use crate::codec::ErrorCode;
use crate::{BrokerPool, Config, Error, Header, Result, TopicPartition};
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tokio_util::task::AbortOnDropHandle;

mod accumulator;
mod partitioner;
mod sender;

use accumulator::Accumulator;
pub use partitioner::{hash_partition, Partitioner};

/// A record to be produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRecord {
    pub topic: String,
    /// Explicit partition, which takes precedence over the key.
    pub partition: Option<i32>,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<Header>,
    /// Milliseconds since the Unix epoch. Defaults to the time of append.
    pub timestamp: Option<i64>,
}

impl ProducerRecord {
    pub fn new(topic: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            key: None,
            value: Some(value.into()),
            headers: Vec::new(),
            timestamp: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.headers.push(Header {
            key: key.into(),
            value: Some(value.into()),
        });
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Where a produced record was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: i32,
    /// Offset of the record, or -1 if it's unknown (as with acks = none).
    pub offset: i64,
    pub timestamp: i64,
}

/// Resolves to the outcome of delivering an appended record.
#[derive(Debug)]
pub struct DeliveryFuture {
    rx: oneshot::Receiver<Result<RecordMetadata>>,
}

impl Future for DeliveryFuture {
    type Output = Result<RecordMetadata>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Poll::Ready(match ready!(Pin::new(&mut this.rx).poll(cx)) {
            Ok(result) => result,
            Err(_) => Err(Error::Closed),
        })
    }
}

/// How a Producer treats records which haven't been sent when it's closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Deliver all appended records before closing.
    Flush,
    /// Abandon records which haven't been sent, returning them from `close`.
    Abort,
}

/// Identity of an idempotent producer, acquired through InitProducerId.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducerSession {
    pub producer_id: i64,
    pub epoch: i16,
}

pub struct Producer {
    pool: BrokerPool,
    config: Arc<Config>,
    accumulator: Arc<Accumulator>,
    control: mpsc::UnboundedSender<sender::Control>,
    _sender: AbortOnDropHandle<()>,
}

impl Producer {
    /// Start a Producer which uses `pool` and its Config.
    /// An idempotent Producer first acquires its session.
    pub async fn new(pool: BrokerPool) -> Result<Self> {
        let config = Arc::new(pool.config().clone());
        config.validate()?;

        let session = if config.enable_idempotence {
            let session = sender::init_session(&pool).await?;
            tracing::info!(
                producer_id = session.producer_id,
                epoch = session.epoch,
                "acquired producer session"
            );
            Some(session)
        } else {
            None
        };

        let accumulator = Arc::new(Accumulator::new(config.clone()));
        let (control, control_rx) = mpsc::unbounded_channel();
        let sender = sender::Sender::new(pool.clone(), config.clone(), accumulator.clone(), session);
        let task = tokio::spawn(sender.run(control_rx));

        Ok(Self {
            pool,
            config,
            accumulator,
            control,
            _sender: AbortOnDropHandle::new(task),
        })
    }

    /// Append a record for delivery. Fails immediately with BufferFull if
    /// the record would exceed `buffer_memory`. The returned future
    /// resolves once the record is delivered or has failed.
    pub async fn append(&self, record: ProducerRecord) -> Result<DeliveryFuture> {
        self.enqueue(record, false).await
    }

    /// Like `append`, but waits for buffer memory to become available.
    pub async fn send(&self, record: ProducerRecord) -> Result<DeliveryFuture> {
        self.enqueue(record, true).await
    }

    /// Send all appended records without lingering, and wait for their delivery.
    pub async fn flush(&self) {
        let _flushing = self.accumulator.begin_flush();
        self.accumulator.wait_idle().await;
    }

    /// Close the Producer. In-flight requests complete or time out.
    /// Records which were abandoned without being sent are returned.
    pub async fn close(self, mode: CloseMode) -> Vec<ProducerRecord> {
        tracing::debug!(?mode, "closing producer");

        let (reply, abandoned) = oneshot::channel();
        if self.control.send(sender::Control::Close(mode, reply)).is_err() {
            return Vec::new();
        }
        abandoned.await.unwrap_or_default()
    }

    async fn enqueue(&self, record: ProducerRecord, wait: bool) -> Result<DeliveryFuture> {
        let tp = self.route(&record).await?;

        let size = RecordBatchBuilder::estimate_record_size(
            record.key.as_deref(),
            record.value.as_deref(),
            &record.headers,
        );
        if size > self.config.buffer_memory {
            return Err(Error::RecordTooLarge {
                partition: tp,
                size,
                limit: self.config.buffer_memory,
            });
        }
        let permit = if wait {
            self.accumulator.reserve(size).await?
        } else {
            self.accumulator.try_reserve(size)?
        };

        let (delivery, closed_batch) = self.accumulator.append(tp.clone(), record, permit)?;
        if closed_batch {
            let view = self.pool.snapshot();
            self.accumulator.partitioner().on_batch_closed(
                &tp.topic,
                tp.partition,
                &view.available_partitions(&tp.topic),
                view.partition_count(&tp.topic).unwrap_or(1),
            );
        }
        Ok(delivery)
    }

    async fn route(&self, record: &ProducerRecord) -> Result<TopicPartition> {
        let count = self.pool.partition_count(&record.topic).await?;
        if count == 0 {
            return Err(Error::Broker(ErrorCode::UNKNOWN_TOPIC_OR_PARTITION));
        }

        let partition = match record.partition {
            Some(partition) if partition >= 0 && (partition as usize) < count => partition,
            Some(_) => return Err(Error::Broker(ErrorCode::UNKNOWN_TOPIC_OR_PARTITION)),
            None => {
                let available = self.pool.snapshot().available_partitions(&record.topic);
                self.accumulator.partitioner().partition(
                    &record.topic,
                    record.key.as_deref(),
                    &available,
                    count,
                )
            }
        };
        Ok(TopicPartition::new(record.topic.clone(), partition))
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("client_id", &self.config.client_id)
            .finish()
    }
}

#[cfg(test)]
mod tests;
