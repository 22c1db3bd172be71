use std::sync::Arc;
use std::time::Duration;

pub mod codec;
pub use codec::ErrorCode;

mod config;
pub use config::{Acks, AssignmentStrategy, Compression, Config, IsolationLevel, OffsetReset};

mod connection;
pub use connection::{Connection, Pending};

mod pool;
pub use pool::{BrokerNode, BrokerPool, ClusterView, PartitionInfo};

pub mod group;

mod fetcher;
pub use fetcher::Fetcher;

mod consumer;
pub use consumer::Consumer;

pub mod producer;
pub use producer::{CloseMode, DeliveryFuture, Producer, ProducerRecord, RecordMetadata};

mod retry;

#[cfg(test)]
mod testing;

/// A single partition of a topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl std::fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub key: String,
    pub value: Option<bytes::Bytes>,
}

/// A record delivered by a Consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: i64,
    pub key: Option<bytes::Bytes>,
    pub value: Option<bytes::Bytes>,
    pub headers: Vec<Header>,
}

impl ConsumerRecord {
    /// Approximate in-memory footprint, used for fetch buffer accounting.
    pub fn size(&self) -> usize {
        record_size(self.key.as_deref(), self.value.as_deref(), &self.headers)
    }
}

pub(crate) fn record_size(key: Option<&[u8]>, value: Option<&[u8]>, headers: &[Header]) -> usize {
    key.map_or(0, <[u8]>::len)
        + value.map_or(0, <[u8]>::len)
        + headers
            .iter()
            .map(|h| h.key.len() + h.value.as_ref().map_or(0, |v| v.len()))
            .sum::<usize>()
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("failed to connect to broker {addr}")]
    Connect {
        addr: String,
        #[source]
        source: Arc<std::io::Error>,
    },
    #[error("connection to broker {addr} was lost: {reason}")]
    ConnectionLost { addr: String, reason: String },
    #[error("corrupt message: {0}")]
    CorruptMessage(String),
    #[error("broker does not support a usable version of API key {api_key}")]
    UnsupportedVersion { api_key: i16 },
    #[error("unsupported compression codec {0}")]
    UnsupportedCodec(i16),
    #[error("no route to {target} after {attempts} attempts")]
    Routing { target: String, attempts: u32 },
    #[error("group coordination failed: {0}")]
    Coordination(ErrorCode),
    #[error("producer sequence {sequence} rejected for {partition}: {code}")]
    Sequence {
        partition: TopicPartition,
        sequence: i32,
        code: ErrorCode,
    },
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("delivery to {partition} failed after {attempts} attempts")]
    PermanentFailure {
        partition: TopicPartition,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },
    #[error("broker error: {0}")]
    Broker(ErrorCode),
    #[error("fetch of {partition} returned offset {actual} while expecting {expected}")]
    OutOfOrder {
        partition: TopicPartition,
        expected: i64,
        actual: i64,
    },
    #[error("offset {offset} is out of range for {partition}")]
    OffsetOutOfRange {
        partition: TopicPartition,
        offset: i64,
    },
    #[error("no committed offset for {0} and the reset policy is 'none'")]
    NoOffset(TopicPartition),
    #[error("record of {size} bytes in {partition} exceeds the {limit} byte fetch budget")]
    RecordTooLarge {
        partition: TopicPartition,
        size: usize,
        limit: usize,
    },
    #[error("producer buffer memory is exhausted")]
    BufferFull,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("client is closed")]
    Closed,
}

impl Error {
    /// Retryable errors are transient: the same operation may succeed
    /// after a backoff and, possibly, a metadata refresh.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Connect { .. }
            | Error::ConnectionLost { .. }
            | Error::Routing { .. }
            | Error::Timeout(_) => true,
            Error::Broker(code) | Error::Coordination(code) => code.is_retriable(),
            _ => false,
        }
    }

    /// The broker error code carried by this error, if any.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Error::Broker(code) | Error::Coordination(code) => Some(*code),
            Error::Sequence { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
