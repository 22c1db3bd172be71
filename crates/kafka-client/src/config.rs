use crate::Error;
use std::time::Duration;

/// Configuration shared by the Consumer, Producer and the BrokerPool they use.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Initial `host:port` addresses used to discover the cluster.
    pub bootstrap_servers: Vec<String>,
    /// Client id sent in every request header.
    pub client_id: String,
    /// Maximum time to wait for the response of a single request.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Connections with no in-flight requests for this long are closed.
    #[serde(with = "humantime_serde")]
    pub connections_max_idle: Duration,
    /// Cluster metadata is refreshed at least this often.
    #[serde(with = "humantime_serde")]
    pub metadata_max_age: Duration,
    /// Capacity of each connection's in-flight request table.
    pub max_in_flight_requests_per_connection: usize,
    /// Number of metadata refreshes attempted before a routing failure is surfaced.
    pub routing_retries: u32,
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub retry_backoff_max: Duration,

    // Consumer.
    pub group_id: Option<String>,
    #[serde(with = "humantime_serde")]
    pub session_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub rebalance_timeout: Duration,
    /// Upper bound on the time the application may take to acknowledge a revocation.
    #[serde(with = "humantime_serde")]
    pub max_poll_interval: Duration,
    pub assignment_strategy: AssignmentStrategy,
    pub auto_offset_reset: OffsetReset,
    pub enable_auto_commit: bool,
    #[serde(with = "humantime_serde")]
    pub auto_commit_interval: Duration,
    pub fetch_min_bytes: i32,
    #[serde(with = "humantime_serde")]
    pub fetch_max_wait: Duration,
    pub fetch_max_bytes: i32,
    /// Bound on the bytes of records buffered across all assigned partitions.
    pub fetch_buffer_bytes: usize,
    pub max_poll_records: usize,
    pub isolation_level: IsolationLevel,

    // Producer.
    pub acks: Acks,
    #[serde(with = "humantime_serde")]
    pub linger: Duration,
    pub batch_size: usize,
    /// Bound on the bytes of records accepted but not yet delivered.
    pub buffer_memory: usize,
    pub retries: u32,
    pub enable_idempotence: bool,
    pub compression: Compression,
    #[serde(with = "humantime_serde")]
    pub sticky_partition_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub delivery_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bootstrap_servers: vec!["localhost:9092".to_string()],
            client_id: "kafka-client".to_string(),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            connections_max_idle: Duration::from_secs(9 * 60),
            metadata_max_age: Duration::from_secs(5 * 60),
            max_in_flight_requests_per_connection: 5,
            routing_retries: 5,
            retry_backoff: Duration::from_millis(100),
            retry_backoff_max: Duration::from_secs(1),

            group_id: None,
            session_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(3),
            rebalance_timeout: Duration::from_secs(60),
            max_poll_interval: Duration::from_secs(300),
            assignment_strategy: AssignmentStrategy::Range,
            auto_offset_reset: OffsetReset::Latest,
            enable_auto_commit: true,
            auto_commit_interval: Duration::from_secs(5),
            fetch_min_bytes: 1,
            fetch_max_wait: Duration::from_millis(500),
            fetch_max_bytes: 50 * 1024 * 1024,
            fetch_buffer_bytes: 32 * 1024 * 1024,
            max_poll_records: 500,
            isolation_level: IsolationLevel::ReadUncommitted,

            acks: Acks::All,
            linger: Duration::from_millis(5),
            batch_size: 16 * 1024,
            buffer_memory: 32 * 1024 * 1024,
            retries: 5,
            enable_idempotence: false,
            compression: Compression::None,
            sticky_partition_interval: Duration::from_millis(100),
            delivery_timeout: Duration::from_secs(120),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), Error> {
        let fail = |msg: String| Err(Error::Config(msg));

        if self.bootstrap_servers.is_empty() {
            return fail("bootstrap_servers must not be empty".to_string());
        }
        for addr in &self.bootstrap_servers {
            if addr.rsplit_once(':').is_none() {
                return fail(format!("bootstrap server {addr:?} is not host:port"));
            }
        }
        if self.max_in_flight_requests_per_connection == 0 {
            return fail("max_in_flight_requests_per_connection must be at least 1".to_string());
        }
        if self.heartbeat_interval >= self.session_timeout {
            return fail(format!(
                "heartbeat_interval ({:?}) must be less than session_timeout ({:?})",
                self.heartbeat_interval, self.session_timeout
            ));
        }
        if self.fetch_buffer_bytes == 0 || self.max_poll_records == 0 {
            return fail("fetch_buffer_bytes and max_poll_records must be positive".to_string());
        }
        if self.batch_size == 0 || self.buffer_memory < self.batch_size {
            return fail(format!(
                "buffer_memory ({}) must be at least batch_size ({})",
                self.buffer_memory, self.batch_size
            ));
        }
        if self.buffer_memory > u32::MAX as usize {
            return fail("buffer_memory must fit in 32 bits".to_string());
        }
        if self.enable_idempotence {
            if self.acks != Acks::All {
                return fail("enable_idempotence requires acks = all".to_string());
            }
            if self.max_in_flight_requests_per_connection > 5 {
                return fail(
                    "enable_idempotence requires max_in_flight_requests_per_connection <= 5"
                        .to_string(),
                );
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStrategy {
    Range,
    #[serde(alias = "roundrobin")]
    RoundRobin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum OffsetReset {
    Earliest,
    Latest,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
}

impl IsolationLevel {
    pub fn as_i8(self) -> i8 {
        match self {
            IsolationLevel::ReadUncommitted => 0,
            IsolationLevel::ReadCommitted => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Acks {
    None,
    Leader,
    All,
}

impl Acks {
    pub fn as_i16(self) -> i16 {
        match self {
            Acks::None => 0,
            Acks::Leader => 1,
            Acks::All => -1,
        }
    }
}

/// Record batch compression codecs, with their attribute bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    None,
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

impl Compression {
    pub fn attribute(self) -> i16 {
        match self {
            Compression::None => 0,
            Compression::Gzip => 1,
            Compression::Snappy => 2,
            Compression::Lz4 => 3,
            Compression::Zstd => 4,
        }
    }

    pub fn from_attribute(codec: i16) -> Result<Self, Error> {
        Ok(match codec {
            0 => Compression::None,
            1 => Compression::Gzip,
            2 => Compression::Snappy,
            3 => Compression::Lz4,
            4 => Compression::Zstd,
            other => return Err(Error::UnsupportedCodec(other)),
        })
    }
}
