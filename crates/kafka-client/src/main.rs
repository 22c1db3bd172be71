use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use kafka_client::{
    Acks, BrokerPool, CloseMode, Compression, Config, Consumer, IsolationLevel, OffsetReset, Producer,
    ProducerRecord,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

/// Produce and consume records of a Kafka cluster.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct CommonArgs {
    /// Comma-separated `host:port` addresses of brokers used to discover the cluster.
    #[arg(long, env = "KAFKA_BOOTSTRAP_SERVERS", value_delimiter = ',')]
    bootstrap_servers: Vec<String>,
    /// JSON file of client configuration. Flags take precedence over it.
    #[arg(long, env = "KAFKA_CLIENT_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long, env = "KAFKA_CLIENT_ID")]
    client_id: Option<String>,
    /// Maximum time to wait for the response of a request.
    #[arg(long, value_parser = humantime::parse_duration)]
    request_timeout: Option<Duration>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Produce each line of stdin as a record.
    Produce(ProduceArgs),
    /// Consume records and write their values to stdout, one per line.
    Consume(ConsumeArgs),
}

#[derive(Debug, Args)]
struct ProduceArgs {
    #[arg(long)]
    topic: String,
    /// Split each line at the first occurrence of this separator into a key and value.
    #[arg(long)]
    key_separator: Option<String>,
    #[arg(long, value_enum)]
    acks: Option<Acks>,
    #[arg(long, value_enum)]
    compression: Option<Compression>,
    #[arg(long, value_parser = humantime::parse_duration)]
    linger: Option<Duration>,
    /// Enable idempotent delivery, which requires acks=all.
    #[arg(long)]
    idempotent: bool,
}

#[derive(Debug, Args)]
struct ConsumeArgs {
    /// Topics to consume. May be repeated.
    #[arg(long = "topic", required = true)]
    topics: Vec<String>,
    /// Consumer group to join. Without one, all partitions of the topics are read directly.
    #[arg(long, env = "KAFKA_GROUP_ID")]
    group: Option<String>,
    /// Where to start reading partitions without a committed offset.
    #[arg(long, value_enum)]
    offset_reset: Option<OffsetReset>,
    #[arg(long, value_enum)]
    isolation_level: Option<IsolationLevel>,
    /// Exit after this many records.
    #[arg(long)]
    max_records: Option<usize>,
    /// Write records as JSON objects with their topic, partition, offset and key.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into()) // Otherwise it's ERROR.
        .from_env_lossy();

    tracing_subscriber::fmt::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = load_config(&cli.common)?;

    match cli.command {
        Command::Produce(args) => {
            if let Some(acks) = args.acks {
                config.acks = acks;
            }
            if let Some(compression) = args.compression {
                config.compression = compression;
            }
            if let Some(linger) = args.linger {
                config.linger = linger;
            }
            config.enable_idempotence |= args.idempotent;
            config.validate().context("invalid producer configuration")?;

            produce(config, args).await
        }
        Command::Consume(args) => {
            if let Some(group) = &args.group {
                config.group_id = Some(group.clone());
            }
            if let Some(reset) = args.offset_reset {
                config.auto_offset_reset = reset;
            }
            if let Some(level) = args.isolation_level {
                config.isolation_level = level;
            }
            config.validate().context("invalid consumer configuration")?;

            consume(config, args).await
        }
    }
}

fn load_config(args: &CommonArgs) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => {
            let content = std::fs::read(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            serde_json::from_slice(&content)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        }
        None => Config::default(),
    };

    if !args.bootstrap_servers.is_empty() {
        config.bootstrap_servers = args.bootstrap_servers.clone();
    }
    if let Some(client_id) = &args.client_id {
        config.client_id = client_id.clone();
    }
    if let Some(timeout) = args.request_timeout {
        config.request_timeout = timeout;
    }
    Ok(config)
}

async fn produce(config: Config, args: ProduceArgs) -> anyhow::Result<()> {
    let pool = BrokerPool::new(Arc::new(config));
    let producer = Producer::new(pool.clone())
        .await
        .context("failed to start producer")?;

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut deliveries = futures::stream::FuturesUnordered::new();
    let mut failed = 0usize;
    let mut delivered = 0usize;

    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let record = match args.key_separator.as_deref().and_then(|sep| line.split_once(sep)) {
            Some((key, value)) => {
                ProducerRecord::new(args.topic.clone(), value.to_string()).with_key(key.to_string())
            }
            None => ProducerRecord::new(args.topic.clone(), line),
        };
        deliveries.push(
            producer
                .send(record)
                .await
                .with_context(|| format!("failed to send record to {}", args.topic))?,
        );

        // Reap deliveries which have completed, without waiting.
        while let Some(Some(outcome)) = futures::FutureExt::now_or_never(deliveries.next()) {
            tally(outcome, &mut delivered, &mut failed);
        }
    }

    let abandoned = producer.close(CloseMode::Flush).await;
    while let Some(outcome) = deliveries.next().await {
        tally(outcome, &mut delivered, &mut failed);
    }
    pool.close();

    tracing::info!(delivered, failed, abandoned = abandoned.len(), "finished producing");
    if failed != 0 || !abandoned.is_empty() {
        anyhow::bail!("{failed} records failed and {} were abandoned", abandoned.len());
    }
    Ok(())
}

fn tally(outcome: kafka_client::Result<kafka_client::RecordMetadata>, delivered: &mut usize, failed: &mut usize) {
    match outcome {
        Ok(_) => *delivered += 1,
        Err(err) => {
            tracing::error!(error = %err, "failed to deliver record");
            *failed += 1;
        }
    }
}

async fn consume(config: Config, args: ConsumeArgs) -> anyhow::Result<()> {
    let pool = BrokerPool::new(Arc::new(config));
    let mut consumer = Consumer::new(pool.clone()).context("failed to start consumer")?;

    if args.group.is_some() {
        consumer.subscribe(args.topics.iter().cloned())?;
    } else {
        let mut partitions = Vec::new();
        for topic in &args.topics {
            let count = pool
                .partition_count(topic)
                .await
                .with_context(|| format!("failed to fetch partitions of topic {topic}"))?;
            partitions.extend((0..count as i32).map(|p| kafka_client::TopicPartition::new(topic.clone(), p)));
        }
        consumer.assign(partitions).await.context("failed to assign partitions")?;
    }

    let mut stdout = tokio::io::stdout();
    let mut remaining = args.max_records.unwrap_or(usize::MAX);
    let mut stop = std::pin::pin!(tokio::signal::ctrl_c());

    while remaining != 0 {
        let records = tokio::select! {
            records = consumer.poll(Duration::from_secs(1)) => records.context("failed to poll records")?,
            _ = &mut stop => break,
        };

        for record in records.into_iter().take(remaining) {
            let mut line = if args.json {
                serde_json::to_vec(&serde_json::json!({
                    "topic": record.topic,
                    "partition": record.partition,
                    "offset": record.offset,
                    "timestamp": record.timestamp,
                    "key": record.key.as_deref().map(String::from_utf8_lossy),
                    "value": record.value.as_deref().map(String::from_utf8_lossy),
                }))?
            } else {
                record.value.map(|v| v.to_vec()).unwrap_or_default()
            };
            line.push(b'\n');
            stdout.write_all(&line).await.context("failed to write stdout")?;
            remaining -= 1;
        }
        stdout.flush().await?;
    }

    consumer.close().await.context("failed to close consumer")?;
    pool.close();
    Ok(())
}
