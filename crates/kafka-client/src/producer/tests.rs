use super::*;
use crate::codec::records;
use crate::testing::{self, MockBroker, MockRequest, Reply};
use crate::Acks;
use kafka_protocol::messages::{
    self,
    produce_response::{PartitionProduceResponse, TopicProduceResponse},
    InitProducerIdRequest, MetadataRequest, ProduceRequest, ProducerId,
};
use pretty_assertions::assert_eq;
use std::sync::Mutex;
use std::time::Duration;

// A partition written by produce requests, as seen by the MockBroker.
#[derive(Debug, Clone, PartialEq)]
struct Written {
    partition: i32,
    producer_id: i64,
    base_sequence: i32,
    values: Vec<String>,
    encoded: Bytes,
}

fn written(req: &MockRequest) -> Vec<Written> {
    let request: ProduceRequest = req.decode();
    let mut out = Vec::new();

    for topic in request.topic_data {
        for partition in topic.partition_data {
            let encoded = partition.records.unwrap_or_default();
            for batch in records::decode_batches(encoded.clone()).unwrap() {
                out.push(Written {
                    partition: partition.index,
                    producer_id: batch.producer_id,
                    base_sequence: batch.base_sequence,
                    values: batch
                        .records()
                        .unwrap()
                        .into_iter()
                        .map(|r| String::from_utf8(r.value.unwrap().to_vec()).unwrap())
                        .collect(),
                    encoded: encoded.clone(),
                });
            }
        }
    }
    out
}

fn produce_response(req: &MockRequest, results: &[(i32, ErrorCode, i64)]) -> Reply {
    let partitions = results
        .iter()
        .map(|(index, code, base_offset)| {
            PartitionProduceResponse::default()
                .with_index(*index)
                .with_error_code(code.0)
                .with_base_offset(*base_offset)
                .with_log_append_time_ms(-1)
        })
        .collect();

    Reply::respond::<ProduceRequest>(
        req,
        &messages::ProduceResponse::default().with_responses(vec![TopicProduceResponse::default()
            .with_name(crate::codec::topic_name("t"))
            .with_partition_responses(partitions)]),
    )
}

fn init_producer_id(req: &MockRequest, producer_id: i64) -> Reply {
    Reply::respond::<InitProducerIdRequest>(
        req,
        &messages::InitProducerIdResponse::default()
            .with_producer_id(ProducerId(producer_id))
            .with_producer_epoch(0),
    )
}

// Handles Metadata and InitProducerId requests, and passes Produce requests
// with the batches they carry to `produce`.
async fn start<F>(produce: F) -> (MockBroker, Arc<Mutex<Vec<Written>>>)
where
    F: Fn(&MockRequest, &[Written], usize) -> Reply + Send + Sync + 'static,
{
    let log = Arc::new(Mutex::new(Vec::new()));
    let producer_ids = Arc::new(Mutex::new(41));

    let broker = MockBroker::start({
        let log = log.clone();
        move |req| {
            if req.is::<MetadataRequest>() {
                return Reply::respond::<MetadataRequest>(
                    &req,
                    &testing::metadata(&[(1, req.broker.as_str())], &[("t", 2, 1)]),
                );
            }
            if req.is::<InitProducerIdRequest>() {
                let mut id = producer_ids.lock().unwrap();
                *id += 1;
                return init_producer_id(&req, *id);
            }
            let batches = written(&req);
            let mut log = log.lock().unwrap();
            let attempt = log.len();
            log.extend(batches.iter().cloned());
            produce(&req, &batches, attempt)
        }
    })
    .await;

    (broker, log)
}

fn config(broker: &MockBroker) -> Config {
    Config {
        bootstrap_servers: vec![broker.addr()],
        linger: Duration::ZERO,
        retry_backoff: Duration::from_millis(1),
        retry_backoff_max: Duration::from_millis(5),
        ..Default::default()
    }
}

async fn producer(config: Config) -> Producer {
    Producer::new(BrokerPool::new(Arc::new(config))).await.unwrap()
}

fn record(partition: i32, value: &str) -> ProducerRecord {
    ProducerRecord::new("t", value.to_string()).with_partition(partition)
}

#[tokio::test]
async fn test_delivered_records_carry_broker_offsets() {
    let (broker, log) = start(|req, batches, _| {
        let results: Vec<_> = batches
            .iter()
            .map(|b| (b.partition, ErrorCode::NONE, 100 * (b.partition as i64 + 1)))
            .collect();
        produce_response(req, &results)
    })
    .await;
    let producer = producer(config(&broker)).await;

    let first = producer.append(record(0, "a")).await.unwrap().await.unwrap();
    let second = producer.append(record(1, "b")).await.unwrap().await.unwrap();

    assert_eq!(
        (first.topic.as_str(), first.partition, first.offset),
        ("t", 0, 100)
    );
    assert_eq!((second.partition, second.offset), (1, 200));

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 2);
    // Without idempotence, batches carry no producer state.
    assert!(log.iter().all(|w| w.producer_id == -1 && w.base_sequence == -1));
}

#[tokio::test]
async fn test_flush_sends_lingering_batches() {
    let (broker, log) = start(|req, batches, _| {
        let results: Vec<_> = batches.iter().map(|b| (b.partition, ErrorCode::NONE, 0)).collect();
        produce_response(req, &results)
    })
    .await;
    let producer = producer(Config {
        linger: Duration::from_secs(60),
        ..config(&broker)
    })
    .await;

    let deliveries = vec![
        producer.append(record(0, "a")).await.unwrap(),
        producer.append(record(0, "b")).await.unwrap(),
        producer.append(record(0, "c")).await.unwrap(),
    ];
    producer.flush().await;

    let offsets: Vec<i64> = futures::future::try_join_all(deliveries)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.offset)
        .collect();
    assert_eq!(offsets, vec![0, 1, 2]);

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].values, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_idempotent_retry_reuses_sequence_and_duplicate_is_delivered() {
    let (broker, log) = start(|req, batches, attempt| {
        let code = match attempt {
            0 => ErrorCode::NOT_LEADER_OR_FOLLOWER,
            // The broker wrote the first attempt after all.
            _ => ErrorCode::DUPLICATE_SEQUENCE_NUMBER,
        };
        produce_response(req, &[(batches[0].partition, code, -1)])
    })
    .await;
    let producer = producer(Config {
        enable_idempotence: true,
        ..config(&broker)
    })
    .await;

    let delivered = producer.append(record(0, "a")).await.unwrap().await.unwrap();
    assert_eq!(delivered.partition, 0);

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0], log[1]);
    assert_eq!((log[0].producer_id, log[0].base_sequence), (42, 0));
}

#[tokio::test]
async fn test_idempotent_sequences_advance_by_record_count() {
    let (broker, log) = start(|req, batches, _| {
        let results: Vec<_> = batches.iter().map(|b| (b.partition, ErrorCode::NONE, 0)).collect();
        produce_response(req, &results)
    })
    .await;
    let producer = producer(Config {
        enable_idempotence: true,
        linger: Duration::from_secs(60),
        ..config(&broker)
    })
    .await;

    for values in [&["a", "b", "c"][..], &["d"], &["e", "f"]] {
        for value in values {
            producer.append(record(0, value)).await.unwrap();
        }
        producer.flush().await;
    }

    let sequences: Vec<i32> = log.lock().unwrap().iter().map(|w| w.base_sequence).collect();
    assert_eq!(sequences, vec![0, 3, 4]);
}

#[tokio::test]
#[tracing_test::traced_test]
async fn test_sequence_error_starts_a_new_session() {
    let (broker, log) = start(|req, batches, attempt| {
        let code = match attempt {
            0 => ErrorCode::OUT_OF_ORDER_SEQUENCE_NUMBER,
            _ => ErrorCode::NONE,
        };
        produce_response(req, &[(batches[0].partition, code, 7)])
    })
    .await;
    let producer = producer(Config {
        enable_idempotence: true,
        ..config(&broker)
    })
    .await;

    let err = producer.append(record(0, "a")).await.unwrap().await.unwrap_err();
    assert!(
        matches!(
            err,
            Error::Sequence { sequence: 0, code: ErrorCode::OUT_OF_ORDER_SEQUENCE_NUMBER, .. }
        ),
        "{err:?}"
    );

    let delivered = producer.append(record(0, "b")).await.unwrap().await.unwrap();
    assert_eq!(delivered.offset, 7);

    let log = log.lock().unwrap();
    assert_eq!((log[1].producer_id, log[1].base_sequence), (43, 0));
    assert_eq!(broker.count::<InitProducerIdRequest>(), 2);
    assert!(logs_contain("starting a new producer session"));
}

#[tokio::test]
async fn test_permanent_failure_after_retries() {
    let (broker, _log) = start(|req, batches, _| {
        produce_response(req, &[(batches[0].partition, ErrorCode::NOT_ENOUGH_REPLICAS, -1)])
    })
    .await;
    let producer = producer(Config {
        retries: 2,
        ..config(&broker)
    })
    .await;

    let err = producer.append(record(1, "a")).await.unwrap().await.unwrap_err();
    match err {
        Error::PermanentFailure {
            partition,
            attempts,
            source,
        } => {
            assert_eq!(partition, TopicPartition::new("t", 1));
            assert_eq!(attempts, 3);
            assert!(matches!(*source, Error::Broker(ErrorCode::NOT_ENOUGH_REPLICAS)));
        }
        err => panic!("unexpected {err:?}"),
    }
    assert_eq!(broker.count::<ProduceRequest>(), 3);
}

#[tokio::test]
async fn test_non_retriable_errors_fail_immediately() {
    let (broker, _log) = start(|req, batches, _| {
        produce_response(req, &[(batches[0].partition, ErrorCode::MESSAGE_TOO_LARGE, -1)])
    })
    .await;
    let producer = producer(config(&broker)).await;

    let err = producer.append(record(0, "a")).await.unwrap().await.unwrap_err();
    assert!(matches!(err, Error::Broker(ErrorCode::MESSAGE_TOO_LARGE)));
    assert_eq!(broker.count::<ProduceRequest>(), 1);
}

#[tokio::test]
async fn test_acks_none_expects_no_response() {
    let (broker, log) = start(|_, _, _| Reply::Ignore).await;
    let producer = producer(Config {
        acks: Acks::None,
        ..config(&broker)
    })
    .await;

    let delivered = producer.append(record(0, "a")).await.unwrap().await.unwrap();
    assert_eq!((delivered.partition, delivered.offset), (0, -1));
    assert_eq!(log.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_keyed_records_hash_to_partitions() {
    let (broker, log) = start(|req, batches, _| {
        let results: Vec<_> = batches.iter().map(|b| (b.partition, ErrorCode::NONE, 0)).collect();
        produce_response(req, &results)
    })
    .await;
    let producer = producer(config(&broker)).await;

    for key in ["alpha", "beta", "gamma", "delta"] {
        let metadata = producer
            .append(ProducerRecord::new("t", key.to_string()).with_key(key.to_string()))
            .await
            .unwrap()
            .await
            .unwrap();
        assert_eq!(metadata.partition, hash_partition(key.as_bytes(), 2));
    }
    assert_eq!(log.lock().unwrap().len(), 4);
}

#[tokio::test]
async fn test_unknown_partition_and_oversized_records_are_refused() {
    let (broker, _log) = start(|_, _, _| Reply::Ignore).await;
    let producer = producer(Config {
        batch_size: 200,
        buffer_memory: 200,
        linger: Duration::from_secs(60),
        ..config(&broker)
    })
    .await;

    assert!(matches!(
        producer.append(record(2, "a")).await,
        Err(Error::Broker(ErrorCode::UNKNOWN_TOPIC_OR_PARTITION))
    ));
    assert!(matches!(
        producer.append(record(0, &"x".repeat(300))).await,
        Err(Error::RecordTooLarge { size, limit: 200, .. }) if size > 300
    ));

    // A second record of this size exceeds buffer_memory while the first is held.
    producer.append(record(0, &"x".repeat(100))).await.unwrap();
    assert!(matches!(
        producer.append(record(0, &"x".repeat(100))).await,
        Err(Error::BufferFull)
    ));
}

#[tokio::test]
async fn test_close_with_abort_returns_unsent_records() {
    let (broker, log) = start(|_, _, _| Reply::Ignore).await;
    let producer = producer(Config {
        linger: Duration::from_secs(60),
        ..config(&broker)
    })
    .await;

    let first = producer.append(record(0, "a")).await.unwrap();
    let second = producer.append(record(1, "b").with_header("h", "v")).await.unwrap();

    let mut abandoned = producer.close(CloseMode::Abort).await;
    abandoned.sort_by_key(|r| r.partition);
    assert_eq!(abandoned, vec![record(0, "a"), record(1, "b").with_header("h", "v")]);

    assert!(matches!(first.await, Err(Error::Closed)));
    assert!(matches!(second.await, Err(Error::Closed)));
    assert!(log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_close_with_flush_delivers_lingering_records() {
    let (broker, log) = start(|req, batches, _| {
        let results: Vec<_> = batches.iter().map(|b| (b.partition, ErrorCode::NONE, 5)).collect();
        produce_response(req, &results)
    })
    .await;
    let producer = producer(Config {
        linger: Duration::from_secs(60),
        ..config(&broker)
    })
    .await;

    let delivery = producer.append(record(0, "a")).await.unwrap();
    assert!(producer.close(CloseMode::Flush).await.is_empty());

    assert_eq!(delivery.await.unwrap().offset, 5);
    assert_eq!(log.lock().unwrap().len(), 1);
}
