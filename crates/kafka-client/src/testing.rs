//! An in-process broker which speaks the Kafka wire protocol,
//! answering requests through a test-provided handler.

use crate::codec;
use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use kafka_protocol::{
    messages::{self, ApiKey, BrokerId, RequestHeader},
    protocol::{Decodable, Encodable, HeaderVersion, Request},
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::task::AbortOnDropHandle;

/// A request received by the MockBroker.
pub struct MockRequest {
    pub header: RequestHeader,
    pub body: Bytes,
    /// Sequence number of the client connection which sent this request.
    pub conn: usize,
    /// Address of the MockBroker which received this request.
    pub broker: String,
}

impl MockRequest {
    pub fn api_key(&self) -> i16 {
        self.header.request_api_key
    }

    pub fn version(&self) -> i16 {
        self.header.request_api_version
    }

    pub fn is<R: Request>(&self) -> bool {
        self.api_key() == R::KEY
    }

    /// Decode the request body, which must be of type `R`.
    pub fn decode<R: Request>(&self) -> R {
        let mut body = self.body.clone();
        let request = R::decode(&mut body, self.version()).expect("request decodes");
        assert!(body.is_empty(), "request has trailing bytes");
        request
    }
}

pub enum Reply {
    Frame(Bytes),
    /// Don't answer.
    Ignore,
    /// Close the connection.
    Hangup,
}

impl Reply {
    pub fn respond<R: Request>(req: &MockRequest, response: &R::Response) -> Self {
        Self::respond_as::<R>(&req.header, response)
    }

    pub fn respond_as<R: Request>(header: &RequestHeader, response: &R::Response) -> Self {
        let version = header.request_api_version;
        let mut buf = BytesMut::new();

        let mut response_header = messages::ResponseHeader::default();
        response_header.correlation_id = header.correlation_id;
        response_header
            .encode(&mut buf, R::Response::header_version(version))
            .expect("encoding ResponseHeader does not fail");
        response
            .encode(&mut buf, version)
            .expect("encoding response payload does not fail");

        Self::Frame(buf.freeze())
    }
}

type Handler = Arc<dyn Fn(MockRequest) -> Reply + Send + Sync>;

pub struct MockBroker {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<RequestHeader>>>,
    disconnects: watch::Receiver<usize>,
    _task: AbortOnDropHandle<()>,
}

impl MockBroker {
    /// Start a broker which supports every API version the client does.
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(MockRequest) -> Reply + Send + Sync + 'static,
    {
        let versions = codec::supported_api_versions()
            .into_iter()
            .map(|v| (v.api_key, v.min_version, v.max_version))
            .collect();
        Self::with_versions(versions, handler).await
    }

    /// Start a broker which offers only the given (api_key, min, max) versions.
    pub async fn with_versions<F>(versions: Vec<(i16, i16, i16)>, handler: F) -> Self
    where
        F: Fn(MockRequest) -> Reply + Send + Sync + 'static,
    {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handler: Handler = Arc::new(handler);
        let versions = Arc::new(versions);
        let requests = Arc::new(Mutex::new(Vec::new()));
        let (disconnects_tx, disconnects) = watch::channel(0usize);
        let disconnects_tx = Arc::new(disconnects_tx);

        let task = tokio::spawn({
            let requests = requests.clone();
            async move {
                for conn in 0.. {
                    let Ok((stream, _)) = listener.accept().await else {
                        return;
                    };
                    let (handler, versions, requests, disconnects_tx) = (
                        handler.clone(),
                        versions.clone(),
                        requests.clone(),
                        disconnects_tx.clone(),
                    );
                    tokio::spawn(async move {
                        serve(stream, conn, addr, handler, versions, requests).await;
                        disconnects_tx.send_modify(|n| *n += 1);
                    });
                }
            }
        });

        Self {
            addr,
            requests,
            disconnects,
            _task: AbortOnDropHandle::new(task),
        }
    }

    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    pub fn port(&self) -> i32 {
        self.addr.port() as i32
    }

    /// Headers of all requests received so far, in order.
    pub fn requests(&self) -> Vec<RequestHeader> {
        self.requests.lock().unwrap().clone()
    }

    /// Number of received requests with API key `R`.
    pub fn count<R: Request>(&self) -> usize {
        self.requests()
            .iter()
            .filter(|h| h.request_api_key == R::KEY)
            .count()
    }

    pub async fn wait_for_disconnects(&self, n: usize) {
        let mut rx = self.disconnects.clone();
        rx.wait_for(|count| *count >= n).await.unwrap();
    }
}

async fn serve(
    stream: tokio::net::TcpStream,
    conn: usize,
    addr: SocketAddr,
    handler: Handler,
    versions: Arc<Vec<(i16, i16, i16)>>,
    requests: Arc<Mutex<Vec<RequestHeader>>>,
) {
    let mut framed = Framed::new(
        stream,
        LengthDelimitedCodec::builder()
            .big_endian()
            .length_field_length(4)
            .new_codec(),
    );

    while let Some(Ok(frame)) = framed.next().await {
        let mut frame = frame.freeze();
        let api_key = i16::from_be_bytes([frame[0], frame[1]]);
        let version = i16::from_be_bytes([frame[2], frame[3]]);
        let header_version = ApiKey::try_from(api_key)
            .expect("valid API key")
            .request_header_version(version);
        let header = RequestHeader::decode(&mut frame, header_version).unwrap();

        requests.lock().unwrap().push(header.clone());
        let req = MockRequest {
            header,
            body: frame,
            conn,
            broker: addr.to_string(),
        };

        let reply = if req.is::<messages::ApiVersionsRequest>() {
            let api_keys = versions
                .iter()
                .map(|(key, min, max)| {
                    messages::api_versions_response::ApiVersion::default()
                        .with_api_key(*key)
                        .with_min_version(*min)
                        .with_max_version(*max)
                })
                .collect();
            Reply::respond::<messages::ApiVersionsRequest>(
                &req,
                &messages::ApiVersionsResponse::default().with_api_keys(api_keys),
            )
        } else {
            handler(req)
        };

        match reply {
            Reply::Frame(frame) => {
                if framed.send(frame).await.is_err() {
                    return;
                }
            }
            Reply::Ignore => {}
            Reply::Hangup => return,
        }
    }
}

/// Build a MetadataResponse listing `brokers` as (node_id, addr),
/// and `topics` as (name, partition count, leader node_id).
pub fn metadata(
    brokers: &[(i32, &str)],
    topics: &[(&str, i32, i32)],
) -> messages::MetadataResponse {
    use messages::metadata_response::*;

    let brokers = brokers
        .iter()
        .map(|(node_id, addr)| {
            let (host, port) = addr.rsplit_once(':').unwrap();
            MetadataResponseBroker::default()
                .with_node_id(BrokerId(*node_id))
                .with_host(codec::str_bytes(host))
                .with_port(port.parse().unwrap())
        })
        .collect();

    let topics = topics
        .iter()
        .map(|(name, partitions, leader)| {
            MetadataResponseTopic::default()
                .with_name(Some(codec::topic_name(name)))
                .with_partitions(
                    (0..*partitions)
                        .map(|partition| {
                            MetadataResponsePartition::default()
                                .with_partition_index(partition)
                                .with_leader_id(BrokerId(*leader))
                                .with_leader_epoch(1)
                        })
                        .collect(),
                )
        })
        .collect();

    messages::MetadataResponse::default()
        .with_brokers(brokers)
        .with_topics(topics)
}

/// Answer a FindCoordinatorRequest with `node_id` at `addr`.
pub fn find_coordinator(req: &MockRequest, node_id: i32, addr: &str) -> Reply {
    use messages::find_coordinator_response::Coordinator;
    type R = messages::FindCoordinatorRequest;

    let (host, port) = addr.rsplit_once(':').unwrap();
    let port: i32 = port.parse().unwrap();

    let response = if req.version() >= 4 {
        let request: R = req.decode();
        let coordinators = request
            .coordinator_keys
            .iter()
            .map(|key| {
                Coordinator::default()
                    .with_key(key.clone())
                    .with_node_id(BrokerId(node_id))
                    .with_host(codec::str_bytes(host))
                    .with_port(port)
            })
            .collect();
        messages::FindCoordinatorResponse::default().with_coordinators(coordinators)
    } else {
        messages::FindCoordinatorResponse::default()
            .with_node_id(BrokerId(node_id))
            .with_host(codec::str_bytes(host))
            .with_port(port)
    };
    Reply::respond::<R>(req, &response)
}

/// Encode records into a RecordBatch with the given base offset.
pub fn batch(base_offset: i64, values: &[&str]) -> Bytes {
    let mut builder = codec::records::RecordBatchBuilder::new(crate::Compression::None, usize::MAX);
    for value in values {
        builder.append(base_offset, None, Some(value.as_bytes()), &[]);
    }
    with_base_offset(&builder.build().unwrap(), base_offset)
}

/// Rewrite the base offset of an encoded RecordBatch, as a broker does
/// when appending it. The CRC doesn't cover the base offset.
pub fn with_base_offset(encoded: &[u8], base_offset: i64) -> Bytes {
    let mut out = BytesMut::with_capacity(encoded.len());
    out.put_i64(base_offset);
    out.extend_from_slice(&encoded[8..]);
    out.freeze()
}
