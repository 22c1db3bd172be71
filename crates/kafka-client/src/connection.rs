use crate::codec::{self, ErrorCode, Versions};
use crate::{Config, Error, Result};
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use kafka_protocol::{messages, protocol::Request};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

type Transport = Framed<tokio::net::TcpStream, LengthDelimitedCodec>;

/// Connection is a session with a single broker, over which requests
/// are pipelined. Requests are written in the order they're sent and
/// the broker answers them in that same order, which lets responses
/// be matched to waiters by correlation id without a lookup.
///
/// Connection is cheaply cloneable. Once closed (explicitly, by an I/O
/// error, by a request timeout, or by idling) it stays closed, and a
/// fresh Connection must be opened.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    node_id: i32,
    addr: Arc<str>,
    versions: Versions,
    request_timeout: Duration,
    submit: mpsc::UnboundedSender<Submission>,
    // Permits bound the number of requests which are queued or in flight.
    slots: Arc<Semaphore>,
    shutdown: CancellationToken,
}

struct Submission {
    api_key: i16,
    api_version: i16,
    header_version: i16,
    body: Bytes,
    timeout: Duration,
    expects_response: bool,
    reply: oneshot::Sender<Result<Bytes>>,
    permit: OwnedSemaphorePermit,
}

/// Pending is a request which has been submitted to a Connection,
/// and resolves to its decoded response.
pub struct Pending<T> {
    rx: oneshot::Receiver<Result<Bytes>>,
    version: i16,
    addr: Arc<str>,
    decode: fn(Bytes, i16) -> Result<T>,
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        Poll::Ready(match ready!(Pin::new(&mut this.rx).poll(cx)) {
            Ok(Ok(body)) => (this.decode)(body, this.version),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(Error::ConnectionLost {
                addr: this.addr.to_string(),
                reason: "connection closed before the request completed".to_string(),
            }),
        })
    }
}

impl Connection {
    /// Open a connection to broker `node_id` at `addr` (as `host:port`),
    /// and negotiate API versions with it.
    #[tracing::instrument(level = "debug", skip(config), err(level = "warn"))]
    pub async fn open(node_id: i32, addr: &str, config: &Config) -> Result<Self> {
        let connect_err = |source: std::io::Error| Error::Connect {
            addr: addr.to_string(),
            source: Arc::new(source),
        };

        let stream = tokio::time::timeout(
            config.connect_timeout,
            tokio::net::TcpStream::connect(addr),
        )
        .await
        .map_err(|_| Error::Timeout(config.connect_timeout))?
        .map_err(connect_err)?;

        stream.set_nodelay(true).map_err(connect_err)?;

        // Let's keep this stream alive.
        let sock_ref = socket2::SockRef::from(&stream);
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(Duration::from_secs(20))
            .with_interval(Duration::from_secs(20));
        sock_ref.set_tcp_keepalive(&keepalive).map_err(connect_err)?;

        // https://kafka.apache.org/protocol.html#protocol_common
        // All requests and responses originate from the following:
        // > RequestOrResponse => Size (RequestMessage | ResponseMessage)
        // >   Size => int32
        let mut transport = Framed::new(
            stream,
            LengthDelimitedCodec::builder()
                .big_endian()
                .length_field_length(4)
                .max_frame_length(1 << 27) // 128 MiB
                .new_codec(),
        );

        let versions = tokio::time::timeout(
            config.request_timeout,
            handshake(&mut transport, addr, &config.client_id),
        )
        .await
        .map_err(|_| Error::Timeout(config.request_timeout))??;

        tracing::debug!(node_id, addr, ?versions, "negotiated API versions");
        metrics::counter!("kafka_client_connections_opened", "broker" => addr.to_string())
            .increment(1);

        // The Config of a BrokerPool may not have been validated.
        let capacity = config.max_in_flight_requests_per_connection.clamp(1, 1 << 16);
        let addr: Arc<str> = addr.into();
        let (submit, rx) = mpsc::unbounded_channel();
        let slots = Arc::new(Semaphore::new(capacity));
        let shutdown = CancellationToken::new();

        let actor = Actor {
            addr: addr.clone(),
            client_id: config.client_id.clone(),
            transport,
            rx,
            slots: slots.clone(),
            table: (0..capacity).map(|_| None).collect(),
            wrap: (i32::MAX / capacity as i32) * capacity as i32,
            oldest: 1,
            next: 1,
            in_flight: 0,
            idle_timeout: config.connections_max_idle,
            last_activity: Instant::now(),
            shutdown: shutdown.clone(),
        };
        tokio::spawn(actor.run());

        Ok(Self {
            inner: Arc::new(Inner {
                node_id,
                addr,
                versions,
                request_timeout: config.request_timeout,
                submit,
                slots,
                shutdown,
            }),
        })
    }

    pub fn node_id(&self) -> i32 {
        self.inner.node_id
    }

    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    /// Negotiated version of request `R` on this connection.
    pub fn version<R: Request>(&self) -> Result<i16> {
        self.inner.versions.version::<R>()
    }

    /// Closed connections reject all further requests.
    pub fn is_closed(&self) -> bool {
        self.inner.submit.is_closed() || self.inner.shutdown.is_cancelled()
    }

    /// Stop accepting requests, and close once in-flight requests complete or time out.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }

    /// Send a request and wait for its response.
    pub async fn request<R: Request>(&self, request: &R) -> Result<R::Response> {
        self.send(request).await?.await
    }

    /// Submit a request, returning a Pending response once it's been queued.
    /// Waits while the connection's in-flight table is full.
    pub async fn send<R: Request>(&self, request: &R) -> Result<Pending<R::Response>> {
        self.send_with_timeout(request, self.inner.request_timeout).await
    }

    /// Submit a request which may take up to `timeout` to be answered.
    pub async fn send_with_timeout<R: Request>(
        &self,
        request: &R,
        timeout: Duration,
    ) -> Result<Pending<R::Response>> {
        let version = self.version::<R>()?;
        let rx = self.submit::<R>(request, version, timeout, true).await?;

        Ok(Pending {
            rx,
            version,
            addr: self.inner.addr.clone(),
            decode: codec::decode_response::<R>,
        })
    }

    /// Submit a request which the broker will not answer, such as a
    /// Produce with acks=0. The Pending resolves once it's been written.
    pub async fn send_without_response<R: Request>(&self, request: &R) -> Result<Pending<()>> {
        let version = self.version::<R>()?;
        let rx = self
            .submit::<R>(request, version, self.inner.request_timeout, false)
            .await?;

        Ok(Pending {
            rx,
            version,
            addr: self.inner.addr.clone(),
            decode: |_, _| Ok(()),
        })
    }

    async fn submit<R: Request>(
        &self,
        request: &R,
        version: i16,
        timeout: Duration,
        expects_response: bool,
    ) -> Result<oneshot::Receiver<Result<Bytes>>> {
        let body = codec::encode_body(request, version)?;

        let permit = self
            .inner
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| self.closed_error())?;

        if self.inner.shutdown.is_cancelled() {
            return Err(self.closed_error());
        }

        let (reply, rx) = oneshot::channel();
        self.inner
            .submit
            .send(Submission {
                api_key: R::KEY,
                api_version: version,
                header_version: R::header_version(version),
                body,
                timeout,
                expects_response,
                reply,
                permit,
            })
            .map_err(|_| self.closed_error())?;

        Ok(rx)
    }

    fn closed_error(&self) -> Error {
        Error::ConnectionLost {
            addr: self.inner.addr.to_string(),
            reason: "connection is closed".to_string(),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("node_id", &self.inner.node_id)
            .field("addr", &self.inner.addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// Exchange ApiVersions with the broker before any other request.
// Brokers which don't support the requested version answer with
// UNSUPPORTED_VERSION in a v0 response, after which we retry at v0.
async fn handshake(transport: &mut Transport, addr: &str, client_id: &str) -> Result<Versions> {
    type Req = messages::ApiVersionsRequest;

    for version in [3, 0] {
        let request = if version >= 3 {
            Req::default()
                .with_client_software_name(codec::str_bytes("kafka-client"))
                .with_client_software_version(codec::str_bytes(env!("CARGO_PKG_VERSION")))
        } else {
            Req::default()
        };
        let frame = codec::encode_request(&request, version, 0, client_id)?;
        transport.send(frame).await.map_err(|err| lost(addr, err))?;

        let mut frame = match transport.next().await {
            Some(Ok(frame)) => frame.freeze(),
            Some(Err(err)) => return Err(lost(addr, err)),
            None => return Err(lost(addr, "connection closed during handshake")),
        };

        let correlation_id = codec::decode_response_header(&mut frame, Req::KEY, version)?;
        if correlation_id != 0 {
            return Err(Error::CorruptMessage(format!(
                "handshake response has correlation id {correlation_id}"
            )));
        }

        let response = match codec::decode_response::<Req>(frame.clone(), version) {
            Ok(response) => response,
            Err(err) if version == 0 => return Err(err),
            Err(err) => match codec::decode_response::<Req>(frame, 0) {
                Ok(response) if response.error_code == ErrorCode::UNSUPPORTED_VERSION.0 => response,
                _ => return Err(err),
            },
        };

        match ErrorCode::check(response.error_code) {
            Ok(()) => return Ok(Versions::negotiate(&response)),
            Err(ErrorCode::UNSUPPORTED_VERSION) if version != 0 => {
                tracing::debug!(addr, version, "broker rejected ApiVersions version (will retry)");
            }
            Err(code) => return Err(Error::Broker(code)),
        }
    }
    Err(Error::UnsupportedVersion {
        api_key: Req::KEY,
    })
}

fn lost(addr: &str, reason: impl std::fmt::Display) -> Error {
    Error::ConnectionLost {
        addr: addr.to_string(),
        reason: reason.to_string(),
    }
}

struct InFlight {
    correlation_id: i32,
    api_key: i16,
    api_version: i16,
    deadline: Instant,
    timeout: Duration,
    reply: oneshot::Sender<Result<Bytes>>,
    _permit: OwnedSemaphorePermit,
}

// Actor owns the transport and the table of in-flight requests.
// Outstanding correlation ids are the contiguous range [oldest, next),
// and each lives in table slot `id % capacity`.
struct Actor {
    addr: Arc<str>,
    client_id: String,
    transport: Transport,
    rx: mpsc::UnboundedReceiver<Submission>,
    slots: Arc<Semaphore>,
    table: Vec<Option<InFlight>>,
    // Correlation ids wrap at a multiple of the table capacity,
    // so that consecutive ids always map to distinct slots.
    wrap: i32,
    oldest: i32,
    next: i32,
    in_flight: usize,
    idle_timeout: Duration,
    last_activity: Instant,
    shutdown: CancellationToken,
}

impl Actor {
    async fn run(mut self) {
        let err = self.serve().await;

        match &err {
            Error::ConnectionLost { reason, .. } if self.in_flight == 0 => {
                tracing::debug!(addr = %self.addr, %reason, "connection closed");
            }
            err => tracing::warn!(addr = %self.addr, %err, in_flight = self.in_flight, "connection failed"),
        }
        metrics::counter!("kafka_client_connections_closed", "broker" => self.addr.to_string())
            .increment(1);

        self.slots.close();
        self.rx.close();
        self.fail_all(err);
    }

    // Serve until the connection fails or is closed, returning the cause.
    async fn serve(&mut self) -> Error {
        let mut accepting = true;
        let mut closing = false;

        loop {
            if !accepting && self.in_flight == 0 {
                return lost(&self.addr, "connection was closed");
            }
            let deadline = self.deadline();

            tokio::select! {
                biased;

                // Requests submitted before the close are still written.
                () = self.shutdown.cancelled(), if !closing => {
                    closing = true;
                    self.rx.close();
                }
                frame = self.transport.next() => match frame {
                    Some(Ok(frame)) => {
                        if let Err(err) = self.on_response(frame.freeze()) {
                            return err;
                        }
                    }
                    Some(Err(err)) => return lost(&self.addr, err),
                    None => return lost(&self.addr, "connection closed by broker"),
                },
                submission = self.rx.recv(), if accepting => match submission {
                    Some(submission) => {
                        if let Err(err) = self.write(submission).await {
                            return err;
                        }
                    }
                    None => accepting = false,
                },
                () = tokio::time::sleep_until(deadline) => {
                    return self.on_deadline();
                }
            }
        }
    }

    fn deadline(&self) -> Instant {
        self.table
            .iter()
            .flatten()
            .map(|entry| entry.deadline)
            .min()
            .unwrap_or(self.last_activity + self.idle_timeout)
    }

    fn on_deadline(&mut self) -> Error {
        let now = Instant::now();
        let expired = self
            .table
            .iter_mut()
            .find(|entry| matches!(entry, Some(e) if e.deadline <= now))
            .and_then(Option::take);

        match expired {
            Some(entry) => {
                self.in_flight -= 1;
                tracing::warn!(
                    addr = %self.addr,
                    api_key = entry.api_key,
                    correlation_id = entry.correlation_id,
                    timeout = ?entry.timeout,
                    "request timed out"
                );
                let _ = entry.reply.send(Err(Error::Timeout(entry.timeout)));
                lost(&self.addr, "a request timed out")
            }
            None => lost(&self.addr, "connection was idle"),
        }
    }

    async fn write(&mut self, submission: Submission) -> std::result::Result<(), Error> {
        let Submission {
            api_key,
            api_version,
            header_version,
            body,
            timeout,
            expects_response,
            reply,
            permit,
        } = submission;

        let correlation_id = self.next;

        let mut frame = BytesMut::with_capacity(body.len() + 64);
        if let Err(err) = codec::encode_header(
            &mut frame,
            api_key,
            api_version,
            header_version,
            correlation_id,
            &self.client_id,
        ) {
            let _ = reply.send(Err(err));
            return Ok(()); // Fails only this request.
        }
        frame.extend_from_slice(&body);
        self.last_activity = Instant::now();

        tracing::trace!(addr = %self.addr, api_key, api_version, correlation_id, "sending request");

        if !expects_response {
            // The broker never answers, so the correlation id isn't consumed
            // and will be used again by the next request.
            let result = self.transport.send(frame.freeze()).await;
            let result = result.map_err(|err| lost(&self.addr, err));
            let _ = reply.send(result.clone().map(|()| Bytes::new()));
            drop(permit);
            return result;
        }

        self.next = (self.next + 1) % self.wrap;
        let slot = correlation_id as usize % self.table.len();
        debug_assert!(self.table[slot].is_none());

        self.table[slot] = Some(InFlight {
            correlation_id,
            api_key,
            api_version,
            deadline: Instant::now() + timeout,
            timeout,
            reply,
            _permit: permit,
        });
        self.in_flight += 1;

        self.transport
            .send(frame.freeze())
            .await
            .map_err(|err| lost(&self.addr, err))
    }

    fn on_response(&mut self, mut frame: Bytes) -> std::result::Result<(), Error> {
        let slot = self.oldest as usize % self.table.len();

        let Some(entry) = self.table[slot].as_ref() else {
            return Err(Error::CorruptMessage(
                "received a response with no request in flight".to_string(),
            ));
        };

        let correlation_id =
            codec::decode_response_header(&mut frame, entry.api_key, entry.api_version)?;

        if correlation_id != entry.correlation_id {
            return Err(Error::CorruptMessage(format!(
                "response correlation id {correlation_id} doesn't match oldest in-flight request {}",
                entry.correlation_id
            )));
        }
        let Some(entry) = self.table[slot].take() else {
            unreachable!("slot was occupied above");
        };

        self.in_flight -= 1;
        self.oldest = (self.oldest + 1) % self.wrap;
        self.last_activity = Instant::now();

        tracing::trace!(addr = %self.addr, correlation_id, bytes = frame.len(), "received response");

        // The waiter may have been dropped, which is fine.
        let _ = entry.reply.send(Ok(frame));
        Ok(())
    }

    fn fail_all(&mut self, err: Error) {
        for entry in self.table.iter_mut().filter_map(Option::take) {
            let _ = entry.reply.send(Err(err.clone()));
        }
        self.in_flight = 0;

        // Requests which were queued but never written.
        while let Ok(submission) = self.rx.try_recv() {
            let _ = submission.reply.send(Err(err.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockBroker, Reply};
    use messages::{HeartbeatRequest, HeartbeatResponse, MetadataRequest, MetadataResponse};

    fn config() -> Config {
        Config {
            max_in_flight_requests_per_connection: 3,
            request_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    fn heartbeat(generation_id: i32) -> HeartbeatRequest {
        HeartbeatRequest::default()
            .with_group_id(codec::group_id("group"))
            .with_generation_id(generation_id)
            .with_member_id(codec::str_bytes("member"))
    }

    #[tokio::test]
    async fn test_pipelined_requests_resolve_in_order() {
        // Answers each heartbeat with an error code equal to its generation.
        let broker = MockBroker::start(|req| {
            let hb: HeartbeatRequest = req.decode();
            Reply::respond::<HeartbeatRequest>(
                &req,
                &HeartbeatResponse::default().with_error_code(hb.generation_id as i16),
            )
        })
        .await;

        let conn = Connection::open(1, &broker.addr(), &config()).await.unwrap();

        let mut pending = Vec::new();
        for generation in 1..=10 {
            pending.push(conn.send(&heartbeat(generation)).await.unwrap());
        }
        for (generation, pending) in (1..=10).zip(pending) {
            assert_eq!(pending.await.unwrap().error_code, generation);
        }

        // Correlation ids were assigned in send order, after the handshake's id of zero.
        let ids: Vec<i32> = broker.requests().iter().map(|h| h.correlation_id).collect();
        assert_eq!(ids, (0..=10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_zero_in_flight_limit_allows_one_request() {
        let broker = MockBroker::start(|req| {
            Reply::respond::<HeartbeatRequest>(&req, &HeartbeatResponse::default())
        })
        .await;

        let config = Config {
            max_in_flight_requests_per_connection: 0,
            ..config()
        };
        let conn = Connection::open(1, &broker.addr(), &config).await.unwrap();

        for generation in 1..=3 {
            assert_eq!(conn.request(&heartbeat(generation)).await.unwrap().error_code, 0);
        }
    }

    #[tokio::test]
    async fn test_correlation_mismatch_is_corrupt_and_fatal() {
        let broker = MockBroker::start(|req| {
            let mut header = req.header.clone();
            header.correlation_id += 100;
            Reply::respond_as::<HeartbeatRequest>(&header, &HeartbeatResponse::default())
        })
        .await;

        let conn = Connection::open(1, &broker.addr(), &config()).await.unwrap();
        let err = conn.request(&heartbeat(1)).await.unwrap_err();

        assert!(matches!(err, Error::CorruptMessage(msg) if msg.contains("correlation id")));

        // The connection is closed, and further requests fail.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(conn.is_closed());
        assert!(matches!(
            conn.request(&heartbeat(2)).await,
            Err(Error::ConnectionLost { .. })
        ));
    }

    #[tokio::test]
    async fn test_broker_disconnect_fails_all_pending() {
        let broker = MockBroker::start(|_req| Reply::Hangup).await;
        let conn = Connection::open(1, &broker.addr(), &config()).await.unwrap();

        let one = conn.send(&heartbeat(1)).await.unwrap();
        let two = conn.send(&heartbeat(2)).await.unwrap();

        for pending in [one, two] {
            assert!(matches!(pending.await, Err(Error::ConnectionLost { .. })));
        }
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let broker = MockBroker::start(|_req| Reply::Ignore).await;
        let conn = Connection::open(
            1,
            &broker.addr(),
            &Config {
                request_timeout: Duration::from_millis(100),
                ..config()
            },
        )
        .await
        .unwrap();

        let err = conn.request(&heartbeat(1)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(d) if d == Duration::from_millis(100)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_idle_connections_close() {
        let broker = MockBroker::start(|_req| Reply::Ignore).await;
        let conn = Connection::open(
            1,
            &broker.addr(),
            &Config {
                connections_max_idle: Duration::from_millis(50),
                ..config()
            },
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_graceful_close_completes_in_flight() {
        let broker = MockBroker::start(|req| {
            Reply::respond::<HeartbeatRequest>(&req, &HeartbeatResponse::default())
        })
        .await;
        let conn = Connection::open(1, &broker.addr(), &config()).await.unwrap();

        let pending = conn.send(&heartbeat(1)).await.unwrap();
        tokio::task::yield_now().await;
        conn.close();

        assert_eq!(pending.await.unwrap().error_code, 0);
        assert!(conn.is_closed());
        assert!(conn.send(&heartbeat(2)).await.is_err());
    }

    #[tokio::test]
    async fn test_unsupported_api_is_rejected_before_sending() {
        let broker = MockBroker::with_versions(
            vec![(MetadataRequest::KEY, 1, 12)],
            |req| Reply::respond::<MetadataRequest>(&req, &MetadataResponse::default()),
        )
        .await;
        let conn = Connection::open(1, &broker.addr(), &config()).await.unwrap();

        assert!(matches!(
            conn.request(&heartbeat(1)).await,
            Err(Error::UnsupportedVersion { api_key }) if api_key == HeartbeatRequest::KEY
        ));
        conn.request(&MetadataRequest::default()).await.unwrap();
    }

    #[tokio::test]
    async fn test_reopen_cycles_do_not_leak() {
        let broker = MockBroker::start(|req| {
            Reply::respond::<HeartbeatRequest>(&req, &HeartbeatResponse::default())
        })
        .await;

        for _ in 0..20 {
            let conn = Connection::open(1, &broker.addr(), &config()).await.unwrap();
            conn.request(&heartbeat(1)).await.unwrap();
            conn.close();
        }
        // Every connection's actor exits, and the broker observes each disconnect.
        tokio::time::timeout(Duration::from_secs(5), broker.wait_for_disconnects(20))
            .await
            .unwrap();
    }
}
