use crate::codec::{self, ErrorCode};
use crate::retry::Retry;
use crate::{Config, Connection, Error, Result, TopicPartition};
use kafka_protocol::messages;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use tokio::sync::{watch, Notify};
use tokio_util::task::AbortOnDropHandle;

// DialState represents a Connection which may be:
// - Ready (if Some and not closed)
// - Currently being dialed (if locked)
// - Neither (None and not locked, or holding a closed Connection).
// Ready connections also track their number of uses since the last sweep.
type DialState = Arc<futures::lock::Mutex<Option<(Connection, usize)>>>;

/// A broker of the cluster, as described by a Metadata response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerNode {
    pub node_id: i32,
    pub host: String,
    pub port: i32,
    pub rack: Option<String>,
}

impl BrokerNode {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub partition: i32,
    /// Node id of the leader, or -1 if there is none.
    pub leader: i32,
    pub leader_epoch: i32,
    pub replicas: Vec<i32>,
    pub isr: Vec<i32>,
    pub error: ErrorCode,
}

/// ClusterView is an immutable snapshot of cluster metadata.
/// Each refresh produces a new ClusterView with a greater `version`.
#[derive(Debug, Clone, Default)]
pub struct ClusterView {
    pub version: u64,
    pub cluster_id: Option<String>,
    pub controller_id: i32,
    pub brokers: BTreeMap<i32, BrokerNode>,
    /// Partitions of each topic, ordered by partition index.
    pub topics: BTreeMap<String, Vec<PartitionInfo>>,
    /// Topics which the cluster reported an error for, such as an unknown topic.
    pub topic_errors: BTreeMap<String, ErrorCode>,
}

impl ClusterView {
    pub fn partition_count(&self, topic: &str) -> Option<usize> {
        self.topics.get(topic).map(Vec::len)
    }

    pub fn partition(&self, tp: &TopicPartition) -> Option<&PartitionInfo> {
        self.topics
            .get(&tp.topic)?
            .iter()
            .find(|p| p.partition == tp.partition)
    }

    /// The leader of `tp`, if it's known and is a listed broker.
    pub fn leader(&self, tp: &TopicPartition) -> Option<&BrokerNode> {
        let partition = self.partition(tp)?;
        self.brokers.get(&partition.leader)
    }

    /// Partitions of `topic` which currently have a leader.
    pub fn available_partitions(&self, topic: &str) -> Vec<i32> {
        let Some(partitions) = self.topics.get(topic) else {
            return Vec::new();
        };
        partitions
            .iter()
            .filter(|p| self.brokers.contains_key(&p.leader))
            .map(|p| p.partition)
            .collect()
    }

    pub(crate) fn from_response(version: u64, response: messages::MetadataResponse) -> Self {
        let brokers = response
            .brokers
            .into_iter()
            .map(|b| {
                let node = BrokerNode {
                    node_id: b.node_id.0,
                    host: b.host.to_string(),
                    port: b.port,
                    rack: b.rack.map(|r| r.to_string()),
                };
                (node.node_id, node)
            })
            .collect();

        let mut topics = BTreeMap::new();
        let mut topic_errors = BTreeMap::new();

        for topic in response.topics {
            let Some(name) = topic.name else {
                continue;
            };
            let name = name.0.to_string();

            if let Err(code) = ErrorCode::check(topic.error_code) {
                topic_errors.insert(name, code);
                continue;
            }
            let mut partitions: Vec<PartitionInfo> = topic
                .partitions
                .into_iter()
                .map(|p| PartitionInfo {
                    partition: p.partition_index,
                    leader: p.leader_id.0,
                    leader_epoch: p.leader_epoch,
                    replicas: p.replica_nodes.into_iter().map(|id| id.0).collect(),
                    isr: p.isr_nodes.into_iter().map(|id| id.0).collect(),
                    error: ErrorCode(p.error_code),
                })
                .collect();
            partitions.sort_by_key(|p| p.partition);

            topics.insert(name, partitions);
        }

        Self {
            version,
            cluster_id: response.cluster_id.map(|id| id.to_string()),
            controller_id: response.controller_id.0,
            brokers,
            topics,
            topic_errors,
        }
    }
}

/// BrokerPool owns a Connection to each broker the client talks to,
/// and the client's view of cluster metadata. It routes requests to
/// partition leaders and group coordinators, refreshing metadata when
/// a target is unknown.
///
/// BrokerPool is cheaply cloneable, and its clones share connections.
#[derive(Clone)]
pub struct BrokerPool {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<Config>,
    states: std::sync::Mutex<HashMap<i32, DialState>>,
    view: watch::Sender<Arc<ClusterView>>,
    // Serializes metadata refreshes, so that concurrent callers share one.
    refresh: tokio::sync::Mutex<()>,
    // Wakes the background refresher ahead of its schedule.
    refresh_now: Arc<Notify>,
    topics: std::sync::Mutex<BTreeSet<String>>,
    coordinators: std::sync::Mutex<HashMap<String, BrokerNode>>,
    closed: std::sync::atomic::AtomicBool,
    refresher: std::sync::Mutex<Option<AbortOnDropHandle<()>>>,
}

impl BrokerPool {
    /// Build a BrokerPool which bootstraps from `config.bootstrap_servers`.
    /// Connections are opened lazily, on first use.
    pub fn new(config: Arc<Config>) -> Self {
        let (view, _) = watch::channel(Arc::new(ClusterView::default()));
        let refresh_now = Arc::new(Notify::new());

        let inner = Arc::new(Inner {
            config,
            states: Default::default(),
            view,
            refresh: Default::default(),
            refresh_now: refresh_now.clone(),
            topics: Default::default(),
            coordinators: Default::default(),
            closed: Default::default(),
            refresher: Default::default(),
        });

        let refresher = tokio::spawn(refresh_loop(
            Arc::downgrade(&inner),
            refresh_now,
            inner.config.metadata_max_age,
        ));
        *inner.refresher.lock().unwrap() = Some(AbortOnDropHandle::new(refresher));

        Self { inner }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Current snapshot of cluster metadata.
    pub fn snapshot(&self) -> Arc<ClusterView> {
        self.inner.view.borrow().clone()
    }

    /// Watch for new snapshots of cluster metadata.
    pub fn subscribe(&self) -> watch::Receiver<Arc<ClusterView>> {
        self.inner.view.subscribe()
    }

    /// Add topics to those whose metadata is requested on each refresh.
    /// Returns true if any topic wasn't already tracked.
    pub fn track_topics<I, S>(&self, topics: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut tracked = self.inner.topics.lock().unwrap();
        let mut added = false;
        for topic in topics {
            added |= tracked.insert(topic.into());
        }
        added
    }

    /// Fetch cluster metadata and publish a new ClusterView.
    /// If another refresh completes while this one waits to start,
    /// its view is returned instead.
    pub async fn refresh_metadata(&self) -> Result<Arc<ClusterView>> {
        let observed = self.snapshot().version;
        let _guard = self.inner.refresh.lock().await;

        let current = self.snapshot();
        if current.version != observed {
            return Ok(current);
        }
        self.check_open()?;

        let topics: Vec<_> = self
            .inner
            .topics
            .lock()
            .unwrap()
            .iter()
            .map(|topic| {
                messages::metadata_request::MetadataRequestTopic::default()
                    .with_name(Some(codec::topic_name(topic)))
            })
            .collect();
        let request = messages::MetadataRequest::default().with_topics(Some(topics));

        let conn = self.any_connection().await?;
        let response = conn.request(&request).await?;

        let view = Arc::new(ClusterView::from_response(current.version + 1, response));
        tracing::debug!(
            version = view.version,
            brokers = view.brokers.len(),
            topics = view.topics.len(),
            via = conn.node_id(),
            "refreshed cluster metadata"
        );
        metrics::counter!("kafka_client_metadata_refreshes").increment(1);

        self.drop_stale_brokers(&view);
        self.inner.view.send_replace(view.clone());

        Ok(view)
    }

    /// Ask the background refresher to refresh metadata now, rather than
    /// waiting for `metadata_max_age` to elapse.
    pub fn request_refresh(&self) {
        self.inner.refresh_now.notify_one();
    }

    /// Connection to broker `node_id`, which must be a known broker or bootstrap server.
    pub async fn connection_for(&self, node_id: i32) -> Result<Connection> {
        let target = format!("broker {node_id}");
        let addr = self
            .route(&target, |view| Ok(self.address_of(view, node_id)))
            .await?;
        self.connect(node_id, &addr).await
    }

    /// Connection to the current leader of `tp`.
    pub async fn leader_for(&self, tp: &TopicPartition) -> Result<Connection> {
        self.track_topics([tp.topic.as_str()]);
        let node = self
            .route(&tp.to_string(), |view| {
                if let Some(code) = view.topic_errors.get(&tp.topic) {
                    if !code.is_retriable() {
                        return Err(Error::Broker(*code));
                    }
                }
                Ok(view.leader(tp).cloned())
            })
            .await?;
        self.connect(node.node_id, &node.addr()).await
    }

    /// Number of partitions of `topic`, refreshing metadata if it's not yet known.
    pub async fn partition_count(&self, topic: &str) -> Result<usize> {
        self.track_topics([topic]);

        self.route(&format!("topic {topic}"), |view| {
            if let Some(count) = view.partition_count(topic) {
                return Ok(Some(count));
            }
            match view.topic_errors.get(topic) {
                Some(code) if !code.is_retriable() => Err(Error::Broker(*code)),
                _ => Ok(None),
            }
        })
        .await
    }

    /// Forget the leader of `tp`, following NotLeaderOrFollower or
    /// similar feedback, and refresh metadata in the background.
    pub fn invalidate_leader(&self, tp: &TopicPartition) {
        self.inner.view.send_if_modified(|view| {
            let Some(partition) = view.partition(tp) else {
                return false;
            };
            if partition.leader < 0 {
                return false;
            }
            let mut next = ClusterView::clone(view);
            if let Some(partitions) = next.topics.get_mut(&tp.topic) {
                for p in partitions.iter_mut().filter(|p| p.partition == tp.partition) {
                    p.leader = -1;
                }
            }
            *view = Arc::new(next);
            true
        });
        tracing::debug!(%tp, "invalidated partition leader");
        self.request_refresh();
    }

    /// Connection to the coordinator of `group`, which is looked up
    /// through FindCoordinator and cached until invalidated.
    pub async fn coordinator_for(&self, group: &str) -> Result<Connection> {
        let cached = self.inner.coordinators.lock().unwrap().get(group).cloned();

        if let Some(node) = cached {
            match self.connect(node.node_id, &node.addr()).await {
                Ok(conn) => return Ok(conn),
                Err(err) if err.is_retryable() => {
                    tracing::warn!(group, node_id = node.node_id, error = %err, "failed to connect to group coordinator (will retry)");
                    self.invalidate_coordinator(group);
                }
                Err(err) => return Err(err),
            }
        }

        let mut retry = Retry::from_config(&self.inner.config, self.inner.config.routing_retries);
        loop {
            let err = match self.find_coordinator(group).await {
                Ok(node) => match self.connect(node.node_id, &node.addr()).await {
                    Ok(conn) => {
                        self.inner
                            .coordinators
                            .lock()
                            .unwrap()
                            .insert(group.to_string(), node);
                        return Ok(conn);
                    }
                    Err(err) => err,
                },
                Err(err) => err,
            };
            if !err.is_retryable() {
                return Err(err);
            }
            tracing::warn!(group, attempt = retry.attempts(), error = %err, "failed to locate group coordinator (will retry)");

            if !retry.wait().await {
                return Err(Error::Routing {
                    target: format!("coordinator of group {group}"),
                    attempts: retry.attempts(),
                });
            }
        }
    }

    /// Forget the cached coordinator of `group`, following NotCoordinator
    /// or CoordinatorNotAvailable feedback.
    pub fn invalidate_coordinator(&self, group: &str) {
        if self.inner.coordinators.lock().unwrap().remove(group).is_some() {
            tracing::debug!(group, "invalidated group coordinator");
        }
    }

    /// A Connection to any broker, preferring those which are already connected.
    pub async fn any_connection(&self) -> Result<Connection> {
        self.check_open()?;
        let view = self.snapshot();

        let mut candidates: Vec<(i32, String)> = view
            .brokers
            .values()
            .map(|node| (node.node_id, node.addr()))
            .collect();
        candidates.extend(
            self.inner
                .config
                .bootstrap_servers
                .iter()
                .enumerate()
                .map(|(index, addr)| (bootstrap_id(index), addr.clone())),
        );
        candidates.sort_by_key(|(node_id, _)| !self.is_connected(*node_id));

        let mut last_err = Error::Closed;
        for (node_id, addr) in candidates {
            match self.connect(node_id, &addr).await {
                Ok(conn) => return Ok(conn),
                Err(err) if err.is_retryable() => {
                    tracing::warn!(node_id, %addr, error = %err, "failed to connect to broker (will try another)");
                    last_err = err;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err)
    }

    // Close connections which have not been used since the preceding sweep.
    // As brokers come and go, connections may no longer be needed.
    pub fn sweep(&self) {
        let mut states = self.inner.states.lock().unwrap();

        states.retain(|node_id, state| {
            // Retain entries which are currently connecting.
            let Some(mut state) = state.try_lock() else {
                return true;
            };
            // Drop entries which are not connected.
            let Some((conn, uses)) = &mut *state else {
                return false;
            };
            if conn.is_closed() {
                return false;
            }
            if *uses == 0 {
                tracing::debug!(node_id, "closing idle broker connection");
                conn.close();
                return false;
            }
            *uses = 0; // Mark for next sweep.
            true
        });
    }

    /// Close all connections. The pool rejects further use.
    pub fn close(&self) {
        self.inner
            .closed
            .store(true, std::sync::atomic::Ordering::SeqCst);
        self.inner.refresher.lock().unwrap().take();

        let mut states = self.inner.states.lock().unwrap();
        for (_, state) in states.drain() {
            if let Some(state) = state.try_lock() {
                if let Some((conn, _)) = &*state {
                    conn.close();
                }
            }
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.inner.closed.load(std::sync::atomic::Ordering::SeqCst) {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    // Resolve a target using the current ClusterView, refreshing metadata
    // with bounded retries while `resolve` is unable to.
    async fn route<T>(
        &self,
        target: &str,
        resolve: impl Fn(&ClusterView) -> Result<Option<T>>,
    ) -> Result<T> {
        let mut retry = Retry::from_config(&self.inner.config, self.inner.config.routing_retries);
        let mut refreshed = false;

        loop {
            if let Some(found) = resolve(&self.snapshot())? {
                return Ok(found);
            }
            if refreshed && !retry.wait().await {
                return Err(Error::Routing {
                    target: target.to_string(),
                    attempts: retry.attempts(),
                });
            }
            refreshed = true;

            match self.refresh_metadata().await {
                Ok(_) => {}
                Err(err) if err.is_retryable() => {
                    tracing::warn!(to = target, error = %err, "failed to refresh metadata (will retry)");
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn address_of(&self, view: &ClusterView, node_id: i32) -> Option<String> {
        if node_id < 0 {
            let index = (-1 - node_id) as usize;
            return self.inner.config.bootstrap_servers.get(index).cloned();
        }
        if let Some(node) = view.brokers.get(&node_id) {
            return Some(node.addr());
        }
        self.inner
            .coordinators
            .lock()
            .unwrap()
            .values()
            .find(|node| node.node_id == node_id)
            .map(BrokerNode::addr)
    }

    fn is_connected(&self, node_id: i32) -> bool {
        let states = self.inner.states.lock().unwrap();
        let Some(state) = states.get(&node_id) else {
            return false;
        };
        let connected = match state.try_lock() {
            Some(state) => matches!(&*state, Some((conn, _)) if !conn.is_closed()),
            None => true, // Another task is dialing.
        };
        connected
    }

    fn state(&self, node_id: i32) -> DialState {
        // Acquire non-async lock which *cannot* be held across an await point.
        let mut states = self.inner.states.lock().unwrap();
        states.entry(node_id).or_default().clone()
    }

    async fn connect(&self, node_id: i32, addr: &str) -> Result<Connection> {
        self.check_open()?;
        let state = self.state(node_id);

        // Acquire node-specific, async-aware lock.
        let mut state = state.lock().await;

        // Fast path: connection is open and ready.
        if let Some((conn, uses)) = &mut *state {
            if !conn.is_closed() && conn.addr() == addr {
                *uses += 1;
                return Ok(conn.clone());
            }
            conn.close();
        }

        // Slow path: open a new connection.
        let conn = Connection::open(node_id, addr, &self.inner.config).await?;
        *state = Some((conn.clone(), 1));

        // The pool may have closed while we were dialing.
        if let Err(err) = self.check_open() {
            conn.close();
            return Err(err);
        }
        Ok(conn)
    }

    async fn find_coordinator(&self, group: &str) -> Result<BrokerNode> {
        type R = messages::FindCoordinatorRequest;

        let conn = self.any_connection().await?;
        let version = conn.version::<R>()?;

        let (error_code, node_id, host, port) = if version >= 4 {
            let request = R::default().with_coordinator_keys(vec![codec::str_bytes(group)]);
            let response = conn.request(&request).await?;

            let Some(coordinator) = response.coordinators.into_iter().next() else {
                return Err(Error::CorruptMessage(
                    "FindCoordinator response has no coordinators".to_string(),
                ));
            };
            (
                coordinator.error_code,
                coordinator.node_id,
                coordinator.host,
                coordinator.port,
            )
        } else {
            let request = R::default().with_key(codec::str_bytes(group));
            let response = conn.request(&request).await?;
            (
                response.error_code,
                response.node_id,
                response.host,
                response.port,
            )
        };
        ErrorCode::check(error_code).map_err(Error::Coordination)?;

        let node = BrokerNode {
            node_id: node_id.0,
            host: host.to_string(),
            port,
            rack: None,
        };
        tracing::debug!(group, node_id = node.node_id, addr = %node.addr(), "located group coordinator");
        Ok(node)
    }

    // Close and remove connections of brokers which are no longer in the cluster.
    fn drop_stale_brokers(&self, view: &ClusterView) {
        let coordinators: BTreeSet<i32> = self
            .inner
            .coordinators
            .lock()
            .unwrap()
            .values()
            .map(|node| node.node_id)
            .collect();

        let mut states = self.inner.states.lock().unwrap();
        states.retain(|node_id, state| {
            if *node_id < 0 || view.brokers.contains_key(node_id) || coordinators.contains(node_id) {
                return true;
            }
            let Some(state) = state.try_lock() else {
                return true; // Dialing.
            };
            if let Some((conn, _)) = &*state {
                tracing::debug!(node_id, addr = conn.addr(), "closing connection to departed broker");
                conn.close();
            }
            false
        });
    }
}

impl std::fmt::Debug for BrokerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let view = self.snapshot();
        f.debug_struct("BrokerPool")
            .field("version", &view.version)
            .field("brokers", &view.brokers.keys().collect::<Vec<_>>())
            .finish()
    }
}

// Bootstrap servers are addressed by negative ids, distinct from broker node ids.
fn bootstrap_id(index: usize) -> i32 {
    -1 - index as i32
}

async fn refresh_loop(inner: Weak<Inner>, refresh_now: Arc<Notify>, period: std::time::Duration) {
    loop {
        let periodic = tokio::select! {
            _ = tokio::time::sleep(period) => true,
            _ = refresh_now.notified() => false,
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let pool = BrokerPool { inner };

        if let Err(err) = pool.refresh_metadata().await {
            tracing::warn!(error = %err, "background metadata refresh failed (will retry)");
            // Don't spin if we're being woken repeatedly.
            tokio::time::sleep(pool.inner.config.retry_backoff).await;
        }
        if periodic {
            pool.sweep();
        }
    }
}
