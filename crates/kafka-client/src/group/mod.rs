//! Membership of a consumer group.
//!
//! A GroupCoordinator runs the JoinGroup / SyncGroup / Heartbeat / LeaveGroup
//! exchange for a single member in a background task. Changes to the member's
//! assignment are published as GroupEvents, and the current membership may be
//! observed at any time.
//!
//! ```text
//! Unjoined -> Joining -> AwaitingSync -> Stable -> Rejoining -> Joining ...
//!   ^                                       |
//!   +--- UNKNOWN_MEMBER_ID / ILLEGAL_GENERATION
//!
//! (any) -> Left, on leave()
//! ```

use crate::codec::group::{Assignment, Subscription, PROTOCOL_TYPE};
use crate::codec::{self, ErrorCode};
use crate::retry::Retry;
use crate::{AssignmentStrategy, BrokerPool, Config, Error, Result, TopicPartition};
use itertools::Itertools;
use kafka_protocol::messages;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::task::AbortOnDropHandle;

pub mod assignor;
mod offsets;

pub use offsets::{commit, fetch, Generation};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MemberState {
    #[default]
    Unjoined,
    Joining,
    AwaitingSync,
    Stable,
    Rejoining,
    Left,
}

/// GroupMembership is the state of a member within its group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMembership {
    /// Empty until the member first joins.
    pub member_id: String,
    pub generation_id: i32,
    pub leader_id: String,
    pub protocol: Option<String>,
    pub assignment: BTreeSet<TopicPartition>,
    pub state: MemberState,
}

impl Default for GroupMembership {
    fn default() -> Self {
        Self {
            member_id: String::new(),
            generation_id: -1,
            leader_id: String::new(),
            protocol: None,
            assignment: BTreeSet::new(),
            state: MemberState::Unjoined,
        }
    }
}

impl GroupMembership {
    pub fn is_leader(&self) -> bool {
        !self.member_id.is_empty() && self.member_id == self.leader_id
    }

    pub fn generation(&self) -> Generation {
        Generation {
            generation_id: self.generation_id,
            member_id: self.member_id.clone(),
        }
    }
}

/// Events published by a GroupCoordinator, in the order they occur.
#[derive(Debug)]
pub enum GroupEvent {
    /// Partitions were assigned to this member in a new generation.
    Assigned {
        generation_id: i32,
        partitions: BTreeSet<TopicPartition>,
    },
    /// The group is rebalancing. Partitions must no longer be consumed,
    /// and the member waits for `ack` (or for `max_poll_interval`) before
    /// rejoining, which gives the consumer a chance to commit its offsets.
    Revoked {
        partitions: BTreeSet<TopicPartition>,
        ack: RevokeAck,
    },
    /// The member was removed from the group and its partitions may
    /// already belong to another member. Offsets cannot be committed.
    Lost { partitions: BTreeSet<TopicPartition> },
    /// Membership failed with a non-retryable error. No further events follow.
    Failed(Error),
}

/// Acknowledges a GroupEvent::Revoked. Dropping it also acknowledges.
#[derive(Debug)]
pub struct RevokeAck(oneshot::Sender<()>);

impl RevokeAck {
    pub fn ack(self) {
        let _ = self.0.send(());
    }
}

enum Control {
    Leave(oneshot::Sender<()>),
    Subscribe(BTreeSet<String>),
}

/// GroupCoordinator maintains membership of a consumer group.
pub struct GroupCoordinator {
    group_id: String,
    pool: BrokerPool,
    events: mpsc::UnboundedReceiver<GroupEvent>,
    membership: watch::Receiver<GroupMembership>,
    control: mpsc::UnboundedSender<Control>,
    _task: AbortOnDropHandle<()>,
}

impl GroupCoordinator {
    /// Start joining `group_id` with a subscription to `topics`.
    pub fn start(pool: BrokerPool, group_id: impl Into<String>, topics: BTreeSet<String>) -> Self {
        let group_id = group_id.into();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (membership_tx, membership) = watch::channel(GroupMembership::default());
        let (control, control_rx) = mpsc::unbounded_channel();

        let member = Member {
            pool: pool.clone(),
            config: Arc::new(pool.config().clone()),
            group_id: group_id.clone(),
            topics,
            membership: membership_tx,
            events: events_tx,
        };
        let task = tokio::spawn(member.run(control_rx));

        Self {
            group_id,
            pool,
            events,
            membership,
            control,
            _task: AbortOnDropHandle::new(task),
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Next published GroupEvent, or None if membership has ended.
    /// This method is cancellation safe.
    pub async fn next_event(&mut self) -> Option<GroupEvent> {
        self.events.recv().await
    }

    pub fn membership(&self) -> GroupMembership {
        self.membership.borrow().clone()
    }

    /// Watch for changes of membership.
    pub fn watch(&self) -> watch::Receiver<GroupMembership> {
        self.membership.clone()
    }

    /// Change the subscribed topics, which rejoins the group.
    pub fn subscribe(&self, topics: BTreeSet<String>) {
        let _ = self.control.send(Control::Subscribe(topics));
    }

    /// Commit offsets under the current generation.
    pub async fn commit_offsets(&self, offsets: &BTreeMap<TopicPartition, i64>) -> Result<()> {
        let generation = self.membership.borrow().generation();
        commit(&self.pool, &self.group_id, &generation, offsets).await
    }

    pub async fn fetch_committed(
        &self,
        partitions: &BTreeSet<TopicPartition>,
    ) -> Result<BTreeMap<TopicPartition, Option<i64>>> {
        fetch(&self.pool, &self.group_id, partitions).await
    }

    /// Leave the group. LeaveGroup is sent on a best-effort basis,
    /// and no further heartbeats are sent.
    pub async fn leave(&mut self) {
        let (done, wait) = oneshot::channel();
        if self.control.send(Control::Leave(done)).is_ok() {
            let _ = wait.await;
        }
    }
}

// What the member does next, after being interrupted or
// leaving the Stable state.
enum Next {
    Rejoin,
    Lost(ErrorCode),
    Backoff(Error),
    Leave(Option<oneshot::Sender<()>>),
    Fail(Error),
}

struct Member {
    pool: BrokerPool,
    config: Arc<Config>,
    group_id: String,
    topics: BTreeSet<String>,
    membership: watch::Sender<GroupMembership>,
    events: mpsc::UnboundedSender<GroupEvent>,
}

impl Member {
    #[tracing::instrument(level = "debug", skip_all, fields(group = %self.group_id))]
    async fn run(mut self, mut control: mpsc::UnboundedReceiver<Control>) {
        let mut retry = Retry::from_config(&self.config, u32::MAX);

        loop {
            let joined = tokio::select! {
                biased;
                control = control.recv() => Err(control),
                joined = self.join_and_sync() => Ok(joined),
            };

            let next = match joined {
                Err(control) => self.on_control(control),
                Ok(Err(err)) => self.classify(err),
                Ok(Ok(assignment)) => {
                    retry.reset();
                    if !self.on_assigned(assignment) {
                        Next::Leave(None)
                    } else {
                        let stable = tokio::select! {
                            biased;
                            control = control.recv() => Err(control),
                            next = self.heartbeat() => Ok(next),
                        };
                        match stable {
                            Err(control) => self.on_control(control),
                            Ok(next) => next,
                        }
                    }
                }
            };

            match next {
                Next::Rejoin => {
                    if let Some(Next::Leave(done)) = self.revoke(&mut control).await {
                        self.leave(done).await;
                        return;
                    }
                }
                Next::Lost(code) => self.lose(code),
                Next::Backoff(err) => {
                    tracing::warn!(error = %err, attempt = retry.attempts(), "group membership failed (will retry)");
                    retry.wait().await;
                }
                Next::Leave(done) => {
                    self.leave(done).await;
                    return;
                }
                Next::Fail(err) => {
                    tracing::error!(error = %err, "group membership failed");
                    self.membership.send_modify(|m| {
                        m.state = MemberState::Unjoined;
                        m.assignment.clear();
                    });
                    let _ = self.events.send(GroupEvent::Failed(err));
                    return;
                }
            }
        }
    }

    fn on_control(&mut self, control: Option<Control>) -> Next {
        match control {
            None => Next::Leave(None),
            Some(Control::Leave(done)) => Next::Leave(Some(done)),
            Some(Control::Subscribe(topics)) => {
                tracing::debug!(?topics, "subscription changed");
                self.topics = topics;
                Next::Rejoin
            }
        }
    }

    fn classify(&self, err: Error) -> Next {
        match err.code() {
            Some(ErrorCode::REBALANCE_IN_PROGRESS) => Next::Rejoin,
            Some(
                code @ (ErrorCode::UNKNOWN_MEMBER_ID
                | ErrorCode::ILLEGAL_GENERATION
                | ErrorCode::FENCED_INSTANCE_ID),
            ) => Next::Lost(code),
            Some(code) if code.invalidates_coordinator() => {
                self.pool.invalidate_coordinator(&self.group_id);
                Next::Backoff(err)
            }
            _ if err.is_retryable() => Next::Backoff(err),
            _ => Next::Fail(err),
        }
    }

    fn state(&self) -> MemberState {
        self.membership.borrow().state
    }

    fn set_state(&self, state: MemberState) {
        self.membership.send_modify(|m| m.state = state);
    }

    // Join the group and synchronize its assignment, returning the
    // assignment of this member.
    async fn join_and_sync(&mut self) -> Result<Assignment> {
        let timeout = self.config.rebalance_timeout + self.config.request_timeout;

        let (conn, joined) = loop {
            self.set_state(MemberState::Joining);
            let conn = self.pool.coordinator_for(&self.group_id).await?;

            let subscription = Subscription::new(self.topics.iter().cloned());
            let protocol = messages::join_group_request::JoinGroupRequestProtocol::default()
                .with_name(codec::str_bytes(self.config.assignment_strategy.protocol_name()))
                .with_metadata(subscription.encode());

            let member_id = self.membership.borrow().member_id.clone();
            let request = messages::JoinGroupRequest::default()
                .with_group_id(codec::group_id(&self.group_id))
                .with_session_timeout_ms(self.config.session_timeout.as_millis() as i32)
                .with_rebalance_timeout_ms(self.config.rebalance_timeout.as_millis() as i32)
                .with_member_id(codec::str_bytes(&member_id))
                .with_protocol_type(codec::str_bytes(PROTOCOL_TYPE))
                .with_protocols(vec![protocol]);

            tracing::debug!(%member_id, "sending JoinGroup");
            let response = conn.send_with_timeout(&request, timeout).await?.await?;

            match ErrorCode::check(response.error_code) {
                Ok(()) => break (conn, response),
                Err(ErrorCode::MEMBER_ID_REQUIRED) => {
                    // The coordinator assigned us a member id, which we must join with.
                    let member_id = response.member_id.to_string();
                    tracing::debug!(%member_id, "coordinator requires a member id");
                    self.membership.send_modify(|m| m.member_id = member_id);
                }
                Err(code) => return Err(Error::Coordination(code)),
            }
        };

        let protocol = joined.protocol_name.as_ref().map(|p| p.to_string());
        self.membership.send_modify(|m| {
            m.member_id = joined.member_id.to_string();
            m.generation_id = joined.generation_id;
            m.leader_id = joined.leader.to_string();
            m.protocol = protocol.clone();
            m.state = MemberState::AwaitingSync;
        });
        let membership = self.membership.borrow().clone();

        tracing::info!(
            member_id = %membership.member_id,
            generation = membership.generation_id,
            leader = membership.is_leader(),
            ?protocol,
            "joined group"
        );

        let assignments = if membership.is_leader() {
            self.assign(&joined.members, protocol.as_deref()).await?
        } else {
            Vec::new()
        };

        let mut request = messages::SyncGroupRequest::default()
            .with_group_id(codec::group_id(&self.group_id))
            .with_generation_id(membership.generation_id)
            .with_member_id(codec::str_bytes(&membership.member_id))
            .with_assignments(assignments);

        if conn.version::<messages::SyncGroupRequest>()? >= 5 {
            request = request
                .with_protocol_type(Some(codec::str_bytes(PROTOCOL_TYPE)))
                .with_protocol_name(protocol.as_deref().map(codec::str_bytes));
        }

        let response = conn.send_with_timeout(&request, timeout).await?.await?;
        ErrorCode::check(response.error_code).map_err(Error::Coordination)?;

        Assignment::decode(response.assignment)
    }

    // As group leader, assign partitions of all subscribed topics among the members.
    async fn assign(
        &self,
        members: &[messages::join_group_response::JoinGroupResponseMember],
        protocol: Option<&str>,
    ) -> Result<Vec<messages::sync_group_request::SyncGroupRequestAssignment>> {
        let strategy = protocol
            .and_then(AssignmentStrategy::from_protocol_name)
            .ok_or(Error::Coordination(ErrorCode::INCONSISTENT_GROUP_PROTOCOL))?;

        let mut subscriptions = BTreeMap::new();
        for member in members {
            let subscription = Subscription::decode(member.metadata.clone())?;
            subscriptions.insert(member.member_id.to_string(), subscription);
        }

        let mut partition_counts = BTreeMap::new();

        for topic in subscriptions.values().flat_map(|s| &s.topics).sorted().dedup() {
            match self.pool.partition_count(topic).await {
                Ok(count) => {
                    partition_counts.insert(topic.clone(), count);
                }
                Err(Error::Closed) => return Err(Error::Closed),
                Err(err) => {
                    tracing::warn!(%topic, error = %err, "subscribed topic cannot be assigned");
                }
            }
        }

        let assignments = assignor::assign(strategy, &subscriptions, &partition_counts);
        tracing::debug!(?assignments, "computed group assignment");

        Ok(assignments
            .into_iter()
            .map(|(member_id, assignment)| {
                messages::sync_group_request::SyncGroupRequestAssignment::default()
                    .with_member_id(codec::str_bytes(&member_id))
                    .with_assignment(assignment.encode())
            })
            .collect())
    }

    // Enter Stable with `assignment`, and publish it.
    // Returns false if nobody is listening.
    fn on_assigned(&mut self, assignment: Assignment) -> bool {
        let partitions = assignment.topic_partitions();

        self.membership.send_modify(|m| {
            m.assignment = partitions.clone();
            m.state = MemberState::Stable;
        });
        let generation_id = self.membership.borrow().generation_id;

        tracing::info!(generation = generation_id, partitions = partitions.len(), "received group assignment");
        metrics::counter!("kafka_client_rebalances", "group" => self.group_id.clone()).increment(1);

        self.events
            .send(GroupEvent::Assigned {
                generation_id,
                partitions,
            })
            .is_ok()
    }

    // Send heartbeats while Stable, returning what to do once we must leave it.
    async fn heartbeat(&self) -> Next {
        let session_timeout = self.config.session_timeout;
        let mut last_success = Instant::now();

        loop {
            tokio::time::sleep(self.config.heartbeat_interval).await;

            let result =
                tokio::time::timeout_at(last_success + session_timeout, self.send_heartbeat()).await;

            let err = match result {
                Ok(Ok(())) => {
                    last_success = Instant::now();
                    continue;
                }
                Ok(Err(err)) => err,
                Err(_elapsed) => {
                    tracing::warn!(?session_timeout, "no successful heartbeat within the session timeout");
                    return Next::Rejoin;
                }
            };

            match self.classify(err) {
                Next::Backoff(err) if last_success.elapsed() < session_timeout => {
                    tracing::warn!(error = %err, "heartbeat failed (will retry)");
                }
                Next::Backoff(_) => {
                    tracing::warn!(?session_timeout, "no successful heartbeat within the session timeout");
                    return Next::Rejoin;
                }
                next => return next,
            }
        }
    }

    async fn send_heartbeat(&self) -> Result<()> {
        let membership = self.membership.borrow().clone();
        let request = messages::HeartbeatRequest::default()
            .with_group_id(codec::group_id(&self.group_id))
            .with_generation_id(membership.generation_id)
            .with_member_id(codec::str_bytes(&membership.member_id));

        let conn = self.pool.coordinator_for(&self.group_id).await?;
        let response = conn.request(&request).await?;
        ErrorCode::check(response.error_code).map_err(Error::Coordination)
    }

    // Publish the revocation of our assignment, and wait for it to be acknowledged.
    // Returns Next::Leave if asked to leave while waiting.
    async fn revoke(&mut self, control: &mut mpsc::UnboundedReceiver<Control>) -> Option<Next> {
        let was_stable = self.state() == MemberState::Stable;
        self.set_state(MemberState::Rejoining);

        if !was_stable {
            return None;
        }
        let partitions = self.membership.borrow().assignment.clone();
        tracing::info!(partitions = partitions.len(), "revoking partitions to rejoin group");

        let (ack, acked) = oneshot::channel();
        if self
            .events
            .send(GroupEvent::Revoked {
                partitions,
                ack: RevokeAck(ack),
            })
            .is_ok()
        {
            let max_poll_interval = self.config.max_poll_interval;
            let deadline = tokio::time::sleep(max_poll_interval);
            tokio::pin!(deadline);
            let mut acked = acked;

            loop {
                tokio::select! {
                    biased;
                    control = control.recv() => match self.on_control(control) {
                        leave @ Next::Leave(_) => {
                            tracing::debug!("leaving group before revocation was acknowledged");
                            return Some(leave);
                        }
                        // A changed subscription is used by the coming rejoin.
                        _ => {}
                    },
                    _ = &mut acked => break,
                    () = &mut deadline => {
                        tracing::warn!(?max_poll_interval, "revocation was not acknowledged in time");
                        break;
                    }
                }
            }
        }
        self.membership.send_modify(|m| m.assignment.clear());
        None
    }

    // Our membership was lost: reset it, so that we join as a new member.
    fn lose(&mut self, code: ErrorCode) {
        let previous = self.membership.borrow().clone();
        tracing::warn!(%code, member_id = %previous.member_id, generation = previous.generation_id, "lost group membership");

        self.membership.send_modify(|m| {
            *m = GroupMembership::default();
        });
        if previous.state == MemberState::Stable {
            let _ = self.events.send(GroupEvent::Lost {
                partitions: previous.assignment,
            });
        }
    }

    async fn leave(&mut self, done: Option<oneshot::Sender<()>>) {
        self.leave_group().await;
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    async fn leave_group(&mut self) {
        let member_id = self.membership.borrow().member_id.clone();
        self.membership.send_modify(|m| {
            m.state = MemberState::Left;
            m.assignment.clear();
        });
        if member_id.is_empty() {
            return;
        }

        match tokio::time::timeout(self.config.request_timeout, self.send_leave(&member_id)).await {
            Ok(Ok(())) => tracing::info!(%member_id, "left group"),
            Ok(Err(err)) => tracing::warn!(%member_id, error = %err, "failed to leave group"),
            Err(_) => tracing::warn!(%member_id, "timed out leaving group"),
        }
    }

    async fn send_leave(&self, member_id: &str) -> Result<()> {
        let conn = self.pool.coordinator_for(&self.group_id).await?;

        let request = messages::LeaveGroupRequest::default().with_group_id(codec::group_id(&self.group_id));
        let request = if conn.version::<messages::LeaveGroupRequest>()? >= 3 {
            request.with_members(vec![messages::leave_group_request::MemberIdentity::default()
                .with_member_id(codec::str_bytes(member_id))])
        } else {
            request.with_member_id(codec::str_bytes(member_id))
        };

        let response = conn.request(&request).await?;
        ErrorCode::check(response.error_code).map_err(Error::Coordination)?;
        for member in &response.members {
            ErrorCode::check(member.error_code).map_err(Error::Coordination)?;
        }
        Ok(())
    }
}
