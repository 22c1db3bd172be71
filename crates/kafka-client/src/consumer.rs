//! Consuming records, from partitions assigned by a consumer group or by the application.

use crate::group::{self, GroupCoordinator, GroupEvent, Generation};
use crate::{BrokerPool, Config, ConsumerRecord, Error, Fetcher, Result, TopicPartition};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Consumer delivers records of its assigned partitions.
///
/// Partitions are either assigned by the group coordinator, following
/// `subscribe`, or assigned directly with `assign`. Subscribed consumers
/// resume from the group's committed offsets and, with `enable_auto_commit`,
/// commit their positions every `auto_commit_interval` and before
/// partitions are revoked.
pub struct Consumer {
    pool: BrokerPool,
    config: Arc<Config>,
    fetcher: Fetcher,
    group: Option<GroupCoordinator>,
    // Whether partitions were assigned by the application.
    manual: bool,
    // Offsets last committed by this consumer, which aren't committed again.
    committed: BTreeMap<TopicPartition, i64>,
    // Partitions assigned by the group whose committed offsets aren't yet
    // known, and when fetching them is next attempted.
    awaiting: BTreeSet<TopicPartition>,
    awaiting_retry_at: Instant,
    next_auto_commit: Instant,
    failure: Option<Error>,
}

impl Consumer {
    pub fn new(pool: BrokerPool) -> Result<Self> {
        let config = Arc::new(pool.config().clone());
        config.validate()?;

        Ok(Self {
            fetcher: Fetcher::new(pool.clone()),
            next_auto_commit: Instant::now() + config.auto_commit_interval,
            pool,
            config,
            group: None,
            manual: false,
            committed: BTreeMap::new(),
            awaiting: BTreeSet::new(),
            awaiting_retry_at: Instant::now(),
            failure: None,
        })
    }

    /// Subscribe to `topics` as a member of the configured consumer group.
    /// A consumer which is already subscribed rejoins with the new topics.
    pub fn subscribe<I, S>(&mut self, topics: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let topics: BTreeSet<String> = topics.into_iter().map(Into::into).collect();
        let Some(group_id) = self.config.group_id.clone() else {
            return Err(Error::Config("subscribe requires a group_id".to_string()));
        };
        if self.manual {
            return Err(Error::Config(
                "cannot subscribe a consumer with manually assigned partitions".to_string(),
            ));
        }

        match &self.group {
            Some(group) => group.subscribe(topics),
            None => {
                tracing::info!(group = %group_id, ?topics, "subscribing");
                self.group = Some(GroupCoordinator::start(self.pool.clone(), group_id, topics));
            }
        }
        Ok(())
    }

    /// Assign `partitions` directly, without group membership. Partitions
    /// resume from the configured group's committed offsets, if there's a
    /// group_id, or else start at the offset of the reset policy.
    pub async fn assign(&mut self, partitions: impl IntoIterator<Item = TopicPartition>) -> Result<()> {
        if self.group.is_some() {
            return Err(Error::Config(
                "cannot assign partitions of a subscribed consumer".to_string(),
            ));
        }
        self.manual = true;

        let partitions: BTreeSet<TopicPartition> = partitions.into_iter().collect();
        let added: BTreeSet<TopicPartition> = partitions
            .difference(&self.fetcher.assignment())
            .cloned()
            .collect();

        self.fetcher.assign(partitions.iter().cloned());
        self.committed.retain(|tp, _| partitions.contains(tp));

        if let Some(group_id) = &self.config.group_id {
            let committed = group::fetch(&self.pool, group_id, &added).await?;
            self.resume(committed);
        }
        Ok(())
    }

    pub fn assignment(&self) -> BTreeSet<TopicPartition> {
        let mut assignment = self.fetcher.assignment();
        assignment.extend(self.awaiting.iter().cloned());
        assignment
    }

    /// Set the offset of the next record returned from `tp`.
    /// Returns false if `tp` isn't assigned.
    pub fn seek(&mut self, tp: &TopicPartition, offset: i64) -> bool {
        self.fetcher.seek(tp, offset)
    }

    /// Offset of the next record which poll will return from `tp`.
    pub fn position(&self, tp: &TopicPartition) -> Option<i64> {
        self.fetcher.position(tp)
    }

    /// Return available records, waiting up to `max_wait` for some to arrive.
    /// Rebalances of a subscribed consumer are handled within poll.
    /// An empty result means no records arrived in time.
    pub async fn poll(&mut self, max_wait: Duration) -> Result<Vec<ConsumerRecord>> {
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        let deadline = Instant::now() + max_wait;

        loop {
            self.maybe_auto_commit().await;
            if let Err(err) = self.resume_awaiting().await {
                self.failure = Some(err.clone());
                return Err(err);
            }
            let now = Instant::now();
            let mut remaining = deadline.saturating_duration_since(now);
            if !self.awaiting.is_empty() {
                remaining = remaining.min(self.awaiting_retry_at.saturating_duration_since(now));
            }

            let Some(group) = self.group.as_mut() else {
                return self.fetcher.poll(remaining).await;
            };

            let polled = tokio::select! {
                biased;

                event = group.next_event() => Err(event),
                polled = self.fetcher.poll(remaining) => Ok(polled),
            };

            match polled {
                Err(event) => {
                    if let Err(err) = self.on_group_event(event).await {
                        self.failure = Some(err.clone());
                        return Err(err);
                    }
                }
                // Keep waiting for the committed offsets of awaited partitions.
                Ok(Ok(records))
                    if records.is_empty() && !self.awaiting.is_empty() && Instant::now() < deadline => {}
                Ok(polled) => return polled,
            }
        }
    }

    /// Commit the positions of all assigned partitions.
    pub async fn commit(&mut self) -> Result<()> {
        let positions = self.fetcher.positions();
        self.commit_offsets(&positions).await
    }

    /// Commit `offsets`, each of which is the offset of the next record to consume.
    pub async fn commit_offsets(&mut self, offsets: &BTreeMap<TopicPartition, i64>) -> Result<()> {
        match (&self.group, &self.config.group_id) {
            (Some(group), _) => group.commit_offsets(offsets).await?,
            (None, Some(group_id)) => {
                group::commit(&self.pool, group_id, &Generation::none(), offsets).await?
            }
            (None, None) => {
                return Err(Error::Config("committing offsets requires a group_id".to_string()))
            }
        }
        self.committed
            .extend(offsets.iter().map(|(tp, offset)| (tp.clone(), *offset)));
        Ok(())
    }

    /// Close the Consumer, committing its positions if auto-commit is
    /// enabled and leaving its group.
    pub async fn close(mut self) -> Result<()> {
        let mut result = Ok(());
        if self.auto_commits() && self.failure.is_none() {
            result = self.commit_changed().await;
        }
        if let Some(mut group) = self.group.take() {
            group.leave().await;
        }
        result
    }

    fn auto_commits(&self) -> bool {
        self.config.enable_auto_commit && self.config.group_id.is_some()
    }

    async fn maybe_auto_commit(&mut self) {
        let now = Instant::now();
        if !self.auto_commits() || now < self.next_auto_commit {
            return;
        }
        self.next_auto_commit = now + self.config.auto_commit_interval;

        if let Err(err) = self.commit_changed().await {
            tracing::warn!(error = %err, "failed to auto-commit offsets");
        }
    }

    // Commit positions which have changed since they were last committed.
    async fn commit_changed(&mut self) -> Result<()> {
        let changed: BTreeMap<TopicPartition, i64> = self
            .fetcher
            .positions()
            .into_iter()
            .filter(|(tp, offset)| self.committed.get(tp) != Some(offset))
            .collect();

        if changed.is_empty() {
            return Ok(());
        }
        self.commit_offsets(&changed).await
    }

    async fn on_group_event(&mut self, event: Option<GroupEvent>) -> Result<()> {
        let Some(event) = event else {
            return Err(Error::Closed);
        };
        let Some(group) = &self.group else {
            return Ok(());
        };
        let group_id = group.group_id().to_string();

        match event {
            GroupEvent::Assigned {
                generation_id,
                partitions,
            } => {
                tracing::info!(group = %group_id, generation_id, assigned = partitions.len(), "partitions assigned");
                metrics::counter!("kafka_client_rebalances", "group" => group_id).increment(1);

                // Partitions are fetched once their committed offsets are known.
                self.fetcher.assign(Vec::<TopicPartition>::new());
                self.committed.clear();
                self.awaiting = partitions;
                self.awaiting_retry_at = Instant::now();
                self.resume_awaiting().await?;
            }
            GroupEvent::Revoked { partitions, ack } => {
                tracing::info!(group = %group_id, revoked = partitions.len(), "partitions revoked");

                if self.auto_commits() {
                    if let Err(err) = self.commit_changed().await {
                        tracing::warn!(group = %group_id, error = %err, "failed to commit offsets of revoked partitions");
                    }
                }
                self.fetcher
                    .assign(self.fetcher.assignment().difference(&partitions).cloned().collect::<Vec<_>>());
                self.awaiting.retain(|tp| !partitions.contains(tp));
                ack.ack();
            }
            GroupEvent::Lost { partitions } => {
                tracing::warn!(group = %group_id, lost = partitions.len(), "partitions lost");
                self.fetcher
                    .assign(self.fetcher.assignment().difference(&partitions).cloned().collect::<Vec<_>>());
                self.committed.retain(|tp, _| !partitions.contains(tp));
                self.awaiting.retain(|tp| !partitions.contains(tp));
            }
            GroupEvent::Failed(err) => {
                tracing::error!(group = %group_id, error = %err, "group membership failed");
                return Err(err);
            }
        }
        Ok(())
    }

    // Fetch committed offsets of partitions assigned by the group, and start
    // fetching them. Retryable failures are retried on a later poll, rather
    // than falling back to the reset policy.
    async fn resume_awaiting(&mut self) -> Result<()> {
        if self.awaiting.is_empty() || Instant::now() < self.awaiting_retry_at {
            return Ok(());
        }
        let Some(group) = &self.group else {
            return Ok(());
        };

        match group.fetch_committed(&self.awaiting).await {
            Ok(committed) => {
                let mut assignment = self.fetcher.assignment();
                assignment.append(&mut self.awaiting);
                self.fetcher.assign(assignment);
                self.resume(committed);
                Ok(())
            }
            Err(err) if err.is_retryable() => {
                tracing::warn!(
                    group = %group.group_id(),
                    partitions = self.awaiting.len(),
                    error = %err,
                    "failed to fetch committed offsets of assigned partitions (will retry)"
                );
                self.awaiting_retry_at = Instant::now() + self.config.retry_backoff_max;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    // Seek partitions to their committed offsets. Partitions without
    // one are positioned by the reset policy.
    fn resume(&mut self, committed: BTreeMap<TopicPartition, Option<i64>>) {
        for (tp, offset) in committed {
            if let Some(offset) = offset {
                tracing::debug!(%tp, offset, "resuming from committed offset");
                self.fetcher.seek(&tp, offset);
                self.committed.insert(tp, offset);
            }
        }
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("group_id", &self.config.group_id)
            .field("assignment", &self.fetcher.assignment())
            .finish()
    }
}
