use crate::pipeline::{RecordSender, RelayStats};
use crate::record::{Position, Record};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, thiserror::Error)]
pub enum FeedError {
    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("feed poll error: {0}")]
    Poll(String),
    #[error("storing position {position} failed: {reason}")]
    Advance { position: Position, reason: String },
}

#[derive(Debug)]
pub enum FeedPoll {
    Record(Record),
    Empty,
    Error(FeedError),
}

/// The consumer side of the message feed.
#[async_trait]
pub trait FeedClient: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<(), FeedError>;

    /// Waits at most `timeout` for the next record. Cancel-safe: an undelivered
    /// record stays with the client.
    async fn poll(&self, timeout: Duration) -> FeedPoll;

    /// Marks everything up to and including `position` as done. Only called
    /// for records that were persisted or deliberately dropped.
    async fn advance(&self, position: &Position) -> Result<(), FeedError>;

    /// Leaves the consumer group and commits the consumed positions. Called once.
    async fn close(&self);
}

pub struct FeedReader {
    feed: Arc<dyn FeedClient>,
    topic: String,
    poll_timeout: Duration,
    stats: Arc<RelayStats>,
}

impl FeedReader {
    pub fn new(
        feed: Arc<dyn FeedClient>,
        topic: impl Into<String>,
        poll_timeout: Duration,
        stats: Arc<RelayStats>,
    ) -> Self {
        Self {
            feed,
            topic: topic.into(),
            poll_timeout,
            stats,
        }
    }

    /// Pulls records into `queue` until `cancel` fires.
    ///
    /// The reader never advances the feed position; the sink writer does that
    /// once a record is written or dropped.
    pub async fn run(self, queue: RecordSender, cancel: CancellationToken) -> Result<()> {
        self.feed
            .subscribe(&self.topic)
            .await
            .with_context(|| format!("subscribing to {}", self.topic))?;
        tracing::info!(topic = %self.topic, "subscribed to metrics feed");

        loop {
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                polled = self.feed.poll(self.poll_timeout) => polled,
            };

            let record = match polled {
                FeedPoll::Record(record) => record,
                FeedPoll::Empty => {
                    // group assignment can take several polls before records flow
                    tracing::info!(topic = %self.topic, "waiting for message or event/error in poll()");
                    continue;
                }
                FeedPoll::Error(err) => {
                    tracing::error!(error = %err, topic = %self.topic, "feed reported an error");
                    continue;
                }
            };
            self.stats.consumed.fetch_add(1, Ordering::Relaxed);

            if queue.len() >= queue.capacity() {
                tracing::debug!(capacity = queue.capacity(), position = %record.position, "record queue full; waiting for the writer");
            }
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::warn!(
                        position = %record.position,
                        key = record.key.as_deref().unwrap_or_default(),
                        "shutdown while waiting for queue space; record left for redelivery"
                    );
                    break;
                }
                permit = queue.reserve() => permit.context("record queue closed")?,
            };
            let position = record.position.clone();
            let key = record.key.clone();
            permit.enqueue(record);
            tracing::info!(key = key.as_deref().unwrap_or_default(), position = %position, "record consumed");
        }

        tracing::info!(topic = %self.topic, "feed reader stopped");
        Ok(())
    }
}
