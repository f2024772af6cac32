use crate::feed::FeedClient;
use crate::lifecycle::SinkPublisher;
use crate::pipeline::{RecordReceiver, RelayStats};
use crate::record::{MetricRow, Record};
use crate::retry::{retry, Delay, RetryError, RetryPolicy};
use crate::sink::{SinkError, SinkHandle, Statement};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error("sink {endpoint} unavailable after {attempts} attempts: {last}")]
    SinkUnavailable {
        endpoint: String,
        attempts: u32,
        last: SinkError,
    },
    #[error("creating table {table} failed: {source}")]
    Schema { table: String, source: SinkError },
}

/// Drains the record queue into the sink, one row per record.
///
/// A record's feed position is advanced only after its row is written or the
/// record is deliberately dropped, so anything still buffered when the writer
/// stops is redelivered after a restart.
pub struct SinkWriter {
    table: String,
    policy: RetryPolicy,
    delay: Arc<dyn Delay>,
    feed: Arc<dyn FeedClient>,
    stats: Arc<RelayStats>,
}

enum Outcome {
    Persisted,
    Dropped,
    Cancelled,
}

impl SinkWriter {
    pub fn new(
        table: impl Into<String>,
        policy: RetryPolicy,
        delay: Arc<dyn Delay>,
        feed: Arc<dyn FeedClient>,
        stats: Arc<RelayStats>,
    ) -> Self {
        Self {
            table: table.into(),
            policy,
            delay,
            feed,
            stats,
        }
    }

    /// Publishes `sink` for the orchestrator, makes sure the table exists, then
    /// writes records until cancelled or the sink stays unreachable.
    pub async fn run(
        self,
        sink: SinkHandle,
        queue: RecordReceiver,
        publisher: SinkPublisher,
        cancel: CancellationToken,
    ) -> Result<(), WriterError> {
        let span = tracing::info_span!("sink_writer", endpoint = %sink.describe(), table = %self.table);
        publisher.publish(sink.clone());
        self.write_loop(sink, queue, cancel).instrument(span).await
    }

    async fn write_loop(
        &self,
        sink: SinkHandle,
        mut queue: RecordReceiver,
        cancel: CancellationToken,
    ) -> Result<(), WriterError> {
        let result = self.drain(&sink, &mut queue, &cancel).await;

        let left = queue.len();
        if left > 0 {
            self.stats.abandoned.fetch_add(left as u64, Ordering::Relaxed);
            tracing::warn!(
                buffered = left,
                "sink writer stopped with records still buffered; left for redelivery"
            );
        }
        result
    }

    async fn drain(
        &self,
        sink: &SinkHandle,
        queue: &mut RecordReceiver,
        cancel: &CancellationToken,
    ) -> Result<(), WriterError> {
        if !self.ensure_table(sink, cancel).await? {
            return Ok(());
        }

        loop {
            let record = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                record = queue.dequeue() => match record {
                    Some(record) => record,
                    None => {
                        tracing::info!("record queue closed; sink writer stopping");
                        return Ok(());
                    }
                },
            };

            match self.write_record(sink, &record, cancel).await? {
                Outcome::Persisted | Outcome::Dropped => {
                    self.mark_done(&record).await;
                    queue.task_done();
                }
                Outcome::Cancelled => {
                    self.stats.abandoned.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        position = %record.position,
                        key = record.key.as_deref().unwrap_or_default(),
                        "shutdown during retry; record left for redelivery"
                    );
                    return Ok(());
                }
            }
        }
    }

    async fn mark_done(&self, record: &Record) {
        if let Err(err) = self.feed.advance(&record.position).await {
            tracing::warn!(error = %err, position = %record.position, "failed to advance feed position");
        }
    }

    /// Returns `false` when cancelled before the table could be created.
    async fn ensure_table(
        &self,
        sink: &SinkHandle,
        cancel: &CancellationToken,
    ) -> Result<bool, WriterError> {
        let statement = Statement::EnsureTable {
            table: self.table.clone(),
        };
        let result = retry(
            &self.policy,
            self.delay.as_ref(),
            cancel,
            SinkError::is_connection,
            |attempt| {
                self.count_retry(attempt);
                sink.execute(&statement)
            },
        )
        .await;

        match result {
            Ok(_) => {
                tracing::info!("table ready");
                Ok(true)
            }
            Err(RetryError::Cancelled { attempts, last }) => {
                tracing::warn!(error = %last, attempts, "shutdown before table could be created");
                Ok(false)
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                self.stats.record_error(last.to_string());
                tracing::error!(error = %last, attempts, "sink unreachable while creating table");
                Err(WriterError::SinkUnavailable {
                    endpoint: sink.describe(),
                    attempts,
                    last,
                })
            }
            Err(RetryError::Fatal(source)) => {
                self.stats.record_error(source.to_string());
                tracing::error!(error = %source, "table creation rejected");
                Err(WriterError::Schema {
                    table: self.table.clone(),
                    source,
                })
            }
        }
    }

    async fn write_record(
        &self,
        sink: &SinkHandle,
        record: &Record,
        cancel: &CancellationToken,
    ) -> Result<Outcome, WriterError> {
        let key = record.key.as_deref().unwrap_or_default();
        let row = match MetricRow::from_payload(&record.payload) {
            Ok(row) => row,
            Err(err) => {
                self.stats.dropped_malformed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    error = %err,
                    position = %record.position,
                    key,
                    payload = %String::from_utf8_lossy(&record.payload),
                    "malformed record dropped"
                );
                return Ok(Outcome::Dropped);
            }
        };

        let statement = Statement::InsertMetric {
            table: self.table.clone(),
            row,
        };
        let result = retry(
            &self.policy,
            self.delay.as_ref(),
            cancel,
            SinkError::is_connection,
            |attempt| {
                self.count_retry(attempt);
                sink.execute(&statement)
            },
        )
        .await;

        match result {
            Ok(_) => {
                self.stats.persisted.fetch_add(1, Ordering::Relaxed);
                self.stats.clear_error();
                tracing::debug!(position = %record.position, key, "record persisted");
                Ok(Outcome::Persisted)
            }
            Err(RetryError::Fatal(err)) => {
                self.stats.dropped_rejected.fetch_add(1, Ordering::Relaxed);
                self.stats.record_error(err.to_string());
                tracing::error!(error = %err, position = %record.position, key, "row rejected; record dropped");
                Ok(Outcome::Dropped)
            }
            Err(RetryError::Cancelled { .. }) => Ok(Outcome::Cancelled),
            Err(RetryError::Exhausted { attempts, last }) => {
                self.stats.abandoned.fetch_add(1, Ordering::Relaxed);
                self.stats.record_error(last.to_string());
                tracing::error!(
                    error = %last,
                    attempts,
                    position = %record.position,
                    key,
                    "sink unreachable; giving up, record left for redelivery"
                );
                Err(WriterError::SinkUnavailable {
                    endpoint: sink.describe(),
                    attempts,
                    last,
                })
            }
        }
    }

    fn count_retry(&self, attempt: u32) {
        if attempt > 1 {
            self.stats.retries.fetch_add(1, Ordering::Relaxed);
        }
    }
}
