use crate::record::Record;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Creates the bounded record queue shared by the feed reader and the sink writer.
///
/// Producers suspend once `capacity` records are buffered; nothing is ever dropped
/// to make room.
pub fn record_queue(capacity: usize, stats: Arc<RelayStats>) -> (RecordSender, RecordReceiver) {
    let (tx, rx) = mpsc::channel::<Record>(capacity.max(1));
    (
        RecordSender {
            tx,
            stats: stats.clone(),
        },
        RecordReceiver { rx, stats },
    )
}

#[derive(Debug, thiserror::Error)]
#[error("record queue is closed")]
pub struct QueueClosed;

#[derive(Clone)]
pub struct RecordSender {
    tx: mpsc::Sender<Record>,
    stats: Arc<RelayStats>,
}

impl RecordSender {
    /// Waits for a free slot. Cancel-safe: dropping the future gives up the wait
    /// and the caller keeps whatever record it was about to enqueue.
    pub async fn reserve(&self) -> Result<EnqueuePermit<'_>, QueueClosed> {
        let permit = self.tx.reserve().await.map_err(|_| QueueClosed)?;
        Ok(EnqueuePermit {
            permit,
            stats: &self.stats,
        })
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Records currently buffered (including slots reserved but not yet filled).
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

pub struct EnqueuePermit<'a> {
    permit: mpsc::Permit<'a, Record>,
    stats: &'a RelayStats,
}

impl EnqueuePermit<'_> {
    pub fn enqueue(self, record: Record) {
        let depth = self.stats.queue_depth.fetch_add(1, Ordering::Relaxed) + 1;
        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(queue_depth = depth, position = %record.position, "queued record");
        self.permit.send(record);
    }
}

pub struct RecordReceiver {
    rx: mpsc::Receiver<Record>,
    stats: Arc<RelayStats>,
}

impl RecordReceiver {
    /// Waits for the next record in FIFO order. Cancel-safe. `None` once every
    /// sender is gone and the buffer is drained.
    pub async fn dequeue(&mut self) -> Option<Record> {
        let record = self.rx.recv().await?;
        self.stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
        Some(record)
    }

    /// Marks a dequeued record as accounted for (persisted or deliberately dropped).
    pub fn task_done(&self) {
        self.stats.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }
}

#[derive(Debug, Default)]
pub struct RelayStats {
    pub queue_depth: AtomicU64,
    pub consumed: AtomicU64,
    pub enqueued: AtomicU64,
    pub completed: AtomicU64,
    pub persisted: AtomicU64,
    pub dropped_malformed: AtomicU64,
    pub dropped_rejected: AtomicU64,
    pub abandoned: AtomicU64,
    pub retries: AtomicU64,
    pub last_error: Mutex<Option<String>>,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    /// Enqueued records that were neither persisted nor explicitly dropped.
    pub fn unfinished(&self) -> u64 {
        self.enqueued
            .load(Ordering::Relaxed)
            .saturating_sub(self.completed.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            consumed: self.consumed.load(Ordering::Relaxed),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            dropped_malformed: self.dropped_malformed.load(Ordering::Relaxed),
            dropped_rejected: self.dropped_rejected.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            buffered: self.queue_depth.load(Ordering::Relaxed),
            unfinished: self.unfinished(),
            last_error: self.last_error.lock().ok().and_then(|guard| guard.clone()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub consumed: u64,
    pub enqueued: u64,
    pub persisted: u64,
    pub dropped_malformed: u64,
    pub dropped_rejected: u64,
    pub abandoned: u64,
    pub retries: u64,
    pub buffered: u64,
    pub unfinished: u64,
    pub last_error: Option<String>,
}
