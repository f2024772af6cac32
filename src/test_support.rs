use crate::feed::{FeedClient, FeedError, FeedPoll};
use crate::lifecycle::SignalSource;
use crate::record::{MetricRow, Position, Record};
use crate::retry::Delay;
use crate::sink::{SinkConnection, SinkError, Statement};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

pub const TOPIC: &str = "metrics";

pub fn record(offset: u64, payload: &[u8]) -> Record {
    Record {
        payload: Bytes::copy_from_slice(payload),
        key: None,
        position: Position {
            topic: TOPIC.to_string(),
            partition: 0,
            offset: offset as i64,
        },
    }
}

pub fn metric_payload(page_url: &str, http_code: i64) -> Vec<u8> {
    serde_json::json!({
        "ts": "2020-09-03T07:25:26Z",
        "page_url": page_url,
        "http_code": http_code,
        "response_time": 612_345,
    })
    .to_string()
    .into_bytes()
}

/// Polls `condition` until it holds, failing the test after five seconds.
pub async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

/// Feed that replays a script of poll results, then reports empty polls.
#[derive(Default)]
pub struct ScriptedFeed {
    script: Mutex<VecDeque<FeedPoll>>,
    subscribe_error: Mutex<Option<String>>,
    subscriptions: Mutex<Vec<String>>,
    advanced: Mutex<Vec<Position>>,
    closes: AtomicUsize,
}

impl ScriptedFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_record(&self, offset: i64, payload: Vec<u8>) {
        let key = serde_json::from_slice::<serde_json::Value>(&payload)
            .ok()
            .and_then(|value| value.get("page_url")?.as_str().map(str::to_string));
        self.push(FeedPoll::Record(Record {
            payload: Bytes::from(payload),
            key,
            position: Position {
                topic: TOPIC.to_string(),
                partition: 0,
                offset,
            },
        }));
    }

    pub fn push_empty(&self) {
        self.push(FeedPoll::Empty);
    }

    pub fn push_error(&self, reason: &str) {
        self.push(FeedPoll::Error(FeedError::Poll(reason.to_string())));
    }

    pub fn fail_subscribe(&self, reason: &str) {
        *self.subscribe_error.lock().unwrap() = Some(reason.to_string());
    }

    pub fn advanced(&self) -> Vec<Position> {
        self.advanced.lock().unwrap().clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn push(&self, poll: FeedPoll) {
        self.script.lock().unwrap().push_back(poll);
    }
}

#[async_trait]
impl FeedClient for ScriptedFeed {
    async fn subscribe(&self, topic: &str) -> Result<(), FeedError> {
        if let Some(reason) = self.subscribe_error.lock().unwrap().clone() {
            return Err(FeedError::Subscribe {
                topic: topic.to_string(),
                reason,
            });
        }
        self.subscriptions.lock().unwrap().push(topic.to_string());
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> FeedPoll {
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(poll) => poll,
            None => {
                tokio::time::sleep(timeout).await;
                FeedPoll::Empty
            }
        }
    }

    async fn advance(&self, position: &Position) -> Result<(), FeedError> {
        self.advanced.lock().unwrap().push(position.clone());
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Sink that keeps every statement it accepted and fails on request.
pub struct RecordingSink {
    statements: Mutex<Vec<Statement>>,
    insert_attempts: AtomicUsize,
    insert_failures: Mutex<VecDeque<SinkError>>,
    insert_failure_forever: Mutex<Option<SinkError>>,
    schema_failure: Mutex<Option<SinkError>>,
    paused: watch::Sender<bool>,
    closed: AtomicBool,
    closes: AtomicUsize,
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self {
            statements: Mutex::default(),
            insert_attempts: AtomicUsize::new(0),
            insert_failures: Mutex::default(),
            insert_failure_forever: Mutex::default(),
            schema_failure: Mutex::default(),
            paused: watch::Sender::new(false),
            closed: AtomicBool::new(false),
            closes: AtomicUsize::new(0),
        }
    }
}

impl RecordingSink {
    pub fn fail_inserts(&self, failures: Vec<SinkError>) {
        self.insert_failures.lock().unwrap().extend(failures);
    }

    pub fn fail_all_inserts(&self, failure: SinkError) {
        *self.insert_failure_forever.lock().unwrap() = Some(failure);
    }

    /// The next table creation fails once with `failure`.
    pub fn fail_schema(&self, failure: SinkError) {
        *self.schema_failure.lock().unwrap() = Some(failure);
    }

    /// Holds inserts until [`RecordingSink::resume`].
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.statements
            .lock()
            .unwrap()
            .iter()
            .map(Statement::kind)
            .collect()
    }

    pub fn rows(&self) -> Vec<MetricRow> {
        self.statements
            .lock()
            .unwrap()
            .iter()
            .filter_map(|statement| match statement {
                Statement::InsertMetric { row, .. } => Some(row.clone()),
                Statement::EnsureTable { .. } => None,
            })
            .collect()
    }

    pub fn insert_attempts(&self) -> usize {
        self.insert_attempts.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SinkConnection for RecordingSink {
    async fn execute(&self, statement: &Statement) -> Result<u64, SinkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SinkError::Connection("connection is closed".to_string()));
        }
        match statement {
            Statement::EnsureTable { .. } => {
                if let Some(failure) = self.schema_failure.lock().unwrap().take() {
                    return Err(failure);
                }
                self.statements.lock().unwrap().push(statement.clone());
                Ok(0)
            }
            Statement::InsertMetric { .. } => {
                let mut paused = self.paused.subscribe();
                let _ = paused.wait_for(|paused| !*paused).await;

                self.insert_attempts.fetch_add(1, Ordering::SeqCst);
                if let Some(failure) = self.insert_failure_forever.lock().unwrap().clone() {
                    return Err(failure);
                }
                if let Some(failure) = self.insert_failures.lock().unwrap().pop_front() {
                    return Err(failure);
                }
                self.statements.lock().unwrap().push(statement.clone());
                Ok(1)
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn describe(&self) -> String {
        "recording-sink".to_string()
    }
}

/// Zero-length delay that remembers what it was asked to wait.
#[derive(Default)]
pub struct RecordingDelay {
    waits: Mutex<Vec<Duration>>,
}

impl RecordingDelay {
    pub fn recorded(&self) -> Vec<Duration> {
        self.waits.lock().unwrap().clone()
    }
}

#[async_trait]
impl Delay for RecordingDelay {
    async fn sleep(&self, duration: Duration) {
        self.waits.lock().unwrap().push(duration);
        tokio::task::yield_now().await;
    }
}

/// Signal source driven by the test.
pub struct ChannelSignals(mpsc::UnboundedReceiver<&'static str>);

pub fn signal_channel() -> (mpsc::UnboundedSender<&'static str>, ChannelSignals) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, ChannelSignals(rx))
}

#[async_trait]
impl SignalSource for ChannelSignals {
    async fn recv(&mut self) -> Option<&'static str> {
        self.0.recv().await
    }
}
