use crate::feed::FeedClient;
use crate::pipeline::{RelayStats, StatsSnapshot};
use crate::sink::SinkHandle;
use async_trait::async_trait;
use futures::FutureExt;
use std::fmt::{self, Display};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Running,
    Draining,
    Stopped,
}

/// Creates the single-use handoff through which the sink writer lends its
/// connection to the orchestrator.
pub fn sink_slot() -> (SinkPublisher, SinkSlot) {
    let (tx, rx) = oneshot::channel();
    (SinkPublisher(tx), SinkSlot(rx))
}

pub struct SinkPublisher(oneshot::Sender<SinkHandle>);

impl SinkPublisher {
    pub fn publish(self, handle: SinkHandle) {
        if self.0.send(handle).is_err() {
            tracing::debug!("orchestrator gone before the sink connection was published");
        }
    }
}

pub struct SinkSlot(oneshot::Receiver<SinkHandle>);

impl SinkSlot {
    /// Waits for the published handle. `None` if the publisher was dropped
    /// without publishing.
    pub async fn take(self) -> Option<SinkHandle> {
        self.0.await.ok()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Trigger {
    Signal(&'static str),
    Requested(String),
    TaskExited {
        task: &'static str,
        error: Option<String>,
    },
}

impl Trigger {
    /// A supervised task ending on its own, with or without an error, is fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Trigger::TaskExited { .. })
    }
}

impl Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Signal(name) => write!(f, "received {name}"),
            Trigger::Requested(reason) => write!(f, "shutdown requested: {reason}"),
            Trigger::TaskExited { task, error: Some(error) } => write!(f, "{task} failed: {error}"),
            Trigger::TaskExited { task, error: None } => write!(f, "{task} exited unexpectedly"),
        }
    }
}

/// Cloneable way to ask for shutdown. Never blocks; requests after the first
/// are ignored.
#[cfg(test)]
#[derive(Clone)]
pub struct ShutdownHandle {
    triggers: mpsc::UnboundedSender<Trigger>,
    state: watch::Receiver<PipelineState>,
}

#[cfg(test)]
impl ShutdownHandle {
    pub fn shutdown(&self, reason: impl Into<String>) {
        let _ = self.triggers.send(Trigger::Requested(reason.into()));
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }
}

#[async_trait]
pub trait SignalSource: Send {
    /// Next termination signal, or `None` once the source can produce no more.
    async fn recv(&mut self) -> Option<&'static str>;
}

/// SIGHUP, SIGTERM and SIGINT.
pub struct TerminationSignals {
    hangup: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    interrupt: tokio::signal::unix::Signal,
}

impl TerminationSignals {
    pub fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            hangup: signal(SignalKind::hangup())?,
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
        })
    }
}

#[async_trait]
impl SignalSource for TerminationSignals {
    async fn recv(&mut self) -> Option<&'static str> {
        tokio::select! {
            received = self.hangup.recv() => received.map(|_| "SIGHUP"),
            received = self.terminate.recv() => received.map(|_| "SIGTERM"),
            received = self.interrupt.recv() => received.map(|_| "SIGINT"),
        }
    }
}

#[derive(Debug)]
pub struct ShutdownReport {
    pub cause: Trigger,
    pub stats: StatsSnapshot,
    /// Tasks that ignored cancellation past the grace period.
    pub aborted: Vec<&'static str>,
}

impl ShutdownReport {
    pub fn is_fatal(&self) -> bool {
        self.cause.is_fatal()
    }
}

/// Supervises the pipeline tasks and runs the one shutdown sequence.
pub struct Orchestrator {
    state: watch::Sender<PipelineState>,
    triggers_tx: mpsc::UnboundedSender<Trigger>,
    triggers: mpsc::UnboundedReceiver<Trigger>,
    cancel: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    feed: Arc<dyn FeedClient>,
    sink: SinkSlot,
    stats: Arc<RelayStats>,
    grace: Duration,
}

impl Orchestrator {
    pub fn new(
        feed: Arc<dyn FeedClient>,
        sink: SinkSlot,
        stats: Arc<RelayStats>,
        grace: Duration,
    ) -> Self {
        let (state, _) = watch::channel(PipelineState::Running);
        let (triggers_tx, triggers) = mpsc::unbounded_channel();
        Self {
            state,
            triggers_tx,
            triggers,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
            feed,
            sink,
            stats,
            grace,
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[cfg(test)]
    pub fn handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            triggers: self.triggers_tx.clone(),
            state: self.state.subscribe(),
        }
    }

    /// Spawns a supervised task. Its end, for whatever reason, is reported as
    /// a shutdown trigger.
    pub fn spawn<F, E>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let triggers = self.triggers_tx.clone();
        let handle = tokio::spawn(async move {
            let error = match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(format!("{err:#}")),
                Err(_) => Some("task panicked".to_string()),
            };
            let _ = triggers.send(Trigger::TaskExited { task: name, error });
        });
        self.tasks.push((name, handle));
    }

    /// Waits for the first trigger, tears the pipeline down and reports why.
    pub async fn run<S: SignalSource>(self, mut signals: S) -> ShutdownReport {
        let Orchestrator {
            state,
            triggers_tx,
            mut triggers,
            cancel,
            tasks,
            feed,
            sink,
            stats,
            grace,
        } = self;
        // keeps the channel open so `recv` only ends with a trigger
        let _triggers_tx = triggers_tx;

        let mut signals_open = true;
        let cause = loop {
            tokio::select! {
                trigger = triggers.recv() => match trigger {
                    Some(trigger) => break trigger,
                    None => break Trigger::Requested("trigger channel closed".to_string()),
                },
                signal = signals.recv(), if signals_open => match signal {
                    Some(name) => break Trigger::Signal(name),
                    None => signals_open = false,
                },
            }
        };

        state.send_replace(PipelineState::Draining);
        if cause.is_fatal() {
            tracing::error!(cause = %cause, "pipeline failed; shutting down");
        } else {
            tracing::info!(cause = %cause, "shutting down");
        }

        let teardown = teardown(feed, sink, cancel, tasks, grace);
        tokio::pin!(teardown);
        let aborted = loop {
            tokio::select! {
                biased;
                aborted = &mut teardown => break aborted,
                Some(late) = triggers.recv() => match &late {
                    Trigger::TaskExited { task, error: Some(error) } => {
                        tracing::warn!(task, error = %error, "task failed during shutdown")
                    }
                    _ => tracing::debug!(trigger = %late, "already shutting down; ignored"),
                },
                signal = signals.recv(), if signals_open => match signal {
                    Some(name) => tracing::info!(signal = name, "already shutting down; ignored"),
                    None => signals_open = false,
                },
            }
        };

        state.send_replace(PipelineState::Stopped);
        let report = ShutdownReport {
            cause,
            stats: stats.snapshot(),
            aborted,
        };
        log_summary(&report);
        report
    }
}

async fn teardown(
    feed: Arc<dyn FeedClient>,
    sink: SinkSlot,
    cancel: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    grace: Duration,
) -> Vec<&'static str> {
    feed.close().await;

    // blocks until an in-flight statement finishes
    match sink.take().await {
        Some(handle) => {
            handle.close().await;
            tracing::info!(endpoint = %handle.describe(), "sink connection closed");
        }
        None => tracing::info!("sink writer ended without publishing a connection; nothing to close"),
    }

    cancel.cancel();

    let mut aborted = Vec::new();
    for (name, mut handle) in tasks {
        match tokio::time::timeout(grace, &mut handle).await {
            Ok(Ok(())) => tracing::debug!(task = name, "task stopped"),
            Ok(Err(err)) => tracing::warn!(task = name, error = %err, "task join failed"),
            Err(_) => {
                tracing::warn!(
                    task = name,
                    grace_ms = grace.as_millis() as u64,
                    "task ignored cancellation; aborting"
                );
                handle.abort();
                let _ = handle.await;
                aborted.push(name);
            }
        }
    }
    aborted
}

fn log_summary(report: &ShutdownReport) {
    let stats = &report.stats;
    tracing::info!(
        cause = %report.cause,
        consumed = stats.consumed,
        persisted = stats.persisted,
        dropped_malformed = stats.dropped_malformed,
        dropped_rejected = stats.dropped_rejected,
        abandoned = stats.abandoned,
        buffered = stats.buffered,
        unfinished = stats.unfinished,
        retries = stats.retries,
        last_error = stats.last_error.as_deref().unwrap_or_default(),
        aborted = ?report.aborted,
        "pipeline stopped"
    );
}
