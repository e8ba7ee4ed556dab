//! The consumer façade — one subscription per evaluation id.
//!
//! `Subscription::open` wires the pieces together and spawns three tasks:
//! - the stream connection (transport + reconnect)
//! - the status poller (completion fallback)
//! - the driver, which is the single place envelopes are applied: it
//!   appends to the log, classifies for the timeline, feeds the reducer,
//!   and notifies the completion gate on a terminal event.
//!
//! Event delivery is serialized through one mpsc channel, so the reducer
//! and log are never touched from two callback contexts at once. The
//! rendering layer observes snapshots over a watch channel, headline
//! events over a lossy broadcast channel (capacity 256 — a lagging
//! observer refreshes from the log), and completion over a oneshot that
//! resolves exactly once.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::classify::{classify, Classification, Headline};
use crate::event::StreamEvent;
use crate::gate::{CompletionGate, CompletionSource};
use crate::log::{EventLog, LoggedEvent};
use crate::poll::{RestStatusSource, StatusPoller};
use crate::progress::{PipelineVariant, ProgressState, StageSequence};
use crate::stream::{ConnectionState, ConnectionStatus, StreamConfig, StreamConnection};

/// Everything needed to watch one evaluation run.
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    pub base_url: String,
    pub evaluation_id: String,
    pub variant: PipelineVariant,
    /// How often the completion fallback polls the evaluation resource.
    pub poll_interval: Duration,
    /// Stream reconnect knobs, see [`StreamConfig`].
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_retries: u32,
}

impl SubscriptionConfig {
    pub fn new(
        base_url: impl Into<String>,
        evaluation_id: impl Into<String>,
        variant: PipelineVariant,
    ) -> Self {
        let stream_defaults = StreamConfig::new("", "");
        Self {
            base_url: base_url.into(),
            evaluation_id: evaluation_id.into(),
            variant,
            poll_interval: Duration::from_secs(3),
            initial_backoff: stream_defaults.initial_backoff,
            max_backoff: stream_defaults.max_backoff,
            max_retries: stream_defaults.max_retries,
        }
    }

    fn stream_config(&self) -> StreamConfig {
        let mut config = StreamConfig::new(self.base_url.clone(), self.evaluation_id.clone());
        config.initial_backoff = self.initial_backoff;
        config.max_backoff = self.max_backoff;
        config.max_retries = self.max_retries;
        config
    }
}

/// Combined snapshot the rendering layer observes.
#[derive(Debug, Clone)]
pub struct TrackerState {
    pub connection: ConnectionState,
    pub progress: ProgressState,
    /// Arrival time of the last applied event.
    pub last_event_at: Option<DateTime<Utc>>,
}

impl TrackerState {
    fn new() -> Self {
        Self {
            connection: ConnectionState::default(),
            progress: ProgressState::new(),
            last_event_at: None,
        }
    }

    /// Display-only staleness hint: the connection looks open but nothing
    /// has arrived for longer than `quiet_period`. Never forces a
    /// disconnect — the transport's own liveness handling governs that.
    pub fn is_stale(&self, quiet_period: Duration) -> bool {
        if self.connection.status != ConnectionStatus::Open {
            return false;
        }
        match self.last_event_at {
            Some(at) => Utc::now()
                .signed_duration_since(at)
                .to_std()
                .map(|age| age > quiet_period)
                .unwrap_or(false),
            None => false,
        }
    }
}

/// A headline event as it appears inline on the timeline.
#[derive(Debug, Clone)]
pub struct TimelineEntry {
    pub local_seq: u64,
    pub headline: Headline,
    pub event: StreamEvent,
}

/// Live handle on one evaluation's progress. Dropping it (or calling
/// [`close`](Subscription::close)) stops the transport, cancels pending
/// backoff, and discards all derived state.
pub struct Subscription {
    id: String,
    evaluation_id: String,
    state_rx: watch::Receiver<TrackerState>,
    timeline_tx: broadcast::Sender<TimelineEntry>,
    log: Arc<StdMutex<EventLog>>,
    completion_rx: Option<oneshot::Receiver<CompletionSource>>,
    stop_tx: mpsc::Sender<()>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    closed: bool,
}

impl Subscription {
    /// Open a subscription and start tracking. Must be called from within
    /// a Tokio runtime.
    pub fn open(config: SubscriptionConfig) -> Self {
        let id = format!("sub-{}", Uuid::new_v4());
        info!(
            subscription = %id,
            evaluation_id = %config.evaluation_id,
            variant = ?config.variant,
            "opening evaluation subscription"
        );

        let http = Client::new();
        let (events_tx, events_rx) = mpsc::channel::<StreamEvent>(64);
        let (conn_state_tx, conn_state_rx) = watch::channel(ConnectionState::default());
        let (state_tx, state_rx) = watch::channel(TrackerState::new());
        let (timeline_tx, _) = broadcast::channel(256);
        let (gate, completion_rx) = CompletionGate::new();
        let gate = Arc::new(Mutex::new(gate));
        let log = Arc::new(StdMutex::new(EventLog::new()));
        let (stop_tx, stop_rx) = mpsc::channel::<()>(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let connection = StreamConnection::new(
            http.clone(),
            config.stream_config(),
            events_tx,
            conn_state_tx,
        );
        let eval_id = config.evaluation_id.clone();
        let conn_task = tokio::spawn(async move {
            if let Err(err) = connection.run(stop_rx).await {
                // Status watch already carries the persistent error; this
                // is the user-actionable "reload to retry" condition.
                warn!(evaluation_id = %eval_id, "event stream gave up: {err}");
            }
        });

        let poller = StatusPoller::new(
            Arc::new(RestStatusSource::new(http, config.base_url.clone())),
            config.evaluation_id.clone(),
            config.poll_interval,
        );
        let poll_task = tokio::spawn(poller.run(gate.clone(), shutdown_rx));

        let driver = Driver {
            stages: StageSequence::for_variant(config.variant),
            state_tx,
            timeline_tx: timeline_tx.clone(),
            log: log.clone(),
            gate,
            stop_tx: stop_tx.clone(),
        };
        let driver_task = tokio::spawn(driver.run(events_rx, conn_state_rx));

        Self {
            id,
            evaluation_id: config.evaluation_id,
            state_rx,
            timeline_tx,
            log,
            completion_rx: Some(completion_rx),
            stop_tx,
            shutdown_tx,
            tasks: vec![conn_task, poll_task, driver_task],
            closed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn evaluation_id(&self) -> &str {
        &self.evaluation_id
    }

    /// Current combined snapshot.
    pub fn state(&self) -> TrackerState {
        self.state_rx.borrow().clone()
    }

    /// Watch channel for snapshot changes.
    pub fn state_changes(&self) -> watch::Receiver<TrackerState> {
        self.state_rx.clone()
    }

    /// Subscribe to headline timeline entries. Lossy for slow consumers.
    pub fn timeline(&self) -> broadcast::Receiver<TimelineEntry> {
        self.timeline_tx.subscribe()
    }

    /// Full copy of the arrival-ordered event log (debug/audit view).
    pub fn log_snapshot(&self) -> Vec<LoggedEvent> {
        self.log.lock().unwrap().entries().to_vec()
    }

    /// Resolves once, when either the stream or the poller reports the
    /// pipeline finished. Subsequent calls return `None`.
    pub async fn wait_completed(&mut self) -> Option<CompletionSource> {
        match self.completion_rx.take() {
            Some(rx) => rx.await.ok(),
            None => None,
        }
    }

    /// Stop the transport, cancel pending backoff, and drop all tasks.
    /// Idempotent; also invoked on drop.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.stop_tx.try_send(());
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!(subscription = %self.id, "subscription closed");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// The single consumer of the envelope stream.
struct Driver {
    stages: StageSequence,
    state_tx: watch::Sender<TrackerState>,
    timeline_tx: broadcast::Sender<TimelineEntry>,
    log: Arc<StdMutex<EventLog>>,
    gate: Arc<Mutex<CompletionGate>>,
    stop_tx: mpsc::Sender<()>,
}

impl Driver {
    async fn run(
        self,
        mut events_rx: mpsc::Receiver<StreamEvent>,
        mut conn_rx: watch::Receiver<ConnectionState>,
    ) {
        let mut state = TrackerState::new();
        state.connection = conn_rx.borrow().clone();
        let _ = self.state_tx.send(state.clone());
        let mut conn_alive = true;

        loop {
            tokio::select! {
                changed = conn_rx.changed(), if conn_alive => match changed {
                    Ok(()) => {
                        state.connection = conn_rx.borrow().clone();
                        let _ = self.state_tx.send(state.clone());
                    }
                    Err(_) => conn_alive = false,
                },
                maybe = events_rx.recv() => match maybe {
                    Some(event) => self.handle_event(event, &mut state).await,
                    None => break,
                },
            }
        }
    }

    async fn handle_event(&self, event: StreamEvent, state: &mut TrackerState) {
        let local_seq = self.log.lock().unwrap().append(event.clone());

        if let Classification::Headline(headline) = classify(&event) {
            let _ = self.timeline_tx.send(TimelineEntry {
                local_seq,
                headline,
                event: event.clone(),
            });
        }

        let was_terminal = state.progress.is_terminal();
        state.progress.apply(&event, &self.stages);
        state.last_event_at = Some(Utc::now());
        let _ = self.state_tx.send(state.clone());

        if !was_terminal && state.progress.is_terminal() {
            if self.gate.lock().await.notify_stream_terminal() {
                info!(
                    failed = state.progress.is_failed(),
                    "stream reported pipeline terminal"
                );
            }
            // Terminal means no more reconnects.
            let _ = self.stop_tx.try_send(());
        }
    }
}
