//! SSE connection to one evaluation's push channel.
//!
//! Owns the transport: connects, reads envelopes, and reconnects with
//! exponential backoff on transport failure. A clean server-initiated
//! close ends the stream without retry. The connection layer does not
//! deduplicate — reconnects may replay events, and the reducer and
//! completion gate are built to tolerate that.
//!
//! Parsed envelopes go out over an mpsc channel (one serialized consumer,
//! so arrival order is preserved); connectivity changes go out over a
//! watch channel. A message on the stop channel halts the read loop and
//! any pending backoff sleep synchronously.

use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use reqwest_eventsource::{Error as SseError, Event as SseEvent, EventSource};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{TrackerError, TrackerResult};
use crate::event::StreamEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Open,
    Closed,
    Errored,
}

/// Connectivity snapshot surfaced to the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// Cumulative reconnect attempts for this subscription.
    pub retry_count: u32,
    /// Last transport error, as a display string. Non-fatal unless the
    /// retry budget runs out.
    pub last_error: Option<String>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Connecting,
            retry_count: 0,
            last_error: None,
        }
    }
}

/// Transport parameters for one evaluation's event stream.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub base_url: String,
    pub evaluation_id: String,
    /// First reconnect delay. Doubles per consecutive failure.
    pub initial_backoff: Duration,
    /// Reconnect delay cap.
    pub max_backoff: Duration,
    /// Consecutive failed attempts before giving up. `u32::MAX` retries
    /// for as long as the subscription lives.
    pub max_retries: u32,
}

impl StreamConfig {
    pub fn new(base_url: impl Into<String>, evaluation_id: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            evaluation_id: evaluation_id.into(),
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(5),
            max_retries: 20,
        }
    }

    fn events_url(&self) -> String {
        format!(
            "{}/api/evaluations/{}/events",
            self.base_url.trim_end_matches('/'),
            self.evaluation_id
        )
    }
}

enum LoopOutcome {
    /// The subscriber asked us to stop.
    Stopped,
    /// The server ended the stream cleanly.
    Ended,
}

pub struct StreamConnection {
    http: Client,
    config: StreamConfig,
    events_tx: mpsc::Sender<StreamEvent>,
    state_tx: watch::Sender<ConnectionState>,
}

impl StreamConnection {
    pub fn new(
        http: Client,
        config: StreamConfig,
        events_tx: mpsc::Sender<StreamEvent>,
        state_tx: watch::Sender<ConnectionState>,
    ) -> Self {
        Self {
            http,
            config,
            events_tx,
            state_tx,
        }
    }

    /// Drive the connection until the subscriber stops it, the server
    /// closes cleanly, or the retry budget runs out.
    pub async fn run(self, mut stop_rx: mpsc::Receiver<()>) -> TrackerResult<()> {
        let mut state = ConnectionState::default();
        let mut backoff = self.config.initial_backoff;
        let mut consecutive_failures = 0u32;

        loop {
            match self.read_stream(&mut stop_rx, &mut state).await {
                Ok(LoopOutcome::Stopped) => {
                    debug!(evaluation_id = %self.config.evaluation_id, "stream stopped by subscriber");
                    self.publish(&mut state, ConnectionStatus::Closed);
                    return Ok(());
                }
                Ok(LoopOutcome::Ended) => {
                    info!(evaluation_id = %self.config.evaluation_id, "server closed the event stream");
                    self.publish(&mut state, ConnectionStatus::Closed);
                    return Ok(());
                }
                Err(err) => {
                    // A failure after a successful open resets the budget:
                    // the cap applies to consecutive failures only.
                    if state.status == ConnectionStatus::Open {
                        consecutive_failures = 0;
                        backoff = self.config.initial_backoff;
                    }
                    consecutive_failures += 1;
                    state.retry_count += 1;
                    state.last_error = Some(err.to_string());
                    self.publish(&mut state, ConnectionStatus::Errored);

                    if consecutive_failures >= self.config.max_retries {
                        warn!(
                            evaluation_id = %self.config.evaluation_id,
                            attempts = consecutive_failures,
                            "giving up on event stream: {err}"
                        );
                        return Err(TrackerError::RetriesExhausted {
                            attempts: consecutive_failures,
                            last_error: err.to_string(),
                        });
                    }

                    warn!(
                        evaluation_id = %self.config.evaluation_id,
                        attempt = consecutive_failures,
                        delay_ms = backoff.as_millis() as u64,
                        "event stream dropped, reconnecting: {err}"
                    );
                    if wait_for_retry(&mut stop_rx, backoff).await {
                        self.publish(&mut state, ConnectionStatus::Closed);
                        return Ok(());
                    }
                    backoff = (backoff * 2).min(self.config.max_backoff);
                }
            }
        }
    }

    /// One connect-and-read attempt.
    async fn read_stream(
        &self,
        stop_rx: &mut mpsc::Receiver<()>,
        state: &mut ConnectionState,
    ) -> TrackerResult<LoopOutcome> {
        self.publish(state, ConnectionStatus::Connecting);

        let request = self
            .http
            .get(self.config.events_url())
            .header("Accept", "text/event-stream");
        let mut source =
            EventSource::new(request).map_err(|e| TrackerError::Stream(e.to_string()))?;

        loop {
            tokio::select! {
                _ = stop_rx.recv() => {
                    source.close();
                    return Ok(LoopOutcome::Stopped);
                }
                next = source.next() => match next {
                    Some(Ok(SseEvent::Open)) => {
                        self.publish(state, ConnectionStatus::Open);
                    }
                    Some(Ok(SseEvent::Message(message))) => {
                        match parse_envelope(&message) {
                            Ok(event) => {
                                if self.events_tx.send(event).await.is_err() {
                                    // Consumer went away; nothing left to do.
                                    source.close();
                                    return Ok(LoopOutcome::Stopped);
                                }
                            }
                            // Drop the envelope, keep the stream alive.
                            Err(err) => warn!(
                                evaluation_id = %self.config.evaluation_id,
                                "dropping malformed envelope: {err}"
                            ),
                        }
                    }
                    Some(Err(SseError::StreamEnded)) | None => {
                        source.close();
                        return Ok(LoopOutcome::Ended);
                    }
                    Some(Err(err)) => {
                        source.close();
                        return Err(TrackerError::Stream(err.to_string()));
                    }
                }
            }
        }
    }

    fn publish(&self, state: &mut ConnectionState, status: ConnectionStatus) {
        state.status = status;
        let _ = self.state_tx.send(state.clone());
    }
}

/// Parse one SSE message's data field into an envelope.
fn parse_envelope(message: &eventsource_stream::Event) -> TrackerResult<StreamEvent> {
    StreamEvent::parse(&message.data)
}

/// Sleep through the backoff delay, unless stopped first. Returns true if
/// the subscriber stopped us.
async fn wait_for_retry(stop_rx: &mut mpsc::Receiver<()>, delay: Duration) -> bool {
    tokio::select! {
        _ = stop_rx.recv() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
