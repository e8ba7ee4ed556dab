//! Polling fallback — the race partner to the live stream.
//!
//! The REST layer owns evaluation status; we only ask it "is this run
//! finished?" on an interval and feed terminal answers into the
//! completion gate. Poll failures are logged and skipped — the next tick
//! tries again.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::error::{TrackerError, TrackerResult};
use crate::gate::CompletionGate;

/// Lifecycle status of an evaluation resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStatus {
    Pending,
    Running,
    Completed,
    Finalized,
    Failed,
}

impl EvaluationStatus {
    /// Terminal statuses count as external completion signals.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EvaluationStatus::Completed | EvaluationStatus::Finalized | EvaluationStatus::Failed
        )
    }
}

/// Where evaluation status comes from. A trait seam so the poller is
/// testable without a backend.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch_status(&self, evaluation_id: &str) -> TrackerResult<EvaluationStatus>;
}

/// The real source: `GET {base}/api/evaluations/{id}`.
pub struct RestStatusSource {
    http: Client,
    base_url: String,
}

impl RestStatusSource {
    pub fn new(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    fn evaluation_url(&self, evaluation_id: &str) -> String {
        format!(
            "{}/api/evaluations/{evaluation_id}",
            self.base_url.trim_end_matches('/')
        )
    }
}

/// The slice of the evaluation document we care about.
#[derive(Debug, Deserialize)]
struct EvaluationDoc {
    status: EvaluationStatus,
}

#[async_trait]
impl StatusSource for RestStatusSource {
    async fn fetch_status(&self, evaluation_id: &str) -> TrackerResult<EvaluationStatus> {
        let response = self
            .http
            .get(self.evaluation_url(evaluation_id))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TrackerError::InvalidStatus(format!(
                "evaluation fetch returned HTTP {status}"
            )));
        }
        let doc: EvaluationDoc = response
            .json()
            .await
            .map_err(|e| TrackerError::InvalidStatus(e.to_string()))?;
        Ok(doc.status)
    }
}

/// Periodically checks evaluation status and notifies the gate on a
/// terminal answer. Exits once the gate has fired (by either source) or
/// the subscription shuts down.
pub struct StatusPoller {
    source: Arc<dyn StatusSource>,
    evaluation_id: String,
    interval: Duration,
}

impl StatusPoller {
    pub fn new(source: Arc<dyn StatusSource>, evaluation_id: impl Into<String>, interval: Duration) -> Self {
        Self {
            source,
            evaluation_id: evaluation_id.into(),
            interval,
        }
    }

    pub async fn run(self, gate: Arc<Mutex<CompletionGate>>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return;
                    }
                }
                _ = ticker.tick() => {
                    if gate.lock().await.is_fired() {
                        return;
                    }
                    match self.source.fetch_status(&self.evaluation_id).await {
                        Ok(status) if status.is_terminal() => {
                            let won = gate.lock().await.notify_external_completed();
                            if won {
                                info!(
                                    evaluation_id = %self.evaluation_id,
                                    ?status,
                                    "polling observed terminal status first"
                                );
                            }
                            return;
                        }
                        Ok(status) => {
                            debug!(evaluation_id = %self.evaluation_id, ?status, "evaluation still in flight");
                        }
                        Err(err) => {
                            debug!(evaluation_id = %self.evaluation_id, "status poll failed: {err}");
                        }
                    }
                }
            }
        }
    }
}
