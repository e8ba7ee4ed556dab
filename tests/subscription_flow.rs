//! End-to-end subscription tests against a local mock backend.
//!
//! Spins up an axum server with the two endpoints the tracker talks to:
//! the SSE event channel and the evaluation status resource. Everything
//! runs on a loopback port picked by the OS.

use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, Sse};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use vendorhub_tracker::event::StreamEvent;
use vendorhub_tracker::gate::CompletionSource;
use vendorhub_tracker::progress::PipelineVariant;
use vendorhub_tracker::stream::ConnectionStatus;
use vendorhub_tracker::subscription::{Subscription, SubscriptionConfig};

#[derive(Clone)]
struct MockBackend {
    events_tx: broadcast::Sender<String>,
    status: Arc<Mutex<&'static str>>,
}

impl MockBackend {
    fn publish(&self, event: &StreamEvent) {
        self.publish_raw(serde_json::to_string(event).unwrap());
    }

    fn publish_raw(&self, payload: String) {
        self.events_tx.send(payload).unwrap();
    }

    fn set_status(&self, status: &'static str) {
        *self.status.lock().unwrap() = status;
    }

    /// Block until the tracker's SSE request has subscribed.
    async fn wait_for_subscriber(&self) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.events_tx.receiver_count() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("no SSE subscriber arrived");
    }
}

async fn get_evaluation(State(backend): State<MockBackend>) -> Json<serde_json::Value> {
    let status = *backend.status.lock().unwrap();
    Json(serde_json::json!({ "id": "eval-1", "status": status }))
}

async fn get_events(
    State(backend): State<MockBackend>,
) -> Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>> {
    let rx = backend.events_tx.subscribe();
    let stream = BroadcastStream::new(rx)
        .filter_map(|msg| async move { msg.ok() })
        .map(|payload| Ok(Event::default().data(payload)));
    Sse::new(stream)
}

async fn spawn_backend() -> (MockBackend, String) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    spawn_backend_on(listener).await
}

async fn spawn_backend_on(listener: tokio::net::TcpListener) -> (MockBackend, String) {
    let (events_tx, _) = broadcast::channel(64);
    let backend = MockBackend {
        events_tx,
        status: Arc::new(Mutex::new("running")),
    };

    let app = Router::new()
        .route("/api/evaluations/{id}", get(get_evaluation))
        .route("/api/evaluations/{id}/events", get(get_events))
        .with_state(backend.clone());

    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (backend, format!("http://{addr}"))
}

fn config_for(base_url: &str, variant: PipelineVariant) -> SubscriptionConfig {
    let mut config = SubscriptionConfig::new(base_url, "eval-1", variant);
    // Keep the poller out of stream-only tests
    config.poll_interval = Duration::from_secs(60);
    config
}

#[tokio::test]
async fn full_application_run_over_stream() {
    let (backend, base_url) = spawn_backend().await;
    let mut sub = Subscription::open(config_for(&base_url, PipelineVariant::Application));
    backend.wait_for_subscriber().await;

    backend.publish(&StreamEvent::workflow_start("application"));
    backend.publish(&StreamEvent::vendor_start("Acme Corp"));
    for agent in ["IntakeAgent", "VerificationAgent", "ComplianceAgent"] {
        backend.publish(&StreamEvent::agent_start(agent));
        backend.publish(&StreamEvent::agent_progress(agent, "search_initiated"));
        backend.publish(&StreamEvent::agent_complete(agent));
    }
    backend.publish(&StreamEvent::workflow_complete());

    let source = tokio::time::timeout(Duration::from_secs(5), sub.wait_completed())
        .await
        .expect("completion did not fire");
    assert_eq!(source, Some(CompletionSource::Stream));

    let state = sub.state();
    assert!(state.progress.is_terminal());
    assert!(!state.progress.is_failed());
    assert_eq!(state.progress.active_vendor(), Some("Acme Corp"));
    // workflow_complete closes out the stages the stream never finished
    assert_eq!(
        state.progress.completed().len(),
        PipelineVariant::Application.stages().len()
    );
    for stage in PipelineVariant::Application.stages() {
        assert!(state.progress.is_stage_completed(stage), "missing {stage}");
    }

    // Full audit log: 2 lifecycle + 3×3 agent events + 1 terminal
    assert_eq!(sub.log_snapshot().len(), 12);

    // Completion resolves only once
    assert_eq!(sub.wait_completed().await, None);
    sub.close();
}

#[tokio::test]
async fn pipeline_failure_over_stream() {
    let (backend, base_url) = spawn_backend().await;
    let mut sub = Subscription::open(config_for(&base_url, PipelineVariant::Assessment));
    backend.wait_for_subscriber().await;

    backend.publish(&StreamEvent::agent_start("RequirementProfileAgent"));
    backend.publish(&StreamEvent::workflow_error("search quota exhausted"));

    let source = tokio::time::timeout(Duration::from_secs(5), sub.wait_completed())
        .await
        .expect("completion did not fire");
    assert_eq!(source, Some(CompletionSource::Stream));

    let state = sub.state();
    assert!(state.progress.is_terminal());
    assert!(state.progress.is_failed());
    assert_eq!(state.progress.error(), Some("search quota exhausted"));
    assert!(state.progress.completed().is_empty());
    sub.close();
}

#[tokio::test]
async fn poll_fallback_wins_without_stream_events() {
    let (backend, base_url) = spawn_backend().await;
    backend.set_status("completed");

    let mut config = config_for(&base_url, PipelineVariant::Application);
    config.poll_interval = Duration::from_millis(50);
    let mut sub = Subscription::open(config);

    let source = tokio::time::timeout(Duration::from_secs(5), sub.wait_completed())
        .await
        .expect("completion did not fire");
    assert_eq!(source, Some(CompletionSource::Poll));

    // The stream saw no terminal event, so derived progress is untouched
    let state = sub.state();
    assert!(!state.progress.is_terminal());
    sub.close();
}

#[tokio::test]
async fn malformed_envelopes_are_dropped_not_fatal() {
    let (backend, base_url) = spawn_backend().await;
    let mut sub = Subscription::open(config_for(&base_url, PipelineVariant::Application));
    backend.wait_for_subscriber().await;

    backend.publish_raw("this is not json".to_string());
    backend.publish_raw(r#"{"event": "warp_drive_engaged", "data": {}}"#.to_string());
    backend.publish(&StreamEvent::workflow_complete());

    let source = tokio::time::timeout(Duration::from_secs(5), sub.wait_completed())
        .await
        .expect("completion did not fire");
    assert_eq!(source, Some(CompletionSource::Stream));

    // Only the valid envelope reached the log
    assert_eq!(sub.log_snapshot().len(), 1);
    sub.close();
}

#[tokio::test]
async fn reconnects_after_initial_connect_failure() {
    // Reserve a port but leave it dead so the first attempts are refused.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut config = config_for(&format!("http://{addr}"), PipelineVariant::Application);
    config.initial_backoff = Duration::from_millis(50);
    config.max_backoff = Duration::from_millis(50);
    let mut sub = Subscription::open(config);

    // Let at least one attempt fail, then bring the backend up on that port.
    tokio::time::sleep(Duration::from_millis(30)).await;
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    let (backend, _) = spawn_backend_on(listener).await;
    backend.wait_for_subscriber().await;
    backend.publish(&StreamEvent::workflow_complete());

    let source = tokio::time::timeout(Duration::from_secs(5), sub.wait_completed())
        .await
        .expect("completion did not fire");
    assert_eq!(source, Some(CompletionSource::Stream));

    let state = sub.state();
    assert!(state.connection.retry_count >= 1, "no reconnect happened");
    assert!(state.progress.is_terminal());
    sub.close();
}

#[tokio::test]
async fn clean_server_close_ends_without_retry() {
    use tokio::sync::{mpsc, watch};
    use vendorhub_tracker::stream::{ConnectionState, StreamConfig, StreamConnection};

    // A stream that delivers one event and then ends normally.
    async fn one_and_done() -> Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>> {
        let payload = serde_json::to_string(&StreamEvent::agent_start("IntakeAgent")).unwrap();
        let stream =
            futures_util::stream::iter(vec![Ok::<_, Infallible>(Event::default().data(payload))]);
        Sse::new(stream)
    }

    let app = Router::new().route("/api/evaluations/{id}/events", get(one_and_done));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let mut config = StreamConfig::new(format!("http://{addr}"), "eval-1");
    config.initial_backoff = Duration::from_millis(5);

    let (events_tx, mut events_rx) = mpsc::channel(16);
    let (state_tx, state_rx) = watch::channel(ConnectionState::default());
    let (_stop_tx, stop_rx) = mpsc::channel::<()>(1);

    let connection = StreamConnection::new(reqwest::Client::new(), config, events_tx, state_tx);
    tokio::time::timeout(Duration::from_secs(5), connection.run(stop_rx))
        .await
        .expect("run did not return")
        .expect("clean close is not an error");

    // The event arrived and the connection closed without a retry.
    let event = events_rx.recv().await.expect("event was not delivered");
    assert_eq!(event.agent_name(), Some("IntakeAgent"));
    let state = state_rx.borrow().clone();
    assert_eq!(state.status, ConnectionStatus::Closed);
    assert_eq!(state.retry_count, 0);
}

#[tokio::test]
async fn connection_reports_open() {
    let (backend, base_url) = spawn_backend().await;
    let sub = Subscription::open(config_for(&base_url, PipelineVariant::Application));
    backend.wait_for_subscriber().await;

    let mut state_rx = sub.state_changes();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if state_rx.borrow().connection.status == ConnectionStatus::Open {
                break;
            }
            state_rx.changed().await.unwrap();
        }
    })
    .await
    .expect("connection never opened");
}
