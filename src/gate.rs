//! Completion gate — at-most-once "pipeline finished" notification.
//!
//! Two sources race to report completion: a terminal event on the stream,
//! and the polling fallback observing a terminal evaluation status. The
//! first one through the gate wins; every later call is a no-op. Scoped
//! to one evaluation subscription and discarded with it.

use tokio::sync::oneshot;

/// Which race partner reached the gate first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionSource {
    /// A `workflow_complete`/`workflow_error` event on the live stream.
    Stream,
    /// The polling fallback observed a terminal evaluation status.
    Poll,
}

#[derive(Debug)]
pub struct CompletionGate {
    tx: Option<oneshot::Sender<CompletionSource>>,
}

impl CompletionGate {
    /// Create a gate and the receiver that resolves exactly once.
    pub fn new() -> (Self, oneshot::Receiver<CompletionSource>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Report a terminal event seen on the stream. Returns whether this
    /// call won the race.
    pub fn notify_stream_terminal(&mut self) -> bool {
        self.fire(CompletionSource::Stream)
    }

    /// Report an externally observed terminal status. Returns whether this
    /// call won the race.
    pub fn notify_external_completed(&mut self) -> bool {
        self.fire(CompletionSource::Poll)
    }

    pub fn is_fired(&self) -> bool {
        self.tx.is_none()
    }

    fn fire(&mut self, source: CompletionSource) -> bool {
        match self.tx.take() {
            Some(tx) => {
                // Receiver may already be dropped; the gate still counts
                // as fired so later calls stay no-ops.
                let _ = tx.send(source);
                true
            }
            None => false,
        }
    }
}
