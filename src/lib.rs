//! vendorhub-tracker — live progress tracking for vendor-evaluation pipelines.
//!
//! Consumes the backend's server-sent event stream for one evaluation run
//! and derives a monotonic, replay-tolerant view of pipeline progress:
//! which stage is running, which stages are done, and whether the run
//! terminated. Tolerates disconnects, duplicate delivery, and a polling
//! completion fallback racing against the stream.

pub mod classify;
pub mod error;
pub mod event;
pub mod gate;
pub mod log;
pub mod poll;
pub mod progress;
pub mod stream;
pub mod subscription;
