//! Event classification — which events the timeline shows inline.
//!
//! A static allow-list selects the "headline" events; everything else stays
//! in the event log and only surfaces in the expanded/debug view. Pure
//! function of the event, never touches progress state.

use crate::event::{EventKind, StreamEvent};

/// `agent_progress` actions worth a headline (search lifecycle). Free-form
/// thinking strings like "Analyzing pricing with LLM" stay log-only.
const HEADLINE_ACTIONS: &[&str] = &["search_initiated", "sources_found", "no_sources_found"];

/// How a headline event should read on the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Headline {
    WorkflowStarted,
    VendorStarted,
    StageStarted,
    SearchProgress,
    StageCompleted,
    WorkflowCompleted,
    WorkflowFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Rendered inline in the main timeline.
    Headline(Headline),
    /// Retained in the log, shown only in the debug view.
    Background,
}

impl Classification {
    pub fn is_headline(self) -> bool {
        matches!(self, Classification::Headline(_))
    }
}

/// Classify one event for display.
pub fn classify(event: &StreamEvent) -> Classification {
    let headline = match event.kind {
        EventKind::WorkflowStart => Headline::WorkflowStarted,
        EventKind::VendorStart => Headline::VendorStarted,
        EventKind::AgentStart => Headline::StageStarted,
        EventKind::AgentComplete => Headline::StageCompleted,
        EventKind::WorkflowComplete => Headline::WorkflowCompleted,
        EventKind::WorkflowError => Headline::WorkflowFailed,
        EventKind::AgentProgress => {
            let allowed = event
                .action()
                .map(|a| HEADLINE_ACTIONS.contains(&a))
                .unwrap_or(false);
            if allowed {
                Headline::SearchProgress
            } else {
                return Classification::Background;
            }
        }
    };
    Classification::Headline(headline)
}
