//! Progress reducer — derives pipeline state from the event stream.
//!
//! The reducer is deterministic and side-effect-free: applying the same
//! event twice lands in the same state, so reconnect replay and duplicate
//! delivery cannot corrupt the view. Invariants:
//! - `completed` only grows, holds each stage at most once, keeps insertion order
//! - `current` holds at most one stage and clears when that stage completes
//! - once terminal, nothing mutates ever again

use serde::Serialize;

use crate::event::{EventKind, StreamEvent};

/// Which fixed stage sequence an evaluation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineVariant {
    /// Single-vendor application workflow.
    Application,
    /// Multi-vendor assessment/comparison workflow.
    Assessment,
}

impl PipelineVariant {
    /// Canonical stage order for this variant (agent names as the
    /// backend emits them).
    pub fn stages(self) -> &'static [&'static str] {
        match self {
            PipelineVariant::Application => &[
                "IntakeAgent",
                "VerificationAgent",
                "ComplianceAgent",
                "InteroperabilityAgent",
                "FinanceAgent",
                "AdoptionAgent",
                "SummaryAgent",
            ],
            PipelineVariant::Assessment => &[
                "RequirementProfileAgent",
                "ComplianceAgent",
                "InteroperabilityAgent",
                "FinanceAgent",
                "ComparisonAnalysisAgent",
            ],
        }
    }

    /// Parse the variant name as it appears in `workflow_start` payloads.
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "application" => Some(PipelineVariant::Application),
            "assessment" => Some(PipelineVariant::Assessment),
            _ => None,
        }
    }
}

/// The ordered list of stage identifiers one evaluation progresses through.
///
/// Used to derive and validate progress, never to reject events: a stage
/// id outside the sequence is still tracked as an opaque identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSequence {
    stages: Vec<String>,
}

impl StageSequence {
    pub fn for_variant(variant: PipelineVariant) -> Self {
        Self::custom(variant.stages().iter().copied())
    }

    /// A sequence not tied to a built-in variant (future pipeline shapes).
    pub fn custom<I, S>(stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            stages: stages.into_iter().map(Into::into).collect(),
        }
    }

    pub fn stages(&self) -> &[String] {
        &self.stages
    }

    pub fn contains(&self, stage: &str) -> bool {
        self.stages.iter().any(|s| s == stage)
    }

    /// Slot index for rendering, if the stage is part of this sequence.
    pub fn position(&self, stage: &str) -> Option<usize> {
        self.stages.iter().position(|s| s == stage)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// Derived view of one evaluation's pipeline progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressState {
    completed: Vec<String>,
    current: Option<String>,
    terminal: bool,
    failed: bool,
    error: Option<String>,
    active_vendor: Option<String>,
}

impl ProgressState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages marked complete, in the order they completed. No duplicates.
    pub fn completed(&self) -> &[String] {
        &self.completed
    }

    /// The stage currently running, if any.
    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Whether the pipeline has ended (successfully or not).
    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// The `workflow_error` message, verbatim.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Vendor whose sub-run is active, for multi-vendor evaluations.
    pub fn active_vendor(&self) -> Option<&str> {
        self.active_vendor.as_deref()
    }

    pub fn is_stage_completed(&self, stage: &str) -> bool {
        self.completed.iter().any(|s| s == stage)
    }

    /// Apply one event in arrival order.
    ///
    /// Idempotent per event: completion inserts are no-ops when the stage
    /// is already present, and everything after a terminal event is
    /// ignored — including duplicates from reconnect replay.
    pub fn apply(&mut self, event: &StreamEvent, stages: &StageSequence) {
        if self.terminal {
            return;
        }
        match event.kind {
            EventKind::WorkflowStart | EventKind::AgentProgress => {}
            EventKind::VendorStart => {
                if let Some(vendor) = event.vendor_name() {
                    self.active_vendor = Some(vendor.to_string());
                }
            }
            EventKind::AgentStart => {
                // Re-entry of an already-completed stage is allowed: the
                // same agent runs once per vendor in multi-vendor runs.
                if let Some(stage) = event.agent_name() {
                    self.current = Some(stage.to_string());
                }
            }
            EventKind::AgentComplete => {
                if let Some(stage) = event.agent_name() {
                    self.mark_completed(stage);
                    if self.current.as_deref() == Some(stage) {
                        self.current = None;
                    }
                }
            }
            EventKind::WorkflowComplete => {
                self.terminal = true;
                self.current = None;
                // Close out any stage the stream never explicitly completed.
                for stage in stages.stages() {
                    self.mark_completed(stage);
                }
            }
            EventKind::WorkflowError => {
                self.terminal = true;
                self.failed = true;
                self.error = event
                    .error_message()
                    .map(str::to_string)
                    .or_else(|| Some("pipeline reported an unspecified error".to_string()));
            }
        }
    }

    /// Idempotent ordered-set insert. Unknown stages are recorded too —
    /// the UI just won't find a slot for them.
    fn mark_completed(&mut self, stage: &str) {
        if !self.is_stage_completed(stage) {
            self.completed.push(stage.to_string());
        }
    }
}
