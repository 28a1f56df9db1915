//! Processing stages and the reconciled progress view.
//!
//! A question submitted to the backend moves through a fixed pipeline
//! (analyze, decide, split, retrieve, generate) and ends in exactly one
//! terminal stage. The types here are plain values; the folding logic lives
//! in the progress crate and relies on the ordering helpers defined here.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;

/// A phase of the backend answer pipeline.
///
/// Variants are declared in pipeline order, so the derived `Ord` is the
/// pipeline order. `Failed` sits outside the pipeline and sorts last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// The question is being analyzed.
    #[serde(alias = "analyzing_query")]
    Analyzing,
    /// The backend decides whether document retrieval is needed.
    #[serde(alias = "deciding_retrieval")]
    Deciding,
    /// The question is split into sub-queries.
    #[serde(alias = "splitting_query")]
    Splitting,
    /// Relevant chunks are retrieved from the document store.
    #[serde(alias = "retrieving_documents")]
    Retrieving,
    /// The answer is being generated.
    #[serde(alias = "generating_answer")]
    Generating,
    /// The answer is ready.
    Complete,
    /// Processing failed.
    #[serde(alias = "error")]
    Failed,
}

impl Stage {
    /// Non-terminal and terminal pipeline stages in order, excluding `Failed`.
    pub const PIPELINE: [Self; 6] = [
        Self::Analyzing,
        Self::Deciding,
        Self::Splitting,
        Self::Retrieving,
        Self::Generating,
        Self::Complete,
    ];

    /// Returns every mandatory stage that precedes `self` in pipeline order.
    ///
    /// `Deciding` is never included: the backend skips the retrieval
    /// decision when the caller forces a retrieval mode, so reaching a later
    /// stage does not imply it ran. `Failed` has no predecessors.
    #[must_use]
    pub fn stages_before(self) -> Vec<Self> {
        if self == Self::Failed {
            return Vec::new();
        }
        Self::PIPELINE
            .iter()
            .copied()
            .take_while(|stage| *stage < self)
            .filter(|stage| !stage.is_optional())
            .collect()
    }

    /// True only for `Complete` and `Failed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// True for stages the backend may legitimately skip.
    #[must_use]
    pub const fn is_optional(self) -> bool {
        matches!(self, Self::Deciding)
    }

    /// The canonical wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Analyzing => "analyzing",
            Self::Deciding => "deciding",
            Self::Splitting => "splitting",
            Self::Retrieving => "retrieving",
            Self::Generating => "generating",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    /// A short human label, used when a message has to be synthesized.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Analyzing => "Analyzing your question",
            Self::Deciding => "Deciding whether to search your documents",
            Self::Splitting => "Breaking down your question",
            Self::Retrieving => "Searching your documents",
            Self::Generating => "Generating an answer",
            Self::Complete => "Answer ready",
            Self::Failed => "Processing failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One stage notification, from the live stream or synthesized by the poller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEvent {
    /// The stage this notification is about.
    pub stage: Stage,
    /// Message suitable for display.
    pub human_message: String,
    /// Whether the stage itself has finished.
    pub finished: bool,
    /// Backend-specific detail (chunk counts, reasoning, error text).
    #[serde(default)]
    pub detail: Map<String, Value>,
    /// Sub-queries, normally only present at the splitting stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_queries: Option<Vec<String>>,
}

impl StageEvent {
    /// Creates an unfinished event for `stage`.
    pub fn new(stage: Stage, human_message: impl Into<String>) -> Self {
        Self {
            stage,
            human_message: human_message.into(),
            finished: false,
            detail: Map::new(),
            sub_queries: None,
        }
    }

    /// Creates a finished event for `stage`.
    pub fn finished(stage: Stage, human_message: impl Into<String>) -> Self {
        Self { finished: true, ..Self::new(stage, human_message) }
    }

    /// Creates a terminal `Failed` event carrying `error` in its detail.
    pub fn failed(error: impl Into<String>) -> Self {
        let error = error.into();
        let mut event = Self::finished(Stage::Failed, format!("Processing failed: {error}"));
        event.detail.insert("error".to_string(), Value::String(error));
        event
    }

    /// Sets the sub-queries.
    #[must_use]
    pub fn with_sub_queries(mut self, sub_queries: Vec<String>) -> Self {
        self.sub_queries = Some(sub_queries);
        self
    }

    /// Adds a detail entry.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: Value) -> Self {
        self.detail.insert(key.into(), value);
        self
    }
}

/// The reconciled, UI-facing view of one in-flight ask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionProgress {
    /// Furthest stage observed so far (or `Failed`).
    pub current_stage: Stage,
    /// Finished stages, iterated in pipeline order. Only ever grows.
    pub finished_stages: BTreeSet<Stage>,
    /// Message of the latest event.
    pub human_message: String,
    /// Sub-queries of the latest event that carried any.
    pub sub_queries: Vec<String>,
    /// Detail of the latest event.
    #[serde(default)]
    pub detail: Map<String, Value>,
    /// Set once a terminal stage has been folded in.
    pub terminal: bool,
}

impl SessionProgress {
    /// Returns true if `stage` is in the finished set.
    #[must_use]
    pub fn is_finished(&self, stage: Stage) -> bool {
        self.finished_stages.contains(&stage)
    }

    /// Returns true if the ask ended in `Failed`.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.terminal && self.current_stage == Stage::Failed
    }

    /// Finished stages in pipeline order.
    #[must_use]
    pub fn finished_in_order(&self) -> Vec<Stage> {
        self.finished_stages.iter().copied().collect()
    }
}
