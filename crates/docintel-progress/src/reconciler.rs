//! Folding stage events into a monotonic [`SessionProgress`].
//!
//! This is the only place that knows stage ordering and completion rules.
//! Events may arrive duplicated, late, or with intermediate stages missing;
//! the fold only ever adds to the finished set and only ever advances the
//! current stage, so the observable result is independent of those
//! irregularities.

use crate::error::ReconcileError;
use docintel_abstraction::{SessionProgress, Stage, StageEvent};
use std::collections::BTreeSet;
use tracing::debug;

/// Folds `incoming` into `previous`.
///
/// # Errors
/// Returns `ReconcileError::AlreadyTerminal` if `previous` is terminal. A
/// terminal progress is final; feeding it more events is a caller bug.
pub fn reconcile(
    previous: Option<&SessionProgress>,
    incoming: &StageEvent,
) -> Result<SessionProgress, ReconcileError> {
    if let Some(previous) = previous {
        if previous.terminal {
            return Err(ReconcileError::AlreadyTerminal {
                stage: previous.current_stage,
                incoming: incoming.stage,
            });
        }
    }

    let mut next = previous.cloned().unwrap_or_else(|| SessionProgress {
        current_stage: incoming.stage,
        finished_stages: BTreeSet::new(),
        human_message: String::new(),
        sub_queries: Vec::new(),
        detail: serde_json::Map::new(),
        terminal: false,
    });

    let stale = previous.is_some_and(|p| incoming.stage < p.current_stage);

    if incoming.stage == Stage::Failed {
        next.current_stage = Stage::Failed;
    } else if incoming.stage > next.current_stage {
        // Leaving a stage means it finished, even an optional one.
        next.finished_stages.insert(next.current_stage);
        next.current_stage = incoming.stage;
    }

    next.finished_stages.extend(incoming.stage.stages_before());
    if incoming.finished {
        next.finished_stages.insert(incoming.stage);
    }

    if let Some(sub_queries) = incoming.sub_queries.as_ref().filter(|q| !q.is_empty()) {
        next.sub_queries.clone_from(sub_queries);
    }

    if !stale {
        next.human_message.clone_from(&incoming.human_message);
        next.detail.clone_from(&incoming.detail);
    }

    if incoming.stage.is_terminal() {
        next.terminal = true;
        if incoming.stage == Stage::Complete {
            close_pipeline(&mut next.finished_stages);
        }
    }

    debug!(
        stage = %incoming.stage,
        finished = incoming.finished,
        current = %next.current_stage,
        terminal = next.terminal,
        "Reconciled stage event"
    );

    Ok(next)
}

/// Marks every known pipeline stage finished.
///
/// Mandatory stages are always known; an optional stage is known only if it
/// was already recorded.
fn close_pipeline(finished: &mut BTreeSet<Stage>) {
    finished.extend(Stage::PIPELINE.iter().copied().filter(|stage| !stage.is_optional()));
}

/// Stateful wrapper that owns the progress of one ask.
#[derive(Debug, Default, Clone)]
pub struct ProgressReconciler {
    progress: Option<SessionProgress>,
}

impl ProgressReconciler {
    /// Creates a reconciler with no progress yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one event in and returns the new progress.
    ///
    /// # Errors
    /// Returns `ReconcileError::AlreadyTerminal` once the progress is terminal.
    pub fn apply(&mut self, event: &StageEvent) -> Result<&SessionProgress, ReconcileError> {
        let next = reconcile(self.progress.as_ref(), event)?;
        Ok(self.progress.insert(next))
    }

    /// The current progress, if any event has been folded in.
    #[must_use]
    pub fn progress(&self) -> Option<&SessionProgress> {
        self.progress.as_ref()
    }

    /// True once a terminal event has been folded in.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.progress.as_ref().is_some_and(|p| p.terminal)
    }

    /// Consumes the reconciler, returning the final progress.
    #[must_use]
    pub fn into_progress(self) -> Option<SessionProgress> {
        self.progress
    }
}
