//! Generic action-pipeline bookkeeping.
//!
//! An action is an ordered list of named stages with a cursor through
//! them, a single point where the pipeline announces it has produced
//! its final response (`mark_done`), and a separate point where it
//! tears itself down (`mark_torn_down`). `ActionBase` keeps the
//! bookkeeping half of that contract (stage names for logging, and the
//! "exactly one response, exactly one teardown" invariant); dispatch
//! itself is an explicit `enum Stage` driven by a plain loop in the
//! concrete action, such as `actions::put_part::PutPartAction`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Ordered stage-name bookkeeping plus the done/teardown invariant.
///
/// This does not itself drive dispatch — the concrete action's `Stage`
/// enum and `match` loop do that — it only tracks *which* stage is
/// current (for logging) and asserts the pipeline calls `done()`
/// exactly once before it is torn down.
pub struct ActionBase {
    action_name: &'static str,
    stage_names: Vec<&'static str>,
    cursor: AtomicUsize,
    responded: AtomicBool,
    torn_down: AtomicBool,
}

impl ActionBase {
    pub fn new(action_name: &'static str, stage_names: Vec<&'static str>) -> Self {
        ActionBase {
            action_name,
            stage_names,
            cursor: AtomicUsize::new(0),
            responded: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
        }
    }

    /// Name of the stage the cursor currently sits on, if any.
    pub fn current_stage_name(&self) -> Option<&'static str> {
        self.stage_names.get(self.cursor.load(Ordering::SeqCst)).copied()
    }

    /// Advance the cursor and log the transition at `debug`.
    pub fn next(&self) {
        let prev = self.cursor.fetch_add(1, Ordering::SeqCst);
        let to = self.stage_names.get(prev + 1).copied().unwrap_or("<end>");
        tracing::debug!(
            action = self.action_name,
            from = self.stage_names.get(prev).copied().unwrap_or("<start>"),
            to,
            "stage transition"
        );
        if to != "<end>" {
            metrics::counter!(
                crate::metrics::PIPELINE_STAGE_TOTAL,
                "action" => self.action_name,
                "stage" => to,
            )
            .increment(1);
        }
    }

    /// Record that the pipeline has produced its final response.
    pub fn mark_done(&self) {
        let already = self.responded.swap(true, Ordering::SeqCst);
        if already {
            tracing::error!(action = self.action_name, "mark_done() called more than once");
        }
    }

    /// Record teardown — the point the owning `Arc`/owned action is
    /// allowed to be dropped.
    pub fn mark_torn_down(&self) {
        if !self.responded.load(Ordering::SeqCst) {
            tracing::error!(
                action = self.action_name,
                "mark_torn_down() called before mark_done() — no response was ever sent"
            );
        }
        let already = self.torn_down.swap(true, Ordering::SeqCst);
        if already {
            tracing::error!(action = self.action_name, "mark_torn_down() called more than once");
        }
    }
}

impl Drop for ActionBase {
    fn drop(&mut self) {
        if !self.torn_down.load(Ordering::SeqCst) {
            tracing::error!(
                action = self.action_name,
                "action dropped without calling mark_torn_down() — teardown invariant violated"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_transitions_advance_cursor() {
        let base = ActionBase::new("test", vec!["a", "b", "c"]);
        assert_eq!(base.current_stage_name(), Some("a"));
        base.next();
        assert_eq!(base.current_stage_name(), Some("b"));
        base.next();
        assert_eq!(base.current_stage_name(), Some("c"));
        base.next();
        assert_eq!(base.current_stage_name(), None);
        base.mark_done();
        base.mark_torn_down();
    }

    #[test]
    fn well_behaved_lifecycle_does_not_warn() {
        let base = ActionBase::new("test", vec!["only"]);
        base.mark_done();
        base.mark_torn_down();
    }
}
