//! Progress derivation.
//!
//! Progress is always a function of persisted step state, recomputed under
//! the instance's serialization point — never an incrementally mutated
//! counter.

use crate::store::WorkflowStep;

/// Completion percentage: floor(100 * terminal_steps / total_steps).
///
/// Completed and skipped steps both count as done; blocked and in-progress
/// steps do not. A step never leaves a terminal state, so this value cannot
/// decrease for an active workflow.
pub fn percentage(steps: &[WorkflowStep]) -> i32 {
    if steps.is_empty() {
        return 0;
    }
    let done = steps.iter().filter(|s| s.is_terminal()).count();
    (done * 100 / steps.len()) as i32
}

/// Stage of the lowest-order step that is not completed or skipped.
/// `None` once every step is terminal.
pub fn current_stage(steps: &[WorkflowStep]) -> Option<String> {
    steps
        .iter()
        .filter(|s| !s.is_terminal())
        .min_by_key(|s| s.step_order)
        .map(|s| s.stage.clone())
}

/// All steps terminal: the precondition for instance completion.
pub fn all_steps_terminal(steps: &[WorkflowStep]) -> bool {
    steps.iter().all(|s| s.is_terminal())
}
