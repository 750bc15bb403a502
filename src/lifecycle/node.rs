//! Generator node contract

use crate::error::EngineResult;
use std::any::Any;

/// Lifecycle state of a node inside a [`GeneratorTree`](super::GeneratorTree)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Uninitialized,
    /// Setup was attempted and failed; the next resize or generate retries it
    SetupFailed,
    Ready,
}

/// Work a node asks the scheduler for on the next tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleRequest {
    pub resize: bool,
    pub generate: bool,
}

impl ScheduleRequest {
    pub const RESIZE_AND_GENERATE: Self = Self {
        resize: true,
        generate: true,
    };

    pub fn merge(&mut self, other: ScheduleRequest) {
        self.resize |= other.resize;
        self.generate |= other.generate;
    }

    pub fn is_empty(&self) -> bool {
        !self.resize && !self.generate
    }
}

/// A data-generating node driven by the scheduler.
///
/// The tree guarantees parent-before-child ordering for every phase; nodes
/// only implement what happens inside their own phase.
pub trait GeneratorNode: Send + 'static {
    fn name(&self) -> &str;

    /// Acquire resources. An error leaves the node in `SetupFailed`.
    fn on_setup(&mut self) -> EngineResult<()>;

    /// Reallocate size-dependent resources. Returns true when data changed.
    fn on_resize(&mut self) -> bool {
        true
    }

    /// Produce new data. Returns true when children should regenerate.
    fn on_generate(&mut self) -> bool;

    /// Veto generation for this tick
    fn can_generate(&mut self) -> bool {
        true
    }

    /// Per-tick housekeeping after the generate sweep
    fn on_update(&mut self) {}

    /// Release resources; the node is set up again before its next use
    fn on_cleanup(&mut self) {}

    /// Drain resize/generate requests raised since the last tick
    fn take_requests(&mut self) -> ScheduleRequest {
        ScheduleRequest::default()
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}
