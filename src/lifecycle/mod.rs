//! Generator lifecycle and scheduling
//!
//! Nodes live in a generation-checked arena and are linked by explicit
//! handles. The tree drives Setup → Resize → Generate parent-before-child and
//! coalesces schedule requests into at most one resize and one generate per
//! node per tick.

pub mod arena;
pub mod events;
pub mod node;
pub mod tree;

pub use arena::{NodeArena, NodeHandle};
pub use events::{EventBus, GeneratorEvent};
pub use node::{GeneratorNode, NodeState, ScheduleRequest};
pub use tree::GeneratorTree;
