//! Generator Lifecycle Ordering Tests
//!
//! Drives small recording nodes through a GeneratorTree and checks the
//! parent-before-child guarantees of setup, resize and generate.

use depth_fusion_engine::{
    EngineError, EngineResult, GeneratorEvent, GeneratorNode, GeneratorTree, NodeState, ScheduleRequest,
};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;

type Log = Arc<Mutex<Vec<String>>>;

struct RecordingNode {
    name: String,
    log: Log,
    fail_setup: bool,
    produces_data: bool,
    requests: ScheduleRequest,
}

impl RecordingNode {
    fn new(name: &str, log: &Log) -> Self {
        Self {
            name: name.to_string(),
            log: log.clone(),
            fail_setup: false,
            produces_data: true,
            requests: ScheduleRequest::default(),
        }
    }

    fn record(&self, phase: &str) {
        self.log.lock().push(format!("{}:{}", phase, self.name));
    }
}

impl GeneratorNode for RecordingNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_setup(&mut self) -> EngineResult<()> {
        self.record("setup");
        if self.fail_setup {
            return Err(EngineError::SetupFailed {
                node: self.name.clone(),
                reason: "told to fail".to_string(),
            });
        }
        Ok(())
    }

    fn on_resize(&mut self) -> bool {
        self.record("resize");
        true
    }

    fn on_generate(&mut self) -> bool {
        self.record("generate");
        self.produces_data
    }

    fn on_cleanup(&mut self) {
        self.record("cleanup");
    }

    fn take_requests(&mut self) -> ScheduleRequest {
        std::mem::take(&mut self.requests)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn position(log: &[String], entry: &str) -> usize {
    log.iter()
        .position(|e| e == entry)
        .unwrap_or_else(|| panic!("'{}' missing from {:?}", entry, log))
}

fn count(log: &[String], entry: &str) -> usize {
    log.iter().filter(|e| *e == entry).count()
}

#[test]
fn test_first_tick_runs_phases_parent_first() {
    let log = Log::default();
    let mut tree = GeneratorTree::new();
    let root = tree.insert(RecordingNode::new("root", &log), None).unwrap();
    let child = tree.insert(RecordingNode::new("child", &log), Some(root)).unwrap();
    let grandchild = tree.insert(RecordingNode::new("grandchild", &log), Some(child)).unwrap();

    tree.tick().unwrap();

    let log = log.lock().clone();
    for phase in ["setup", "resize", "generate"] {
        let a = position(&log, &format!("{}:root", phase));
        let b = position(&log, &format!("{}:child", phase));
        let c = position(&log, &format!("{}:grandchild", phase));
        assert!(a < b && b < c, "{} out of order: {:?}", phase, log);
    }
    assert!(position(&log, "setup:grandchild") < position(&log, "resize:root"));
    assert!(position(&log, "resize:grandchild") < position(&log, "generate:root"));

    for handle in [root, child, grandchild] {
        assert_eq!(tree.state(handle).unwrap(), NodeState::Ready);
    }
}

#[test]
fn test_each_child_generates_exactly_once_per_tick() {
    let log = Log::default();
    let mut tree = GeneratorTree::new();
    let root = tree.insert(RecordingNode::new("root", &log), None).unwrap();
    let a = tree.insert(RecordingNode::new("a", &log), Some(root)).unwrap();
    let b = tree.insert(RecordingNode::new("b", &log), Some(root)).unwrap();
    tree.tick().unwrap();
    log.lock().clear();

    // Both children also ask for a generate of their own
    tree.schedule_generate(a).unwrap();
    tree.schedule_generate(b).unwrap();
    tree.schedule_generate(root).unwrap();
    tree.tick().unwrap();

    let log = log.lock().clone();
    assert_eq!(count(&log, "generate:root"), 1);
    assert_eq!(count(&log, "generate:a"), 1);
    assert_eq!(count(&log, "generate:b"), 1);
    assert!(position(&log, "generate:a") < position(&log, "generate:b"));
}

#[test]
fn test_children_wait_for_parent_data() {
    let log = Log::default();
    let mut tree = GeneratorTree::new();
    let mut root = RecordingNode::new("root", &log);
    root.produces_data = false;
    let root = tree.insert(root, None).unwrap();
    let child = tree.insert(RecordingNode::new("child", &log), Some(root)).unwrap();

    tree.tick().unwrap();
    {
        let log = log.lock();
        assert_eq!(count(&log, "generate:root"), 1);
        assert_eq!(count(&log, "generate:child"), 0);
    }

    // Scheduling the child directly still runs it
    tree.schedule_generate(child).unwrap();
    tree.tick().unwrap();
    assert_eq!(count(&log.lock(), "generate:child"), 1);
}

#[test]
fn test_stalled_parent_defers_child_request() {
    let log = Log::default();
    let mut tree = GeneratorTree::new();
    let root = tree.insert(RecordingNode::new("root", &log), None).unwrap();
    let child = tree.insert(RecordingNode::new("child", &log), Some(root)).unwrap();
    tree.tick().unwrap();
    log.lock().clear();

    // The parent runs dry while the child asks for a generate of its own
    tree.node_mut::<RecordingNode>(root).unwrap().produces_data = false;
    tree.schedule_generate(root).unwrap();
    tree.node_mut::<RecordingNode>(child).unwrap().requests = ScheduleRequest {
        resize: false,
        generate: true,
    };
    tree.tick().unwrap();
    {
        let log = log.lock();
        assert_eq!(count(&log, "generate:root"), 1);
        assert_eq!(count(&log, "generate:child"), 0);
    }

    // Nothing new is scheduled, the held request still runs
    tree.tick().unwrap();
    let log = log.lock().clone();
    assert_eq!(count(&log, "generate:root"), 1);
    assert_eq!(count(&log, "generate:child"), 1);
}

#[test]
fn test_child_setup_implies_parent_setup() {
    let log = Log::default();
    let mut tree = GeneratorTree::new();
    let root = tree.insert(RecordingNode::new("root", &log), None).unwrap();
    let child = tree.insert(RecordingNode::new("child", &log), Some(root)).unwrap();

    tree.tick().unwrap();
    for handle in tree.depth_first() {
        if tree.is_setup(handle) {
            if let Some(parent) = tree.parent(handle) {
                assert!(tree.is_setup(parent));
            }
        }
    }
    assert!(tree.is_setup(child));
}

#[test]
fn test_failed_setup_blocks_subtree_and_retries() {
    let log = Log::default();
    let mut tree = GeneratorTree::new();
    let events = tree.subscribe();
    let mut root = RecordingNode::new("root", &log);
    root.fail_setup = true;
    let root = tree.insert(root, None).unwrap();
    let child = tree.insert(RecordingNode::new("child", &log), Some(root)).unwrap();

    tree.tick().unwrap();
    assert_eq!(tree.state(root).unwrap(), NodeState::SetupFailed);
    assert!(!tree.is_setup(child));
    assert_eq!(count(&log.lock(), "generate:root"), 0);
    assert!(events
        .try_iter()
        .any(|e| matches!(e, GeneratorEvent::SetupFailed { node, .. } if node == root)));

    tree.node_mut::<RecordingNode>(root).unwrap().fail_setup = false;
    tree.schedule_generate(root).unwrap();
    tree.tick().unwrap();
    assert_eq!(tree.state(root).unwrap(), NodeState::Ready);
    assert!(tree.is_setup(child));
    assert_eq!(count(&log.lock(), "generate:child"), 1);
}

#[test]
fn test_requests_coalesce_into_one_generate() {
    let log = Log::default();
    let mut tree = GeneratorTree::new();
    let root = tree.insert(RecordingNode::new("root", &log), None).unwrap();
    tree.tick().unwrap();
    log.lock().clear();

    tree.node_mut::<RecordingNode>(root).unwrap().requests = ScheduleRequest::RESIZE_AND_GENERATE;
    tree.schedule_generate(root).unwrap();
    tree.schedule_resize(root).unwrap();
    tree.tick().unwrap();

    let log = log.lock().clone();
    assert_eq!(log, vec!["resize:root".to_string(), "generate:root".to_string()]);
}

#[test]
fn test_disable_cleans_up_and_enable_rebuilds() {
    let log = Log::default();
    let mut tree = GeneratorTree::new();
    let root = tree.insert(RecordingNode::new("root", &log), None).unwrap();
    let child = tree.insert(RecordingNode::new("child", &log), Some(root)).unwrap();
    tree.tick().unwrap();
    log.lock().clear();

    tree.set_enabled(root, false).unwrap();
    let cleaned = log.lock().clone();
    assert!(position(&cleaned, "cleanup:child") < position(&cleaned, "cleanup:root"));
    assert!(!tree.is_active(child));

    tree.tick().unwrap();
    assert_eq!(count(&log.lock(), "generate:root"), 0);

    tree.set_enabled(root, true).unwrap();
    tree.tick().unwrap();
    assert!(tree.is_setup(root));
    assert!(tree.is_setup(child));
    assert_eq!(count(&log.lock(), "generate:child"), 1);
}

#[test]
fn test_removed_child_is_pruned_on_next_setup() {
    let log = Log::default();
    let mut tree = GeneratorTree::new();
    let root = tree.insert(RecordingNode::new("root", &log), None).unwrap();
    let child = tree.insert(RecordingNode::new("child", &log), Some(root)).unwrap();
    tree.tick().unwrap();

    tree.remove(child).unwrap();
    assert!(!tree.contains(child));
    assert_eq!(tree.stored_child_count(root), 1);
    assert!(tree.children(root).is_empty());
    assert!(matches!(tree.state(child), Err(EngineError::StaleHandle { .. })));

    tree.setup(root).unwrap();
    assert_eq!(tree.stored_child_count(root), 0);
}

#[test]
fn test_reparent_under_own_subtree_is_rejected() {
    let log = Log::default();
    let mut tree = GeneratorTree::new();
    let root = tree.insert(RecordingNode::new("root", &log), None).unwrap();
    let child = tree.insert(RecordingNode::new("child", &log), Some(root)).unwrap();
    let other = tree.insert(RecordingNode::new("other", &log), None).unwrap();

    assert!(tree.reparent(root, Some(child)).is_err());
    tree.reparent(child, Some(other)).unwrap();
    assert_eq!(tree.parent(child), Some(other));
    assert_eq!(tree.depth_first(), vec![root, other, child]);
}
