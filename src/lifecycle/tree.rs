//! Explicit generator tree and the per-tick scheduler

use crate::error::{EngineError, EngineResult};
use crate::lifecycle::{EventBus, GeneratorEvent, GeneratorNode, NodeArena, NodeHandle, NodeState, ScheduleRequest};
use crossbeam_channel::Receiver;

struct NodeEntry {
    node: Box<dyn GeneratorNode>,
    parent: Option<NodeHandle>,
    /// May hold stale handles until the next setup prunes them
    children: Vec<NodeHandle>,
    state: NodeState,
    enabled: bool,
    pending: ScheduleRequest,
}

/// Owns generator nodes and runs their Setup → Resize → Generate phases
/// parent-before-child.
#[derive(Default)]
pub struct GeneratorTree {
    arena: NodeArena<NodeEntry>,
    roots: Vec<NodeHandle>,
    events: EventBus,
}

impl GeneratorTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// Receive lifecycle events from now on
    pub fn subscribe(&mut self) -> Receiver<GeneratorEvent> {
        self.events.subscribe()
    }

    /// Add a node under `parent` (or as a root). New nodes are scheduled for
    /// resize and generate on the next tick.
    pub fn insert(&mut self, node: impl GeneratorNode, parent: Option<NodeHandle>) -> EngineResult<NodeHandle> {
        if let Some(parent) = parent {
            self.entry(parent)?;
        }
        let name = node.name().to_string();
        let handle = self.arena.insert(NodeEntry {
            node: Box::new(node),
            parent,
            children: Vec::new(),
            state: NodeState::Uninitialized,
            enabled: true,
            pending: ScheduleRequest::RESIZE_AND_GENERATE,
        });
        match parent {
            Some(parent) => self.entry_mut(parent)?.children.push(handle),
            None => self.roots.push(handle),
        }
        log::debug!("[GeneratorTree] Inserted '{}' as {:?} under {:?}", name, handle, parent);
        Ok(handle)
    }

    /// Move a node (with its subtree) under a new parent
    pub fn reparent(&mut self, handle: NodeHandle, new_parent: Option<NodeHandle>) -> EngineResult<()> {
        let old_parent = self.entry(handle)?.parent;
        if let Some(parent) = new_parent {
            self.entry(parent)?;
            if self.is_ancestor_or_self(handle, parent) {
                return Err(EngineError::InvalidConfig {
                    field: "parent".to_string(),
                    value: format!("{:?}", parent),
                    reason: "a node cannot be parented under its own subtree".to_string(),
                });
            }
        }
        if old_parent == new_parent {
            return Ok(());
        }

        match old_parent {
            Some(old) => {
                if let Some(entry) = self.arena.get_mut(old) {
                    entry.children.retain(|c| *c != handle);
                }
            }
            None => self.roots.retain(|r| *r != handle),
        }
        match new_parent {
            Some(parent) => self.entry_mut(parent)?.children.push(handle),
            None => self.roots.push(handle),
        }

        let entry = self.entry_mut(handle)?;
        entry.parent = new_parent;
        entry.pending.merge(ScheduleRequest::RESIZE_AND_GENERATE);
        Ok(())
    }

    /// Tear down and drop a node and its whole subtree. The parent's child
    /// list keeps the dead handle until its next setup.
    pub fn remove(&mut self, handle: NodeHandle) -> EngineResult<()> {
        self.cleanup(handle)?;
        let subtree = self.subtree(handle);
        if self.entry(handle)?.parent.is_none() {
            self.roots.retain(|r| *r != handle);
        }
        for node in subtree {
            if let Some(entry) = self.arena.remove(node) {
                log::debug!("[GeneratorTree] Removed '{}'", entry.node.name());
            }
        }
        Ok(())
    }

    /// Run setup on a node, then on every live child if it succeeded.
    /// Returns whether this node is now set up.
    pub fn setup(&mut self, handle: NodeHandle) -> EngineResult<bool> {
        if let Some(parent) = self.entry(handle)?.parent {
            if !self.is_setup(parent) {
                return Ok(false);
            }
        }
        let children = self.live_children(handle)?;
        let entry = self.entry_mut(handle)?;
        entry.children = children.clone();

        let result = entry.node.on_setup();
        let name = entry.node.name().to_string();
        match result {
            Ok(()) => {
                entry.state = NodeState::Ready;
                log::info!("[GeneratorTree] '{}' set up", name);
                self.events.emit(GeneratorEvent::SetupSucceeded { node: handle, name });
                for child in children {
                    self.setup(child)?;
                }
                Ok(true)
            }
            Err(e) => {
                entry.state = NodeState::SetupFailed;
                log::warn!("[GeneratorTree] Setup of '{}' failed: {}", name, e);
                self.events.emit(GeneratorEvent::SetupFailed {
                    node: handle,
                    name,
                    reason: e.to_string(),
                });
                Ok(false)
            }
        }
    }

    /// Resize a node, then its children regardless of whether it changed.
    /// Returns whether this node reported resized data.
    pub fn resize(&mut self, handle: NodeHandle) -> EngineResult<bool> {
        self.entry(handle)?;
        if !self.is_active(handle) {
            return Ok(false);
        }
        if self.entry(handle)?.state != NodeState::Ready {
            self.setup(handle)?;
        }

        let entry = self.entry_mut(handle)?;
        entry.pending.resize = false;
        if entry.state != NodeState::Ready {
            return Ok(false);
        }
        let resized = entry.node.on_resize();
        if resized {
            self.events.emit(GeneratorEvent::DataResized { node: handle });
        }

        for child in self.live_children(handle)? {
            self.resize(child)?;
        }
        Ok(resized)
    }

    /// Generate on a node; children only follow when it produced data
    pub fn generate(&mut self, handle: NodeHandle) -> EngineResult<bool> {
        self.entry(handle)?;
        if !self.is_active(handle) {
            return Ok(false);
        }
        self.entry_mut(handle)?.pending.generate = false;

        if self.entry(handle)?.state != NodeState::Ready {
            self.setup(handle)?;
            self.resize(handle)?;
            if self.entry(handle)?.state != NodeState::Ready {
                return Ok(false);
            }
        }

        let entry = self.entry_mut(handle)?;
        if !entry.node.can_generate() || !entry.node.on_generate() {
            return Ok(false);
        }
        self.events.emit(GeneratorEvent::DataGenerated { node: handle });

        for child in self.live_children(handle)? {
            self.generate(child)?;
        }
        Ok(true)
    }

    /// Release resources of a subtree, children first
    pub fn cleanup(&mut self, handle: NodeHandle) -> EngineResult<()> {
        for child in self.live_children(handle)? {
            self.cleanup(child)?;
        }
        let entry = self.entry_mut(handle)?;
        if entry.state != NodeState::Uninitialized {
            entry.node.on_cleanup();
            entry.state = NodeState::Uninitialized;
            self.events.emit(GeneratorEvent::CleanedUp { node: handle });
        }
        Ok(())
    }

    pub fn schedule_resize(&mut self, handle: NodeHandle) -> EngineResult<()> {
        self.entry_mut(handle)?.pending.resize = true;
        Ok(())
    }

    pub fn schedule_generate(&mut self, handle: NodeHandle) -> EngineResult<()> {
        self.entry_mut(handle)?.pending.generate = true;
        Ok(())
    }

    /// Disabling tears the subtree down; enabling schedules a rebuild
    pub fn set_enabled(&mut self, handle: NodeHandle, enabled: bool) -> EngineResult<()> {
        let entry = self.entry_mut(handle)?;
        if entry.enabled == enabled {
            return Ok(());
        }
        entry.enabled = enabled;
        if enabled {
            entry.pending.merge(ScheduleRequest::RESIZE_AND_GENERATE);
            Ok(())
        } else {
            self.cleanup(handle)
        }
    }

    /// One scheduling tick: collect requests, run the resize sweep, then the
    /// generate sweep with per-node updates. Both sweeps are depth-first and
    /// parent-first, and each node's flags clear when its phase runs. A
    /// generate held back by a stalled ancestor stays pending for the next tick.
    pub fn tick(&mut self) -> EngineResult<()> {
        let order = self.depth_first();

        for handle in &order {
            if let Some(entry) = self.arena.get_mut(*handle) {
                let request = entry.node.take_requests();
                entry.pending.merge(request);
            }
        }

        for handle in &order {
            if self.arena.get(*handle).is_some_and(|e| e.pending.resize) {
                self.resize(*handle)?;
            }
        }

        // Nodes whose generate produced nothing this tick hold back their subtree
        let mut stalled: Vec<NodeHandle> = Vec::new();
        for handle in &order {
            let pending = self.arena.get(*handle).is_some_and(|e| e.pending.generate);
            if pending && !self.has_ancestor_in(*handle, &stalled) && !self.generate(*handle)? {
                stalled.push(*handle);
            }
            if self.is_active(*handle) {
                if let Some(entry) = self.arena.get_mut(*handle) {
                    entry.node.on_update();
                }
            }
        }
        Ok(())
    }

    pub fn state(&self, handle: NodeHandle) -> EngineResult<NodeState> {
        Ok(self.entry(handle)?.state)
    }

    pub fn is_setup(&self, handle: NodeHandle) -> bool {
        self.arena
            .get(handle)
            .is_some_and(|e| e.state == NodeState::Ready)
    }

    pub fn contains(&self, handle: NodeHandle) -> bool {
        self.arena.contains(handle)
    }

    pub fn parent(&self, handle: NodeHandle) -> Option<NodeHandle> {
        self.arena.get(handle)?.parent
    }

    /// Live children in insertion order
    pub fn children(&self, handle: NodeHandle) -> Vec<NodeHandle> {
        self.live_children(handle).unwrap_or_default()
    }

    /// Number of child handles stored, including stale ones not yet pruned
    pub fn stored_child_count(&self, handle: NodeHandle) -> usize {
        self.arena.get(handle).map_or(0, |e| e.children.len())
    }

    pub fn roots(&self) -> &[NodeHandle] {
        &self.roots
    }

    /// Enabled and every ancestor enabled
    pub fn is_active(&self, handle: NodeHandle) -> bool {
        let mut current = Some(handle);
        while let Some(h) = current {
            match self.arena.get(h) {
                Some(entry) if entry.enabled => current = entry.parent,
                _ => return false,
            }
        }
        true
    }

    /// Typed access to a node
    pub fn node<T: GeneratorNode>(&self, handle: NodeHandle) -> Option<&T> {
        self.arena.get(handle)?.node.as_any().downcast_ref::<T>()
    }

    pub fn node_mut<T: GeneratorNode>(&mut self, handle: NodeHandle) -> Option<&mut T> {
        self.arena.get_mut(handle)?.node.as_any_mut().downcast_mut::<T>()
    }

    /// All live nodes, parents before children
    pub fn depth_first(&self) -> Vec<NodeHandle> {
        let mut order = Vec::with_capacity(self.arena.len());
        let mut stack: Vec<NodeHandle> = self.roots.iter().rev().copied().collect();
        while let Some(handle) = stack.pop() {
            if let Some(entry) = self.arena.get(handle) {
                order.push(handle);
                stack.extend(entry.children.iter().rev().copied());
            }
        }
        order
    }

    fn entry(&self, handle: NodeHandle) -> EngineResult<&NodeEntry> {
        self.arena.get(handle).ok_or(EngineError::StaleHandle {
            index: handle.index,
            generation: handle.generation,
        })
    }

    fn entry_mut(&mut self, handle: NodeHandle) -> EngineResult<&mut NodeEntry> {
        self.arena.get_mut(handle).ok_or(EngineError::StaleHandle {
            index: handle.index,
            generation: handle.generation,
        })
    }

    fn live_children(&self, handle: NodeHandle) -> EngineResult<Vec<NodeHandle>> {
        Ok(self
            .entry(handle)?
            .children
            .iter()
            .copied()
            .filter(|c| self.arena.contains(*c))
            .collect())
    }

    fn subtree(&self, handle: NodeHandle) -> Vec<NodeHandle> {
        let mut nodes = Vec::new();
        let mut stack = vec![handle];
        while let Some(h) = stack.pop() {
            if let Some(entry) = self.arena.get(h) {
                nodes.push(h);
                stack.extend(entry.children.iter().copied());
            }
        }
        nodes
    }

    fn has_ancestor_in(&self, node: NodeHandle, set: &[NodeHandle]) -> bool {
        let mut current = self.parent(node);
        while let Some(h) = current {
            if set.contains(&h) {
                return true;
            }
            current = self.parent(h);
        }
        false
    }

    fn is_ancestor_or_self(&self, ancestor: NodeHandle, node: NodeHandle) -> bool {
        let mut current = Some(node);
        while let Some(h) = current {
            if h == ancestor {
                return true;
            }
            current = self.arena.get(h).and_then(|e| e.parent);
        }
        false
    }
}
