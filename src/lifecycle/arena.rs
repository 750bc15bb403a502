//! Slot arena with generation-checked handles

/// Handle to a node slot, with generation to detect use-after-remove
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle {
    /// Index into the slot array
    pub index: u32,
    /// Generation counter to detect stale handles
    pub generation: u32,
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Dense slot storage with a free list for recycling
pub struct NodeArena<T> {
    slots: Vec<Slot<T>>,
    free_list: Vec<u32>,
    count: usize,
}

impl<T> Default for NodeArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> NodeArena<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn insert(&mut self, value: T) -> NodeHandle {
        self.count += 1;
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return NodeHandle {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        NodeHandle { index, generation: 0 }
    }

    /// Remove the value; the slot's generation is bumped so old handles die
    pub fn remove(&mut self, handle: NodeHandle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(handle.index);
        self.count -= 1;
        Some(value)
    }

    /// O(1) liveness check
    pub fn contains(&self, handle: NodeHandle) -> bool {
        self.get(handle).is_some()
    }

    pub fn get(&self, handle: NodeHandle) -> Option<&T> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn get_mut(&mut self, handle: NodeHandle) -> Option<&mut T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_mut()
    }

    /// Live handles in slot order
    pub fn handles(&self) -> impl Iterator<Item = NodeHandle> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|_| NodeHandle {
                index: index as u32,
                generation: slot.generation,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_removed_handle_goes_stale_after_reuse() {
        let mut arena = NodeArena::new();
        let first = arena.insert("a");
        assert_eq!(arena.remove(first), Some("a"));

        let second = arena.insert("b");
        assert_eq!(second.index, first.index);
        assert_ne!(second.generation, first.generation);
        assert!(!arena.contains(first));
        assert_eq!(arena.get(second), Some(&"b"));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_double_remove_is_rejected() {
        let mut arena = NodeArena::new();
        let handle = arena.insert(1);
        assert!(arena.remove(handle).is_some());
        assert!(arena.remove(handle).is_none());
        assert!(arena.is_empty());
    }
}
