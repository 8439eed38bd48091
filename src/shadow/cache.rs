use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Identifies the content a shadow map was rendered with
///
/// A retained slot whose stamp still matches can be sampled without drawing
/// it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShadowStamp {
    pub light_revision: u64,
    pub scene_revision: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListKind {
    Detached,
    Used,
    Retained,
}

#[derive(Debug)]
struct EntryNode {
    slot: Option<u32>,
    list: ListKind,
    prev: Option<usize>,
    next: Option<usize>,
    rendered: Option<ShadowStamp>,
}

impl EntryNode {
    fn new() -> Self {
        Self {
            slot: None,
            list: ListKind::Detached,
            prev: None,
            next: None,
            rendered: None,
        }
    }
}

/// Index-linked list over the entry arena; head is the most recent
#[derive(Debug, Default, Clone, Copy)]
struct List {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

#[derive(Debug)]
struct SlotArena {
    entries: Vec<Option<EntryNode>>,
    vacant_entries: Vec<usize>,
    used: List,
    retained: List,
    /// Unassigned slot indices; popped from the back
    free_slots: Vec<u32>,
}

impl SlotArena {
    fn new(capacity: u32) -> Self {
        Self {
            entries: Vec::new(),
            vacant_entries: Vec::new(),
            used: List::default(),
            retained: List::default(),
            free_slots: (0..capacity).rev().collect(),
        }
    }

    fn node(&self, id: usize) -> Option<&EntryNode> {
        self.entries.get(id).and_then(|e| e.as_ref())
    }

    fn node_mut(&mut self, id: usize) -> Option<&mut EntryNode> {
        self.entries.get_mut(id).and_then(|e| e.as_mut())
    }

    fn list_mut(&mut self, kind: ListKind) -> Option<&mut List> {
        match kind {
            ListKind::Used => Some(&mut self.used),
            ListKind::Retained => Some(&mut self.retained),
            ListKind::Detached => None,
        }
    }

    fn insert(&mut self) -> usize {
        match self.vacant_entries.pop() {
            Some(id) => {
                self.entries[id] = Some(EntryNode::new());
                id
            }
            None => {
                self.entries.push(Some(EntryNode::new()));
                self.entries.len() - 1
            }
        }
    }

    fn unlink(&mut self, id: usize) {
        let Some((kind, prev, next)) = self.node(id).map(|n| (n.list, n.prev, n.next)) else {
            return;
        };
        if kind == ListKind::Detached {
            return;
        }

        match prev {
            Some(p) => {
                if let Some(node) = self.node_mut(p) {
                    node.next = next;
                }
            }
            None => {
                if let Some(list) = self.list_mut(kind) {
                    list.head = next;
                }
            }
        }
        match next {
            Some(n) => {
                if let Some(node) = self.node_mut(n) {
                    node.prev = prev;
                }
            }
            None => {
                if let Some(list) = self.list_mut(kind) {
                    list.tail = prev;
                }
            }
        }
        if let Some(list) = self.list_mut(kind) {
            list.len -= 1;
        }
        if let Some(node) = self.node_mut(id) {
            node.list = ListKind::Detached;
            node.prev = None;
            node.next = None;
        }
    }

    fn push_front(&mut self, id: usize, kind: ListKind) {
        let Some(list) = self.list_mut(kind) else {
            return;
        };
        let old_head = list.head;
        list.head = Some(id);
        if list.tail.is_none() {
            list.tail = Some(id);
        }
        list.len += 1;

        if let Some(h) = old_head {
            if let Some(node) = self.node_mut(h) {
                node.prev = Some(id);
            }
        }
        if let Some(node) = self.node_mut(id) {
            node.list = kind;
            node.prev = None;
            node.next = old_head;
        }
    }

    /// Splice the whole used list in front of the retained list
    fn retire_used(&mut self) {
        let used = std::mem::take(&mut self.used);
        let (Some(used_head), Some(used_tail)) = (used.head, used.tail) else {
            return;
        };

        let mut cursor = Some(used_head);
        while let Some(id) = cursor {
            let Some(node) = self.node_mut(id) else {
                break;
            };
            node.list = ListKind::Retained;
            cursor = node.next;
        }

        let old_head = self.retained.head;
        if let Some(node) = self.node_mut(used_tail) {
            node.next = old_head;
        }
        match old_head {
            Some(h) => {
                if let Some(node) = self.node_mut(h) {
                    node.prev = Some(used_tail);
                }
            }
            None => self.retained.tail = Some(used_tail),
        }
        self.retained.head = Some(used_head);
        self.retained.len += used.len;
    }

    /// Take a slot away from the least recently used retained entry
    fn evict_retained(&mut self) -> Option<u32> {
        while let Some(victim) = self.retained.tail {
            self.unlink(victim);
            let Some(node) = self.node_mut(victim) else {
                break;
            };
            node.rendered = None;
            if let Some(slot) = node.slot.take() {
                log::trace!("Shadow slot {} evicted from entry {}", slot, victim);
                return Some(slot);
            }
        }
        None
    }

    fn assign_indexes(&mut self) {
        let mut cursor = self.used.head;
        while let Some(id) = cursor {
            let Some((next, has_slot)) = self.node(id).map(|n| (n.next, n.slot.is_some())) else {
                break;
            };
            cursor = next;
            if has_slot {
                continue;
            }

            let slot = self.free_slots.pop().or_else(|| self.evict_retained());
            match slot {
                Some(slot) => {
                    if let Some(node) = self.node_mut(id) {
                        node.slot = Some(slot);
                        node.rendered = None;
                    }
                }
                None => {
                    // Pool exhausted: this light goes unshadowed this frame
                    log::trace!("No shadow slot left for entry {}", id);
                    self.unlink(id);
                }
            }
        }
    }

    fn release(&mut self, id: usize) {
        self.unlink(id);
        if let Some(node) = self.entries.get_mut(id).and_then(|e| e.take()) {
            if let Some(slot) = node.slot {
                self.free_slots.push(slot);
            }
            self.vacant_entries.push(id);
        }
    }
}

/// Fixed-capacity pool of shadow map slots
///
/// The cache only tracks indices; the layers themselves live in the shadow
/// map array texture owned by the shadow paging pass.
pub struct ShadowSlotCache {
    arena: Arc<Mutex<SlotArena>>,
    capacity: u32,
}

impl ShadowSlotCache {
    pub fn new(capacity: u32) -> Self {
        Self {
            arena: Arc::new(Mutex::new(SlotArena::new(capacity))),
            capacity,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Create an entry for a light; it holds no slot until it is used and assigned
    pub fn create_entry(&self) -> ShadowEntry {
        let id = self.arena.lock().insert();
        ShadowEntry {
            arena: Arc::downgrade(&self.arena),
            id,
        }
    }

    /// Move every used entry to the retained list, most recent first
    pub fn start_frame(&mut self) {
        self.arena.lock().retire_used();
    }

    /// Give a slot to every used entry lacking one
    ///
    /// Free slots go first, then slots of the least recently used retained
    /// entries. Entries left without a slot are dropped from the used list.
    pub fn assign_indexes(&mut self) {
        self.arena.lock().assign_indexes();
    }

    pub fn used_count(&self) -> usize {
        self.arena.lock().used.len
    }

    pub fn retained_count(&self) -> usize {
        self.arena.lock().retained.len
    }

    pub fn free_count(&self) -> usize {
        self.arena.lock().free_slots.len()
    }

    /// Number of live entries holding a slot
    pub fn assigned_count(&self) -> usize {
        self.arena
            .lock()
            .entries
            .iter()
            .flatten()
            .filter(|n| n.slot.is_some())
            .count()
    }
}

/// A light's handle into the [`ShadowSlotCache`]
///
/// Dropping the entry returns its slot to the free pool immediately.
pub struct ShadowEntry {
    arena: Weak<Mutex<SlotArena>>,
    id: usize,
}

impl ShadowEntry {
    /// Mark the entry as needed this frame, moving it to the head of the used list
    pub fn use_in_frame(&self) {
        if let Some(arena) = self.arena.upgrade() {
            let mut arena = arena.lock();
            arena.unlink(self.id);
            arena.push_front(self.id, ListKind::Used);
        }
    }

    /// Assigned slot, if any
    pub fn slot(&self) -> Option<u32> {
        let arena = self.arena.upgrade()?;
        let arena = arena.lock();
        arena.node(self.id)?.slot
    }

    /// Slot as a signed shader index, -1 when unassigned
    pub fn index(&self) -> i32 {
        self.slot().map_or(-1, |s| s as i32)
    }

    /// Whether the slot must be drawn for content identified by `stamp`
    pub fn needs_render(&self, stamp: ShadowStamp) -> bool {
        let Some(arena) = self.arena.upgrade() else {
            return false;
        };
        let arena = arena.lock();
        match arena.node(self.id) {
            Some(node) => node.slot.is_some() && node.rendered != Some(stamp),
            None => false,
        }
    }

    pub fn mark_rendered(&self, stamp: ShadowStamp) {
        if let Some(arena) = self.arena.upgrade() {
            if let Some(node) = arena.lock().node_mut(self.id) {
                node.rendered = Some(stamp);
            }
        }
    }
}

impl Drop for ShadowEntry {
    fn drop(&mut self) {
        if let Some(arena) = self.arena.upgrade() {
            arena.lock().release(self.id);
        }
    }
}

impl std::fmt::Debug for ShadowEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShadowEntry")
            .field("id", &self.id)
            .field("slot", &self.slot())
            .finish()
    }
}
