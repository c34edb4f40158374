//! Ring of live tracked heap blocks.
//!
//! Blocks live in a slot table and link to each other by [`BlockId`], so a
//! block that moves in memory (realloc) keeps its id and its neighbours'
//! links stay valid. The registry is either empty (no anchor) or a single
//! circular doubly-linked ring holding every live block exactly once.

use serde::Serialize;

/// Where an allocation call came from. Never parsed, only reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Site {
    pub file: &'static str,
    pub func: &'static str,
    pub line: u32,
}

impl Site {
    #[must_use]
    pub const fn new(file: &'static str, func: &'static str, line: u32) -> Self {
        Self { file, func, line }
    }
}

impl std::fmt::Display for Site {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} ({})", self.file, self.line, self.func)
    }
}

/// Stable handle to a registry slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(usize);

/// Metadata for one live tracked allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapBlock {
    /// Payload address handed to the caller.
    pub addr: usize,
    /// Current payload size.
    pub size: usize,
    /// Site of the most recent allocate/realloc.
    pub site: Site,
    /// Unix seconds of the most recent allocate/realloc.
    pub time: u64,
    /// Payload size at original allocation.
    pub size0: usize,
    pub site0: Site,
    pub time0: u64,
    prev: BlockId,
    next: BlockId,
}

impl HeapBlock {
    /// A freshly allocated block; current and original fields agree.
    #[must_use]
    pub fn new(addr: usize, size: usize, site: Site, time: u64) -> Self {
        Self {
            addr,
            size,
            site,
            time,
            size0: size,
            site0: site,
            time0: time,
            prev: BlockId(0),
            next: BlockId(0),
        }
    }

    /// True once a realloc changed any tracked field.
    #[must_use]
    pub fn was_reallocated(&self) -> bool {
        self.size != self.size0 || self.site != self.site0 || self.time != self.time0
    }

    #[must_use]
    pub fn prev(&self) -> BlockId {
        self.prev
    }

    #[must_use]
    pub fn next(&self) -> BlockId {
        self.next
    }
}

#[derive(Debug, Default)]
pub struct BlockRegistry {
    slots: Vec<Option<HeapBlock>>,
    /// Vacant slot indices for reuse.
    free_slots: Vec<usize>,
    anchor: Option<BlockId>,
    len: usize,
}

impl BlockRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// First block of the ring, if any.
    #[must_use]
    pub fn anchor(&self) -> Option<BlockId> {
        self.anchor
    }

    #[must_use]
    pub fn get(&self, id: BlockId) -> Option<&HeapBlock> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    #[must_use]
    pub fn get_mut(&mut self, id: BlockId) -> Option<&mut HeapBlock> {
        self.slots.get_mut(id.0).and_then(Option::as_mut)
    }

    /// Link a block in just before the anchor (the tail of the ring). O(1).
    pub fn insert(&mut self, mut block: HeapBlock) -> BlockId {
        let id = match self.free_slots.pop() {
            Some(idx) => BlockId(idx),
            None => {
                self.slots.push(None);
                BlockId(self.slots.len() - 1)
            }
        };

        match self.anchor {
            None => {
                block.prev = id;
                block.next = id;
                self.anchor = Some(id);
            }
            Some(first) => {
                let last = self.link(first).prev;
                block.next = first;
                block.prev = last;
                self.link_mut(last).next = id;
                self.link_mut(first).prev = id;
            }
        }

        self.slots[id.0] = Some(block);
        self.len += 1;
        id
    }

    /// Unlink and return a block. `None` if the id is not live.
    pub fn remove(&mut self, id: BlockId) -> Option<HeapBlock> {
        let block = self.slots.get_mut(id.0)?.take()?;
        self.free_slots.push(id.0);
        self.len -= 1;

        if block.next == id {
            // Sole node.
            self.anchor = None;
            return Some(block);
        }

        if block.next == block.prev {
            // Two nodes: the survivor links to itself.
            let other = block.next;
            let node = self.link_mut(other);
            node.next = other;
            node.prev = other;
        } else {
            self.link_mut(block.prev).next = block.next;
            self.link_mut(block.next).prev = block.prev;
        }

        if self.anchor == Some(id) {
            self.anchor = Some(block.next);
        }
        Some(block)
    }

    /// Walk the ring once, starting at the anchor.
    #[must_use]
    pub fn iter(&self) -> RingIter<'_> {
        RingIter {
            registry: self,
            cursor: self.anchor,
            remaining: self.len,
        }
    }

    /// Verify that the links form one ring holding every live block once.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let live = self.slots.iter().filter(|s| s.is_some()).count();
        if live != self.len {
            return false;
        }
        let Some(first) = self.anchor else {
            return self.len == 0;
        };

        let mut seen = vec![false; self.slots.len()];
        let mut cursor = first;
        for _ in 0..self.len {
            let Some(block) = self.get(cursor) else {
                return false;
            };
            if seen[cursor.0] {
                return false;
            }
            seen[cursor.0] = true;
            match self.get(block.next) {
                Some(next) if next.prev == cursor => cursor = block.next,
                _ => return false,
            }
        }
        cursor == first
    }

    // Ring members are always occupied slots; these helpers index them
    // directly and treat a vacant slot as a broken invariant.
    fn link(&self, id: BlockId) -> &HeapBlock {
        match &self.slots[id.0] {
            Some(block) => block,
            None => panic!("ring link to vacant slot {}", id.0),
        }
    }

    fn link_mut(&mut self, id: BlockId) -> &mut HeapBlock {
        match &mut self.slots[id.0] {
            Some(block) => block,
            None => panic!("ring link to vacant slot {}", id.0),
        }
    }
}

/// One trip around the ring. Cloning restarts from the same position.
#[derive(Clone)]
pub struct RingIter<'a> {
    registry: &'a BlockRegistry,
    cursor: Option<BlockId>,
    remaining: usize,
}

impl<'a> Iterator for RingIter<'a> {
    type Item = (BlockId, &'a HeapBlock);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let id = self.cursor?;
        let block = self.registry.get(id)?;
        self.remaining -= 1;
        self.cursor = Some(block.next);
        Some((id, block))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for RingIter<'_> {}
