//! Routing-table sequence with stable chunk handles
//!
//! The move-and-merge phase holds references to individual chunks across
//! arbitrary interior deletions, so the collection's chunk sequence is kept
//! as an arena-backed doubly-linked list. A [`ChunkRef`] stays valid until
//! its chunk is explicitly removed; slots are never reused within one phase,
//! so a handle can never alias a different chunk.

use tessera_core::{ChunkRange, ShardId};

/// Live state of one chunk while a phase is running.
#[derive(Debug, Clone)]
pub(crate) struct ChunkState {
    pub range: ChunkRange,
    pub shard: ShardId,
    pub estimated_size_bytes: u64,
    /// Set while the chunk is referenced by an in-flight action.
    pub busy: bool,
}

/// Stable handle to a chunk in a [`ChunkList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ChunkRef(usize);

struct Slot {
    state: ChunkState,
    prev: Option<usize>,
    next: Option<usize>,
    live: bool,
}

/// Doubly-linked chunk sequence in key order.
pub(crate) struct ChunkList {
    slots: Vec<Slot>,
    head: Option<usize>,
    len: usize,
}

impl ChunkList {
    /// Build the sequence from chunks already sorted by range min.
    pub fn from_sorted(states: Vec<ChunkState>) -> Self {
        let len = states.len();
        let slots = states
            .into_iter()
            .enumerate()
            .map(|(i, state)| Slot {
                state,
                prev: i.checked_sub(1),
                next: if i + 1 < len { Some(i + 1) } else { None },
                live: true,
            })
            .collect();
        Self {
            slots,
            head: if len > 0 { Some(0) } else { None },
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, r: ChunkRef) -> &ChunkState {
        &self.slots[r.0].state
    }

    pub fn get_mut(&mut self, r: ChunkRef) -> &mut ChunkState {
        &mut self.slots[r.0].state
    }

    pub fn prev(&self, r: ChunkRef) -> Option<ChunkRef> {
        self.slots[r.0].prev.map(ChunkRef)
    }

    pub fn next(&self, r: ChunkRef) -> Option<ChunkRef> {
        self.slots[r.0].next.map(ChunkRef)
    }

    /// Unlink a chunk. Handles to the other chunks stay valid; the removed
    /// handle must not be used again.
    pub fn remove(&mut self, r: ChunkRef) {
        if !self.slots[r.0].live {
            return;
        }
        let (prev, next) = (self.slots[r.0].prev, self.slots[r.0].next);
        if let Some(p) = prev {
            self.slots[p].next = next;
        } else {
            self.head = next;
        }
        if let Some(n) = next {
            self.slots[n].prev = prev;
        }
        self.slots[r.0].prev = None;
        self.slots[r.0].next = None;
        self.slots[r.0].live = false;
        self.len -= 1;
    }

    /// Handles of the live chunks in key order.
    pub fn refs(&self) -> impl Iterator<Item = ChunkRef> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let current = cursor?;
            cursor = self.slots[current].next;
            Some(ChunkRef(current))
        })
    }
}
