//! Order-indexed intrusive free lists.
//!
//! Every frame index has one pre-allocated [`LinkNode`] in an array parallel
//! to the frame table, giving O(1) insert and unlink without any dynamic
//! allocation. A node is meaningful only while its frame is the head of a
//! free block that is linked into a list; on removal the links are cleared.
//!
//! Lists are keyed by order: list `k` holds the heads of all free blocks of
//! `2^k` frames. Which list a frame belongs to is determined solely by its
//! frame-table tag, the lists never store an order themselves.

/// Sentinel index marking the absence of a neighbour.
pub const NIL: u32 = u32::MAX;

/// Intrusive prev/next pair for one frame index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct LinkNode {
    prev: u32,
    next: u32,
}

impl LinkNode {
    const UNLINKED: LinkNode = LinkNode {
        prev: NIL,
        next: NIL,
    };
}

/// All free lists of the allocator, one per order.
pub struct FreeLists {
    nodes: &'static mut [LinkNode],
    heads: &'static mut [u32],
    tails: &'static mut [u32],
}

impl FreeLists {
    /// Build the lists over their bump-allocated backing arrays and reset
    /// them to the empty state.
    ///
    /// `nodes` must have one entry per frame, `heads` and `tails` one entry
    /// per order.
    pub fn new(
        nodes: &'static mut [LinkNode],
        heads: &'static mut [u32],
        tails: &'static mut [u32],
    ) -> Self {
        assert_eq!(heads.len(), tails.len());

        for node in nodes.iter_mut() {
            *node = LinkNode::UNLINKED;
        }
        for head in heads.iter_mut() {
            *head = NIL;
        }
        for tail in tails.iter_mut() {
            *tail = NIL;
        }

        Self {
            nodes,
            heads,
            tails,
        }
    }

    /// Returns whether the list for `order` has no entries.
    pub fn is_empty(&self, order: usize) -> bool {
        self.heads[order] == NIL
    }

    /// Append the frame `index` to the back of the list for `order`.
    ///
    /// The frame must not currently be linked into any list.
    pub fn push(&mut self, order: usize, index: u32) {
        let tail = self.tails[order];
        self.nodes[index as usize] = LinkNode {
            prev: tail,
            next: NIL,
        };

        if tail == NIL {
            self.heads[order] = index;
        } else {
            self.nodes[tail as usize].next = index;
        }
        self.tails[order] = index;
    }

    /// Unlink the frame `index` from the list for `order` and clear its
    /// links.
    pub fn remove(&mut self, order: usize, index: u32) {
        let LinkNode { prev, next } = self.nodes[index as usize];

        if prev != NIL {
            self.nodes[prev as usize].next = next;
        }
        if next != NIL {
            self.nodes[next as usize].prev = prev;
        }

        if self.heads[order] == index {
            self.heads[order] = next;
        }
        if self.tails[order] == index {
            self.tails[order] = prev;
        }

        self.nodes[index as usize] = LinkNode::UNLINKED;
    }

    /// Remove and return the first entry of the list for `order`.
    pub fn pop(&mut self, order: usize) -> Option<u32> {
        let head = self.heads[order];
        if head == NIL {
            return None;
        }

        self.remove(order, head);
        Some(head)
    }

    /// Iterate over the frame indices in the list for `order`, front to
    /// back.
    pub fn iter(&self, order: usize) -> Iter<'_> {
        Iter {
            lists: self,
            current: self.heads[order],
        }
    }
}

/// Iterator over the frame indices of one order's free list.
pub struct Iter<'list> {
    lists: &'list FreeLists,
    current: u32,
}

impl Iterator for Iter<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current == NIL {
            return None;
        }

        let index = self.current;
        self.current = self.lists.nodes[index as usize].next;
        Some(index)
    }
}
