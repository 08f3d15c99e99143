// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An indexable binary min-heap.
//!
//! `Heap` orders opaque [`NodeId`] handles rather than values. The records the
//! handles name live somewhere else (typically a `Vec` owned by the caller,
//! indexed by [`NodeId::index`]), and every operation that needs to compare
//! two nodes takes a `less` closure that looks the records up.
//!
//! Because the heap remembers where each node currently sits in its backing
//! array, a node can be removed from the middle of the heap in O(log n)
//! without a search. This is what lets a timer be re-keyed: remove it, change
//! its deadline, insert it again.
//!
//! The usage model is:
//!
//! - Keep your records in an arena and hand out `NodeId::new(index)`.
//!
//! - Call `insert`, `remove` and `pop` with a comparator over the arena.
//!
//! - Never change a key while its node is in the heap. The heap will not
//!   notice, and the ordering will be silently wrong from then on.
//!
//! `less` must be a strict weak ordering. Nodes that compare equal come out in
//! an unspecified order.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::vec::Vec;
use core::fmt;

/// Handle naming one record in the caller's arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(usize);

impl NodeId {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node {}", self.0)
    }
}

/// Errors returned by [`Heap`] operations.
///
/// Apart from `AllocationFailure`, these all indicate a bug in the caller.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HeapError {
    /// The backing storage could not grow.
    AllocationFailure,
    /// The node is not currently in this heap.
    InvalidNode(NodeId),
    /// The node is already in this heap.
    AlreadyQueued(NodeId),
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllocationFailure => f.write_str("heap storage exhausted"),
            Self::InvalidNode(n) => write!(f, "{n} is not in the heap"),
            Self::AlreadyQueued(n) => write!(f, "{n} is already in the heap"),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Heap {
    /// Heap-ordered array; `order[0]` is the minimum.
    order: Vec<NodeId>,
    /// Indexed by `NodeId`: where that node sits in `order`, if anywhere.
    positions: Vec<Option<usize>>,
}

impl Heap {
    pub const fn new() -> Self {
        Self {
            order: Vec::new(),
            positions: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Returns the minimum node without removing it.
    pub fn min(&self) -> Option<NodeId> {
        self.order.first().copied()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.position(node).is_some()
    }

    /// Returns the index of `node` in the backing array, if it is resident.
    ///
    /// The recorded position is only trusted if the array agrees with it, so a
    /// stale entry can't make a foreign node look resident.
    pub fn position(&self, node: NodeId) -> Option<usize> {
        let pos = (*self.positions.get(node.0)?)?;
        (self.order.get(pos) == Some(&node)).then_some(pos)
    }

    /// Iterates over resident nodes in array order (not sorted order).
    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.order.iter().copied()
    }

    pub fn clear(&mut self) {
        for node in self.order.drain(..) {
            self.positions[node.0] = None;
        }
    }

    /// Adds `node` to the heap.
    pub fn insert<F>(
        &mut self,
        node: NodeId,
        mut less: F,
    ) -> Result<(), HeapError>
    where
        F: FnMut(NodeId, NodeId) -> bool,
    {
        if self.contains(node) {
            return Err(HeapError::AlreadyQueued(node));
        }

        if node.0 >= self.positions.len() {
            // A table covering `usize::MAX` can't be allocated either.
            let needed = node
                .0
                .checked_add(1)
                .ok_or(HeapError::AllocationFailure)?;
            self.positions
                .try_reserve(needed - self.positions.len())
                .map_err(|_| HeapError::AllocationFailure)?;
            self.positions.resize(needed, None);
        }
        // `Vec` grows geometrically, so this is amortized O(1).
        self.order
            .try_reserve(1)
            .map_err(|_| HeapError::AllocationFailure)?;

        let pos = self.order.len();
        self.order.push(node);
        self.positions[node.0] = Some(pos);
        self.sift_up(pos, &mut less);
        Ok(())
    }

    /// Removes `node`, which may be anywhere in the heap.
    pub fn remove<F>(
        &mut self,
        node: NodeId,
        mut less: F,
    ) -> Result<(), HeapError>
    where
        F: FnMut(NodeId, NodeId) -> bool,
    {
        let pos = self.position(node).ok_or(HeapError::InvalidNode(node))?;
        self.take_at(pos, &mut less);
        Ok(())
    }

    /// Removes and returns the minimum node.
    pub fn pop<F>(&mut self, mut less: F) -> Option<NodeId>
    where
        F: FnMut(NodeId, NodeId) -> bool,
    {
        let top = self.min()?;
        self.take_at(0, &mut less);
        Some(top)
    }

    /// Checks the heap property and the position table.
    pub fn is_valid<F>(&self, mut less: F) -> bool
    where
        F: FnMut(NodeId, NodeId) -> bool,
    {
        let ordered = (1..self.order.len())
            .all(|i| !less(self.order[i], self.order[parent(i)]));
        let indexed = self
            .order
            .iter()
            .enumerate()
            .all(|(i, n)| self.positions.get(n.0) == Some(&Some(i)));
        let resident = self.positions.iter().filter(|p| p.is_some()).count();
        ordered && indexed && resident == self.order.len()
    }

    fn take_at<F>(&mut self, pos: usize, less: &mut F)
    where
        F: FnMut(NodeId, NodeId) -> bool,
    {
        let last = self.order.len() - 1;
        self.swap(pos, last);
        if let Some(gone) = self.order.pop() {
            self.positions[gone.0] = None;
        }

        // If we removed the last element there's nothing left to repair.
        if pos < self.order.len() {
            if pos > 0 && less(self.order[pos], self.order[parent(pos)]) {
                self.sift_up(pos, less);
            } else {
                self.sift_down(pos, less);
            }
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.order.swap(a, b);
        self.positions[self.order[a].0] = Some(a);
        self.positions[self.order[b].0] = Some(b);
    }

    fn sift_up<F>(&mut self, mut pos: usize, less: &mut F)
    where
        F: FnMut(NodeId, NodeId) -> bool,
    {
        while pos > 0 {
            let up = parent(pos);
            if !less(self.order[pos], self.order[up]) {
                break;
            }
            self.swap(pos, up);
            pos = up;
        }
    }

    fn sift_down<F>(&mut self, mut pos: usize, less: &mut F)
    where
        F: FnMut(NodeId, NodeId) -> bool,
    {
        let len = self.order.len();
        loop {
            let left = 2 * pos + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let child =
                if right < len && less(self.order[right], self.order[left]) {
                    right
                } else {
                    left
                };
            if !less(self.order[child], self.order[pos]) {
                break;
            }
            self.swap(pos, child);
            pos = child;
        }
    }
}

fn parent(pos: usize) -> usize {
    (pos - 1) / 2
}
