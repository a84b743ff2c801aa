// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Fixed-capacity node store plus the three intrusive orderings maintained
//! over it.
//!
//! The three orderings are not redundant: POC order drives output, POC-LSB
//! order supports wrap disambiguation, and decode order drives marking and
//! cleanup sweeps (sliding-window eviction is a decode-order process, not a
//! POC-order one). Links are arena indices rather than pointers, so a node
//! never aliases outside the arena.

use thiserror::Error;

use crate::node::DpbNode;
use crate::node::NodeIndex;

/// One of the three orderings maintained over the live nodes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Order {
    /// Sorted by `frame_poc`.
    Poc = 0,
    /// Sorted by `poc_lsb`, ties kept in insertion order.
    PocLsb = 1,
    /// Arrival order, append-only.
    Decode = 2,
}

const NUM_ORDERS: usize = 3;

#[derive(Debug, Error)]
pub enum InsertError {
    #[error("node arena is full ({capacity} slots)")]
    Full { capacity: usize },
}

#[derive(Copy, Clone, Debug, Default)]
struct Links {
    prev: Option<NodeIndex>,
    next: Option<NodeIndex>,
}

#[derive(Debug)]
struct Slot {
    node: DpbNode,
    links: [Links; NUM_ORDERS],
    live: bool,
}

/// Arena of per-picture nodes. Sole owner of node memory; a [`NodeIndex`] is
/// stable for the whole live span of its picture.
#[derive(Debug)]
pub struct NodeArena {
    slots: Vec<Slot>,
    heads: [Option<NodeIndex>; NUM_ORDERS],
    tails: [Option<NodeIndex>; NUM_ORDERS],
    live: usize,
}

impl NodeArena {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Slot {
                node: DpbNode::default(),
                links: [Links::default(); NUM_ORDERS],
                live: false,
            });
        }

        Self {
            slots,
            heads: [None; NUM_ORDERS],
            tails: [None; NUM_ORDERS],
            live: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Borrow a live node. Panics on a dead index: handing out indices of
    /// removed nodes is a caller contract violation.
    pub fn get(&self, index: NodeIndex) -> &DpbNode {
        let slot = &self.slots[index.0];
        debug_assert!(slot.live, "access to dead node {:?}", index);
        &slot.node
    }

    pub fn get_mut(&mut self, index: NodeIndex) -> &mut DpbNode {
        let slot = &mut self.slots[index.0];
        debug_assert!(slot.live, "access to dead node {:?}", index);
        &mut slot.node
    }

    pub fn is_live(&self, index: NodeIndex) -> bool {
        self.slots[index.0].live
    }

    pub fn head(&self, order: Order) -> Option<NodeIndex> {
        self.heads[order as usize]
    }

    pub fn tail(&self, order: Order) -> Option<NodeIndex> {
        self.tails[order as usize]
    }

    pub fn next(&self, order: Order, index: NodeIndex) -> Option<NodeIndex> {
        self.slots[index.0].links[order as usize].next
    }

    pub fn prev(&self, order: Order, index: NodeIndex) -> Option<NodeIndex> {
        self.slots[index.0].links[order as usize].prev
    }

    /// Iterate node indices following one of the orderings.
    pub fn iter(&self, order: Order) -> impl Iterator<Item = NodeIndex> + '_ {
        let mut cursor = self.head(order);
        std::iter::from_fn(move || {
            let index = cursor?;
            cursor = self.next(order, index);
            Some(index)
        })
    }

    /// Store `node` and link it into all three orderings.
    pub fn insert(&mut self, node: DpbNode) -> Result<NodeIndex, InsertError> {
        let free = self
            .slots
            .iter()
            .position(|slot| !slot.live)
            .ok_or(InsertError::Full {
                capacity: self.slots.len(),
            })?;
        let index = NodeIndex(free);

        let slot = &mut self.slots[free];
        slot.node = node;
        slot.links = [Links::default(); NUM_ORDERS];
        slot.live = true;
        self.live += 1;

        // Walk from the head and place the node before the first greater key.
        // Equal keys keep walking, so ties end up in insertion order; the
        // POC-LSB list relies on this for wrap disambiguation.
        self.link_sorted(index, Order::Poc, |arena, at, new| {
            arena.get(at).frame_poc > new.frame_poc
        });
        self.link_sorted(index, Order::PocLsb, |arena, at, new| {
            arena.get(at).poc_lsb > new.poc_lsb
        });
        self.link_tail(index, Order::Decode);

        Ok(index)
    }

    /// Unlink from all three orderings and free the slot, returning the node
    /// so the caller can release its handles.
    pub fn remove(&mut self, index: NodeIndex) -> DpbNode {
        debug_assert!(self.slots[index.0].live, "removal of dead node {:?}", index);

        self.unlink(index, Order::Poc);
        self.unlink(index, Order::PocLsb);
        self.unlink(index, Order::Decode);

        let slot = &mut self.slots[index.0];
        slot.live = false;
        self.live -= 1;
        std::mem::take(&mut slot.node)
    }

    fn link_sorted<F>(&mut self, index: NodeIndex, order: Order, greater: F)
    where
        F: Fn(&Self, NodeIndex, &DpbNode) -> bool,
    {
        let mut insert_before = None;
        let mut cursor = self.head(order);

        while let Some(at) = cursor {
            if at != index && greater(self, at, &self.slots[index.0].node) {
                insert_before = Some(at);
                break;
            }
            cursor = self.next(order, at);
        }

        match insert_before {
            Some(at) => self.link_before(index, at, order),
            None => self.link_tail(index, order),
        }
    }

    fn link_before(&mut self, index: NodeIndex, at: NodeIndex, order: Order) {
        let o = order as usize;
        let prev = self.slots[at.0].links[o].prev;

        self.slots[index.0].links[o] = Links {
            prev,
            next: Some(at),
        };
        self.slots[at.0].links[o].prev = Some(index);

        match prev {
            Some(p) => self.slots[p.0].links[o].next = Some(index),
            None => self.heads[o] = Some(index),
        }
    }

    fn link_tail(&mut self, index: NodeIndex, order: Order) {
        let o = order as usize;
        let tail = self.tails[o];

        self.slots[index.0].links[o] = Links {
            prev: tail,
            next: None,
        };

        match tail {
            Some(t) => self.slots[t.0].links[o].next = Some(index),
            None => self.heads[o] = Some(index),
        }
        self.tails[o] = Some(index);
    }

    fn unlink(&mut self, index: NodeIndex, order: Order) {
        let o = order as usize;
        let Links { prev, next } = self.slots[index.0].links[o];

        match prev {
            Some(p) => self.slots[p.0].links[o].next = next,
            None => self.heads[o] = next,
        }
        match next {
            Some(n) => self.slots[n.0].links[o].prev = prev,
            None => self.tails[o] = prev,
        }

        self.slots[index.0].links[o] = Links::default();
    }

    /// Every live node must appear exactly once in each ordering, and the
    /// sorted lists must be ordered. Used by tests and debug sweeps.
    #[cfg(any(test, debug_assertions))]
    pub fn check_consistency(&self) {
        for order in [Order::Poc, Order::PocLsb, Order::Decode] {
            let mut seen = vec![false; self.slots.len()];
            let mut count = 0;

            for index in self.iter(order) {
                assert!(self.slots[index.0].live, "dead node linked in {:?}", order);
                assert!(!seen[index.0], "node {:?} linked twice in {:?}", index, order);
                seen[index.0] = true;
                count += 1;

                if let Some(next) = self.next(order, index) {
                    match order {
                        Order::Poc => {
                            assert!(self.get(index).frame_poc <= self.get(next).frame_poc)
                        }
                        Order::PocLsb => {
                            assert!(self.get(index).poc_lsb <= self.get(next).poc_lsb)
                        }
                        Order::Decode => (),
                    }
                } else {
                    assert_eq!(self.tails[order as usize], Some(index));
                }
            }

            assert_eq!(count, self.live, "{:?} does not cover all live nodes", order);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(frame_poc: i32, poc_lsb: u32) -> DpbNode {
        DpbNode {
            frame_poc,
            poc_lsb,
            ..Default::default()
        }
    }

    fn poc_order(arena: &NodeArena) -> Vec<i32> {
        arena
            .iter(Order::Poc)
            .map(|i| arena.get(i).frame_poc)
            .collect()
    }

    #[test]
    fn sorted_insertion() {
        let mut arena = NodeArena::new(8);

        for (poc, lsb) in [(4, 4), (0, 0), (8, 8), (2, 2), (6, 6)] {
            arena.insert(node(poc, lsb as u32)).unwrap();
        }

        assert_eq!(poc_order(&arena), vec![0, 2, 4, 6, 8]);
        arena.check_consistency();

        // Decode order is arrival order.
        let decode: Vec<i32> = arena
            .iter(Order::Decode)
            .map(|i| arena.get(i).frame_poc)
            .collect();
        assert_eq!(decode, vec![4, 0, 8, 2, 6]);
    }

    #[test]
    fn poc_lsb_ties_keep_insertion_order() {
        let mut arena = NodeArena::new(4);

        let a = arena.insert(node(10, 2)).unwrap();
        let b = arena.insert(node(26, 2)).unwrap();
        let c = arena.insert(node(5, 1)).unwrap();

        let lsb: Vec<NodeIndex> = arena.iter(Order::PocLsb).collect();
        assert_eq!(lsb, vec![c, a, b]);
    }

    #[test]
    fn remove_relinks_all_orders() {
        let mut arena = NodeArena::new(4);

        let _a = arena.insert(node(0, 0)).unwrap();
        let b = arena.insert(node(2, 2)).unwrap();
        let _c = arena.insert(node(4, 4)).unwrap();

        arena.remove(b);
        assert_eq!(poc_order(&arena), vec![0, 4]);
        assert_eq!(arena.len(), 2);
        arena.check_consistency();

        // The freed slot is reused and relinked in sorted position.
        arena.insert(node(1, 1)).unwrap();
        assert_eq!(poc_order(&arena), vec![0, 1, 4]);
        arena.check_consistency();
    }

    #[test]
    fn capacity_overflow_reported() {
        let mut arena = NodeArena::new(2);

        arena.insert(node(0, 0)).unwrap();
        arena.insert(node(1, 1)).unwrap();
        assert!(matches!(
            arena.insert(node(2, 2)),
            Err(InsertError::Full { capacity: 2 })
        ));
    }
}
