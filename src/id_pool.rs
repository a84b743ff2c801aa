// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Recycling pool of consumer-visible picture identifiers.
//!
//! The pool can momentarily run dry while the hardware still holds pictures;
//! that is expected resource pressure, not an error. At most one picture may
//! wait for an identifier at a time, a real one-in-flight constraint of the
//! hardware pipeline.

use crate::node::NodeIndex;
use crate::PictureId;

#[derive(Debug)]
pub struct IdPool {
    free: Vec<PictureId>,
    /// Reverse map from identifier to live node, `None` while the identifier
    /// is in the free list.
    node_of: Vec<Option<NodeIndex>>,
    /// The single node allowed to wait for an identifier.
    waiting: Option<NodeIndex>,
}

impl IdPool {
    pub fn new(num_ids: usize) -> Self {
        // LIFO pop order; seeded in reverse so the first acquisitions hand
        // out 0, 1, 2, ...
        let free = (0..num_ids).rev().map(|i| PictureId(i as u8)).collect();

        Self {
            free,
            node_of: vec![None; num_ids],
            waiting: None,
        }
    }

    pub fn has_free(&self) -> bool {
        !self.free.is_empty()
    }

    /// Bind a free identifier to `node`, or `None` if the pool is dry.
    pub fn acquire(&mut self, node: NodeIndex) -> Option<PictureId> {
        let id = self.free.pop()?;
        self.node_of[id.0 as usize] = Some(node);
        Some(id)
    }

    /// Return `id` to the pool.
    pub fn release(&mut self, id: PictureId) {
        debug_assert!(
            self.node_of[id.0 as usize].is_some(),
            "double release of {:?}",
            id
        );
        self.node_of[id.0 as usize] = None;
        self.free.push(id);
    }

    pub fn node_of(&self, id: PictureId) -> Option<NodeIndex> {
        self.node_of[id.0 as usize]
    }

    /// Park `node` until an identifier frees up. Only one picture may be
    /// pending at a time.
    pub fn set_waiting(&mut self, node: NodeIndex) {
        debug_assert!(
            self.waiting.is_none(),
            "a picture is already waiting for an identifier"
        );
        self.waiting = Some(node);
    }

    pub fn waiting(&self) -> Option<NodeIndex> {
        self.waiting
    }

    /// If a node is parked and an identifier is now free, bind it.
    pub fn take_waiting(&mut self) -> Option<(NodeIndex, PictureId)> {
        if self.free.is_empty() {
            return None;
        }

        let node = self.waiting.take()?;
        let id = self.acquire(node).unwrap();
        Some((node, id))
    }

    /// Forget the waiting picture if it is `node`. Called when the node is
    /// removed before ever getting an identifier.
    pub fn cancel_waiting(&mut self, node: NodeIndex) {
        if self.waiting == Some(node) {
            self.waiting = None;
        }
    }
}
