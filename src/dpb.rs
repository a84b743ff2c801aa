// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The decoded picture buffer proper: reference marking, output ordering and
//! node lifecycle over the arena.
//!
//! A single mutex guards every node field, all three orderings, the counters,
//! the identifier pool and the display FIFO. The control thread (per-picture
//! operations) and the decode-completion path ([`Dpb::end_decoding`]) both
//! take it; no operation blocks while holding it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use log::debug;
use log::trace;
use thiserror::Error;

use crate::arena::InsertError;
use crate::arena::NodeArena;
use crate::arena::Order;
use crate::fifo::DisplayFifo;
use crate::fifo::OutputStatus;
use crate::id_pool::IdPool;
use crate::node::DpbNode;
use crate::node::NodeIndex;
use crate::node::Reference;
use crate::slice::MarkingOp;
use crate::slice::SliceDesc;
use crate::BufferCallbacks;
use crate::DpbConfig;
use crate::FrameBufferId;
use crate::MvBufferId;
use crate::PictureId;

#[derive(Debug, Error)]
pub enum MarkingError {
    #[error("no live short-term picture with pic_num {0}")]
    NoShortTermPic(i32),
    #[error("no live long-term picture with long_term_pic_num {0}")]
    NoLongTermPic(i32),
    #[error("sliding window found no short-term picture to evict")]
    NoShortTermToEvict,
}

/// How the picture being decoded will enter the DPB once marking of the
/// existing nodes has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentMarking {
    pub reference: Reference,
    pub long_term_frame_idx: Option<i32>,
}

/// Everything needed to insert one picture.
#[derive(Debug, Clone)]
pub struct PictureDesc {
    pub frame_poc: i32,
    pub poc_lsb: u32,
    pub frame_buffer: Option<FrameBufferId>,
    pub mv_buffer: Option<MvBufferId>,
    pub output_flag: bool,
    pub reference: Reference,
    pub long_term_frame_idx: Option<i32>,
    pub slice_frame_num: u32,
    pub non_existing: bool,
}

pub(crate) struct DpbInner {
    pub(crate) arena: NodeArena,
    pub(crate) fifo: DisplayFifo,
    pub(crate) ids: IdPool,
    pub(crate) callbacks: Arc<dyn BufferCallbacks>,

    pub(crate) max_refs: usize,
    pub(crate) low_delay: bool,

    /// Number of live nodes still marked as references.
    pub(crate) count_ref: usize,
    /// Number of live nodes still pending output.
    pub(crate) num_output: usize,

    /// The most recently inserted picture; excluded from the reference lists
    /// built for it.
    pub(crate) cur: Option<NodeIndex>,

    pub(crate) max_long_term_frame_idx: Option<i32>,
    /// The last picture carried an all-references-cleared operation; consumed
    /// by the next picture's POC derivation.
    pub(crate) last_has_mmco5: bool,
    pub(crate) last_displayed_poc: Option<i32>,

    /// Buffers freed by node removal, released to the pool only on the next
    /// end-of-decoding event so the hardware is done with them.
    pub(crate) deleted: VecDeque<(FrameBufferId, Option<MvBufferId>)>,
}

/// A DPB instance. All methods lock internally; see the module docs for the
/// concurrency model.
pub struct Dpb {
    inner: Mutex<DpbInner>,
}

impl Dpb {
    pub fn new(config: &DpbConfig, callbacks: Arc<dyn BufferCallbacks>) -> Self {
        Self {
            inner: Mutex::new(DpbInner {
                arena: NodeArena::new(config.capacity),
                fifo: DisplayFifo::new(config.capacity),
                ids: IdPool::new(config.num_pic_ids),
                callbacks,
                max_refs: config.max_refs,
                low_delay: config.low_delay,
                count_ref: 0,
                num_output: 0,
                cur: None,
                max_long_term_frame_idx: None,
                last_has_mmco5: false,
                last_displayed_poc: None,
                deleted: VecDeque::new(),
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, DpbInner> {
        self.inner.lock().unwrap()
    }

    /// Run the reference marking process for the picture described by
    /// `slice`, mutating the existing nodes. Returns the marking the current
    /// picture must be inserted with. One run per picture, before insertion.
    pub fn marking_process(
        &self,
        slice: &SliceDesc,
        max_frame_num: u32,
    ) -> Result<CurrentMarking, MarkingError> {
        self.lock().marking_process(slice, max_frame_num)
    }

    /// Insert a picture that has already been through marking.
    pub fn insert(&self, desc: PictureDesc) -> Result<NodeIndex, InsertError> {
        self.lock().insert(desc)
    }

    /// Remove a node, freeing its slot and identifier. Buffer handles are
    /// queued for deferred release.
    pub fn remove(&self, index: NodeIndex) {
        self.lock().remove(index);
    }

    /// Queue `index` (and any earlier-POC pending picture) for display.
    pub fn display(&self, index: NodeIndex) {
        self.lock().display(index);
    }

    /// Evict nodes that are neither references nor pending output, and shed
    /// excess pictures while over budget.
    pub fn cleanup(&self) {
        self.lock().cleanup();
    }

    /// Decode-completion path: the hardware finished writing `frame`.
    /// Releases deferred buffers and makes the frame available for output.
    pub fn end_decoding(&self, frame: FrameBufferId) {
        self.lock().end_decoding(frame);
    }

    /// Drain every picture to the display FIFO, then empty the DPB.
    pub fn flush(&self) {
        self.lock().flush();
    }

    /// Push out the lowest-POC picture: displayed if still pending output,
    /// then removed.
    pub fn remove_head(&self) {
        let mut inner = self.lock();
        if let Some(head) = inner.arena.head(Order::Poc) {
            if inner.arena.get(head).needed_for_output {
                inner.display_one(head);
            }
            inner.remove(head);
        }
    }

    /// Drop every pending-output flag without displaying anything.
    pub fn clear_output(&self) {
        let mut inner = self.lock();
        let nodes: Vec<_> = inner.arena.iter(Order::Poc).collect();
        for index in nodes {
            inner.arena.get_mut(index).needed_for_output = false;
        }
        inner.num_output = 0;
    }

    /// Bump the latency counter of every picture that will be output after
    /// the one with `cur_poc`.
    pub fn increment_latencies(&self, cur_poc: i32) {
        let mut inner = self.lock();
        let nodes: Vec<_> = inner.arena.iter(Order::Poc).collect();
        for index in nodes {
            let node = inner.arena.get_mut(index);
            if node.frame_poc > cur_poc {
                node.latency += 1;
            }
        }
    }

    /// Head of the display FIFO, only once its decoding completed.
    pub fn get_display_buffer(&self) -> Option<FrameBufferId> {
        self.lock().fifo.peek_ready()
    }

    /// Hand the head of the display FIFO back to the pool.
    pub fn release_display_buffer(&self) -> Option<FrameBufferId> {
        let mut inner = self.lock();
        let frame = inner.fifo.dequeue()?;
        inner.callbacks.decrement_frame(frame);
        Some(frame)
    }

    /// First live reference with this POC, ignoring non-existing fillers.
    pub fn search_poc(&self, poc: i32) -> Option<NodeIndex> {
        let inner = self.lock();
        let found = inner.arena.iter(Order::Poc).find(|&i| {
            let node = inner.arena.get(i);
            node.frame_poc == poc && node.is_ref() && !node.non_existing
        });
        found
    }

    /// First live reference with this POC LSB, in POC-LSB order. Ties resolve
    /// to the earliest inserted, which is what wrap disambiguation needs.
    pub fn search_poc_lsb(&self, poc_lsb: u32) -> Option<NodeIndex> {
        let inner = self.lock();
        let found = inner.arena.iter(Order::PocLsb).find(|&i| {
            let node = inner.arena.get(i);
            node.poc_lsb == poc_lsb && node.is_ref()
        });
        found
    }

    // Read-only accessors. Each takes the lock for a consistent snapshot.

    pub fn head_poc(&self) -> Option<NodeIndex> {
        self.lock().arena.head(Order::Poc)
    }

    pub fn next_poc(&self, index: NodeIndex) -> Option<NodeIndex> {
        self.lock().arena.next(Order::Poc, index)
    }

    pub fn marking_flag(&self, index: NodeIndex) -> Reference {
        self.lock().arena.get(index).reference
    }

    pub fn pic_id(&self, index: NodeIndex) -> Option<PictureId> {
        self.lock().arena.get(index).pic_id
    }

    pub fn frame_id(&self, index: NodeIndex) -> Option<FrameBufferId> {
        self.lock().arena.get(index).frame_buffer
    }

    pub fn mv_id(&self, index: NodeIndex) -> Option<MvBufferId> {
        self.lock().arena.get(index).mv_buffer
    }

    pub fn output_flag(&self, index: NodeIndex) -> bool {
        self.lock().arena.get(index).needed_for_output
    }

    pub fn pic_latency(&self, index: NodeIndex) -> u32 {
        self.lock().arena.get(index).latency
    }

    pub fn node_of_pic_id(&self, id: PictureId) -> Option<NodeIndex> {
        self.lock().ids.node_of(id)
    }

    /// Highest-POC live picture that holds an identifier.
    pub fn last_pic_id(&self) -> Option<PictureId> {
        let inner = self.lock();
        inner
            .arena
            .iter(Order::Poc)
            .filter_map(|i| inner.arena.get(i).pic_id)
            .last()
    }

    pub fn ref_count(&self) -> usize {
        self.lock().count_ref
    }

    pub fn pic_count(&self) -> usize {
        self.lock().arena.len()
    }

    pub fn num_output_pics(&self) -> usize {
        self.lock().num_output
    }

    pub fn max_refs(&self) -> usize {
        self.lock().max_refs
    }

    pub fn set_max_refs(&self, max_refs: usize) {
        self.lock().max_refs = max_refs;
    }

    pub fn last_displayed_poc(&self) -> Option<i32> {
        self.lock().last_displayed_poc
    }

    /// Consume the all-references-cleared flag left by the previous picture.
    pub fn take_mmco5(&self) -> bool {
        let mut inner = self.lock();
        std::mem::take(&mut inner.last_has_mmco5)
    }
}

impl DpbInner {
    fn marking_process(
        &mut self,
        slice: &SliceDesc,
        max_frame_num: u32,
    ) -> Result<CurrentMarking, MarkingError> {
        let base = if slice.is_reference {
            Reference::ShortTerm
        } else {
            Reference::None
        };

        if slice.is_idr {
            return Ok(if slice.long_term_reference_flag {
                self.max_long_term_frame_idx = Some(0);
                CurrentMarking {
                    reference: Reference::LongTerm,
                    long_term_frame_idx: Some(0),
                }
            } else {
                self.max_long_term_frame_idx = None;
                CurrentMarking {
                    reference: base,
                    long_term_frame_idx: None,
                }
            });
        }

        self.update_pic_nums(slice.frame_num, max_frame_num);

        let mut current = CurrentMarking {
            reference: base,
            long_term_frame_idx: None,
        };

        if !slice.marking_ops.is_empty() {
            for op in &slice.marking_ops {
                self.apply_marking_op(op, slice, &mut current)?;
            }
        } else if slice.is_reference {
            self.sliding_window_marking()?;
        }

        Ok(current)
    }

    /// 8.2.4.1: recompute the per-reference numbering against the current
    /// `frame_num`, wrap-aware.
    fn update_pic_nums(&mut self, frame_num: u32, max_frame_num: u32) {
        let nodes: Vec<_> = self.arena.iter(Order::Decode).collect();

        for index in nodes {
            let node = self.arena.get_mut(index);
            match node.reference {
                Reference::None => (),
                Reference::ShortTerm => {
                    node.frame_num_wrap = if node.slice_frame_num > frame_num {
                        node.slice_frame_num as i32 - max_frame_num as i32
                    } else {
                        node.slice_frame_num as i32
                    };
                    node.pic_num = node.frame_num_wrap;
                    trace!("POC {} now has pic_num {}", node.frame_poc, node.pic_num);
                }
                Reference::LongTerm => {
                    if let Some(idx) = node.long_term_frame_idx {
                        node.long_term_pic_num = idx;
                    }
                }
            }
        }
    }

    fn apply_marking_op(
        &mut self,
        op: &MarkingOp,
        slice: &SliceDesc,
        current: &mut CurrentMarking,
    ) -> Result<(), MarkingError> {
        let cur_pic_num = slice.frame_num as i32;

        match *op {
            MarkingOp::UnmarkShortTerm { pic_num_diff } => {
                let pic_num_x = cur_pic_num - pic_num_diff as i32;
                debug!("unmarking short-term reference with pic_num {}", pic_num_x);

                let target = self
                    .find_short_term_with_pic_num(pic_num_x)
                    .ok_or(MarkingError::NoShortTermPic(pic_num_x))?;
                self.set_unused(target);
            }
            MarkingOp::UnmarkLongTerm { long_term_pic_num } => {
                debug!(
                    "unmarking long-term reference with long_term_pic_num {}",
                    long_term_pic_num
                );

                let target = self
                    .find_long_term_with_pic_num(long_term_pic_num)
                    .ok_or(MarkingError::NoLongTermPic(long_term_pic_num))?;
                self.set_unused(target);
            }
            MarkingOp::ShortTermToLongTerm {
                pic_num_diff,
                long_term_frame_idx,
            } => {
                let pic_num_x = cur_pic_num - pic_num_diff as i32;
                debug!(
                    "promoting pic_num {} to long-term index {}",
                    pic_num_x, long_term_frame_idx
                );

                let target = self
                    .find_short_term_with_pic_num(pic_num_x)
                    .ok_or(MarkingError::NoShortTermPic(pic_num_x))?;

                // An index can name at most one long-term picture; demote any
                // previous holder.
                if let Some(holder) = self.find_long_term_with_frame_idx(long_term_frame_idx) {
                    if holder != target {
                        self.set_unused(holder);
                    }
                }

                let node = self.arena.get_mut(target);
                node.reference = Reference::LongTerm;
                node.long_term_frame_idx = Some(long_term_frame_idx);
                node.long_term_pic_num = long_term_frame_idx;
            }
            MarkingOp::SetMaxLongTermFrameIdx {
                max_long_term_frame_idx,
            } => {
                debug!(
                    "max long-term frame index is now {:?}",
                    max_long_term_frame_idx
                );

                let demoted: Vec<_> = self
                    .arena
                    .iter(Order::Decode)
                    .filter(|&i| {
                        let node = self.arena.get(i);
                        node.reference == Reference::LongTerm
                            && match (node.long_term_frame_idx, max_long_term_frame_idx) {
                                (Some(idx), Some(max)) => idx > max,
                                (Some(_), None) => true,
                                (None, _) => false,
                            }
                    })
                    .collect();

                for index in demoted {
                    self.set_unused(index);
                }

                self.max_long_term_frame_idx = max_long_term_frame_idx;
            }
            MarkingOp::ClearAll => {
                debug!("clearing all references");

                let nodes: Vec<_> = self.arena.iter(Order::Decode).collect();
                for index in nodes {
                    if !self.arena.get(index).non_existing {
                        self.display(index);
                    }
                    self.remove(index);
                }

                self.max_long_term_frame_idx = None;
                if slice.is_reference {
                    self.last_has_mmco5 = true;
                }
                self.last_displayed_poc = None;
            }
            MarkingOp::AssignLongTermToCurrent {
                long_term_frame_idx,
            } => {
                debug!(
                    "assigning long-term index {} to the current picture",
                    long_term_frame_idx
                );

                if let Some(holder) = self.find_long_term_with_frame_idx(long_term_frame_idx) {
                    self.set_unused(holder);
                }

                current.reference = Reference::LongTerm;
                current.long_term_frame_idx = Some(long_term_frame_idx);
            }
        }

        Ok(())
    }

    /// 8.2.5.3: unmark the short-term picture with the smallest
    /// `frame_num_wrap` while the reference count exceeds the configured
    /// maximum.
    ///
    /// The tie-break on equal `frame_num_wrap` is not mandated by the
    /// standard; the first node in decode order wins, deterministically.
    fn sliding_window_marking(&mut self) -> Result<(), MarkingError> {
        while self.count_ref > std::cmp::max(self.max_refs, 1) {
            let mut victim = None;
            let mut min_wrap = i32::MAX;
            for index in self.arena.iter(Order::Decode) {
                let node = self.arena.get(index);
                if node.reference == Reference::ShortTerm && node.frame_num_wrap < min_wrap {
                    min_wrap = node.frame_num_wrap;
                    victim = Some(index);
                }
            }

            let victim = victim.ok_or(MarkingError::NoShortTermToEvict)?;
            debug!(
                "sliding window evicts POC {} (frame_num_wrap {})",
                self.arena.get(victim).frame_poc,
                min_wrap
            );
            self.set_unused(victim);
        }

        Ok(())
    }

    /// Unmark a reference. Terminal: the node can only be referenced again by
    /// re-insertion. The identifier is released right away; slot removal may
    /// be deferred until the picture is no longer pending output.
    fn set_unused(&mut self, index: NodeIndex) {
        debug_assert!(self.arena.get(index).is_ref());

        let node = self.arena.get_mut(index);
        node.reference = Reference::None;
        self.count_ref -= 1;

        if self.arena.get(index).is_evictable() {
            self.remove(index);
        } else if let Some(id) = self.arena.get_mut(index).pic_id.take() {
            self.ids.release(id);
            self.fill_waiting();
        }
    }

    fn insert(&mut self, desc: PictureDesc) -> Result<NodeIndex, InsertError> {
        let node = DpbNode {
            frame_poc: desc.frame_poc,
            poc_lsb: desc.poc_lsb,
            reference: desc.reference,
            needed_for_output: desc.output_flag,
            displayed: false,
            latency: 0,
            pic_id: None,
            frame_buffer: desc.frame_buffer,
            mv_buffer: desc.mv_buffer,
            pic_num: desc.slice_frame_num as i32,
            frame_num_wrap: desc.slice_frame_num as i32,
            long_term_pic_num: desc.long_term_frame_idx.unwrap_or(i32::MAX),
            long_term_frame_idx: desc.long_term_frame_idx,
            slice_frame_num: desc.slice_frame_num,
            non_existing: desc.non_existing,
        };

        let index = self.arena.insert(node)?;

        // Synthetic gap fillers never consume an identifier.
        if !desc.non_existing {
            match self.ids.acquire(index) {
                Some(id) => self.arena.get_mut(index).pic_id = Some(id),
                None => self.ids.set_waiting(index),
            }
        }

        if let Some(frame) = desc.frame_buffer {
            self.fifo.set_status(
                frame,
                if desc.output_flag {
                    OutputStatus::NotReady
                } else {
                    OutputStatus::NotNeeded
                },
            );
            self.callbacks.increment_frame(frame);
        }
        if let Some(mv) = desc.mv_buffer {
            self.callbacks.increment_mv(mv);
        }

        if desc.reference != Reference::None {
            self.count_ref += 1;
        }
        if desc.output_flag {
            self.num_output += 1;
        }

        self.cur = Some(index);

        debug!(
            "stored picture POC {}, the DPB now holds {} pictures ({} refs)",
            desc.frame_poc,
            self.arena.len(),
            self.count_ref
        );

        Ok(index)
    }

    pub(crate) fn remove(&mut self, index: NodeIndex) {
        if self.cur == Some(index) {
            self.cur = None;
        }
        self.ids.cancel_waiting(index);

        let node = self.arena.remove(index);

        if let Some(id) = node.pic_id {
            self.ids.release(id);
        }
        if node.is_ref() {
            self.count_ref -= 1;
        }
        if node.needed_for_output {
            self.num_output -= 1;
        }

        // The hardware may still be reading the buffers; hold the release
        // until the next end-of-decoding event.
        if !node.non_existing {
            if let Some(frame) = node.frame_buffer {
                self.deleted.push_back((frame, node.mv_buffer));
            }
        }

        self.fill_waiting();
    }

    /// Queue `index` for display, preceded by any earlier-POC picture still
    /// pending output. Iterative: a wide backlog must not grow the stack.
    fn display(&mut self, index: NodeIndex) {
        let mut to_show = Vec::new();
        let mut cursor = self.arena.head(Order::Poc);

        while let Some(at) = cursor {
            if self.arena.get(at).needed_for_output {
                to_show.push(at);
            }
            if at == index {
                break;
            }
            cursor = self.arena.next(Order::Poc, at);
        }

        for at in to_show {
            self.display_one(at);
        }
    }

    fn display_one(&mut self, index: NodeIndex) {
        let node = self.arena.get(index);
        debug_assert!(node.needed_for_output);

        if !node.non_existing {
            let frame = node.frame_buffer.expect("existing picture without buffer");
            let (poc, latency) = (node.frame_poc, node.latency);

            debug!("picture POC {} leaves for display", poc);
            self.fifo.queue(frame, latency);
            self.callbacks.increment_frame(frame);
            self.callbacks.emit_frame(frame);
            self.last_displayed_poc = Some(poc);
        }

        let node = self.arena.get_mut(index);
        node.needed_for_output = false;
        node.displayed = true;
        self.num_output -= 1;
    }

    fn cleanup(&mut self) {
        // First pass: anything that is neither referenced nor pending output
        // goes away.
        let nodes: Vec<_> = self.arena.iter(Order::Poc).collect();
        for index in nodes {
            if self.arena.get(index).is_evictable() {
                self.remove(index);
            }
        }

        // Second pass: while over budget, push unused pictures out through
        // the display path.
        let nodes: Vec<_> = self.arena.iter(Order::Poc).collect();
        for index in nodes {
            if self.count_ref <= self.max_refs && self.arena.len() <= self.max_refs {
                break;
            }

            if !self.arena.get(index).is_ref() {
                self.display(index);
                self.remove(index);
            }
        }

        self.fill_waiting();
    }

    fn end_decoding(&mut self, frame: FrameBufferId) {
        self.release_deleted();

        if self.fifo.status_of(frame) == OutputStatus::NotReady {
            self.fifo.set_status(frame, OutputStatus::Ready);

            // Without reordering the frame can leave as soon as it is done.
            if self.low_delay {
                let node = self
                    .arena
                    .iter(Order::Decode)
                    .find(|&i| self.arena.get(i).frame_buffer == Some(frame));

                if let Some(index) = node {
                    if self.arena.get(index).needed_for_output {
                        self.display(index);
                    }
                }
            }
        }
    }

    fn release_deleted(&mut self) {
        while let Some((frame, mv)) = self.deleted.pop_front() {
            self.callbacks.decrement_frame(frame);
            if let Some(mv) = mv {
                self.callbacks.decrement_mv(mv);
            }
        }
    }

    fn flush(&mut self) {
        while let Some(head) = self.arena.head(Order::Poc) {
            if self.arena.get(head).needed_for_output {
                self.display_one(head);
            }
            self.remove(head);
        }

        self.last_displayed_poc = None;
    }

    fn fill_waiting(&mut self) {
        if let Some((node, id)) = self.ids.take_waiting() {
            debug!("waiting picture bound to {:?}", id);
            self.arena.get_mut(node).pic_id = Some(id);
        }
    }

    pub(crate) fn find_short_term_with_pic_num(&self, pic_num: i32) -> Option<NodeIndex> {
        self.arena.iter(Order::Decode).find(|&i| {
            let node = self.arena.get(i);
            node.reference == Reference::ShortTerm && node.pic_num == pic_num
        })
    }

    pub(crate) fn find_long_term_with_pic_num(&self, long_term_pic_num: i32) -> Option<NodeIndex> {
        self.arena.iter(Order::Decode).find(|&i| {
            let node = self.arena.get(i);
            node.reference == Reference::LongTerm && node.long_term_pic_num == long_term_pic_num
        })
    }

    fn find_long_term_with_frame_idx(&self, long_term_frame_idx: i32) -> Option<NodeIndex> {
        self.arena.iter(Order::Decode).find(|&i| {
            let node = self.arena.get(i);
            node.reference == Reference::LongTerm
                && node.long_term_frame_idx == Some(long_term_frame_idx)
        })
    }
}
