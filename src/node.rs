// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::FrameBufferId;
use crate::MvBufferId;
use crate::PictureId;

/// Index of a node in the arena. Stable for the whole live span of a picture;
/// meaningless once the picture is removed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeIndex(pub(crate) usize);

impl NodeIndex {
    pub fn as_usize(self) -> usize {
        self.0
    }
}

/// Reference status of a tracked picture.
///
/// `ShortTerm`/`LongTerm` to `None` is terminal: the slot must be re-inserted
/// to be used again. `ShortTerm` to `LongTerm` is the only lateral move.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Reference {
    #[default]
    None,
    ShortTerm,
    LongTerm,
}

/// Per-picture metadata tracked by the DPB.
///
/// The arena is the sole owner of node memory; lookups hand out copies of
/// plain fields or short-lived borrows, never aliases that outlive an
/// operation.
#[derive(Debug, Clone)]
pub struct DpbNode {
    /// Display-order key, signed. Distinct from decode order.
    pub frame_poc: i32,
    /// Truncated low bits of the order count, used for wrap disambiguation.
    pub poc_lsb: u32,

    pub reference: Reference,

    /// The picture has not yet been handed to the display path.
    pub needed_for_output: bool,
    pub displayed: bool,
    /// Number of later-POC pictures decoded while this one was still pending
    /// output.
    pub latency: u32,

    /// Consumer-visible identifier, `None` while waiting for the pool.
    pub pic_id: Option<PictureId>,
    /// Opaque frame buffer handle; `None` for non-existing gap fillers.
    pub frame_buffer: Option<FrameBufferId>,
    pub mv_buffer: Option<MvBufferId>,

    // Derived values recomputed by the marking process against the current
    // slice's frame_num. Only meaningful on reference pictures.
    pub pic_num: i32,
    pub frame_num_wrap: i32,
    pub long_term_pic_num: i32,
    pub long_term_frame_idx: Option<i32>,
    /// `frame_num` the picture was coded with.
    pub slice_frame_num: u32,

    /// Synthetic filler for a `frame_num` gap: holds an ordering slot but owns
    /// no real buffer and never takes a picture identifier.
    pub non_existing: bool,
}

impl DpbNode {
    pub fn is_ref(&self) -> bool {
        !matches!(self.reference, Reference::None)
    }

    /// Both conditions of the eviction rule: no longer a reference and no
    /// longer pending output.
    pub fn is_evictable(&self) -> bool {
        !self.is_ref() && !self.needed_for_output
    }
}

impl Default for DpbNode {
    fn default() -> Self {
        Self {
            frame_poc: 0,
            poc_lsb: 0,
            reference: Reference::None,
            needed_for_output: false,
            displayed: false,
            latency: 0,
            pic_id: None,
            frame_buffer: None,
            mv_buffer: None,
            pic_num: i32::MAX,
            frame_num_wrap: i32::MAX,
            long_term_pic_num: i32::MAX,
            long_term_frame_idx: None,
            slice_frame_num: 0,
            non_existing: false,
        }
    }
}
