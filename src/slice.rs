// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Plain-value slice inputs. The bitstream parser lives upstream; the DPB
//! only consumes already-decoded header fields.

use enumn::N;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, N)]
pub enum SliceType {
    P = 0,
    B = 1,
    #[default]
    I = 2,
}

/// One memory management control operation, applied in order until the list
/// is exhausted. An empty list selects sliding-window marking.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MarkingOp {
    /// MMCO 1: unmark the short-term picture `pic_num_diff` below the current
    /// picture number.
    UnmarkShortTerm { pic_num_diff: u32 },
    /// MMCO 2: unmark the long-term picture with this long-term pic num.
    UnmarkLongTerm { long_term_pic_num: i32 },
    /// MMCO 3: promote a short-term picture to long-term at the given index.
    ShortTermToLongTerm {
        pic_num_diff: u32,
        long_term_frame_idx: i32,
    },
    /// MMCO 4: lower the maximum long-term frame index, demoting anything now
    /// out of range. `None` means no long-term indices remain allowed.
    SetMaxLongTermFrameIdx { max_long_term_frame_idx: Option<i32> },
    /// MMCO 5: flush the entire DPB except the current picture and begin a
    /// new sequence.
    ClearAll,
    /// MMCO 6: assign the current picture a long-term index.
    AssignLongTermToCurrent { long_term_frame_idx: i32 },
}

/// One explicit reference list modification command.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReorderCmd {
    /// `modification_of_pic_nums_idc` 0: subtract from the running pic-num
    /// predictor, wrap-aware.
    ShortTermSubtract { abs_diff: u32 },
    /// `modification_of_pic_nums_idc` 1: add to the running predictor.
    ShortTermAdd { abs_diff: u32 },
    /// `modification_of_pic_nums_idc` 2: pick by long-term pic num.
    LongTerm { long_term_pic_num: i32 },
}

/// Everything the DPB needs to know about one picture, as plain values.
#[derive(Debug, Clone, Default)]
pub struct SliceDesc {
    pub slice_type: SliceType,
    pub frame_num: u32,
    /// `pic_order_cnt_lsb` for POC mode 0; ignored by the other modes.
    pub poc_lsb: u32,
    /// Explicit per-picture order count delta (POC mode 1).
    pub delta_poc: i32,
    pub is_idr: bool,
    /// `nal_ref_idc != 0`: the picture will itself become a reference.
    pub is_reference: bool,
    /// On IDR pictures only: mark the picture long-term at index 0.
    pub long_term_reference_flag: bool,
    /// The picture should eventually be output.
    pub output_flag: bool,
    /// Explicit marking operations; empty selects the sliding window.
    pub marking_ops: Vec<MarkingOp>,
    /// Requested reference list lengths (`num_ref_idx_lX_active`).
    pub num_ref_idx_active: [usize; 2],
    /// Explicit list modification commands, per list. Applied only when
    /// non-empty.
    pub reorder_l0: Vec<ReorderCmd>,
    pub reorder_l1: Vec<ReorderCmd>,
}

impl SliceDesc {
    pub fn has_mmco5(&self) -> bool {
        self.marking_ops
            .iter()
            .any(|op| matches!(op, MarkingOp::ClearAll))
    }
}
