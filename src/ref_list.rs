// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-slice reference picture list construction and explicit modification.
//!
//! Lists hold arena indices of pictures that are short-term or long-term
//! references at build time; the picture being decoded is never a candidate
//! for its own lists.

use log::debug;
use thiserror::Error;

use crate::arena::Order;
use crate::dpb::Dpb;
use crate::dpb::DpbInner;
use crate::node::NodeIndex;
use crate::node::Reference;
use crate::slice::ReorderCmd;
use crate::slice::SliceDesc;
use crate::slice::SliceType;

#[derive(Debug, Error)]
pub enum RefListError {
    #[error("modification command targets pic_num {0} but no short-term reference has it")]
    NoShortTermPic(i32),
    #[error("modification command targets long_term_pic_num {0} but no long-term reference has it")]
    NoLongTermPic(i32),
    #[error("reference list needs {required} entries but only {got} could be resolved")]
    TooFewReferences { required: usize, got: usize },
}

/// The reference lists of one slice. `list1` is empty except for B slices.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RefPicLists {
    pub list0: Vec<NodeIndex>,
    pub list1: Vec<NodeIndex>,
}

impl Dpb {
    /// Build the reference lists for `slice`: default construction by slice
    /// type, then the explicit modification commands, if any.
    ///
    /// Call after marking and insertion of the current picture, with its POC
    /// in `cur_poc`.
    pub fn build_ref_pic_lists(
        &self,
        slice: &SliceDesc,
        cur_poc: i32,
        max_frame_num: u32,
    ) -> Result<RefPicLists, RefListError> {
        let inner = self.lock();

        let mut lists = match slice.slice_type {
            SliceType::I => RefPicLists::default(),
            SliceType::P => RefPicLists {
                list0: inner.build_p_list(),
                list1: Vec::new(),
            },
            SliceType::B => inner.build_b_lists(cur_poc),
        };

        debug!(
            "default lists for POC {}: l0 {:?}, l1 {:?}",
            cur_poc, lists.list0, lists.list1
        );

        let cur_pic_num = slice.frame_num as i32;
        inner.modify_list(
            &mut lists.list0,
            &slice.reorder_l0,
            slice.num_ref_idx_active[0],
            cur_pic_num,
            max_frame_num as i32,
        )?;
        if slice.slice_type == SliceType::B {
            inner.modify_list(
                &mut lists.list1,
                &slice.reorder_l1,
                slice.num_ref_idx_active[1],
                cur_pic_num,
                max_frame_num as i32,
            )?;
        }

        Ok(lists)
    }
}

impl DpbInner {
    fn short_term_refs(&self) -> Vec<NodeIndex> {
        self.arena
            .iter(Order::Decode)
            .filter(|&i| {
                Some(i) != self.cur && self.arena.get(i).reference == Reference::ShortTerm
            })
            .collect()
    }

    fn long_term_refs(&self) -> Vec<NodeIndex> {
        let mut refs: Vec<NodeIndex> = self
            .arena
            .iter(Order::Decode)
            .filter(|&i| Some(i) != self.cur && self.arena.get(i).reference == Reference::LongTerm)
            .collect();
        refs.sort_by_key(|&i| self.arena.get(i).long_term_pic_num);
        refs
    }

    /// 8.2.4.2.1: short-term references by decreasing `pic_num`, then
    /// long-term references by increasing `long_term_pic_num`.
    fn build_p_list(&self) -> Vec<NodeIndex> {
        let mut list = self.short_term_refs();
        list.sort_by_key(|&i| std::cmp::Reverse(self.arena.get(i).pic_num));
        list.extend(self.long_term_refs());
        list
    }

    /// 8.2.4.2.3: both lists split the short-term references into a
    /// before-current and an after-current POC bucket; list 1 visits the
    /// buckets in the opposite order. If that still yields identical lists,
    /// list 1 must start with its second entry.
    fn build_b_lists(&self, cur_poc: i32) -> RefPicLists {
        let short_term = self.short_term_refs();

        let mut before: Vec<NodeIndex> = short_term
            .iter()
            .copied()
            .filter(|&i| self.arena.get(i).frame_poc < cur_poc)
            .collect();
        before.sort_by_key(|&i| std::cmp::Reverse(self.arena.get(i).frame_poc));

        let mut after: Vec<NodeIndex> = short_term
            .iter()
            .copied()
            .filter(|&i| self.arena.get(i).frame_poc > cur_poc)
            .collect();
        after.sort_by_key(|&i| self.arena.get(i).frame_poc);

        let long_term = self.long_term_refs();

        let mut list0 = before.clone();
        list0.extend(after.iter().copied());
        list0.extend(long_term.iter().copied());

        let mut list1 = after;
        list1.extend(before);
        list1.extend(long_term);

        if list1.len() > 1 && list0 == list1 {
            list1.swap(0, 1);
        }

        RefPicLists { list0, list1 }
    }

    /// 8.2.4.3: splice explicitly addressed references to the front of the
    /// list, one output slot at a time. Each command moves the resolved node
    /// into the current slot and prunes its later duplicate.
    fn modify_list(
        &self,
        list: &mut Vec<NodeIndex>,
        cmds: &[ReorderCmd],
        active_count: usize,
        cur_pic_num: i32,
        max_pic_num: i32,
    ) -> Result<(), RefListError> {
        list.truncate(active_count);

        if cmds.is_empty() {
            return Ok(());
        }

        let mut pic_num_pred = cur_pic_num;
        let mut ref_idx = 0;

        for cmd in cmds {
            let target = match *cmd {
                ReorderCmd::ShortTermSubtract { abs_diff } | ReorderCmd::ShortTermAdd { abs_diff } => {
                    let diff = abs_diff as i32;
                    let mut no_wrap = match cmd {
                        ReorderCmd::ShortTermSubtract { .. } => pic_num_pred - diff,
                        _ => pic_num_pred + diff,
                    };
                    if no_wrap < 0 {
                        no_wrap += max_pic_num;
                    } else if no_wrap >= max_pic_num {
                        no_wrap -= max_pic_num;
                    }
                    pic_num_pred = no_wrap;

                    let pic_num = if no_wrap > cur_pic_num {
                        no_wrap - max_pic_num
                    } else {
                        no_wrap
                    };

                    self.find_reorder_short_term(pic_num)
                        .ok_or(RefListError::NoShortTermPic(pic_num))?
                }
                ReorderCmd::LongTerm { long_term_pic_num } => self
                    .find_reorder_long_term(long_term_pic_num)
                    .ok_or(RefListError::NoLongTermPic(long_term_pic_num))?,
            };

            debug!("slot {} takes {:?}", ref_idx, target);

            let at = std::cmp::min(ref_idx, list.len());
            list.insert(at, target);
            ref_idx += 1;

            // The spliced node may already sit further down; one copy only.
            if let Some(dup) = list.iter().skip(ref_idx).position(|&n| n == target) {
                list.remove(ref_idx + dup);
            }
            list.truncate(active_count);
        }

        if list.len() != active_count {
            return Err(RefListError::TooFewReferences {
                required: active_count,
                got: list.len(),
            });
        }

        debug_assert!(list.iter().all(|&i| self.arena.get(i).is_ref()));

        Ok(())
    }

    fn find_reorder_short_term(&self, pic_num: i32) -> Option<NodeIndex> {
        self.arena.iter(Order::Decode).find(|&i| {
            Some(i) != self.cur && {
                let node = self.arena.get(i);
                node.reference == Reference::ShortTerm && node.pic_num == pic_num
            }
        })
    }

    fn find_reorder_long_term(&self, long_term_pic_num: i32) -> Option<NodeIndex> {
        self.arena.iter(Order::Decode).find(|&i| {
            Some(i) != self.cur && {
                let node = self.arena.get(i);
                node.reference == Reference::LongTerm
                    && node.long_term_pic_num == long_term_pic_num
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::dpb::PictureDesc;
    use crate::node::Reference;
    use crate::slice::MarkingOp;
    use crate::testing::CountingCallbacks;
    use crate::DpbConfig;
    use crate::FrameBufferId;
    use crate::MvBufferId;

    const MAX_FRAME_NUM: u32 = 16;

    fn dpb(max_refs: usize) -> Dpb {
        let config = DpbConfig {
            max_refs,
            capacity: max_refs + 4,
            num_pic_ids: max_refs + 4,
            ..Default::default()
        };
        Dpb::new(&config, Arc::new(CountingCallbacks::default()))
    }

    fn ref_slice(frame_num: u32) -> SliceDesc {
        SliceDesc {
            frame_num,
            is_reference: true,
            ..Default::default()
        }
    }

    fn store(dpb: &Dpb, frame_poc: i32, frame_num: u32) -> NodeIndex {
        dpb.marking_process(&ref_slice(frame_num), MAX_FRAME_NUM)
            .unwrap();
        dpb.insert(PictureDesc {
            frame_poc,
            poc_lsb: frame_poc.rem_euclid(16) as u32,
            frame_buffer: Some(FrameBufferId(frame_num)),
            mv_buffer: Some(MvBufferId(frame_num)),
            output_flag: false,
            reference: Reference::ShortTerm,
            long_term_frame_idx: None,
            slice_frame_num: frame_num,
            non_existing: false,
        })
        .unwrap()
    }

    fn pocs(dpb: &Dpb, list: &[NodeIndex]) -> Vec<i32> {
        let inner = dpb.lock();
        list.iter().map(|&i| inner.arena.get(i).frame_poc).collect()
    }

    // Marking plus insertion of a non-reference picture, the state the list
    // builder expects for the picture being decoded.
    fn store_non_ref(dpb: &Dpb, frame_poc: i32, frame_num: u32) -> NodeIndex {
        let mut slice = ref_slice(frame_num);
        slice.is_reference = false;
        dpb.marking_process(&slice, MAX_FRAME_NUM).unwrap();
        dpb.insert(PictureDesc {
            frame_poc,
            poc_lsb: frame_poc.rem_euclid(16) as u32,
            frame_buffer: Some(FrameBufferId(100 + frame_num)),
            mv_buffer: Some(MvBufferId(100 + frame_num)),
            output_flag: false,
            reference: Reference::None,
            long_term_frame_idx: None,
            slice_frame_num: frame_num,
            non_existing: false,
        })
        .unwrap()
    }

    // B slice at POC 0 with references at POC -2, -1, +1, +2.
    #[test]
    fn b_lists_bucket_by_poc_side() {
        let dpb = dpb(6);

        for (frame_num, poc) in [(0u32, -2), (1, -1), (2, 1), (3, 2)] {
            store(&dpb, poc, frame_num);
        }
        store(&dpb, 0, 4);

        let slice = SliceDesc {
            slice_type: SliceType::B,
            frame_num: 4,
            num_ref_idx_active: [4, 4],
            ..Default::default()
        };
        let lists = dpb.build_ref_pic_lists(&slice, 0, MAX_FRAME_NUM).unwrap();

        assert_eq!(pocs(&dpb, &lists.list0), vec![-1, -2, 1, 2]);
        assert_eq!(pocs(&dpb, &lists.list1), vec![1, 2, -1, -2]);
    }

    // All references on one POC side make the default lists identical; list 1
    // must then lead with its second entry.
    #[test]
    fn identical_b_lists_swap_first_two() {
        let dpb = dpb(4);

        store(&dpb, 2, 0);
        store(&dpb, 4, 1);
        store(&dpb, 0, 2);

        let slice = SliceDesc {
            slice_type: SliceType::B,
            frame_num: 2,
            num_ref_idx_active: [2, 2],
            ..Default::default()
        };
        let lists = dpb.build_ref_pic_lists(&slice, 0, MAX_FRAME_NUM).unwrap();

        assert_eq!(pocs(&dpb, &lists.list0), vec![2, 4]);
        assert_eq!(pocs(&dpb, &lists.list1), vec![4, 2]);
    }

    #[test]
    fn p_list_orders_by_recency_then_long_term() {
        let dpb = dpb(6);

        for frame_num in 0..=2u32 {
            store(&dpb, frame_num as i32, frame_num);
        }

        // Promote frame 0 to long-term index 1.
        let mut slice = ref_slice(3);
        slice.marking_ops = vec![MarkingOp::ShortTermToLongTerm {
            pic_num_diff: 3,
            long_term_frame_idx: 1,
        }];
        store_with_marking(&dpb, 3, &slice);

        let p = SliceDesc {
            slice_type: SliceType::P,
            frame_num: 4,
            num_ref_idx_active: [3, 0],
            ..Default::default()
        };
        store_non_ref(&dpb, 8, 4);
        let lists = dpb.build_ref_pic_lists(&p, 8, MAX_FRAME_NUM).unwrap();

        // Short-term 3, 2 by decreasing pic_num, then the long-term picture.
        assert_eq!(pocs(&dpb, &lists.list0), vec![3, 2, 0]);
        assert!(lists.list1.is_empty());
    }

    fn store_with_marking(dpb: &Dpb, frame_poc: i32, slice: &SliceDesc) -> NodeIndex {
        let marking = dpb.marking_process(slice, MAX_FRAME_NUM).unwrap();
        dpb.insert(PictureDesc {
            frame_poc,
            poc_lsb: frame_poc.rem_euclid(16) as u32,
            frame_buffer: Some(FrameBufferId(slice.frame_num)),
            mv_buffer: Some(MvBufferId(slice.frame_num)),
            output_flag: false,
            reference: marking.reference,
            long_term_frame_idx: marking.long_term_frame_idx,
            slice_frame_num: slice.frame_num,
            non_existing: false,
        })
        .unwrap()
    }

    // An explicit command moves its target to the addressed slot and leaves
    // no duplicate of it further down.
    #[test]
    fn reorder_splices_and_prunes() {
        let dpb = dpb(6);

        for frame_num in 0..=2u32 {
            store(&dpb, frame_num as i32, frame_num);
        }
        let oldest = dpb.search_poc(0).unwrap();

        let slice = SliceDesc {
            slice_type: SliceType::P,
            frame_num: 3,
            num_ref_idx_active: [3, 0],
            reorder_l0: vec![ReorderCmd::ShortTermSubtract { abs_diff: 3 }],
            ..Default::default()
        };
        store_non_ref(&dpb, 3, 3);
        let lists = dpb.build_ref_pic_lists(&slice, 3, MAX_FRAME_NUM).unwrap();

        assert_eq!(lists.list0[0], oldest);
        assert!(!lists.list0[1..].contains(&oldest));
        assert_eq!(pocs(&dpb, &lists.list0), vec![0, 2, 1]);
    }

    // Predictor arithmetic across the frame_num wrap: references from before
    // the wrap carry negative pic_nums and must still be addressable.
    #[test]
    fn reorder_predictor_wraps() {
        let dpb = dpb(6);

        store(&dpb, 28, 14);
        store(&dpb, 30, 15);

        let slice = SliceDesc {
            slice_type: SliceType::P,
            frame_num: 1,
            num_ref_idx_active: [2, 0],
            reorder_l0: vec![ReorderCmd::ShortTermSubtract { abs_diff: 3 }],
            ..Default::default()
        };
        // pic_nums recomputed against frame_num 1: 14 -> -2, 15 -> -1.
        store_non_ref(&dpb, 32, 1);

        let lists = dpb.build_ref_pic_lists(&slice, 32, MAX_FRAME_NUM).unwrap();
        assert_eq!(pocs(&dpb, &lists.list0), vec![28, 30]);
    }

    #[test]
    fn reorder_to_missing_picture_is_fatal() {
        let dpb = dpb(6);

        store(&dpb, 0, 0);

        let slice = SliceDesc {
            slice_type: SliceType::P,
            frame_num: 1,
            num_ref_idx_active: [1, 0],
            reorder_l0: vec![ReorderCmd::LongTerm {
                long_term_pic_num: 0,
            }],
            ..Default::default()
        };
        store_non_ref(&dpb, 2, 1);

        assert!(matches!(
            dpb.build_ref_pic_lists(&slice, 2, MAX_FRAME_NUM),
            Err(RefListError::NoLongTermPic(0))
        ));
    }

    // The current picture is in the arena when its lists are built and must
    // never appear in them.
    #[test]
    fn current_picture_excluded_from_lists() {
        let dpb = dpb(6);

        store(&dpb, 0, 0);
        let cur = store(&dpb, 2, 1);

        let slice = SliceDesc {
            slice_type: SliceType::P,
            frame_num: 1,
            num_ref_idx_active: [1, 0],
            ..Default::default()
        };
        let lists = dpb.build_ref_pic_lists(&slice, 2, MAX_FRAME_NUM).unwrap();

        assert!(!lists.list0.contains(&cur));
        assert_eq!(pocs(&dpb, &lists.list0), vec![0]);
    }
}
