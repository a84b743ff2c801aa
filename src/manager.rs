// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-picture driver: ties POC derivation, gap filling, marking, insertion
//! and reference list construction into the fixed order the decoder needs.

use std::sync::Arc;

use anyhow::Context;
use log::debug;

use crate::dpb::Dpb;
use crate::dpb::PictureDesc;
use crate::node::NodeIndex;
use crate::poc::PocCalculator;
use crate::ref_list::RefPicLists;
use crate::slice::SliceDesc;
use crate::BufferCallbacks;
use crate::DpbConfig;
use crate::FrameBufferId;
use crate::MvBufferId;

/// What the consumer needs to decode one picture.
#[derive(Debug)]
pub struct CurrentPicture {
    pub node: NodeIndex,
    pub poc: i32,
    pub ref_lists: RefPicLists,
}

/// Owns one stream's DPB and POC state and runs the per-picture sequence:
/// POC, gap filling, marking, insertion, reference lists, cleanup.
pub struct PictureManager {
    config: DpbConfig,
    dpb: Arc<Dpb>,
    poc: PocCalculator,
}

impl PictureManager {
    pub fn new(config: DpbConfig, callbacks: Arc<dyn BufferCallbacks>) -> Self {
        let dpb = Arc::new(Dpb::new(&config, callbacks));

        Self {
            config,
            dpb,
            poc: PocCalculator::new(),
        }
    }

    /// The DPB, shareable with the decode-completion path.
    pub fn dpb(&self) -> &Arc<Dpb> {
        &self.dpb
    }

    /// Run the whole control-plane sequence for one picture. `frame` and `mv`
    /// are the buffers the hardware will decode into.
    ///
    /// Errors are stream-conformance violations; the picture must be dropped
    /// and no state is rolled back.
    pub fn handle_picture(
        &mut self,
        slice: &SliceDesc,
        frame: FrameBufferId,
        mv: MvBufferId,
    ) -> anyhow::Result<CurrentPicture> {
        let max_frame_num = self.config.max_frame_num();
        let after_clear = self.dpb.take_mmco5();

        let mut cur_poc = self
            .poc
            .calculate(slice, &self.config, after_clear)
            .with_context(|| format!("picture with frame_num {}", slice.frame_num))?;

        if slice.is_idr {
            // An IDR starts over: drain pending output, then empty the DPB.
            self.dpb.flush();
        } else if self.config.gaps_allowed {
            self.fill_frame_num_gaps(slice.frame_num)?;
        }

        let marking = self.dpb.marking_process(slice, max_frame_num)?;

        // Clearing all references rewrites the current picture as the start
        // of the ordering: its derived fields collapse to zero and the POC
        // state is re-seeded for the next picture.
        let mut frame_num = slice.frame_num;
        let mut poc_lsb = slice.poc_lsb;
        if slice.has_mmco5() {
            cur_poc = 0;
            frame_num = 0;
            poc_lsb = 0;
            self.poc.reset_after_clear();
        }

        self.dpb.increment_latencies(cur_poc);

        // A leftover reference with the same POC can no longer be addressed
        // unambiguously; push it out before storing the new picture.
        if let Some(stale) = self.dpb.search_poc(cur_poc) {
            debug!("displacing older picture with POC {}", cur_poc);
            self.dpb.display(stale);
            self.dpb.remove(stale);
        }

        let node = self.dpb.insert(PictureDesc {
            frame_poc: cur_poc,
            poc_lsb,
            frame_buffer: Some(frame),
            mv_buffer: Some(mv),
            output_flag: slice.output_flag,
            reference: marking.reference,
            long_term_frame_idx: marking.long_term_frame_idx,
            slice_frame_num: frame_num,
            non_existing: false,
        })?;

        let ref_lists = self
            .dpb
            .build_ref_pic_lists(slice, cur_poc, max_frame_num)?;

        self.dpb.cleanup();
        self.poc.set_prev_frame_num(frame_num);

        Ok(CurrentPicture {
            node,
            poc: cur_poc,
            ref_lists,
        })
    }

    /// 7.4.3: a `frame_num` jump of more than one means undecoded reference
    /// frames; each missing value gets a synthetic node so that later wrap
    /// arithmetic and sliding windows stay correct.
    ///
    /// The loop is bounded by the `frame_num` range, never by recursion
    /// depth.
    fn fill_frame_num_gaps(&mut self, frame_num: u32) -> anyhow::Result<()> {
        let max_frame_num = self.config.max_frame_num();
        let prev = self.poc.prev_frame_num();

        if frame_num == prev || frame_num == (prev + 1) % max_frame_num {
            return Ok(());
        }

        let mut missing = (prev + 1) % max_frame_num;
        while missing != frame_num {
            debug!("synthesizing non-existing frame_num {}", missing);

            // Adaptive marking is forced off for synthetic pictures; only the
            // sliding window applies.
            let synthetic = SliceDesc {
                frame_num: missing,
                is_reference: true,
                ..Default::default()
            };

            let poc = self.poc.calculate(&synthetic, &self.config, false)?;
            let marking = self.dpb.marking_process(&synthetic, max_frame_num)?;
            self.dpb.insert(PictureDesc {
                frame_poc: poc,
                poc_lsb: poc.rem_euclid(self.config.max_poc_lsb() as i32) as u32,
                frame_buffer: None,
                mv_buffer: None,
                output_flag: false,
                reference: marking.reference,
                long_term_frame_idx: None,
                slice_frame_num: missing,
                non_existing: true,
            })?;
            self.dpb.cleanup();
            self.poc.set_prev_frame_num(missing);

            missing = (missing + 1) % max_frame_num;
        }

        Ok(())
    }

    /// Decode-completion: the hardware finished writing `frame`.
    pub fn end_decoding(&self, frame: FrameBufferId) {
        self.dpb.end_decoding(frame);
    }

    pub fn get_display_buffer(&self) -> Option<FrameBufferId> {
        self.dpb.get_display_buffer()
    }

    pub fn release_display_buffer(&self) -> Option<FrameBufferId> {
        self.dpb.release_display_buffer()
    }

    /// End of stream: drain everything still pending to the display FIFO.
    pub fn flush(&mut self) {
        self.dpb.flush();
    }
}
