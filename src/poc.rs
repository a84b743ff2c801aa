// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Picture order count derivation, clause 8.2.1 of the AVC specification.
//!
//! The calculator owns the small rolling state the three modes need. One
//! instance per stream; the lifecycle is create, per-picture [`calculate`]
//! calls, then drop. No cross-instance sharing.
//!
//! [`calculate`]: PocCalculator::calculate

use enumn::N;
use thiserror::Error;

use crate::slice::SliceDesc;
use crate::DpbConfig;

#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
#[repr(u8)]
pub enum PocMode {
    /// Mode 0: LSBs carried per picture, MSB accumulated by wrap detection.
    Explicit = 0,
    /// Mode 1: derived from `frame_num` through a repeating per-cycle delta
    /// table.
    CycleBased = 1,
    /// Mode 2: display order equals decode order, POC = 2 × frame count.
    Alternating = 2,
}

/// An unrecognized mode would corrupt every later picture's ordering, so it
/// is fatal and non-retriable.
#[derive(Debug, Error)]
pub enum PocError {
    #[error("unsupported picture order count mode {0}")]
    UnsupportedMode(u8),
}

/// Rolling state for the three derivation modes.
#[derive(Debug, Default)]
pub struct PocCalculator {
    prev_poc_msb: i32,
    prev_poc_lsb: u32,
    prev_frame_num_offset: i32,
    prev_frame_num: u32,
    /// Order count of the most recent picture, stashed so that the picture
    /// following an all-references-cleared event can substitute it for the
    /// normal rolling state.
    last_order_cnt: i32,
}

impl PocCalculator {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn prev_frame_num(&self) -> u32 {
        self.prev_frame_num
    }

    /// Track the `frame_num` of the picture just finished; modes 1 and 2 use
    /// it for wrap detection, gap filling advances it per synthetic picture.
    pub fn set_prev_frame_num(&mut self, frame_num: u32) {
        self.prev_frame_num = frame_num;
    }

    /// Record that the last picture carried an all-references-cleared
    /// operation: its order count collapses to zero and so does the rolling
    /// frame number.
    pub fn reset_after_clear(&mut self) {
        self.last_order_cnt = 0;
        self.prev_frame_num = 0;
    }

    /// Derive the POC of the picture described by `slice`.
    ///
    /// `after_clear` is set when the previous picture cleared all references;
    /// the stashed order count then replaces the rolling state.
    pub fn calculate(
        &mut self,
        slice: &SliceDesc,
        config: &DpbConfig,
        after_clear: bool,
    ) -> Result<i32, PocError> {
        let mode =
            PocMode::n(config.poc_mode).ok_or(PocError::UnsupportedMode(config.poc_mode))?;

        let poc = match mode {
            PocMode::Explicit => self.calculate_explicit(slice, config, after_clear),
            PocMode::CycleBased => self.calculate_cycle_based(slice, config, after_clear),
            PocMode::Alternating => self.calculate_alternating(slice, config, after_clear),
        };

        self.last_order_cnt = poc;
        Ok(poc)
    }

    fn calculate_explicit(
        &mut self,
        slice: &SliceDesc,
        config: &DpbConfig,
        after_clear: bool,
    ) -> i32 {
        let max_poc_lsb = config.max_poc_lsb() as i32;

        let (mut prev_msb, prev_lsb) = if slice.is_idr {
            (0, 0)
        } else if after_clear {
            // The cleared picture was inferred to have order count 0; its
            // stashed value seeds the wrap detection instead of the rolling
            // pair.
            (0, self.last_order_cnt as u32)
        } else {
            (self.prev_poc_msb, self.prev_poc_lsb)
        };

        // Half-range comparison detects in which direction the LSB wrapped.
        if slice.poc_lsb < prev_lsb && prev_lsb - slice.poc_lsb >= config.max_poc_lsb() / 2 {
            prev_msb += max_poc_lsb;
        } else if slice.poc_lsb > prev_lsb && slice.poc_lsb - prev_lsb > config.max_poc_lsb() / 2 {
            prev_msb -= max_poc_lsb;
        }

        let poc = prev_msb + slice.poc_lsb as i32;

        // Non-reference pictures derive a POC but must not perturb the state
        // later references build on.
        if slice.is_reference {
            self.prev_poc_lsb = slice.poc_lsb;
            self.prev_poc_msb = prev_msb;
        }

        poc
    }

    fn frame_num_offset(&self, slice: &SliceDesc, config: &DpbConfig, after_clear: bool) -> i32 {
        let prev_frame_num = if after_clear { 0 } else { self.prev_frame_num };
        let prev_offset = if after_clear {
            0
        } else {
            self.prev_frame_num_offset
        };

        if slice.is_idr {
            0
        } else if prev_frame_num > slice.frame_num {
            prev_offset + config.max_frame_num() as i32
        } else {
            prev_offset
        }
    }

    fn calculate_cycle_based(
        &mut self,
        slice: &SliceDesc,
        config: &DpbConfig,
        after_clear: bool,
    ) -> i32 {
        let offset = self.frame_num_offset(slice, config, after_clear);

        // An empty cycle table pins abs_frame_num to zero, so the table is
        // never indexed below.
        let mut abs_frame_num = if config.cycle_offsets.is_empty() {
            0
        } else {
            offset + slice.frame_num as i32
        };

        if !slice.is_reference && abs_frame_num > 0 {
            abs_frame_num -= 1;
        }

        let mut expected = 0;
        if abs_frame_num > 0 {
            let cycle_len = config.cycle_offsets.len() as i32;
            let cycles = (abs_frame_num - 1) / cycle_len;
            let in_cycle = (abs_frame_num - 1) % cycle_len;

            let delta_per_cycle: i32 = config.cycle_offsets.iter().sum();
            expected = cycles * delta_per_cycle;

            for i in 0..=in_cycle {
                expected += config.cycle_offsets[i as usize];
            }
        }

        if !slice.is_reference {
            expected += config.offset_for_non_ref_pic;
        }

        self.prev_frame_num_offset = offset;
        expected + slice.delta_poc
    }

    fn calculate_alternating(
        &mut self,
        slice: &SliceDesc,
        config: &DpbConfig,
        after_clear: bool,
    ) -> i32 {
        let offset = self.frame_num_offset(slice, config, after_clear);

        let poc = if slice.is_idr {
            0
        } else if !slice.is_reference {
            2 * (offset + slice.frame_num as i32) - 1
        } else {
            2 * (offset + slice.frame_num as i32)
        };

        self.prev_frame_num_offset = offset;
        poc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slice::SliceDesc;

    fn config(mode: u8) -> DpbConfig {
        DpbConfig {
            poc_mode: mode,
            log2_max_frame_num: 4,
            log2_max_poc_lsb: 4,
            ..Default::default()
        }
    }

    fn slice(frame_num: u32, poc_lsb: u32) -> SliceDesc {
        SliceDesc {
            frame_num,
            poc_lsb,
            is_reference: true,
            output_flag: true,
            ..Default::default()
        }
    }

    #[test]
    fn explicit_monotonic_lsb() {
        let mut poc = PocCalculator::new();
        let cfg = config(0);

        let mut idr = slice(0, 0);
        idr.is_idr = true;
        assert_eq!(poc.calculate(&idr, &cfg, false).unwrap(), 0);

        for (n, lsb) in [(1, 2), (2, 4), (3, 6)] {
            assert_eq!(poc.calculate(&slice(n, lsb), &cfg, false).unwrap(), lsb as i32);
        }
    }

    #[test]
    fn explicit_wraps_forward() {
        let mut poc = PocCalculator::new();
        let cfg = config(0);

        // max_poc_lsb is 16: 14 -> 2 wraps, POC keeps rising.
        let mut idr = slice(0, 0);
        idr.is_idr = true;
        poc.calculate(&idr, &cfg, false).unwrap();
        assert_eq!(poc.calculate(&slice(1, 14), &cfg, false).unwrap(), 14);
        assert_eq!(poc.calculate(&slice(2, 2), &cfg, false).unwrap(), 18);
        assert_eq!(poc.calculate(&slice(3, 6), &cfg, false).unwrap(), 22);
    }

    #[test]
    fn explicit_wraps_backward() {
        let mut poc = PocCalculator::new();
        let cfg = config(0);

        let mut idr = slice(0, 4);
        idr.is_idr = true;
        poc.calculate(&idr, &cfg, false).unwrap();
        // 4 -> 14 with a gap above half the range reads as a backward wrap.
        assert_eq!(poc.calculate(&slice(1, 14), &cfg, false).unwrap(), -2);
    }

    #[test]
    fn explicit_non_reference_keeps_state() {
        let mut poc = PocCalculator::new();
        let cfg = config(0);

        let mut idr = slice(0, 0);
        idr.is_idr = true;
        poc.calculate(&idr, &cfg, false).unwrap();
        poc.calculate(&slice(1, 4), &cfg, false).unwrap();

        let mut non_ref = slice(2, 8);
        non_ref.is_reference = false;
        poc.calculate(&non_ref, &cfg, false).unwrap();

        // The non-reference picture did not advance the rolling pair, so the
        // next reference still compares against lsb 4.
        assert_eq!(poc.prev_poc_lsb, 4);
        assert_eq!(poc.calculate(&slice(3, 6), &cfg, false).unwrap(), 6);
    }

    #[test]
    fn cycle_based_repeats_delta_table() {
        let mut poc = PocCalculator::new();
        let mut cfg = config(1);
        cfg.cycle_offsets = vec![2, 3];

        let mut idr = slice(0, 0);
        idr.is_idr = true;
        assert_eq!(poc.calculate(&idr, &cfg, false).unwrap(), 0);

        // Cycle deltas accumulate 2, 5, 7, 10, ...
        assert_eq!(poc.calculate(&slice(1, 0), &cfg, false).unwrap(), 2);
        assert_eq!(poc.calculate(&slice(2, 0), &cfg, false).unwrap(), 5);
        assert_eq!(poc.calculate(&slice(3, 0), &cfg, false).unwrap(), 7);
        assert_eq!(poc.calculate(&slice(4, 0), &cfg, false).unwrap(), 10);
    }

    #[test]
    fn cycle_based_empty_table_is_flat() {
        let mut poc = PocCalculator::new();
        let cfg = config(1);
        assert!(cfg.cycle_offsets.is_empty());

        let mut idr = slice(0, 0);
        idr.is_idr = true;
        assert_eq!(poc.calculate(&idr, &cfg, false).unwrap(), 0);

        // No cycle table: the expected order count stays zero and only the
        // per-slice delta and non-reference offset contribute.
        assert_eq!(poc.calculate(&slice(1, 0), &cfg, false).unwrap(), 0);

        let mut with_delta = slice(2, 0);
        with_delta.delta_poc = 4;
        assert_eq!(poc.calculate(&with_delta, &cfg, false).unwrap(), 4);
    }

    #[test]
    fn alternating_follows_frame_num() {
        let mut poc = PocCalculator::new();
        let cfg = config(2);

        let mut idr = slice(0, 0);
        idr.is_idr = true;
        assert_eq!(poc.calculate(&idr, &cfg, false).unwrap(), 0);

        poc.set_prev_frame_num(0);
        assert_eq!(poc.calculate(&slice(1, 0), &cfg, false).unwrap(), 2);
        poc.set_prev_frame_num(1);
        assert_eq!(poc.calculate(&slice(2, 0), &cfg, false).unwrap(), 4);

        poc.set_prev_frame_num(2);
        let mut non_ref = slice(3, 0);
        non_ref.is_reference = false;
        assert_eq!(poc.calculate(&non_ref, &cfg, false).unwrap(), 5);
    }

    #[test]
    fn alternating_wraps_with_frame_num() {
        let mut poc = PocCalculator::new();
        let cfg = config(2);

        let mut idr = slice(0, 0);
        idr.is_idr = true;
        poc.calculate(&idr, &cfg, false).unwrap();

        // frame_num wraps at 16; the offset accumulates so POC keeps rising.
        poc.set_prev_frame_num(15);
        assert_eq!(poc.calculate(&slice(0, 0), &cfg, false).unwrap(), 32);
        poc.set_prev_frame_num(0);
        assert_eq!(poc.calculate(&slice(1, 0), &cfg, false).unwrap(), 34);
    }

    #[test]
    fn unsupported_mode_is_fatal() {
        let mut poc = PocCalculator::new();
        let cfg = config(3);

        assert!(matches!(
            poc.calculate(&slice(0, 0), &cfg, false),
            Err(PocError::UnsupportedMode(3))
        ));
    }

    #[test]
    fn clear_substitutes_stashed_order_count() {
        let mut poc = PocCalculator::new();
        let cfg = config(0);

        let mut idr = slice(0, 0);
        idr.is_idr = true;
        poc.calculate(&idr, &cfg, false).unwrap();
        poc.calculate(&slice(1, 10), &cfg, false).unwrap();

        // The clearing picture is inferred to have order count 0.
        poc.reset_after_clear();

        // The next picture seeds wrap detection from the stash, not from the
        // pre-clear rolling state.
        assert_eq!(poc.calculate(&slice(2, 2), &cfg, true).unwrap(), 2);
    }
}
