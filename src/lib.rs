// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Control-plane state tracking for the decoded picture buffer (DPB) of a
//! hardware video decoder.
//!
//! The hardware owns the pixel data; this crate only tracks picture metadata:
//! picture order counts, reference marking (sliding window and memory
//! management control operations), per-slice reference list construction, and
//! output ordering. Buffer memory is owned by the embedding pool and is
//! reference-counted through the [`BufferCallbacks`] capability trait.

pub mod arena;
pub mod dpb;
pub mod fifo;
pub mod id_pool;
pub mod manager;
pub mod node;
pub mod poc;
pub mod ref_list;
pub mod slice;

/// Handle to a reconstructed frame buffer. Allocated and owned by the
/// embedding frame pool; this crate never dereferences it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FrameBufferId(pub u32);

/// Handle to a motion vector buffer. Opaque, like [`FrameBufferId`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct MvBufferId(pub u32);

/// Consumer-visible picture identifier, recycled from a bounded pool. Distinct
/// from the internal arena index so that downstream hardware descriptors stay
/// stable while the arena reshuffles.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PictureId(pub u8);

/// Capability interface for buffer lifecycle events. Production supplies an
/// adapter over the hardware buffer pools, tests supply a counting stub.
///
/// Callbacks may be invoked with the DPB lock held, from either the control
/// thread or the decode-completion path, hence `Send + Sync`.
pub trait BufferCallbacks: Send + Sync {
    fn increment_frame(&self, id: FrameBufferId);
    fn decrement_frame(&self, id: FrameBufferId);
    fn increment_mv(&self, id: MvBufferId);
    fn decrement_mv(&self, id: MvBufferId);
    /// The frame is leaving for display, in output order.
    fn emit_frame(&self, id: FrameBufferId);
}

/// Static stream parameters the DPB operates under. All values are already
/// validated by the embedding configuration layer.
#[derive(Debug, Clone)]
pub struct DpbConfig {
    /// Maximum number of reference pictures (`max_num_ref_frames`).
    pub max_refs: usize,
    /// Arena capacity: `max_refs` plus the pipeline depth of the hardware.
    pub capacity: usize,
    /// Number of consumer-visible picture identifiers to recycle.
    pub num_pic_ids: usize,
    /// When true, pictures are output as soon as their decoding completes
    /// instead of waiting for reordering.
    pub low_delay: bool,
    /// Picture order count derivation mode (0, 1 or 2).
    pub poc_mode: u8,
    /// `log2` of the `frame_num` wrap range.
    pub log2_max_frame_num: u8,
    /// `log2` of the POC LSB wrap range (mode 0).
    pub log2_max_poc_lsb: u8,
    /// Per-cycle reference offsets (mode 1, `offset_for_ref_frame`).
    pub cycle_offsets: Vec<i32>,
    /// Extra POC offset applied to non-reference pictures (mode 1).
    pub offset_for_non_ref_pic: i32,
    /// Whether `frame_num` gaps are legal in this stream.
    pub gaps_allowed: bool,
}

impl DpbConfig {
    pub fn max_frame_num(&self) -> u32 {
        1 << self.log2_max_frame_num
    }

    pub fn max_poc_lsb(&self) -> u32 {
        1 << self.log2_max_poc_lsb
    }
}

impl Default for DpbConfig {
    fn default() -> Self {
        Self {
            max_refs: 16,
            capacity: 20,
            num_pic_ids: 20,
            low_delay: false,
            poc_mode: 0,
            log2_max_frame_num: 4,
            log2_max_poc_lsb: 4,
            cycle_offsets: Vec::new(),
            offset_for_non_ref_pic: 0,
            gaps_allowed: false,
        }
    }
}
