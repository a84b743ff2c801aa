// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bounded queue of frames ready to leave for display, in POC order.

use std::collections::HashMap;
use std::collections::VecDeque;

use crate::FrameBufferId;

/// Output lifecycle of a frame buffer as seen by the display path.
///
/// `NotReady` becomes `Ready` exactly once, when the hardware signals end of
/// decoding; the transition never goes back.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum OutputStatus {
    #[default]
    NotNeeded,
    NotReady,
    Ready,
}

#[derive(Debug)]
pub struct DisplayFifo {
    queue: VecDeque<(FrameBufferId, u32)>,
    status: HashMap<FrameBufferId, OutputStatus>,
    capacity: usize,
}

impl DisplayFifo {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity),
            status: HashMap::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Append a frame in display order, carrying its latency count.
    pub fn queue(&mut self, frame: FrameBufferId, latency: u32) {
        debug_assert!(self.queue.len() < self.capacity, "display fifo overflow");
        self.queue.push_back((frame, latency));
    }

    /// The frame at the head, if its decoding already completed.
    pub fn peek_ready(&self) -> Option<FrameBufferId> {
        let &(frame, _) = self.queue.front()?;
        (self.status_of(frame) == OutputStatus::Ready).then_some(frame)
    }

    /// Pop the head frame; its status reverts to `NotNeeded`.
    pub fn dequeue(&mut self) -> Option<FrameBufferId> {
        let (frame, _) = self.queue.pop_front()?;
        self.status.insert(frame, OutputStatus::NotNeeded);
        Some(frame)
    }

    pub fn status_of(&self, frame: FrameBufferId) -> OutputStatus {
        self.status.get(&frame).copied().unwrap_or_default()
    }

    pub fn set_status(&mut self, frame: FrameBufferId, status: OutputStatus) {
        if status == OutputStatus::Ready {
            debug_assert_eq!(
                self.status_of(frame),
                OutputStatus::NotReady,
                "ready is a one-way transition"
            );
        }
        self.status.insert(frame, status);
    }

    pub fn latency_of(&self, frame: FrameBufferId) -> Option<u32> {
        self.queue
            .iter()
            .find(|&&(f, _)| f == frame)
            .map(|&(_, latency)| latency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_is_gated_on_readiness() {
        let mut fifo = DisplayFifo::new(4);

        fifo.set_status(FrameBufferId(7), OutputStatus::NotReady);
        fifo.queue(FrameBufferId(7), 0);
        assert!(fifo.peek_ready().is_none());

        fifo.set_status(FrameBufferId(7), OutputStatus::Ready);
        assert_eq!(fifo.peek_ready(), Some(FrameBufferId(7)));

        assert_eq!(fifo.dequeue(), Some(FrameBufferId(7)));
        assert_eq!(fifo.status_of(FrameBufferId(7)), OutputStatus::NotNeeded);
        assert!(fifo.is_empty());
    }

    #[test]
    fn fifo_order_and_latency() {
        let mut fifo = DisplayFifo::new(4);

        for (id, latency) in [(1, 0), (2, 3), (3, 1)] {
            fifo.set_status(FrameBufferId(id), OutputStatus::NotReady);
            fifo.queue(FrameBufferId(id), latency);
        }

        assert_eq!(fifo.latency_of(FrameBufferId(2)), Some(3));

        // Only the head readiness matters for output.
        fifo.set_status(FrameBufferId(2), OutputStatus::Ready);
        assert!(fifo.peek_ready().is_none());
        fifo.set_status(FrameBufferId(1), OutputStatus::Ready);
        assert_eq!(fifo.peek_ready(), Some(FrameBufferId(1)));
    }
}
