// Copyright 2025 eraflo
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per-frame GPU fences gating reuse of dynamic buffer ring slices.
//!
//! Each of the N ring slots holds at most one fence. A slot goes
//! `Empty -> Pending -> (signaled) -> Empty`: the fence is inserted when the frame
//! that wrote the slot is submitted, and cleared once a wait or poll observed it.
//! Fences complete in submission order, so observing one implies every older one.

use khora_core::renderer::{BufferDevice, FenceId, ResourceError};

/// The state of one ring slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FenceSlot {
    /// No GPU work is outstanding for this slot.
    #[default]
    Empty,
    /// Work was submitted; the fence has not been observed signaled yet.
    Pending(FenceId),
}

/// What [`FrameFenceRing::wait_for_specific_frame`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameWait {
    /// The frame had not been submitted: a throwaway fence was waited on.
    FullStall,
    /// One ring fence was waited on.
    Waited,
    /// The frame was already known to be finished.
    AlreadyFinished,
}

/// The multi-buffering coordinator.
#[derive(Debug, Clone)]
pub struct FrameFenceRing {
    slots: Vec<FenceSlot>,
    current: usize,
    frame_count: u32,
}

impl FrameFenceRing {
    /// Creates a ring of `multiplier` empty slots.
    pub fn new(multiplier: u8) -> Self {
        Self {
            slots: vec![FenceSlot::Empty; usize::from(multiplier.max(1))],
            current: 0,
            frame_count: 0,
        }
    }

    /// Number of ring slots (N).
    pub fn multiplier(&self) -> usize {
        self.slots.len()
    }

    /// The ring slot the CPU writes this frame.
    pub fn current_slot(&self) -> u8 {
        self.current as u8
    }

    /// Frames advanced so far.
    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    /// State of a slot.
    pub fn slot(&self, index: usize) -> FenceSlot {
        self.slots[index]
    }

    /// Blocks until the GPU is done with the current slot, then returns that slot.
    pub fn wait_for_tail_frame(&mut self, device: &dyn BufferDevice) -> Result<u8, ResourceError> {
        if let FenceSlot::Pending(fence) = self.slots[self.current] {
            device.wait_fence(fence)?;
            device.destroy_fence(fence);
            self.slots[self.current] = FenceSlot::Empty;
        }
        Ok(self.current_slot())
    }

    /// Ends a frame: waits on the tail fence, fences the current slot, rotates the cursor.
    ///
    /// This is the only place that blocks during regular frames, bounding how far the
    /// CPU runs ahead of the GPU to N frames.
    ///
    /// If the wait or the fence insertion fails, neither the counter nor the cursor move.
    pub fn advance_frame(&mut self, device: &dyn BufferDevice) -> Result<(), ResourceError> {
        self.wait_for_tail_frame(device)?;
        let fence = device.insert_fence()?;
        self.slots[self.current] = FenceSlot::Pending(fence);
        self.frame_count = self.frame_count.wrapping_add(1);
        self.current = (self.current + 1) % self.slots.len();
        Ok(())
    }

    /// Slot holding the fence of `frame`, if the frame is among the last N.
    fn slot_of(&self, frame: u32) -> Option<usize> {
        let n = self.slots.len();
        let diff = self.frame_count.wrapping_sub(frame) as usize;
        (1..=n)
            .contains(&diff)
            .then(|| (self.current + n - diff) % n)
    }

    /// Clears every slot from the cursor up to `index`, and `index` itself.
    fn clear_through(&mut self, device: &dyn BufferDevice, index: usize) {
        let n = self.slots.len();
        let mut next = self.current;
        loop {
            if let FenceSlot::Pending(fence) = std::mem::take(&mut self.slots[next]) {
                device.destroy_fence(fence);
            }
            if next == index {
                break;
            }
            next = (next + 1) % n;
        }
    }

    /// Blocks until `frame` has finished on the GPU.
    ///
    /// Waiting on the frame still being recorded stalls on a throwaway fence and then
    /// treats every ring slot as finished; the frame counter jumps by N so that no frame
    /// recorded before the stall is ever waited on again. Frames older than N are
    /// already finished.
    pub fn wait_for_specific_frame(
        &mut self,
        device: &dyn BufferDevice,
        frame: u32,
    ) -> Result<FrameWait, ResourceError> {
        if frame == self.frame_count {
            let fence = device.insert_fence()?;
            let waited = device.wait_fence(fence);
            device.destroy_fence(fence);
            waited?;
            self.reset(device);
            self.frame_count = self
                .frame_count
                .wrapping_add(self.slots.len() as u32);
            return Ok(FrameWait::FullStall);
        }

        let Some(index) = self.slot_of(frame) else {
            return Ok(FrameWait::AlreadyFinished);
        };
        match self.slots[index] {
            FenceSlot::Pending(fence) => {
                device.wait_fence(fence)?;
                self.clear_through(device, index);
                Ok(FrameWait::Waited)
            }
            FenceSlot::Empty => Ok(FrameWait::AlreadyFinished),
        }
    }

    /// Non-blocking version of [`wait_for_specific_frame`](Self::wait_for_specific_frame).
    ///
    /// The frame still being recorded is never finished.
    pub fn is_frame_finished(
        &mut self,
        device: &dyn BufferDevice,
        frame: u32,
    ) -> Result<bool, ResourceError> {
        if frame == self.frame_count {
            return Ok(false);
        }
        let Some(index) = self.slot_of(frame) else {
            return Ok(true);
        };
        match self.slots[index] {
            FenceSlot::Pending(fence) => {
                let signaled = device.poll_fence(fence)?;
                if signaled {
                    self.clear_through(device, index);
                }
                Ok(signaled)
            }
            FenceSlot::Empty => Ok(true),
        }
    }

    /// Destroys every outstanding fence without waiting.
    pub fn reset(&mut self, device: &dyn BufferDevice) {
        for slot in &mut self.slots {
            if let FenceSlot::Pending(fence) = std::mem::take(slot) {
                device.destroy_fence(fence);
            }
        }
    }

    /// Forgets every fence without touching the device, which may be gone.
    pub fn discard_all(&mut self) {
        self.slots.fill(FenceSlot::Empty);
    }
}
