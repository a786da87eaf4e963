// =============================================================================
// FRAME LOOP - per-frame synchronization protocol
// =============================================================================
//
// The loop cycles through a ring of N slots. Slot `i` owns one fence and two
// semaphores (see backend::sync). Each iteration on slot `frame_index`:
//
//   1. wait for fence[frame_index]     (the only CPU-side backpressure)
//   2. acquire an image                 -> image_index
//   3. record the command sequence
//   4. reset fence[frame_index], submit (fence signals on completion)
//   5. present image_index              -> frame_index advances on success
//
// Sync objects are always picked by `frame_index`. `image_index` only picks
// which swapchain image is written and presented; the two diverge whenever
// the presentation engine hands images back out of order.
//
// Nothing here touches Vulkan directly, the work goes through `FrameDriver`.

use anyhow::Result;
use ash::prelude::VkResult;

/// Upper bound on ring slots. More swapchain images than this is a setup error.
pub const MAX_FRAME_SLOTS: usize = 8;

/// Reject slot counts the ring cannot run with
pub fn check_slot_count(slot_count: usize) -> Result<()> {
    if !(2..=MAX_FRAME_SLOTS).contains(&slot_count) {
        anyhow::bail!(
            "Frame ring needs 2..={} slots, the swapchain negotiated {}",
            MAX_FRAME_SLOTS,
            slot_count
        );
    }
    Ok(())
}

/// Whether the one-time upload and transform still has to be recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Next recorded frame uploads the image and dispatches the transform
    Uninitialized,
    /// Transform is done, frames only blit the result
    Steady,
}

impl Phase {
    /// The only transition: once a frame carrying the one-time work is submitted
    fn after_submit(self) -> Self {
        Phase::Steady
    }
}

/// What happened to one loop iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// Submitted and presented, the ring moved on
    Presented { slot: usize, image_index: u32 },
    /// Acquire failed: nothing was recorded or submitted
    AcquireFailed { slot: usize },
    /// Submitted, but present failed: the ring stays on this slot
    PresentFailed { slot: usize, image_index: u32 },
}

/// The operations one iteration is made of
pub trait FrameDriver {
    /// Block until the slot's previous submission has finished
    fn wait_for_slot(&mut self, slot: usize) -> Result<()>;

    /// Acquire the next presentable image, signaling the slot's acquire semaphore
    fn acquire_image(&mut self, slot: usize) -> VkResult<u32>;

    /// Record the slot's command sequence for `image_index`
    fn record(&mut self, slot: usize, image_index: u32, phase: Phase) -> Result<()>;

    /// Reset the slot's fence and submit the recorded sequence, signaling that fence
    fn submit(&mut self, slot: usize) -> Result<()>;

    /// Present `image_index` after the slot's submission
    fn present(&mut self, slot: usize, image_index: u32) -> VkResult<()>;
}

/// Ring cursor and one-time-work state of the frame loop
#[derive(Debug)]
pub struct FrameLoop {
    slot_count: usize,
    frame_index: usize,
    image_index: Option<u32>,
    phase: Phase,
    presented: u64,
}

impl FrameLoop {
    pub fn new(slot_count: usize) -> Result<Self> {
        check_slot_count(slot_count)?;
        Ok(Self {
            slot_count,
            frame_index: 0,
            image_index: None,
            phase: Phase::Uninitialized,
            presented: 0,
        })
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Slot whose sync objects the next iteration uses
    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    /// Image from the last successful acquire
    pub fn image_index(&self) -> Option<u32> {
        self.image_index
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Successful presents so far
    pub fn presented(&self) -> u64 {
        self.presented
    }

    /// Run one iteration of the protocol
    ///
    /// Acquire and present failures are reported in the status and leave the
    /// loop usable. Any other error is fatal for the loop.
    pub fn run_frame<D: FrameDriver>(&mut self, driver: &mut D) -> Result<FrameStatus> {
        let slot = self.frame_index;

        driver.wait_for_slot(slot)?;

        // The fence stays signaled until the submit, so a failed acquire cannot
        // leave this slot waiting on a fence nothing will signal.
        let image_index = match driver.acquire_image(slot) {
            Ok(index) => index,
            Err(e) => {
                log::warn!("Acquire on slot {} failed: {}, skipping frame", slot, e);
                self.image_index = None;
                return Ok(FrameStatus::AcquireFailed { slot });
            }
        };
        self.image_index = Some(image_index);

        driver.record(slot, image_index, self.phase)?;
        driver.submit(slot)?;
        self.phase = self.phase.after_submit();

        match driver.present(slot, image_index) {
            Ok(()) => {
                self.frame_index = (slot + 1) % self.slot_count;
                self.presented += 1;
                Ok(FrameStatus::Presented { slot, image_index })
            }
            Err(e) => {
                log::warn!("Presenting image {} failed: {}", image_index, e);
                Ok(FrameStatus::PresentFailed { slot, image_index })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Wait(usize),
        Acquire(usize),
        Record { slot: usize, image_index: u32, phase: Phase },
        Submit(usize),
        Present { slot: usize, image_index: u32 },
    }

    /// Simulated GPU: a submission stays in flight until its slot is waited on
    struct MockDriver {
        slots: usize,
        calls: Vec<Call>,
        acquire_results: VecDeque<VkResult<u32>>,
        present_results: VecDeque<VkResult<()>>,
        /// Slot has a submission whose fence nobody waited for yet
        in_flight: Vec<bool>,
        /// Slot was waited on since its last submit
        waited: Vec<bool>,
        max_in_flight: usize,
        next_image: u32,
    }

    impl MockDriver {
        fn new(slots: usize) -> Self {
            Self {
                slots,
                calls: Vec::new(),
                acquire_results: VecDeque::new(),
                present_results: VecDeque::new(),
                in_flight: vec![false; slots],
                waited: vec![false; slots],
                max_in_flight: 0,
                next_image: 0,
            }
        }

        fn init_records(&self) -> usize {
            self.calls
                .iter()
                .filter(|call| matches!(call, Call::Record { phase: Phase::Uninitialized, .. }))
                .count()
        }

        fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
            self.calls.iter().filter(|call| pred(call)).count()
        }
    }

    impl FrameDriver for MockDriver {
        fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
            self.calls.push(Call::Wait(slot));
            self.in_flight[slot] = false;
            self.waited[slot] = true;
            Ok(())
        }

        fn acquire_image(&mut self, slot: usize) -> VkResult<u32> {
            self.calls.push(Call::Acquire(slot));
            self.acquire_results.pop_front().unwrap_or_else(|| {
                // Hand images out in a different order than the slots
                let image = self.next_image;
                self.next_image = (self.next_image + 2) % 3;
                Ok(image)
            })
        }

        fn record(&mut self, slot: usize, image_index: u32, phase: Phase) -> Result<()> {
            assert!(self.waited[slot], "slot {} recorded before its fence signaled", slot);
            assert!(!self.in_flight[slot], "slot {} recorded while in flight", slot);
            self.calls.push(Call::Record { slot, image_index, phase });
            Ok(())
        }

        fn submit(&mut self, slot: usize) -> Result<()> {
            assert!(self.waited[slot], "slot {} submitted without a fence wait", slot);
            self.calls.push(Call::Submit(slot));
            self.waited[slot] = false;
            self.in_flight[slot] = true;
            let in_flight = self.in_flight.iter().filter(|&&busy| busy).count();
            self.max_in_flight = self.max_in_flight.max(in_flight);
            assert!(in_flight <= self.slots);
            Ok(())
        }

        fn present(&mut self, slot: usize, image_index: u32) -> VkResult<()> {
            self.calls.push(Call::Present { slot, image_index });
            self.present_results.pop_front().unwrap_or(Ok(()))
        }
    }

    #[test]
    fn two_slots_five_frames() {
        let mut frames = FrameLoop::new(2).unwrap();
        let mut driver = MockDriver::new(2);
        driver.acquire_results = [Ok(1), Ok(1), Ok(0), Ok(2), Ok(0)].into_iter().collect();

        let mut frame_indices = Vec::new();
        let mut image_indices = Vec::new();
        for iteration in 0..5 {
            let status = frames.run_frame(&mut driver).unwrap();
            assert!(matches!(status, FrameStatus::Presented { .. }));
            frame_indices.push(frames.frame_index());
            image_indices.push(frames.image_index().unwrap());

            let expected_phase = if iteration == 0 { Phase::Uninitialized } else { Phase::Steady };
            let last_record = driver
                .calls
                .iter()
                .rev()
                .find_map(|call| match call {
                    Call::Record { phase, .. } => Some(*phase),
                    _ => None,
                })
                .unwrap();
            assert_eq!(last_record, expected_phase);
        }

        assert_eq!(frame_indices, [1, 0, 1, 0, 1]);
        assert_eq!(image_indices, [1, 1, 0, 2, 0]);
        assert_eq!(driver.init_records(), 1);
        assert_eq!(frames.phase(), Phase::Steady);
        assert_eq!(frames.presented(), 5);
    }

    #[test]
    fn cursor_sequence_before_each_iteration() {
        let mut frames = FrameLoop::new(2).unwrap();
        let mut driver = MockDriver::new(2);

        let mut used = Vec::new();
        for _ in 0..5 {
            used.push(frames.frame_index());
            frames.run_frame(&mut driver).unwrap();
        }
        assert_eq!(used, [0, 1, 0, 1, 0]);
    }

    #[test]
    fn sync_objects_follow_frame_index_not_image_index() {
        let mut frames = FrameLoop::new(3).unwrap();
        let mut driver = MockDriver::new(3);
        driver.acquire_results = [Ok(2), Ok(0), Ok(1)].into_iter().collect();

        for _ in 0..3 {
            frames.run_frame(&mut driver).unwrap();
        }

        let expected = vec![
            Call::Wait(0),
            Call::Acquire(0),
            Call::Record { slot: 0, image_index: 2, phase: Phase::Uninitialized },
            Call::Submit(0),
            Call::Present { slot: 0, image_index: 2 },
            Call::Wait(1),
            Call::Acquire(1),
            Call::Record { slot: 1, image_index: 0, phase: Phase::Steady },
            Call::Submit(1),
            Call::Present { slot: 1, image_index: 0 },
            Call::Wait(2),
            Call::Acquire(2),
            Call::Record { slot: 2, image_index: 1, phase: Phase::Steady },
            Call::Submit(2),
            Call::Present { slot: 2, image_index: 1 },
        ];
        assert_eq!(driver.calls, expected);
    }

    #[test]
    fn failed_acquire_skips_the_rest_of_the_iteration() {
        let mut frames = FrameLoop::new(2).unwrap();
        let mut driver = MockDriver::new(2);
        driver.acquire_results = [
            Ok(0),
            Ok(1),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR),
            Ok(0),
            Ok(1),
        ]
        .into_iter()
        .collect();

        let mut statuses = Vec::new();
        let mut frame_indices = Vec::new();
        for _ in 0..5 {
            statuses.push(frames.run_frame(&mut driver).unwrap());
            frame_indices.push(frames.frame_index());
        }

        assert_eq!(statuses[2], FrameStatus::AcquireFailed { slot: 0 });
        assert_eq!(frames.image_index(), Some(1));
        assert_eq!(frame_indices, [1, 0, 0, 1, 0]);

        // Iteration 3 stopped right after its acquire, iteration 4 retried slot 0
        assert_eq!(
            driver.calls[10..13],
            [Call::Wait(0), Call::Acquire(0), Call::Wait(0)]
        );
        assert_eq!(driver.count(|c| matches!(c, Call::Acquire(_))), 5);
        assert_eq!(driver.count(|c| matches!(c, Call::Record { .. })), 4);
        assert_eq!(driver.count(|c| matches!(c, Call::Submit(_))), 4);
        assert_eq!(driver.count(|c| matches!(c, Call::Present { .. })), 4);
        assert_eq!(frames.presented(), 4);
    }

    #[test]
    fn failed_first_acquire_defers_the_one_time_work() {
        let mut frames = FrameLoop::new(2).unwrap();
        let mut driver = MockDriver::new(2);
        driver.acquire_results = [Err(vk::Result::TIMEOUT), Ok(0)].into_iter().collect();

        assert_eq!(frames.run_frame(&mut driver).unwrap(), FrameStatus::AcquireFailed { slot: 0 });
        assert_eq!(frames.phase(), Phase::Uninitialized);

        frames.run_frame(&mut driver).unwrap();
        assert_eq!(frames.phase(), Phase::Steady);
        assert_eq!(driver.init_records(), 1);
    }

    #[test]
    fn failed_present_keeps_the_cursor() {
        let mut frames = FrameLoop::new(2).unwrap();
        let mut driver = MockDriver::new(2);
        driver.acquire_results = [Ok(0), Ok(1), Ok(1)].into_iter().collect();
        driver.present_results = [Ok(()), Err(vk::Result::ERROR_OUT_OF_DATE_KHR), Ok(())]
            .into_iter()
            .collect();

        frames.run_frame(&mut driver).unwrap();
        assert_eq!(frames.frame_index(), 1);

        let status = frames.run_frame(&mut driver).unwrap();
        assert_eq!(status, FrameStatus::PresentFailed { slot: 1, image_index: 1 });
        assert_eq!(frames.frame_index(), 1);

        // The retry reuses slot 1 only after waiting on its fence again
        frames.run_frame(&mut driver).unwrap();
        assert_eq!(frames.frame_index(), 0);
        assert_eq!(frames.presented(), 2);
        assert_eq!(driver.count(|c| *c == Call::Wait(1)), 2);
    }

    #[test]
    fn frame_index_is_presents_mod_slots() {
        for slots in 2..=MAX_FRAME_SLOTS {
            let mut frames = FrameLoop::new(slots).unwrap();
            let mut driver = MockDriver::new(slots);
            for _ in 0..25 {
                frames.run_frame(&mut driver).unwrap();
                assert_eq!(frames.frame_index() as u64, frames.presented() % slots as u64);
            }
            assert!(driver.max_in_flight <= slots);
            assert_eq!(driver.init_records(), 1);
        }
    }

    #[test]
    fn one_time_work_runs_once_over_many_frames() {
        let mut frames = FrameLoop::new(3).unwrap();
        let mut driver = MockDriver::new(3);
        for _ in 0..1000 {
            frames.run_frame(&mut driver).unwrap();
        }
        assert_eq!(driver.init_records(), 1);
    }

    #[test]
    fn slot_count_is_bounded() {
        assert!(FrameLoop::new(0).is_err());
        assert!(FrameLoop::new(1).is_err());
        assert!(FrameLoop::new(MAX_FRAME_SLOTS + 1).is_err());
        assert_eq!(FrameLoop::new(MAX_FRAME_SLOTS).unwrap().slot_count(), MAX_FRAME_SLOTS);
    }

    #[test]
    fn fatal_errors_propagate() {
        struct FailingSubmit(MockDriver);

        impl FrameDriver for FailingSubmit {
            fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
                self.0.wait_for_slot(slot)
            }
            fn acquire_image(&mut self, slot: usize) -> VkResult<u32> {
                self.0.acquire_image(slot)
            }
            fn record(&mut self, slot: usize, image_index: u32, phase: Phase) -> Result<()> {
                self.0.record(slot, image_index, phase)
            }
            fn submit(&mut self, _slot: usize) -> Result<()> {
                anyhow::bail!("device lost")
            }
            fn present(&mut self, slot: usize, image_index: u32) -> VkResult<()> {
                self.0.present(slot, image_index)
            }
        }

        let mut frames = FrameLoop::new(2).unwrap();
        let mut driver = FailingSubmit(MockDriver::new(2));
        assert!(frames.run_frame(&mut driver).is_err());
        assert_eq!(frames.phase(), Phase::Uninitialized);
        assert_eq!(frames.frame_index(), 0);
        assert_eq!(driver.0.count(|c| matches!(c, Call::Present { .. })), 0);
    }
}
