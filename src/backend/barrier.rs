// Image layout tracking and barrier batching
//
// Every image we transition carries the layout the command stream will have
// left it in. A transition reads that layout as its "old layout" and
// overwrites it in the same call, so the tracked value can never go stale
// relative to what has been recorded.

use ash::vk;

/// Covers every mip level and array layer of a color image
pub const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: vk::REMAINING_MIP_LEVELS,
    base_array_layer: 0,
    layer_count: vk::REMAINING_ARRAY_LAYERS,
};

/// Layout of one image as of the last recorded transition
#[derive(Debug, Clone, Copy)]
pub struct ImageState {
    image: vk::Image,
    layout: vk::ImageLayout,
}

impl ImageState {
    pub fn new(image: vk::Image, layout: vk::ImageLayout) -> Self {
        Self { image, layout }
    }

    /// Swapchain images come back from the presentation engine with undefined contents
    pub fn undefined(image: vk::Image) -> Self {
        Self::new(image, vk::ImageLayout::UNDEFINED)
    }

    pub fn image(&self) -> vk::Image {
        self.image
    }

    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    /// Build the barrier for `transition` and move the tracked layout forward
    pub fn transition(&mut self, transition: &Transition) -> vk::ImageMemoryBarrier {
        let barrier = vk::ImageMemoryBarrier::builder()
            .src_access_mask(transition.src_access)
            .dst_access_mask(transition.dst_access)
            .old_layout(self.layout)
            .new_layout(transition.new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(COLOR_RANGE)
            .build();

        self.layout = transition.new_layout;
        barrier
    }
}

/// Target layout plus the access and stage scopes on both sides of a barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub new_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

impl Transition {
    // ─────────────────────────────────────────────────────────────────────────
    // COMPUTE TARGET
    // ─────────────────────────────────────────────────────────────────────────

    /// First use: make the image writable by the staging copy
    pub fn upload_destination() -> Self {
        Self {
            new_layout: vk::ImageLayout::GENERAL,
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::TRANSFER_WRITE,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
        }
    }

    /// Staging copy must land before the first pass reads it
    pub fn upload_to_compute() -> Self {
        Self {
            new_layout: vk::ImageLayout::GENERAL,
            src_access: vk::AccessFlags::TRANSFER_WRITE,
            dst_access: vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_stage: vk::PipelineStageFlags::COMPUTE_SHADER,
        }
    }

    /// Pass n+1 reads what pass n wrote
    pub fn between_passes() -> Self {
        Self {
            new_layout: vk::ImageLayout::GENERAL,
            src_access: vk::AccessFlags::SHADER_WRITE,
            dst_access: vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            src_stage: vk::PipelineStageFlags::COMPUTE_SHADER,
            dst_stage: vk::PipelineStageFlags::COMPUTE_SHADER,
        }
    }

    pub fn blit_source() -> Self {
        Self {
            new_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            src_access: vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            dst_access: vk::AccessFlags::TRANSFER_READ,
            src_stage: vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::TRANSFER,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
        }
    }

    /// Back to the cycle start so the next frame finds GENERAL
    pub fn back_to_general() -> Self {
        Self {
            new_layout: vk::ImageLayout::GENERAL,
            src_access: vk::AccessFlags::TRANSFER_READ,
            dst_access: vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_stage: vk::PipelineStageFlags::ALL_COMMANDS,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // PRESENTABLE IMAGE
    // ─────────────────────────────────────────────────────────────────────────

    /// Source stage matches the acquire semaphore wait stage so the two chain
    pub fn blit_destination() -> Self {
        Self {
            new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::TRANSFER_WRITE,
            src_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
        }
    }

    pub fn present_source() -> Self {
        Self {
            new_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            src_access: vk::AccessFlags::TRANSFER_WRITE,
            dst_access: vk::AccessFlags::empty(),
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_stage: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        }
    }
}

/// Image barriers recorded together in one `vkCmdPipelineBarrier`
///
/// Stage masks are the union over the batch.
#[derive(Debug, Default)]
pub struct BarrierBatch {
    src_stage: vk::PipelineStageFlags,
    dst_stage: vk::PipelineStageFlags,
    barriers: Vec<vk::ImageMemoryBarrier>,
}

impl BarrierBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, state: &mut ImageState, transition: Transition) -> &mut Self {
        self.src_stage |= transition.src_stage;
        self.dst_stage |= transition.dst_stage;
        self.barriers.push(state.transition(&transition));
        self
    }

    #[cfg(test)]
    pub fn src_stage(&self) -> vk::PipelineStageFlags {
        self.src_stage
    }

    #[cfg(test)]
    pub fn dst_stage(&self) -> vk::PipelineStageFlags {
        self.dst_stage
    }

    #[cfg(test)]
    pub fn barriers(&self) -> &[vk::ImageMemoryBarrier] {
        &self.barriers
    }

    /// # Safety
    /// `cmd` must be in the recording state and every image in the batch must outlive its execution.
    pub unsafe fn record(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        if self.barriers.is_empty() {
            return;
        }

        device.cmd_pipeline_barrier(
            cmd,
            self.src_stage,
            self.dst_stage,
            vk::DependencyFlags::BY_REGION,
            &[],  // Memory barriers
            &[],  // Buffer barriers
            &self.barriers,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn target() -> ImageState {
        ImageState::undefined(vk::Image::from_raw(0x1000))
    }

    #[test]
    fn first_frame_cycle_ends_in_general() {
        let mut state = target();

        // Two compute-pass transitions
        let upload = state.transition(&Transition::upload_destination());
        assert_eq!(upload.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(upload.new_layout, vk::ImageLayout::GENERAL);

        let compute = state.transition(&Transition::upload_to_compute());
        assert_eq!(compute.old_layout, vk::ImageLayout::GENERAL);
        assert_eq!(compute.new_layout, vk::ImageLayout::GENERAL);

        // Two presentation-related transitions
        let blit = state.transition(&Transition::blit_source());
        assert_eq!(blit.old_layout, vk::ImageLayout::GENERAL);
        assert_eq!(blit.new_layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);

        let back = state.transition(&Transition::back_to_general());
        assert_eq!(back.old_layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);

        assert_eq!(state.layout(), vk::ImageLayout::GENERAL);
    }

    #[test]
    fn tracked_layout_is_the_next_old_layout() {
        let mut state = target();
        let sequence = [
            Transition::upload_destination(),
            Transition::upload_to_compute(),
            Transition::between_passes(),
            Transition::blit_source(),
            Transition::back_to_general(),
            Transition::blit_source(),
            Transition::back_to_general(),
        ];

        for transition in &sequence {
            let before = state.layout();
            let barrier = state.transition(transition);
            assert_eq!(barrier.old_layout, before);
            assert_eq!(barrier.new_layout, transition.new_layout);
            assert_eq!(state.layout(), transition.new_layout);
            assert_eq!(barrier.image, state.image());
        }
    }

    #[test]
    fn presentable_image_cycle() {
        let mut swap = ImageState::undefined(vk::Image::from_raw(0x2000));

        let to_dst = swap.transition(&Transition::blit_destination());
        assert_eq!(to_dst.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(to_dst.new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);

        let to_present = swap.transition(&Transition::present_source());
        assert_eq!(to_present.old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(swap.layout(), vk::ImageLayout::PRESENT_SRC_KHR);
    }

    #[test]
    fn batch_unions_stages_and_updates_every_image() {
        let mut texture = ImageState::new(vk::Image::from_raw(0x1000), vk::ImageLayout::GENERAL);
        let mut swap = ImageState::undefined(vk::Image::from_raw(0x2000));

        let mut batch = BarrierBatch::new();
        batch
            .push(&mut swap, Transition::blit_destination())
            .push(&mut texture, Transition::blit_source());

        assert_eq!(batch.barriers().len(), 2);
        assert_eq!(
            batch.src_stage(),
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::COMPUTE_SHADER
                | vk::PipelineStageFlags::TRANSFER
        );
        assert_eq!(batch.dst_stage(), vk::PipelineStageFlags::TRANSFER);
        assert_eq!(swap.layout(), vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(texture.layout(), vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
    }

    #[test]
    fn barriers_cover_the_whole_image() {
        let barrier = target().transition(&Transition::upload_destination());
        assert_eq!(barrier.subresource_range.aspect_mask, vk::ImageAspectFlags::COLOR);
        assert_eq!(barrier.subresource_range.level_count, vk::REMAINING_MIP_LEVELS);
        assert_eq!(barrier.src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
    }
}
