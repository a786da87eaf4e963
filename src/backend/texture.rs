// Compute target texture
//
// One device-local storage image the transform runs on, a persistently
// mapped staging buffer to upload into it, and the descriptor set layouts
// that describe how compute passes bind it.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::MemoryLocation;
use std::sync::Arc;
use super::barrier::{BarrierBatch, ImageState, Transition, COLOR_RANGE};
use super::buffer;
use super::VulkanDevice;

pub struct Texture {
    pub width: u32,
    pub height: u32,
    pub image: vk::Image,
    pub image_view: vk::ImageView,
    /// Binding 0: the image, read and written in place
    pub desc_layout: vk::DescriptorSetLayout,
    /// Bindings 0 and 1: input and output image, for filters that do not work in place
    pub desc_layout_2: vk::DescriptorSetLayout,
    state: ImageState,
    image_allocation: Option<Allocation>,
    staging_buffer: vk::Buffer,
    staging_allocation: Option<Allocation>,
    device: Arc<VulkanDevice>,
}

impl Texture {
    /// Create the image at UNDEFINED layout, plus its view, descriptor layouts and staging buffer
    pub fn new(
        device: Arc<VulkanDevice>,
        width: u32,
        height: u32,
        format: vk::Format,
        view_format: vk::Format,
    ) -> Result<Self> {
        log::info!("Creating texture: {}x{} {:?}", width, height, format);

        let image_info = vk::ImageCreateInfo::builder()
            .flags(vk::ImageCreateFlags::MUTABLE_FORMAT)
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D { width, height, depth: 1 })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(
                vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::STORAGE,
            )
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { device.device.create_image(&image_info, None) }
            .context("Failed to create texture image")?;

        // From here on every handle lives in `texture`, so an early return releases what exists
        let mut texture = Self {
            width,
            height,
            image,
            image_view: vk::ImageView::null(),
            desc_layout: vk::DescriptorSetLayout::null(),
            desc_layout_2: vk::DescriptorSetLayout::null(),
            state: ImageState::undefined(image),
            image_allocation: None,
            staging_buffer: vk::Buffer::null(),
            staging_allocation: None,
            device: device.clone(),
        };

        // Device-local memory for the image
        let requirements = unsafe { device.device.get_image_memory_requirements(image) };
        let allocation = device.allocate("texture", requirements, MemoryLocation::GpuOnly, false)?;
        let bound = unsafe {
            device.device.bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        texture.image_allocation = Some(allocation);
        bound.context("Failed to bind texture memory")?;

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(view_format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::R,
                g: vk::ComponentSwizzle::G,
                b: vk::ComponentSwizzle::B,
                a: vk::ComponentSwizzle::A,
            })
            .subresource_range(COLOR_RANGE);

        texture.image_view = unsafe { device.device.create_image_view(&view_info, None) }
            .context("Failed to create texture image view")?;

        // There is a single storage image in this demo, so its layouts live with it
        let bindings = [
            storage_image_binding(0),
            storage_image_binding(1),
        ];

        texture.desc_layout = create_descriptor_set_layout(&device, &bindings[..1])?;
        texture.desc_layout_2 = create_descriptor_set_layout(&device, &bindings)?;

        // Staging buffer sized for exactly one RGBA8 upload of the image
        let staging_size = vk::DeviceSize::from(width) * vk::DeviceSize::from(height) * 4;
        let (staging_buffer, staging_allocation) = buffer::create_buffer(
            &device,
            "texture staging",
            staging_size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        )?;
        texture.staging_buffer = staging_buffer;
        texture.staging_allocation = Some(staging_allocation);

        Ok(texture)
    }

    /// Layout the image will be in once everything recorded so far executes
    pub fn layout(&self) -> vk::ImageLayout {
        self.state.layout()
    }

    /// Record a single transition and update the tracked layout
    pub fn transition_layout(&mut self, cmd: vk::CommandBuffer, transition: Transition) {
        let mut batch = BarrierBatch::new();
        batch.push(&mut self.state, transition);
        unsafe { batch.record(&self.device.device, cmd) };
    }

    /// Add this image's transition to a batch shared with other images
    pub fn push_transition(&mut self, batch: &mut BarrierBatch, transition: Transition) {
        batch.push(&mut self.state, transition);
    }

    /// Copy pixels into the mapped staging memory. The bytes must match `format`.
    pub fn write_staging(&mut self, pixels: &[u8]) -> Result<()> {
        let allocation = self
            .staging_allocation
            .as_mut()
            .context("Staging buffer already released")?;
        buffer::write_mapped(allocation, pixels)
    }

    /// Record the staging buffer to image copy. The image must be in GENERAL layout.
    pub fn upload_image_data(&self, cmd: vk::CommandBuffer) -> Result<()> {
        if self.layout() != vk::ImageLayout::GENERAL {
            anyhow::bail!("Upload recorded while texture is in {:?}", self.layout());
        }

        let region = vk::BufferImageCopy::builder()
            .buffer_offset(0)
            .buffer_row_length(self.width)
            .buffer_image_height(self.height)
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
            .image_extent(vk::Extent3D {
                width: self.width,
                height: self.height,
                depth: 1,
            })
            .build();

        unsafe {
            self.device.device.cmd_copy_buffer_to_image(
                cmd,
                self.staging_buffer,
                self.image,
                vk::ImageLayout::GENERAL,
                &[region],
            );
        }

        Ok(())
    }

    /// Point binding 0 of every set at this image as a storage image
    pub fn write_as_storage_descriptor(&self, sets: &[vk::DescriptorSet]) {
        let image_info = [vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: self.image_view,
            image_layout: vk::ImageLayout::GENERAL,
        }];

        let writes: Vec<_> = sets
            .iter()
            .map(|&set| {
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(0)
                    .dst_array_element(0)
                    .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                    .image_info(&image_info)
                    .build()
            })
            .collect();

        unsafe { self.device.device.update_descriptor_sets(&writes, &[]) };
    }

    /// Full extent as blit offsets
    pub fn blit_bounds(&self) -> [vk::Offset3D; 2] {
        [
            vk::Offset3D { x: 0, y: 0, z: 0 },
            vk::Offset3D {
                x: self.width as i32,
                y: self.height as i32,
                z: 1,
            },
        ]
    }
}

fn storage_image_binding(binding: u32) -> vk::DescriptorSetLayoutBinding {
    vk::DescriptorSetLayoutBinding::builder()
        .binding(binding)
        .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
        .descriptor_count(1)
        .stage_flags(vk::ShaderStageFlags::COMPUTE)
        .build()
}

fn create_descriptor_set_layout(
    device: &VulkanDevice,
    bindings: &[vk::DescriptorSetLayoutBinding],
) -> Result<vk::DescriptorSetLayout> {
    let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(bindings);

    unsafe {
        device.device.create_descriptor_set_layout(&layout_info, None)
            .context("Failed to create descriptor set layout")
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        let device = &self.device.device;
        unsafe {
            // Null handles are ignored by vkDestroy*
            device.destroy_descriptor_set_layout(self.desc_layout, None);
            device.destroy_descriptor_set_layout(self.desc_layout_2, None);
            device.destroy_buffer(self.staging_buffer, None);
            device.destroy_image_view(self.image_view, None);
            device.destroy_image(self.image, None);
        }

        // Unmapping happens when the allocator releases the block
        if let Some(allocation) = self.staging_allocation.take() {
            self.device.free(allocation);
        }
        if let Some(allocation) = self.image_allocation.take() {
            self.device.free(allocation);
        }
    }
}
