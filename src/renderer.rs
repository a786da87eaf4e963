// =============================================================================
// RENDERER - the Vulkan side of the frame loop
// =============================================================================
//
// Ties the device, the window surface, the compute target and the transform
// pipeline together and implements `FrameDriver` for them.
//
// PER-FRAME COMMAND SEQUENCE:
// ┌──────────────────────────────────────────────────────────────────────┐
// │  first frame only:                                                   │
// │    texture UNDEFINED -> GENERAL, copy staging -> texture,            │
// │    transform level 0, barrier, transform level 1                     │
// │  every frame:                                                        │
// │    swap image UNDEFINED -> TRANSFER_DST, texture -> TRANSFER_SRC     │
// │    blit texture -> swap image                                        │
// │    swap image -> PRESENT_SRC, texture -> GENERAL                     │
// └──────────────────────────────────────────────────────────────────────┘

use anyhow::{Context, Result};
use ash::prelude::VkResult;
use ash::vk;
use std::path::Path;
use std::sync::Arc;
use winit::window::Window;

use crate::backend::barrier::{BarrierBatch, ImageState, Transition};
use crate::backend::pipeline::PASS_COUNT;
use crate::backend::{ComputePipeline, Texture, VulkanDevice, WindowSurface};
use crate::config::Config;
use crate::frame::{FrameDriver, Phase};

/// Format of the compute target, matches the shader's `rgba8` image
const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

/// Owns every GPU resource of the demo.
///
/// IMPORTANT: Field order matters for Drop! Pipeline, texture and window
/// surface go first, the device (via its last Arc) goes last.
pub struct Renderer {
    pipeline: ComputePipeline,
    texture: Texture,
    surface: WindowSurface,

    // ─────────────────────────────────────────────────────────────────────────
    // COMMANDS & DESCRIPTORS (destroyed in Drop::drop)
    // ─────────────────────────────────────────────────────────────────────────
    command_pool: vk::CommandPool,
    /// One command buffer per ring slot
    command_buffers: Vec<vk::CommandBuffer>,
    descriptor_pool: vk::DescriptorPool,
    /// One descriptor set per ring slot, all pointing at the texture
    descriptor_sets: Vec<vk::DescriptorSet>,

    block_dim: u32,
    fence_timeout: u64,
    /// The acquire semaphore is waited on before color output
    wait_stages: [vk::PipelineStageFlags; 1],

    device: Arc<VulkanDevice>,
}

impl Renderer {
    pub fn new(device: Arc<VulkanDevice>, window: Arc<Window>, config: &Config) -> Result<Self> {
        log::info!("Creating renderer...");

        let surface = WindowSurface::new(device.clone(), window, config.get_present_mode())?;

        let (width, height) = (config.window.width, config.window.height);
        let mut texture = Texture::new(device.clone(), width, height, TEXTURE_FORMAT, TEXTURE_FORMAT)?;

        let pixels = load_pixels(&config.image.path, width, height)?;
        texture.write_staging(&pixels)?;

        let pipeline = ComputePipeline::new(device.clone(), texture.desc_layout, &config.compute.shader)?;

        let mut renderer = Self {
            pipeline,
            texture,
            surface,
            command_pool: vk::CommandPool::null(),
            command_buffers: Vec::new(),
            descriptor_pool: vk::DescriptorPool::null(),
            descriptor_sets: Vec::new(),
            block_dim: config.compute.block_dim,
            fence_timeout: config.fence_timeout_ns(),
            wait_stages: [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
            device: device.clone(),
        };

        let slot_count = renderer.surface.slot_count() as u32;

        // ─────────────────────────────────────────────────────────────────────
        // Command pool & buffers (one per slot)
        // ─────────────────────────────────────────────────────────────────────
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.queue_family)
            // TRANSIENT: Command buffers are re-recorded every frame
            // RESET: Allow individual buffer reset
            .flags(vk::CommandPoolCreateFlags::TRANSIENT | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        renderer.command_pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(renderer.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(slot_count);

        renderer.command_buffers = unsafe { device.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffers")?;

        // ─────────────────────────────────────────────────────────────────────
        // Descriptor pool & sets (one per slot)
        // ─────────────────────────────────────────────────────────────────────
        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_IMAGE,
            descriptor_count: slot_count,
        }];
        let descriptor_pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(slot_count)
            .pool_sizes(&pool_sizes);

        renderer.descriptor_pool = unsafe { device.device.create_descriptor_pool(&descriptor_pool_info, None) }
            .context("Failed to create descriptor pool")?;

        let set_layouts = vec![renderer.texture.desc_layout; slot_count as usize];
        let set_alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(renderer.descriptor_pool)
            .set_layouts(&set_layouts);

        renderer.descriptor_sets = unsafe { device.device.allocate_descriptor_sets(&set_alloc_info) }
            .context("Failed to allocate descriptor sets")?;

        renderer.texture.write_as_storage_descriptor(&renderer.descriptor_sets);

        log::info!(
            "Renderer ready: {} slots, swapchain {}x{} {:?}",
            slot_count,
            renderer.surface.extent().width,
            renderer.surface.extent().height,
            renderer.surface.format()
        );

        Ok(renderer)
    }

    pub fn slot_count(&self) -> usize {
        self.surface.slot_count()
    }

    fn record_blit(&self, cmd: vk::CommandBuffer, destination: vk::Image) {
        let subresource = vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };

        let extent = self.surface.extent();
        let region = vk::ImageBlit {
            src_subresource: subresource,
            src_offsets: self.texture.blit_bounds(),
            dst_subresource: subresource,
            dst_offsets: [
                vk::Offset3D { x: 0, y: 0, z: 0 },
                vk::Offset3D {
                    x: extent.width as i32,
                    y: extent.height as i32,
                    z: 1,
                },
            ],
        };

        unsafe {
            self.device.device.cmd_blit_image(
                cmd,
                self.texture.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                destination,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
                vk::Filter::NEAREST,
            );
        }
    }
}

impl FrameDriver for Renderer {
    fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
        self.surface.wait_for_slot(slot, self.fence_timeout)
    }

    fn acquire_image(&mut self, slot: usize) -> VkResult<u32> {
        self.surface.acquire_next_image(slot)
    }

    fn record(&mut self, slot: usize, image_index: u32, phase: Phase) -> Result<()> {
        let device = &self.device.device;
        let cmd = self.command_buffers[slot];

        // ─────────────────────────────────────────────────────────────────────
        // Begin recording (implicitly resets the buffer)
        // ─────────────────────────────────────────────────────────────────────
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(cmd, &begin_info) }
            .context("Failed to begin command buffer")?;

        // ─────────────────────────────────────────────────────────────────────
        // ONE-TIME WORK: upload + transform
        // ─────────────────────────────────────────────────────────────────────
        if phase == Phase::Uninitialized {
            log::info!("Recording image upload and {} transform passes", PASS_COUNT);

            self.texture.transition_layout(cmd, Transition::upload_destination());
            self.texture.upload_image_data(cmd)?;
            self.texture.transition_layout(cmd, Transition::upload_to_compute());

            self.pipeline.record_transform(
                cmd,
                self.descriptor_sets[slot],
                &mut self.texture,
                self.block_dim,
            );
        }

        // ─────────────────────────────────────────────────────────────────────
        // BLIT: texture -> acquired swapchain image
        // ─────────────────────────────────────────────────────────────────────
        // The swap image never keeps a layout across frames, the presentation
        // engine owns it between present and the next acquire.
        let mut swap_image = ImageState::undefined(self.surface.image(image_index));

        let mut to_transfer = BarrierBatch::new();
        to_transfer.push(&mut swap_image, Transition::blit_destination());
        self.texture.push_transition(&mut to_transfer, Transition::blit_source());
        unsafe { to_transfer.record(device, cmd) };

        self.record_blit(cmd, swap_image.image());

        let mut to_present = BarrierBatch::new();
        to_present.push(&mut swap_image, Transition::present_source());
        self.texture.push_transition(&mut to_present, Transition::back_to_general());
        unsafe { to_present.record(device, cmd) };

        // ─────────────────────────────────────────────────────────────────────
        // End recording
        // ─────────────────────────────────────────────────────────────────────
        unsafe { device.end_command_buffer(cmd) }.context("Failed to end command buffer")?;

        Ok(())
    }

    fn submit(&mut self, slot: usize) -> Result<()> {
        let sync = self.surface.slot(slot);

        let wait_semaphores = [sync.image_acquired];
        let signal_semaphores = [sync.present_ready];
        let command_buffers = [self.command_buffers[slot]];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)      // Wait for image to be available
            .wait_dst_stage_mask(&self.wait_stages) // Which stage waits
            .command_buffers(&command_buffers)      // Commands to execute
            .signal_semaphores(&signal_semaphores); // Signal when done

        self.surface.reset_slot(slot)?;

        unsafe {
            self.device.device.queue_submit(
                self.device.queue,
                &[submit_info.build()],
                sync.in_flight,  // Signal this fence when GPU is done
            )
        }
        .context("Failed to submit frame")
    }

    fn present(&mut self, slot: usize, image_index: u32) -> VkResult<()> {
        self.surface.present(slot, image_index)
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Cleaning up renderer...");

        // Every slot must be finished before anything it used goes away
        if let Err(e) = self.surface.wait_all(u64::MAX) {
            log::error!("{:#}", e);
        }
        if let Err(e) = self.device.wait_idle() {
            log::error!("{:#}", e);
        }

        unsafe {
            // Destroying the pools frees their sets and buffers
            self.device.device.destroy_descriptor_pool(self.descriptor_pool, None);
            self.device.device.destroy_command_pool(self.command_pool, None);
        }

        // Pipeline, texture and surface drop next, in field order
    }
}

/// Decode `path` as tightly packed RGBA8 at exactly `width` x `height`
pub fn load_pixels(path: &Path, width: u32, height: u32) -> Result<Vec<u8>> {
    let image = image::open(path).with_context(|| format!("Failed to load image {:?}", path))?;

    log::info!(
        "Loaded {:?}: {}x{} {:?}",
        path,
        image.width(),
        image.height(),
        image.color()
    );

    let image = if (image.width(), image.height()) != (width, height) {
        log::warn!(
            "Resizing {}x{} image to the {}x{} texture",
            image.width(),
            image.height(),
            width,
            height
        );
        image.resize_exact(width, height, image::imageops::FilterType::Triangle)
    } else {
        image
    };

    Ok(image.into_rgba8().into_raw())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_test_png(name: &str, width: u32, height: u32) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("haar-demo-{}-{}.png", std::process::id(), name));
        let image = image::RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x * 40) as u8, (y * 40) as u8, 200])
        });
        image.save(&path).unwrap();
        path
    }

    #[test]
    fn rgb_input_becomes_rgba() {
        let path = write_test_png("rgb", 4, 2);
        let pixels = load_pixels(&path, 4, 2).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(pixels.len(), 4 * 2 * 4);
        // Pixel (1, 1)
        assert_eq!(&pixels[(4 + 1) * 4..(4 + 1) * 4 + 4], &[40, 40, 200, 255]);
    }

    #[test]
    fn mismatched_size_is_resized_to_the_texture() {
        let path = write_test_png("resize", 3, 5);
        let pixels = load_pixels(&path, 8, 6).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(pixels.len(), 8 * 6 * 4);
        assert!(pixels.chunks_exact(4).all(|px| px[3] == 255));
    }

    #[test]
    fn missing_image_is_an_error() {
        let err = load_pixels(Path::new("no/such/image.png"), 4, 4).unwrap_err();
        assert!(format!("{:#}", err).contains("no/such/image.png"));
    }
}
