// Compute pipeline creation and dispatch
//
// One pipeline runs one level of the horizontal Haar transform. The level and
// block size reach the shader as push constants.

use anyhow::{Context, Result};
use ash::vk;
use std::path::Path;
use std::sync::Arc;
use super::barrier::Transition;
use super::shader;
use super::texture::Texture;
use super::VulkanDevice;

/// Workgroups cover this many pixels in each axis
pub const DISPATCH_TILE: u32 = 32;

/// Largest block the shader keeps in its local array
pub const MAX_BLOCK_DIM: u32 = 128;

/// Number of transform levels dispatched on the first frame
pub const PASS_COUNT: u32 = 2;

/// Matches the `PushConstants` block in haar2d_hor.comp
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PushConstants {
    pub level: i32,
    pub block_dim: i32,
}

/// Workgroup counts for an image of the given size
pub fn dispatch_grid(width: u32, height: u32) -> [u32; 3] {
    [width.div_ceil(DISPATCH_TILE), height.div_ceil(DISPATCH_TILE), 1]
}

pub struct ComputePipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub shader_module: vk::ShaderModule,
    device: Arc<VulkanDevice>,
}

impl ComputePipeline {
    /// Create the pipeline for `shader_path`, binding `desc_layout` as set 0
    ///
    /// `desc_layout` must stay alive as long as the pipeline.
    pub fn new(
        device: Arc<VulkanDevice>,
        desc_layout: vk::DescriptorSetLayout,
        shader_path: &Path,
    ) -> Result<Self> {
        let shader_module = shader::load_shader_module(&device, shader_path)?;

        let mut pipeline = Self {
            pipeline: vk::Pipeline::null(),
            layout: vk::PipelineLayout::null(),
            shader_module,
            device: device.clone(),
        };

        let push_constant_range = vk::PushConstantRange::builder()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(std::mem::size_of::<PushConstants>() as u32)
            .build();

        let set_layouts = [desc_layout];
        let push_constant_ranges = [push_constant_range];
        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_constant_ranges);

        pipeline.layout = unsafe {
            device.device.create_pipeline_layout(&layout_info, None)
                .context("Failed to create pipeline layout")?
        };

        let entry_point = c"main";
        let stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader_module)
            .name(entry_point)
            .build();

        let pipeline_info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage)
            .layout(pipeline.layout)
            .build();

        let pipelines = unsafe {
            device.device.create_compute_pipelines(
                vk::PipelineCache::null(),
                &[pipeline_info],
                None,
            ).map_err(|(_, e)| e)
                .context("Failed to create compute pipeline")?
        };

        pipeline.pipeline = pipelines[0];
        Ok(pipeline)
    }

    /// Record every transform level over `texture`
    ///
    /// The texture must already be in GENERAL with shader access made visible.
    /// Passes are separated by a barrier so each level reads the previous one's writes.
    pub fn record_transform(
        &self,
        cmd: vk::CommandBuffer,
        descriptor_set: vk::DescriptorSet,
        texture: &mut Texture,
        block_dim: u32,
    ) {
        let device = &self.device.device;
        let [groups_x, groups_y, groups_z] = dispatch_grid(texture.width, texture.height);

        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, self.pipeline);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                self.layout,
                0,
                &[descriptor_set],
                &[],
            );
        }

        for level in 0..PASS_COUNT {
            if level > 0 {
                texture.transition_layout(cmd, Transition::between_passes());
            }

            let constants = PushConstants {
                level: level as i32,
                block_dim: block_dim as i32,
            };

            unsafe {
                device.cmd_push_constants(
                    cmd,
                    self.layout,
                    vk::ShaderStageFlags::COMPUTE,
                    0,
                    bytemuck::bytes_of(&constants),
                );
                device.cmd_dispatch(cmd, groups_x, groups_y, groups_z);
            }
        }
    }
}

impl Drop for ComputePipeline {
    fn drop(&mut self) {
        let device = &self.device.device;
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.layout, None);
            device.destroy_shader_module(self.shader_module, None);
        }
    }
}
