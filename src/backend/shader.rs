// Shader module loading
//
// Vulkan uses SPIR-V bytecode for shaders. The compute shader is compiled by
// build.rs and read from disk at startup.

use anyhow::{Context, Result};
use ash::vk;
use std::path::Path;
use super::VulkanDevice;

/// Load SPIR-V shader from bytes and create a shader module
pub fn create_shader_module(device: &VulkanDevice, code: &[u8]) -> Result<vk::ShaderModule> {
    // read_spv copies into properly aligned u32 words and checks the magic number
    let words = ash::util::read_spv(&mut std::io::Cursor::new(code))
        .context("Shader is not valid SPIR-V")?;

    let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);

    unsafe {
        device.device.create_shader_module(&create_info, None)
            .context("Failed to create shader module")
    }
}

/// Read a compiled shader from disk and create a shader module
pub fn load_shader_module(device: &VulkanDevice, path: &Path) -> Result<vk::ShaderModule> {
    let code = std::fs::read(path)
        .with_context(|| format!("Failed to read shader {:?} (is glslc installed?)", path))?;

    log::info!("Loaded shader {:?} ({} bytes)", path, code.len());
    create_shader_module(device, &code)
}
