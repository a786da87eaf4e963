// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash, every component holds the device it was created with
// Ownership: each wrapper destroys its own handles in Drop

pub mod barrier;
pub mod buffer;
pub mod device;
pub mod pipeline;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod texture;

pub use device::VulkanDevice;
pub use pipeline::ComputePipeline;
pub use surface::WindowSurface;
pub use texture::Texture;
