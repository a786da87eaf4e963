// Swapchain - Window presentation
//
// Manages the chain of images the result is blitted into and presented.
// Images are only ever transfer destinations, so no image views are needed.

use anyhow::{Context, Result};
use ash::prelude::VkResult;
use ash::vk;
use super::VulkanDevice;

/// Preferred swapchain format. Blits convert from the RGBA texture.
const PREFERRED_FORMAT: vk::Format = vk::Format::B8G8R8A8_UNORM;

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub swapchain_loader: ash::extensions::khr::Swapchain,
    pub images: Vec<vk::Image>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl Swapchain {
    pub fn new(
        device: &VulkanDevice,
        surface: vk::SurfaceKHR,
        surface_loader: &ash::extensions::khr::Surface,
        width: u32,
        height: u32,
        requested_present_mode: vk::PresentModeKHR,
    ) -> Result<Self> {
        log::info!("Creating swapchain: {}x{}", width, height);

        // Query surface capabilities
        let surface_caps = unsafe {
            surface_loader.get_physical_device_surface_capabilities(
                device.physical_device,
                surface,
            )
        }?;

        // Query supported formats
        let formats = unsafe {
            surface_loader.get_physical_device_surface_formats(
                device.physical_device,
                surface,
            )
        }?;

        // Query supported present modes
        let present_modes = unsafe {
            surface_loader.get_physical_device_surface_present_modes(
                device.physical_device,
                surface,
            )
        }?;

        // Swapchain images are optimal tiling and only ever blit destinations
        let blit_destination = |format: vk::Format| {
            let props = unsafe {
                device
                    .instance
                    .get_physical_device_format_properties(device.physical_device, format)
            };
            props
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::BLIT_DST)
        };

        let surface_format = choose_surface_format(&formats, blit_destination)
            .context("No surface format can be a blit destination")?;
        log::info!("Surface format: {:?}", surface_format.format);

        // FIFO is always supported
        let present_mode = if present_modes.contains(&requested_present_mode) {
            requested_present_mode
        } else {
            log::warn!("{:?} not supported, falling back to FIFO", requested_present_mode);
            vk::PresentModeKHR::FIFO
        };

        log::info!("Present mode: {:?}", present_mode);

        // Choose extent
        let extent = if surface_caps.current_extent.width != u32::MAX {
            surface_caps.current_extent
        } else {
            vk::Extent2D {
                width: width.clamp(
                    surface_caps.min_image_extent.width,
                    surface_caps.max_image_extent.width,
                ),
                height: height.clamp(
                    surface_caps.min_image_extent.height,
                    surface_caps.max_image_extent.height,
                ),
            }
        };

        // One image in the background to work on
        let mut image_count = surface_caps.min_image_count + 1;
        if surface_caps.max_image_count > 0 && image_count > surface_caps.max_image_count {
            image_count = surface_caps.max_image_count;
        }

        if !surface_caps
            .supported_usage_flags
            .contains(vk::ImageUsageFlags::TRANSFER_DST)
        {
            anyhow::bail!("Surface images cannot be blit destinations");
        }

        // Create swapchain
        let swapchain_loader = ash::extensions::khr::Swapchain::new(&device.instance, &device.device);

        let queue_family_indices = [device.queue_family];
        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .queue_family_indices(&queue_family_indices)
            .pre_transform(surface_caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        // Get swapchain images
        let images = match unsafe { swapchain_loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { swapchain_loader.destroy_swapchain(swapchain, None) };
                return Err(e).context("Failed to query swapchain images");
            }
        };

        log::info!("Created swapchain with {} images", images.len());

        Ok(Self {
            swapchain,
            swapchain_loader,
            images,
            format: surface_format.format,
            extent,
        })
    }

    /// Acquire next image, signaling `semaphore` once it is ready to be written
    ///
    /// Errors are returned as-is: the frame loop decides what a failed acquire means.
    pub fn acquire_next_image(&self, timeout: u64, semaphore: vk::Semaphore) -> VkResult<u32> {
        let (index, suboptimal) = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                timeout,
                semaphore,
                vk::Fence::null(),
            )
        }?;

        if suboptimal {
            log::debug!("Swapchain is suboptimal for the surface");
        }
        Ok(index)
    }

    /// Present an image once all `wait_semaphores` are signaled
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> VkResult<()> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let suboptimal = unsafe { self.swapchain_loader.queue_present(queue, &present_info) }?;
        if suboptimal {
            log::debug!("Presented to a suboptimal swapchain");
        }
        Ok(())
    }

    /// # Safety
    /// No submitted work may still reference the swapchain images.
    pub unsafe fn destroy(&self) {
        self.swapchain_loader.destroy_swapchain(self.swapchain, None);
    }
}

/// Prefer BGRA8 UNORM, otherwise the first format `blit_destination` accepts.
/// A lone UNDEFINED entry means the surface takes anything.
fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    blit_destination: impl Fn(vk::Format) -> bool,
) -> Option<vk::SurfaceFormatKHR> {
    if let [only] = formats {
        if only.format == vk::Format::UNDEFINED {
            return Some(vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: only.color_space,
            })
            .filter(|f| blit_destination(f.format));
        }
    }

    if let Some(preferred) = formats
        .iter()
        .find(|f| f.format == PREFERRED_FORMAT && blit_destination(f.format))
    {
        return Some(*preferred);
    }

    let fallback = formats.iter().find(|f| blit_destination(f.format)).copied();
    if let Some(format) = fallback {
        log::warn!("{:?} unavailable, presenting as {:?}", PREFERRED_FORMAT, format.format);
    }
    fallback
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    fn any(_: vk::Format) -> bool {
        true
    }

    #[test]
    fn prefers_bgra_unorm() {
        let formats = [format(vk::Format::B8G8R8A8_SRGB), format(vk::Format::B8G8R8A8_UNORM)];
        assert_eq!(choose_surface_format(&formats, any).map(|f| f.format), Some(PREFERRED_FORMAT));
    }

    #[test]
    fn undefined_surface_takes_rgba() {
        let formats = [format(vk::Format::UNDEFINED)];
        assert_eq!(
            choose_surface_format(&formats, any).map(|f| f.format),
            Some(vk::Format::R8G8B8A8_UNORM)
        );
        assert!(choose_surface_format(&formats, |_| false).is_none());
    }

    #[test]
    fn falls_back_to_first_blittable_format() {
        let formats = [
            format(vk::Format::A2B10G10R10_UNORM_PACK32),
            format(vk::Format::B8G8R8A8_UNORM),
            format(vk::Format::R8G8B8A8_SRGB),
        ];
        // The preferred format is listed but cannot be blitted to
        let no_bgra = |f: vk::Format| f != vk::Format::B8G8R8A8_UNORM;
        assert_eq!(
            choose_surface_format(&formats, no_bgra).map(|f| f.format),
            Some(vk::Format::A2B10G10R10_UNORM_PACK32)
        );

        let only_srgb = |f: vk::Format| f == vk::Format::R8G8B8A8_SRGB;
        assert_eq!(
            choose_surface_format(&formats, only_srgb).map(|f| f.format),
            Some(vk::Format::R8G8B8A8_SRGB)
        );
    }

    #[test]
    fn nothing_blittable_is_no_format() {
        let formats = [format(vk::Format::B8G8R8A8_UNORM)];
        assert!(choose_surface_format(&formats, |_| false).is_none());
        assert!(choose_surface_format(&[], any).is_none());
    }
}
