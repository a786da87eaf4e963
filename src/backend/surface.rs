// Window surface - the presentable side of the demo
//
// Owns the Vulkan surface for the winit window, the swapchain built on it
// and one FrameSync per swapchain image. Every operation takes the ring slot
// explicitly; which slot is current is the frame loop's business.

use anyhow::{Context, Result};
use ash::prelude::VkResult;
use ash::vk;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::sync::Arc;
use winit::window::Window;
use super::swapchain::Swapchain;
use super::sync::FrameSync;
use super::VulkanDevice;
use crate::frame;

pub struct WindowSurface {
    /// Held so the window outlives the surface created on it
    _window: Arc<Window>,
    surface: vk::SurfaceKHR,
    surface_loader: ash::extensions::khr::Surface,
    swapchain: Swapchain,
    slots: Vec<FrameSync>,
    device: Arc<VulkanDevice>,
}

impl WindowSurface {
    pub fn new(
        device: Arc<VulkanDevice>,
        window: Arc<Window>,
        present_mode: vk::PresentModeKHR,
    ) -> Result<Self> {
        let surface_loader = ash::extensions::khr::Surface::new(&device.entry, &device.instance);

        let surface = unsafe {
            ash_window::create_surface(
                &device.entry,
                &device.instance,
                window.raw_display_handle(),
                window.raw_window_handle(),
                None,
            )
        }
        .context("Failed to create window surface")?;

        let destroy_surface = |e: anyhow::Error| {
            unsafe { surface_loader.destroy_surface(surface, None) };
            e
        };

        // Verify the GPU supports presenting to this surface
        let surface_support = unsafe {
            surface_loader.get_physical_device_surface_support(
                device.physical_device,
                device.queue_family,
                surface,
            )
        }
        .context("Failed to query surface support")
        .map_err(destroy_surface)?;

        if !surface_support {
            return Err(destroy_surface(anyhow::anyhow!(
                "GPU doesn't support presenting to this surface"
            )));
        }

        let size = window.inner_size();
        let swapchain = Swapchain::new(
            &device,
            surface,
            &surface_loader,
            size.width,
            size.height,
            present_mode,
        )
        .map_err(destroy_surface)?;

        let destroy_swapchain = |e: anyhow::Error| {
            unsafe { swapchain.destroy() };
            destroy_surface(e)
        };

        frame::check_slot_count(swapchain.images.len()).map_err(destroy_swapchain)?;

        // One slot per swapchain image
        let mut slots = Vec::with_capacity(swapchain.images.len());
        for _ in 0..swapchain.images.len() {
            match FrameSync::new(&device) {
                Ok(sync) => slots.push(sync),
                Err(e) => {
                    for sync in &slots {
                        unsafe { sync.destroy(&device.device) };
                    }
                    return Err(destroy_swapchain(e));
                }
            }
        }

        Ok(Self {
            _window: window,
            surface,
            surface_loader,
            swapchain,
            slots,
            device,
        })
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, slot: usize) -> &FrameSync {
        &self.slots[slot]
    }

    pub fn image(&self, image_index: u32) -> vk::Image {
        self.swapchain.images[image_index as usize]
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }

    pub fn format(&self) -> vk::Format {
        self.swapchain.format
    }

    /// Block until the slot's last submission finished
    pub fn wait_for_slot(&self, slot: usize, timeout: u64) -> Result<()> {
        let fence = self.slots[slot].in_flight;
        match unsafe { self.device.device.wait_for_fences(&[fence], true, timeout) } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => {
                anyhow::bail!("Frame slot {} did not finish within {} ns", slot, timeout)
            }
            Err(e) => Err(e).context("Failed to wait for frame fence"),
        }
    }

    /// Unsignal the slot's fence. Only valid right before a submit that signals it again.
    pub fn reset_slot(&self, slot: usize) -> Result<()> {
        unsafe { self.device.device.reset_fences(&[self.slots[slot].in_flight]) }
            .context("Failed to reset frame fence")
    }

    /// Acquire the next image, signaling the slot's acquire semaphore
    pub fn acquire_next_image(&self, slot: usize) -> VkResult<u32> {
        self.swapchain
            .acquire_next_image(u64::MAX, self.slots[slot].image_acquired)
    }

    /// Present `image_index` once the slot's submission signaled its present semaphore
    pub fn present(&self, slot: usize, image_index: u32) -> VkResult<()> {
        self.swapchain.present(
            self.device.queue,
            image_index,
            &[self.slots[slot].present_ready],
        )
    }

    /// Wait until every slot's fence is signaled
    pub fn wait_all(&self, timeout: u64) -> Result<()> {
        let fences: Vec<_> = self.slots.iter().map(|sync| sync.in_flight).collect();
        unsafe { self.device.device.wait_for_fences(&fences, true, timeout) }
            .context("Failed to wait for in-flight frames")
    }
}

impl Drop for WindowSurface {
    fn drop(&mut self) {
        // Nothing may be destroyed while a slot is still executing
        if let Err(e) = self.wait_all(u64::MAX) {
            log::error!("{:#}", e);
            if let Err(e) = self.device.wait_idle() {
                log::error!("{:#}", e);
            }
        }

        unsafe {
            for sync in &self.slots {
                sync.destroy(&self.device.device);
            }
            self.swapchain.destroy();
            self.surface_loader.destroy_surface(self.surface, None);
        }
    }
}
