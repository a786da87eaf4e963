// Synchronization primitives
//
// One slot of the frame ring: the fence keeps the CPU from reusing a slot
// the GPU still works on, the semaphores order acquire -> submit -> present.

use ash::vk;
use anyhow::{Context, Result};
use super::VulkanDevice;

/// Frame synchronization - one per ring slot
pub struct FrameSync {
    /// Signaled by acquire, waited on by the submit
    pub image_acquired: vk::Semaphore,
    /// Signaled by the submit, waited on by present
    pub present_ready: vk::Semaphore,
    /// Signaled when the slot's last submission finished
    pub in_flight: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &VulkanDevice) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let fence_info = vk::FenceCreateInfo::builder()
            .flags(vk::FenceCreateFlags::SIGNALED); // Start signaled, the first wait must not block

        let device = &device.device;
        unsafe {
            let image_acquired = device.create_semaphore(&semaphore_info, None)
                .context("Failed to create acquire semaphore")?;
            let present_ready = match device.create_semaphore(&semaphore_info, None) {
                Ok(semaphore) => semaphore,
                Err(e) => {
                    device.destroy_semaphore(image_acquired, None);
                    return Err(e).context("Failed to create present semaphore");
                }
            };
            let in_flight = match device.create_fence(&fence_info, None) {
                Ok(fence) => fence,
                Err(e) => {
                    device.destroy_semaphore(image_acquired, None);
                    device.destroy_semaphore(present_ready, None);
                    return Err(e).context("Failed to create frame fence");
                }
            };

            Ok(Self {
                image_acquired,
                present_ready,
                in_flight,
            })
        }
    }

    /// # Safety
    /// The fence must be signaled and neither semaphore may have a pending operation.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_semaphore(self.image_acquired, None);
        device.destroy_semaphore(self.present_ready, None);
        device.destroy_fence(self.in_flight, None);
    }
}
