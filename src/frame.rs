//! Double-buffered frame recording and the ray tracing output image.

use crate::context::GpuContext;
use crate::device::{CommandListId, Device, FenceValue, ImageId};
use crate::Result;

pub const FRAME_COUNT: usize = 2;

/// Round-robins command lists across frames.
///
/// A slot is only reset once the fence of the frame that last used it has
/// completed, so recording frame N+1 overlaps the GPU draining frame N.
#[derive(Debug)]
pub struct FrameRing {
    lists: [CommandListId; FRAME_COUNT],
    fences: [Option<FenceValue>; FRAME_COUNT],
    frame: u64,
    recording: bool,
}

impl FrameRing {
    pub fn new<D>(device: &mut D) -> Result<Self>
    where
        D: Device + ?Sized,
    {
        let lists = array_init::try_array_init(|_| device.create_command_list())?;

        Ok(Self {
            lists,
            fences: [None; FRAME_COUNT],
            frame: 0,
            recording: false,
        })
    }

    fn slot(&self) -> usize {
        (self.frame % FRAME_COUNT as u64) as usize
    }

    /// Waits for the slot's previous frame, then resets and returns its list.
    pub fn begin<D>(&mut self, device: &mut D) -> Result<CommandListId>
    where
        D: Device + ?Sized,
    {
        debug_assert!(!self.recording, "begin called twice without end");

        let slot = self.slot();

        if let Some(fence) = self.fences[slot] {
            device.wait_for_fence(fence)?;
        }

        device.reset_command_list(self.lists[slot])?;
        self.recording = true;

        Ok(self.lists[slot])
    }

    /// Submits the current list and remembers its fence for the slot.
    pub fn end<D>(&mut self, device: &mut D) -> Result<FenceValue>
    where
        D: Device + ?Sized,
    {
        let slot = self.slot();
        let fence = device.submit(&[self.lists[slot]])?;

        self.fences[slot] = Some(fence);
        self.frame += 1;
        self.recording = false;

        Ok(fence)
    }

    /// Blocks until every submitted frame has completed.
    pub fn flush<D>(&mut self, device: &mut D) -> Result<()>
    where
        D: Device + ?Sized,
    {
        for fence in self.fences.iter().flatten() {
            device.wait_for_fence(*fence)?;
        }

        Ok(())
    }

    pub fn frame_number(&self) -> u64 {
        self.frame
    }
}

/// Image the ray generation shader writes through its UAV.
#[derive(Debug)]
pub struct RenderTarget {
    image: ImageId,
    uav: u32,
    width: u32,
    height: u32,
}

impl RenderTarget {
    pub fn new<D>(ctx: &mut GpuContext<D>, width: u32, height: u32) -> Result<Self>
    where
        D: Device,
    {
        let uav = ctx.descriptors.next_index()?;
        let (width, height) = (width.max(1), height.max(1));
        let image = ctx.device.create_output_image(width, height, uav)?;

        Ok(Self {
            image,
            uav,
            width,
            height,
        })
    }

    /// Recreates the image at the new size, keeping the descriptor index.
    /// The caller guarantees the GPU is idle. Returns whether anything
    /// changed.
    pub fn resize<D>(&mut self, device: &mut D, width: u32, height: u32) -> Result<bool>
    where
        D: Device + ?Sized,
    {
        let (width, height) = (width.max(1), height.max(1));

        if (width, height) == (self.width, self.height) {
            return Ok(false);
        }

        let image = device.create_output_image(width, height, self.uav)?;

        device.release_image(self.image);

        log::debug!("Resized render target to {width}x{height}");

        self.image = image;
        self.width = width;
        self.height = height;

        Ok(true)
    }

    pub fn image(&self) -> ImageId {
        self.image
    }

    pub fn uav(&self) -> u32 {
        self.uav
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.width as f32 / self.height as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::headless::HeadlessDevice;
    use crate::device::Command;

    #[test]
    fn slots_alternate_and_wait_before_reuse() {
        let mut device = HeadlessDevice::new();
        let mut ring = FrameRing::new(&mut device).unwrap();

        let first = ring.begin(&mut device).unwrap();
        device.record(first, Command::BindDescriptorHeap).unwrap();
        let fence = ring.end(&mut device).unwrap();

        let second = ring.begin(&mut device).unwrap();

        assert_ne!(first, second);
        // Frame 0 is still in flight while frame 1 records
        assert!(!device.is_fence_complete(fence));

        ring.end(&mut device).unwrap();

        assert_eq!(first, ring.begin(&mut device).unwrap());
        assert!(device.is_fence_complete(fence));
        assert!(device.commands(first).is_empty());
        assert_eq!(2, ring.frame_number());
    }

    #[test]
    fn resize_clamps_and_keeps_descriptor() {
        let mut ctx = GpuContext::new(HeadlessDevice::new());
        let mut target = RenderTarget::new(&mut ctx, 1280, 720).unwrap();
        let old = target.image();

        assert!(!target.resize(&mut ctx.device, 1280, 720).unwrap());
        assert!(target.resize(&mut ctx.device, 0, 0).unwrap());

        assert_eq!((1, 1), (target.width(), target.height()));
        assert_eq!(1, target.uav());
        assert_eq!(None, ctx.device.image_size(old));
        assert_eq!(Some((1, 1)), ctx.device.image_size(target.image()));
    }
}
