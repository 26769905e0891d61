use crate::camera::CameraInput;
use crate::context::GpuContext;
use crate::device::{Command, Device, FenceValue};
use crate::frame::{FrameRing, RenderTarget};
use crate::samples::{Sample, SampleKind};
use crate::Result;

const CLEAR_COLOR: [f32; 4] = [1.0, 0.0, 0.0, 1.0];

/// Drives one sample: output image, frame ring and presentation.
#[derive(Debug)]
pub struct Renderer<D> {
    ctx: GpuContext<D>,
    ring: FrameRing,
    target: RenderTarget,
    sample: Sample,
}

impl<D> Renderer<D>
where
    D: Device,
{
    pub fn new(
        device: D,
        kind: SampleKind,
        library: Vec<u8>,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let mut ctx = GpuContext::new(device);

        let target = RenderTarget::new(&mut ctx, width, height)?;
        let sample = Sample::new(&mut ctx, kind, library)?;
        let ring = FrameRing::new(&mut ctx.device)?;

        Ok(Self {
            ctx,
            ring,
            target,
            sample,
        })
    }

    pub fn frame(&mut self, input: &CameraInput, delta_time: f32) -> Result<FenceValue> {
        let list = self.ring.begin(&mut self.ctx.device)?;

        self.ctx.device.record(
            list,
            Command::ClearImage {
                image: self.target.image(),
                color: CLEAR_COLOR,
            },
        )?;
        self.ctx.device.record(list, Command::BindDescriptorHeap)?;

        self.sample.update(input, delta_time);
        self.sample.record(&mut self.ctx, list, &self.target)?;

        let fence = self.ring.end(&mut self.ctx.device)?;
        self.ctx.device.present(self.target.image())?;

        Ok(fence)
    }

    /// Waits for in-flight frames, then recreates the output image.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.ring.flush(&mut self.ctx.device)?;

        if self.target.resize(&mut self.ctx.device, width, height)? {
            log::info!("Resized to {}x{}", self.target.width(), self.target.height());
        }

        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.ring.flush(&mut self.ctx.device)
    }

    pub fn device(&self) -> &D {
        &self.ctx.device
    }

    pub fn target(&self) -> &RenderTarget {
        &self.target
    }

    pub fn sample(&self) -> &Sample {
        &self.sample
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::headless::HeadlessDevice;

    #[test]
    fn frame_order_is_clear_bind_dispatch() {
        let mut renderer =
            Renderer::new(HeadlessDevice::new(), SampleKind::Basic, Vec::new(), 64, 32).unwrap();

        renderer.frame(&CameraInput::default(), 0.016).unwrap();

        let device = renderer.device();
        let frame = device.submissions().last().unwrap();

        assert!(matches!(frame[0], Command::ClearImage { color, .. } if color == CLEAR_COLOR));
        assert_eq!(Command::BindDescriptorHeap, frame[1]);
        assert!(matches!(frame.last(), Some(Command::DispatchRays(desc)) if desc.height == 32));
        assert_eq!(1, device.presented_frames());
    }

    #[test]
    fn resize_changes_dispatch_size() {
        let mut renderer =
            Renderer::new(HeadlessDevice::new(), SampleKind::Lighting, Vec::new(), 64, 32).unwrap();

        renderer.frame(&CameraInput::default(), 0.016).unwrap();
        renderer.resize(0, 100).unwrap();
        renderer.frame(&CameraInput::default(), 0.016).unwrap();

        let frame = renderer.device().submissions().last().unwrap();

        assert!(matches!(
            frame.last(),
            Some(Command::DispatchRays(desc)) if (desc.width, desc.height) == (1, 100)
        ));
    }
}
