use crate::descriptors::DescriptorAllocator;
use crate::device::Device;

/// Explicitly threaded replacement for a process-wide device singleton:
/// everything that creates GPU objects takes one of these.
#[derive(Debug)]
pub struct GpuContext<D> {
    pub device: D,
    pub descriptors: DescriptorAllocator,
}

impl<D> GpuContext<D>
where
    D: Device,
{
    pub fn new(device: D) -> Self {
        let capacity = device.capabilities().descriptor_capacity;

        Self {
            device,
            descriptors: DescriptorAllocator::new(capacity),
        }
    }
}
