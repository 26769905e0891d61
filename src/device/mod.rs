//! The seam between the acceleration-structure / pipeline code and the
//! native ray tracing API.
//!
//! Builders never touch the platform directly: they describe buffers, build
//! inputs and commands with the plain types below and hand them to a
//! [`Device`]. Two backends exist: [`headless::HeadlessDevice`], which records
//! everything in host memory, and (on Windows) [`d3d12::D3d12Device`].

pub mod headless;

#[cfg(windows)]
pub mod d3d12;

use std::ops::BitOr;

use crate::pipeline::{HitGroup, RootSignatureLayout};
use crate::Result;

pub type GpuAddress = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RootSignatureId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StateObjectId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CommandListId(pub u32);

/// Monotonically increasing value signalled by the queue after a submission.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FenceValue(pub u64);

/// Platform constants the layout code depends on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    pub shader_identifier_size: u32,
    pub shader_record_alignment: u32,
    pub shader_table_alignment: u32,
    pub acceleration_structure_alignment: u64,
    pub descriptor_capacity: u32,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            shader_identifier_size: 32,
            shader_record_alignment: 32,
            shader_table_alignment: 64,
            acceleration_structure_alignment: 256,
            descriptor_capacity: 32,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    U16,
    U32,
}

impl IndexFormat {
    pub fn byte_width(self) -> u32 {
        match self {
            IndexFormat::U16 => 2,
            IndexFormat::U32 => 4,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct GeometryFlags(pub u32);

impl GeometryFlags {
    pub const NONE: Self = Self(0);
    pub const OPAQUE: Self = Self(0x1);
    pub const NO_DUPLICATE_ANYHIT_INVOCATION: Self = Self(0x2);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for GeometryFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum GeometryDesc {
    Triangles {
        vertex_buffer: GpuAddress,
        vertex_count: u32,
        vertex_stride: u64,
        index_buffer: GpuAddress,
        index_count: u32,
        index_format: IndexFormat,
        flags: GeometryFlags,
    },
    Aabbs {
        buffer: GpuAddress,
        count: u64,
        stride: u64,
        flags: GeometryFlags,
    },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BuildInputs {
    BottomLevel(GeometryDesc),
    TopLevel {
        instance_count: u32,
        /// Address of the instance-descriptor array; zero while sizing.
        instance_descs: GpuAddress,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PrebuildInfo {
    pub result_size: u64,
    pub scratch_size: u64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BuildDesc {
    pub inputs: BuildInputs,
    pub scratch: GpuAddress,
    pub dest: GpuAddress,
}

/// Initial state of a device-local, UAV-capable buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceState {
    UnorderedAccess,
    AccelerationStructure,
}

/// Structured-buffer shader resource view written at `descriptor`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferView {
    pub descriptor: u32,
    pub stride: u32,
    pub count: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GpuRange {
    pub start: GpuAddress,
    pub size: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GpuStridedRange {
    pub start: GpuAddress,
    pub size: u64,
    pub stride: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchRaysDesc {
    pub ray_generation: GpuRange,
    pub miss: GpuStridedRange,
    pub hit_group: GpuStridedRange,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

/// Everything a ray tracing state object is assembled from.
#[derive(Clone, Copy, Debug)]
pub struct StateObjectDesc<'a> {
    pub library: &'a [u8],
    pub hit_groups: &'a [HitGroup],
    pub payload_size: u32,
    pub attribute_size: u32,
    pub root_signature: RootSignatureId,
    pub max_recursion_depth: u32,
}

/// Opaque driver token naming one shader export inside a state object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShaderIdentifier(pub Vec<u8>);

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    BuildAccelerationStructure(BuildDesc),
    UavBarrier(BufferId),
    BindDescriptorHeap,
    SetRootSignature(RootSignatureId),
    SetRootConstants {
        parameter: u32,
        offset: u32,
        values: Vec<u32>,
    },
    SetRootShaderResourceView {
        parameter: u32,
        address: GpuAddress,
    },
    SetPipelineState(StateObjectId),
    DispatchRays(DispatchRaysDesc),
    ClearImage {
        image: ImageId,
        color: [f32; 4],
    },
}

impl Command {
    pub fn is_acceleration_structure_build(&self) -> bool {
        matches!(self, Command::BuildAccelerationStructure(_))
    }
}

pub trait Device {
    fn capabilities(&self) -> Capabilities;

    fn prebuild_info(&self, inputs: &BuildInputs) -> PrebuildInfo;

    /// Host-visible buffer, written once with `data`.
    fn create_upload_buffer(&mut self, label: &str, data: &[u8]) -> Result<BufferId>;

    /// Device-local buffer usable as UAV / acceleration-structure storage.
    fn create_uav_buffer(
        &mut self,
        label: &str,
        size: u64,
        state: ResourceState,
    ) -> Result<BufferId>;

    fn release_buffer(&mut self, buffer: BufferId);

    fn buffer_address(&self, buffer: BufferId) -> GpuAddress;

    fn buffer_size(&self, buffer: BufferId) -> u64;

    fn create_buffer_view(&mut self, buffer: BufferId, view: BufferView) -> Result<()>;

    /// Output image with render-target and unordered-access usage; its UAV is
    /// written at `uav_descriptor`.
    fn create_output_image(
        &mut self,
        width: u32,
        height: u32,
        uav_descriptor: u32,
    ) -> Result<ImageId>;

    fn release_image(&mut self, image: ImageId);

    fn create_root_signature(&mut self, layout: &RootSignatureLayout) -> Result<RootSignatureId>;

    fn create_state_object(&mut self, desc: &StateObjectDesc<'_>) -> Result<StateObjectId>;

    fn shader_identifier(&self, state_object: StateObjectId, export: &str)
        -> Option<ShaderIdentifier>;

    fn create_command_list(&mut self) -> Result<CommandListId>;

    /// Resets the list (and its allocator); the caller guarantees that
    /// previously submitted work recorded into it has retired.
    fn reset_command_list(&mut self, list: CommandListId) -> Result<()>;

    /// Returns the list to the device's pool; a later `create_command_list`
    /// may hand it out again once its submitted work has retired.
    fn release_command_list(&mut self, list: CommandListId);

    /// Fails when the list is unknown, released or closed by a submission.
    fn record(&mut self, list: CommandListId, command: Command) -> Result<()>;

    /// Closes and executes the lists, returning the fence value signalled
    /// once they complete.
    fn submit(&mut self, lists: &[CommandListId]) -> Result<FenceValue>;

    fn wait_for_fence(&mut self, fence: FenceValue) -> Result<()>;

    fn is_fence_complete(&self, fence: FenceValue) -> bool;

    /// Fence value of the most recent submission.
    fn last_submitted_fence(&self) -> FenceValue;

    fn present(&mut self, image: ImageId) -> Result<()>;
}

impl<D> Device for Box<D>
where
    D: Device + ?Sized,
{
    fn capabilities(&self) -> Capabilities {
        (**self).capabilities()
    }

    fn prebuild_info(&self, inputs: &BuildInputs) -> PrebuildInfo {
        (**self).prebuild_info(inputs)
    }

    fn create_upload_buffer(&mut self, label: &str, data: &[u8]) -> Result<BufferId> {
        (**self).create_upload_buffer(label, data)
    }

    fn create_uav_buffer(
        &mut self,
        label: &str,
        size: u64,
        state: ResourceState,
    ) -> Result<BufferId> {
        (**self).create_uav_buffer(label, size, state)
    }

    fn release_buffer(&mut self, buffer: BufferId) {
        (**self).release_buffer(buffer)
    }

    fn buffer_address(&self, buffer: BufferId) -> GpuAddress {
        (**self).buffer_address(buffer)
    }

    fn buffer_size(&self, buffer: BufferId) -> u64 {
        (**self).buffer_size(buffer)
    }

    fn create_buffer_view(&mut self, buffer: BufferId, view: BufferView) -> Result<()> {
        (**self).create_buffer_view(buffer, view)
    }

    fn create_output_image(
        &mut self,
        width: u32,
        height: u32,
        uav_descriptor: u32,
    ) -> Result<ImageId> {
        (**self).create_output_image(width, height, uav_descriptor)
    }

    fn release_image(&mut self, image: ImageId) {
        (**self).release_image(image)
    }

    fn create_root_signature(&mut self, layout: &RootSignatureLayout) -> Result<RootSignatureId> {
        (**self).create_root_signature(layout)
    }

    fn create_state_object(&mut self, desc: &StateObjectDesc<'_>) -> Result<StateObjectId> {
        (**self).create_state_object(desc)
    }

    fn shader_identifier(
        &self,
        state_object: StateObjectId,
        export: &str,
    ) -> Option<ShaderIdentifier> {
        (**self).shader_identifier(state_object, export)
    }

    fn create_command_list(&mut self) -> Result<CommandListId> {
        (**self).create_command_list()
    }

    fn reset_command_list(&mut self, list: CommandListId) -> Result<()> {
        (**self).reset_command_list(list)
    }

    fn release_command_list(&mut self, list: CommandListId) {
        (**self).release_command_list(list)
    }

    fn record(&mut self, list: CommandListId, command: Command) -> Result<()> {
        (**self).record(list, command)
    }

    fn submit(&mut self, lists: &[CommandListId]) -> Result<FenceValue> {
        (**self).submit(lists)
    }

    fn wait_for_fence(&mut self, fence: FenceValue) -> Result<()> {
        (**self).wait_for_fence(fence)
    }

    fn is_fence_complete(&self, fence: FenceValue) -> bool {
        (**self).is_fence_complete(fence)
    }

    fn last_submitted_fence(&self) -> FenceValue {
        (**self).last_submitted_fence()
    }

    fn present(&mut self, image: ImageId) -> Result<()> {
        (**self).present(image)
    }
}

/// Records one command list, submits it and blocks until the GPU is done.
/// The list goes back to the device's pool afterwards.
pub fn submit_blocking<D>(
    device: &mut D,
    commands: impl IntoIterator<Item = Command>,
) -> Result<FenceValue>
where
    D: Device + ?Sized,
{
    let list = device.create_command_list()?;

    let submitted = commands
        .into_iter()
        .try_for_each(|command| device.record(list, command))
        .and_then(|()| device.submit(&[list]));

    let waited = submitted.and_then(|fence| device.wait_for_fence(fence).map(|()| fence));

    device.release_command_list(list);

    waited
}

pub fn align_up(size: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());

    (size + (alignment - 1)) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_power_of_two() {
        assert_eq!(0, align_up(0, 32));
        assert_eq!(32, align_up(1, 32));
        assert_eq!(32, align_up(32, 32));
        assert_eq!(64, align_up(33, 32));
        assert_eq!(256, align_up(200, 256));
    }

    #[test]
    fn blocking_submissions_reuse_one_list() {
        let mut device = headless::HeadlessDevice::new();

        for _ in 0..4 {
            submit_blocking(&mut device, [Command::BindDescriptorHeap]).unwrap();
        }

        assert_eq!(1, device.command_list_count());
        assert_eq!(4, device.submissions().len());
    }

    #[test]
    fn geometry_flags_combine() {
        let flags = GeometryFlags::OPAQUE | GeometryFlags::NO_DUPLICATE_ANYHIT_INVOCATION;

        assert!(flags.contains(GeometryFlags::OPAQUE));
        assert!(flags.contains(GeometryFlags::NO_DUPLICATE_ANYHIT_INVOCATION));
        assert!(!GeometryFlags::NONE.contains(GeometryFlags::OPAQUE));
    }
}
