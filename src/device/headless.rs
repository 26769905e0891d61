use std::collections::HashSet;

use super::{
    align_up, BufferId, BufferView, BuildInputs, Capabilities, Command, CommandListId, Device,
    FenceValue, GeometryDesc, GpuAddress, ImageId, PrebuildInfo, ResourceState,
    RootSignatureId, ShaderIdentifier, StateObjectDesc, StateObjectId,
};
use crate::pipeline::RootSignatureLayout;
use crate::{Error, Result};

const BASE_ADDRESS: GpuAddress = 0x1_0000_0000;

/// Backend that performs no GPU work: buffers live in host memory, commands
/// are logged, fences complete when waited upon.
///
/// Used for headless runs and as the observation point for tests.
#[derive(Debug)]
pub struct HeadlessDevice {
    caps: Capabilities,
    buffers: Vec<Option<HeadlessBuffer>>,
    images: Vec<Option<(u32, u32)>>,
    views: Vec<(BufferId, BufferView)>,
    root_signatures: Vec<RootSignatureLayout>,
    state_objects: Vec<HeadlessStateObject>,
    lists: Vec<HeadlessCommandList>,
    free_lists: Vec<CommandListId>,
    submissions: Vec<Vec<Command>>,
    next_address: GpuAddress,
    allocations: usize,
    last_fence: FenceValue,
    completed_fence: FenceValue,
    presented: usize,
    hidden_exports: HashSet<String>,
    zero_prebuild: bool,
    allocation_limit: Option<usize>,
    state_object_failure: Option<u32>,
    fail_submissions: bool,
    root_signature_failure: Option<Option<String>>,
}

#[derive(Debug)]
pub struct HeadlessBuffer {
    pub label: String,
    pub address: GpuAddress,
    pub data: Vec<u8>,
    pub state: Option<ResourceState>,
}

#[derive(Debug)]
struct HeadlessStateObject {
    exports: HashSet<String>,
    max_recursion_depth: u32,
}

#[derive(Debug, Default)]
struct HeadlessCommandList {
    commands: Vec<Command>,
    in_flight: Option<FenceValue>,
}

impl HeadlessDevice {
    pub fn new() -> Self {
        Self::with_capabilities(Capabilities::default())
    }

    pub fn with_capabilities(caps: Capabilities) -> Self {
        log::info!("Initializing headless device");

        Self {
            caps,
            buffers: Vec::new(),
            images: Vec::new(),
            views: Vec::new(),
            root_signatures: Vec::new(),
            state_objects: Vec::new(),
            lists: Vec::new(),
            free_lists: Vec::new(),
            submissions: Vec::new(),
            next_address: BASE_ADDRESS,
            allocations: 0,
            last_fence: FenceValue(0),
            completed_fence: FenceValue(0),
            presented: 0,
            hidden_exports: HashSet::new(),
            zero_prebuild: false,
            allocation_limit: None,
            state_object_failure: None,
            fail_submissions: false,
            root_signature_failure: None,
        }
    }

    /// Makes every prebuild query report zero sizes, the way a device without
    /// ray tracing support does.
    pub fn report_zero_prebuild(&mut self, zero: bool) {
        self.zero_prebuild = zero;
    }

    /// Fails every allocation once `limit` allocations have been made.
    pub fn limit_allocations(&mut self, limit: usize) {
        self.allocation_limit = Some(limit);
    }

    /// Makes every `submit` fail, the way a removed device does.
    pub fn fail_submissions(&mut self, fail: bool) {
        self.fail_submissions = fail;
    }

    pub fn fail_state_objects(&mut self, hresult: u32) {
        self.state_object_failure = Some(hresult);
    }

    pub fn fail_root_signatures(&mut self, error_blob: Option<String>) {
        self.root_signature_failure = Some(error_blob);
    }

    /// Pretends the shader library does not export `name`.
    pub fn hide_export(&mut self, name: impl Into<String>) {
        self.hidden_exports.insert(name.into());
    }

    pub fn allocations(&self) -> usize {
        self.allocations
    }

    pub fn buffer(&self, buffer: BufferId) -> Option<&HeadlessBuffer> {
        self.buffers.get(buffer.0 as usize)?.as_ref()
    }

    pub fn buffer_data(&self, buffer: BufferId) -> Option<&[u8]> {
        self.buffer(buffer).map(|buffer| buffer.data.as_slice())
    }

    pub fn live_buffers(&self) -> impl Iterator<Item = &HeadlessBuffer> + '_ {
        self.buffers.iter().flatten()
    }

    pub fn find_buffer_by_address(&self, address: GpuAddress) -> Option<&HeadlessBuffer> {
        self.live_buffers().find(|buffer| buffer.address == address)
    }

    pub fn views(&self) -> &[(BufferId, BufferView)] {
        &self.views
    }

    pub fn root_signature(&self, id: RootSignatureId) -> Option<&RootSignatureLayout> {
        self.root_signatures.get(id.0 as usize)
    }

    pub fn max_recursion_depth(&self, id: StateObjectId) -> Option<u32> {
        self.state_objects
            .get(id.0 as usize)
            .map(|so| so.max_recursion_depth)
    }

    /// Commands recorded into `list` since its last reset.
    pub fn commands(&self, list: CommandListId) -> &[Command] {
        self.lists
            .get(list.0 as usize)
            .map(|list| list.commands.as_slice())
            .unwrap_or_default()
    }

    /// Command lists created so far, pooled ones included.
    pub fn command_list_count(&self) -> usize {
        self.lists.len()
    }

    /// Commands of every submitted list, in submission order.
    pub fn submissions(&self) -> &[Vec<Command>] {
        &self.submissions
    }

    pub fn image_size(&self, image: ImageId) -> Option<(u32, u32)> {
        self.images.get(image.0 as usize).copied().flatten()
    }

    pub fn presented_frames(&self) -> usize {
        self.presented
    }

    pub fn completed_fence(&self) -> FenceValue {
        self.completed_fence
    }

    fn allocate(
        &mut self,
        label: &str,
        data: Vec<u8>,
        state: Option<ResourceState>,
    ) -> Result<BufferId> {
        let size = data.len() as u64;

        if self
            .allocation_limit
            .map_or(false, |limit| self.allocations >= limit)
        {
            return Err(Error::allocation(label, size, "allocation limit reached"));
        }

        if size == 0 {
            return Err(Error::allocation(label, size, "zero-sized buffer"));
        }

        self.allocations += 1;

        let address = self.next_address;
        self.next_address += align_up(size, self.caps.acceleration_structure_alignment);

        log::debug!("Allocating buffer `{label}`; size={size}, address=0x{address:x}");

        self.buffers.push(Some(HeadlessBuffer {
            label: label.to_owned(),
            address,
            data,
            state,
        }));

        Ok(BufferId(self.buffers.len() as u32 - 1))
    }

    /// Released or unknown buffers read as address 0 / size 0, like a null
    /// resource would.
    fn live_buffer(&self, buffer: BufferId) -> Option<&HeadlessBuffer> {
        let live = self.buffer(buffer);

        if live.is_none() {
            log::error!("Buffer {buffer:?} was released or never allocated");
        }

        live
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for HeadlessDevice {
    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    fn prebuild_info(&self, inputs: &BuildInputs) -> PrebuildInfo {
        if self.zero_prebuild {
            return PrebuildInfo::default();
        }

        let primitives = match inputs {
            BuildInputs::BottomLevel(GeometryDesc::Triangles { index_count, .. }) => {
                u64::from(*index_count / 3)
            }
            BuildInputs::BottomLevel(GeometryDesc::Aabbs { count, .. }) => *count,
            BuildInputs::TopLevel { instance_count, .. } => u64::from(*instance_count),
        };

        let alignment = self.caps.acceleration_structure_alignment;

        PrebuildInfo {
            result_size: align_up(256 + 128 * primitives, alignment),
            scratch_size: align_up(128 + 64 * primitives, alignment),
        }
    }

    fn create_upload_buffer(&mut self, label: &str, data: &[u8]) -> Result<BufferId> {
        self.allocate(label, data.to_vec(), None)
    }

    fn create_uav_buffer(
        &mut self,
        label: &str,
        size: u64,
        state: ResourceState,
    ) -> Result<BufferId> {
        self.allocate(label, vec![0; size as usize], Some(state))
    }

    fn release_buffer(&mut self, buffer: BufferId) {
        if let Some(slot) = self.buffers.get_mut(buffer.0 as usize) {
            *slot = None;
        }
    }

    fn buffer_address(&self, buffer: BufferId) -> GpuAddress {
        self.live_buffer(buffer).map_or(0, |buffer| buffer.address)
    }

    fn buffer_size(&self, buffer: BufferId) -> u64 {
        self.live_buffer(buffer)
            .map_or(0, |buffer| buffer.data.len() as u64)
    }

    fn create_buffer_view(&mut self, buffer: BufferId, view: BufferView) -> Result<()> {
        self.views.retain(|(_, existing)| existing.descriptor != view.descriptor);
        self.views.push((buffer, view));

        Ok(())
    }

    fn create_output_image(
        &mut self,
        width: u32,
        height: u32,
        _uav_descriptor: u32,
    ) -> Result<ImageId> {
        self.images.push(Some((width, height)));

        Ok(ImageId(self.images.len() as u32 - 1))
    }

    fn release_image(&mut self, image: ImageId) {
        if let Some(slot) = self.images.get_mut(image.0 as usize) {
            *slot = None;
        }
    }

    fn create_root_signature(&mut self, layout: &RootSignatureLayout) -> Result<RootSignatureId> {
        if let Some(blob) = self.root_signature_failure.clone() {
            return Err(Error::RootSignatureSerialization(blob));
        }

        self.root_signatures.push(layout.clone());

        Ok(RootSignatureId(self.root_signatures.len() as u32 - 1))
    }

    fn create_state_object(&mut self, desc: &StateObjectDesc<'_>) -> Result<StateObjectId> {
        if let Some(hresult) = self.state_object_failure {
            return Err(Error::StateObjectCreation(hresult));
        }

        if self.root_signatures.len() <= desc.root_signature.0 as usize {
            return Err(Error::StateObjectCreation(0x8007_0057));
        }

        let exports = desc
            .hit_groups
            .iter()
            .map(|group| group.export.clone())
            .collect();

        self.state_objects.push(HeadlessStateObject {
            exports,
            max_recursion_depth: desc.max_recursion_depth,
        });

        Ok(StateObjectId(self.state_objects.len() as u32 - 1))
    }

    fn shader_identifier(
        &self,
        state_object: StateObjectId,
        export: &str,
    ) -> Option<ShaderIdentifier> {
        let so = self.state_objects.get(state_object.0 as usize)?;

        // Library entry points are not enumerated by the state object, so
        // anything not explicitly hidden counts as exported.
        if export.is_empty() || self.hidden_exports.contains(export) {
            return None;
        }

        let mut identifier = Vec::with_capacity(self.caps.shader_identifier_size as usize);
        let mut seed = fxhash::hash64(&(state_object.0, export, so.exports.contains(export)));

        while identifier.len() < self.caps.shader_identifier_size as usize {
            identifier.extend_from_slice(&seed.to_le_bytes());
            seed = fxhash::hash64(&seed);
        }

        identifier.truncate(self.caps.shader_identifier_size as usize);

        Some(ShaderIdentifier(identifier))
    }

    fn create_command_list(&mut self) -> Result<CommandListId> {
        if let Some(list) = self.free_lists.pop() {
            if self.reset_command_list(list).is_ok() {
                return Ok(list);
            }

            self.free_lists.push(list);
        }

        self.lists.push(HeadlessCommandList::default());

        Ok(CommandListId(self.lists.len() as u32 - 1))
    }

    fn reset_command_list(&mut self, list: CommandListId) -> Result<()> {
        let completed = self.completed_fence;
        let entry = self
            .lists
            .get_mut(list.0 as usize)
            .ok_or_else(|| Error::Submission(format!("unknown command list {list:?}")))?;

        if let Some(fence) = entry.in_flight {
            if fence > completed {
                return Err(Error::Submission(format!(
                    "command list {list:?} reset while fence {fence:?} is still pending"
                )));
            }
        }

        entry.commands.clear();
        entry.in_flight = None;

        Ok(())
    }

    fn release_command_list(&mut self, list: CommandListId) {
        if (list.0 as usize) < self.lists.len() && !self.free_lists.contains(&list) {
            self.free_lists.push(list);
        }
    }

    fn record(&mut self, list: CommandListId, command: Command) -> Result<()> {
        log::trace!("Recording into {list:?}: {command:?}");

        if self.free_lists.contains(&list) {
            return Err(Error::Submission(format!(
                "recording into released command list {list:?}"
            )));
        }

        let entry = self
            .lists
            .get_mut(list.0 as usize)
            .ok_or_else(|| Error::Submission(format!("recording into unknown command list {list:?}")))?;

        // Submission closes the list until it is reset
        if entry.in_flight.is_some() {
            return Err(Error::Submission(format!(
                "recording into closed command list {list:?}"
            )));
        }

        entry.commands.push(command);

        Ok(())
    }

    fn submit(&mut self, lists: &[CommandListId]) -> Result<FenceValue> {
        if self.fail_submissions {
            return Err(Error::Submission("device removed".into()));
        }

        self.last_fence.0 += 1;

        for list in lists {
            let entry = self
                .lists
                .get_mut(list.0 as usize)
                .ok_or_else(|| Error::Submission(format!("unknown command list {list:?}")))?;

            entry.in_flight = Some(self.last_fence);
            self.submissions.push(entry.commands.clone());
        }

        Ok(self.last_fence)
    }

    fn wait_for_fence(&mut self, fence: FenceValue) -> Result<()> {
        if fence > self.completed_fence {
            self.completed_fence = fence.min(self.last_fence);
        }

        Ok(())
    }

    fn is_fence_complete(&self, fence: FenceValue) -> bool {
        self.completed_fence >= fence
    }

    fn last_submitted_fence(&self) -> FenceValue {
        self.last_fence
    }

    fn present(&mut self, image: ImageId) -> Result<()> {
        if self.image_size(image).is_none() {
            return Err(Error::Submission(format!("presenting released image {image:?}")));
        }

        self.presented += 1;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_get_distinct_aligned_addresses() {
        let mut device = HeadlessDevice::new();

        let a = device.create_upload_buffer("a", &[1, 2, 3]).unwrap();
        let b = device.create_uav_buffer("b", 300, ResourceState::UnorderedAccess).unwrap();

        assert_eq!(0, device.buffer_address(a) % 256);
        assert_eq!(0, device.buffer_address(b) % 256);
        assert_ne!(device.buffer_address(a), device.buffer_address(b));
        assert_eq!(Some(&[1u8, 2, 3][..]), device.buffer_data(a));
        assert_eq!(300, device.buffer_size(b));
    }

    #[test]
    fn resetting_an_in_flight_list_is_rejected() {
        let mut device = HeadlessDevice::new();
        let list = device.create_command_list().unwrap();

        device.record(list, Command::BindDescriptorHeap).unwrap();
        let fence = device.submit(&[list]).unwrap();

        assert!(!device.is_fence_complete(fence));
        assert!(device.record(list, Command::BindDescriptorHeap).is_err());
        assert!(device.reset_command_list(list).is_err());

        device.wait_for_fence(fence).unwrap();

        assert!(device.reset_command_list(list).is_ok());
        assert!(device.commands(list).is_empty());
    }

    #[test]
    fn released_lists_reject_commands_until_handed_out_again() {
        let mut device = HeadlessDevice::new();
        let list = device.create_command_list().unwrap();

        device.release_command_list(list);

        assert!(device.record(list, Command::BindDescriptorHeap).is_err());
        assert!(device
            .record(CommandListId(7), Command::BindDescriptorHeap)
            .is_err());

        assert_eq!(list, device.create_command_list().unwrap());
        assert!(device.record(list, Command::BindDescriptorHeap).is_ok());
        assert_eq!(1, device.command_list_count());
    }

    #[test]
    fn shader_identifiers_are_stable_and_distinct() {
        let mut device = HeadlessDevice::new();
        let rs = device
            .create_root_signature(&RootSignatureLayout::default())
            .unwrap();

        let so = device
            .create_state_object(&StateObjectDesc {
                library: &[],
                hit_groups: &[],
                payload_size: 16,
                attribute_size: 8,
                root_signature: rs,
                max_recursion_depth: 1,
            })
            .unwrap();

        let a = device.shader_identifier(so, "RayGenMain").unwrap();
        let b = device.shader_identifier(so, "MissMain").unwrap();

        assert_eq!(32, a.0.len());
        assert_ne!(a, b);
        assert_eq!(Some(a), device.shader_identifier(so, "RayGenMain"));

        device.hide_export("MissMain");

        assert_eq!(None, device.shader_identifier(so, "MissMain"));
    }
}
