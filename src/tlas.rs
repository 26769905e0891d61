//! Top-level acceleration structure and the geometry attribute table that
//! travels with it.
//!
//! Row *i* of the attribute table always describes instance *i* of the
//! acceleration structure: both passes walk the same list of live instances,
//! and both tables are re-uploaded whenever that list changes.
//!
//! Instance descriptors carry a hit-group contribution of 0. The hit-group
//! index of each instance travels out of band, in a side table of `u32`s
//! that parallels the attribute table.

use bytemuck::{Pod, Zeroable};

use crate::context::GpuContext;
use crate::device::{
    submit_blocking, BufferId, BuildDesc, BuildInputs, Command, CommandListId, Device,
    FenceValue, GpuAddress, ResourceState,
};
use crate::geometry::AttributeSlots;
use crate::instance::GeometryInstance;
use crate::scene::{InstanceId, Scene};
use crate::{ContractViolation, Error, Result};

/// Buffer-index value meaning "attribute absent"; shaders must not
/// dereference it.
pub const ABSENT: u32 = u32::MAX;

const INSTANCE_MASK: u32 = 1;

/// Native top-level instance descriptor.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct InstanceDesc {
    pub transform: [[f32; 4]; 3],
    /// Instance ID in the low 24 bits, mask in the high 8.
    pub instance_id_and_mask: u32,
    /// Hit-group contribution in the low 24 bits, flags in the high 8.
    pub contribution_and_flags: u32,
    pub acceleration_structure: GpuAddress,
}

impl InstanceDesc {
    /// Instance ID 0, mask 1, hit-group contribution 0, no flags.
    pub fn new(transform: [[f32; 4]; 3], acceleration_structure: GpuAddress) -> Self {
        Self {
            transform,
            instance_id_and_mask: INSTANCE_MASK << 24,
            contribution_and_flags: 0,
            acceleration_structure,
        }
    }

    pub fn instance_id(&self) -> u32 {
        self.instance_id_and_mask & 0x00ff_ffff
    }

    pub fn mask(&self) -> u32 {
        self.instance_id_and_mask >> 24
    }

    pub fn hit_group_contribution(&self) -> u32 {
        self.contribution_and_flags & 0x00ff_ffff
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct GeometryRecord {
    pub color: [f32; 4],
    pub index_buffer: u32,
    pub normal_buffer: u32,
    pub uv0_buffer: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct ReflectiveGeometryRecord {
    pub color: [f32; 4],
    pub reflectance: f32,
    pub index_buffer: u32,
    pub normal_buffer: u32,
    pub uv0_buffer: u32,
}

/// Which attribute record the shaders of a sample read.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RecordLayout {
    #[default]
    Tinted,
    Reflective,
}

impl RecordLayout {
    pub fn stride(self) -> usize {
        match self {
            RecordLayout::Tinted => std::mem::size_of::<GeometryRecord>(),
            RecordLayout::Reflective => std::mem::size_of::<ReflectiveGeometryRecord>(),
        }
    }

    fn encode(self, instance: &GeometryInstance, slots: AttributeSlots, out: &mut Vec<u8>) {
        let color = instance.color().to_array();
        let index_buffer = slots.index.unwrap_or(ABSENT);
        let normal_buffer = slots.normal.unwrap_or(ABSENT);
        let uv0_buffer = slots.uv0.unwrap_or(ABSENT);

        match self {
            RecordLayout::Tinted => out.extend_from_slice(bytemuck::bytes_of(&GeometryRecord {
                color,
                index_buffer,
                normal_buffer,
                uv0_buffer,
            })),
            RecordLayout::Reflective => {
                out.extend_from_slice(bytemuck::bytes_of(&ReflectiveGeometryRecord {
                    color,
                    reflectance: instance.reflectance(),
                    index_buffer,
                    normal_buffer,
                    uv0_buffer,
                }))
            }
        }
    }
}

#[derive(Debug)]
struct Resources {
    result: BufferId,
    scratch: Option<BufferId>,
    instances: BufferId,
    instance_count: usize,
}

/// Attribute rows and the parallel hit-group side table.
#[derive(Clone, Copy, Debug)]
struct GeometryTable {
    buffer: BufferId,
    hit_groups: BufferId,
    rows: usize,
}

/// Buffers replaced by a rebuild, kept alive until every submission that
/// could still read them has retired.
#[derive(Debug)]
struct Retired {
    after: FenceValue,
    buffers: Vec<BufferId>,
}

struct Prepared {
    descs: Vec<InstanceDesc>,
    rows: Vec<u8>,
    hit_groups: Vec<u32>,
    live: Vec<InstanceId>,
}

#[derive(Debug)]
pub struct TopLevelStructure {
    label: String,
    layout: RecordLayout,
    instances: Vec<InstanceId>,
    built: Vec<InstanceId>,
    hit_group_indices: Vec<u32>,
    resources: Option<Resources>,
    geometry_table: Option<GeometryTable>,
    retired: Vec<Retired>,
}

impl TopLevelStructure {
    pub fn new(label: impl Into<String>, layout: RecordLayout) -> Self {
        Self {
            label: label.into(),
            layout,
            instances: Vec::new(),
            built: Vec::new(),
            hit_group_indices: Vec::new(),
            resources: None,
            geometry_table: None,
            retired: Vec::new(),
        }
    }

    /// Appends `id` and marks it dirty. Returns its slot position.
    pub fn add_instance(&mut self, scene: &mut Scene, id: InstanceId) -> usize {
        if let Some(instance) = scene.instance_mut(id) {
            instance.mark_dirty();
        }

        self.instances.push(id);

        self.instances.len() - 1
    }

    /// Removes the slot holding `id`; later slots move down by one.
    pub fn remove_instance(&mut self, id: InstanceId) -> bool {
        match self.instances.iter().position(|&slot| slot == id) {
            Some(position) => {
                self.instances.remove(position);
                true
            }
            None => false,
        }
    }

    /// Drops every slot whose instance no longer exists in `scene`.
    pub fn compact(&mut self, scene: &Scene) -> usize {
        let before = self.instances.len();

        self.instances.retain(|&id| scene.instance(id).is_some());

        before - self.instances.len()
    }

    pub fn instances(&self) -> &[InstanceId] {
        &self.instances
    }

    pub fn layout(&self) -> RecordLayout {
        self.layout
    }

    /// Hit-group index of each built instance, in acceleration-structure
    /// order. The same values are uploaded to `hit_group_table_buffer`.
    pub fn hit_group_indices(&self) -> &[u32] {
        &self.hit_group_indices
    }

    pub fn instance_count(&self) -> usize {
        self.resources
            .as_ref()
            .map_or(0, |resources| resources.instance_count)
    }

    pub fn geometry_table_rows(&self) -> usize {
        self.geometry_table.map_or(0, |table| table.rows)
    }

    pub fn instance_buffer(&self) -> Option<BufferId> {
        self.resources.as_ref().map(|resources| resources.instances)
    }

    pub fn geometry_table_buffer(&self) -> Option<BufferId> {
        self.geometry_table.map(|table| table.buffer)
    }

    pub fn hit_group_table_buffer(&self) -> Option<BufferId> {
        self.geometry_table.map(|table| table.hit_groups)
    }

    pub fn buffer(&self) -> Option<BufferId> {
        self.resources.as_ref().map(|resources| resources.result)
    }

    pub fn address<D>(&self, device: &D) -> Result<GpuAddress>
    where
        D: Device + ?Sized,
    {
        self.buffer()
            .map(|buffer| device.buffer_address(buffer))
            .ok_or_else(|| ContractViolation::AccelerationStructureNotBuilt.into())
    }

    pub fn geometry_table_address<D>(&self, device: &D) -> Result<GpuAddress>
    where
        D: Device + ?Sized,
    {
        self.geometry_table
            .map(|table| device.buffer_address(table.buffer))
            .ok_or_else(|| ContractViolation::AccelerationStructureNotBuilt.into())
    }

    pub fn hit_group_table_address<D>(&self, device: &D) -> Result<GpuAddress>
    where
        D: Device + ?Sized,
    {
        self.geometry_table
            .map(|table| device.buffer_address(table.hit_groups))
            .ok_or_else(|| ContractViolation::AccelerationStructureNotBuilt.into())
    }

    /// Builds the structure and both tables, then waits for the GPU.
    pub fn build<D>(&mut self, ctx: &mut GpuContext<D>, scene: &mut Scene) -> Result<()>
    where
        D: Device,
    {
        self.release_retired(&mut ctx.device);

        let prepared = self.prepare(scene)?;
        let (mut resources, build) = self.allocate(ctx, &prepared.descs)?;

        let built = submit_blocking(&mut ctx.device, [Command::BuildAccelerationStructure(build)]);

        if let Err(err) = built {
            let after = ctx.device.last_submitted_fence();

            self.retired.push(Retired {
                after,
                buffers: resource_buffers(&resources).collect(),
            });
            self.release_retired(&mut ctx.device);

            return Err(err);
        }

        if let Some(scratch) = resources.scratch.take() {
            ctx.device.release_buffer(scratch);
        }

        let table = match self.upload_tables(ctx, &prepared) {
            Ok(table) => table,
            Err(err) => {
                for buffer in resource_buffers(&resources) {
                    ctx.device.release_buffer(buffer);
                }

                return Err(err);
            }
        };

        log::info!(
            "Built TLAS `{}`; instances={}, geometry rows={}",
            self.label,
            resources.instance_count,
            table.rows,
        );

        let after = ctx.device.last_submitted_fence();
        let previous_table = self.geometry_table.replace(table);

        self.replace(after, resources, previous_table);
        self.finish(scene, prepared);

        Ok(())
    }

    /// Records a rebuild into `list` when any instance moved or the set of
    /// live instances changed, followed by a UAV barrier on the result.
    /// Both tables are re-uploaded only when the live set changed.
    ///
    /// Returns whether anything was recorded.
    pub fn build_deferred<D>(
        &mut self,
        ctx: &mut GpuContext<D>,
        scene: &mut Scene,
        list: CommandListId,
    ) -> Result<bool>
    where
        D: Device,
    {
        self.release_retired(&mut ctx.device);

        let prepared = self.prepare(scene)?;

        let reshaped = self.resources.is_none() || prepared.live != self.built;
        let moved = prepared
            .live
            .iter()
            .any(|&id| scene.instance(id).map_or(false, GeometryInstance::is_dirty));

        if !reshaped && !moved {
            return Ok(false);
        }

        let table = if reshaped {
            Some(self.upload_tables(ctx, &prepared)?)
        } else {
            None
        };

        let recorded = self.allocate(ctx, &prepared.descs).and_then(|(resources, build)| {
            let result = resources.result;

            let outcome = ctx
                .device
                .record(list, Command::BuildAccelerationStructure(build))
                .and_then(|()| ctx.device.record(list, Command::UavBarrier(result)));

            match outcome {
                Ok(()) => Ok(resources),
                Err(err) => {
                    for buffer in resource_buffers(&resources) {
                        ctx.device.release_buffer(buffer);
                    }

                    Err(err)
                }
            }
        });

        let resources = match recorded {
            Ok(resources) => resources,
            Err(err) => {
                if let Some(table) = table {
                    ctx.device.release_buffer(table.buffer);
                    ctx.device.release_buffer(table.hit_groups);
                }

                return Err(err);
            }
        };

        let previous_table = table.and_then(|table| self.geometry_table.replace(table));

        log::debug!(
            "Recorded TLAS `{}` rebuild into {list:?}; instances={}, tables rewritten={reshaped}",
            self.label,
            resources.instance_count,
        );

        // The list being recorded is submitted after everything so far
        let after = FenceValue(ctx.device.last_submitted_fence().0 + 1);

        self.replace(after, resources, previous_table);
        self.finish(scene, prepared);

        Ok(true)
    }

    /// Releases every buffer this structure owns. The caller guarantees the
    /// GPU no longer reads them.
    pub fn release<D>(&mut self, device: &mut D)
    where
        D: Device + ?Sized,
    {
        let retired = std::mem::take(&mut self.retired);

        for buffer in retired.into_iter().flat_map(|retired| retired.buffers) {
            device.release_buffer(buffer);
        }

        if let Some(resources) = self.resources.take() {
            for buffer in resource_buffers(&resources) {
                device.release_buffer(buffer);
            }
        }

        if let Some(table) = self.geometry_table.take() {
            device.release_buffer(table.buffer);
            device.release_buffer(table.hit_groups);
        }

        self.built.clear();
        self.hit_group_indices.clear();
    }

    fn prepare(&self, scene: &Scene) -> Result<Prepared> {
        let mut prepared = Prepared {
            descs: Vec::with_capacity(self.instances.len()),
            rows: Vec::new(),
            hit_groups: Vec::with_capacity(self.instances.len()),
            live: Vec::with_capacity(self.instances.len()),
        };

        for (slot, &id) in self.instances.iter().enumerate() {
            let Some(instance) = scene.instance(id) else {
                log::warn!(
                    "Skipping stale slot {slot} of TLAS `{}`; following instances shift down",
                    self.label
                );
                continue;
            };

            let asset = scene.resolve(instance.asset())?;

            prepared.descs.push(InstanceDesc::new(
                instance.to_row_major_3x4(),
                asset.blas.address(),
            ));

            self.layout.encode(instance, asset.slots, &mut prepared.rows);

            prepared.hit_groups.push(asset.hit_group_index);
            prepared.live.push(id);
        }

        if prepared.descs.is_empty() {
            return Err(ContractViolation::NoInstances.into());
        }

        Ok(prepared)
    }

    fn allocate<D>(
        &self,
        ctx: &mut GpuContext<D>,
        descs: &[InstanceDesc],
    ) -> Result<(Resources, BuildDesc)>
    where
        D: Device,
    {
        let instance_count = descs.len() as u32;

        let info = ctx.device.prebuild_info(&BuildInputs::TopLevel {
            instance_count,
            instance_descs: 0,
        });

        if info.result_size == 0 {
            return Err(Error::EmptyPrebuild("TopLevelAccelerationStructure"));
        }

        let scratch = ctx.device.create_uav_buffer(
            "TLAS Scratch",
            info.scratch_size,
            ResourceState::UnorderedAccess,
        )?;

        let result = ctx.device.create_uav_buffer(
            &self.label,
            info.result_size,
            ResourceState::AccelerationStructure,
        )?;

        let instances = ctx.device.create_upload_buffer(
            &format!("{}_instances", self.label),
            bytemuck::cast_slice(descs),
        )?;

        let build = BuildDesc {
            inputs: BuildInputs::TopLevel {
                instance_count,
                instance_descs: ctx.device.buffer_address(instances),
            },
            scratch: ctx.device.buffer_address(scratch),
            dest: ctx.device.buffer_address(result),
        };

        let resources = Resources {
            result,
            scratch: Some(scratch),
            instances,
            instance_count: descs.len(),
        };

        Ok((resources, build))
    }

    fn upload_tables<D>(&self, ctx: &mut GpuContext<D>, prepared: &Prepared) -> Result<GeometryTable>
    where
        D: Device,
    {
        let buffer = ctx
            .device
            .create_upload_buffer(&format!("{}_geometry", self.label), &prepared.rows)?;

        let hit_groups = match ctx.device.create_upload_buffer(
            &format!("{}_hit_groups", self.label),
            bytemuck::cast_slice(&prepared.hit_groups),
        ) {
            Ok(hit_groups) => hit_groups,
            Err(err) => {
                ctx.device.release_buffer(buffer);
                return Err(err);
            }
        };

        Ok(GeometryTable {
            buffer,
            hit_groups,
            rows: prepared.rows.len() / self.layout.stride(),
        })
    }

    fn replace(
        &mut self,
        after: FenceValue,
        resources: Resources,
        previous_table: Option<GeometryTable>,
    ) {
        let mut buffers = Vec::new();

        if let Some(previous) = self.resources.replace(resources) {
            buffers.extend(resource_buffers(&previous));
        }

        if let Some(table) = previous_table {
            buffers.extend([table.buffer, table.hit_groups]);
        }

        if !buffers.is_empty() {
            self.retired.push(Retired { after, buffers });
        }
    }

    fn finish(&mut self, scene: &mut Scene, prepared: Prepared) {
        for &id in &prepared.live {
            if let Some(instance) = scene.instance_mut(id) {
                instance.clear_dirty();
            }
        }

        self.built = prepared.live;
        self.hit_group_indices = prepared.hit_groups;
    }

    fn release_retired<D>(&mut self, device: &mut D)
    where
        D: Device + ?Sized,
    {
        let mut kept = Vec::new();

        for retired in std::mem::take(&mut self.retired) {
            if device.is_fence_complete(retired.after) {
                for buffer in retired.buffers {
                    device.release_buffer(buffer);
                }
            } else {
                kept.push(retired);
            }
        }

        self.retired = kept;
    }
}

fn resource_buffers(resources: &Resources) -> impl Iterator<Item = BufferId> {
    [Some(resources.result), resources.scratch, Some(resources.instances)]
        .into_iter()
        .flatten()
}

#[cfg(test)]
mod tests {
    use std::mem;

    use glam::{Vec3, Vec4};
    use memoffset::offset_of;

    use super::*;
    use crate::blas::{Aabb, AabbEntry, Mesh, ProceduralPrimitive};
    use crate::device::headless::HeadlessDevice;
    use crate::geometry::GeometryBuffer;
    use crate::scene::{AssetRef, MeshId};

    fn setup() -> (GpuContext<HeadlessDevice>, Scene, MeshId) {
        let mut ctx = GpuContext::new(HeadlessDevice::new());
        let mut scene = Scene::new();
        let mut geometry = GeometryBuffer::new("triangle");

        geometry
            .set_positions(&mut ctx, &[Vec3::X, Vec3::Y, Vec3::Z])
            .unwrap();
        geometry.set_normals(&mut ctx, &[Vec3::Z; 3]).unwrap();
        geometry.set_indices(&mut ctx, &[0u16, 1, 2]).unwrap();

        let mesh = scene.add_mesh(Mesh::new(geometry));

        scene.build_blases(&mut ctx).unwrap();

        (ctx, scene, mesh)
    }

    #[test]
    fn wire_layouts() {
        assert_eq!(64, mem::size_of::<InstanceDesc>());
        assert_eq!(48, offset_of!(InstanceDesc, instance_id_and_mask));
        assert_eq!(52, offset_of!(InstanceDesc, contribution_and_flags));
        assert_eq!(56, offset_of!(InstanceDesc, acceleration_structure));

        assert_eq!(28, mem::size_of::<GeometryRecord>());
        assert_eq!(16, offset_of!(GeometryRecord, index_buffer));
        assert_eq!(24, offset_of!(GeometryRecord, uv0_buffer));

        assert_eq!(32, mem::size_of::<ReflectiveGeometryRecord>());
        assert_eq!(16, offset_of!(ReflectiveGeometryRecord, reflectance));
        assert_eq!(20, offset_of!(ReflectiveGeometryRecord, index_buffer));

        assert_eq!(28, RecordLayout::Tinted.stride());
        assert_eq!(32, RecordLayout::Reflective.stride());
    }

    #[test]
    fn descriptor_bits() {
        let desc = InstanceDesc::new(Default::default(), 0x1000);

        assert_eq!(0, desc.instance_id());
        assert_eq!(1, desc.mask());
        assert_eq!(0, desc.hit_group_contribution());
        assert_eq!(0, desc.contribution_and_flags >> 24);
    }

    #[test]
    fn empty_structure_is_rejected() {
        let (mut ctx, mut scene, _) = setup();
        let mut tlas = TopLevelStructure::new("TLAS", RecordLayout::Tinted);
        let allocations = ctx.device.allocations();

        assert!(matches!(
            tlas.build(&mut ctx, &mut scene),
            Err(Error::Contract(ContractViolation::NoInstances))
        ));
        assert_eq!(allocations, ctx.device.allocations());
    }

    #[test]
    fn blocking_build_writes_rows_with_sentinels() {
        let (mut ctx, mut scene, mesh) = setup();
        let mut tlas = TopLevelStructure::new("TLAS", RecordLayout::Reflective);

        let id = scene.add_instance(
            GeometryInstance::new(AssetRef::Mesh(mesh))
                .with_color(Vec4::new(0.5, 1.0, 0.5, 1.0))
                .with_reflectance(0.25),
        );

        tlas.add_instance(&mut scene, id);
        tlas.build(&mut ctx, &mut scene).unwrap();

        assert!(!scene.instance(id).unwrap().is_dirty());
        assert_eq!(1, tlas.instance_count());
        assert_eq!(1, tlas.geometry_table_rows());

        let rows: &[ReflectiveGeometryRecord] = bytemuck::cast_slice(
            ctx.device
                .buffer_data(tlas.geometry_table_buffer().unwrap())
                .unwrap(),
        );

        let slots = scene.mesh(mesh).unwrap().geometry().attribute_slots();

        assert_eq!([0.5, 1.0, 0.5, 1.0], rows[0].color);
        assert_eq!(0.25, rows[0].reflectance);
        assert_eq!(slots.index.unwrap(), rows[0].index_buffer);
        assert_eq!(slots.normal.unwrap(), rows[0].normal_buffer);
        assert_eq!(ABSENT, rows[0].uv0_buffer);
    }

    #[test]
    fn deferred_build_records_into_callers_list() {
        let (mut ctx, mut scene, mesh) = setup();
        let mut tlas = TopLevelStructure::new("TLAS", RecordLayout::Tinted);

        let id = scene.add_instance(GeometryInstance::new(AssetRef::Mesh(mesh)));

        tlas.add_instance(&mut scene, id);
        tlas.build(&mut ctx, &mut scene).unwrap();

        let table = tlas.geometry_table_buffer();
        let first = tlas.buffer().unwrap();
        let submissions = ctx.device.submissions().len();
        let list = ctx.device.create_command_list().unwrap();

        // Nothing moved
        assert!(!tlas.build_deferred(&mut ctx, &mut scene, list).unwrap());
        assert!(ctx.device.commands(list).is_empty());

        scene
            .instance_mut(id)
            .unwrap()
            .set_translation(Vec3::new(0.0, 0.0, 2.0));

        assert!(tlas.build_deferred(&mut ctx, &mut scene, list).unwrap());

        let commands = ctx.device.commands(list);

        assert_eq!(2, commands.len());
        assert!(commands[0].is_acceleration_structure_build());
        assert_eq!(Command::UavBarrier(tlas.buffer().unwrap()), commands[1]);

        // No submission of its own, and the attribute table is untouched
        assert_eq!(submissions, ctx.device.submissions().len());
        assert_eq!(table, tlas.geometry_table_buffer());
        assert!(!scene.instance(id).unwrap().is_dirty());

        // The replaced structure survives until the earlier work retires
        assert!(ctx.device.buffer(first).is_some());

        let fence = ctx.device.submit(&[list]).unwrap();
        ctx.device.wait_for_fence(fence).unwrap();
        ctx.device.reset_command_list(list).unwrap();

        assert!(!tlas.build_deferred(&mut ctx, &mut scene, list).unwrap());
        assert!(ctx.device.buffer(first).is_none());
    }

    fn rows(ctx: &GpuContext<HeadlessDevice>, tlas: &TopLevelStructure) -> Vec<GeometryRecord> {
        let data = ctx
            .device
            .buffer_data(tlas.geometry_table_buffer().unwrap())
            .unwrap();

        data.chunks_exact(RecordLayout::Tinted.stride())
            .map(bytemuck::pod_read_unaligned)
            .collect()
    }

    fn descs(ctx: &GpuContext<HeadlessDevice>, tlas: &TopLevelStructure) -> Vec<InstanceDesc> {
        let data = ctx
            .device
            .buffer_data(tlas.instance_buffer().unwrap())
            .unwrap();

        data.chunks_exact(mem::size_of::<InstanceDesc>())
            .map(bytemuck::pod_read_unaligned)
            .collect()
    }

    #[test]
    fn deferred_rebuild_after_removal_rewrites_rows() {
        let (mut ctx, mut scene, mesh) = setup();
        let mut tlas = TopLevelStructure::new("TLAS", RecordLayout::Tinted);

        let colored = |x: f32, color: Vec4| {
            GeometryInstance::new(AssetRef::Mesh(mesh))
                .with_translation(Vec3::new(x, 0.0, 0.0))
                .with_color(color)
        };

        let a = scene.add_instance(colored(0.0, Vec4::new(1.0, 0.0, 0.0, 1.0)));
        let b = scene.add_instance(colored(1.0, Vec4::new(0.0, 1.0, 0.0, 1.0)));
        let c = scene.add_instance(colored(2.0, Vec4::new(0.0, 0.0, 1.0, 1.0)));

        for id in [a, b, c] {
            tlas.add_instance(&mut scene, id);
        }

        tlas.build(&mut ctx, &mut scene).unwrap();

        let old_table = tlas.geometry_table_buffer();

        scene.remove_instance(b);

        let list = ctx.device.create_command_list().unwrap();

        assert!(tlas.build_deferred(&mut ctx, &mut scene, list).unwrap());

        let descs = descs(&ctx, &tlas);
        let rows = rows(&ctx, &tlas);

        assert_ne!(old_table, tlas.geometry_table_buffer());
        assert_eq!(2, tlas.instance_count());
        assert_eq!(descs.len(), rows.len());
        assert_eq!(tlas.instance_count(), tlas.geometry_table_rows());

        assert_eq!(0.0, descs[0].transform[0][3]);
        assert_eq!([1.0, 0.0, 0.0, 1.0], rows[0].color);
        assert_eq!(2.0, descs[1].transform[0][3]);
        assert_eq!([0.0, 0.0, 1.0, 1.0], rows[1].color);

        // The old table stays readable until the recorded frame retires
        assert!(ctx.device.buffer(old_table.unwrap()).is_some());

        assert_eq!(1, tlas.compact(&scene));
        assert_eq!(&[a, c], tlas.instances());

        // Compaction does not change the live set
        let fence = ctx.device.submit(&[list]).unwrap();
        ctx.device.wait_for_fence(fence).unwrap();
        ctx.device.reset_command_list(list).unwrap();

        assert!(!tlas.build_deferred(&mut ctx, &mut scene, list).unwrap());
        assert!(ctx.device.buffer(old_table.unwrap()).is_none());
    }

    #[test]
    fn swapping_an_instance_rewrites_rows() {
        let (mut ctx, mut scene, mesh) = setup();
        let mut tlas = TopLevelStructure::new("TLAS", RecordLayout::Tinted);

        let a = scene.add_instance(GeometryInstance::new(AssetRef::Mesh(mesh)));
        tlas.add_instance(&mut scene, a);
        tlas.build(&mut ctx, &mut scene).unwrap();

        scene.remove_instance(a);
        tlas.compact(&scene);

        let b = scene.add_instance(
            GeometryInstance::new(AssetRef::Mesh(mesh)).with_color(Vec4::new(0.0, 1.0, 0.0, 1.0)),
        );
        tlas.add_instance(&mut scene, b);
        scene.instance_mut(b).unwrap().clear_dirty();

        let list = ctx.device.create_command_list().unwrap();

        // Same instance count, different live set
        assert!(tlas.build_deferred(&mut ctx, &mut scene, list).unwrap());
        assert_eq!([0.0, 1.0, 0.0, 1.0], rows(&ctx, &tlas)[0].color);
    }

    #[test]
    fn hit_groups_travel_in_a_side_table() {
        let (mut ctx, mut scene, mesh) = setup();
        let mut tlas = TopLevelStructure::new("TLAS", RecordLayout::Tinted);

        let mut primitive = ProceduralPrimitive::new("box");
        primitive.add_entry(AabbEntry::new(
            Aabb::new(Vec3::ZERO, Vec3::ONE),
            Vec3::splat(0.5),
        ));
        primitive.set_hit_group_index(2);

        let primitive = scene.add_procedural(primitive);

        scene.build_blases(&mut ctx).unwrap();

        for asset in [AssetRef::Mesh(mesh), AssetRef::Procedural(primitive)] {
            let id = scene.add_instance(GeometryInstance::new(asset));
            tlas.add_instance(&mut scene, id);
        }

        tlas.build(&mut ctx, &mut scene).unwrap();

        assert!(descs(&ctx, &tlas)
            .iter()
            .all(|desc| desc.hit_group_contribution() == 0));

        let side: &[u32] = bytemuck::cast_slice(
            ctx.device
                .buffer_data(tlas.hit_group_table_buffer().unwrap())
                .unwrap(),
        );

        assert_eq!(&[0, 2], side);
        assert_eq!(side, tlas.hit_group_indices());
        assert_eq!(2, tlas.geometry_table_rows());
    }

    #[test]
    fn failed_blocking_build_leaves_no_buffers_behind() {
        let (mut ctx, mut scene, mesh) = setup();
        let mut tlas = TopLevelStructure::new("TLAS", RecordLayout::Tinted);

        let id = scene.add_instance(GeometryInstance::new(AssetRef::Mesh(mesh)));
        tlas.add_instance(&mut scene, id);

        let live = ctx.device.live_buffers().count();

        ctx.device.fail_submissions(true);

        assert!(matches!(
            tlas.build(&mut ctx, &mut scene),
            Err(Error::Submission(_))
        ));
        assert_eq!(live, ctx.device.live_buffers().count());
        assert!(tlas.buffer().is_none());
        assert!(scene.instance(id).unwrap().is_dirty());

        ctx.device.fail_submissions(false);

        tlas.build(&mut ctx, &mut scene).unwrap();

        assert_eq!(1, tlas.instance_count());
    }

    #[test]
    fn unbuilt_blas_fails_before_allocation() {
        let (mut ctx, mut scene, _) = setup();
        let unbuilt = scene.add_mesh(Mesh::new(GeometryBuffer::new("unbuilt")));
        let mut tlas = TopLevelStructure::new("TLAS", RecordLayout::Tinted);

        let id = scene.add_instance(GeometryInstance::new(AssetRef::Mesh(unbuilt)));
        tlas.add_instance(&mut scene, id);

        let allocations = ctx.device.allocations();

        assert!(matches!(
            tlas.build(&mut ctx, &mut scene),
            Err(Error::Contract(
                ContractViolation::AccelerationStructureNotBuilt
            ))
        ));
        assert_eq!(allocations, ctx.device.allocations());
    }
}
