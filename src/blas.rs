//! Bottom-level acceleration structures over triangles or AABBs.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

use crate::context::GpuContext;
use crate::device::{
    submit_blocking, BufferId, BuildDesc, BuildInputs, Command, Device, GeometryDesc,
    GeometryFlags, GpuAddress, ResourceState,
};
use crate::geometry::{GeometryBuffer, POSITION_STRIDE};
use crate::{ContractViolation, Error, Result};

/// Axis-aligned box in the native `{min_x, min_y, min_z, max_x, max_y, max_z}`
/// layout.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Aabb {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl Aabb {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self {
            min: min.to_array(),
            max: max.to_array(),
        }
    }
}

/// One procedural primitive: its bounds plus a position the intersection
/// shader reads back from the same buffer.
#[repr(C, align(8))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct AabbEntry {
    pub aabb: Aabb,
    pub position: [f32; 3],
    pub padding: f32,
}

impl AabbEntry {
    pub fn new(aabb: Aabb, position: Vec3) -> Self {
        Self {
            aabb,
            position: position.to_array(),
            padding: 0.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlasKind {
    Triangles,
    Procedural,
}

/// Built, GPU-resident bottom-level structure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BottomLevelStructure {
    buffer: BufferId,
    address: GpuAddress,
    size: u64,
    kind: BlasKind,
}

impl BottomLevelStructure {
    /// Builds over the indexed triangles of `geometry` and waits for the GPU.
    pub fn build_triangles<D>(
        ctx: &mut GpuContext<D>,
        geometry: &GeometryBuffer,
        flags: GeometryFlags,
    ) -> Result<Self>
    where
        D: Device,
    {
        let indices = geometry.indices().ok_or(ContractViolation::MissingIndices)?;
        let positions = geometry
            .positions()
            .ok_or(ContractViolation::MissingPositions)?;

        if positions.count < 3 {
            return Err(ContractViolation::TooFewVertices(positions.count).into());
        }

        let desc = GeometryDesc::Triangles {
            vertex_buffer: ctx.device.buffer_address(positions.buffer),
            vertex_count: positions.count as u32,
            vertex_stride: POSITION_STRIDE,
            index_buffer: ctx.device.buffer_address(indices.stream.buffer),
            index_count: indices.stream.count as u32,
            index_format: indices.format,
            flags,
        };

        Self::build(ctx, geometry.label(), desc, BlasKind::Triangles)
    }

    fn build<D>(
        ctx: &mut GpuContext<D>,
        label: &str,
        geometry: GeometryDesc,
        kind: BlasKind,
    ) -> Result<Self>
    where
        D: Device,
    {
        let inputs = BuildInputs::BottomLevel(geometry);
        let info = ctx.device.prebuild_info(&inputs);

        if info.result_size == 0 {
            return Err(Error::EmptyPrebuild("BottomLevelAccelerationStructure"));
        }

        let scratch = ctx.device.create_uav_buffer(
            "ScratchResource",
            info.scratch_size,
            ResourceState::UnorderedAccess,
        )?;

        let buffer = ctx.device.create_uav_buffer(
            &format!("{label}_blas"),
            info.result_size,
            ResourceState::AccelerationStructure,
        )?;

        let address = ctx.device.buffer_address(buffer);

        let build = BuildDesc {
            inputs,
            scratch: ctx.device.buffer_address(scratch),
            dest: address,
        };

        let waited = submit_blocking(
            &mut ctx.device,
            [Command::BuildAccelerationStructure(build)],
        );

        ctx.device.release_buffer(scratch);
        waited?;

        log::info!(
            "Built BLAS `{label}`; kind={kind:?}, size={}, scratch={}",
            info.result_size,
            info.scratch_size,
        );

        Ok(Self {
            buffer,
            address,
            size: info.result_size,
            kind,
        })
    }

    pub fn address(&self) -> GpuAddress {
        self.address
    }

    pub fn buffer(&self) -> BufferId {
        self.buffer
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn kind(&self) -> BlasKind {
        self.kind
    }
}

/// Triangle mesh asset: geometry plus the structure built over it.
#[derive(Debug)]
pub struct Mesh {
    geometry: GeometryBuffer,
    flags: GeometryFlags,
    blas: Option<BottomLevelStructure>,
}

impl Mesh {
    pub fn new(geometry: GeometryBuffer) -> Self {
        Self {
            geometry,
            flags: GeometryFlags::NONE,
            blas: None,
        }
    }

    pub fn set_flags(&mut self, flags: GeometryFlags) {
        self.flags = flags;
    }

    pub fn geometry(&self) -> &GeometryBuffer {
        &self.geometry
    }

    pub fn geometry_mut(&mut self) -> &mut GeometryBuffer {
        &mut self.geometry
    }

    pub fn blas(&self) -> Option<&BottomLevelStructure> {
        self.blas.as_ref()
    }

    /// Builds the BLAS once; later calls keep the existing structure.
    pub fn build_blas<D>(&mut self, ctx: &mut GpuContext<D>) -> Result<BottomLevelStructure>
    where
        D: Device,
    {
        if let Some(blas) = self.blas {
            log::warn!(
                "BLAS of `{}` is already built; rebuilding is not supported",
                self.geometry.label()
            );

            return Ok(blas);
        }

        let blas = BottomLevelStructure::build_triangles(ctx, &self.geometry, self.flags)?;

        Ok(*self.blas.insert(blas))
    }
}

/// AABB-based asset intersected by a custom shader.
#[derive(Debug)]
pub struct ProceduralPrimitive {
    label: String,
    entries: Vec<AabbEntry>,
    flags: GeometryFlags,
    hit_group_index: u32,
    aabbs: Option<BufferId>,
    blas: Option<BottomLevelStructure>,
}

impl ProceduralPrimitive {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            entries: Vec::new(),
            flags: GeometryFlags::NONE,
            hit_group_index: 0,
            aabbs: None,
            blas: None,
        }
    }

    pub fn add_entry(&mut self, entry: AabbEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[AabbEntry] {
        &self.entries
    }

    pub fn set_flags(&mut self, flags: GeometryFlags) {
        self.flags = flags;
    }

    /// Index into the pipeline's hit-group table meant for this primitive.
    /// Scene metadata only; it is not written into any acceleration
    /// structure and reaches the shaders through the TLAS hit-group table.
    pub fn set_hit_group_index(&mut self, index: u32) {
        self.hit_group_index = index;
    }

    pub fn hit_group_index(&self) -> u32 {
        self.hit_group_index
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn blas(&self) -> Option<&BottomLevelStructure> {
        self.blas.as_ref()
    }

    pub fn aabb_buffer(&self) -> Option<BufferId> {
        self.aabbs
    }

    pub fn build_blas<D>(&mut self, ctx: &mut GpuContext<D>) -> Result<BottomLevelStructure>
    where
        D: Device,
    {
        if self.entries.is_empty() {
            return Err(ContractViolation::EmptyProceduralEntries.into());
        }

        if let Some(blas) = self.blas {
            log::warn!(
                "BLAS of `{}` is already built; rebuilding is not supported",
                self.label
            );

            return Ok(blas);
        }

        let aabbs = ctx.device.create_upload_buffer(
            &format!("{}_aabbs", self.label),
            bytemuck::cast_slice(&self.entries),
        )?;

        self.aabbs = Some(aabbs);

        let desc = GeometryDesc::Aabbs {
            buffer: ctx.device.buffer_address(aabbs),
            count: self.entries.len() as u64,
            stride: std::mem::size_of::<AabbEntry>() as u64,
            flags: self.flags,
        };

        let blas = BottomLevelStructure::build(ctx, &self.label, desc, BlasKind::Procedural)?;

        Ok(*self.blas.insert(blas))
    }
}
